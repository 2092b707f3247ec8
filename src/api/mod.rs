pub mod routes;

use crate::config::ArenaConfig;
use crate::persistence::Db;
use crate::store::MemoryStore;
use axum::routing::{get, post};
use axum::Router;
use std::sync::{atomic::AtomicBool, Arc};
use tower_http::cors::CorsLayer;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArenaConfig>,
    pub db: Arc<Db>,
    pub store: Arc<MemoryStore>,
    pub stop_requested: Arc<AtomicBool>,
    pub active_session_id: Arc<parking_lot::RwLock<Option<String>>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/config", get(routes::get_config))
        .route("/data", get(routes::get_data))
        .route("/rankings", get(routes::get_rankings))
        .route("/progress", get(routes::get_progress))
        .route("/sessions", get(routes::list_sessions))
        .route("/sessions/latest", get(routes::latest_session))
        .route("/sessions/:id", get(routes::get_session))
        .route("/sessions/:id/load", post(routes::load_session))
        .route("/reset", post(routes::reset))
        .route("/shutdown", post(routes::shutdown))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
