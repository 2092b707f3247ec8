//! HTTP handlers: read-only views over `MemoryStore`/`Db`, plus the small
//! set of control actions (load a session, reset, request shutdown).

use super::AppState;
use crate::models::Session;
use crate::scheduler::{max_drawdown_of, RankingEntry};
use crate::store::{AgentSnapshot, ProgressSnapshot};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use std::sync::atomic::Ordering;

pub async fn get_config(State(state): State<AppState>) -> Json<crate::config::ArenaConfig> {
    Json((*state.config).clone())
}

pub async fn get_data(State(state): State<AppState>) -> Json<Vec<AgentSnapshot>> {
    Json(state.store.all_agents())
}

fn rankings_from_snapshots(agents: &[AgentSnapshot], initial_capital: f64) -> Vec<RankingEntry> {
    let mut entries: Vec<(String, f64, f64, f64)> = agents
        .iter()
        .map(|a| {
            let profit_pct = if initial_capital > 0.0 {
                (a.total_assets - initial_capital) / initial_capital * 100.0
            } else {
                0.0
            };
            let drawdown = max_drawdown_of(&a.daily_assets);
            (a.agent_name.clone(), a.total_assets, profit_pct, drawdown)
        })
        .collect();
    entries.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
    });
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (agent_name, total_assets, profit_pct, max_drawdown))| RankingEntry {
            agent_name,
            total_assets,
            profit_pct,
            max_drawdown,
            rank: i + 1,
        })
        .collect()
}

pub async fn get_rankings(State(state): State<AppState>) -> Json<Vec<RankingEntry>> {
    let agents = state.store.all_agents();
    Json(rankings_from_snapshots(&agents, state.config.initial_capital))
}

pub async fn get_progress(State(state): State<AppState>) -> Json<ProgressSnapshot> {
    Json(state.store.progress())
}

pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, StatusCode> {
    state
        .db
        .list_sessions()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn latest_session(State(state): State<AppState>) -> Result<Json<Option<Session>>, StatusCode> {
    state
        .db
        .latest_session()
        .await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, StatusCode> {
    match state.db.session(&id).await {
        Ok(Some(s)) => Ok(Json(s)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Marks `id` as the session subsequent reads/scheduling should target.
/// Does not itself replay state into the scheduler; that happens the next
/// time the scheduler starts up and calls `recovery::resume_agent` against
/// this session id.
pub async fn load_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    match state.db.session(&id).await {
        Ok(Some(_)) => {
            *state.active_session_id.write() = Some(id);
            Ok(StatusCode::OK)
        }
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Serialize)]
pub struct ResetResponse {
    pub cleared: bool,
}

pub async fn reset(State(state): State<AppState>) -> Json<ResetResponse> {
    state.store.clear();
    *state.active_session_id.write() = None;
    Json(ResetResponse { cleared: true })
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub stopping: bool,
}

pub async fn shutdown(State(state): State<AppState>) -> Json<ShutdownResponse> {
    state.stop_requested.store(true, Ordering::SeqCst);
    Json(ShutdownResponse { stopping: true })
}
