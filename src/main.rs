//! Arena binary: loads config, opens the database, resumes or starts a
//! session, then runs the HTTP surface and the scheduler side by side.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use trading_arena::agent::AgentIdentity;
use trading_arena::api::{self, AppState};
use trading_arena::config::ArenaConfig;
use trading_arena::llm::{LlmClient, OpenRouterLikeClient, ScriptedLlmClient};
use trading_arena::market::source::{MarketDataSource, StubMarketDataSource};
use trading_arena::market::MarketDataProvider;
use trading_arena::news::{NewsSource, StubNewsSource};
use trading_arena::persistence::Db;
use trading_arena::portfolio::PortfolioBook;
use trading_arena::recovery;
use trading_arena::scheduler::{ArenaScheduler, ProgressUpdate};
use trading_arena::store::MemoryStore;
use trading_arena::telemetry;

/// Trading arena: runs a day-synchronized trading competition between
/// several LLM-backed agents.
#[derive(Parser, Debug)]
#[command(name = "arena")]
struct Cli {
    /// Path to the arena config TOML, overriding ARENA_CONFIG_PATH.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the scripted LLM client instead of a real OpenRouter-backed one.
    #[arg(long)]
    scripted_llm: bool,
}

fn load_env() {
    let _ = dotenv::dotenv();
}

fn build_llm_client(scripted: bool, http: reqwest::Client) -> Result<Arc<dyn LlmClient>> {
    if scripted {
        return Ok(Arc::new(ScriptedLlmClient::new(Vec::new())));
    }
    let client = OpenRouterLikeClient::from_env(http).context("building LLM client")?;
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    telemetry::init_tracing();

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        std::env::set_var("ARENA_CONFIG_PATH", path);
    }

    let config = ArenaConfig::from_env();
    config.validate().context("invalid arena config")?;
    let config = Arc::new(config);

    let db = Arc::new(Db::open(&config.db_path).context("opening arena db")?);
    let store = Arc::new(MemoryStore::new());
    let stop_requested = Arc::new(AtomicBool::new(false));
    let active_session_id = Arc::new(parking_lot::RwLock::new(None));

    let start = config.start_trade_date()?;
    let end = config.end_trade_date()?;

    let calendar_source: Arc<dyn MarketDataSource> =
        Arc::new(StubMarketDataSource::new(Vec::new()));
    let news_source: Arc<dyn NewsSource> = Arc::new(StubNewsSource);
    let market = Arc::new(MarketDataProvider::new(
        calendar_source,
        news_source.clone(),
        config.max_price,
    ));

    let agent_names: Vec<String> = config
        .models
        .iter()
        .filter(|m| m.enabled)
        .map(|m| m.name.clone())
        .collect();

    let resumed = recovery::find_session_to_resume(&db, &agent_names).await?;
    let (session_id, resume_from, mut agents) = match resumed {
        Some(session) => {
            tracing::info!(session_id = %session.id, "resuming session");
            let mut agents = Vec::new();
            // Never trust session.current_date: it's a coarse progress marker
            // that can lag the actual per-agent daily asset log (or, for a
            // forced-stopped Completed session, never moved at all). Each
            // agent's own replayed history is the ground truth for where it
            // actually needs to restart.
            let mut safe_resume = end;
            for (offset, model) in config.models.iter().filter(|m| m.enabled).enumerate() {
                let identity = AgentIdentity {
                    name: model.name.clone(),
                    model_id: model.id.clone(),
                    model_offset: offset as i64,
                };
                let recovered = recovery::resume_agent(
                    &db,
                    &session.id,
                    identity,
                    session.start_date,
                    session.initial_capital,
                    &market,
                )
                .await?;
                let agent_cutoff = recovered
                    .rolled_back_to
                    .or_else(|| recovered.book.daily_assets.last().map(|p| p.date));
                let agent_resume = agent_cutoff.map(|d| d.succ()).unwrap_or(session.start_date);
                safe_resume = safe_resume.min(agent_resume);
                agents.push((recovered.identity, recovered.book));
            }
            // Resume every agent from the earliest date any of them still
            // needs to replay, keeping the per-date barrier synchronized.
            let resume_from = safe_resume.max(session.start_date);
            (session.id, resume_from, agents)
        }
        None => {
            let session_id = uuid::Uuid::new_v4().to_string();
            db.create_session(&session_id, start, end, config.initial_capital, now_unix())
                .await?;
            let agents = config
                .models
                .iter()
                .filter(|m| m.enabled)
                .enumerate()
                .map(|(offset, model)| {
                    let identity = AgentIdentity {
                        name: model.name.clone(),
                        model_id: model.id.clone(),
                        model_offset: offset as i64,
                    };
                    (identity, PortfolioBook::new(config.initial_capital, start))
                })
                .collect();
            (session_id, start, agents)
        }
    };
    *active_session_id.write() = Some(session_id.clone());

    if agents.is_empty() {
        tracing::warn!("no enabled models configured; arena has nothing to run");
    }

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()
        .context("building reqwest client")?;
    let llm = build_llm_client(cli.scripted_llm, http_client)?;

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        store: store.clone(),
        stop_requested: stop_requested.clone(),
        active_session_id: active_session_id.clone(),
    };
    let app = api::router(state);

    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("binding http listener on {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "arena http surface listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "http server exited with error");
        }
    });

    let scheduler = ArenaScheduler::new(
        (*config).clone(),
        market,
        news_source,
        llm,
        db.clone(),
        store.clone(),
    );

    let should_stop = {
        let flag = stop_requested.clone();
        Arc::new(move || flag.load(Ordering::SeqCst)) as Arc<dyn Fn() -> bool + Send + Sync>
    };

    let results = scheduler
        .run_arena(&session_id, resume_from, end, std::mem::take(&mut agents), should_stop, |update: ProgressUpdate| {
            tracing::info!(
                day = update.current_day,
                total = update.total_days,
                date = %update.date,
                "arena progress"
            );
        })
        .await?;

    let final_status = if stop_requested.load(Ordering::SeqCst) {
        trading_arena::models::SessionStatus::Aborted
    } else {
        trading_arena::models::SessionStatus::Completed
    };
    db.update_session_progress(&session_id, end, final_status, now_unix()).await?;

    for (name, result) in &results {
        tracing::info!(
            agent = name,
            cash = result.final_cash,
            total_assets = result.final_total_assets,
            trades = result.trade_count,
            "final result"
        );
    }

    server.abort();
    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
