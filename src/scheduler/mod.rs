//! Arena scheduler: advances every agent through the trade calendar one date
//! at a time, fanning each date out to a `tokio::spawn` per agent and
//! enforcing a barrier (10 minute primary wait + 5 minute grace) before
//! moving to the next date. Grounded on the vault engine's `spawn` fan-out
//! (`vault/engine.rs`) and `original_source/agent_v2/arena_manager.py`'s
//! `run_arena` shape.

use crate::agent::{run_pipeline_for_date, AgentIdentity, PipelineDeps, PipelineOutcome};
use crate::config::ArenaConfig;
use crate::llm::LlmClient;
use crate::market::MarketDataProvider;
use crate::models::{ArenaStage, DailyAssetPoint, RankingContext, TradeDate};
use crate::news::NewsSource;
use crate::persistence::Db;
use crate::portfolio::PortfolioBook;
use crate::store::{AgentSnapshot, MemoryStore, ProgressSnapshot};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PRIMARY_TIMEOUT: Duration = Duration::from_secs(600);
const GRACE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, serde::Serialize)]
pub struct RankingEntry {
    pub agent_name: String,
    pub total_assets: f64,
    pub profit_pct: f64,
    pub max_drawdown: f64,
    pub rank: usize,
}

pub(crate) fn max_drawdown_of(points: &[DailyAssetPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    for p in points {
        peak = peak.max(p.total_assets);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - p.total_assets) / peak);
        }
    }
    max_dd
}

/// Ranks agents by profit_pct desc, ties broken by lower drawdown then by
/// arrival order in `agents` (stable sort).
pub fn compute_rankings(
    agents: &[(AgentIdentity, PortfolioBook)],
    initial_capital: f64,
) -> Vec<RankingEntry> {
    let mut entries: Vec<(String, f64, f64, f64)> = agents
        .iter()
        .map(|(identity, book)| {
            let total_assets = book.total_assets();
            let profit_pct = if initial_capital > 0.0 {
                (total_assets - initial_capital) / initial_capital * 100.0
            } else {
                0.0
            };
            let drawdown = max_drawdown_of(&book.daily_assets);
            (identity.name.clone(), total_assets, profit_pct, drawdown)
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

pub fn ranking_context_for_agent(
    rankings: &[RankingEntry],
    agent_name: &str,
    day_index: usize,
    total_days: usize,
) -> RankingContext {
    let leader = rankings.first().map(|r| r.agent_name.clone()).unwrap_or_default();
    let leader_total = rankings.first().map(|r| r.total_assets).unwrap_or(0.0);

    let me = rankings.iter().find(|r| r.agent_name == agent_name);
    let rank = me.map(|r| r.rank).unwrap_or(rankings.len().max(1));
    let my_total = me.map(|r| r.total_assets).unwrap_or(0.0);
    let gap_to_leader = if leader_total > 0.0 {
        (leader_total - my_total) / leader_total * 100.0
    } else {
        0.0
    };

    let stage = ArenaStage::for_progress(day_index, total_days);
    let comment = if rank == 1 {
        "currently leading the arena".to_string()
    } else {
        format!("{gap_to_leader:.2}% behind the leader")
    };
    let goal = match stage {
        ArenaStage::Early => "establish an edge without overreaching".to_string(),
        ArenaStage::Mid => "protect gains already made while staying selective".to_string(),
        ArenaStage::Final => "lock in returns, avoid late-stage risk".to_string(),
    };

    RankingContext {
        rank,
        leader,
        gap_to_leader,
        stage,
        comment,
        goal,
    }
}

fn medal(rank: usize) -> &'static str {
    match rank {
        1 => "\u{1F947}",
        2 => "\u{1F948}",
        3 => "\u{1F949}",
        _ => "  ",
    }
}

pub struct ProgressUpdate {
    pub current_day: usize,
    pub total_days: usize,
    pub date: TradeDate,
}

struct PendingAgent {
    name: String,
    identity_for_timeout: AgentIdentity,
    pre_day_book: PortfolioBook,
    handle: JoinHandle<(AgentIdentity, PortfolioBook, PipelineOutcome)>,
}

async fn wait_phase(
    mut pending: Vec<PendingAgent>,
    deadline: Instant,
) -> (
    Vec<(AgentIdentity, PortfolioBook, PipelineOutcome)>,
    Vec<PendingAgent>,
) {
    let mut done = Vec::new();
    while !pending.is_empty() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;
        let futs: Vec<_> = pending.iter_mut().map(|p| &mut p.handle).collect();
        match tokio::time::timeout(remaining, futures_util::future::select_all(futs)).await {
            Ok((result, index, _)) => {
                let agent = pending.remove(index);
                match result {
                    Ok(output) => done.push(output),
                    Err(join_err) => {
                        tracing::error!(agent = %agent.name, error = %join_err, "agent task panicked");
                    }
                }
            }
            Err(_) => break,
        }
    }
    (done, pending)
}

/// Waits on every spawned agent task with a 10 minute primary window and a
/// 5 minute grace window beyond it. Anything still outstanding after grace
/// is abandoned (`abort`ed) and reported back with its pre-day book, which
/// the caller uses to synthesize a continuity point so the asset curve
/// never gaps for a severely slow agent.
async fn wait_with_barrier(
    pending: Vec<PendingAgent>,
) -> (
    Vec<(AgentIdentity, PortfolioBook, PipelineOutcome)>,
    Vec<(AgentIdentity, PortfolioBook)>,
) {
    let primary_deadline = Instant::now() + PRIMARY_TIMEOUT;
    let (mut done, leftover) = wait_phase(pending, primary_deadline).await;
    if leftover.is_empty() {
        return (done, Vec::new());
    }

    tracing::warn!(outstanding = leftover.len(), "agents still running past primary barrier, entering grace window");
    let grace_deadline = Instant::now() + GRACE_TIMEOUT;
    let (more_done, still_leftover) = wait_phase(leftover, grace_deadline).await;
    done.extend(more_done);

    let timed_out = still_leftover
        .into_iter()
        .map(|p| {
            p.handle.abort();
            tracing::error!(agent = %p.name, "agent severely timed out; carrying forward pre-exec snapshot");
            (p.identity_for_timeout, p.pre_day_book)
        })
        .collect();

    (done, timed_out)
}

#[derive(Debug, Clone, Default)]
pub struct AgentRunResult {
    pub final_cash: f64,
    pub final_total_assets: f64,
    pub trade_count: usize,
}

pub struct ArenaScheduler {
    config: ArenaConfig,
    market: Arc<MarketDataProvider>,
    news: Arc<dyn NewsSource>,
    llm: Arc<dyn LlmClient>,
    db: Arc<Db>,
    store: Arc<MemoryStore>,
}

impl ArenaScheduler {
    pub fn new(
        config: ArenaConfig,
        market: Arc<MarketDataProvider>,
        news: Arc<dyn NewsSource>,
        llm: Arc<dyn LlmClient>,
        db: Arc<Db>,
        store: Arc<MemoryStore>,
    ) -> Self {
        Self {
            config,
            market,
            news,
            llm,
            db,
            store,
        }
    }

    async fn finish_agent_day(
        &self,
        session_id: &str,
        date: TradeDate,
        identity: &AgentIdentity,
        book: &PortfolioBook,
        outcome: &PipelineOutcome,
        now: i64,
    ) -> Result<()> {
        for trade in &outcome.trades {
            self.db.append_trade(session_id, &identity.name, trade).await?;
        }
        if let Some(point) = book.daily_assets.last() {
            self.db.upsert_daily_asset(session_id, &identity.name, point).await?;
        }
        self.db
            .upsert_model_state(session_id, &identity.name, book.cash, book.total_assets(), now)
            .await?;
        self.db
            .replace_holdings(session_id, &identity.name, book.holdings.values())
            .await?;
        if let (Some(r), Some(p)) = (&outcome.reflection, &outcome.principles) {
            self.db
                .insert_reflection_and_principles(session_id, &identity.name, r, p)
                .await?;
        }

        self.store.update_agent(AgentSnapshot {
            agent_name: identity.name.clone(),
            model_id: identity.model_id.clone(),
            cash: book.cash,
            total_assets: book.total_assets(),
            holdings: book.holdings.values().cloned().collect(),
            daily_assets: book.daily_assets.clone(),
            last_updated: Some(date),
            ranking: None,
        });
        Ok(())
    }

    fn log_same_day_ranking(&self, agents: &[(AgentIdentity, PortfolioBook)], date: TradeDate) {
        let rankings = compute_rankings(agents, self.config.initial_capital);
        for r in &rankings {
            tracing::info!(
                "{} {} {} total_assets={:.2} profit_pct={:.2}% drawdown={:.2}% date={}",
                medal(r.rank),
                r.rank,
                r.agent_name,
                r.total_assets,
                r.profit_pct,
                r.max_drawdown * 100.0,
                date
            );
        }
    }

    /// Runs every agent from `start` to `end`, persisting after every
    /// barrier and reporting progress via `on_progress`. `should_stop` is
    /// polled between barriers and passed through to each pipeline so a
    /// cancellation mid-day is cooperative rather than abrupt.
    pub async fn run_arena(
        &self,
        session_id: &str,
        start: TradeDate,
        end: TradeDate,
        mut agents: Vec<(AgentIdentity, PortfolioBook)>,
        should_stop: Arc<dyn Fn() -> bool + Send + Sync>,
        mut on_progress: impl FnMut(ProgressUpdate),
    ) -> Result<HashMap<String, AgentRunResult>> {
        let calendar = self.market.trade_calendar(start, end).await?;
        let total_days = calendar.len();

        for (day_index, &date) in calendar.iter().enumerate() {
            if should_stop() {
                tracing::info!(%date, "stop requested, halting before barrier");
                break;
            }

            if let Err(e) = self.market.preload(date).await {
                tracing::warn!(%date, error = %e, "market preload failed for this date");
            }

            let rankings = compute_rankings(&agents, self.config.initial_capital);

            let mut pending = Vec::new();
            for (identity, book) in agents.drain(..) {
                let market = self.market.clone();
                let news = self.news.clone();
                let llm = self.llm.clone();
                let config = self.config.clone();
                let ranking_ctx = ranking_context_for_agent(&rankings, &identity.name, day_index, total_days);
                let should_stop = should_stop.clone();
                let pre_day_book = book.clone();
                let name = identity.name.clone();
                let identity_for_timeout = identity.clone();

                let handle = tokio::spawn(async move {
                    let deps = PipelineDeps {
                        market: &market,
                        news: news.as_ref(),
                        llm: llm.as_ref(),
                        config: &config,
                    };
                    let mut book = book;
                    let outcome =
                        run_pipeline_for_date(&mut book, date, &identity, &deps, &ranking_ctx, &*should_stop).await;
                    (identity, book, outcome)
                });

                pending.push(PendingAgent {
                    name,
                    identity_for_timeout,
                    pre_day_book,
                    handle,
                });
            }

            let (completed, timed_out) = wait_with_barrier(pending).await;
            let now = now_unix();

            for (identity, book, outcome) in completed {
                if let Err(e) = self.finish_agent_day(session_id, date, &identity, &book, &outcome, now).await {
                    tracing::error!(agent = %identity.name, error = %e, "failed to persist agent day");
                }
                agents.push((identity, book));
            }
            for (identity, pre_day_book) in timed_out {
                let mut book = pre_day_book;
                let total = book.total_assets();
                let cash = book.cash;
                let hv = book.holdings_value();
                if book.record_continuity_point(date, total, cash, hv).is_ok() {
                    let outcome = PipelineOutcome {
                        failed: true,
                        error: Some("severe timeout".to_string()),
                        ..Default::default()
                    };
                    if let Err(e) = self.finish_agent_day(session_id, date, &identity, &book, &outcome, now).await {
                        tracing::error!(agent = %identity.name, error = %e, "failed to persist timed-out agent day");
                    }
                }
                agents.push((identity, book));
            }

            self.log_same_day_ranking(&agents, date);
            self.db
                .update_session_progress(session_id, date, crate::models::SessionStatus::Running, now)
                .await
                .ok();
            self.store.set_progress(ProgressSnapshot {
                current_day: day_index + 1,
                total_days,
                current_date: Some(date),
                is_running: true,
                message: format!("completed {date}"),
            });

            on_progress(ProgressUpdate {
                current_day: day_index + 1,
                total_days,
                date,
            });
        }

        let results = agents
            .iter()
            .map(|(identity, book)| {
                (
                    identity.name.clone(),
                    AgentRunResult {
                        final_cash: book.cash,
                        final_total_assets: book.total_assets(),
                        trade_count: book.trade_history.len(),
                    },
                )
            })
            .collect();

        self.store.set_progress(ProgressSnapshot {
            current_day: total_days,
            total_days,
            current_date: calendar.last().copied(),
            is_running: false,
            message: "arena finished".to_string(),
        });

        Ok(results)
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TradeDate;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    fn book_with_history(initial: f64, points: &[(TradeDate, f64)]) -> PortfolioBook {
        let mut book = PortfolioBook::new(initial, points[0].0);
        for &(d, total) in points {
            // Drain cash to exactly `total` so total_assets() == total with no holdings.
            book.cash = total;
            book.record_daily(d).unwrap();
        }
        book
    }

    #[test]
    fn rankings_sort_by_profit_desc_then_drawdown_asc() {
        let a = book_with_history(10000.0, &[(date("20250106"), 11000.0)]);
        let b = book_with_history(10000.0, &[(date("20250106"), 12000.0)]);
        let agents = vec![
            (
                AgentIdentity { name: "a".into(), model_id: "m".into(), model_offset: 0 },
                a,
            ),
            (
                AgentIdentity { name: "b".into(), model_id: "m".into(), model_offset: 0 },
                b,
            ),
        ];
        let rankings = compute_rankings(&agents, 10000.0);
        assert_eq!(rankings[0].agent_name, "b");
        assert_eq!(rankings[0].rank, 1);
        assert_eq!(rankings[1].agent_name, "a");
    }

    #[tokio::test]
    async fn wait_phase_leaves_slow_agents_pending_past_deadline() {
        let fast_identity = AgentIdentity { name: "fast".into(), model_id: "m".into(), model_offset: 0 };
        let slow_identity = AgentIdentity { name: "slow".into(), model_id: "m".into(), model_offset: 0 };
        let book = PortfolioBook::new(10000.0, date("20250106"));

        let fast_handle = tokio::spawn({
            let identity = fast_identity.clone();
            let book = book.clone();
            async move { (identity, book, PipelineOutcome::default()) }
        });
        let slow_handle = tokio::spawn({
            let identity = slow_identity.clone();
            let book = book.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                (identity, book, PipelineOutcome::default())
            }
        });

        let pending = vec![
            PendingAgent {
                name: "fast".into(),
                identity_for_timeout: fast_identity,
                pre_day_book: book.clone(),
                handle: fast_handle,
            },
            PendingAgent {
                name: "slow".into(),
                identity_for_timeout: slow_identity,
                pre_day_book: book.clone(),
                handle: slow_handle,
            },
        ];

        let deadline = Instant::now() + Duration::from_millis(50);
        let (done, still_pending) = wait_phase(pending, deadline).await;

        assert_eq!(done.len(), 1);
        assert_eq!(done[0].0.name, "fast");
        assert_eq!(still_pending.len(), 1);
        still_pending[0].handle.abort();
    }

    #[test]
    fn ranking_context_reports_gap_to_leader() {
        let rankings = vec![
            RankingEntry { agent_name: "b".into(), total_assets: 12000.0, profit_pct: 20.0, max_drawdown: 0.0, rank: 1 },
            RankingEntry { agent_name: "a".into(), total_assets: 11000.0, profit_pct: 10.0, max_drawdown: 0.0, rank: 2 },
        ];
        let ctx = ranking_context_for_agent(&rankings, "a", 0, 100);
        assert_eq!(ctx.rank, 2);
        assert_eq!(ctx.leader, "b");
        assert!((ctx.gap_to_leader - (1000.0 / 12000.0 * 100.0)).abs() < 1e-6);
        assert_eq!(ctx.stage, crate::models::ArenaStage::Early);
    }
}
