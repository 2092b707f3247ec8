//! Session resume, corruption detection, and rollback.
//!
//! The trade log is the ground truth here, not the holdings table: resuming
//! an agent means replaying its trades from the session start up to the
//! last consistent daily asset point, never trusting the last-written
//! holdings snapshot on its own.

use crate::agent::AgentIdentity;
use crate::error::RecoveryError;
use crate::market::MarketDataProvider;
use crate::models::{DailyAssetPoint, ExitPlan, Session, SessionStatus, TradeAction, TradeDate};
use crate::persistence::Db;
use crate::portfolio::PortfolioBook;
use anyhow::Result;

/// A daily-asset point's local sanity window: day-over-day total_assets
/// change must stay within this fraction of the prior value for a 1-day
/// gap, scaled up by 10% per extra calendar day for wider gaps.
const SINGLE_DAY_BOUND: f64 = 0.12;
const PER_DAY_BOUND: f64 = 0.10;
const CONSISTENCY_TOLERANCE: f64 = 0.05;
const GAP_WARN_DAYS: i64 = 3;

pub struct RecoveredAgent {
    pub identity: AgentIdentity,
    pub book: PortfolioBook,
    /// `Some(date)` if a corrupt tail was found and trimmed back to `date`.
    pub rolled_back_to: Option<TradeDate>,
}

/// True if any agent's recorded history stops before `session.end_date`,
/// meaning the arena was force-stopped before finishing its calendar even
/// though the session row itself made it to `Completed`.
async fn stopped_early(db: &Db, session: &Session, agent_names: &[String]) -> Result<bool> {
    for name in agent_names {
        let points = db.daily_assets(&session.id, name).await?;
        if let Some(last) = points.last() {
            if last.date < session.end_date {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Picks the session to resume, most recent first: `Running` (killed
/// mid-arena), `Aborted` (explicit `/shutdown` request, which leaves the
/// same kind of incomplete calendar a kill does and so is resumed the same
/// way), or the latest `Completed` session whose actual logged history
/// stops short of its `end_date` (forced stop that still got persisted as
/// completed). A `Completed` session that ran its full calendar is never
/// resumed; start a new one instead.
pub async fn find_session_to_resume(db: &Db, agent_names: &[String]) -> Result<Option<Session>> {
    let sessions = db.list_sessions().await?;
    for session in sessions {
        let resumable = match session.status {
            SessionStatus::Running | SessionStatus::Aborted => true,
            SessionStatus::Completed => stopped_early(db, &session, agent_names).await?,
        };
        if resumable {
            return Ok(Some(session));
        }
    }
    Ok(None)
}

fn log_gaps(agent_name: &str, points: &[DailyAssetPoint]) {
    for pair in points.windows(2) {
        let gap = pair[1].date.days_since(&pair[0].date);
        if gap > GAP_WARN_DAYS {
            tracing::warn!(
                agent = agent_name,
                from = %pair[0].date,
                to = %pair[1].date,
                gap_days = gap,
                "daily asset gap wider than 3 calendar days"
            );
        }
    }
}

/// Returns the index of the last point such that `points[..=index]` is
/// internally consistent (strictly increasing dates, non-negative assets,
/// cash+holdings_value within 5% of total_assets, and bounded day-over-day
/// swings). `None` means even the first point fails.
fn find_consistent_prefix_end(points: &[DailyAssetPoint]) -> Option<usize> {
    let mut last_good = None;
    let mut prev: Option<&DailyAssetPoint> = None;

    for (i, p) in points.iter().enumerate() {
        if p.total_assets < 0.0 {
            break;
        }
        let consistency_gap = (p.cash + p.holdings_value - p.total_assets).abs();
        if consistency_gap > CONSISTENCY_TOLERANCE * p.total_assets.max(1.0) {
            break;
        }
        if let Some(prev_point) = prev {
            if p.date <= prev_point.date {
                break;
            }
            let gap_days = p.date.days_since(&prev_point.date).max(1);
            if gap_days > GAP_WARN_DAYS {
                break;
            }
            let bound = if gap_days <= 1 {
                SINGLE_DAY_BOUND
            } else {
                PER_DAY_BOUND * gap_days as f64
            };
            if prev_point.total_assets > 0.0 {
                let change = (p.total_assets - prev_point.total_assets).abs() / prev_point.total_assets;
                if change > bound {
                    break;
                }
            }
        }
        last_good = Some(i);
        prev = Some(p);
    }
    last_good
}

/// Rebuilds `book` by replaying every trade up to and including
/// `surviving_points.last()`'s date, then re-inserting the stored daily
/// asset curve for those same dates verbatim. Surviving holdings end up
/// priced at their fill price from replay, so the last step refreshes
/// `current_price` to the close on the cutoff date.
async fn replay_trades_and_history(
    db: &Db,
    session_id: &str,
    agent_name: &str,
    book: &mut PortfolioBook,
    surviving_points: &[DailyAssetPoint],
    market: &MarketDataProvider,
) -> Result<()> {
    let cutoff = surviving_points.last().map(|p| p.date);
    let trades = db.trades(session_id, agent_name).await?;

    for t in &trades {
        if let Some(c) = cutoff {
            if t.date > c {
                continue;
            }
        }
        match t.action {
            TradeAction::Buy => {
                book.apply_buy(t.date, &t.time, &t.code, &t.name, t.amount, t.price, &t.reason, ExitPlan::default())?;
            }
            TradeAction::Sell => {
                book.apply_sell(t.date, &t.time, &t.code, t.amount, t.price, &t.reason)?;
            }
        }
    }

    if let Some(c) = cutoff {
        let codes: Vec<String> = book.holdings.keys().cloned().collect();
        for code in codes {
            if let Some(bar) = market.daily_bar(&code, c).await.ok().flatten() {
                if bar.close > 0.0 {
                    book.holdings.get_mut(&code).expect("iterating known keys").current_price = bar.close;
                }
            }
        }
    }

    for p in surviving_points {
        book.record_continuity_point(p.date, p.total_assets, p.cash, p.holdings_value)?;
    }
    Ok(())
}

/// Resumes one agent's portfolio for a session that's being continued.
/// Finds the longest consistent prefix of its daily asset curve, trims any
/// corrupt tail from storage, and rebuilds the in-memory book from the
/// surviving trade log. Falls back to a full reset to `initial_capital`
/// only when no prefix at all survives.
pub async fn resume_agent(
    db: &Db,
    session_id: &str,
    identity: AgentIdentity,
    session_start: TradeDate,
    initial_capital: f64,
    market: &MarketDataProvider,
) -> Result<RecoveredAgent> {
    let daily_assets = db.daily_assets(session_id, &identity.name).await?;
    log_gaps(&identity.name, &daily_assets);

    let mut book = PortfolioBook::new(initial_capital, session_start);

    if daily_assets.is_empty() {
        return Ok(RecoveredAgent {
            identity,
            book,
            rolled_back_to: None,
        });
    }

    let consistent_end = find_consistent_prefix_end(&daily_assets);

    let rolled_back_to = match consistent_end {
        None => {
            tracing::warn!(
                agent = %identity.name,
                "no consistent daily asset prefix survived, resetting to initial capital"
            );
            db.delete_from_date(session_id, &identity.name, session_start).await?;
            None
        }
        Some(idx) if idx + 1 == daily_assets.len() => {
            replay_trades_and_history(db, session_id, &identity.name, &mut book, &daily_assets[..=idx], market)
                .await?;
            None
        }
        Some(idx) => {
            let cutoff = daily_assets[idx].date;
            tracing::warn!(
                agent = %identity.name,
                %cutoff,
                "rolling back to the last consistent daily asset point"
            );
            db.delete_from_date(session_id, &identity.name, cutoff.succ()).await?;
            replay_trades_and_history(db, session_id, &identity.name, &mut book, &daily_assets[..=idx], market)
                .await?;
            Some(cutoff)
        }
    };

    Ok(RecoveredAgent {
        identity,
        book,
        rolled_back_to,
    })
}

/// Explicit rollback to a caller-chosen date (as opposed to the automatic
/// corruption-driven rollback in `resume_agent`). Used by the `/reset`-style
/// API surface.
pub async fn rollback_to_date(
    db: &Db,
    session_id: &str,
    identity: &AgentIdentity,
    session_start: TradeDate,
    initial_capital: f64,
    target: TradeDate,
    market: &MarketDataProvider,
) -> Result<PortfolioBook> {
    if target < session_start {
        return Err(RecoveryError::RollbackBeforeStart(target, session_start).into());
    }

    db.delete_from_date(session_id, &identity.name, target.succ()).await?;
    let daily_assets = db.daily_assets(session_id, &identity.name).await?;

    let mut book = PortfolioBook::new(initial_capital, session_start);
    replay_trades_and_history(db, session_id, &identity.name, &mut book, &daily_assets, market).await?;
    Ok(book)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::StubMarketDataSource;
    use crate::models::{Trade, TradeAction};
    use crate::news::StubNewsSource;
    use std::sync::Arc;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    fn tmp_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.db");
        (Db::open(path.to_str().unwrap()).unwrap(), dir)
    }

    fn point(date_str: &str, total: f64) -> DailyAssetPoint {
        DailyAssetPoint {
            date: date(date_str),
            total_assets: total,
            cash: total,
            holdings_value: 0.0,
        }
    }

    fn stub_market() -> MarketDataProvider {
        MarketDataProvider::new(Arc::new(StubMarketDataSource::new(Vec::new())), Arc::new(StubNewsSource), 200.0)
    }

    #[test]
    fn consistent_history_keeps_everything() {
        let points = vec![point("20250106", 100000.0), point("20250107", 101000.0), point("20250108", 102000.0)];
        assert_eq!(find_consistent_prefix_end(&points), Some(2));
    }

    #[test]
    fn implausible_jump_truncates_prefix() {
        let points = vec![point("20250106", 100000.0), point("20250107", 500000.0)];
        assert_eq!(find_consistent_prefix_end(&points), Some(0));
    }

    #[test]
    fn inconsistent_cash_plus_holdings_is_rejected_even_as_first_point() {
        let bad = DailyAssetPoint {
            date: date("20250106"),
            total_assets: 100000.0,
            cash: 10.0,
            holdings_value: 10.0,
        };
        assert_eq!(find_consistent_prefix_end(&[bad]), None);
    }

    #[test]
    fn wide_gap_truncates_regardless_of_plausible_change() {
        // 10 calendar days apart, only a 5% asset change: well within
        // PER_DAY_BOUND's widened tolerance, but the gap itself must still
        // force a rollback.
        let points = vec![point("20250106", 100000.0), point("20250116", 105000.0)];
        assert_eq!(find_consistent_prefix_end(&points), Some(0));
    }

    #[tokio::test]
    async fn resume_replays_trades_up_to_consistent_cutoff() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 10000.0, 1)
            .await
            .unwrap();

        db.append_trade(
            "s1",
            "agent_a",
            &Trade {
                date: date("20250106"),
                time: "09:30".into(),
                action: TradeAction::Buy,
                code: "000001.SZ".into(),
                name: "x".into(),
                amount: 200,
                price: 10.0,
                total: 2000.0,
                commission: 5.0,
                stamp_tax: 0.0,
                profit: None,
                profit_pct: None,
                reason: "buy".into(),
                cash_before: 10000.0,
                assets_before: Some(10000.0),
            },
        )
        .await
        .unwrap();

        db.upsert_daily_asset("s1", "agent_a", &point("20250106", 9995.0)).await.unwrap();
        db.upsert_daily_asset("s1", "agent_a", &point("20250107", 500000.0)).await.unwrap(); // corrupt tail

        let identity = AgentIdentity {
            name: "agent_a".into(),
            model_id: "m".into(),
            model_offset: 0,
        };
        let market = stub_market();
        let recovered = resume_agent(&db, "s1", identity, date("20250106"), 10000.0, &market)
            .await
            .unwrap();

        assert_eq!(recovered.rolled_back_to, Some(date("20250106")));
        assert_eq!(recovered.book.daily_assets.len(), 1);
        assert!(recovered.book.holdings.contains_key("000001.SZ"));

        let remaining = db.daily_assets("s1", "agent_a").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn rollback_before_start_is_rejected() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 10000.0, 1)
            .await
            .unwrap();
        let identity = AgentIdentity {
            name: "agent_a".into(),
            model_id: "m".into(),
            model_offset: 0,
        };
        let market = stub_market();
        let result =
            rollback_to_date(&db, "s1", &identity, date("20250106"), 10000.0, date("20250101"), &market).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn completed_session_with_early_stop_is_resumable() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20250110"), 10000.0, 1)
            .await
            .unwrap();
        // Log stops at 20250107, well short of the session's 20250110 end_date.
        db.upsert_daily_asset("s1", "agent_a", &point("20250107", 10100.0)).await.unwrap();
        db.update_session_progress("s1", date("20250107"), SessionStatus::Completed, 2)
            .await
            .unwrap();

        let agent_names = vec!["agent_a".to_string()];
        let found = find_session_to_resume(&db, &agent_names).await.unwrap();
        assert!(found.is_some(), "a completed session with an early-stopped log should be resumable");
    }

    #[tokio::test]
    async fn completed_session_that_ran_its_full_calendar_is_not_resumed() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20250107"), 10000.0, 1)
            .await
            .unwrap();
        db.upsert_daily_asset("s1", "agent_a", &point("20250106", 10000.0)).await.unwrap();
        db.upsert_daily_asset("s1", "agent_a", &point("20250107", 10100.0)).await.unwrap();
        db.update_session_progress("s1", date("20250107"), SessionStatus::Completed, 2)
            .await
            .unwrap();

        let agent_names = vec!["agent_a".to_string()];
        let found = find_session_to_resume(&db, &agent_names).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn current_price_is_refreshed_to_cutoff_close_after_replay() {
        let (db, _dir) = tmp_db();
        let d0 = date("20250106");
        db.create_session("s1", d0, date("20251231"), 10000.0, 1).await.unwrap();

        db.append_trade(
            "s1",
            "agent_a",
            &Trade {
                date: d0,
                time: "09:30".into(),
                action: TradeAction::Buy,
                code: "000001.SZ".into(),
                name: "x".into(),
                amount: 200,
                price: 10.0,
                total: 2000.0,
                commission: 5.0,
                stamp_tax: 0.0,
                profit: None,
                profit_pct: None,
                reason: "buy".into(),
                cash_before: 10000.0,
                assets_before: Some(10000.0),
            },
        )
        .await
        .unwrap();
        db.upsert_daily_asset("s1", "agent_a", &point("20250106", 9995.0)).await.unwrap();

        let source = StubMarketDataSource::new(vec![d0]).with_bar(
            "000001.SZ",
            d0,
            crate::market::Bar { close: 12.5, volume: 1000.0, change_pct: 0.0 },
        );
        let market = MarketDataProvider::new(Arc::new(source), Arc::new(StubNewsSource), 200.0);

        let identity = AgentIdentity { name: "agent_a".into(), model_id: "m".into(), model_offset: 0 };
        let recovered = resume_agent(&db, "s1", identity, d0, 10000.0, &market).await.unwrap();

        assert!(recovered.rolled_back_to.is_none());
        let holding = recovered.book.holdings.get("000001.SZ").expect("holding survives replay");
        assert_eq!(holding.cost, 10.0);
        assert_eq!(holding.current_price, 12.5);
    }
}
