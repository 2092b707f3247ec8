//! SQLite-backed persistence: sessions, per-agent cash/holdings state, the
//! daily asset curve, the trade log, and reflections/principles.
//!
//! Mirrors the vault's `VaultDb` shape: an `Arc<Mutex<Connection>>`, WAL
//! mode, `CREATE TABLE IF NOT EXISTS` at open time, `prepare_cached` on the
//! hot paths, `ON CONFLICT DO UPDATE` for upsert tables.

use crate::models::{
    DailyAssetPoint, Holding, Principles, Reflection, SessionStatus, Trade, TradeAction, TradeDate,
};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const MAX_BACKUPS: usize = 10;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::backup_existing(db_path).ok();

        let conn = Connection::open(db_path).context("open arena db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                current_date TEXT NOT NULL,
                initial_capital REAL NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS model_state (
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                cash REAL NOT NULL,
                total_assets REAL NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, agent_name)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_assets (
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                date TEXT NOT NULL,
                total_assets REAL NOT NULL,
                cash REAL NOT NULL,
                holdings_value REAL NOT NULL,
                PRIMARY KEY (session_id, agent_name, date)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_daily_assets_order ON daily_assets(session_id, agent_name, date ASC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                date TEXT NOT NULL,
                time TEXT NOT NULL,
                action TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                amount INTEGER NOT NULL,
                price REAL NOT NULL,
                total REAL NOT NULL,
                commission REAL NOT NULL,
                stamp_tax REAL NOT NULL,
                profit REAL,
                profit_pct REAL,
                reason TEXT NOT NULL,
                cash_before REAL NOT NULL,
                assets_before REAL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_order ON trades(session_id, agent_name, date ASC, id ASC)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS holdings (
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                code TEXT NOT NULL,
                name TEXT NOT NULL,
                amount INTEGER NOT NULL,
                cost REAL NOT NULL,
                current_price REAL NOT NULL,
                hold_days INTEGER NOT NULL,
                buy_date TEXT NOT NULL,
                exit_plan TEXT NOT NULL,
                PRIMARY KEY (session_id, agent_name, code)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reflections (
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                date TEXT NOT NULL,
                summary TEXT NOT NULL,
                cash_reflection TEXT NOT NULL,
                timing_reflection TEXT NOT NULL,
                decision_reflection TEXT NOT NULL,
                strengths TEXT NOT NULL,
                weaknesses TEXT NOT NULL,
                adjustment_plan TEXT NOT NULL,
                PRIMARY KEY (session_id, agent_name, date)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS principles (
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                date TEXT NOT NULL,
                items TEXT NOT NULL,
                active INTEGER NOT NULL,
                PRIMARY KEY (session_id, agent_name, date)
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Copies the existing db file aside (timestamp suffix) before opening,
    /// keeping only the most recent `MAX_BACKUPS`.
    fn backup_existing(db_path: &str) -> Result<()> {
        let path = Path::new(db_path);
        if !path.exists() {
            return Ok(());
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let backup_path = PathBuf::from(format!("{db_path}.{now}.bak"));
        std::fs::copy(path, &backup_path).context("backing up arena db")?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let stem = path.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
        let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&stem) && n.ends_with(".bak"))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
        while backups.len() > MAX_BACKUPS {
            let oldest = backups.remove(0);
            std::fs::remove_file(oldest).ok();
        }
        Ok(())
    }

    pub async fn create_session(
        &self,
        id: &str,
        start_date: TradeDate,
        end_date: TradeDate,
        initial_capital: f64,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (id, start_date, end_date, current_date, initial_capital, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?2, ?4, 'Running', ?5, ?5)",
            params![id, start_date.as_yyyymmdd(), end_date.as_yyyymmdd(), initial_capital, now],
        )?;
        Ok(())
    }

    pub async fn update_session_progress(
        &self,
        id: &str,
        current_date: TradeDate,
        status: SessionStatus,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET current_date = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![current_date.as_yyyymmdd(), status_str(status), now, id],
        )?;
        Ok(())
    }

    pub async fn latest_session(&self) -> Result<Option<crate::models::Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start_date, end_date, current_date, initial_capital, status, created_at, updated_at
             FROM sessions ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_session(row)?))
    }

    pub async fn session(&self, id: &str) -> Result<Option<crate::models::Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start_date, end_date, current_date, initial_capital, status, created_at, updated_at
             FROM sessions WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_session(row)?))
    }

    pub async fn list_sessions(&self) -> Result<Vec<crate::models::Session>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, start_date, end_date, current_date, initial_capital, status, created_at, updated_at
             FROM sessions ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok(row_to_session(row)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    pub async fn upsert_model_state(
        &self,
        session_id: &str,
        agent_name: &str,
        cash: f64,
        total_assets: f64,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO model_state (session_id, agent_name, cash, total_assets, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id, agent_name) DO UPDATE SET
                cash = excluded.cash,
                total_assets = excluded.total_assets,
                updated_at = excluded.updated_at",
            params![session_id, agent_name, cash, total_assets, now],
        )?;
        Ok(())
    }

    pub async fn upsert_daily_asset(
        &self,
        session_id: &str,
        agent_name: &str,
        point: &DailyAssetPoint,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO daily_assets (session_id, agent_name, date, total_assets, cash, holdings_value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, agent_name, date) DO UPDATE SET
                total_assets = excluded.total_assets,
                cash = excluded.cash,
                holdings_value = excluded.holdings_value",
            params![
                session_id,
                agent_name,
                point.date.as_yyyymmdd(),
                point.total_assets,
                point.cash,
                point.holdings_value
            ],
        )?;
        Ok(())
    }

    pub async fn daily_assets(
        &self,
        session_id: &str,
        agent_name: &str,
    ) -> Result<Vec<DailyAssetPoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT date, total_assets, cash, holdings_value FROM daily_assets
             WHERE session_id = ?1 AND agent_name = ?2 ORDER BY date ASC",
        )?;
        let rows = stmt.query_map(params![session_id, agent_name], |row| {
            let date: String = row.get(0)?;
            Ok(DailyAssetPoint {
                date: TradeDate::parse(&date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
                total_assets: row.get(1)?,
                cash: row.get(2)?,
                holdings_value: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Append-only; trades are never updated or deleted except by a
    /// recovery rollback.
    pub async fn append_trade(&self, session_id: &str, agent_name: &str, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO trades (session_id, agent_name, date, time, action, code, name, amount, price, total,
                commission, stamp_tax, profit, profit_pct, reason, cash_before, assets_before)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                session_id,
                agent_name,
                trade.date.as_yyyymmdd(),
                trade.time,
                action_str(&trade.action),
                trade.code,
                trade.name,
                trade.amount,
                trade.price,
                trade.total,
                trade.commission,
                trade.stamp_tax,
                trade.profit,
                trade.profit_pct,
                trade.reason,
                trade.cash_before,
                trade.assets_before,
            ],
        )?;
        Ok(())
    }

    pub async fn trades(&self, session_id: &str, agent_name: &str) -> Result<Vec<Trade>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT date, time, action, code, name, amount, price, total, commission, stamp_tax,
                profit, profit_pct, reason, cash_before, assets_before
             FROM trades WHERE session_id = ?1 AND agent_name = ?2 ORDER BY date ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![session_id, agent_name], row_to_trade)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r??);
        }
        Ok(out)
    }

    /// Deletes trades and daily asset points at or after `date`, used by a
    /// rollback. Holdings/reflections for the rolled-back range are handled
    /// separately by the caller, which rebuilds them from the surviving log.
    pub async fn delete_from_date(&self, session_id: &str, agent_name: &str, date: TradeDate) -> Result<()> {
        let conn = self.conn.lock().await;
        let date_str = date.as_yyyymmdd();
        conn.execute(
            "DELETE FROM trades WHERE session_id = ?1 AND agent_name = ?2 AND date >= ?3",
            params![session_id, agent_name, date_str],
        )?;
        conn.execute(
            "DELETE FROM daily_assets WHERE session_id = ?1 AND agent_name = ?2 AND date >= ?3",
            params![session_id, agent_name, date_str],
        )?;
        conn.execute(
            "UPDATE principles SET active = 0 WHERE session_id = ?1 AND agent_name = ?2 AND date >= ?3",
            params![session_id, agent_name, date_str],
        )?;
        Ok(())
    }

    /// Fully replaces the holdings row set for one agent (cheap at this
    /// scale: at most `max_holdings` rows, rewritten every barrier).
    pub async fn replace_holdings<'a>(
        &self,
        session_id: &str,
        agent_name: &str,
        holdings: impl Iterator<Item = &'a Holding>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM holdings WHERE session_id = ?1 AND agent_name = ?2",
            params![session_id, agent_name],
        )?;
        for h in holdings {
            let exit_plan_json = serde_json::to_string(&h.exit_plan).unwrap_or_else(|_| "{}".to_string());
            tx.execute(
                "INSERT INTO holdings (session_id, agent_name, code, name, amount, cost, current_price, hold_days, buy_date, exit_plan)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    session_id,
                    agent_name,
                    h.code,
                    h.name,
                    h.amount,
                    h.cost,
                    h.current_price,
                    h.hold_days,
                    h.buy_date.as_yyyymmdd(),
                    exit_plan_json,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn holdings(&self, session_id: &str, agent_name: &str) -> Result<Vec<Holding>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT code, name, amount, cost, current_price, hold_days, buy_date, exit_plan
             FROM holdings WHERE session_id = ?1 AND agent_name = ?2",
        )?;
        let rows = stmt.query_map(params![session_id, agent_name], |row| {
            let buy_date: String = row.get(6)?;
            let exit_plan_json: String = row.get(7)?;
            Ok(Holding {
                code: row.get(0)?,
                name: row.get(1)?,
                amount: row.get(2)?,
                cost: row.get(3)?,
                current_price: row.get(4)?,
                hold_days: row.get(5)?,
                buy_date: TradeDate::parse(&buy_date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
                exit_plan: serde_json::from_str(&exit_plan_json).unwrap_or_default(),
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Deactivates any prior active principles for this agent and inserts
    /// the new reflection + principles pair atomically.
    pub async fn insert_reflection_and_principles(
        &self,
        session_id: &str,
        agent_name: &str,
        reflection: &Reflection,
        principles: &Principles,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO reflections (session_id, agent_name, date, summary, cash_reflection,
                timing_reflection, decision_reflection, strengths, weaknesses, adjustment_plan)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id, agent_name, date) DO UPDATE SET
                summary = excluded.summary,
                cash_reflection = excluded.cash_reflection,
                timing_reflection = excluded.timing_reflection,
                decision_reflection = excluded.decision_reflection,
                strengths = excluded.strengths,
                weaknesses = excluded.weaknesses,
                adjustment_plan = excluded.adjustment_plan",
            params![
                session_id,
                agent_name,
                reflection.date.as_yyyymmdd(),
                reflection.summary,
                reflection.cash_reflection,
                reflection.timing_reflection,
                reflection.decision_reflection,
                reflection.strengths,
                reflection.weaknesses,
                reflection.adjustment_plan,
            ],
        )?;
        tx.execute(
            "UPDATE principles SET active = 0 WHERE session_id = ?1 AND agent_name = ?2",
            params![session_id, agent_name],
        )?;
        let items_json = serde_json::to_string(&principles.items).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "INSERT INTO principles (session_id, agent_name, date, items, active)
             VALUES (?1, ?2, ?3, ?4, 1)
             ON CONFLICT(session_id, agent_name, date) DO UPDATE SET
                items = excluded.items,
                active = 1",
            params![session_id, agent_name, principles.date.as_yyyymmdd(), items_json],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn active_principles(&self, session_id: &str, agent_name: &str) -> Result<Option<Principles>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT date, items FROM principles
             WHERE session_id = ?1 AND agent_name = ?2 AND active = 1
             ORDER BY date DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![session_id, agent_name])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let date: String = row.get(0)?;
        let items_json: String = row.get(1)?;
        Ok(Some(Principles {
            date: TradeDate::parse(&date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
            items: serde_json::from_str(&items_json).unwrap_or_default(),
            active: true,
        }))
    }
}

fn status_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "Running",
        SessionStatus::Completed => "Completed",
        SessionStatus::Aborted => "Aborted",
    }
}

fn action_str(action: &TradeAction) -> &'static str {
    match action {
        TradeAction::Buy => "Buy",
        TradeAction::Sell => "Sell",
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<crate::models::Session> {
    let start_date: String = row.get(1)?;
    let end_date: String = row.get(2)?;
    let current_date: String = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(crate::models::Session {
        id: row.get(0)?,
        start_date: TradeDate::parse(&start_date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
        end_date: TradeDate::parse(&end_date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
        current_date: TradeDate::parse(&current_date).unwrap_or_else(|| TradeDate::from_ymd(1970, 1, 1).unwrap()),
        initial_capital: row.get(4)?,
        status: match status.as_str() {
            "Completed" => SessionStatus::Completed,
            "Aborted" => SessionStatus::Aborted,
            _ => SessionStatus::Running,
        },
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn row_to_trade(row: &rusqlite::Row) -> rusqlite::Result<Result<Trade>> {
    let date: String = row.get(0)?;
    let action: String = row.get(2)?;
    let Some(parsed_date) = TradeDate::parse(&date) else {
        return Ok(Err(anyhow::anyhow!("corrupt trade date: {date}")));
    };
    Ok(Ok(Trade {
        date: parsed_date,
        time: row.get(1)?,
        action: if action == "Buy" { TradeAction::Buy } else { TradeAction::Sell },
        code: row.get(3)?,
        name: row.get(4)?,
        amount: row.get(5)?,
        price: row.get(6)?,
        total: row.get(7)?,
        commission: row.get(8)?,
        stamp_tax: row.get(9)?,
        profit: row.get(10)?,
        profit_pct: row.get(11)?,
        reason: row.get(12)?,
        cash_before: row.get(13)?,
        assets_before: row.get(14)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitPlan;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    fn tmp_db() -> (Db, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.db");
        let db = Db::open(path.to_str().unwrap()).unwrap();
        (db, dir)
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 100000.0, 1)
            .await
            .unwrap();
        let s = db.latest_session().await.unwrap().unwrap();
        assert_eq!(s.id, "s1");
        assert_eq!(s.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn trade_log_is_append_only_and_ordered() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 100000.0, 1)
            .await
            .unwrap();
        let trade = Trade {
            date: date("20250106"),
            time: "09:30".into(),
            action: TradeAction::Buy,
            code: "000001.SZ".into(),
            name: "Ping An".into(),
            amount: 200,
            price: 10.0,
            total: 2000.0,
            commission: 5.0,
            stamp_tax: 0.0,
            profit: None,
            profit_pct: None,
            reason: "buy".into(),
            cash_before: 100000.0,
            assets_before: Some(100000.0),
        };
        db.append_trade("s1", "agent_a", &trade).await.unwrap();
        let trades = db.trades("s1", "agent_a").await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].code, "000001.SZ");
    }

    #[tokio::test]
    async fn holdings_are_fully_replaced() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 100000.0, 1)
            .await
            .unwrap();
        let h1 = Holding {
            code: "000001.SZ".into(),
            name: "x".into(),
            amount: 200,
            cost: 10.0,
            current_price: 11.0,
            hold_days: 1,
            buy_date: date("20250106"),
            exit_plan: ExitPlan::default(),
        };
        db.replace_holdings("s1", "agent_a", std::iter::once(&h1)).await.unwrap();
        assert_eq!(db.holdings("s1", "agent_a").await.unwrap().len(), 1);
        db.replace_holdings("s1", "agent_a", std::iter::empty()).await.unwrap();
        assert!(db.holdings("s1", "agent_a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_from_date_deactivates_later_principles() {
        let (db, _dir) = tmp_db();
        db.create_session("s1", date("20250106"), date("20251231"), 100000.0, 1)
            .await
            .unwrap();
        let reflection = Reflection {
            date: date("20250110"),
            model: "m".into(),
            summary: "s".into(),
            cash_reflection: "".into(),
            timing_reflection: "".into(),
            decision_reflection: "".into(),
            strengths: "".into(),
            weaknesses: "".into(),
            adjustment_plan: "".into(),
        };
        let principles = Principles {
            date: date("20250110"),
            items: vec!["be patient".into()],
            active: true,
        };
        db.insert_reflection_and_principles("s1", "agent_a", &reflection, &principles)
            .await
            .unwrap();
        db.delete_from_date("s1", "agent_a", date("20250108")).await.unwrap();
        assert!(db.active_principles("s1", "agent_a").await.unwrap().is_none());
    }
}
