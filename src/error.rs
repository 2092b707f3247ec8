//! Error types for the arena core.
//!
//! Most call sites propagate `anyhow::Result` with `.context(...)`, matching
//! the rest of the crate. The two enums below exist because callers branch on
//! the specific variant rather than just logging the message.

use thiserror::Error;

pub use anyhow::{Context, Result};

/// Violations of the invariants in `portfolio::PortfolioBook`.
#[derive(Debug, Error)]
pub enum PortfolioError {
    #[error("cash went negative: {0}")]
    NegativeCash(f64),

    #[error("invalid holding for {code}: amount={amount} cost={cost}")]
    InvalidHolding {
        code: String,
        amount: i64,
        cost: f64,
    },

    #[error("daily asset point for {date} duplicates or precedes an existing entry")]
    DuplicateDailyAssetDate { date: crate::models::TradeDate },

    #[error("trade date {date} is outside the session range [{start}, {current}]")]
    TradeDateOutOfRange {
        date: crate::models::TradeDate,
        start: crate::models::TradeDate,
        current: crate::models::TradeDate,
    },
}

/// Errors raised while resuming or rolling back a session.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no session found to resume")]
    NoSessionToResume,

    #[error("rollback target date {0} precedes session start {1}")]
    RollbackBeforeStart(crate::models::TradeDate, crate::models::TradeDate),

    #[error("database error during recovery: {0}")]
    Db(#[from] rusqlite::Error),
}
