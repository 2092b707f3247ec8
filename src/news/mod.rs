//! News source collaborator interface.
//!
//! Out of scope per the design: the concrete upstream. This module only
//! defines the trait boundary the agent pipeline depends on, plus a stub
//! implementation for tests and for running the arena with no news feed
//! wired in.

use crate::models::{NewsItem, TradeDate};
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub enum NewsScope {
    Stock(String),
    Market,
}

/// Supplies a time-filtered (no-lookahead) stream of news items per trade
/// date. Implementations must never return items dated after `date`.
#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn news_for(&self, date: TradeDate, scope: NewsScope) -> Result<Vec<NewsItem>>;

    /// Hot codes/sectors used by the Market Data Provider's preload step.
    async fn hot_codes(&self, date: TradeDate, limit: usize) -> Result<Vec<String>>;
    async fn hot_sectors(&self, date: TradeDate, limit: usize) -> Result<Vec<crate::models::HotSector>>;
}

/// Returns nothing for every query. Used when no news integration is
/// configured, and in unit tests that don't exercise news-dependent logic.
pub struct StubNewsSource;

#[async_trait]
impl NewsSource for StubNewsSource {
    async fn news_for(&self, _date: TradeDate, _scope: NewsScope) -> Result<Vec<NewsItem>> {
        Ok(Vec::new())
    }

    async fn hot_codes(&self, _date: TradeDate, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn hot_sectors(
        &self,
        _date: TradeDate,
        _limit: usize,
    ) -> Result<Vec<crate::models::HotSector>> {
        Ok(Vec::new())
    }
}
