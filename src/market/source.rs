//! Upstream market-data collaborator interface — out of scope per the
//! design; this crate only depends on the trait boundary below.

use crate::models::TradeDate;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy)]
pub struct Bar {
    pub close: f64,
    pub volume: f64,
    pub change_pct: f64,
}

#[derive(Debug, Clone)]
pub struct StockBasic {
    pub code: String,
    pub name: String,
    pub is_st: bool,
    pub is_delisted: bool,
}

#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn daily_bar(&self, code: &str, date: TradeDate) -> Result<Option<Bar>>;
    async fn trade_calendar(&self, start: TradeDate, end: TradeDate) -> Result<Vec<TradeDate>>;
    async fn stock_basic(&self, code: &str) -> Result<Option<StockBasic>>;
    /// The full tradable universe, used for the preload hot∩whitelist build
    /// and the linear fallback walk.
    async fn whitelist(&self) -> Result<Vec<String>>;
}

/// Deterministic in-memory fixture, for tests and for running the arena with
/// no real upstream wired in.
pub struct StubMarketDataSource {
    bars: std::collections::HashMap<(String, TradeDate), Bar>,
    basics: std::collections::HashMap<String, StockBasic>,
    calendar: Vec<TradeDate>,
}

impl StubMarketDataSource {
    pub fn new(calendar: Vec<TradeDate>) -> Self {
        Self {
            bars: std::collections::HashMap::new(),
            basics: std::collections::HashMap::new(),
            calendar,
        }
    }

    pub fn with_bar(mut self, code: &str, date: TradeDate, bar: Bar) -> Self {
        self.bars.insert((code.to_string(), date), bar);
        self
    }

    pub fn with_basic(mut self, basic: StockBasic) -> Self {
        self.basics.insert(basic.code.clone(), basic);
        self
    }
}

#[async_trait]
impl MarketDataSource for StubMarketDataSource {
    async fn daily_bar(&self, code: &str, date: TradeDate) -> Result<Option<Bar>> {
        Ok(self.bars.get(&(code.to_string(), date)).copied())
    }

    async fn trade_calendar(&self, start: TradeDate, end: TradeDate) -> Result<Vec<TradeDate>> {
        Ok(self
            .calendar
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect())
    }

    async fn stock_basic(&self, code: &str) -> Result<Option<StockBasic>> {
        Ok(self.basics.get(code).cloned())
    }

    async fn whitelist(&self) -> Result<Vec<String>> {
        Ok(self.basics.keys().cloned().collect())
    }
}
