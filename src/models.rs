//! Core entity types shared across the crate.
//!
//! Mirrors the data model section of the design: sessions own agents, agents
//! own one portfolio each, portfolios own holdings/trades/daily asset points.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A trade date, stored canonically as `YYYYMMDD`.
///
/// Accepts `YYYYMMDD` or `YYYY-MM-DD` on parse (compatibility reader); always
/// serializes/displays as `YYYYMMDD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TradeDate(NaiveDate);

impl TradeDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
            return Some(Self(d));
        }
        if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(Self(d));
        }
        None
    }

    pub fn inner(&self) -> NaiveDate {
        self.0
    }

    pub fn succ(&self) -> Self {
        Self(self.0.succ_opt().expect("trade date overflow"))
    }

    pub fn as_yyyymmdd(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    pub fn days_since(&self, other: &TradeDate) -> i64 {
        (self.0 - other.0).num_days()
    }
}

impl fmt::Display for TradeDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_yyyymmdd())
    }
}

impl TryFrom<String> for TradeDate {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        TradeDate::parse(&value).ok_or_else(|| format!("invalid trade date: {value}"))
    }
}

impl From<TradeDate> for String {
    fn from(value: TradeDate) -> Self {
        value.as_yyyymmdd()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_date: TradeDate,
    pub end_date: TradeDate,
    pub current_date: TradeDate,
    pub initial_capital: f64,
    pub status: SessionStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

/// The triple decided at buy time and evaluated on each subsequent day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitPlan {
    pub profit_target: Option<f64>,
    pub stop_loss: Option<f64>,
    pub invalidation: Option<String>,
    pub expected_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Holding {
    pub code: String,
    pub name: String,
    pub amount: i64,
    pub cost: f64,
    pub current_price: f64,
    pub hold_days: u32,
    pub buy_date: TradeDate,
    pub exit_plan: ExitPlan,
}

impl Holding {
    pub fn market_value(&self) -> f64 {
        self.amount as f64 * self.current_price
    }

    pub fn profit_pct(&self) -> f64 {
        if self.cost <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.cost) / self.cost * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub date: TradeDate,
    pub time: String,
    pub action: TradeAction,
    pub code: String,
    pub name: String,
    pub amount: i64,
    pub price: f64,
    pub total: f64,
    pub commission: f64,
    pub stamp_tax: f64,
    pub profit: Option<f64>,
    pub profit_pct: Option<f64>,
    pub reason: String,
    pub cash_before: f64,
    pub assets_before: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAssetPoint {
    pub date: TradeDate,
    pub total_assets: f64,
    pub cash: f64,
    pub holdings_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateStock {
    pub code: String,
    pub name: String,
    pub close: f64,
    pub change_pct: f64,
    pub volume: f64,
    pub is_hot: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateSource {
    Preload,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotSector {
    pub name: String,
    pub change_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePool {
    pub date: TradeDate,
    pub candidates: Vec<CandidateStock>,
    pub hot_codes: std::collections::HashSet<String>,
    pub hot_sectors: Vec<HotSector>,
    pub source: CandidateSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub date: TradeDate,
    pub model: String,
    pub summary: String,
    pub cash_reflection: String,
    pub timing_reflection: String,
    pub decision_reflection: String,
    pub strengths: String,
    pub weaknesses: String,
    pub adjustment_plan: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principles {
    pub date: TradeDate,
    pub items: Vec<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArenaStage {
    Early,
    Mid,
    Final,
}

impl ArenaStage {
    pub fn for_progress(day_index: usize, total_days: usize) -> Self {
        if total_days == 0 {
            return ArenaStage::Early;
        }
        let pct = day_index as f64 / total_days as f64;
        if pct < 0.30 {
            ArenaStage::Early
        } else if pct > 0.70 {
            ArenaStage::Final
        } else {
            ArenaStage::Mid
        }
    }
}

/// Per-agent prompt context built by the scheduler at each barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingContext {
    pub rank: usize,
    pub leader: String,
    pub gap_to_leader: f64,
    pub stage: ArenaStage,
    pub comment: String,
    pub goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsItem {
    pub date: TradeDate,
    pub code: Option<String>,
    pub headline: String,
    pub body: String,
}
