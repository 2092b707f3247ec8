//! Arena configuration: TOML file + environment overrides.
//!
//! Loading follows the same shape as a typical `*Config::from_env` found
//! elsewhere in this codebase: start from `Default`, overlay a TOML file if
//! present, then let individual environment variables win.

use crate::models::TradeDate;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub name: String,
    pub provider: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_color() -> String {
    "#4f46e5".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,

    #[serde(default = "default_start_date")]
    pub start_date: String,
    #[serde(default = "default_end_date")]
    pub end_date: String,

    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_stop_profit_pct")]
    pub stop_profit_pct: f64,

    #[serde(default = "default_max_holdings")]
    pub max_holdings: usize,
    #[serde(default = "default_max_price")]
    pub max_price: f64,
    #[serde(default = "default_analyze_stock_count")]
    pub analyze_stock_count: usize,
    #[serde(default = "default_min_cash_to_buy")]
    pub min_cash_to_buy: f64,
    #[serde(default = "default_confidence_threshold")]
    pub ai_confidence_threshold: f64,

    #[serde(default = "default_true")]
    pub enable_reflection: bool,
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval: u32,

    #[serde(default)]
    pub models: Vec<ModelConfig>,

    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

fn default_initial_capital() -> f64 {
    100_000.0
}
fn default_start_date() -> String {
    "20240101".to_string()
}
fn default_end_date() -> String {
    "20241231".to_string()
}
fn default_stop_loss_pct() -> f64 {
    0.08
}
fn default_stop_profit_pct() -> f64 {
    0.20
}
fn default_max_holdings() -> usize {
    5
}
fn default_max_price() -> f64 {
    200.0
}
fn default_analyze_stock_count() -> usize {
    20
}
fn default_min_cash_to_buy() -> f64 {
    1_000.0
}
fn default_confidence_threshold() -> f64 {
    0.6
}
fn default_reflection_interval() -> u32 {
    5
}
fn default_db_path() -> String {
    "arena.db".to_string()
}
fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            start_date: default_start_date(),
            end_date: default_end_date(),
            stop_loss_pct: default_stop_loss_pct(),
            stop_profit_pct: default_stop_profit_pct(),
            max_holdings: default_max_holdings(),
            max_price: default_max_price(),
            analyze_stock_count: default_analyze_stock_count(),
            min_cash_to_buy: default_min_cash_to_buy(),
            ai_confidence_threshold: default_confidence_threshold(),
            enable_reflection: true,
            reflection_interval: default_reflection_interval(),
            models: Vec::new(),
            db_path: default_db_path(),
            http_addr: default_http_addr(),
        }
    }
}

impl ArenaConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading config file {}", path.as_ref().display()))?;
        let config: Self = toml::from_str(&contents).context("parsing arena config toml")?;
        Ok(config)
    }

    /// Load from `ARENA_CONFIG_PATH` (default `arena_config.toml`), falling
    /// back to defaults if the file is missing, then apply env overrides.
    pub fn from_env() -> Self {
        let path = env::var("ARENA_CONFIG_PATH").unwrap_or_else(|_| "arena_config.toml".into());

        let mut cfg = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("using default arena config ({}): {}", path, e);
            Self::default()
        });

        if let Ok(v) = env::var("ARENA_INITIAL_CAPITAL") {
            if let Ok(v) = v.parse() {
                cfg.initial_capital = v;
            }
        }
        if let Ok(v) = env::var("ARENA_START_DATE") {
            cfg.start_date = v;
        }
        if let Ok(v) = env::var("ARENA_END_DATE") {
            cfg.end_date = v;
        }
        if let Ok(v) = env::var("ARENA_DB_PATH") {
            cfg.db_path = v;
        }
        if let Ok(v) = env::var("ARENA_HTTP_ADDR") {
            cfg.http_addr = v;
        }

        cfg
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("serializing arena config")?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn start_trade_date(&self) -> Result<TradeDate> {
        TradeDate::parse(&self.start_date)
            .with_context(|| format!("invalid start_date: {}", self.start_date))
    }

    pub fn end_trade_date(&self) -> Result<TradeDate> {
        TradeDate::parse(&self.end_date)
            .with_context(|| format!("invalid end_date: {}", self.end_date))
    }

    /// Startup-fatal validation (spec.md §7: "Fatal configuration or DB").
    pub fn validate(&self) -> Result<()> {
        let start = self.start_trade_date()?;
        let end = self.end_trade_date()?;
        if start > end {
            anyhow::bail!("start_date {} is after end_date {}", start, end);
        }
        if self.initial_capital <= 0.0 {
            anyhow::bail!("initial_capital must be positive");
        }
        if !(0.0..=1.0).contains(&self.stop_loss_pct) {
            anyhow::bail!("stop_loss_pct must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.ai_confidence_threshold) {
            anyhow::bail!("ai_confidence_threshold must be in [0, 1]");
        }
        if self.max_holdings == 0 {
            anyhow::bail!("max_holdings must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = ArenaConfig::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = ArenaConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ArenaConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.initial_capital, cfg.initial_capital);
    }

    #[test]
    fn test_rejects_inverted_dates() {
        let mut cfg = ArenaConfig::default();
        cfg.start_date = "20241231".to_string();
        cfg.end_date = "20240101".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_accepts_dashed_date_format() {
        let cfg = ArenaConfig {
            start_date: "2024-01-01".to_string(),
            ..ArenaConfig::default()
        };
        assert_eq!(cfg.start_trade_date().unwrap().as_yyyymmdd(), "20240101");
    }
}
