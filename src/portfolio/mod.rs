//! Per-agent portfolio bookkeeping: cash, holdings, trade history, and the
//! daily asset curve, with the invariants checked on every mutation.

use crate::error::PortfolioError;
use crate::models::{DailyAssetPoint, ExitPlan, Holding, Trade, TradeAction, TradeDate};
use std::collections::HashMap;

const COMMISSION_RATE: f64 = 0.0003;
const COMMISSION_MIN: f64 = 5.0;
const STAMP_TAX_RATE: f64 = 0.001;

fn commission_for(total: f64) -> f64 {
    (total * COMMISSION_RATE).max(COMMISSION_MIN)
}

/// A deep copy of the mutable parts of a portfolio, taken before a node runs
/// so it can be restored verbatim if that node fails.
#[derive(Debug, Clone)]
pub struct PortfolioSnapshot {
    cash: f64,
    holdings: HashMap<String, Holding>,
    trade_history: Vec<Trade>,
    daily_assets: Vec<DailyAssetPoint>,
}

#[derive(Debug, Clone)]
pub struct PortfolioBook {
    pub cash: f64,
    pub holdings: HashMap<String, Holding>,
    pub trade_history: Vec<Trade>,
    pub daily_assets: Vec<DailyAssetPoint>,
    session_start: TradeDate,
}

impl PortfolioBook {
    pub fn new(initial_capital: f64, session_start: TradeDate) -> Self {
        Self {
            cash: initial_capital,
            holdings: HashMap::new(),
            trade_history: Vec::new(),
            daily_assets: Vec::new(),
            session_start,
        }
    }

    pub fn holdings_value(&self) -> f64 {
        self.holdings.values().map(|h| h.market_value()).sum()
    }

    pub fn total_assets(&self) -> f64 {
        self.cash + self.holdings_value()
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        PortfolioSnapshot {
            cash: self.cash,
            holdings: self.holdings.clone(),
            trade_history: self.trade_history.clone(),
            daily_assets: self.daily_assets.clone(),
        }
    }

    pub fn restore(&mut self, snapshot: PortfolioSnapshot) {
        self.cash = snapshot.cash;
        self.holdings = snapshot.holdings;
        self.trade_history = snapshot.trade_history;
        self.daily_assets = snapshot.daily_assets;
    }

    pub fn check_invariants(&self, current_date: TradeDate) -> Result<(), PortfolioError> {
        if self.cash < 0.0 {
            return Err(PortfolioError::NegativeCash(self.cash));
        }
        for h in self.holdings.values() {
            if h.amount <= 0 || h.amount % 100 != 0 || h.cost <= 0.0 {
                return Err(PortfolioError::InvalidHolding {
                    code: h.code.clone(),
                    amount: h.amount,
                    cost: h.cost,
                });
            }
        }
        let mut prev: Option<TradeDate> = None;
        for point in &self.daily_assets {
            if let Some(p) = prev {
                if point.date <= p {
                    return Err(PortfolioError::DuplicateDailyAssetDate { date: point.date });
                }
            }
            prev = Some(point.date);
        }
        for t in &self.trade_history {
            if t.date < self.session_start || t.date > current_date {
                return Err(PortfolioError::TradeDateOutOfRange {
                    date: t.date,
                    start: self.session_start,
                    current: current_date,
                });
            }
        }
        Ok(())
    }

    /// Execute a buy. Caller (agent state machine) has already passed the
    /// hard risk gates; this only enforces the bookkeeping invariants.
    pub fn apply_buy(
        &mut self,
        date: TradeDate,
        time: &str,
        code: &str,
        name: &str,
        amount: i64,
        price: f64,
        reason: &str,
        exit_plan: ExitPlan,
    ) -> Result<Trade, PortfolioError> {
        let total = amount as f64 * price;
        let commission = commission_for(total);
        let cost_total = total + commission;

        let cash_before = self.cash;
        let assets_before = self.total_assets();

        let new_cash = self.cash - cost_total;

        match self.holdings.get_mut(code) {
            Some(existing) => {
                let existing_cost_pool = existing.cost * existing.amount as f64;
                let new_amount = existing.amount + amount;
                let new_cost = (existing_cost_pool + total) / new_amount as f64;
                existing.amount = new_amount;
                existing.cost = new_cost;
                existing.exit_plan = exit_plan;
            }
            None => {
                self.holdings.insert(
                    code.to_string(),
                    Holding {
                        code: code.to_string(),
                        name: name.to_string(),
                        amount,
                        cost: price,
                        current_price: price,
                        hold_days: 0,
                        buy_date: date,
                        exit_plan,
                    },
                );
            }
        }
        self.cash = new_cash;

        self.check_invariants(date)?;

        let trade = Trade {
            date,
            time: time.to_string(),
            action: TradeAction::Buy,
            code: code.to_string(),
            name: name.to_string(),
            amount,
            price,
            total,
            commission,
            stamp_tax: 0.0,
            profit: None,
            profit_pct: None,
            reason: reason.to_string(),
            cash_before,
            assets_before: Some(assets_before),
        };
        self.trade_history.push(trade.clone());
        Ok(trade)
    }

    /// Execute a sell. `amount` must not exceed the current holding size.
    pub fn apply_sell(
        &mut self,
        date: TradeDate,
        time: &str,
        code: &str,
        amount: i64,
        price: f64,
        reason: &str,
    ) -> Result<Trade, PortfolioError> {
        let cash_before = self.cash;

        let (name, cost) = {
            let holding = self
                .holdings
                .get(code)
                .expect("apply_sell called for a code with no holding");
            (holding.name.clone(), holding.cost)
        };

        let total = amount as f64 * price;
        let commission = commission_for(total);
        let stamp_tax = total * STAMP_TAX_RATE;
        let net_income = total - commission - stamp_tax;
        let cost_basis = cost * amount as f64;
        let profit = net_income - cost_basis;
        let profit_pct = if cost_basis > 0.0 {
            profit / cost_basis * 100.0
        } else {
            0.0
        };

        self.cash += net_income;

        let remaining = {
            let holding = self.holdings.get_mut(code).unwrap();
            holding.amount -= amount;
            holding.amount
        };
        if remaining <= 0 {
            self.holdings.remove(code);
        }

        self.check_invariants(date)?;

        let trade = Trade {
            date,
            time: time.to_string(),
            action: TradeAction::Sell,
            code: code.to_string(),
            name,
            amount,
            price,
            total,
            commission,
            stamp_tax,
            profit: Some(profit),
            profit_pct: Some(profit_pct),
            reason: reason.to_string(),
            cash_before,
            assets_before: None,
        };
        self.trade_history.push(trade.clone());
        Ok(trade)
    }

    /// Append one DailyAssetPoint for `date`. Fails if it would not be
    /// strictly increasing.
    pub fn record_daily(&mut self, date: TradeDate) -> Result<DailyAssetPoint, PortfolioError> {
        if let Some(last) = self.daily_assets.last() {
            if date <= last.date {
                return Err(PortfolioError::DuplicateDailyAssetDate { date });
            }
        }
        let point = DailyAssetPoint {
            date,
            total_assets: self.total_assets(),
            cash: self.cash,
            holdings_value: self.holdings_value(),
        };
        self.daily_assets.push(point.clone());
        Ok(point)
    }

    /// Append a continuity point carrying a pre-exec total_assets value,
    /// used when a node failed and the day must not leave a hole in the
    /// curve (spec: "continuity point").
    pub fn record_continuity_point(
        &mut self,
        date: TradeDate,
        total_assets: f64,
        cash: f64,
        holdings_value: f64,
    ) -> Result<DailyAssetPoint, PortfolioError> {
        if let Some(last) = self.daily_assets.last() {
            if date <= last.date {
                return Err(PortfolioError::DuplicateDailyAssetDate { date });
            }
        }
        let point = DailyAssetPoint {
            date,
            total_assets,
            cash,
            holdings_value,
        };
        self.daily_assets.push(point.clone());
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    #[test]
    fn scenario_a_buy_then_forced_sell() {
        let mut book = PortfolioBook::new(10000.0, date("20250106"));

        book.apply_buy(
            date("20250106"),
            "09:30",
            "000001.SZ",
            "Ping An Bank",
            200,
            10.00,
            "llm buy",
            ExitPlan::default(),
        )
        .unwrap();

        assert_eq!(book.holdings["000001.SZ"].amount, 200);
        assert!((book.cash - 7995.0).abs() < 1e-6);

        let trade = book
            .apply_sell(
                date("20250107"),
                "09:30",
                "000001.SZ",
                200,
                11.00,
                "stop profit",
            )
            .unwrap();

        assert!(!book.holdings.contains_key("000001.SZ"));
        assert!((book.cash - 10187.80).abs() < 1e-2);
        assert!((trade.profit_pct.unwrap() - 9.64).abs() < 0.1);
    }

    #[test]
    fn sell_fee_model_matches_spec() {
        let mut book = PortfolioBook::new(10000.0, date("20250106"));
        book.apply_buy(
            date("20250106"),
            "09:30",
            "000001.SZ",
            "x",
            200,
            10.0,
            "buy",
            ExitPlan::default(),
        )
        .unwrap();
        let trade = book
            .apply_sell(date("20250107"), "09:30", "000001.SZ", 200, 11.0, "sell")
            .unwrap();
        assert!(trade.commission >= 5.0);
        assert!((trade.stamp_tax - trade.total * 0.001).abs() < 1e-9);
    }

    #[test]
    fn invariant_rejects_non_lot_holding() {
        let book = PortfolioBook::new(10000.0, date("20250106"));
        let mut bad = book.clone();
        bad.holdings.insert(
            "X".into(),
            Holding {
                code: "X".into(),
                name: "x".into(),
                amount: 150,
                cost: 10.0,
                current_price: 10.0,
                hold_days: 0,
                buy_date: date("20250106"),
                exit_plan: ExitPlan::default(),
            },
        );
        assert!(bad.check_invariants(date("20250106")).is_err());
    }

    #[test]
    fn daily_assets_must_be_strictly_increasing() {
        let mut book = PortfolioBook::new(10000.0, date("20250106"));
        book.record_daily(date("20250106")).unwrap();
        assert!(book.record_daily(date("20250106")).is_err());
        assert!(book.record_daily(date("20250105")).is_err());
        assert!(book.record_daily(date("20250107")).is_ok());
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut book = PortfolioBook::new(10000.0, date("20250106"));
        book.apply_buy(
            date("20250106"),
            "09:30",
            "000001.SZ",
            "x",
            200,
            10.0,
            "buy",
            ExitPlan::default(),
        )
        .unwrap();
        let snap = book.snapshot();
        book.apply_sell(date("20250107"), "09:30", "000001.SZ", 200, 11.0, "sell")
            .unwrap();
        book.restore(snap);
        assert!(book.holdings.contains_key("000001.SZ"));
        assert!((book.cash - 7995.0).abs() < 1e-6);
    }
}
