//! Per-agent trading pipeline: the 8-node DAG that advances one agent by
//! one trade date, wrapped in a snapshot/restore guard so a single failed
//! node can never corrupt the portfolio or break the asset curve.

pub mod prompts;

use crate::config::ArenaConfig;
use crate::llm::{
    invoke_with_retry, parse_buy_decisions, parse_reflection, parse_sell_decisions, LlmClient,
    SellDecision,
};
use crate::market::MarketDataProvider;
use crate::models::{
    CandidateStock, ExitPlan, Holding, Principles, RankingContext, Reflection, Trade, TradeDate,
};
use crate::news::{NewsScope, NewsSource};
use crate::portfolio::PortfolioBook;
use anyhow::Result;
use std::time::Duration;

const LLM_TIMEOUT: Duration = Duration::from_secs(600);
const CLOSE_TIME: &str = "15:00:00";

#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub name: String,
    pub model_id: String,
    /// Deterministic per-provider offset used by the candidate rotation.
    pub model_offset: i64,
}

pub struct PipelineDeps<'a> {
    pub market: &'a MarketDataProvider,
    pub news: &'a dyn NewsSource,
    pub llm: &'a dyn LlmClient,
    pub config: &'a ArenaConfig,
}

#[derive(Debug, Default)]
pub struct PipelineOutcome {
    pub trades: Vec<Trade>,
    pub reflection: Option<Reflection>,
    pub principles: Option<Principles>,
    pub cancelled: bool,
    pub failed: bool,
    pub error: Option<String>,
}

enum PipelineSignal {
    Cancelled,
    NodeFailed(anyhow::Error),
}

impl From<anyhow::Error> for PipelineSignal {
    fn from(e: anyhow::Error) -> Self {
        PipelineSignal::NodeFailed(e)
    }
}

fn check_cancel(should_stop: &(dyn Fn() -> bool + Send + Sync)) -> Result<(), PipelineSignal> {
    if should_stop() {
        Err(PipelineSignal::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs the full 8-node pipeline for `date`, restoring the pre-exec
/// snapshot and synthesizing a continuity point on any node failure.
pub async fn run_pipeline_for_date(
    book: &mut PortfolioBook,
    date: TradeDate,
    identity: &AgentIdentity,
    deps: &PipelineDeps<'_>,
    ranking_ctx: &RankingContext,
    should_stop: &(dyn Fn() -> bool + Send + Sync),
) -> PipelineOutcome {
    let pre_snapshot = book.snapshot();
    let pre_total_assets = book.total_assets();
    let pre_cash = book.cash;
    let pre_holdings_value = book.holdings_value();

    match run_inner(book, date, identity, deps, ranking_ctx, should_stop).await {
        Ok(outcome) => outcome,
        Err(PipelineSignal::Cancelled) => {
            book.restore(pre_snapshot);
            PipelineOutcome {
                cancelled: true,
                ..Default::default()
            }
        }
        Err(PipelineSignal::NodeFailed(e)) => {
            tracing::error!(agent = %identity.name, %date, error = %e, "agent pipeline node failed");
            book.restore(pre_snapshot);
            let _ =
                book.record_continuity_point(date, pre_total_assets, pre_cash, pre_holdings_value);
            PipelineOutcome {
                failed: true,
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}

async fn run_inner(
    book: &mut PortfolioBook,
    date: TradeDate,
    identity: &AgentIdentity,
    deps: &PipelineDeps<'_>,
    ranking_ctx: &RankingContext,
    should_stop: &(dyn Fn() -> bool + Send + Sync),
) -> Result<PipelineOutcome, PipelineSignal> {
    let mut trades = Vec::new();

    // 1. update_prices
    update_prices(book, deps.market, date).await;
    check_cancel(should_stop)?;

    // 2. evaluate_holdings
    let sell_decisions = evaluate_holdings(book, identity, deps, ranking_ctx, date).await?;
    check_cancel(should_stop)?;

    // 3. execute_sells
    trades.extend(execute_sells(book, &sell_decisions, date)?);
    check_cancel(should_stop)?;

    // 4. find_candidates
    let candidates = find_candidates(book, deps, identity, date).await?;
    check_cancel(should_stop)?;

    // 5. analyze_candidates
    let buy_decisions =
        analyze_candidates(&candidates, book, identity, deps, ranking_ctx, date).await?;
    check_cancel(should_stop)?;

    // 6. execute_buys
    trades.extend(execute_buys(book, &buy_decisions, &candidates, deps.config, date)?);
    check_cancel(should_stop)?;

    // 7. record_daily
    book.record_daily(date)
        .map_err(|e| PipelineSignal::NodeFailed(e.into()))?;
    check_cancel(should_stop)?;

    // 8. reflect
    let (reflection, principles) =
        reflect(book, identity, deps, date, &trades).await?;

    Ok(PipelineOutcome {
        trades,
        reflection,
        principles,
        cancelled: false,
        failed: false,
        error: None,
    })
}

async fn update_prices(book: &mut PortfolioBook, market: &MarketDataProvider, date: TradeDate) {
    let codes: Vec<String> = book.holdings.keys().cloned().collect();
    for code in codes {
        let bar = market.daily_bar(&code, date).await.ok().flatten();
        let holding = book.holdings.get_mut(&code).expect("iterating known keys");
        match bar {
            Some(b) if b.close > 0.0 => holding.current_price = b.close,
            _ => tracing::debug!(code, %date, "no usable price, holding previous"),
        }
        holding.hold_days += 1;
    }
}

async fn evaluate_holdings(
    book: &PortfolioBook,
    identity: &AgentIdentity,
    deps: &PipelineDeps<'_>,
    ranking_ctx: &RankingContext,
    date: TradeDate,
) -> Result<Vec<SellDecision>> {
    let mut forced = Vec::new();
    for h in book.holdings.values() {
        let pct = h.profit_pct();
        if pct <= -(deps.config.stop_loss_pct * 100.0) {
            forced.push(SellDecision {
                code: h.code.clone(),
                reason: "hard rule: stop loss".to_string(),
                confidence: 1.0,
                amount: None,
            });
        } else if pct >= deps.config.stop_profit_pct * 100.0 {
            forced.push(SellDecision {
                code: h.code.clone(),
                reason: "hard rule: stop profit".to_string(),
                confidence: 1.0,
                amount: None,
            });
        }
    }
    if !forced.is_empty() {
        return Ok(forced);
    }

    if book.holdings.is_empty() {
        return Ok(Vec::new());
    }

    let holdings: Vec<Holding> = book.holdings.values().cloned().collect();
    let mut news = Vec::new();
    for h in holdings.iter().take(2) {
        if let Ok(mut items) = deps
            .news
            .news_for(date, NewsScope::Stock(h.code.clone()))
            .await
        {
            items.truncate(1);
            news.extend(items);
        }
    }

    let prompt = prompts::sell_evaluation_prompt(&holdings, ranking_ctx, &news);
    let response = invoke_with_retry(
        deps.llm,
        &identity.model_id,
        "You are a disciplined trading agent evaluating current holdings.",
        &prompt,
        LLM_TIMEOUT,
    )
    .await
    .unwrap_or_default();

    let holding_refs: Vec<(String, String)> =
        holdings.iter().map(|h| (h.code.clone(), h.name.clone())).collect();
    Ok(parse_sell_decisions(&response, &holding_refs))
}

fn execute_sells(
    book: &mut PortfolioBook,
    decisions: &[SellDecision],
    date: TradeDate,
) -> Result<Vec<Trade>> {
    let mut trades = Vec::new();
    for decision in decisions {
        let Some(holding) = book.holdings.get(&decision.code) else {
            continue;
        };
        if holding.hold_days == 0 {
            tracing::debug!(code = %decision.code, %date, "T+1 block: bought today");
            continue;
        }
        let price = holding.current_price;
        let full_amount = holding.amount;
        let amount = decision
            .amount
            .map(|a| (a / 100) * 100)
            .unwrap_or(full_amount)
            .min(full_amount);
        if amount <= 0 {
            continue;
        }
        let trade = book.apply_sell(date, CLOSE_TIME, &decision.code, amount, price, &decision.reason)?;
        trades.push(trade);
    }
    Ok(trades)
}

async fn find_candidates(
    book: &PortfolioBook,
    deps: &PipelineDeps<'_>,
    identity: &AgentIdentity,
    date: TradeDate,
) -> Result<Vec<CandidateStock>> {
    if book.cash < deps.config.min_cash_to_buy {
        return Ok(Vec::new());
    }

    let pool = match deps.market.candidate_pool(date).await {
        Some(p) => p,
        None => deps.market.preload(date).await?,
    };

    let mut sorted = pool.candidates.clone();
    sorted.sort_by_key(|c| !c.is_hot);
    let analyze_count = deps.config.analyze_stock_count;
    sorted.truncate(analyze_count * 5);

    let batch_count = 5i64;
    let date_int: i64 = date.as_yyyymmdd().parse().unwrap_or(0);
    let batch_index = (((date_int + identity.model_offset) % batch_count) + batch_count) % batch_count;
    let chunk_size = analyze_count.max(1);

    let start = (batch_index as usize) * chunk_size;
    let slice: Vec<CandidateStock> = if start < sorted.len() {
        sorted[start..(start + chunk_size).min(sorted.len())].to_vec()
    } else {
        sorted[..analyze_count.min(sorted.len())].to_vec()
    };

    Ok(slice)
}

async fn analyze_candidates(
    candidates: &[CandidateStock],
    book: &PortfolioBook,
    identity: &AgentIdentity,
    deps: &PipelineDeps<'_>,
    ranking_ctx: &RankingContext,
    date: TradeDate,
) -> Result<Vec<crate::llm::BuyDecision>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let holdings: Vec<Holding> = book.holdings.values().cloned().collect();
    let news = deps
        .news
        .news_for(date, NewsScope::Market)
        .await
        .unwrap_or_default()
        .into_iter()
        .take(2)
        .collect::<Vec<_>>();

    let prompt = prompts::buy_evaluation_prompt(candidates, &holdings, ranking_ctx, &news);
    let response = invoke_with_retry(
        deps.llm,
        &identity.model_id,
        "You are a disciplined trading agent screening buy candidates.",
        &prompt,
        LLM_TIMEOUT,
    )
    .await
    .unwrap_or_default();

    Ok(parse_buy_decisions(&response, deps.config.ai_confidence_threshold))
}

fn execute_buys(
    book: &mut PortfolioBook,
    decisions: &[crate::llm::BuyDecision],
    candidates: &[CandidateStock],
    config: &ArenaConfig,
    date: TradeDate,
) -> Result<Vec<Trade>> {
    let mut trades = Vec::new();
    let reserve = config.initial_capital * 0.05;

    for decision in decisions {
        let Some(candidate) = candidates.iter().find(|c| c.code == decision.code) else {
            continue;
        };
        let price = candidate.close;
        let total = decision.amount as f64 * price;

        if book.cash < reserve {
            continue;
        }
        let already_held = book.holdings.contains_key(&decision.code);
        if !already_held && book.holdings.len() >= config.max_holdings {
            continue;
        }
        let max_spend = book.cash * 0.95;
        if total > max_spend {
            continue;
        }
        let total_assets = book.total_assets();
        let existing_position_value = book
            .holdings
            .get(&decision.code)
            .map(|h| h.amount as f64 * h.current_price)
            .unwrap_or(0.0);
        if existing_position_value + total > 0.40 * total_assets {
            continue;
        }
        if decision.amount < 100 {
            continue;
        }

        let trade = book.apply_buy(
            date,
            CLOSE_TIME,
            &decision.code,
            &candidate.name,
            decision.amount,
            price,
            &decision.reason,
            decision.exit_plan.clone(),
        )?;
        trades.push(trade);
    }
    Ok(trades)
}

fn recent_trades_summary(trades: &[Trade]) -> String {
    if trades.is_empty() {
        return "no trades today".to_string();
    }
    trades
        .iter()
        .map(|t| format!("{:?} {} x{} @ {:.2}", t.action, t.code, t.amount, t.price))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn reflect(
    book: &PortfolioBook,
    identity: &AgentIdentity,
    deps: &PipelineDeps<'_>,
    date: TradeDate,
    today_trades: &[Trade],
) -> Result<(Option<Reflection>, Option<Principles>), PipelineSignal> {
    if !deps.config.enable_reflection {
        return Ok((None, None));
    }

    let days_recorded = book.daily_assets.len() as u32;
    let interval_due =
        deps.config.reflection_interval > 0 && days_recorded % deps.config.reflection_interval == 0;

    let loss_trigger = book.daily_assets.len() >= 2 && {
        let today = book.daily_assets[book.daily_assets.len() - 1].total_assets;
        let yesterday = book.daily_assets[book.daily_assets.len() - 2].total_assets;
        yesterday > 0.0 && (today - yesterday) / yesterday < -0.03
    };

    let drawdown_trigger = {
        let peak = book
            .daily_assets
            .iter()
            .map(|p| p.total_assets)
            .fold(f64::MIN, f64::max);
        let today = book.daily_assets.last().map(|p| p.total_assets).unwrap_or(0.0);
        peak > 0.0 && (peak - today) / peak > 0.05
    };

    if !(interval_due || loss_trigger || drawdown_trigger) {
        return Ok((None, None));
    }

    let stats = format!(
        "total_assets={:.2} cash={:.2} holdings={}",
        book.total_assets(),
        book.cash,
        book.holdings.len()
    );
    let prompt = prompts::reflection_prompt(&recent_trades_summary(today_trades), &stats);
    let response = invoke_with_retry(
        deps.llm,
        &identity.model_id,
        "You are a trading agent reflecting on recent performance.",
        &prompt,
        LLM_TIMEOUT,
    )
    .await
    .unwrap_or_default();

    let parsed = parse_reflection(&response);
    let reflection = Reflection {
        date,
        model: identity.model_id.clone(),
        summary: parsed.decision_reflection.clone(),
        cash_reflection: parsed.cash_reflection,
        timing_reflection: parsed.timing_reflection,
        decision_reflection: parsed.decision_reflection,
        strengths: parsed.strengths,
        weaknesses: parsed.weaknesses,
        adjustment_plan: parsed.adjustment_plan,
    };
    let principles = Principles {
        date,
        items: parsed.principles,
        active: true,
    };

    Ok((Some(reflection), Some(principles)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArenaConfig;
    use crate::llm::ScriptedLlmClient;
    use crate::market::{Bar, MarketDataProvider, StockBasic, StubMarketDataSource};
    use crate::news::StubNewsSource;
    use std::sync::Arc;

    fn date(s: &str) -> TradeDate {
        TradeDate::parse(s).unwrap()
    }

    fn always_run() -> bool {
        false
    }

    #[tokio::test]
    async fn scenario_a_single_buy_then_forced_sell() {
        let d0 = date("20250106");
        let d1 = date("20250107");

        let source = StubMarketDataSource::new(vec![d0, d1])
            .with_basic(StockBasic {
                code: "000001.SZ".into(),
                name: "Ping An Bank".into(),
                is_st: false,
                is_delisted: false,
            })
            .with_bar(
                "000001.SZ",
                d0,
                Bar {
                    close: 10.0,
                    volume: 1000.0,
                    change_pct: 1.0,
                },
            )
            .with_bar(
                "000001.SZ",
                d1,
                Bar {
                    close: 11.0,
                    volume: 1000.0,
                    change_pct: 10.0,
                },
            );
        let market = MarketDataProvider::new(Arc::new(source), Arc::new(StubNewsSource), 200.0);
        market.preload(d0).await.unwrap();

        let config = ArenaConfig {
            stop_profit_pct: 0.10,
            stop_loss_pct: 0.08,
            min_cash_to_buy: 100000.0, // force find_candidates empty; buy comes from scripted decision below on d0 via direct book mutation
            ..ArenaConfig::default()
        };

        let llm = ScriptedLlmClient::new(vec![]);
        let news = StubNewsSource;
        let deps = PipelineDeps {
            market: &market,
            news: &news,
            llm: &llm,
            config: &config,
        };
        let identity = AgentIdentity {
            name: "agent_a".into(),
            model_id: "test-model".into(),
            model_offset: 0,
        };

        let mut book = PortfolioBook::new(10000.0, d0);
        // Seed the day-0 buy directly, mirroring what execute_buys would do,
        // since this test exercises node wiring rather than LLM parsing.
        book.apply_buy(
            d0,
            CLOSE_TIME,
            "000001.SZ",
            "Ping An Bank",
            200,
            10.0,
            "seed",
            ExitPlan::default(),
        )
        .unwrap();
        book.record_daily(d0).unwrap();

        let ranking_ctx = RankingContext {
            rank: 1,
            leader: "agent_a".into(),
            gap_to_leader: 0.0,
            stage: crate::models::ArenaStage::Early,
            comment: "".into(),
            goal: "".into(),
        };

        let outcome =
            run_pipeline_for_date(&mut book, d1, &identity, &deps, &ranking_ctx, &always_run).await;

        assert!(!outcome.failed);
        assert!(!book.holdings.contains_key("000001.SZ"));
        assert!((book.cash - 10187.80).abs() < 1.0);
    }

    #[tokio::test]
    async fn t1_block_rejects_same_day_sell() {
        let d0 = date("20250106");
        let holdings = vec![("000001.SZ".to_string(), "x".to_string())];
        let mut book = PortfolioBook::new(10000.0, d0);
        book.apply_buy(d0, CLOSE_TIME, "000001.SZ", "x", 200, 10.0, "buy", ExitPlan::default())
            .unwrap();

        let decisions = parse_sell_decisions(
            r#"[{"code":"000001.SZ","action":"sell","reason":"panic"}]"#,
            &holdings,
        );
        let trades = execute_sells(&mut book, &decisions, d0).unwrap();
        assert!(trades.is_empty());
        assert!(book.holdings.contains_key("000001.SZ"));
    }

    #[test]
    fn risk_gate_rejects_oversized_position() {
        let mut book = PortfolioBook::new(10000.0, TradeDate::parse("20250106").unwrap());
        let config = ArenaConfig::default();
        let candidates = vec![CandidateStock {
            code: "000002.SZ".into(),
            name: "x".into(),
            close: 3.0,
            change_pct: 0.0,
            volume: 1.0,
            is_hot: false,
        }];
        let decisions = vec![crate::llm::BuyDecision {
            code: "000002.SZ".into(),
            amount: 1500,
            confidence: 0.9,
            reason: "r".into(),
            expected_days: None,
            exit_plan: ExitPlan::default(),
        }];
        let trades =
            execute_buys(&mut book, &decisions, &candidates, &config, TradeDate::parse("20250106").unwrap())
                .unwrap();
        assert!(trades.is_empty());
        assert!(book.holdings.is_empty());
    }
}
