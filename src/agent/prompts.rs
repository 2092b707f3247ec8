//! Pure functions that format engine state into prompt text. Wording itself
//! is explicitly out of scope; these exist so the nodes below have
//! something concrete to send to an `LlmClient`.

use crate::models::{CandidateStock, Holding, NewsItem, RankingContext};

pub fn format_ranking_context(ctx: &RankingContext) -> String {
    format!(
        "rank={} leader={} gap_to_leader={:.2}% stage={:?}\n{}\ngoal: {}",
        ctx.rank, ctx.leader, ctx.gap_to_leader, ctx.stage, ctx.comment, ctx.goal
    )
}

pub fn format_news(items: &[NewsItem]) -> String {
    if items.is_empty() {
        return "no relevant news".to_string();
    }
    items
        .iter()
        .map(|n| format!("- [{}] {}", n.date, n.headline))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn sell_evaluation_prompt(
    holdings: &[Holding],
    ranking_ctx: &RankingContext,
    news: &[NewsItem],
) -> String {
    let holdings_text = holdings
        .iter()
        .map(|h| {
            format!(
                "{} {} amount={} cost={:.2} price={:.2} profit_pct={:.2}% hold_days={} exit_plan={:?}",
                h.code, h.name, h.amount, h.cost, h.current_price, h.profit_pct(), h.hold_days, h.exit_plan
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You manage these holdings:\n{}\n\nContext:\n{}\n\nRecent news:\n{}\n\n\
         Return a JSON array of {{code, action, amount, reason, confidence}} decisions.",
        holdings_text,
        format_ranking_context(ranking_ctx),
        format_news(news)
    )
}

pub fn buy_evaluation_prompt(
    candidates: &[CandidateStock],
    holdings: &[Holding],
    ranking_ctx: &RankingContext,
    news: &[NewsItem],
) -> String {
    let candidates_text = candidates
        .iter()
        .map(|c| {
            format!(
                "{} {} close={:.2} change_pct={:.2}% hot={}",
                c.code, c.name, c.close, c.change_pct, c.is_hot
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let holdings_text = holdings
        .iter()
        .map(|h| format!("{} amount={}", h.code, h.amount))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Candidates:\n{}\n\nCurrent holdings: {}\n\nContext:\n{}\n\nRecent news:\n{}\n\n\
         Return a JSON array of {{stock_code, suggested_amount, confidence, reason, expected_days, exit_plan}}.",
        candidates_text,
        holdings_text,
        format_ranking_context(ranking_ctx),
        format_news(news)
    )
}

pub fn reflection_prompt(recent_trades_summary: &str, aggregate_stats: &str) -> String {
    format!(
        "Recent trades:\n{}\n\nAggregate stats:\n{}\n\n\
         Reflect on performance and return structured JSON with cash_reflection, \
         timing_reflection, decision_reflection, strengths, weaknesses, adjustment_plan, principles.",
        recent_trades_summary, aggregate_stats
    )
}
