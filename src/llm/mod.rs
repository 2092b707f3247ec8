pub mod client;
pub mod schema;

pub use client::{LlmClient, OpenRouterLikeClient, ScriptedLlmClient};
pub use schema::{
    extract_json_value, invoke_with_retry, parse_buy_decisions, parse_reflection,
    parse_sell_decisions, BuyDecision, ReflectionOutput, SellDecision,
};
