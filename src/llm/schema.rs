//! Retry policy, tolerant JSON extraction, and the three canonical decision
//! schemas (sell, buy, reflection) the agent pipeline consumes. Downstream
//! nodes only ever see these canonical shapes.

use super::client::LlmClient;
use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_SECS: u64 = 2;

fn is_quota_exhausted(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("insufficient balance") || lower.contains("1113")
}

/// Invoke `client` with up to 3 attempts and exponential backoff (2s, 4s,
/// 8s). A message containing "insufficient balance" or vendor code 1113
/// short-circuits without retry.
pub async fn invoke_with_retry(
    client: &dyn LlmClient,
    model: &str,
    system: &str,
    user: &str,
    timeout: Duration,
) -> Result<String> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        match client.complete(model, system, user, timeout).await {
            Ok(text) => return Ok(text),
            Err(e) => {
                let message = e.to_string();
                if is_quota_exhausted(&message) {
                    tracing::warn!(model, "llm quota exhausted, not retrying");
                    return Err(e);
                }
                tracing::warn!(model, attempt, error = %message, "llm call failed");
                last_err = Some(e);
                if attempt + 1 < MAX_ATTEMPTS {
                    let delay = BACKOFF_BASE_SECS * 2u64.pow(attempt);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
            }
        }
    }
    Err(last_err.unwrap())
}

/// Tolerant JSON extraction: whole-response parse, then the first fenced
/// ```json block, then a stack-matched balanced `[...]` array.
pub fn extract_json_value(raw: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(v);
    }
    if let Some(fenced) = extract_fenced_json_block(raw) {
        if let Ok(v) = serde_json::from_str::<Value>(&fenced) {
            return Some(v);
        }
    }
    if let Some(array_text) = extract_balanced_array(raw) {
        if let Ok(v) = serde_json::from_str::<Value>(&array_text) {
            return Some(v);
        }
    }
    None
}

fn extract_fenced_json_block(raw: &str) -> Option<String> {
    let marker = "```json";
    let start = raw.find(marker)? + marker.len();
    let rest = &raw[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Finds the first balanced `[...]`, respecting string literals and escapes.
fn extract_balanced_array(raw: &str) -> Option<String> {
    let bytes: Vec<char> = raw.chars().collect();
    let start = bytes.iter().position(|&c| c == '[')?;

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    let slice: String = bytes[start..=i].iter().collect();
                    return Some(slice);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Deserialize)]
struct RawSellDecision {
    #[serde(alias = "stock_code", alias = "code", alias = "stock")]
    code: Option<String>,
    #[serde(default)]
    name: Option<String>,
    action: Option<String>,
    #[serde(default)]
    amount: Option<i64>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SellDecision {
    pub code: String,
    pub reason: String,
    pub confidence: f64,
    /// `None` means sell the full position (the common case, and the only
    /// option for hard-rule forced sells).
    pub amount: Option<i64>,
}

/// Parses the LLM's sell-decision array. `holdings` supplies the set of
/// codes (and their display names) currently held, used to resolve aliases,
/// reverse-lookup by name, and auto-infer the single-holding case. Decisions
/// whose code is not in `holdings`, or whose action is not "sell", are
/// dropped.
pub fn parse_sell_decisions(raw: &str, holdings: &[(String, String)]) -> Vec<SellDecision> {
    let Some(value) = extract_json_value(raw) else {
        return Vec::new();
    };
    let Ok(raw_decisions) = serde_json::from_value::<Vec<RawSellDecision>>(value) else {
        return Vec::new();
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for d in raw_decisions {
        let action_is_sell = d
            .action
            .as_deref()
            .map(|a| a.trim().eq_ignore_ascii_case("sell"))
            .unwrap_or(false);
        if !action_is_sell {
            continue;
        }

        let resolved_code = resolve_holding_code(d.code.as_deref(), d.name.as_deref(), holdings);
        let Some(code) = resolved_code else {
            continue;
        };
        if !seen.insert(code.clone()) {
            continue; // first decision per code wins
        }

        out.push(SellDecision {
            code,
            reason: d.reason,
            confidence: d.confidence.unwrap_or(1.0),
            amount: d.amount.filter(|a| *a > 0),
        });
    }
    out
}

fn resolve_holding_code(
    code: Option<&str>,
    name: Option<&str>,
    holdings: &[(String, String)],
) -> Option<String> {
    if let Some(c) = code {
        if holdings.iter().any(|(hc, _)| hc == c) {
            return Some(c.to_string());
        }
    }
    if let Some(n) = name {
        if let Some((hc, _)) = holdings.iter().find(|(_, hn)| hn == n) {
            return Some(hc.clone());
        }
    }
    if holdings.len() == 1 {
        return Some(holdings[0].0.clone());
    }
    None
}

#[derive(Debug, Clone, Deserialize)]
struct RawExitPlan {
    #[serde(default)]
    profit_target: Option<f64>,
    #[serde(default)]
    stop_loss: Option<f64>,
    #[serde(default)]
    invalidation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBuyDecision {
    #[serde(alias = "stock_code", alias = "code")]
    code: Option<String>,
    #[serde(default)]
    suggested_amount: Option<i64>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    expected_days: Option<u32>,
    #[serde(default)]
    exit_plan: Option<RawExitPlan>,
}

#[derive(Debug, Clone)]
pub struct BuyDecision {
    pub code: String,
    pub amount: i64,
    pub confidence: f64,
    pub reason: String,
    pub expected_days: Option<u32>,
    pub exit_plan: crate::models::ExitPlan,
}

/// Parses the LLM's buy-decision array. Drops entries below
/// `confidence_threshold` or with no resolvable code; normalizes amount to
/// the nearest lower multiple of 100 (the A-share lot size).
pub fn parse_buy_decisions(raw: &str, confidence_threshold: f64) -> Vec<BuyDecision> {
    let Some(value) = extract_json_value(raw) else {
        return Vec::new();
    };
    let Ok(raw_decisions) = serde_json::from_value::<Vec<RawBuyDecision>>(value) else {
        return Vec::new();
    };

    raw_decisions
        .into_iter()
        .filter_map(|d| {
            let code = d.code?;
            let confidence = d.confidence.unwrap_or(0.0);
            if confidence < confidence_threshold {
                return None;
            }
            let amount = (d.suggested_amount.unwrap_or(0) / 100) * 100;
            if amount <= 0 {
                return None;
            }
            Some(BuyDecision {
                code,
                amount,
                confidence,
                reason: d.reason,
                expected_days: d.expected_days,
                exit_plan: crate::models::ExitPlan {
                    profit_target: d.exit_plan.as_ref().and_then(|p| p.profit_target),
                    stop_loss: d.exit_plan.as_ref().and_then(|p| p.stop_loss),
                    invalidation: d.exit_plan.as_ref().and_then(|p| p.invalidation.clone()),
                    expected_days: d.expected_days,
                },
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReflectionOutput {
    #[serde(default)]
    pub cash_reflection: String,
    #[serde(default)]
    pub timing_reflection: String,
    #[serde(default)]
    pub decision_reflection: String,
    #[serde(default)]
    pub strengths: String,
    #[serde(default)]
    pub weaknesses: String,
    #[serde(default)]
    pub adjustment_plan: String,
    #[serde(default)]
    pub principles: Vec<String>,
}

/// Parses a structured reflection; falls back to stuffing the raw text into
/// `decision_reflection` if the model didn't return well-formed JSON.
pub fn parse_reflection(raw: &str) -> ReflectionOutput {
    if let Some(value) = extract_json_value(raw) {
        if let Ok(parsed) = serde_json::from_value::<ReflectionOutput>(value) {
            return parsed;
        }
    }
    ReflectionOutput {
        decision_reflection: raw.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_whole_response() {
        let raw = r#"[{"code":"000001.SZ","action":"sell","reason":"x","confidence":0.9}]"#;
        let v = extract_json_value(raw).unwrap();
        assert!(v.is_array());
    }

    #[test]
    fn extracts_fenced_block() {
        let raw = "here is my answer:\n```json\n[{\"code\":\"A\",\"action\":\"sell\"}]\n```\nthanks";
        let v = extract_json_value(raw).unwrap();
        assert!(v.is_array());
    }

    #[test]
    fn extracts_balanced_array_with_nested_strings() {
        let raw = "noise before [ {\"reason\": \"contains a ] bracket\", \"code\":\"A\", \"action\":\"sell\"} ] trailing noise";
        let v = extract_json_value(raw).unwrap();
        assert!(v.is_array());
    }

    #[test]
    fn sell_decisions_drop_unknown_code() {
        let raw = r#"[{"code":"999999.SZ","action":"sell","reason":"x"}]"#;
        let holdings = vec![("000001.SZ".to_string(), "Ping An".to_string())];
        let decisions = parse_sell_decisions(raw, &holdings);
        assert!(decisions.is_empty());
    }

    #[test]
    fn sell_decisions_auto_infer_single_holding() {
        let raw = r#"[{"action":"sell","reason":"stop loss"}]"#;
        let holdings = vec![("000001.SZ".to_string(), "Ping An".to_string())];
        let decisions = parse_sell_decisions(raw, &holdings);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].code, "000001.SZ");
    }

    #[test]
    fn sell_decisions_reject_second_decision_for_same_code() {
        let raw = r#"[{"code":"000001.SZ","action":"sell","reason":"a"},{"code":"000001.SZ","action":"sell","reason":"b"}]"#;
        let holdings = vec![("000001.SZ".to_string(), "Ping An".to_string())];
        let decisions = parse_sell_decisions(raw, &holdings);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, "a");
    }

    #[test]
    fn buy_decisions_normalize_amount_and_filter_confidence() {
        let raw = r#"[{"stock_code":"000002.SZ","suggested_amount":250,"confidence":0.8,"reason":"r"},{"stock_code":"000003.SZ","suggested_amount":500,"confidence":0.1,"reason":"r"}]"#;
        let decisions = parse_buy_decisions(raw, 0.6);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].amount, 200);
    }

    #[test]
    fn reflection_falls_back_to_raw_text() {
        let out = parse_reflection("not json at all");
        assert_eq!(out.decision_reflection, "not json at all");
    }
}
