//! LLM client interface and the two implementations the rest of the crate
//! uses: a real HTTP-backed client and a scripted one for tests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Accepts a prompt, returns text. Retries, JSON extraction, and schema
/// tolerance all live above this trait (see `llm::schema`).
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<String>;
}

/// An OpenRouter-shaped chat-completions client.
#[derive(Clone)]
pub struct OpenRouterLikeClient {
    http: reqwest::Client,
    api_key: String,
    referer: Option<String>,
    title: Option<String>,
    base_url: String,
}

impl OpenRouterLikeClient {
    pub fn from_env(http: reqwest::Client) -> Result<Self> {
        let api_key =
            std::env::var("OPENROUTER_API_KEY").context("OPENROUTER_API_KEY missing (set env var)")?;
        if api_key.trim().is_empty() {
            return Err(anyhow!("OPENROUTER_API_KEY empty"));
        }
        let referer = std::env::var("OPENROUTER_HTTP_REFERER")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let title = std::env::var("OPENROUTER_APP_TITLE")
            .ok()
            .filter(|s| !s.trim().is_empty());
        let base_url = std::env::var("OPENROUTER_BASE_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1/chat/completions".to_string());

        Ok(Self {
            http,
            api_key,
            referer,
            title,
            base_url,
        })
    }
}

#[async_trait]
impl LlmClient for OpenRouterLikeClient {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<String> {
        let start = Instant::now();

        let req = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.3),
            max_tokens: Some(2048),
        };

        let mut http_req = self
            .http
            .post(&self.base_url)
            .timeout(timeout)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(r) = &self.referer {
            http_req = http_req.header("HTTP-Referer", r);
        }
        if let Some(t) = &self.title {
            http_req = http_req.header("X-Title", t);
        }

        let resp = http_req.json(&req).send().await.context("llm request")?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let snippet: String = body.chars().take(800).collect();
            return Err(anyhow!("llm endpoint {}: {}", status.as_u16(), snippet));
        }

        let parsed: ChatCompletionResponse =
            serde_json::from_str(&body).context("llm response json parse")?;
        let content = parsed
            .choices
            .get(0)
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        tracing::debug!(model, elapsed_ms = start.elapsed().as_millis() as u64, "llm call completed");
        Ok(content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    pub message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    pub content: String,
}

/// Returns a pre-programmed sequence of responses, one per call, in order.
/// Used by deterministic tests of the agent pipeline and scheduler.
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        _model: &str,
        _system: &str,
        _user: &str,
        _timeout: Duration,
    ) -> Result<String> {
        let mut queue = self.responses.lock().await;
        match queue.pop_front() {
            Some(Ok(s)) => Ok(s),
            Some(Err(e)) => Err(anyhow!(e)),
            None => Err(anyhow!("ScriptedLlmClient exhausted")),
        }
    }
}
