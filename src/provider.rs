// LLM provider seam. The core depends on one capability: complete(prompt)
// → text. The HTTP implementation speaks the OpenAI-compatible chat API;
// the scripted implementation feeds tests deterministic responses.
//
// Cost accounting stores raw token counts per call; USD conversion happens
// only at the stop-condition comparison with a configured rate.

use crate::errors::{CoreError, CoreResult};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: Option<usize>,
    pub completion_tokens: Option<usize>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> CoreResult<Completion>;
    fn provider_id(&self) -> &str;
    fn model(&self) -> &str;
}

// ── HTTP provider (OpenAI-compatible) ──────────────────────────────────

pub struct HttpProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    provider_id: String,
    model: String,
}

impl HttpProvider {
    pub fn new(
        provider_id: String,
        base_url: String,
        model: String,
        api_key: Option<String>,
        call_timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .timeout(call_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            provider_id,
            model,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.provider.id.clone(),
            config.provider.url.clone(),
            config.provider.model.clone(),
            config.resolve_api_key(),
            Duration::from_secs(config.provider.call_timeout_secs),
        )
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn complete(&self, system: &str, prompt: &str) -> CoreResult<Completion> {
        info!(
            "LLM request: model={}, system_chars={}, prompt_chars={}",
            self.model,
            system.len(),
            prompt.len()
        );
        let url = format!("{}/chat/completions", self.base_url);
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            stream: false,
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb.send().await.map_err(|e| CoreError::LlmError {
            retryable: e.is_timeout() || e.is_connect(),
            message: e.to_string(),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::LlmError {
                retryable,
                message: format!("provider returned {}: {:.200}", status, body),
            });
        }

        let payload: ChatResponse = resp.json().await.map_err(|e| CoreError::LlmError {
            retryable: false,
            message: format!("unparseable provider response: {}", e),
        })?;
        let text = payload
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok(Completion {
            text,
            prompt_tokens: payload.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: payload.usage.as_ref().and_then(|u| u.completion_tokens),
        })
    }

    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn model(&self) -> &str {
        &self.model
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
}

// ── Retry wrapper ──────────────────────────────────────────────────────

/// Call the provider with exponential backoff on retryable failures.
pub async fn complete_with_retry(
    provider: &dyn LlmProvider,
    system: &str,
    prompt: &str,
    max_retries: u32,
) -> CoreResult<Completion> {
    let mut attempt = 0u32;
    loop {
        match provider.complete(system, prompt).await {
            Ok(completion) => return Ok(completion),
            Err(CoreError::LlmError { retryable: true, message }) if attempt < max_retries => {
                attempt += 1;
                let backoff = Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)));
                warn!(
                    "LLM call failed (attempt {}/{}): {}; retrying in {:?}",
                    attempt, max_retries, message, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Scripted provider (tests) ──────────────────────────────────────────

/// Deterministic provider for engine tests: returns canned responses in
/// order and records every prompt it saw.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn prompt_at(&self, index: usize) -> Option<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .get(index)
            .map(|(_, p)| p.clone())
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, system: &str, prompt: &str) -> CoreResult<Completion> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((system.to_string(), prompt.to_string()));
        let next = self.responses.lock().expect("responses lock").pop_front();
        match next {
            Some(text) => Ok(Completion {
                prompt_tokens: Some(prompt.len() / 4),
                completion_tokens: Some(text.len() / 4),
                text,
            }),
            None => Err(CoreError::LlmError {
                retryable: false,
                message: "scripted provider exhausted".to_string(),
            }),
        }
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

// ── Cost accounting ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub calls: Vec<UsageRecord>,
}

impl CostTracker {
    pub fn record(&mut self, provider: &dyn LlmProvider, completion: &Completion) {
        self.calls.push(UsageRecord {
            provider: provider.provider_id().to_string(),
            model: provider.model().to_string(),
            prompt_tokens: completion.prompt_tokens.unwrap_or(0),
            completion_tokens: completion.completion_tokens.unwrap_or(0),
        });
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.calls
            .iter()
            .map(|c| c.prompt_tokens + c.completion_tokens)
            .sum()
    }

    /// USD-equivalent estimate for the stop-condition comparison only; the
    /// raw token counts are the durable record.
    pub fn estimated_usd(&self, usd_per_1k_tokens: f64) -> f64 {
        self.total_tokens() as f64 / 1000.0 * usd_per_1k_tokens
    }
}
