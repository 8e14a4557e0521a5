//! Maintenance tips attached to new reservations.
//!
//! The engine builds one immutable [`RecommendationRequest`] per reservation
//! and asks a [`Recommender`]. Any failure is the caller's cue to use
//! [`fallback_text`]; retries happen inside the provider client.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Service, Vehicle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendationRequest {
    pub brand: String,
    pub model: String,
    pub production_year: i32,
    pub service_name: String,
}

impl RecommendationRequest {
    pub fn new(vehicle: &Vehicle, service: &Service) -> Self {
        Self {
            brand: vehicle.brand.clone(),
            model: vehicle.model.clone(),
            production_year: vehicle.production_year,
            service_name: service.name.clone(),
        }
    }

    pub fn prompt(&self) -> String {
        format!(
            "Give one short maintenance tip (max 2 sentences) for a {} {} {} booked for: {}.",
            self.production_year, self.brand, self.model, self.service_name
        )
    }
}

/// Deterministic text used whenever the provider cannot answer. Never empty.
pub fn fallback_text(request: &RecommendationRequest) -> String {
    format!(
        "While your {} {} ({}) is in for {}, ask the technician to look over brakes and fluid levels.",
        request.brand, request.model, request.production_year, request.service_name
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecommendError {
    #[error("recommender is not configured")]
    Disabled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("provider answered with status {0}")]
    Status(u16),
    #[error("could not decode provider response: {0}")]
    Decode(String),
    #[error("provider returned no text")]
    Empty,
}

impl RecommendError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RecommendError::Transport(_) | RecommendError::Timeout => true,
            RecommendError::Status(code) => *code == 429 || *code >= 500,
            RecommendError::Disabled | RecommendError::Decode(_) | RecommendError::Empty => false,
        }
    }
}

#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(&self, request: &RecommendationRequest) -> Result<String, RecommendError>;
}

/// Used when no provider is configured: every reservation gets the fallback.
pub struct DisabledRecommender;

#[async_trait]
impl Recommender for DisabledRecommender {
    async fn recommend(&self, _request: &RecommendationRequest) -> Result<String, RecommendError> {
        Err(RecommendError::Disabled)
    }
}

// ── Retry policy ─────────────────────────────────────────────────

/// Bounded retries with exponential backoff: `base, 2*base, 4*base, ...`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << shift))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, RecommendError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, RecommendError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    debug!("recommendation attempt {attempt} failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ── HTTP provider ────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

const SYSTEM_PROMPT: &str = "You are a car service advisor. Answer in plain text.";
const MAX_TOKENS: u32 = 120;

/// Client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpRecommender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    retry: RetryPolicy,
}

impl HttpRecommender {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, RecommendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecommendError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            retry,
        })
    }

    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<String, RecommendError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(RecommendError::Status(status.as_u16()));
        }
        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                RecommendError::Timeout
            } else {
                RecommendError::Decode(e.to_string())
            }
        })?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|t| t.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            Err(RecommendError::Empty)
        } else {
            Ok(text)
        }
    }
}

fn classify(e: reqwest::Error) -> RecommendError {
    if e.is_timeout() {
        RecommendError::Timeout
    } else {
        RecommendError::Transport(e.to_string())
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    async fn recommend(&self, request: &RecommendationRequest) -> Result<String, RecommendError> {
        let prompt = request.prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: MAX_TOKENS,
        };
        self.retry.run(|_| self.attempt(&body)).await
    }
}
