//! Remote model API client
//!
//! Chat-completions style HTTP client. Timeouts are enforced by racing the
//! request against a timer; the abandoned request may keep running upstream,
//! which is accepted as a bounded leak rather than guarded against.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ModelConfig;
use crate::error::{Result, VigilError};

/// Sends a prompt to a remote language model and returns its raw text.
///
/// May fail with `Auth` (401), `RateLimited` (429), `Server` (5xx) or
/// `Timeout`; the callers feed those into the per-symbol ledger.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn send(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// HTTP-backed model client
pub struct HttpModelClient {
    config: ModelConfig,
    http: Client,
}

impl HttpModelClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VigilError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { config, http })
    }

    /// Create from environment variables (`VIGIL_MODEL__API_KEY` etc. are
    /// handled by config layering; this reads the bare names directly).
    pub fn from_env() -> Result<Self> {
        let config = ModelConfig {
            api_key: std::env::var("MODEL_API_KEY").unwrap_or_default(),
            base_url: std::env::var("MODEL_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model: std::env::var("MODEL_NAME").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            timeout_secs: 30,
        };
        Self::new(config)
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn send(&self, prompt: &str) -> Result<String> {
        // Missing key is a configuration error, fatal to this call
        if !self.is_configured() {
            return Err(VigilError::MissingConfig("model API key not set".to_string()));
        }

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: Some(0.2),
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        debug!(model = %self.config.model, "model request");

        let send = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send();

        let response = match tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            send,
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => {
                return Err(VigilError::Timeout(self.config.timeout_secs))
            }
            Ok(Err(e)) => return Err(VigilError::Http(e)),
            Err(_) => return Err(VigilError::Timeout(self.config.timeout_secs)),
        };

        match response.status() {
            StatusCode::UNAUTHORIZED => {
                return Err(VigilError::Auth("model API rejected credentials".to_string()))
            }
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(VigilError::RateLimited("model API rate limit".to_string()))
            }
            status if status.is_server_error() => {
                return Err(VigilError::Server(format!("model API returned {}", status)))
            }
            status if !status.is_success() => {
                warn!(%status, "unexpected model API status");
                return Err(VigilError::Server(format!("model API returned {}", status)));
            }
            _ => {}
        }

        let parsed: ChatResponse = response.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| VigilError::MalformedResponse("empty choices".to_string()))?;

        Ok(content)
    }
}
