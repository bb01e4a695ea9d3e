use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::syntactic::{SyntacticInterpreter, parse_lenient};
use super::{Interpretation, OutputInterpreter};
use crate::core::config::InterpreterConfig;

pub const INVALID_JSON_SENTINEL: &str = "INVALID_JSON";

const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

const ECHO_INSTRUCTION: &str = "You are a strict JSON echo tool. Return ONLY the exact JSON string \
from the user's last message, byte-for-byte identical. Do not add, remove, reorder, normalize, \
pretty-print, wrap, or fix anything. No extra keys, no metadata, no commentary, no code fences. \
If the input does not contain valid JSON, output exactly: INVALID_JSON";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Client for the local text-normalization service (Ollama chat API).
pub struct NormalizerClient {
    base_url: String,
    model: String,
    client: Client,
}

impl NormalizerClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            client,
        }
    }

    pub fn from_config(config: &InterpreterConfig) -> Self {
        Self::new(
            config.normalizer_url.clone(),
            config.normalizer_model.clone(),
            Duration::from_secs(config.normalizer_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Asks the service to echo the JSON embedded in `raw`.
    pub async fn normalize(&self, raw: &str) -> Result<String> {
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: ECHO_INSTRUCTION,
                },
                ChatMessage {
                    role: "user",
                    content: raw,
                },
            ],
            stream: false,
        };
        let res = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Normalizer error {}: {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: ChatResponse = res.json().await?;
        Ok(parsed.message.content)
    }

    /// Liveness probe: `GET /api/tags` answering 200 within five seconds.
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(LIVENESS_TIMEOUT)
            .send()
            .await
        {
            Ok(res) => res.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!("Normalizer not available: {}", e);
                false
            }
        }
    }
}

/// Delegates extraction to the normalizer and falls back to syntactic
/// extraction over the raw text whenever the service cannot help.
pub struct DelegatedInterpreter {
    client: NormalizerClient,
}

impl DelegatedInterpreter {
    pub fn new(client: NormalizerClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &NormalizerClient {
        &self.client
    }
}

#[async_trait]
impl OutputInterpreter for DelegatedInterpreter {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn interpret(&self, raw: &str) -> Interpretation {
        let echo = match self.client.normalize(raw).await {
            Ok(echo) => echo,
            Err(e) => {
                warn!("Normalizer unavailable, using syntactic extraction: {}", e);
                return SyntacticInterpreter::interpret_text(raw);
            }
        };

        let echo = echo.trim();
        if echo == INVALID_JSON_SENTINEL {
            debug!("Normalizer found no JSON in agent output");
            return SyntacticInterpreter::interpret_text(raw);
        }
        match parse_lenient(echo) {
            Some(json @ (Value::Object(_) | Value::Array(_))) => Interpretation::from_json(json, raw),
            _ => {
                debug!("Normalizer echo is not JSON, using syntactic extraction");
                SyntacticInterpreter::interpret_text(raw)
            }
        }
    }
}
