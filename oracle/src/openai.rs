use crate::config::OracleConfig;
use crate::provider::{Embedder, OracleError, OracleResult, TextOracle};
use crate::types::CompletionRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// OpenAI-compatible chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<WireResponseFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

/// OpenAI-compatible embeddings request/response
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Client for any OpenAI-compatible endpoint, implementing both the text
/// oracle and the batched embedder. One instance is shared across the
/// classifier, planner, judge, and consistency analyzer.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: OracleConfig,
}

impl OpenAiCompatProvider {
    pub fn new(config: OracleConfig) -> OracleResult<Self> {
        config
            .validate()
            .map_err(|msg| OracleError::InvalidConfig { message: msg })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| OracleError::Unknown {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { client, config })
    }

    pub fn with_default_config() -> OracleResult<Self> {
        Self::new(OracleConfig::default())
    }

    fn handle_http_error(err: reqwest::Error) -> OracleError {
        if err.is_timeout() {
            OracleError::ServiceUnavailable {
                message: "Request timeout".to_string(),
            }
        } else if err.is_connect() {
            OracleError::ServiceUnavailable {
                message: "Cannot connect to oracle endpoint".to_string(),
            }
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                503 => OracleError::ServiceUnavailable {
                    message: "Oracle service unavailable".to_string(),
                },
                401 | 403 => OracleError::Authentication,
                429 => OracleError::RateLimit,
                _ => OracleError::Network(err),
            }
        } else {
            OracleError::Network(err)
        }
    }

    fn retryable(err: &OracleError) -> bool {
        matches!(
            err,
            OracleError::ServiceUnavailable { .. } | OracleError::RateLimit | OracleError::Network(_)
        )
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn complete_once(&self, request: &CompletionRequest) -> OracleResult<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        let wire_request = WireChatRequest {
            model: self.config.chat_model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then(|| WireResponseFormat {
                format_type: "json_object".to_string(),
            }),
        };

        let url = format!("{}/v1/chat/completions", self.config.base_url);

        let response = self
            .authorized(self.client.post(&url))
            .json(&wire_request)
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => OracleError::Authentication,
                429 => OracleError::RateLimit,
                503 => OracleError::ServiceUnavailable {
                    message: format!("Oracle API error ({}): {}", status, error_text),
                },
                _ => OracleError::Unknown {
                    message: format!("Oracle API error ({}): {}", status, error_text),
                },
            });
        }

        let wire_response: WireChatResponse =
            response.json().await.map_err(Self::handle_http_error)?;

        let choice = wire_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| OracleError::MalformedOutput {
                message: "response contained no choices".to_string(),
            })?;

        Ok(choice.message.content)
    }
}

#[async_trait]
impl TextOracle for OpenAiCompatProvider {
    async fn complete(&self, request: CompletionRequest) -> OracleResult<String> {
        debug!("Starting completion with model: {}", self.config.chat_model);

        let mut attempt = 0;
        loop {
            match self.complete_once(&request).await {
                Ok(text) => {
                    info!("Completion finished ({} chars)", text.len());
                    return Ok(text);
                }
                Err(err) if Self::retryable(&err) && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        "Completion attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn health_check(&self) -> OracleResult<()> {
        debug!("Performing oracle health check");

        let url = format!("{}/v1/models", self.config.base_url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        if response.status().is_success() {
            info!("Oracle health check passed");
            Ok(())
        } else {
            error!("Oracle health check failed: {}", response.status());
            Err(OracleError::ServiceUnavailable {
                message: format!("Health check failed: {}", response.status()),
            })
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai-compat"
    }
}

#[async_trait]
impl Embedder for OpenAiCompatProvider {
    async fn embed(&self, texts: &[String]) -> OracleResult<Vec<Vec<f32>>> {
        debug!("Embedding {} texts", texts.len());

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let wire_request = WireEmbeddingRequest {
            model: self.config.embedding_model.clone(),
            input: texts.to_vec(),
        };

        let url = format!("{}/v1/embeddings", self.config.base_url);

        let response = self
            .authorized(self.client.post(&url))
            .json(&wire_request)
            .send()
            .await
            .map_err(Self::handle_http_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(OracleError::Unknown {
                message: format!("Embeddings API error ({}): {}", status, error_text),
            });
        }

        let wire_response: WireEmbeddingResponse =
            response.json().await.map_err(Self::handle_http_error)?;

        // Providers are allowed to reorder; restore input order by index.
        let mut data = wire_response.data;
        data.sort_by_key(|d| d.index);

        if data.len() != texts.len() {
            return Err(OracleError::MalformedOutput {
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    data.len()
                ),
            });
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn embedder_name(&self) -> &'static str {
        "openai-compat"
    }
}
