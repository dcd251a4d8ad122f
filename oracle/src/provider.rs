use crate::types::CompletionRequest;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed oracle output: {message}")]
    MalformedOutput { message: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed")]
    Authentication,

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

pub type OracleResult<T> = Result<T, OracleError>;

/// Chat-completion-style text/JSON oracle.
///
/// This is the single delegation seam for every "ask a language model"
/// step in the harness: scenario classification, delegated batch grouping,
/// and transcript judging. Implementations own transport, retries, and
/// provider-specific payload shapes.
#[async_trait]
pub trait TextOracle: Send + Sync {
    /// Run one completion and return the raw response text.
    async fn complete(&self, request: CompletionRequest) -> OracleResult<String>;

    /// Run one completion and parse the response as JSON.
    ///
    /// The default implementation strips markdown code fences before
    /// parsing, since chat models routinely wrap JSON in ```json blocks.
    async fn complete_json(&self, request: CompletionRequest) -> OracleResult<serde_json::Value> {
        let raw = self.complete(request).await?;
        let stripped = strip_code_fences(&raw);
        serde_json::from_str(stripped).map_err(|e| OracleError::MalformedOutput {
            message: format!("expected JSON, got parse error: {e}"),
        })
    }

    async fn health_check(&self) -> OracleResult<()>;

    fn provider_name(&self) -> &'static str;
}

/// Batched embedding oracle.
///
/// Returns one vector per input text, all of the same dimensionality
/// within a single call. The caller treats vectors as opaque.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> OracleResult<Vec<Vec<f32>>>;

    fn embedder_name(&self) -> &'static str;
}

/// Strip a single leading/trailing markdown code fence, if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedOracle {
        reply: String,
    }

    #[async_trait]
    impl TextOracle for CannedOracle {
        async fn complete(&self, _request: CompletionRequest) -> OracleResult<String> {
            Ok(self.reply.clone())
        }

        async fn health_check(&self) -> OracleResult<()> {
            Ok(())
        }

        fn provider_name(&self) -> &'static str {
            "canned"
        }
    }

    #[tokio::test]
    async fn test_complete_json_plain() {
        let oracle = CannedOracle {
            reply: r#"{"ok": true}"#.to_string(),
        };
        let value = oracle
            .complete_json(CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert_eq!(value["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_complete_json_fenced() {
        let oracle = CannedOracle {
            reply: "```json\n{\"n\": 3}\n```".to_string(),
        };
        let value = oracle
            .complete_json(CompletionRequest::new("hi"))
            .await
            .unwrap();
        assert_eq!(value["n"], serde_json::json!(3));
    }

    #[tokio::test]
    async fn test_complete_json_garbage_is_malformed() {
        let oracle = CannedOracle {
            reply: "sorry, I can't do that".to_string(),
        };
        let err = oracle
            .complete_json(CompletionRequest::new("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::MalformedOutput { .. }));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n[1,2]\n```"), "[1,2]");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
    }
}
