use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for oracle calls: exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor for randomizing retry delays (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for retry attempt with exponential backoff and jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = Duration::from_millis(self.base_delay_ms);
        let exponential_delay = base_delay * 2_u32.saturating_pow(attempt);
        let max_delay = Duration::from_millis(self.max_delay_ms);

        let delay = exponential_delay.min(max_delay);

        // Jitter prevents thundering herd against the provider.
        if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter = rng.gen_range(0.0..=self.jitter_factor);
            let jitter_ms = (delay.as_millis() as f64 * jitter) as u64;
            delay + Duration::from_millis(jitter_ms)
        } else {
            delay
        }
    }
}

/// Configuration for an OpenAI-compatible oracle endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub chat_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl OracleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = model.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Base URL must start with http:// or https://".to_string());
        }

        if self.chat_model.is_empty() {
            return Err("Chat model cannot be empty".to_string());
        }

        if self.embedding_model.is_empty() {
            return Err("Embedding model cannot be empty".to_string());
        }

        if self.timeout.is_zero() {
            return Err("Timeout must be non-zero".to_string());
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err("Jitter factor must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}
