use serde::{Deserialize, Serialize};

/// A single completion request against a text oracle.
///
/// Intentionally smaller than a full chat API surface: every delegation
/// step in the harness is one system prompt plus one user prompt, with no
/// multi-turn history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON-object response where supported.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
            json_mode: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = CompletionRequest::new("classify these")
            .with_system("You are a test planner")
            .with_temperature(0.2)
            .with_max_tokens(2000)
            .expect_json();

        assert_eq!(request.prompt, "classify these");
        assert_eq!(request.system.as_deref(), Some("You are a test planner"));
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(2000));
        assert!(request.json_mode);
    }

    #[test]
    fn test_serialization_round_trip() {
        let request = CompletionRequest::new("hello").with_temperature(0.7);
        let json = serde_json::to_string(&request).unwrap();
        let back: CompletionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.prompt, request.prompt);
        assert_eq!(back.temperature, request.temperature);
    }
}
