use crate::agent::AgentView;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution channel for a batch: a live phone-style voice call or a
/// text chat session. Switching channel mid-session is not physically
/// meaningful, so modality is decided per batch, never per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Voice,
    Chat,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Voice => write!(f, "voice"),
            Modality::Chat => write!(f, "chat"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to open session: {message}")]
    OpenFailed { message: String },

    #[error("Turn failed: {message}")]
    TurnFailed { message: String },

    #[error("Session closed unexpectedly: {message}")]
    ClosedUnexpectedly { message: String },

    #[error("Modality {modality} not supported by this agent")]
    UnsupportedModality { modality: Modality },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// The agent's reply to a single turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReply {
    pub text: String,
    /// Raw audio for the reply, when the session is a voice call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
}

impl TurnReply {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio: None,
        }
    }
}

/// Artifacts handed back when a session is torn down.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionArtifacts {
    /// Reference (URL or storage key) to the full-session recording.
    pub audio_ref: Option<String>,
    /// Provider-side transcript, when the provider produces one.
    pub raw_transcript: Option<String>,
}

/// One live conversation with the agent under test.
///
/// A session is single-threaded by nature: a conversation cannot have
/// concurrent turns, so `send` takes `&mut self` and callers drive turns
/// strictly in order.
#[async_trait]
pub trait AgentSession: Send {
    async fn send(&mut self, text: &str) -> SessionResult<TurnReply>;

    /// Tear the session down and collect any artifacts. Must be safe to
    /// call after a failed turn.
    async fn close(&mut self) -> SessionResult<SessionArtifacts>;
}

/// Opens agent sessions. One session per batch execution and per
/// consistency iteration; implementations own provider transport.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        agent: &AgentView,
        modality: Modality,
    ) -> SessionResult<Box<dyn AgentSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modality_serde() {
        assert_eq!(serde_json::to_string(&Modality::Voice).unwrap(), "\"voice\"");
        let back: Modality = serde_json::from_str("\"chat\"").unwrap();
        assert_eq!(back, Modality::Chat);
    }

    #[test]
    fn test_turn_reply_text_only_skips_audio() {
        let reply = TurnReply::text_only("hello");
        let json = serde_json::to_string(&reply).unwrap();
        assert!(!json.contains("audio"));
    }
}
