pub mod agent;
pub mod config;
pub mod openai;
pub mod provider;
pub mod session;
pub mod types;

pub use agent::{AgentConfig, AgentView};
pub use config::{OracleConfig, RetryPolicy};
pub use openai::OpenAiCompatProvider;
pub use provider::{Embedder, OracleError, OracleResult, TextOracle};
pub use session::{
    AgentSession, Modality, SessionArtifacts, SessionError, SessionFactory, SessionResult,
    TurnReply,
};
pub use types::CompletionRequest;

pub mod prelude {
    pub use crate::agent::*;
    pub use crate::config::*;
    pub use crate::openai::*;
    pub use crate::provider::*;
    pub use crate::session::*;
    pub use crate::types::*;
}
