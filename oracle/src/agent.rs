//! Provider-shaped agent configuration and its normalized view.
//!
//! Voice-agent platforms each describe an agent with their own JSON shape.
//! The core never inspects provider-shaped payloads directly: every variant
//! is normalized at this boundary into [`AgentView`], the agent-agnostic
//! view the planner and executor consume.

use serde::{Deserialize, Serialize};

/// Agent configuration as stored per provider, tagged by provider id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum AgentConfig {
    Elevenlabs {
        agent_id: String,
        /// The agent's system prompt as ElevenLabs stores it.
        prompt: String,
        first_message: Option<String>,
        #[serde(default)]
        knowledge_base: serde_json::Value,
    },
    Vapi {
        assistant_id: String,
        model_prompt: String,
        first_message: Option<String>,
        #[serde(default)]
        voice: serde_json::Value,
    },
    Retell {
        agent_id: String,
        general_prompt: String,
        begin_message: Option<String>,
    },
    /// A plain chat agent with no voice platform behind it.
    Custom {
        name: String,
        system_prompt: String,
        greeting: Option<String>,
    },
}

/// Agent-agnostic view consumed by the core: prompt text, greeting, and
/// channel capabilities. This is the only agent shape the planner,
/// executor, and profile builder ever see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub name: String,
    /// The behavior description fed to classification and session
    /// profiling; for every current provider this is the system prompt.
    pub behavior_description: String,
    pub first_message: Option<String>,
    pub supports_voice: bool,
    pub supports_chat: bool,
}

impl AgentConfig {
    pub fn provider_id(&self) -> &'static str {
        match self {
            AgentConfig::Elevenlabs { .. } => "elevenlabs",
            AgentConfig::Vapi { .. } => "vapi",
            AgentConfig::Retell { .. } => "retell",
            AgentConfig::Custom { .. } => "custom",
        }
    }

    /// Normalize into the core's agent-agnostic view.
    pub fn view(&self) -> AgentView {
        match self {
            AgentConfig::Elevenlabs {
                agent_id,
                prompt,
                first_message,
                ..
            } => AgentView {
                name: format!("elevenlabs/{agent_id}"),
                behavior_description: prompt.clone(),
                first_message: first_message.clone(),
                supports_voice: true,
                supports_chat: true,
            },
            AgentConfig::Vapi {
                assistant_id,
                model_prompt,
                first_message,
                ..
            } => AgentView {
                name: format!("vapi/{assistant_id}"),
                behavior_description: model_prompt.clone(),
                first_message: first_message.clone(),
                supports_voice: true,
                supports_chat: false,
            },
            AgentConfig::Retell {
                agent_id,
                general_prompt,
                begin_message,
            } => AgentView {
                name: format!("retell/{agent_id}"),
                behavior_description: general_prompt.clone(),
                first_message: begin_message.clone(),
                supports_voice: true,
                supports_chat: false,
            },
            AgentConfig::Custom {
                name,
                system_prompt,
                greeting,
            } => AgentView {
                name: name.clone(),
                behavior_description: system_prompt.clone(),
                first_message: greeting.clone(),
                supports_voice: false,
                supports_chat: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_deserialization() {
        let json = r#"{
            "provider": "elevenlabs",
            "agent_id": "agent_1",
            "prompt": "You are a dental receptionist.",
            "first_message": "Hi, thanks for calling!"
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.provider_id(), "elevenlabs");

        let view = config.view();
        assert_eq!(view.name, "elevenlabs/agent_1");
        assert!(view.supports_voice);
        assert_eq!(view.first_message.as_deref(), Some("Hi, thanks for calling!"));
    }

    #[test]
    fn test_custom_agent_is_chat_only() {
        let config = AgentConfig::Custom {
            name: "support-bot".to_string(),
            system_prompt: "Answer support questions.".to_string(),
            greeting: None,
        };
        let view = config.view();
        assert!(view.supports_chat);
        assert!(!view.supports_voice);
        assert_eq!(view.behavior_description, "Answer support questions.");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let json = r#"{"provider": "acme", "agent_id": "x"}"#;
        assert!(serde_json::from_str::<AgentConfig>(json).is_err());
    }
}
