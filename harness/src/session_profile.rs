//! Session profile builder: derives global session constraints from the
//! agent's behavior description, with an oracle-backed analysis and a
//! cache keyed by the description (one profile per agent-configuration
//! version).

use crate::testcase::SessionProfile;
use oracle::{CompletionRequest, TextOracle};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PROFILE_SYSTEM_PROMPT: &str = "You analyze a conversational agent's system \
prompt and describe the structure of a session with it. Respond with JSON only.";

#[derive(Debug, Deserialize)]
struct ProposedSessionProfile {
    #[serde(default)]
    phases: Vec<String>,
    #[serde(default)]
    end_triggers: Vec<String>,
    #[serde(default)]
    max_batch_size: Option<usize>,
    #[serde(default)]
    max_reasonable_turns: Option<usize>,
}

pub struct SessionProfileBuilder {
    oracle: Arc<dyn TextOracle>,
    cache: Mutex<HashMap<String, SessionProfile>>,
}

impl SessionProfileBuilder {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self {
            oracle,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build (or fetch from cache) the session profile for an agent
    /// behavior description. Falls back to [`SessionProfile::default`]
    /// when the oracle fails; the fallback is cached too, so a flaky
    /// oracle cannot produce two different profiles for one agent.
    pub async fn build(&self, behavior_description: &str) -> SessionProfile {
        if let Some(cached) = self.cache.lock().await.get(behavior_description) {
            debug!("Session profile cache hit");
            return cached.clone();
        }

        let profile = self.build_uncached(behavior_description).await;
        self.cache
            .lock()
            .await
            .insert(behavior_description.to_string(), profile.clone());
        profile
    }

    async fn build_uncached(&self, behavior_description: &str) -> SessionProfile {
        let prompt = format!(
            "Agent behavior description:\n{behavior_description}\n\n\
             Return a JSON object: {{\"phases\": [ordered phase labels], \
             \"end_triggers\": [what ends a session], \
             \"max_batch_size\": max scenarios one session can cover, \
             \"max_reasonable_turns\": max turns the session stays coherent}}"
        );

        let request = CompletionRequest::new(prompt)
            .with_system(PROFILE_SYSTEM_PROMPT)
            .with_temperature(0.2)
            .expect_json();

        match self.oracle.complete_json(request).await {
            Ok(value) => match serde_json::from_value::<ProposedSessionProfile>(value) {
                Ok(proposed) => normalize(proposed),
                Err(err) => {
                    warn!("Session profile output unusable ({err}), using default");
                    SessionProfile::default()
                }
            },
            Err(err) => {
                warn!("Session profile oracle failed ({err}), using default");
                SessionProfile::default()
            }
        }
    }
}

fn normalize(proposed: ProposedSessionProfile) -> SessionProfile {
    let default = SessionProfile::default();
    SessionProfile {
        phases: if proposed.phases.is_empty() {
            default.phases
        } else {
            proposed.phases
        },
        end_triggers: if proposed.end_triggers.is_empty() {
            default.end_triggers
        } else {
            proposed.end_triggers
        },
        max_batch_size: proposed
            .max_batch_size
            .filter(|&n| n > 0)
            .unwrap_or(default.max_batch_size),
        max_reasonable_turns: proposed
            .max_reasonable_turns
            .filter(|&n| n > 0)
            .unwrap_or(default.max_reasonable_turns),
    }
}
