//! Core data model: test cases, derived planning profiles, and the
//! agent-level session profile.

use oracle::Modality;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// How strongly a scenario matters to the suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Author-supplied modality preference for a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModalityHint {
    #[default]
    Auto,
    Voice,
    Chat,
}

/// One behavioral test scenario. Immutable input to planning; authored
/// outside the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: Uuid,
    pub name: String,
    /// What the simulated caller does, in natural language.
    pub scenario: String,
    /// What the agent is expected to do in response.
    pub expected_outcome: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub modality_hint: ModalityHint,
}

impl TestCase {
    pub fn new(
        name: impl Into<String>,
        scenario: impl Into<String>,
        expected_outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            scenario: scenario.into(),
            expected_outcome: expected_outcome.into(),
            category: None,
            priority: Priority::default(),
            modality_hint: ModalityHint::default(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_modality_hint(mut self, hint: ModalityHint) -> Self {
        self.modality_hint = hint;
        self
    }
}

/// Ordering/compatibility metadata derived per test case by the scenario
/// classifier. Lives for one planning pass only; never persisted beyond
/// the plan that used it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseProfile {
    pub test_case_id: Uuid,
    /// 1-10, lower = earlier in a natural conversation.
    pub natural_order_score: u8,
    /// Known to terminate the session; forced to the final slot.
    pub must_be_last: bool,
    pub can_be_first: bool,
    /// 0-100 likelihood that running this case ends the session.
    pub end_session_probability: u8,
    pub compatible_with: HashSet<Uuid>,
    pub incompatible_with: HashSet<Uuid>,
    pub requires_prior_context: bool,
    pub prior_context: Option<String>,
    pub recommended_modality: Modality,
    pub failure_recovery_hints: Vec<String>,
}

impl TestCaseProfile {
    /// Conservative default used when classification fails for a chunk:
    /// middle of the order range, low end-session risk, modality from the
    /// author's explicit hint when present, else chat.
    pub fn conservative(case: &TestCase) -> Self {
        let recommended_modality = match case.modality_hint {
            ModalityHint::Voice => Modality::Voice,
            ModalityHint::Chat | ModalityHint::Auto => Modality::Chat,
        };

        Self {
            test_case_id: case.id,
            natural_order_score: 5,
            must_be_last: false,
            can_be_first: true,
            end_session_probability: 10,
            compatible_with: HashSet::new(),
            incompatible_with: HashSet::new(),
            requires_prior_context: false,
            prior_context: None,
            recommended_modality,
            failure_recovery_hints: Vec::new(),
        }
    }

    /// Clamp scores into their documented ranges after parsing untrusted
    /// oracle output.
    pub fn clamped(mut self) -> Self {
        self.natural_order_score = self.natural_order_score.clamp(1, 10);
        self.end_session_probability = self.end_session_probability.min(100);
        self
    }
}

/// Global session constraints derived from the agent's behavior
/// description. Computed once per agent-configuration version and cached
/// keyed by the behavior description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProfile {
    /// Ordered phase labels, e.g. opening / main / closing.
    pub phases: Vec<String>,
    /// Natural-language descriptions of what ends a session.
    pub end_triggers: Vec<String>,
    pub max_batch_size: usize,
    /// Rough ceiling on how many turns one session stays coherent for.
    pub max_reasonable_turns: usize,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            phases: vec![
                "opening".to_string(),
                "main".to_string(),
                "closing".to_string(),
            ],
            end_triggers: vec!["caller says goodbye".to_string()],
            max_batch_size: 5,
            max_reasonable_turns: 20,
        }
    }
}
