//! Scenario classifier: derives ordering/compatibility metadata per test
//! case by delegating to a text oracle in chunks.
//!
//! Chunking respects the oracle's input-size limits. A case's profile does
//! not depend on which chunk classified it, with one documented exception:
//! `compatible_with`/`incompatible_with` relations are resolved only
//! within the same chunk, so cross-chunk incompatibility goes undetected.
//! Classification failure never blocks planning: a failed chunk falls back
//! to conservative defaults for its cases.

use crate::testcase::{SessionProfile, TestCase, TestCaseProfile};
use oracle::{CompletionRequest, TextOracle};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_CHUNK_SIZE: usize = 10;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You are a conversational test planner. \
For each test scenario, assess where it naturally belongs in a conversation, \
whether it is likely to end the session, and which other scenarios it can or \
cannot share a session with. Respond with JSON only.";

/// Oracle-proposed profile for one case, before validation.
#[derive(Debug, Deserialize)]
struct ProposedProfile {
    test_case_id: Uuid,
    #[serde(default = "default_order_score")]
    natural_order_score: u8,
    #[serde(default)]
    must_be_last: bool,
    #[serde(default = "default_true")]
    can_be_first: bool,
    #[serde(default = "default_end_probability")]
    end_session_probability: u8,
    #[serde(default)]
    compatible_with: Vec<Uuid>,
    #[serde(default)]
    incompatible_with: Vec<Uuid>,
    #[serde(default)]
    requires_prior_context: bool,
    #[serde(default)]
    prior_context: Option<String>,
    #[serde(default)]
    recommended_modality: Option<oracle::Modality>,
    #[serde(default)]
    failure_recovery_hints: Vec<String>,
}

fn default_order_score() -> u8 {
    5
}

fn default_end_probability() -> u8 {
    10
}

fn default_true() -> bool {
    true
}

pub struct ScenarioClassifier {
    oracle: Arc<dyn TextOracle>,
    chunk_size: usize,
}

impl ScenarioClassifier {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self {
            oracle,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Classify every case, returning exactly one profile per input id in
    /// input order. Never drops or duplicates ids.
    pub async fn classify(
        &self,
        cases: &[TestCase],
        session_profile: &SessionProfile,
    ) -> Vec<TestCaseProfile> {
        let mut profiles = Vec::with_capacity(cases.len());

        for chunk in cases.chunks(self.chunk_size) {
            profiles.extend(self.classify_chunk(chunk, session_profile).await);
        }

        debug_assert_eq!(profiles.len(), cases.len());
        info!("Classified {} test cases", profiles.len());
        profiles
    }

    async fn classify_chunk(
        &self,
        chunk: &[TestCase],
        session_profile: &SessionProfile,
    ) -> Vec<TestCaseProfile> {
        let request = CompletionRequest::new(build_chunk_prompt(chunk, session_profile))
            .with_system(CLASSIFIER_SYSTEM_PROMPT)
            .with_temperature(0.2)
            .expect_json();

        let proposals = match self.oracle.complete_json(request).await {
            Ok(value) => match parse_proposals(&value) {
                Ok(proposals) => proposals,
                Err(message) => {
                    warn!("Classifier output unusable ({message}), using conservative defaults");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!("Classifier oracle failed ({err}), using conservative defaults");
                Vec::new()
            }
        };

        let chunk_ids: HashSet<Uuid> = chunk.iter().map(|c| c.id).collect();

        chunk
            .iter()
            .map(|case| {
                proposals
                    .iter()
                    .find(|p| p.test_case_id == case.id)
                    .map(|p| resolve_proposal(case, p, &chunk_ids))
                    .unwrap_or_else(|| {
                        debug!("No proposal for '{}', using conservative default", case.name);
                        TestCaseProfile::conservative(case)
                    })
            })
            .collect()
    }
}

fn build_chunk_prompt(chunk: &[TestCase], session_profile: &SessionProfile) -> String {
    let mut prompt = String::from("Session phases for this agent: ");
    prompt.push_str(&session_profile.phases.join(" -> "));
    prompt.push_str("\nSession-ending triggers: ");
    prompt.push_str(&session_profile.end_triggers.join("; "));
    prompt.push_str("\n\nTest scenarios:\n");

    for case in chunk {
        prompt.push_str(&format!(
            "- id: {}\n  name: {}\n  scenario: {}\n  expected: {}\n",
            case.id, case.name, case.scenario, case.expected_outcome
        ));
    }

    prompt.push_str(
        "\nFor every scenario above, return a JSON object:\n\
         {\"profiles\": [{\"test_case_id\": \"<id>\", \"natural_order_score\": 1-10 \
         (lower = earlier in a natural conversation), \"must_be_last\": bool, \
         \"can_be_first\": bool, \"end_session_probability\": 0-100, \
         \"compatible_with\": [ids], \"incompatible_with\": [ids], \
         \"requires_prior_context\": bool, \"prior_context\": string or null, \
         \"recommended_modality\": \"voice\" or \"chat\", \
         \"failure_recovery_hints\": [strings]}]}",
    );

    prompt
}

/// Accept either `{"profiles": [...]}` or a bare array.
fn parse_proposals(value: &serde_json::Value) -> Result<Vec<ProposedProfile>, String> {
    let array = value
        .get("profiles")
        .unwrap_or(value)
        .as_array()
        .ok_or_else(|| "expected a profiles array".to_string())?;

    array
        .iter()
        .map(|item| serde_json::from_value(item.clone()).map_err(|e| e.to_string()))
        .collect()
}

fn resolve_proposal(
    case: &TestCase,
    proposal: &ProposedProfile,
    chunk_ids: &HashSet<Uuid>,
) -> TestCaseProfile {
    let fallback = TestCaseProfile::conservative(case);

    // Compatibility relations only count within the chunk the oracle saw;
    // ids it invented are discarded.
    let in_chunk = |ids: &[Uuid]| -> HashSet<Uuid> {
        ids.iter()
            .copied()
            .filter(|id| *id != case.id && chunk_ids.contains(id))
            .collect()
    };

    TestCaseProfile {
        test_case_id: case.id,
        natural_order_score: proposal.natural_order_score,
        must_be_last: proposal.must_be_last,
        can_be_first: proposal.can_be_first,
        end_session_probability: proposal.end_session_probability,
        compatible_with: in_chunk(&proposal.compatible_with),
        incompatible_with: in_chunk(&proposal.incompatible_with),
        requires_prior_context: proposal.requires_prior_context,
        prior_context: proposal.prior_context.clone(),
        recommended_modality: proposal
            .recommended_modality
            .unwrap_or(fallback.recommended_modality),
        failure_recovery_hints: proposal.failure_recovery_hints.clone(),
    }
    .clamped()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::ModalityHint;
    use async_trait::async_trait;
    use oracle::{OracleError, OracleResult};

    struct ScriptedOracle {
        replies: Vec<OracleResult<String>>,
        cursor: std::sync::Mutex<usize>,
    }

    impl ScriptedOracle {
        fn new(replies: Vec<OracleResult<String>>) -> Self {
            Self {
                replies,
                cursor: std::sync::Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl TextOracle for ScriptedOracle {
        async fn complete(&self, _request: CompletionRequest) -> OracleResult<String> {
            let mut cursor = self.cursor.lock().unwrap();
            let index = (*cursor).min(self.replies.len() - 1);
            *cursor += 1;
            match &self.replies[index] {
                Ok(text) => Ok(text.clone()),
                Err(_) => Err(OracleError::ServiceUnavailable {
                    message: "scripted failure".to_string(),
                }),
            }
        }

        async fn health_check(&self) -> OracleResult<()> {
            Ok(())
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }
    }

    fn cases(n: usize) -> Vec<TestCase> {
        (0..n)
            .map(|i| TestCase::new(format!("case-{i}"), "do something", "does it"))
            .collect()
    }

    #[tokio::test]
    async fn test_classify_parses_oracle_output() {
        let cases = cases(2);
        let reply = format!(
            r#"{{"profiles": [
                {{"test_case_id": "{}", "natural_order_score": 2, "must_be_last": false,
                  "end_session_probability": 5, "recommended_modality": "voice"}},
                {{"test_case_id": "{}", "natural_order_score": 9, "must_be_last": true,
                  "end_session_probability": 90, "incompatible_with": ["{}"]}}
            ]}}"#,
            cases[0].id, cases[1].id, cases[0].id
        );
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Ok(reply)])));

        let profiles = classifier
            .classify(&cases, &SessionProfile::default())
            .await;

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].natural_order_score, 2);
        assert_eq!(profiles[0].recommended_modality, oracle::Modality::Voice);
        assert!(profiles[1].must_be_last);
        assert!(profiles[1].incompatible_with.contains(&cases[0].id));
    }

    #[tokio::test]
    async fn test_oracle_failure_yields_conservative_defaults() {
        let cases = cases(3);
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Err(
            OracleError::ServiceUnavailable {
                message: "down".to_string(),
            },
        )])));

        let profiles = classifier
            .classify(&cases, &SessionProfile::default())
            .await;

        assert_eq!(profiles.len(), 3);
        for (case, profile) in cases.iter().zip(&profiles) {
            assert_eq!(profile.test_case_id, case.id);
            assert_eq!(profile.natural_order_score, 5);
            assert!(!profile.must_be_last);
            assert_eq!(profile.end_session_probability, 10);
        }
    }

    #[tokio::test]
    async fn test_garbage_output_yields_conservative_defaults() {
        let cases = cases(2);
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Ok(
            "not json at all".to_string(),
        )])));

        let profiles = classifier
            .classify(&cases, &SessionProfile::default())
            .await;

        assert_eq!(profiles.len(), 2);
        assert!(profiles.iter().all(|p| p.natural_order_score == 5));
    }

    #[tokio::test]
    async fn test_missing_case_in_output_gets_default() {
        let cases = cases(2);
        // Oracle only answers for the first case.
        let reply = format!(
            r#"{{"profiles": [{{"test_case_id": "{}", "natural_order_score": 1}}]}}"#,
            cases[0].id
        );
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Ok(reply)])));

        let profiles = classifier
            .classify(&cases, &SessionProfile::default())
            .await;

        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].natural_order_score, 1);
        assert_eq!(profiles[1].natural_order_score, 5);
    }

    #[tokio::test]
    async fn test_chunking_preserves_input_order() {
        let cases = cases(7);
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Err(
            OracleError::ServiceUnavailable {
                message: "down".to_string(),
            },
        )])))
        .with_chunk_size(3);

        let profiles = classifier
            .classify(&cases, &SessionProfile::default())
            .await;

        assert_eq!(profiles.len(), 7);
        for (case, profile) in cases.iter().zip(&profiles) {
            assert_eq!(profile.test_case_id, case.id);
        }
    }

    #[tokio::test]
    async fn test_explicit_hint_survives_fallback() {
        let case = TestCase::new("call me", "ring the line", "answers")
            .with_modality_hint(ModalityHint::Voice);
        let classifier = ScenarioClassifier::new(Arc::new(ScriptedOracle::new(vec![Ok(
            "[]".to_string(),
        )])));

        let profiles = classifier
            .classify(std::slice::from_ref(&case), &SessionProfile::default())
            .await;

        assert_eq!(profiles[0].recommended_modality, oracle::Modality::Voice);
    }
}
