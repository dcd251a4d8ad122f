//! Batch planner: groups classified test cases into ordered batches, each
//! a single live session against the agent.
//!
//! Grouping decisions are delegated to a text oracle when one is
//! available, but the oracle's output is a proposal, never a verdict: the
//! planner re-verifies every non-negotiable constraint (batch size cap,
//! ascending natural order, at most one must-be-last item and always
//! last, session-ending items last or isolated, no incompatible pair in
//! one batch) and repairs violations before accepting anything. When the
//! oracle is missing or its proposal is unusable, a deterministic packing
//! produces the plan on its own.

use crate::testcase::{SessionProfile, TestCase, TestCaseProfile};
use oracle::{CompletionRequest, Modality, TextOracle};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// End-session probability at or above which an item must be last in its
/// batch or isolated into a single-item batch.
pub const HIGH_END_PROBABILITY: u8 = 70;

/// End-session probability above which a non-final item gets a fallback
/// path attached.
pub const FALLBACK_END_PROBABILITY: u8 = 50;

/// Partition size above which the planner sub-partitions by category to
/// keep each delegated grouping call within oracle input limits.
pub const DEFAULT_SUB_PARTITION_THRESHOLD: usize = 25;

const PLANNER_SYSTEM_PROMPT: &str = "You group conversational test scenarios into \
realistic multi-turn sessions. Scenarios in one group run as one continuous \
conversation, in the order you give them. Respond with JSON only.";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("maxPerBatch must be at least 1")]
    InvalidMaxPerBatch,

    #[error("Plan covers {actual} of {expected} test cases")]
    CoverageViolation { expected: usize, actual: usize },

    #[error("Test case {0} appears in more than one batch")]
    DuplicateCoverage(Uuid),
}

pub type PlanResult<T> = Result<T, PlanError>;

/// What to do when a fallback path triggers mid-batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Mark every item after the trigger as skipped (not failed).
    SkipRemaining,
}

/// A planner-attached rule: if the trigger item's turn fails or ends the
/// session, the listed items are skipped rather than failed. That
/// outcome reflects planning risk, not agent misbehavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackPath {
    pub trigger_test_case_id: Uuid,
    pub action: FallbackAction,
    pub alternative_ids: Vec<Uuid>,
}

/// One continuous agent session covering an ordered set of test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub test_case_ids: Vec<Uuid>,
    pub modality: Modality,
    pub reasoning: String,
    pub estimated_duration_secs: u64,
    pub session_ending_test_case_id: Option<Uuid>,
    pub fallback_paths: Vec<FallbackPath>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageMetrics {
    pub input_count: usize,
    pub planned_count: usize,
    pub batch_count: usize,
}

/// The full set of batches for one run's test-case list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub batches: Vec<Batch>,
    pub strategy_summary: String,
    pub coverage: CoverageMetrics,
}

impl Plan {
    pub fn all_test_case_ids(&self) -> Vec<Uuid> {
        self.batches
            .iter()
            .flat_map(|b| b.test_case_ids.iter().copied())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ProposedBatch {
    #[serde(default)]
    name: Option<String>,
    test_case_ids: Vec<Uuid>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Internal planning view of one case: its profile plus a stable sort
/// identity.
struct Item<'a> {
    case: &'a TestCase,
    profile: &'a TestCaseProfile,
}

impl Item<'_> {
    fn ends_session(&self) -> bool {
        self.profile.must_be_last || self.profile.end_session_probability >= HIGH_END_PROBABILITY
    }

    /// Ascending natural order, with session-ending items sorted after
    /// everything else so they land in final slots.
    fn sort_key(&self) -> (u8, u8, String) {
        (
            u8::from(self.ends_session()),
            self.profile.natural_order_score,
            self.case.name.clone(),
        )
    }
}

pub struct Planner {
    oracle: Option<Arc<dyn TextOracle>>,
    sub_partition_threshold: usize,
}

impl Planner {
    /// A planner that delegates grouping to the oracle, with verified
    /// post-conditions.
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self {
            oracle: Some(oracle),
            sub_partition_threshold: DEFAULT_SUB_PARTITION_THRESHOLD,
        }
    }

    /// A planner that only uses the deterministic packing.
    pub fn deterministic() -> Self {
        Self {
            oracle: None,
            sub_partition_threshold: DEFAULT_SUB_PARTITION_THRESHOLD,
        }
    }

    pub fn with_sub_partition_threshold(mut self, threshold: usize) -> Self {
        self.sub_partition_threshold = threshold.max(1);
        self
    }

    /// Produce a plan covering every input case exactly once. The coverage
    /// post-condition is asserted before returning; a violation is fatal
    /// to planning and must surface before any execution starts.
    pub async fn plan(
        &self,
        cases: &[TestCase],
        profiles: &[TestCaseProfile],
        session_profile: &SessionProfile,
        max_per_batch: usize,
    ) -> PlanResult<Plan> {
        if max_per_batch == 0 {
            return Err(PlanError::InvalidMaxPerBatch);
        }
        let max_per_batch = max_per_batch.min(session_profile.max_batch_size.max(1));

        let profile_map: HashMap<Uuid, &TestCaseProfile> =
            profiles.iter().map(|p| (p.test_case_id, p)).collect();

        // Classification never blocks planning, so a case the classifier
        // somehow missed still plans with a conservative profile.
        let conservative: Vec<(Uuid, TestCaseProfile)> = cases
            .iter()
            .filter(|c| !profile_map.contains_key(&c.id))
            .map(|c| (c.id, TestCaseProfile::conservative(c)))
            .collect();
        let mut profile_map = profile_map;
        for (id, profile) in &conservative {
            profile_map.insert(*id, profile);
        }

        let items: Vec<Item<'_>> = cases
            .iter()
            .map(|case| Item {
                case,
                profile: profile_map[&case.id],
            })
            .collect();

        // Modality is a hard partition: a session is either a call or a
        // chat, never both.
        let mut by_modality: BTreeMap<Modality, Vec<Item<'_>>> = BTreeMap::new();
        for item in items {
            by_modality
                .entry(item.profile.recommended_modality)
                .or_default()
                .push(item);
        }

        let mut batches = Vec::new();
        for (modality, partition) in by_modality {
            debug!("Planning {} partition with {} cases", modality, partition.len());
            for group in self.sub_partition(partition) {
                let solved = self.solve_group(&group, modality, max_per_batch).await;
                batches.extend(solved);
            }
        }

        attach_fallback_paths(&mut batches, &profile_map);

        let plan = Plan {
            strategy_summary: summarize(&batches, cases.len()),
            coverage: CoverageMetrics {
                input_count: cases.len(),
                planned_count: batches.iter().map(|b| b.test_case_ids.len()).sum(),
                batch_count: batches.len(),
            },
            batches,
        };

        verify_coverage(&plan, cases)?;
        info!(
            "Planned {} batches covering {} test cases",
            plan.coverage.batch_count, plan.coverage.planned_count
        );
        Ok(plan)
    }

    /// Sub-partition an oversized modality partition by category so each
    /// delegated grouping call stays within oracle input limits.
    fn sub_partition<'a>(&self, partition: Vec<Item<'a>>) -> Vec<Vec<Item<'a>>> {
        if partition.len() <= self.sub_partition_threshold {
            return vec![partition];
        }

        let mut by_category: BTreeMap<String, Vec<Item<'a>>> = BTreeMap::new();
        for item in partition {
            let category = item
                .case
                .category
                .clone()
                .unwrap_or_else(|| "general".to_string());
            by_category.entry(category).or_default().push(item);
        }
        by_category.into_values().collect()
    }

    async fn solve_group(
        &self,
        group: &[Item<'_>],
        modality: Modality,
        max_per_batch: usize,
    ) -> Vec<Batch> {
        if group.is_empty() {
            return Vec::new();
        }

        if let Some(oracle) = &self.oracle {
            match self.propose(oracle.as_ref(), group, max_per_batch).await {
                Ok(proposal) => {
                    return repair_proposal(proposal, group, modality, max_per_batch);
                }
                Err(reason) => {
                    warn!("Delegated grouping unusable ({reason}), using deterministic packing");
                }
            }
        }

        deterministic_pack(group, modality, max_per_batch, 0.5)
    }

    async fn propose(
        &self,
        oracle: &dyn TextOracle,
        group: &[Item<'_>],
        max_per_batch: usize,
    ) -> Result<Vec<ProposedBatch>, String> {
        let request = CompletionRequest::new(build_grouping_prompt(group, max_per_batch))
            .with_system(PLANNER_SYSTEM_PROMPT)
            .with_temperature(0.2)
            .expect_json();

        let value = oracle
            .complete_json(request)
            .await
            .map_err(|e| e.to_string())?;

        let array = value
            .get("batches")
            .unwrap_or(&value)
            .as_array()
            .cloned()
            .ok_or_else(|| "expected a batches array".to_string())?;

        array
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| e.to_string()))
            .collect()
    }
}

fn build_grouping_prompt(group: &[Item<'_>], max_per_batch: usize) -> String {
    let mut prompt = format!(
        "Group the following test scenarios into conversational sessions of at most \
         {max_per_batch} scenarios each. Order scenarios within a session the way a \
         real conversation would flow (lower natural_order_score earlier). A scenario \
         marked must_be_last ends the session and must be the final scenario of its \
         session; never put two such scenarios together. Never put incompatible \
         scenarios in the same session.\n\nScenarios:\n"
    );

    for item in group {
        prompt.push_str(&format!(
            "- id: {}\n  name: {}\n  scenario: {}\n  natural_order_score: {}\n  \
             must_be_last: {}\n  end_session_probability: {}\n  incompatible_with: {:?}\n",
            item.case.id,
            item.case.name,
            item.case.scenario,
            item.profile.natural_order_score,
            item.profile.must_be_last,
            item.profile.end_session_probability,
            item.profile.incompatible_with,
        ));
    }

    prompt.push_str(
        "\nReturn a JSON object: {\"batches\": [{\"name\": string, \
         \"test_case_ids\": [ids in conversation order], \"reasoning\": string}]}",
    );
    prompt
}

/// Accept the oracle's grouping where it satisfies the constraints, spill
/// everything else into a pool, and pack the pool deterministically.
/// Missing ids, invented ids, and duplicates are all repaired here.
fn repair_proposal(
    proposal: Vec<ProposedBatch>,
    group: &[Item<'_>],
    modality: Modality,
    max_per_batch: usize,
) -> Vec<Batch> {
    let by_id: HashMap<Uuid, &Item<'_>> = group.iter().map(|i| (i.case.id, i)).collect();

    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut repaired = false;
    let mut batches = Vec::new();

    for proposed in proposal {
        let mut accepted: Vec<&Item<'_>> = Vec::new();
        for id in &proposed.test_case_ids {
            let Some(item) = by_id.get(id) else {
                // Invented id.
                repaired = true;
                continue;
            };
            if !seen.insert(*id) {
                repaired = true;
                continue;
            }
            accepted.push(item);
        }
        if accepted.is_empty() {
            continue;
        }

        // Re-impose ascending order with session enders last; the oracle
        // chose membership, the constraints choose order.
        accepted.sort_by_key(|i| i.sort_key());

        let mut kept: Vec<&Item<'_>> = Vec::new();
        for item in accepted {
            let conflicts = kept
                .iter()
                .any(|k| incompatible(k.profile, item.profile));
            let second_ender = item.ends_session() && kept.iter().any(|k| k.ends_session());
            if kept.len() >= max_per_batch || conflicts || second_ender {
                repaired = true;
                seen.remove(&item.case.id);
                continue;
            }
            kept.push(item);
        }
        if kept.is_empty() {
            continue;
        }

        let confidence = if repaired { 0.7 } else { 0.9 };
        batches.push(make_batch(
            &kept,
            modality,
            proposed
                .name
                .unwrap_or_else(|| format!("Session {}", batches.len() + 1)),
            proposed
                .reasoning
                .unwrap_or_else(|| "delegated grouping".to_string()),
            confidence,
        ));
    }

    // Anything the oracle dropped or we evicted gets packed
    // deterministically.
    let leftovers: Vec<Item<'_>> = group
        .iter()
        .filter(|i| !seen.contains(&i.case.id))
        .map(|i| Item {
            case: i.case,
            profile: i.profile,
        })
        .collect();
    if !leftovers.is_empty() {
        debug!("Packing {} leftover cases after proposal repair", leftovers.len());
        batches.extend(deterministic_pack(&leftovers, modality, max_per_batch, 0.6));
    }

    batches
}

/// Deterministic packing: sort ascending by natural order with
/// session-ending items last, then fill batches left to right. A
/// session-ending item closes its batch; leftover enders therefore get
/// single-item batches. Incompatible items never share a batch.
fn deterministic_pack(
    group: &[Item<'_>],
    modality: Modality,
    max_per_batch: usize,
    confidence: f64,
) -> Vec<Batch> {
    let mut sorted: Vec<&Item<'_>> = group.iter().collect();
    sorted.sort_by_key(|i| i.sort_key());

    let mut batches: Vec<Vec<&Item<'_>>> = Vec::new();
    let mut current: Vec<&Item<'_>> = Vec::new();

    for item in sorted {
        let conflicts = current
            .iter()
            .any(|k| incompatible(k.profile, item.profile));
        if current.len() >= max_per_batch || conflicts {
            batches.push(std::mem::take(&mut current));
        }
        current.push(item);
        if item.ends_session() {
            // Final slot taken; the session would not survive past it.
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches
        .into_iter()
        .filter(|b| !b.is_empty())
        .enumerate()
        .map(|(i, items)| {
            make_batch(
                &items,
                modality,
                format!("Session {}", i + 1),
                "deterministic packing by natural conversation order".to_string(),
                confidence,
            )
        })
        .collect()
}

fn incompatible(a: &TestCaseProfile, b: &TestCaseProfile) -> bool {
    a.incompatible_with.contains(&b.test_case_id) || b.incompatible_with.contains(&a.test_case_id)
}

fn make_batch(
    items: &[&Item<'_>],
    modality: Modality,
    name: String,
    reasoning: String,
    confidence: f64,
) -> Batch {
    let per_case_secs = match modality {
        Modality::Voice => 45,
        Modality::Chat => 20,
    };

    let session_ending_test_case_id = items
        .last()
        .filter(|i| i.ends_session())
        .map(|i| i.case.id);

    Batch {
        id: Uuid::new_v4(),
        name,
        test_case_ids: items.iter().map(|i| i.case.id).collect(),
        modality,
        reasoning,
        estimated_duration_secs: items.len() as u64 * per_case_secs,
        session_ending_test_case_id,
        fallback_paths: Vec::new(),
        confidence,
    }
}

/// Every risky (end_session_probability > 50) item that is not already
/// last gets a skip-remaining rule, so a session that dies at that item
/// reports the rest of the batch as skipped rather than failed.
fn attach_fallback_paths(batches: &mut [Batch], profiles: &HashMap<Uuid, &TestCaseProfile>) {
    for batch in batches {
        let mut paths = Vec::new();
        for (index, id) in batch.test_case_ids.iter().enumerate() {
            if index + 1 == batch.test_case_ids.len() {
                continue;
            }
            let Some(profile) = profiles.get(id) else {
                continue;
            };
            if profile.end_session_probability > FALLBACK_END_PROBABILITY {
                paths.push(FallbackPath {
                    trigger_test_case_id: *id,
                    action: FallbackAction::SkipRemaining,
                    alternative_ids: batch.test_case_ids[index + 1..].to_vec(),
                });
            }
        }
        batch.fallback_paths = paths;
    }
}

fn summarize(batches: &[Batch], input_count: usize) -> String {
    let voice = batches.iter().filter(|b| b.modality == Modality::Voice).count();
    let chat = batches.len() - voice;
    let fallbacks: usize = batches.iter().map(|b| b.fallback_paths.len()).sum();
    format!(
        "{input_count} test cases across {} sessions ({voice} voice, {chat} chat), \
         {fallbacks} fallback rules attached",
        batches.len()
    )
}

/// The primary regression target: every input id appears in exactly one
/// batch. Executing an incomplete plan would silently drop coverage, so
/// a violation is fatal before execution starts.
fn verify_coverage(plan: &Plan, cases: &[TestCase]) -> PlanResult<()> {
    let mut seen = HashSet::new();
    for id in plan.all_test_case_ids() {
        if !seen.insert(id) {
            return Err(PlanError::DuplicateCoverage(id));
        }
    }

    let expected: HashSet<Uuid> = cases.iter().map(|c| c.id).collect();
    if seen != expected {
        return Err(PlanError::CoverageViolation {
            expected: expected.len(),
            actual: seen.len(),
        });
    }
    Ok(())
}
