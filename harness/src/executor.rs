//! Batch executor: drives each planned batch through one live agent
//! session, scores transcripts, and persists per-test-case outcomes as
//! they become known.
//!
//! Failures are data, not control flow: a session error is scoped to its
//! batch, a judge error to its test case, and neither ever aborts the
//! run. The durable store is the source of truth throughout: run-level
//! tallies are recomputed from stored rows at the end, never from
//! in-memory counters, so the executor stays correct across process
//! restarts.

use crate::planner::{Batch, FallbackAction, Plan};
use crate::store::{
    ExecutionResult, ExecutionRun, ResultStatus, ResultStore, RunStatus, StoreResult,
    TranscriptTurn,
};
use crate::testcase::TestCase;
use futures::future::join_all;
use oracle::{AgentView, CompletionRequest, SessionFactory, TextOracle};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Width of a concurrent round of batches. 1 = fully sequential,
    /// the default, since live voice sessions are rate/cost constrained.
    pub concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Cooperative cancellation: consulted only at batch-start boundaries,
/// so in-flight batches always run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Final tallies for one run, recomputed from the durable store.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Subset of `failed` abandoned by fallback rules.
    pub skipped: usize,
}

/// Judge verdict for one test case's transcript slice.
#[derive(Debug, Deserialize)]
struct Judgment {
    passed: bool,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

const JUDGE_SYSTEM_PROMPT: &str = "You judge whether a conversational agent handled \
a test scenario correctly, given the transcript of that part of the conversation. \
Respond with JSON only: {\"passed\": bool, \"score\": 0-100, \"reasoning\": string}.";

pub struct Executor {
    store: Arc<dyn ResultStore>,
    judge: Arc<dyn TextOracle>,
    config: ExecutorConfig,
}

/// Outcome of one batch's session phase, before judging.
struct SessionOutcome {
    /// Per case (by batch order): the transcript slice for that case, if
    /// its turn completed.
    slices: Vec<Option<Vec<TranscriptTurn>>>,
    /// Error message from the turn that broke the session, if any, and
    /// the batch order it happened at.
    broke_at: Option<(usize, String)>,
    audio_ref: Option<String>,
}

impl Executor {
    pub fn new(store: Arc<dyn ResultStore>, judge: Arc<dyn TextOracle>) -> Self {
        Self {
            store,
            judge,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute every batch in the plan and return once all batches are
    /// processed. Only store errors propagate; everything else is
    /// recorded as per-case outcomes.
    pub async fn execute(
        &self,
        run_id: Uuid,
        plan: &Plan,
        cases: &[TestCase],
        agent: &AgentView,
        sessions: Arc<dyn SessionFactory>,
        cancel: &CancelFlag,
    ) -> StoreResult<RunSummary> {
        let case_map: HashMap<Uuid, &TestCase> = cases.iter().map(|c| (c.id, c)).collect();

        let mut run = ExecutionRun::new(run_id, plan.coverage.planned_count);
        run.status = RunStatus::Running;
        self.store.upsert_run(run).await?;

        // Seed every planned case as pending first, so an in-flight run
        // is always fully enumerable.
        for batch in &plan.batches {
            for (order, id) in batch.test_case_ids.iter().enumerate() {
                self.store
                    .upsert_result(ExecutionResult::pending(run_id, *id, batch.id, order))
                    .await?;
            }
        }

        info!(
            "Run {run_id}: executing {} batches (round width {})",
            plan.batches.len(),
            self.config.concurrency.max(1)
        );

        // Rounds of width C; round N+1 never starts until round N's
        // batches have all reached a terminal per-batch state.
        for round in plan.batches.chunks(self.config.concurrency.max(1)) {
            let outcomes = join_all(round.iter().map(|batch| {
                self.run_batch(run_id, batch, &case_map, agent, sessions.clone(), cancel)
            }))
            .await;
            for outcome in outcomes {
                outcome?;
            }
        }

        self.finalize(run_id, plan, cancel).await
    }

    async fn run_batch(
        &self,
        run_id: Uuid,
        batch: &Batch,
        case_map: &HashMap<Uuid, &TestCase>,
        agent: &AgentView,
        sessions: Arc<dyn SessionFactory>,
        cancel: &CancelFlag,
    ) -> StoreResult<()> {
        if cancel.is_cancelled() {
            debug!("Run {run_id} cancelled; batch '{}' not started", batch.name);
            for (order, id) in batch.test_case_ids.iter().enumerate() {
                self.mark(
                    run_id, batch, order, *id,
                    ResultStatus::Failed,
                    false,
                    None,
                    None,
                    Some("run cancelled".to_string()),
                    None,
                )
                .await?;
            }
            return Ok(());
        }

        for (order, id) in batch.test_case_ids.iter().enumerate() {
            let mut result = ExecutionResult::pending(run_id, *id, batch.id, order);
            result.status = ResultStatus::Running;
            self.store.upsert_result(result).await?;
        }

        let outcome = self
            .drive_session(batch, case_map, agent, sessions.as_ref())
            .await;

        self.score_batch(run_id, batch, case_map, outcome).await
    }

    /// Open one session for the batch and drive turns in the planned
    /// order. A turn failure never corrupts slices already collected for
    /// earlier cases.
    async fn drive_session(
        &self,
        batch: &Batch,
        case_map: &HashMap<Uuid, &TestCase>,
        agent: &AgentView,
        sessions: &dyn SessionFactory,
    ) -> SessionOutcome {
        let mut slices: Vec<Option<Vec<TranscriptTurn>>> =
            vec![None; batch.test_case_ids.len()];

        let mut session = match sessions.open(agent, batch.modality).await {
            Ok(session) => session,
            Err(err) => {
                warn!("Batch '{}': session open failed: {err}", batch.name);
                return SessionOutcome {
                    slices,
                    broke_at: Some((0, err.to_string())),
                    audio_ref: None,
                };
            }
        };

        let mut broke_at = None;
        for (order, id) in batch.test_case_ids.iter().enumerate() {
            let Some(case) = case_map.get(id) else {
                broke_at = Some((order, format!("test case {id} missing from input set")));
                break;
            };
            match session.send(&case.scenario).await {
                Ok(reply) => {
                    slices[order] = Some(vec![
                        TranscriptTurn::tester(&case.scenario),
                        TranscriptTurn::agent(&reply.text),
                    ]);
                }
                Err(err) => {
                    warn!(
                        "Batch '{}': turn {} ('{}') failed: {err}",
                        batch.name, order, case.name
                    );
                    broke_at = Some((order, err.to_string()));
                    break;
                }
            }
        }

        let audio_ref = match session.close().await {
            Ok(artifacts) => artifacts.audio_ref,
            Err(err) => {
                warn!("Batch '{}': session close failed: {err}", batch.name);
                None
            }
        };

        SessionOutcome {
            slices,
            broke_at,
            audio_ref,
        }
    }

    /// Score every case of the batch independently and write exactly one
    /// terminal transition per case.
    async fn score_batch(
        &self,
        run_id: Uuid,
        batch: &Batch,
        case_map: &HashMap<Uuid, &TestCase>,
        outcome: SessionOutcome,
    ) -> StoreResult<()> {
        // A fallback rule fires when the breaking case is one of the
        // planner's registered triggers: later cases are then skipped
        // (planning risk), not failed (agent misbehavior).
        let skip_after: Option<usize> = outcome.broke_at.as_ref().and_then(|(order, _)| {
            let broken_id = batch.test_case_ids.get(*order)?;
            batch
                .fallback_paths
                .iter()
                .any(|p| {
                    p.trigger_test_case_id == *broken_id
                        && p.action == FallbackAction::SkipRemaining
                })
                .then_some(*order)
        });

        for (order, id) in batch.test_case_ids.iter().enumerate() {
            let (status, skipped, score, transcript, diagnostic) =
                match (&outcome.slices[order], &outcome.broke_at) {
                    (Some(slice), _) => {
                        let case = case_map[id];
                        match self.judge_case(case, slice).await {
                            Ok(judgment) => (
                                if judgment.passed {
                                    ResultStatus::Passed
                                } else {
                                    ResultStatus::Failed
                                },
                                false,
                                judgment.score,
                                Some(slice.clone()),
                                judgment.reasoning,
                            ),
                            Err(reason) => (
                                ResultStatus::Failed,
                                false,
                                None,
                                Some(slice.clone()),
                                Some(format!("no analysis result: {reason}")),
                            ),
                        }
                    }
                    (None, Some((broke_order, message))) => {
                        let skipped =
                            matches!(skip_after, Some(trigger) if order > trigger);
                        let diagnostic = if skipped {
                            format!("skipped: session ended at batch position {broke_order}")
                        } else {
                            message.clone()
                        };
                        (ResultStatus::Failed, skipped, None, None, Some(diagnostic))
                    }
                    // No slice and no recorded break: defensive terminal
                    // state so nothing is left running.
                    (None, None) => (
                        ResultStatus::Failed,
                        false,
                        None,
                        None,
                        Some("no analysis result".to_string()),
                    ),
                };

            self.mark(
                run_id,
                batch,
                order,
                *id,
                status,
                skipped,
                score,
                transcript,
                diagnostic,
                outcome.audio_ref.clone(),
            )
            .await?;
        }

        Ok(())
    }

    async fn judge_case(
        &self,
        case: &TestCase,
        slice: &[TranscriptTurn],
    ) -> Result<Judgment, String> {
        let mut transcript = String::new();
        for turn in slice {
            let speaker = match turn.role {
                crate::store::TurnRole::Tester => "Tester",
                crate::store::TurnRole::Agent => "Agent",
            };
            transcript.push_str(&format!("{speaker}: {}\n", turn.text));
        }

        let prompt = format!(
            "Scenario: {}\nExpected outcome: {}\n\nTranscript slice:\n{transcript}\n\
             Did the agent handle this scenario as expected?",
            case.scenario, case.expected_outcome
        );

        let request = CompletionRequest::new(prompt)
            .with_system(JUDGE_SYSTEM_PROMPT)
            .with_temperature(0.0)
            .expect_json();

        let value = self
            .judge
            .complete_json(request)
            .await
            .map_err(|e| e.to_string())?;
        serde_json::from_value(value).map_err(|e| e.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    async fn mark(
        &self,
        run_id: Uuid,
        batch: &Batch,
        order: usize,
        id: Uuid,
        status: ResultStatus,
        skipped: bool,
        score: Option<f64>,
        transcript: Option<Vec<TranscriptTurn>>,
        diagnostic: Option<String>,
        audio_ref: Option<String>,
    ) -> StoreResult<()> {
        let mut result = ExecutionResult::pending(run_id, id, batch.id, order);
        result.status = status;
        result.skipped = skipped;
        result.score = score;
        result.transcript = transcript.unwrap_or_default();
        result.diagnostic = diagnostic;
        result.audio_ref = audio_ref;
        self.store.upsert_result(result).await
    }

    /// Recompute tallies from the durable rows and set the terminal run
    /// status.
    async fn finalize(
        &self,
        run_id: Uuid,
        plan: &Plan,
        cancel: &CancelFlag,
    ) -> StoreResult<RunSummary> {
        let results = self.store.get_results(run_id).await?;

        let passed = results
            .iter()
            .filter(|r| r.status == ResultStatus::Passed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == ResultStatus::Failed)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.status == ResultStatus::Failed && r.skipped)
            .count();

        let stuck = results.len() - passed - failed;
        if stuck > 0 {
            error!("Run {run_id}: {stuck} results left non-terminal");
        }

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let mut run = self.store.get_run(run_id).await?;
        run.status = status;
        run.total_tests = plan.coverage.planned_count;
        run.passed_tests = passed;
        run.failed_tests = failed;
        run.completed_at = Some(chrono::Utc::now());
        self.store.upsert_run(run).await?;

        info!("Run {run_id}: {passed} passed, {failed} failed ({skipped} skipped)");

        Ok(RunSummary {
            run_id,
            status,
            total: plan.coverage.planned_count,
            passed,
            failed,
            skipped,
        })
    }
}
