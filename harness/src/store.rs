//! Durable-store abstraction for run and result rows.
//!
//! The store is the only shared mutable state in the pipeline and is
//! always the source of truth: all writes are idempotent upserts keyed by
//! (run id, test case id) or (run id), so retried operations and process
//! restarts are safe. In-memory counters are never authoritative.

use crate::consistency::{ConsistencyRun, ConsistencySample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Run {0} not found")]
    RunNotFound(Uuid),

    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Run lifecycle: pending -> running -> {completed, failed, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-test-case lifecycle: pending -> running -> {passed, failed}.
///
/// "Skipped" is not a fifth status: a result abandoned by a fallback rule
/// is `Failed` with [`ExecutionResult::skipped`] set, so terminal-state
/// checks stay two-valued while reporting can still distinguish planning
/// risk from agent misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Running,
    Passed,
    Failed,
}

impl ResultStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResultStatus::Passed | ResultStatus::Failed)
    }
}

/// One row per top-level test invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRun {
    pub fn new(id: Uuid, total_tests: usize) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            total_tests,
            passed_tests: 0,
            failed_tests: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// One turn of a batch transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: TurnRole,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    Tester,
    Agent,
}

impl TranscriptTurn {
    pub fn tester(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tester,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Agent,
            text: text.into(),
        }
    }
}

/// One row per test case within a run. Seeded `Pending` for every planned
/// case before execution begins, so clients can always enumerate all
/// expected outcomes even mid-run. Mutated only by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub test_case_id: Uuid,
    pub batch_id: Uuid,
    /// Position of this case within its batch.
    pub batch_order: usize,
    pub status: ResultStatus,
    /// Set only via a planner fallback rule; meaningful when `Failed`.
    pub skipped: bool,
    pub transcript: Vec<TranscriptTurn>,
    pub score: Option<f64>,
    pub diagnostic: Option<String>,
    pub audio_ref: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn pending(run_id: Uuid, test_case_id: Uuid, batch_id: Uuid, batch_order: usize) -> Self {
        Self {
            run_id,
            test_case_id,
            batch_id,
            batch_order,
            status: ResultStatus::Pending,
            skipped: false,
            transcript: Vec::new(),
            score: None,
            diagnostic: None,
            audio_ref: None,
            updated_at: Utc::now(),
        }
    }
}

/// Durable-store operations the pipeline consumes. Every upsert must be
/// safe to call multiple times with the same logical key.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn upsert_run(&self, run: ExecutionRun) -> StoreResult<()>;

    async fn upsert_result(&self, result: ExecutionResult) -> StoreResult<()>;

    async fn get_run(&self, run_id: Uuid) -> StoreResult<ExecutionRun>;

    async fn get_results(&self, run_id: Uuid) -> StoreResult<Vec<ExecutionResult>>;

    async fn upsert_consistency_run(&self, run: ConsistencyRun) -> StoreResult<()>;

    async fn upsert_consistency_sample(&self, sample: ConsistencySample) -> StoreResult<()>;
}

/// In-memory store used by tests and the CLI. Production deployments plug
/// in their own backend behind [`ResultStore`].
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<Uuid, ExecutionRun>>,
    results: Mutex<HashMap<(Uuid, Uuid), ExecutionResult>>,
    consistency_runs: Mutex<HashMap<Uuid, ConsistencyRun>>,
    consistency_samples: Mutex<HashMap<(Uuid, usize), ConsistencySample>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn consistency_run(&self, run_id: Uuid) -> Option<ConsistencyRun> {
        self.consistency_runs.lock().await.get(&run_id).cloned()
    }

    pub async fn consistency_samples(&self, run_id: Uuid) -> Vec<ConsistencySample> {
        let samples = self.consistency_samples.lock().await;
        let mut out: Vec<ConsistencySample> = samples
            .iter()
            .filter(|((id, _), _)| *id == run_id)
            .map(|(_, s)| s.clone())
            .collect();
        out.sort_by_key(|s| s.iteration);
        out
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_run(&self, run: ExecutionRun) -> StoreResult<()> {
        self.runs.lock().await.insert(run.id, run);
        Ok(())
    }

    async fn upsert_result(&self, result: ExecutionResult) -> StoreResult<()> {
        self.results
            .lock()
            .await
            .insert((result.run_id, result.test_case_id), result);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> StoreResult<ExecutionRun> {
        self.runs
            .lock()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn get_results(&self, run_id: Uuid) -> StoreResult<Vec<ExecutionResult>> {
        let results = self.results.lock().await;
        let mut out: Vec<ExecutionResult> = results
            .iter()
            .filter(|((id, _), _)| *id == run_id)
            .map(|(_, r)| r.clone())
            .collect();
        out.sort_by_key(|r| (r.batch_id, r.batch_order));
        Ok(out)
    }

    async fn upsert_consistency_run(&self, run: ConsistencyRun) -> StoreResult<()> {
        self.consistency_runs.lock().await.insert(run.id, run);
        Ok(())
    }

    async fn upsert_consistency_sample(&self, sample: ConsistencySample) -> StoreResult<()> {
        self.consistency_samples
            .lock()
            .await
            .insert((sample.run_id, sample.iteration), sample);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_result_is_idempotent() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        let case_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();

        let mut result = ExecutionResult::pending(run_id, case_id, batch_id, 0);
        result.status = ResultStatus::Passed;

        store.upsert_result(result.clone()).await.unwrap();
        store.upsert_result(result).await.unwrap();

        let stored = store.get_results(run_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ResultStatus::Passed);
    }

    #[tokio::test]
    async fn test_upsert_run_replaces_by_key() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();

        let mut run = ExecutionRun::new(run_id, 3);
        store.upsert_run(run.clone()).await.unwrap();

        run.status = RunStatus::Completed;
        run.passed_tests = 3;
        store.upsert_run(run).await.unwrap();

        let stored = store.get_run(run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.passed_tests, 3);
    }

    #[tokio::test]
    async fn test_missing_run_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_run(Uuid::new_v4()).await,
            Err(StoreError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_consistency_upserts_are_idempotent() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();

        let run = ConsistencyRun {
            id: run_id,
            test_case_id: Uuid::new_v4(),
            iterations: 2,
            consistency_score: 100.0,
            semantic_variance: 0.0,
            outlier_count: 0,
            clusters: Vec::new(),
        };
        store.upsert_consistency_run(run.clone()).await.unwrap();
        store.upsert_consistency_run(run).await.unwrap();

        let sample = ConsistencySample {
            run_id,
            iteration: 0,
            response_text: "same".to_string(),
            embedding: vec![1.0],
            similarity_to_baseline: 1.0,
            is_outlier: false,
            latency_ms: 5,
        };
        store.upsert_consistency_sample(sample.clone()).await.unwrap();
        store.upsert_consistency_sample(sample).await.unwrap();

        assert_eq!(store.consistency_run(run_id).await.unwrap().iterations, 2);
        assert_eq!(store.consistency_samples(run_id).await.len(), 1);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ResultStatus::Passed.is_terminal());
        assert!(ResultStatus::Failed.is_terminal());
        assert!(!ResultStatus::Pending.is_terminal());
        assert!(!ResultStatus::Running.is_terminal());
    }
}
