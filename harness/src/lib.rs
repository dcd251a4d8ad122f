pub mod classifier;
pub mod consistency;
pub mod executor;
pub mod planner;
pub mod session_cache;
pub mod session_profile;
pub mod store;
pub mod testcase;

pub use classifier::{ScenarioClassifier, DEFAULT_CHUNK_SIZE};
pub use consistency::{
    cosine_similarity, AnalysisError, AnalysisResult, ConsistencyAnalyzer, ConsistencyRun,
    ConsistencySample, ResponseCluster,
};
pub use executor::{CancelFlag, Executor, ExecutorConfig, RunSummary};
pub use planner::{
    Batch, CoverageMetrics, FallbackAction, FallbackPath, Plan, PlanError, PlanResult, Planner,
};
pub use session_cache::SessionCache;
pub use session_profile::SessionProfileBuilder;
pub use store::{
    ExecutionResult, ExecutionRun, MemoryStore, ResultStatus, ResultStore, RunStatus, StoreError,
    StoreResult, TranscriptTurn, TurnRole,
};
pub use testcase::{ModalityHint, Priority, SessionProfile, TestCase, TestCaseProfile};
