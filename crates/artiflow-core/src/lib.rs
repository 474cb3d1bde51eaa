//! artiflow-core: orquestador de pipelines de artifacts (DAG, reintentos, reanudación)
pub mod constants;
pub mod engine;
pub mod errors;
pub mod hashing;
pub mod ledger;
pub mod model;
pub mod plan;
pub mod stage;
pub mod store;

pub use engine::{CancelHandle, Orchestrator, OrchestratorBuilder, OrchestratorConfig, RunReport, StageSummary};
pub use errors::{CoreEngineError, ErrorClass, LedgerError, PlanError, StageFailure, StoreError};
pub use ledger::{InMemoryRunLedger, LedgerEntry, LedgerEntryKind, RunLedger};
pub use model::{Artifact, ArtifactKind, Attempt, AttemptOutcome, Payload, Run, RunFailure, RunStatus, Version};
pub use plan::{build_plan, ExecutionPlan, PipelineBuilder};
pub use stage::{Backoff, RetryPolicy, Stage, StageContext, StageOutputs, StageRunner, StageStatus};
pub use store::{ArtifactStore, InMemoryArtifactStore};
