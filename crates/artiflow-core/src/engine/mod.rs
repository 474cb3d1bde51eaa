//! Orquestador: conduce un `ExecutionPlan` hasta un estado terminal.
//!
//! Responsabilidades:
//! - Registrar cada intento en el `RunLedger` antes y después de `execute`.
//! - Aplicar la política de reintento/backoff y el timeout de cada stage.
//! - Promover outputs en la `ArtifactStore` sólo cuando el stage tiene éxito.
//! - Reanudar un run a partir del replay del ledger, saltando lo ya completado.

mod attempt_loop;
mod builder;
mod cancel;
mod core;
mod report;

pub use builder::{OrchestratorBuilder, OrchestratorConfig};
pub use cancel::CancelHandle;
pub use core::Orchestrator;
pub use report::{RunReport, StageSummary};
