//! Resumen visible al usuario de un run.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Run, RunFailure, RunStatus};
use crate::stage::StageStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    pub stage_id: String,
    pub status: StageStatus,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Stage que hizo fallar el run, su última clasificación y nº de intentos.
    pub failure: Option<RunFailure>,
    pub stages: Vec<StageSummary>,
    /// Presente cuando el run se abortó por un fallo de escritura del ledger.
    pub ledger_error: Option<String>,
}

impl RunReport {
    pub fn from_run(run: &Run) -> Self {
        let stages = run.stage_ids
                        .iter()
                        .map(|id| {
                            let state = run.stage(id);
                            StageSummary { stage_id: id.clone(),
                                           status: state.map(|s| s.status).unwrap_or_default(),
                                           attempts: state.map(|s| s.attempts).unwrap_or(0) }
                        })
                        .collect();
        Self { run_id: run.run_id,
               status: run.status,
               failure: run.failure.clone(),
               stages,
               ledger_error: None }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn attempts_of(&self, stage_id: &str) -> u32 {
        self.stages.iter().find(|s| s.stage_id == stage_id).map(|s| s.attempts).unwrap_or(0)
    }

    pub fn stage_status(&self, stage_id: &str) -> StageStatus {
        self.stages.iter().find(|s| s.stage_id == stage_id).map(|s| s.status).unwrap_or_default()
    }
}
