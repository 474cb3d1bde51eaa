//! Estado reconstruido de un run.
//!
//! `Run` nunca se muta desde fuera del fold de replay
//! (`ledger::replay_entries`): es una vista derivada del ledger.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Attempt, AttemptOutcome};
use crate::stage::StageStatus;

/// Estado global de un run. Transiciones monotónicas:
/// `Running` -> {`Succeeded`, `Failed`, `Aborted`}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(self, RunStatus::Running) && next.is_terminal()
    }

    /// Código de salida del CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Succeeded => 0,
            RunStatus::Failed => 1,
            RunStatus::Aborted => 2,
            RunStatus::Running => 3,
        }
    }
}

/// Información visible al usuario cuando un run no termina bien.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub stage_id: String,
    pub error_kind: String,
    pub detail: Option<String>,
    pub attempts: u32,
}

/// Estado de un stage dentro del run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageState {
    pub status: StageStatus,
    /// Mayor `attempt_number` visto.
    pub attempts: u32,
    pub last: Option<Attempt>,
    /// Versiones producidas por el attempt exitoso.
    pub output_versions: BTreeMap<String, u64>,
    /// Confirmación de operador registrada después del último attempt.
    pub confirmed: bool,
}

impl StageState {
    /// Hay un `Started` sin entrada terminal.
    pub fn in_flight(&self) -> bool {
        self.last.as_ref().is_some_and(|a| a.outcome == AttemptOutcome::Started)
    }

    pub fn last_error_kind(&self) -> Option<&str> {
        self.last.as_ref().and_then(|a| a.error_kind.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub definition_hash: String,
    pub stage_ids: Vec<String>,
    pub status: RunStatus,
    /// Todas las entradas de attempt en orden de append.
    pub attempts: Vec<Attempt>,
    pub stages: BTreeMap<String, StageState>,
    pub failure: Option<RunFailure>,
}

impl Run {
    pub fn stage(&self, stage_id: &str) -> Option<&StageState> {
        self.stages.get(stage_id)
    }

    pub fn stage_status(&self, stage_id: &str) -> StageStatus {
        self.stages.get(stage_id).map(|s| s.status).unwrap_or_default()
    }

    /// Attempts terminales registrados para un stage (los `Started` no cuentan).
    pub fn finished_attempts(&self, stage_id: &str) -> Vec<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.stage_id == stage_id && a.outcome.is_terminal())
            .collect()
    }

    pub fn last_attempt(&self, stage_id: &str) -> Option<&Attempt> {
        self.attempts.iter().rev().find(|a| a.stage_id == stage_id)
    }
}
