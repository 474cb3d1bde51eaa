//! Entradas del ledger.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Attempt, RunFailure, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEntryKind {
    /// Primera entrada de un run: fija el hash de definición y el orden
    /// topológico de los stages.
    RunStarted { definition_hash: String, stage_ids: Vec<String> },
    /// Marcador `Started` o resultado terminal de un intento.
    Attempt(Attempt),
    /// Un operador autoriza re-ejecutar un stage no idempotente en estado
    /// ambiguo.
    OperatorConfirmed { stage_id: String },
    /// Cierre del run. Ninguna entrada puede seguirle.
    RunFinished { status: RunStatus, failure: Option<RunFailure> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Orden de append dentro del run (0, 1, 2, ...).
    pub seq: u64,
    pub run_id: Uuid,
    pub ts: DateTime<Utc>, // metadato; el replay no lo usa
    pub kind: LedgerEntryKind,
}
