//! Attempt: un intento de ejecutar un stage dentro de un run.
//!
//! Cada intento deja dos entradas en el ledger con el mismo
//! `attempt_number`: un marcador `Started` y, si el proceso no muere antes, una
//! entrada terminal (`Success`, `Failed`, `TimedOut`). Un `Started` sin
//! terminal es exactamente lo que el replay detecta como estado ambiguo.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{ERROR_KIND_INTERRUPTED, ERROR_KIND_PARTIAL_SUCCESS};
use crate::errors::StageFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Started,
    Success,
    Failed,
    TimedOut,
}

impl AttemptOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptOutcome::Started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub stage_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub output_versions: BTreeMap<String, u64>,
}

impl Attempt {
    pub fn started(stage_id: impl Into<String>, attempt_number: u32, at: DateTime<Utc>) -> Self {
        Self { stage_id: stage_id.into(),
               attempt_number,
               started_at: at,
               finished_at: None,
               outcome: AttemptOutcome::Started,
               error_kind: None,
               error_detail: None,
               output_versions: BTreeMap::new() }
    }

    pub fn succeeded(&self, at: DateTime<Utc>, output_versions: BTreeMap<String, u64>) -> Self {
        Self { finished_at: Some(at),
               outcome: AttemptOutcome::Success,
               output_versions,
               ..self.started_copy() }
    }

    pub fn failed(&self, at: DateTime<Utc>, failure: &StageFailure) -> Self {
        let outcome = match failure {
            StageFailure::TimedOut(_) => AttemptOutcome::TimedOut,
            _ => AttemptOutcome::Failed,
        };
        Self { finished_at: Some(at),
               outcome,
               error_kind: Some(failure.error_kind().to_string()),
               error_detail: Some(failure.detail()),
               ..self.started_copy() }
    }

    /// Cierra un intento que quedó abierto tras un crash.
    pub fn interrupted(&self, at: DateTime<Utc>) -> Self {
        Self { finished_at: Some(at),
               outcome: AttemptOutcome::Failed,
               error_kind: Some(ERROR_KIND_INTERRUPTED.to_string()),
               error_detail: Some("attempt left open by a previous process".to_string()),
               ..self.started_copy() }
    }

    /// `execute` terminó pero sus outputs no llegaron a la store.
    pub fn partial_success(&self, at: DateTime<Utc>, detail: impl Into<String>) -> Self {
        Self { finished_at: Some(at),
               outcome: AttemptOutcome::Failed,
               error_kind: Some(ERROR_KIND_PARTIAL_SUCCESS.to_string()),
               error_detail: Some(detail.into()),
               ..self.started_copy() }
    }

    fn started_copy(&self) -> Self {
        Self { output_versions: BTreeMap::new(),
               error_kind: None,
               error_detail: None,
               ..self.clone() }
    }

    pub fn is_partial_success(&self) -> bool {
        self.error_kind.as_deref() == Some(ERROR_KIND_PARTIAL_SUCCESS)
    }
}
