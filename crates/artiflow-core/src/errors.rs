//! Errores del core.
//!
//! Taxonomía:
//! - `PlanError`: errores de definición del pipeline; fatales al construir el
//!   plan, nunca diferidos a tiempo de ejecución.
//! - `StageFailure`: fallo clasificado devuelto por `execute` (transitorio,
//!   permanente o timeout). El motor decide el reintento a partir de la
//!   clasificación.
//! - `StoreError` / `LedgerError`: fallos de las stores compartidas.
//! - `CoreEngineError`: lo que ve el llamador del `Orchestrator`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Clasificación usada para decidir si un fallo es reintentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Fallo tipado de la ejecución de un stage.
#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum StageFailure {
    #[error("transient failure: {0}")] Transient(String),
    #[error("permanent failure: {0}")] Permanent(String),
    #[error("timed out after {0} ms")] TimedOut(u64),
}

impl StageFailure {
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Permanent(detail.into())
    }

    pub fn class(&self) -> ErrorClass {
        classify_error(self)
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Nombre estable registrado en `Attempt::error_kind`.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::TimedOut(_) => "timed_out",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Self::Transient(d) | Self::Permanent(d) => d.clone(),
            Self::TimedOut(ms) => format!("no result after {ms} ms"),
        }
    }
}

/// Un timeout cuenta como fallo transitorio.
pub fn classify_error(failure: &StageFailure) -> ErrorClass {
    match failure {
        StageFailure::Transient(_) | StageFailure::TimedOut(_) => ErrorClass::Transient,
        StageFailure::Permanent(_) => ErrorClass::Permanent,
    }
}

/// Errores de la Artifact Store.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StoreError {
    #[error("invalid artifact name: {0:?}")] InvalidName(String),
    #[error("artifact not found: {0}")] NotFound(String),
    #[error("artifact {name} has no version {version}")] VersionNotFound { name: String, version: u64 },
    #[error("artifact {name}: payload does not fit kind {kind}")] KindMismatch { name: String, kind: String },
    #[error("artifact backend error (transient={transient}): {detail}")] Backend { transient: bool, detail: String },
}

impl StoreError {
    /// Traducción a fallo de stage cuando la store falla dentro de un attempt.
    pub fn to_stage_failure(&self) -> StageFailure {
        match self {
            StoreError::Backend { transient: true, detail } => StageFailure::transient(detail.clone()),
            other => StageFailure::permanent(other.to_string()),
        }
    }
}

/// Errores del Run Ledger.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum LedgerError {
    #[error("ledger write error: {0}")] WriteFailed(String),
    #[error("ledger read error: {0}")] ReadFailed(String),
    #[error("attempt {got} for stage {stage_id} is behind attempt {last}")] OutOfOrder { stage_id: String, last: u32, got: u32 },
    #[error("run not found: {0}")] RunNotFound(Uuid),
    #[error("run {0} is already finished")] RunClosed(Uuid),
}

/// Errores de definición del pipeline.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum PlanError {
    #[error("stage id must not be empty")] EmptyStageId,
    #[error("duplicate stage id: {0}")] DuplicateStageId(String),
    #[error("artifact {artifact} is produced by both {first} and {second}")] DuplicateProducer { artifact: String, first: String, second: String },
    #[error("cyclic dependency involving stage {0}")] CyclicDependency(String),
    #[error("stage {0}: max_attempts must be at least 1")] InvalidRetryPolicy(String),
}

/// Errores del orquestador.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoreEngineError {
    #[error(transparent)] Plan(#[from] PlanError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Ledger(#[from] LedgerError),
    #[error("stage {stage_id}: attempt {attempt_number} has an unknown outcome; operator confirmation required")] AmbiguousState { stage_id: String, attempt_number: u32 },
    #[error("pipeline definition changed (run has {expected}, plan has {found})")] DefinitionMismatch { expected: String, found: String },
    #[error("run {0} is already being driven")] RunInProgress(Uuid),
    #[error("unknown stage: {0}")] UnknownStage(String),
    #[error("internal: {0}")] Internal(String),
}
