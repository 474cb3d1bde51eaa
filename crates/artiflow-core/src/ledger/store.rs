use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use super::{replay_entries, LedgerEntry, LedgerEntryKind};
use crate::errors::LedgerError;
use crate::model::{Attempt, AttemptOutcome, Run};

/// Almacenamiento append-only de entradas de ledger.
///
/// Contrato para implementaciones:
/// - `append` es durable antes de retornar y asigna `seq` consecutivo por run.
/// - `append` serializa escritores concurrentes y valida el orden con
///   `check_append_order`; una entrada rechazada no se persiste.
/// - Un fallo de almacenamiento es `LedgerError::WriteFailed`; el llamador
///   debe tratar el run como abortado.
pub trait RunLedger: Send + Sync {
    fn append(&self, run_id: Uuid, kind: LedgerEntryKind) -> Result<LedgerEntry, LedgerError>;

    /// Entradas de un run en orden de append (vacío si no existe).
    fn entries(&self, run_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Runs conocidos por el ledger.
    fn runs(&self) -> Result<Vec<Uuid>, LedgerError>;

    fn append_attempt(&self, run_id: Uuid, attempt: Attempt) -> Result<LedgerEntry, LedgerError> {
        self.append(run_id, LedgerEntryKind::Attempt(attempt))
    }

    fn last_attempt(&self, run_id: Uuid, stage_id: &str) -> Result<Option<Attempt>, LedgerError> {
        let entries = self.entries(run_id)?;
        Ok(entries.into_iter().rev().find_map(|e| match e.kind {
                                        LedgerEntryKind::Attempt(a) if a.stage_id == stage_id => Some(a),
                                        _ => None,
                                    }))
    }

    fn replay(&self, run_id: Uuid) -> Result<Run, LedgerError> {
        let entries = self.entries(run_id)?;
        if entries.is_empty() {
            return Err(LedgerError::RunNotFound(run_id));
        }
        Ok(replay_entries(run_id, &entries))
    }
}

impl<T: RunLedger + ?Sized> RunLedger for std::sync::Arc<T> {
    fn append(&self, run_id: Uuid, kind: LedgerEntryKind) -> Result<LedgerEntry, LedgerError> {
        (**self).append(run_id, kind)
    }

    fn entries(&self, run_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        (**self).entries(run_id)
    }

    fn runs(&self) -> Result<Vec<Uuid>, LedgerError> {
        (**self).runs()
    }
}

/// Reglas de orden que toda implementación aplica antes de persistir:
/// - nada se agrega después de `RunFinished`;
/// - `RunStarted` sólo como primera entrada;
/// - por stage, los attempts avanzan `(stage_id, attempt_number)`: un
///   `Started(n)` abierto sólo admite su terminal `n`, y tras un terminal `n`
///   sólo se admite `Started(m)` con `m > n`.
pub fn check_append_order(run_id: Uuid, existing: &[LedgerEntry], kind: &LedgerEntryKind) -> Result<(), LedgerError> {
    if existing.iter().any(|e| matches!(e.kind, LedgerEntryKind::RunFinished { .. })) {
        return Err(LedgerError::RunClosed(run_id));
    }
    match kind {
        LedgerEntryKind::RunStarted { .. } if !existing.is_empty() => {
            Err(LedgerError::WriteFailed(format!("run {run_id} already started")))
        }
        LedgerEntryKind::Attempt(attempt) => {
            let last = existing.iter().rev().find_map(|e| match &e.kind {
                                                 LedgerEntryKind::Attempt(a) if a.stage_id == attempt.stage_id => Some(a),
                                                 _ => None,
                                             });
            let in_order = match last {
                None => attempt.attempt_number >= 1 && attempt.outcome == AttemptOutcome::Started,
                Some(prev) if prev.outcome == AttemptOutcome::Started => {
                    attempt.outcome.is_terminal() && attempt.attempt_number == prev.attempt_number
                }
                Some(prev) => {
                    attempt.outcome == AttemptOutcome::Started && attempt.attempt_number > prev.attempt_number
                }
            };
            if in_order {
                Ok(())
            } else {
                Err(LedgerError::OutOfOrder { stage_id: attempt.stage_id.clone(),
                                              last: last.map(|a| a.attempt_number).unwrap_or(0),
                                              got: attempt.attempt_number })
            }
        }
        _ => Ok(()),
    }
}

/// Ledger en memoria (tests y runs efímeros).
#[derive(Default)]
pub struct InMemoryRunLedger {
    inner: Mutex<HashMap<Uuid, Vec<LedgerEntry>>>,
}

impl InMemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunLedger for InMemoryRunLedger {
    fn append(&self, run_id: Uuid, kind: LedgerEntryKind) -> Result<LedgerEntry, LedgerError> {
        let mut guard = self.inner
                            .lock()
                            .map_err(|_| LedgerError::WriteFailed("ledger lock poisoned".into()))?;
        let vec = guard.entry(run_id).or_default();
        check_append_order(run_id, vec, &kind)?;
        let entry = LedgerEntry { seq: vec.len() as u64,
                                  run_id,
                                  ts: Utc::now(),
                                  kind };
        vec.push(entry.clone());
        Ok(entry)
    }

    fn entries(&self, run_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let guard = self.inner
                        .lock()
                        .map_err(|_| LedgerError::ReadFailed("ledger lock poisoned".into()))?;
        Ok(guard.get(&run_id).cloned().unwrap_or_default())
    }

    fn runs(&self) -> Result<Vec<Uuid>, LedgerError> {
        let guard = self.inner
                        .lock()
                        .map_err(|_| LedgerError::ReadFailed("ledger lock poisoned".into()))?;
        let mut ids: Vec<Uuid> = guard.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}
