//! Bucle de intentos de un stage: resolución de inputs, `execute` con
//! timeout, persistencia de outputs y reintentos con backoff.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info, warn};

use super::core::Orchestrator;
use crate::constants::{ERROR_KIND_INTERRUPTED, ERROR_KIND_PARTIAL_SUCCESS, ERROR_KIND_UNRESOLVED_INPUT};
use crate::errors::{LedgerError, StageFailure, StoreError};
use crate::ledger::RunLedger;
use crate::model::{Artifact, Attempt, AttemptOutcome, Run, RunFailure, StageState, Version};
use crate::stage::{ResolvedInput, Stage, StageContext, StageOutputs, StageStatus};
use crate::store::ArtifactStore;

/// Resultado de conducir un stage dentro de una ola.
#[derive(Debug)]
pub(super) enum StageOutcome {
    Succeeded(BTreeMap<String, u64>),
    Failed(RunFailure),
    /// Intento con resultado desconocido en un stage no idempotente.
    Ambiguous { stage_id: String, attempt_number: u32 },
    LedgerFailed(LedgerError),
    Cancelled,
}

/// Intentos que consumen presupuesto de reintento. Los cierres por crash
/// (`interrupted`), los `partial_success` y los timeouts de un stage no
/// idempotente no cuentan: su resultado es desconocido.
fn charged_attempts(run: &Run, stage: &Stage) -> u32 {
    run.attempts
       .iter()
       .filter(|a| a.stage_id == stage.id())
       .filter(|a| matches!(a.outcome, AttemptOutcome::Failed | AttemptOutcome::TimedOut))
       .filter(|a| !outcome_unknown(stage, a))
       .count() as u32
}

/// ¿Pudo este intento terminado dejar efectos sin que lo sepamos?
fn outcome_unknown(stage: &Stage, attempt: &Attempt) -> bool {
    matches!(attempt.error_kind.as_deref(),
             Some(ERROR_KIND_INTERRUPTED) | Some(ERROR_KIND_PARTIAL_SUCCESS))
    || (!stage.is_idempotent() && attempt.outcome == AttemptOutcome::TimedOut)
}

fn failure_from_state(stage_id: &str, state: &StageState) -> RunFailure {
    RunFailure { stage_id: stage_id.to_string(),
                 error_kind: state.last_error_kind().unwrap_or("failed").to_string(),
                 detail: state.last.as_ref().and_then(|a| a.error_detail.clone()),
                 attempts: state.attempts }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let msg = payload.downcast_ref::<&str>()
                     .map(|s| s.to_string())
                     .or_else(|| payload.downcast_ref::<String>().cloned())
                     .unwrap_or_else(|| "unknown panic".to_string());
    format!("stage panicked: {msg}")
}

/// Los outputs devueltos deben coincidir exactamente con los declarados y
/// encajar en su kind.
fn check_outputs(stage: &Stage, outputs: &StageOutputs) -> Result<(), StageFailure> {
    let declared = stage.output_kinds();
    let returned: Vec<&String> = outputs.keys().collect();
    if !returned.iter().copied().eq(declared.keys()) {
        return Err(StageFailure::permanent(format!("stage {} returned outputs {:?}, declared {:?}",
                                                   stage.id(),
                                                   returned,
                                                   declared.keys().collect::<Vec<_>>())));
    }
    for (name, payload) in outputs {
        if let Some(kind) = declared.get(name).filter(|k| !payload.fits(**k)) {
            return Err(StageFailure::permanent(format!("output {name} does not fit kind {kind}")));
        }
    }
    Ok(())
}

impl<S: ArtifactStore, L: RunLedger> Orchestrator<S, L> {
    pub(super) fn run_stage(&self,
                            run: &Run,
                            stage: &Stage,
                            produced: &BTreeMap<String, u64>)
                            -> StageOutcome {
        let run_id = run.run_id;
        let stage_id = stage.id();
        let prior = run.stage(stage_id).cloned().unwrap_or_default();
        let policy = stage.retry_policy();
        let mut charged = charged_attempts(run, stage);

        let unknown_outcome = prior.in_flight() || prior.last.as_ref().is_some_and(|a| outcome_unknown(stage, a));
        if unknown_outcome {
            if !stage.is_idempotent() && !prior.confirmed {
                return StageOutcome::Ambiguous { stage_id: stage_id.to_string(),
                                                 attempt_number: prior.attempts };
            }
            if let Some(open) = prior.last.as_ref().filter(|_| prior.in_flight()) {
                info!("[orchestrator] run {run_id}: cerrando intento {} de {stage_id} como interrumpido",
                      open.attempt_number);
                if let Err(e) = self.ledger.append_attempt(run_id, open.interrupted(Utc::now())) {
                    return StageOutcome::LedgerFailed(e);
                }
            }
        } else if prior.status == StageStatus::Failed && !prior.confirmed {
            let permanent = prior.last_error_kind() == Some("permanent");
            if permanent || !policy.allows_retry_after(charged) {
                debug!("[orchestrator] run {run_id}: {stage_id} ya agotó sus intentos");
                return StageOutcome::Failed(failure_from_state(stage_id, &prior));
            }
        }

        let resolved = match self.resolve_inputs(stage, produced) {
            Ok(resolved) => resolved,
            Err((artifact, err)) => {
                warn!("[orchestrator] run {run_id}: {stage_id} no puede resolver {artifact}: {err}");
                return StageOutcome::Failed(RunFailure { stage_id: stage_id.to_string(),
                                                         error_kind: ERROR_KIND_UNRESOLVED_INPUT.to_string(),
                                                         detail: Some(format!("{artifact}: {err}")),
                                                         attempts: prior.attempts });
            }
        };

        let mut attempt_number = prior.attempts + 1;
        loop {
            let started = Attempt::started(stage_id, attempt_number, Utc::now());
            if let Err(e) = self.ledger.append_attempt(run_id, started.clone()) {
                return StageOutcome::LedgerFailed(e);
            }
            info!("[orchestrator] run {run_id}: {stage_id} intento {attempt_number}");

            let result = self.read_inputs(&resolved).and_then(|inputs| {
                                                       let ctx = StageContext { run_id,
                                                                                stage_id: stage_id.to_string(),
                                                                                attempt_number,
                                                                                inputs,
                                                                                outputs: stage.output_kinds().clone(),
                                                                                deadline: None };
                                                       self.invoke(stage, ctx)
                                                   });
            let result = result.and_then(|outputs| check_outputs(stage, &outputs).map(|_| outputs));

            let failure = match result {
                Ok(outputs) => match self.persist_outputs(stage, outputs) {
                    Ok(versions) => {
                        if let Err(e) = self.ledger
                                            .append_attempt(run_id, started.succeeded(Utc::now(), versions.clone()))
                        {
                            return StageOutcome::LedgerFailed(e);
                        }
                        info!("[orchestrator] run {run_id}: {stage_id} ok {versions:?}");
                        return StageOutcome::Succeeded(versions);
                    }
                    Err(err) if !stage.is_idempotent() => {
                        warn!("[orchestrator] run {run_id}: {stage_id} terminó pero sus outputs no se guardaron: {err}");
                        let partial = started.partial_success(Utc::now(), err.to_string());
                        if let Err(e) = self.ledger.append_attempt(run_id, partial) {
                            return StageOutcome::LedgerFailed(e);
                        }
                        return StageOutcome::Ambiguous { stage_id: stage_id.to_string(),
                                                         attempt_number };
                    }
                    Err(err) => err.to_stage_failure(),
                },
                Err(failure) => failure,
            };

            if let Err(e) = self.ledger.append_attempt(run_id, started.failed(Utc::now(), &failure)) {
                return StageOutcome::LedgerFailed(e);
            }
            if matches!(failure, StageFailure::TimedOut(_)) && !stage.is_idempotent() {
                warn!("[orchestrator] run {run_id}: {stage_id} no idempotente venció en el intento {attempt_number}; requiere confirmación");
                return StageOutcome::Ambiguous { stage_id: stage_id.to_string(),
                                                 attempt_number };
            }
            charged += 1;

            if !failure.is_retryable() || !policy.allows_retry_after(charged) {
                return StageOutcome::Failed(RunFailure { stage_id: stage_id.to_string(),
                                                         error_kind: failure.error_kind().to_string(),
                                                         detail: Some(failure.detail()),
                                                         attempts: attempt_number });
            }
            let delay = policy.backoff.delay(charged);
            warn!("[orchestrator] run {run_id}: {stage_id} intento {attempt_number} falló ({failure}); reintento en {delay:?}");
            if self.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            if self.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            attempt_number += 1;
        }
    }

    /// Fija la versión de cada input antes de marcar el stage en curso:
    /// la producida en este run si su productor está en el plan, la última
    /// promovida en caso contrario.
    fn resolve_inputs(&self,
                      stage: &Stage,
                      produced: &BTreeMap<String, u64>)
                      -> Result<BTreeMap<String, Artifact>, (String, StoreError)> {
        stage.input_names()
             .iter()
             .map(|name| {
                 let version = produced.get(name).map(|v| Version::Exact(*v)).unwrap_or(Version::Latest);
                 self.store
                     .get(name, version)
                     .map(|artifact| (name.clone(), artifact))
                     .map_err(|e| (name.clone(), e))
             })
             .collect()
    }

    fn read_inputs(&self,
                   resolved: &BTreeMap<String, Artifact>)
                   -> Result<BTreeMap<String, ResolvedInput>, StageFailure> {
        resolved.iter()
                .map(|(name, artifact)| {
                    let payload = self.store.read(artifact).map_err(|e| e.to_stage_failure())?;
                    Ok::<_, StageFailure>((name.clone(),
                                           ResolvedInput { artifact: artifact.clone(),
                                                           payload }))
                })
                .collect()
    }

    /// Ejecuta el runner. Con timeout, `execute` corre en un hilo propio y
    /// recibe el plazo en `ctx.deadline`. Al vencer, el intento se da por
    /// perdido pero no se devuelve hasta que el hilo termine: nunca hay dos
    /// ejecuciones del mismo stage a la vez.
    fn invoke(&self, stage: &Stage, mut ctx: StageContext) -> Result<StageOutputs, StageFailure> {
        let runner = stage.runner();
        let Some(limit) = stage.timeout_limit().or(self.config.default_timeout) else {
            return catch_unwind(AssertUnwindSafe(|| runner.execute(&ctx))).unwrap_or_else(|p| {
                                                                              Err(StageFailure::permanent(panic_message(p)))
                                                                          });
        };
        ctx.deadline = Some(Instant::now() + limit);
        let stage_id = ctx.stage_id.clone();

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new().name(format!("stage-{stage_id}")).spawn(move || {
                          let result = catch_unwind(AssertUnwindSafe(|| runner.execute(&ctx)))
                              .unwrap_or_else(|p| Err(StageFailure::permanent(panic_message(p))));
                          let _ = tx.send(result);
                      });
        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => return Err(StageFailure::transient(format!("cannot spawn stage worker: {e}"))),
        };
        match rx.recv_timeout(limit) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("[orchestrator] {stage_id}: plazo de {limit:?} vencido; esperando a que el runner retorne");
                if worker.join().is_err() {
                    debug!("[orchestrator] {stage_id}: el hilo del runner terminó con pánico");
                }
                Err(StageFailure::TimedOut(limit.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(StageFailure::permanent("stage worker exited without a result")),
        }
    }

    /// Escribe todas las versiones y sólo entonces las promueve.
    fn persist_outputs(&self, stage: &Stage, outputs: StageOutputs) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut staged = Vec::with_capacity(outputs.len());
        for (name, payload) in outputs {
            let kind = stage.output_kinds()
                            .get(&name)
                            .copied()
                            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
            staged.push(self.store.stage_version(&name, kind, payload, Some(stage.id()))?);
        }
        self.store.promote(&staged)?;
        Ok(staged.into_iter().map(|a| (a.name, a.version)).collect())
    }
}
