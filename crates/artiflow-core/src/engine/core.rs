//! Implementación del `Orchestrator`.
//!
//! El ledger es la única fuente de verdad del progreso: cada decisión del
//! motor parte de un `Run` reconstruido por replay, y `start`/`resume` sólo
//! difieren en cómo se obtiene ese primer `Run`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, info, warn};
use rayon::prelude::*;
use uuid::Uuid;

use super::attempt_loop::StageOutcome;
use super::builder::{OrchestratorBuilder, OrchestratorConfig};
use super::cancel::CancelHandle;
use super::report::RunReport;
use crate::errors::{CoreEngineError, LedgerError};
use crate::ledger::{LedgerEntryKind, RunLedger};
use crate::model::{Run, RunFailure, RunStatus};
use crate::plan::ExecutionPlan;
use crate::stage::StageStatus;
use crate::store::ArtifactStore;

/// Conduce runs de un `ExecutionPlan` sobre una store y un ledger.
pub struct Orchestrator<S: ArtifactStore, L: RunLedger> {
    pub(super) store: S,
    pub(super) ledger: L,
    pub(super) config: OrchestratorConfig,
    pub(super) cancel: CancelHandle,
    pool: Option<rayon::ThreadPool>,
    /// Runs con un driver activo en este proceso.
    active: DashMap<Uuid, ()>,
}

/// Libera el run al salir de `start`/`resume`, incluso con error.
struct ActiveRun<'a> {
    active: &'a DashMap<Uuid, ()>,
    run_id: Uuid,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl<S: ArtifactStore, L: RunLedger> Orchestrator<S, L> {
    pub fn builder(store: S, ledger: L) -> OrchestratorBuilder<S, L> {
        OrchestratorBuilder::new(store, ledger)
    }

    /// Orquestador secuencial con la configuración por defecto.
    pub fn new(store: S, ledger: L) -> Self {
        Self::builder(store, ledger).build()
    }

    pub(super) fn from_parts(store: S,
                             ledger: L,
                             config: OrchestratorConfig,
                             cancel: CancelHandle,
                             pool: Option<rayon::ThreadPool>)
                             -> Self {
        Self { store,
               ledger,
               config,
               cancel,
               pool,
               active: DashMap::new() }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Inicia un run nuevo con id aleatorio.
    pub fn start(&self, plan: &ExecutionPlan) -> Result<RunReport, CoreEngineError> {
        self.start_with_id(plan, Uuid::new_v4())
    }

    pub fn start_with_id(&self, plan: &ExecutionPlan, run_id: Uuid) -> Result<RunReport, CoreEngineError> {
        let _guard = self.claim(run_id)?;
        self.ledger.append(run_id,
                           LedgerEntryKind::RunStarted { definition_hash: plan.definition_hash().to_string(),
                                                         stage_ids: plan.stage_ids() })?;
        info!("[orchestrator] run {run_id} iniciado ({} stages, definition {})",
              plan.len(),
              plan.definition_hash());
        let run = self.ledger.replay(run_id)?;
        self.drive(plan, &run)
    }

    /// Reanuda un run existente. Los stages ya exitosos no se re-ejecutan y
    /// un run terminal se devuelve tal cual.
    pub fn resume(&self, plan: &ExecutionPlan, run_id: Uuid) -> Result<RunReport, CoreEngineError> {
        let _guard = self.claim(run_id)?;
        let run = self.ledger.replay(run_id)?;
        if run.definition_hash != plan.definition_hash() {
            return Err(CoreEngineError::DefinitionMismatch { expected: run.definition_hash,
                                                             found: plan.definition_hash().to_string() });
        }
        if run.status.is_terminal() {
            info!("[orchestrator] run {run_id} ya terminado ({:?}); nada que reanudar", run.status);
            return Ok(RunReport::from_run(&run));
        }
        info!("[orchestrator] reanudando run {run_id}");
        self.drive(plan, &run)
    }

    /// Registra la confirmación de un operador para un stage cuyo último
    /// intento tiene resultado desconocido.
    pub fn confirm(&self, run_id: Uuid, stage_id: &str) -> Result<(), CoreEngineError> {
        if self.active.contains_key(&run_id) {
            return Err(CoreEngineError::RunInProgress(run_id));
        }
        let run = self.ledger.replay(run_id)?;
        if !run.stage_ids.iter().any(|id| id == stage_id) {
            return Err(CoreEngineError::UnknownStage(stage_id.to_string()));
        }
        if run.status.is_terminal() {
            return Err(LedgerError::RunClosed(run_id).into());
        }
        self.ledger.append(run_id,
                           LedgerEntryKind::OperatorConfirmed { stage_id: stage_id.to_string() })?;
        info!("[orchestrator] run {run_id}: stage {stage_id} confirmado por operador");
        Ok(())
    }

    pub fn status(&self, run_id: Uuid) -> Result<RunReport, CoreEngineError> {
        Ok(RunReport::from_run(&self.ledger.replay(run_id)?))
    }

    pub fn runs(&self) -> Result<Vec<Uuid>, CoreEngineError> {
        Ok(self.ledger.runs()?)
    }

    fn claim(&self, run_id: Uuid) -> Result<ActiveRun<'_>, CoreEngineError> {
        match self.active.entry(run_id) {
            Entry::Occupied(_) => Err(CoreEngineError::RunInProgress(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ActiveRun { active: &self.active,
                               run_id })
            }
        }
    }

    fn drive(&self, plan: &ExecutionPlan, run: &Run) -> Result<RunReport, CoreEngineError> {
        let run_id = run.run_id;
        let mut done: BTreeSet<usize> = BTreeSet::new();
        let mut produced: BTreeMap<String, u64> = BTreeMap::new();
        for (idx, stage) in plan.stages().iter().enumerate() {
            if let Some(state) = run.stage(stage.id()).filter(|s| s.status == StageStatus::Succeeded) {
                done.insert(idx);
                produced.extend(state.output_versions.clone());
            }
        }

        loop {
            if done.len() == plan.len() {
                return self.finish(run_id, RunStatus::Succeeded, None);
            }
            if self.cancel.is_cancelled() {
                info!("[orchestrator] run {run_id}: cancelación solicitada");
                return self.finish(run_id, RunStatus::Aborted, None);
            }
            let wave = self.next_wave(plan, &done);
            if wave.is_empty() {
                return Err(CoreEngineError::Internal(format!("run {run_id}: no runnable stage left")));
            }

            let mut failure: Option<RunFailure> = None;
            let mut ambiguous: Option<(String, u32)> = None;
            let mut ledger_error: Option<LedgerError> = None;
            let mut cancelled = false;
            for (idx, outcome) in self.run_wave(plan, run, &wave, &produced) {
                match outcome {
                    StageOutcome::Succeeded(versions) => {
                        produced.extend(versions);
                        done.insert(idx);
                    }
                    StageOutcome::Failed(f) => {
                        failure.get_or_insert(f);
                    }
                    StageOutcome::Ambiguous { stage_id, attempt_number } => {
                        ambiguous.get_or_insert((stage_id, attempt_number));
                    }
                    StageOutcome::LedgerFailed(e) => {
                        ledger_error.get_or_insert(e);
                    }
                    StageOutcome::Cancelled => cancelled = true,
                }
            }

            if let Some(e) = ledger_error {
                return Ok(self.abort_on_ledger_error(run_id, e));
            }
            if let Some(f) = failure {
                return self.finish(run_id, RunStatus::Failed, Some(f));
            }
            if let Some((stage_id, attempt_number)) = ambiguous {
                warn!("[orchestrator] run {run_id}: stage {stage_id} intento {attempt_number} requiere confirmación");
                return Err(CoreEngineError::AmbiguousState { stage_id, attempt_number });
            }
            if cancelled {
                return self.finish(run_id, RunStatus::Aborted, None);
            }
        }
    }

    /// Stages listos: en secuencial, el primero pendiente en orden
    /// topológico; en paralelo, todos los pendientes con upstream completo.
    fn next_wave(&self, plan: &ExecutionPlan, done: &BTreeSet<usize>) -> Vec<usize> {
        let mut ready = (0..plan.len()).filter(|idx| !done.contains(idx))
                                       .filter(|&idx| plan.upstream_of(idx).is_subset(done));
        if self.pool.is_some() {
            ready.collect()
        } else {
            ready.next().into_iter().collect()
        }
    }

    fn run_wave(&self,
                plan: &ExecutionPlan,
                run: &Run,
                wave: &[usize],
                produced: &BTreeMap<String, u64>)
                -> Vec<(usize, StageOutcome)> {
        let job = |idx: usize| (idx, self.run_stage(run, &plan.stages()[idx], produced));
        match &self.pool {
            Some(pool) if wave.len() > 1 => pool.install(|| wave.par_iter().map(|&idx| job(idx)).collect()),
            _ => wave.iter().map(|&idx| job(idx)).collect(),
        }
    }

    fn finish(&self,
              run_id: Uuid,
              status: RunStatus,
              failure: Option<RunFailure>)
              -> Result<RunReport, CoreEngineError> {
        let entry = LedgerEntryKind::RunFinished { status,
                                                   failure: failure.clone() };
        if let Err(e) = self.ledger.append(run_id, entry) {
            return Ok(self.abort_on_ledger_error(run_id, e));
        }
        match (status, &failure) {
            (RunStatus::Failed, Some(f)) => {
                warn!("[orchestrator] run {run_id} falló en stage {} ({}, {} intentos)",
                      f.stage_id,
                      f.error_kind,
                      f.attempts)
            }
            _ => info!("[orchestrator] run {run_id} terminado: {status:?}"),
        }
        self.status(run_id)
    }

    /// Un fallo de escritura del ledger fuerza `Aborted`: sin registro
    /// durable el motor no puede seguir decidiendo.
    fn abort_on_ledger_error(&self, run_id: Uuid, err: LedgerError) -> RunReport {
        error!("[orchestrator] run {run_id}: fallo del ledger, abortando: {err}");
        let finished = LedgerEntryKind::RunFinished { status: RunStatus::Aborted,
                                                      failure: None };
        if let Err(e) = self.ledger.append(run_id, finished) {
            warn!("[orchestrator] run {run_id}: no se pudo registrar el cierre: {e}");
        }
        let mut report = match self.ledger.replay(run_id) {
            Ok(run) => RunReport::from_run(&run),
            Err(_) => RunReport { run_id,
                                  status: RunStatus::Aborted,
                                  failure: None,
                                  stages: Vec::new(),
                                  ledger_error: None },
        };
        report.status = RunStatus::Aborted;
        report.ledger_error = Some(err.to_string());
        report
    }
}

impl<S: ArtifactStore, L: RunLedger> fmt::Debug for Orchestrator<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
         .field("config", &self.config)
         .field("cancel", &self.cancel)
         .field("parallel_pool", &self.pool.is_some())
         .field("active_runs", &self.active.len())
         .finish()
    }
}
