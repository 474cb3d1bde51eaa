use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use artiflow_core::ledger::replay_entries;
use artiflow_core::{build_plan, Artifact, ArtifactKind, ArtifactStore, Attempt, AttemptOutcome, Backoff, CoreEngineError,
                    ExecutionPlan, InMemoryArtifactStore, InMemoryRunLedger, LedgerEntryKind, LedgerError, Orchestrator,
                    Payload, RetryPolicy, RunLedger, RunStatus, Stage, StageContext, StageFailure, StageOutputs,
                    StoreError, Version};
use chrono::Utc;
use uuid::Uuid;

fn text_out(name: &str, body: &str) -> StageOutputs {
    BTreeMap::from([(name.to_string(), Payload::text(body))])
}

fn counted(calls: Arc<AtomicUsize>, output: &'static str) -> impl Fn(&StageContext) -> Result<StageOutputs, StageFailure> + Send + Sync {
    move |_ctx: &StageContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(text_out(output, output))
    }
}

struct Counters {
    builder: Arc<AtomicUsize>,
    coder: Arc<AtomicUsize>,
}

/// builder -> coder (no idempotente, escribe código).
fn two_stage_plan(coder_idempotent: bool) -> (ExecutionPlan, Counters) {
    let counters = Counters { builder: Arc::new(AtomicUsize::new(0)),
                              coder: Arc::new(AtomicUsize::new(0)) };
    let builder = Stage::from_fn("builder", counted(counters.builder.clone(), "spec"))
        .output("spec", ArtifactKind::Document);
    let coder = Stage::from_fn("coder", counted(counters.coder.clone(), "code"))
        .input("spec")
        .output("code", ArtifactKind::Document)
        .idempotent(coder_idempotent);
    (build_plan(vec![builder, coder]).expect("plan"), counters)
}

/// Simula un proceso que murió tras marcar `coder` como iniciado.
fn crashed_run(engine: &Orchestrator<InMemoryArtifactStore, InMemoryRunLedger>, plan: &ExecutionPlan) -> Uuid {
    let run_id = Uuid::new_v4();
    let ledger = engine.ledger();
    ledger.append(run_id,
                  LedgerEntryKind::RunStarted { definition_hash: plan.definition_hash().to_string(),
                                                stage_ids: plan.stage_ids() })
          .expect("started");
    let spec = engine.store()
                     .stage_version("spec", ArtifactKind::Document, Payload::text("spec"), Some("builder"))
                     .expect("stage spec");
    engine.store().promote(std::slice::from_ref(&spec)).expect("promote");
    let now = Utc::now();
    let b1 = Attempt::started("builder", 1, now);
    ledger.append_attempt(run_id, b1.clone()).expect("b1");
    ledger.append_attempt(run_id, b1.succeeded(now, BTreeMap::from([("spec".to_string(), spec.version)])))
          .expect("b1 ok");
    ledger.append_attempt(run_id, Attempt::started("coder", 1, now)).expect("c1");
    run_id
}

fn orchestrator() -> Orchestrator<InMemoryArtifactStore, InMemoryRunLedger> {
    Orchestrator::new(InMemoryArtifactStore::new(), InMemoryRunLedger::new())
}

#[test]
fn replay_is_deterministic() {
    let (plan, _) = two_stage_plan(true);
    let engine = orchestrator();
    let report = engine.start(&plan).expect("run");

    let entries = engine.ledger().entries(report.run_id).expect("entries");
    let first = replay_entries(report.run_id, &entries);
    let second = replay_entries(report.run_id, &entries);
    assert_eq!(first, second);
    assert_eq!(first, engine.ledger().replay(report.run_id).expect("replay"));
    assert_eq!(first.status, RunStatus::Succeeded);
}

#[test]
fn resuming_a_finished_run_is_a_no_op() {
    let (plan, counters) = two_stage_plan(true);
    let engine = orchestrator();
    let report = engine.start(&plan).expect("run");
    let entries_before = engine.ledger().entries(report.run_id).expect("entries").len();

    let again = engine.resume(&plan, report.run_id).expect("resume");
    assert_eq!(again, report);
    assert_eq!(engine.ledger().entries(report.run_id).expect("entries").len(), entries_before);
    assert_eq!(counters.builder.load(Ordering::SeqCst), 1);
    assert_eq!(counters.coder.load(Ordering::SeqCst), 1);
}

#[test]
fn resume_skips_succeeded_stages_and_reruns_idempotent_in_flight() {
    let (plan, counters) = two_stage_plan(true);
    let engine = orchestrator();
    let run_id = crashed_run(&engine, &plan);

    let report = engine.resume(&plan, run_id).expect("resume");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(counters.builder.load(Ordering::SeqCst), 0);
    assert_eq!(counters.coder.load(Ordering::SeqCst), 1);

    let run = engine.ledger().replay(run_id).expect("replay");
    let coder: Vec<(u32, AttemptOutcome, Option<String>)> =
        run.finished_attempts("coder").iter().map(|a| (a.attempt_number, a.outcome, a.error_kind.clone())).collect();
    assert_eq!(coder,
               vec![(1, AttemptOutcome::Failed, Some("interrupted".to_string())),
                    (2, AttemptOutcome::Success, None)]);
}

#[test]
fn non_idempotent_in_flight_attempt_requires_confirmation() {
    let (plan, counters) = two_stage_plan(false);
    let engine = orchestrator();
    let run_id = crashed_run(&engine, &plan);

    let err = engine.resume(&plan, run_id).expect_err("ambiguous");
    assert_eq!(err,
               CoreEngineError::AmbiguousState { stage_id: "coder".into(),
                                                 attempt_number: 1 });
    assert_eq!(counters.coder.load(Ordering::SeqCst), 0);
    // Sigue sin decidir hasta que alguien confirme.
    assert!(engine.resume(&plan, run_id).is_err());
    assert_eq!(engine.status(run_id).expect("status").status, RunStatus::Running);

    engine.confirm(run_id, "coder").expect("confirm");
    let report = engine.resume(&plan, run_id).expect("resume after confirm");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_of("coder"), 2);
    assert_eq!(counters.coder.load(Ordering::SeqCst), 1);
}

#[test]
fn confirm_rejects_unknown_stage_and_finished_runs() {
    let (plan, _) = two_stage_plan(true);
    let engine = orchestrator();
    let report = engine.start(&plan).expect("run");

    assert_eq!(engine.confirm(report.run_id, "nope"),
               Err(CoreEngineError::UnknownStage("nope".into())));
    assert_eq!(engine.confirm(report.run_id, "coder"),
               Err(CoreEngineError::Ledger(LedgerError::RunClosed(report.run_id))));
    assert!(matches!(engine.confirm(Uuid::new_v4(), "coder"),
                     Err(CoreEngineError::Ledger(LedgerError::RunNotFound(_)))));
}

#[test]
fn changed_definition_cannot_resume() {
    let (plan, _) = two_stage_plan(true);
    let engine = orchestrator();
    let run_id = crashed_run(&engine, &plan);

    let (changed, _) = two_stage_plan(false);
    let err = engine.resume(&changed, run_id).expect_err("mismatch");
    assert!(matches!(err, CoreEngineError::DefinitionMismatch { .. }));
}

#[test]
fn resume_does_not_grant_a_fresh_retry_budget() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stage = Stage::from_fn("fetch", counted(calls.clone(), "page"))
        .output("page", ArtifactKind::Document)
        .retry(RetryPolicy::new(2, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let engine = orchestrator();

    // Dos intentos transitorios agotados; el proceso murió antes de cerrar el run.
    let run_id = Uuid::new_v4();
    let ledger = engine.ledger();
    ledger.append(run_id,
                  LedgerEntryKind::RunStarted { definition_hash: plan.definition_hash().to_string(),
                                                stage_ids: plan.stage_ids() })
          .expect("started");
    for n in 1..=2 {
        let a = Attempt::started("fetch", n, Utc::now());
        ledger.append_attempt(run_id, a.clone()).expect("start");
        ledger.append_attempt(run_id, a.failed(Utc::now(), &StageFailure::transient("503")))
              .expect("fail");
    }

    let report = engine.resume(&plan, run_id).expect("resume");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failure.as_ref().map(|f| f.attempts), Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

/// Store cuyo `promote` falla una vez.
struct FlakyPromoteStore {
    inner: InMemoryArtifactStore,
    failed_once: AtomicBool,
}

impl ArtifactStore for FlakyPromoteStore {
    fn stage_version(&self,
                     name: &str,
                     kind: ArtifactKind,
                     payload: Payload,
                     produced_by: Option<&str>)
                     -> Result<Artifact, StoreError> {
        self.inner.stage_version(name, kind, payload, produced_by)
    }

    fn promote(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Backend { transient: true,
                                             detail: "connection reset".into() });
        }
        self.inner.promote(artifacts)
    }

    fn get(&self, name: &str, version: Version) -> Result<Artifact, StoreError> {
        self.inner.get(name, version)
    }

    fn read(&self, artifact: &Artifact) -> Result<Payload, StoreError> {
        self.inner.read(artifact)
    }

    fn versions(&self, name: &str) -> Result<Vec<Artifact>, StoreError> {
        self.inner.versions(name)
    }
}

fn flaky_store() -> FlakyPromoteStore {
    FlakyPromoteStore { inner: InMemoryArtifactStore::new(),
                        failed_once: AtomicBool::new(false) }
}

#[test]
fn store_failure_after_execute_is_partial_success_for_non_idempotent_stage() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stage = Stage::from_fn("deploy", counted(calls.clone(), "receipt"))
        .output("receipt", ArtifactKind::Document)
        .idempotent(false)
        .retry(RetryPolicy::new(3, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let engine = Orchestrator::new(flaky_store(), InMemoryRunLedger::new());

    let run_id = Uuid::new_v4();
    let err = engine.start_with_id(&plan, run_id).expect_err("ambiguous");
    assert_eq!(err,
               CoreEngineError::AmbiguousState { stage_id: "deploy".into(),
                                                 attempt_number: 1 });
    let last = engine.ledger().last_attempt(run_id, "deploy").expect("read").expect("attempt");
    assert!(last.is_partial_success());
    assert!(!engine.store().exists("receipt", Version::Latest));

    engine.confirm(run_id, "deploy").expect("confirm");
    let report = engine.resume(&plan, run_id).expect("resume");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn store_failure_on_idempotent_stage_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let stage = Stage::from_fn("render", counted(calls.clone(), "html"))
        .output("html", ArtifactKind::Document)
        .retry(RetryPolicy::new(2, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let engine = Orchestrator::new(flaky_store(), InMemoryRunLedger::new());

    let report = engine.start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_of("render"), 2);
    // La versión escrita por el intento fallido nunca fue visible como latest.
    let latest = engine.store().get("html", Version::Latest).expect("latest");
    assert_eq!(latest.version, 2);
}
