use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use artiflow_core::{build_plan, ArtifactKind, ArtifactStore, Attempt, Backoff, ExecutionPlan, LedgerEntryKind, Orchestrator,
                    Payload, RetryPolicy, RunLedger, RunStatus, Stage, StageContext, StageFailure, Version};
use artiflow_persistence::{FsArtifactStore, JsonlRunLedger, StorageConfig};
use chrono::Utc;
use uuid::Uuid;

fn plan(calls: Arc<AtomicUsize>) -> ExecutionPlan {
    let fetch = Stage::from_fn("fetch", |ctx: &StageContext| {
                    let issue = ctx.input_text("issue")?;
                    Ok(BTreeMap::from([("brd".to_string(), Payload::text(format!("BRD for {issue}")))]))
                }).input("issue")
                  .output("brd", ArtifactKind::Document);
    let extract = Stage::from_fn("extract", move |ctx: &StageContext| {
                      if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                          return Err(StageFailure::transient("model overloaded"));
                      }
                      let brd = ctx.input_text("brd")?;
                      Ok(BTreeMap::from([("requirement".to_string(),
                                          Payload::Json(serde_json::json!({ "source": brd })))]))
                  }).input("brd")
                    .output("requirement", ArtifactKind::Json)
                    .retry(RetryPolicy::new(2, Backoff::Linear { step_ms: 5 }));
    build_plan(vec![fetch, extract]).expect("plan")
}

fn open(cfg: &StorageConfig) -> Orchestrator<FsArtifactStore, JsonlRunLedger> {
    Orchestrator::new(FsArtifactStore::from_config(cfg), JsonlRunLedger::from_config(cfg))
}

#[test]
fn run_persists_artifacts_and_ledger() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = StorageConfig::new(dir.path());
    let engine = open(&cfg);
    engine.store().put("issue", ArtifactKind::Document, Payload::text("PROJ-42")).expect("seed");

    let calls = Arc::new(AtomicUsize::new(0));
    let report = engine.start(&plan(calls)).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_of("extract"), 2);

    // Otro proceso ve el mismo estado.
    let reopened = open(&cfg);
    let status = reopened.status(report.run_id).expect("status");
    assert_eq!(status, report);
    let (_, requirement) = reopened.store().load("requirement", Version::Latest).expect("requirement");
    assert_eq!(requirement, Payload::Json(serde_json::json!({ "source": "BRD for PROJ-42" })));
    assert_eq!(reopened.runs().expect("runs"), vec![report.run_id]);
}

#[test]
fn interrupted_run_resumes_in_a_new_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = StorageConfig::new(dir.path());
    let calls = Arc::new(AtomicUsize::new(1));
    let plan = plan(calls.clone());

    // Primer proceso: fetch terminó, extract quedó a medias.
    let run_id = Uuid::new_v4();
    {
        let engine = open(&cfg);
        engine.store().put("issue", ArtifactKind::Document, Payload::text("PROJ-7")).expect("seed");
        let brd = engine.store().put("brd", ArtifactKind::Document, Payload::text("BRD for PROJ-7")).expect("brd");
        let ledger = engine.ledger();
        ledger.append(run_id,
                      LedgerEntryKind::RunStarted { definition_hash: plan.definition_hash().to_string(),
                                                    stage_ids: plan.stage_ids() })
              .expect("started");
        let fetch = Attempt::started("fetch", 1, Utc::now());
        ledger.append_attempt(run_id, fetch.clone()).expect("fetch");
        ledger.append_attempt(run_id, fetch.succeeded(Utc::now(), BTreeMap::from([("brd".to_string(), brd.version)])))
              .expect("fetch ok");
        ledger.append_attempt(run_id, Attempt::started("extract", 1, Utc::now())).expect("extract");
    }

    let engine = open(&cfg);
    let report = engine.resume(&plan, run_id).expect("resume");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_of("fetch"), 1);
    assert_eq!(report.attempts_of("extract"), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let again = open(&cfg).resume(&plan, run_id).expect("no-op");
    assert_eq!(again, report);
}
