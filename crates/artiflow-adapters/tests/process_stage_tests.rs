#![cfg(unix)]

use std::thread;
use std::time::Duration;

use artiflow_adapters::ProcessStage;
use artiflow_core::{build_plan, ArtifactKind, ArtifactStore, Backoff, InMemoryArtifactStore, InMemoryRunLedger,
                    Orchestrator, Payload, RetryPolicy, RunStatus, Stage, Version};

fn sh(work: &std::path::Path, script: &str) -> ProcessStage {
    ProcessStage::new("sh", work).args(["-c", script])
}

fn orchestrator() -> Orchestrator<InMemoryArtifactStore, InMemoryRunLedger> {
    Orchestrator::new(InMemoryArtifactStore::new(), InMemoryRunLedger::new())
}

#[test]
fn inputs_and_outputs_travel_through_files() {
    let work = tempfile::tempdir().expect("tempdir");
    let engine = orchestrator();
    engine.store().put("brd", ArtifactKind::Document, Payload::text("todo app")).expect("seed");

    let builder = Stage::new("builder",
                             sh(work.path(),
                                r#"tr a-z A-Z < "$ARTIFLOW_INPUT_BRD" > "$ARTIFLOW_OUTPUT_SUMMARY"
                                   printf '{"packages": ["flask"]}' > "$ARTIFLOW_OUTPUT_REQUIREMENT_PKGS""#))
        .input("brd")
        .output("summary", ArtifactKind::Document)
        .output("requirement_pkgs", ArtifactKind::Json);
    let coder = Stage::new("coder",
                           sh(work.path(),
                              r#"mkdir -p "$ARTIFLOW_OUTPUT_PROJECT/app"
                                 cp "$ARTIFLOW_INPUT_SUMMARY" "$ARTIFLOW_OUTPUT_PROJECT/app/README""#))
        .input("summary")
        .output("project", ArtifactKind::FileTree);
    let plan = build_plan(vec![builder, coder]).expect("plan");

    let report = engine.start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded, "{report:?}");

    let (_, summary) = engine.store().load("summary", Version::Latest).expect("summary");
    assert_eq!(summary.as_text(), Some("TODO APP"));
    let (_, pkgs) = engine.store().load("requirement_pkgs", Version::Latest).expect("pkgs");
    assert_eq!(pkgs, Payload::Json(serde_json::json!({"packages": ["flask"]})));
    let (_, project) = engine.store().load("project", Version::Latest).expect("project");
    match project {
        Payload::Tree(files) => assert_eq!(files.get("app/README").map(String::as_str), Some("TODO APP")),
        other => panic!("expected a file tree, got {other:?}"),
    }
}

#[test]
fn tempfail_exit_code_is_retried() {
    let work = tempfile::tempdir().expect("tempdir");
    // El directorio del stage es compartido entre intentos.
    let stage = Stage::new("venv",
                           sh(work.path(),
                              r#"if [ -f ../flag ]; then echo ok > "$ARTIFLOW_OUTPUT_VENV"; else touch ../flag; exit 75; fi"#))
        .output("venv", ArtifactKind::Document)
        .retry(RetryPolicy::new(3, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.attempts_of("venv"), 2);
}

#[test]
fn other_exit_codes_are_permanent_and_keep_stderr() {
    let work = tempfile::tempdir().expect("tempdir");
    let stage = Stage::new("tests", sh(work.path(), "echo 'pytest: 3 failed' >&2; exit 2"))
        .output("test_report", ArtifactKind::Report)
        .retry(RetryPolicy::new(3, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.attempts_of("tests"), 1);
    let failure = report.failure.expect("failure");
    assert_eq!(failure.error_kind, "permanent");
    assert!(failure.detail.unwrap_or_default().contains("pytest: 3 failed"));
}

#[test]
fn missing_output_file_is_permanent() {
    let work = tempfile::tempdir().expect("tempdir");
    let stage = Stage::new("lazy", sh(work.path(), "exit 0")).output("result", ArtifactKind::Document)
                                                              .retry(RetryPolicy::new(2, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.attempts_of("lazy"), 1);
}

#[test]
fn missing_program_is_permanent() {
    let work = tempfile::tempdir().expect("tempdir");
    let stage = Stage::new("ghost", ProcessStage::new("artiflow-no-such-program", work.path()))
        .output("x", ArtifactKind::Document)
        .retry(RetryPolicy::new(3, Backoff::None));
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.attempts_of("ghost"), 1);
}

#[test]
fn timed_out_process_is_killed_before_the_next_attempt() {
    let work = tempfile::tempdir().expect("tempdir");
    let marker = work.path().join("marker");
    let script = format!("sleep 1; echo ran >> '{}'", marker.display());
    let stage = Stage::new("slow", sh(work.path(), &script)).output("x", ArtifactKind::Document)
                                                             .retry(RetryPolicy::new(2, Backoff::None))
                                                             .timeout(Duration::from_millis(100));
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.attempts_of("slow"), 2);
    assert_eq!(report.failure.expect("failure").error_kind, "timed_out");

    // Ningún intento llega a escribir después de terminar el run.
    thread::sleep(Duration::from_millis(1_500));
    assert!(!marker.exists(), "a killed attempt kept running");
}

#[test]
fn process_output_is_kept_in_the_attempt_dir() {
    let work = tempfile::tempdir().expect("tempdir");
    let stage = Stage::new("noisy", sh(work.path(), r#"echo building; echo warn >&2; echo ok > "$ARTIFLOW_OUTPUT_X""#))
        .output("x", ArtifactKind::Document);
    let plan = build_plan(vec![stage]).expect("plan");
    let report = orchestrator().start(&plan).expect("run");
    assert_eq!(report.status, RunStatus::Succeeded);

    let dir = work.path().join(report.run_id.to_string()).join("noisy").join("attempt-1");
    assert_eq!(std::fs::read_to_string(dir.join("stdout.log")).expect("stdout"), "building\n");
    assert_eq!(std::fs::read_to_string(dir.join("stderr.log")).expect("stderr"), "warn\n");
}
