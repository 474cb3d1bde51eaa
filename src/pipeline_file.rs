//! Definición de pipelines en JSON.
//!
//! Un archivo declara los stages como procesos externos:
//!
//! ```json
//! {
//!   "name": "agents",
//!   "stages": [
//!     { "id": "builder", "program": "python3",
//!       "args": ["{pipeline_dir}/agents/02_builder_agent.py"],
//!       "inputs": ["brd"],
//!       "outputs": { "requirement": "json" },
//!       "retry": { "max_attempts": 3, "backoff": { "strategy": "fixed", "delay_ms": 2000 } } }
//!   ]
//! }
//! ```
//!
//! `{pipeline_dir}` en `program`, `args` y valores de `env` se reemplaza por el
//! directorio del archivo, ya que cada proceso corre en su propio directorio
//! de intento.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use artiflow_adapters::ProcessStage;
use artiflow_adapters::process::DEFAULT_TRANSIENT_EXIT_CODES;
use artiflow_core::{build_plan, ArtifactKind, ExecutionPlan, RetryPolicy, Stage};
use serde::Deserialize;

use crate::errors::PipelineFileError;

const PIPELINE_DIR_VAR: &str = "{pipeline_dir}";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineFile {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stages: Vec<StageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageEntry {
    pub id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ArtifactKind>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

fn default_idempotent() -> bool {
    true
}

fn default_transient_exit_codes() -> Vec<i32> {
    DEFAULT_TRANSIENT_EXIT_CODES.to_vec()
}

/// Pipeline cargado: la definición original y el plan ya validado.
#[derive(Debug)]
pub struct LoadedPipeline {
    pub path: PathBuf,
    pub file: PipelineFile,
    pub plan: ExecutionPlan,
}

impl PipelineFile {
    pub fn parse(path: &Path, text: &str) -> Result<Self, PipelineFileError> {
        serde_json::from_str(text).map_err(|source| PipelineFileError::Parse { path: path.to_path_buf(),
                                                                               source })
    }

    /// Convierte cada entrada en un `ProcessStage` y construye el plan.
    /// Ciclos, ids duplicados y productores duplicados fallan aquí.
    pub fn to_plan(&self, pipeline_dir: &Path, work_dir: &Path) -> Result<ExecutionPlan, PipelineFileError> {
        let dir = pipeline_dir.to_string_lossy();
        let expand = |s: &str| s.replace(PIPELINE_DIR_VAR, &dir);

        let mut stages = Vec::with_capacity(self.stages.len());
        for entry in &self.stages {
            if entry.program.trim().is_empty() {
                return Err(PipelineFileError::EmptyProgram(entry.id.clone()));
            }
            let mut runner = ProcessStage::new(expand(&entry.program), work_dir)
                .args(entry.args.iter().map(|a| expand(a)))
                .transient_exit_codes(entry.transient_exit_codes.clone());
            for (key, value) in &entry.env {
                runner = runner.env(key.clone(), expand(value));
            }

            let mut stage = Stage::new(entry.id.clone(), runner).inputs(entry.inputs.iter().cloned())
                                                                .retry(entry.retry)
                                                                .idempotent(entry.idempotent);
            for (name, kind) in &entry.outputs {
                stage = stage.output(name.clone(), *kind);
            }
            if let Some(ms) = entry.timeout_ms {
                stage = stage.timeout(Duration::from_millis(ms));
            }
            stages.push(stage);
        }
        Ok(build_plan(stages)?)
    }
}

/// Acepta una ruta existente o un nombre buscado como `<dir>/<nombre>.json`.
pub fn resolve_pipeline_path(reference: &str, pipelines_dir: &Path) -> Result<PathBuf, PipelineFileError> {
    let direct = PathBuf::from(reference);
    if direct.is_file() {
        return Ok(direct);
    }
    let named = pipelines_dir.join(format!("{reference}.json"));
    if named.is_file() {
        return Ok(named);
    }
    Err(PipelineFileError::NotFound(reference.to_string()))
}

pub fn load_pipeline(path: &Path, work_dir: &Path) -> Result<LoadedPipeline, PipelineFileError> {
    let text = fs::read_to_string(path).map_err(|source| PipelineFileError::Io { path: path.to_path_buf(),
                                                                                 source })?;
    let file = PipelineFile::parse(path, &text)?;
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let pipeline_dir = fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());
    let plan = file.to_plan(&pipeline_dir, work_dir)?;
    Ok(LoadedPipeline { path: path.to_path_buf(),
                        file,
                        plan })
}

#[cfg(test)]
mod tests {
    use super::*;
    use artiflow_core::{Backoff, PlanError, StageRunner};

    fn parse(text: &str) -> PipelineFile {
        PipelineFile::parse(Path::new("inline.json"), text).expect("parse")
    }

    #[test]
    fn defaults_for_optional_fields() {
        let file = parse(r#"{"name": "p", "stages": [{"id": "a", "program": "true"}]}"#);
        let entry = &file.stages[0];
        assert!(entry.idempotent);
        assert_eq!(entry.retry, RetryPolicy::none());
        assert_eq!(entry.transient_exit_codes, vec![75]);
        assert!(entry.outputs.is_empty());
    }

    #[test]
    fn retry_and_kinds_are_read() {
        let file = parse(r#"{"name": "p", "stages": [{
            "id": "venv", "program": "sh", "idempotent": false, "timeout_ms": 500,
            "outputs": {"venv": "document", "project": "file_tree"},
            "retry": {"max_attempts": 4, "backoff": {"strategy": "exponential", "base_ms": 10, "max_ms": 40}}
        }]}"#);
        let entry = &file.stages[0];
        assert!(!entry.idempotent);
        assert_eq!(entry.retry, RetryPolicy::new(4, Backoff::Exponential { base_ms: 10, max_ms: 40 }));
        assert_eq!(entry.outputs.get("project"), Some(&ArtifactKind::FileTree));
        assert_eq!(entry.timeout_ms, Some(500));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PipelineFile::parse(Path::new("x.json"),
                                      r#"{"name": "p", "stages": [{"id": "a", "program": "true", "retries": 3}]}"#)
            .unwrap_err();
        assert!(matches!(err, PipelineFileError::Parse { .. }));
    }

    #[test]
    fn pipeline_dir_placeholder_is_expanded() {
        let file = parse(r#"{"name": "p", "stages": [{"id": "a", "program": "{pipeline_dir}/run.sh",
                              "outputs": {"x": "json"}}]}"#);
        let plan = file.to_plan(Path::new("/opt/defs"), Path::new("/tmp/work")).expect("plan");
        let params = plan.stage("a").expect("stage").runner().params();
        assert_eq!(params["program"], "/opt/defs/run.sh");
    }

    #[test]
    fn empty_program_is_a_definition_error() {
        let file = parse(r#"{"name": "p", "stages": [{"id": "a", "program": " "}]}"#);
        let err = file.to_plan(Path::new("."), Path::new("w")).unwrap_err();
        assert!(matches!(err, PipelineFileError::EmptyProgram(id) if id == "a"));
    }

    #[test]
    fn cycles_fail_before_anything_runs() {
        let file = parse(r#"{"name": "p", "stages": [
            {"id": "a", "program": "true", "inputs": ["y"], "outputs": {"x": "json"}},
            {"id": "b", "program": "true", "inputs": ["x"], "outputs": {"y": "json"}}
        ]}"#);
        let err = file.to_plan(Path::new("."), Path::new("w")).unwrap_err();
        assert!(matches!(err, PipelineFileError::Plan(PlanError::CyclicDependency(_))));
    }
}
