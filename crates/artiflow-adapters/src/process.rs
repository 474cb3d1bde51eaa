//! Stage que delega en un programa externo.
//!
//! Por intento se crea `<work_root>/<run_id>/<stage_id>/attempt-<n>/` con:
//! - `inputs/`: un archivo por input (`<name>.json`, `<name>.txt`,
//!   `<name>.bin`) o un directorio para árboles de archivos;
//! - `outputs/`: donde el programa debe dejar cada output declarado.
//!
//! Las rutas llegan al programa por `ARTIFLOW_INPUT_<NAME>` y
//! `ARTIFLOW_OUTPUT_<NAME>` (nombre en mayúsculas, no alfanuméricos a `_`).
//! Salida 0 exige que existan todos los outputs; cualquier otro código es
//! fallo permanente salvo los listados en `transient_exit_codes` o una muerte
//! por señal. stdout y stderr quedan en `stdout.log` / `stderr.log` del
//! directorio del intento.
//!
//! Si el contexto trae `deadline`, el proceso se mata (`kill` + `wait`) al
//! vencer y el intento termina en `TimedOut`.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use artiflow_core::{ArtifactKind, Payload, StageContext, StageFailure, StageOutputs, StageRunner};
use log::{debug, info, warn};
use serde_json::{json, Value};
use walkdir::WalkDir;

/// EX_TEMPFAIL de sysexits.h.
pub const DEFAULT_TRANSIENT_EXIT_CODES: &[i32] = &[75];

const STDERR_TAIL: usize = 2_000;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn env_key(prefix: &str, name: &str) -> String {
    let suffix: String = name.chars()
                             .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                             .collect();
    format!("{prefix}{suffix}")
}

fn io_failure(what: &str, path: &Path, err: io::Error) -> StageFailure {
    StageFailure::transient(format!("{what} {}: {err}", path.display()))
}

fn output_path(dir: &Path, name: &str, kind: ArtifactKind) -> PathBuf {
    match kind {
        ArtifactKind::FileTree => dir.join(name),
        ArtifactKind::Json => dir.join(format!("{name}.json")),
        ArtifactKind::Document | ArtifactKind::Report => dir.join(name),
    }
}

fn text_or_binary(bytes: Vec<u8>) -> Payload {
    match String::from_utf8(bytes) {
        Ok(text) => Payload::Text(text),
        Err(e) => Payload::Binary(e.into_bytes()),
    }
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_end();
    let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
    trimmed.chars().skip(skip).collect()
}

/// Lee lo que haya en `path` como payload del tipo `kind`.
/// Árboles: cada archivo regular bajo `path`, con rutas relativas `/`.
pub fn payload_from_path(name: &str, kind: ArtifactKind, path: &Path) -> Result<Payload, StageFailure> {
    if !path.exists() {
        return Err(StageFailure::permanent(format!("{name}: nothing at {}", path.display())));
    }
    if kind == ArtifactKind::FileTree {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| StageFailure::transient(format!("cannot walk {}: {e}", path.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path()
                           .strip_prefix(path)
                           .map_err(|e| StageFailure::permanent(e.to_string()))?
                           .to_string_lossy()
                           .replace('\\', "/");
            let bytes = fs::read(entry.path()).map_err(|e| io_failure("cannot read", entry.path(), e))?;
            files.insert(rel, String::from_utf8_lossy(&bytes).into_owned());
        }
        return Ok(Payload::Tree(files));
    }

    let bytes = fs::read(path).map_err(|e| io_failure("cannot read", path, e))?;
    match kind {
        ArtifactKind::Json => serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| StageFailure::permanent(format!("{name} is not valid JSON: {e}"))),
        ArtifactKind::Report => match serde_json::from_slice(&bytes) {
            Ok(v) => Ok(Payload::Json(v)),
            Err(_) => Ok(text_or_binary(bytes)),
        },
        _ => Ok(text_or_binary(bytes)),
    }
}

#[derive(Debug, Clone)]
pub struct ProcessStage {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    work_root: PathBuf,
    transient_exit_codes: Vec<i32>,
}

impl ProcessStage {
    pub fn new(program: impl Into<String>, work_root: impl Into<PathBuf>) -> Self {
        Self { program: program.into(),
               args: Vec::new(),
               env: BTreeMap::new(),
               work_root: work_root.into(),
               transient_exit_codes: DEFAULT_TRANSIENT_EXIT_CODES.to_vec() }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
        where I: IntoIterator<Item = S>,
              S: Into<String>
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }

    fn attempt_dir(&self, ctx: &StageContext) -> PathBuf {
        self.work_root
            .join(ctx.run_id.to_string())
            .join(&ctx.stage_id)
            .join(format!("attempt-{}", ctx.attempt_number))
    }

    fn materialise_input(dir: &Path, name: &str, payload: &Payload) -> Result<PathBuf, StageFailure> {
        let path = match payload {
            Payload::Json(v) => {
                let path = dir.join(format!("{name}.json"));
                let body = serde_json::to_vec_pretty(v).map_err(|e| StageFailure::permanent(e.to_string()))?;
                fs::write(&path, body).map_err(|e| io_failure("cannot write", &path, e))?;
                path
            }
            Payload::Text(s) => {
                let path = dir.join(format!("{name}.txt"));
                fs::write(&path, s).map_err(|e| io_failure("cannot write", &path, e))?;
                path
            }
            Payload::Binary(b) => {
                let path = dir.join(format!("{name}.bin"));
                fs::write(&path, b).map_err(|e| io_failure("cannot write", &path, e))?;
                path
            }
            Payload::Tree(files) => {
                let root = dir.join(name);
                for (rel, body) in files {
                    let safe = Path::new(rel).components().all(|c| matches!(c, Component::Normal(_)));
                    if !safe {
                        return Err(StageFailure::permanent(format!("input {name} has unsafe path {rel:?}")));
                    }
                    let path = root.join(rel);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).map_err(|e| io_failure("cannot create", parent, e))?;
                    }
                    fs::write(&path, body).map_err(|e| io_failure("cannot write", &path, e))?;
                }
                fs::create_dir_all(&root).map_err(|e| io_failure("cannot create", &root, e))?;
                root
            }
        };
        Ok(path)
    }

    /// Espera al hijo. Con plazo, sondea `try_wait` y al vencer lo mata y
    /// recoge su estado antes de devolver `TimedOut`.
    fn wait_for(&self, mut child: Child, ctx: &StageContext) -> Result<ExitStatus, StageFailure> {
        let started = Instant::now();
        let Some(deadline) = ctx.deadline else {
            return child.wait().map_err(|e| StageFailure::transient(format!("cannot wait for {}: {e}", self.program)));
        };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    warn!("[process] {}: {} sigue corriendo al vencer el plazo; se mata", ctx.stage_id, self.program);
                    if let Err(e) = child.kill() {
                        debug!("[process] kill {}: {e}", self.program);
                    }
                    child.wait()
                         .map_err(|e| StageFailure::transient(format!("cannot reap {}: {e}", self.program)))?;
                    return Err(StageFailure::TimedOut(started.elapsed().as_millis() as u64));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))),
                Err(e) => return Err(StageFailure::transient(format!("cannot wait for {}: {e}", self.program))),
            }
        }
    }

    fn classify_exit(&self, status: ExitStatus, stderr: &[u8]) -> StageFailure {
        let stderr = tail(stderr);
        match status.code() {
            Some(code) if self.transient_exit_codes.contains(&code) => {
                StageFailure::transient(format!("{} exited with {code}: {stderr}", self.program))
            }
            Some(code) => StageFailure::permanent(format!("{} exited with {code}: {stderr}", self.program)),
            None => StageFailure::transient(format!("{} killed by signal: {stderr}", self.program)),
        }
    }
}

impl StageRunner for ProcessStage {
    fn execute(&self, ctx: &StageContext) -> Result<StageOutputs, StageFailure> {
        let dir = self.attempt_dir(ctx);
        let inputs_dir = dir.join("inputs");
        let outputs_dir = dir.join("outputs");
        for d in [&inputs_dir, &outputs_dir] {
            fs::create_dir_all(d).map_err(|e| io_failure("cannot create", d, e))?;
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
           .current_dir(&dir)
           .envs(&self.env)
           .env("ARTIFLOW_RUN_ID", ctx.run_id.to_string())
           .env("ARTIFLOW_STAGE_ID", &ctx.stage_id)
           .env("ARTIFLOW_ATTEMPT", ctx.attempt_number.to_string())
           .env("ARTIFLOW_WORK_DIR", &dir);
        for (name, input) in &ctx.inputs {
            let path = Self::materialise_input(&inputs_dir, name, &input.payload)?;
            cmd.env(env_key("ARTIFLOW_INPUT_", name), path);
        }
        let mut expected = Vec::with_capacity(ctx.outputs.len());
        for (name, kind) in &ctx.outputs {
            let path = output_path(&outputs_dir, name, *kind);
            if *kind == ArtifactKind::FileTree {
                fs::create_dir_all(&path).map_err(|e| io_failure("cannot create", &path, e))?;
            }
            cmd.env(env_key("ARTIFLOW_OUTPUT_", name), &path);
            expected.push((name, *kind, path));
        }

        let stdout_path = dir.join("stdout.log");
        let stderr_path = dir.join("stderr.log");
        let stdout = File::create(&stdout_path).map_err(|e| io_failure("cannot create", &stdout_path, e))?;
        let stderr = File::create(&stderr_path).map_err(|e| io_failure("cannot create", &stderr_path, e))?;
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

        info!("[process] {} -> {} {:?}", ctx.stage_id, self.program, self.args);
        let child = cmd.spawn().map_err(|e| match e.kind() {
                                   io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                                       StageFailure::permanent(format!("cannot start {}: {e}", self.program))
                                   }
                                   _ => StageFailure::transient(format!("cannot start {}: {e}", self.program)),
                               })?;
        let status = self.wait_for(child, ctx)?;
        if !status.success() {
            let stderr = fs::read(&stderr_path).unwrap_or_default();
            return Err(self.classify_exit(status, &stderr));
        }
        debug!("[process] {} terminó", ctx.stage_id);

        expected.into_iter()
                .map(|(name, kind, path)| Ok::<_, StageFailure>((name.clone(), payload_from_path(name, kind, &path)?)))
                .collect()
    }

    fn params(&self) -> Value {
        json!({
            "program": self.program,
            "args": self.args,
            "env": self.env,
            "transient_exit_codes": self.transient_exit_codes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_keys_are_shell_safe() {
        assert_eq!(env_key("ARTIFLOW_INPUT_", "requirement_pkgs"), "ARTIFLOW_INPUT_REQUIREMENT_PKGS");
        assert_eq!(env_key("ARTIFLOW_OUTPUT_", "test-report.v2"), "ARTIFLOW_OUTPUT_TEST_REPORT_V2");
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL + 10) + "END";
        let t = tail(long.as_bytes());
        assert_eq!(t.chars().count(), STDERR_TAIL);
        assert!(t.ends_with("END"));
    }
}
