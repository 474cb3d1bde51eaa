//! Comandos del binario `artiflow`.
//!
//! - `run <pipeline> [--run-id <uuid>]`: arranca un run, o lo reanuda si el
//!   ledger ya conoce ese id.
//! - `status [<run-id>]`: informe de un run, o la lista de runs.
//! - `confirm <run-id> <stage-id>`: decisión del operador ante un intento de
//!   resultado desconocido.
//! - `seed <name> <file> --kind <kind>`: publica un input externo.
//!
//! Códigos de salida: 0 éxito, 1 run fallido o error de definición/config,
//! 2 run abortado, 3 confirmación del operador requerida.
use std::io::{self, Write};
use std::path::PathBuf;

use artiflow_adapters::payload_from_path;
use artiflow_core::{ArtifactKind, ArtifactStore, Orchestrator, RunReport};
use artiflow_persistence::{FsArtifactStore, JsonlRunLedger};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::AppError;
use crate::pipeline_file::{load_pipeline, resolve_pipeline_path};

pub type Engine = Orchestrator<FsArtifactStore, JsonlRunLedger>;

#[derive(Debug, Parser)]
#[command(name = "artiflow", version, about = "Runs artifact pipelines with retries and a resumable run ledger")]
pub struct Cli {
    /// Nivel de log cuando RUST_LOG no está definido.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Raíz de artifacts y ledger; sustituye a ARTIFLOW_HOME.
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ejecuta (o reanuda) un pipeline.
    Run {
        /// Ruta al archivo o nombre bajo ARTIFLOW_PIPELINES_DIR.
        pipeline: String,
        #[arg(long)]
        run_id: Option<Uuid>,
        /// Ejecuta en paralelo las ramas independientes.
        #[arg(long)]
        parallel: bool,
    },
    /// Muestra el estado de un run, o lista todos.
    Status { run_id: Option<Uuid> },
    /// Autoriza reejecutar un stage con resultado desconocido.
    Confirm { run_id: Uuid, stage_id: String },
    /// Publica un archivo (o directorio) como nueva versión de un artifact.
    Seed {
        name: String,
        file: PathBuf,
        #[arg(long, default_value = "document")]
        kind: ArtifactKind,
    },
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub fn open_engine(cfg: &AppConfig) -> Engine {
    let store = FsArtifactStore::from_config(&cfg.storage);
    let ledger = JsonlRunLedger::from_config(&cfg.storage);
    Orchestrator::builder(store, ledger).config(cfg.orchestrator.clone()).build()
}

/// Punto de entrada del binario: carga la configuración del entorno,
/// ejecuta el comando y traduce el resultado a código de salida.
pub fn run_with_cli(cli: Cli) -> i32 {
    let result = AppConfig::from_env().map_err(AppError::from)
                                      .and_then(|cfg| execute(cli, cfg, &mut io::stdout()));
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

/// Ejecuta un comando ya parseado con una configuración explícita. Lo que el
/// usuario debe ver (informes JSON, listados) se escribe en `out`.
pub fn execute<W: Write>(cli: Cli, cfg: AppConfig, out: &mut W) -> Result<i32, AppError> {
    let mut cfg = match cli.home {
        Some(home) => cfg.with_home(home),
        None => cfg,
    };

    match cli.command {
        Command::Run { pipeline, run_id, parallel } => {
            if parallel {
                cfg.orchestrator.parallel = true;
            }
            let engine = open_engine(&cfg);
            let report = run_pipeline(&engine, &cfg, &pipeline, run_id)?;
            write_json(out, &report)?;
            Ok(report.exit_code())
        }
        Command::Status { run_id: Some(run_id) } => {
            let report = open_engine(&cfg).status(run_id)?;
            write_json(out, &report)?;
            Ok(0)
        }
        Command::Status { run_id: None } => {
            let engine = open_engine(&cfg);
            for run_id in engine.runs()? {
                let report = engine.status(run_id)?;
                let failed_stage = report.failure.as_ref().map(|f| f.stage_id.as_str()).unwrap_or("-");
                writeln!(out, "{run_id}\t{:?}\t{failed_stage}", report.status).map_err(output_error)?;
            }
            Ok(0)
        }
        Command::Confirm { run_id, stage_id } => {
            open_engine(&cfg).confirm(run_id, &stage_id)?;
            info!("[cli] run {run_id}: stage {stage_id} confirmado por el operador");
            Ok(0)
        }
        Command::Seed { name, file, kind } => {
            let payload = payload_from_path(&name, kind, &file).map_err(|e| AppError::Seed { name: name.clone(),
                                                                                             detail: e.detail() })?;
            let artifact = open_engine(&cfg).store().put(&name, kind, payload)?;
            info!("[cli] seed {} v{}", artifact.name, artifact.version);
            write_json(out, &artifact)?;
            Ok(0)
        }
    }
}

/// Arranca o reanuda. Con `--run-id` de un run existente se reanuda contra
/// el mismo plan; un id nuevo arranca un run con ese id.
pub fn run_pipeline(engine: &Engine,
                    cfg: &AppConfig,
                    pipeline: &str,
                    run_id: Option<Uuid>)
                    -> Result<RunReport, AppError> {
    let path = resolve_pipeline_path(pipeline, &cfg.pipelines_dir)?;
    let loaded = load_pipeline(&path, &cfg.work_dir)?;
    info!("[cli] pipeline {} ({} stages) desde {}",
          loaded.file.name,
          loaded.plan.len(),
          loaded.path.display());

    let report = match run_id {
        Some(id) if engine.runs()?.contains(&id) => {
            info!("[cli] reanudando run {id}");
            engine.resume(&loaded.plan, id)?
        }
        Some(id) => engine.start_with_id(&loaded.plan, id)?,
        None => engine.start(&loaded.plan)?,
    };

    if let Some(detail) = &report.ledger_error {
        warn!("[cli] run {} abortado por el ledger: {detail}", report.run_id);
    }
    if let Some(failure) = &report.failure {
        warn!("[cli] run {} {:?}: stage {} ({}) tras {} intentos",
              report.run_id,
              report.status,
              failure.stage_id,
              failure.error_kind,
              failure.attempts);
    } else {
        info!("[cli] run {} {:?}", report.run_id, report.status);
    }
    Ok(report)
}

fn write_json<W: Write, T: serde::Serialize>(out: &mut W, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out).map_err(output_error)
}

fn output_error(e: io::Error) -> AppError {
    AppError::Output(serde_json::Error::io(e))
}
