//! Configuración de la aplicación.
//! Carga variables de entorno (.env) una sola vez y construye un `AppConfig`
//! inmutable que el CLI pasa explícitamente a cada componente.
//!
//! Variables:
//! - `ARTIFLOW_HOME`: raíz de artifacts y ledger (por defecto `.artiflow`).
//! - `ARTIFLOW_WORK_DIR`: directorios de trabajo de los stages (`<home>/work`).
//! - `ARTIFLOW_PIPELINES_DIR`: dónde buscar pipelines por nombre (`pipelines`).
//! - `ARTIFLOW_PARALLEL`, `ARTIFLOW_MAX_PARALLEL`, `ARTIFLOW_DEFAULT_TIMEOUT_MS`.
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use artiflow_core::OrchestratorConfig;
use artiflow_persistence::{init_dotenv, StorageConfig};

use crate::errors::ConfigError;

pub const DEFAULT_PIPELINES_DIR: &str = "pipelines";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub work_dir: PathBuf,
    pub pipelines_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Lee el entorno del proceso (tras cargar `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        init_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una fuente de variables arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
        where F: Fn(&str) -> Option<String>
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let storage = match get("ARTIFLOW_HOME") {
            Some(home) => StorageConfig::new(home),
            None => StorageConfig::new(artiflow_persistence::config::DEFAULT_HOME),
        };
        let work_dir = get("ARTIFLOW_WORK_DIR").map(PathBuf::from)
                                               .unwrap_or_else(|| storage.home.join("work"));
        let pipelines_dir = get("ARTIFLOW_PIPELINES_DIR").map(PathBuf::from)
                                                         .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINES_DIR));

        let mut orchestrator = OrchestratorConfig::default();
        if let Some(v) = get("ARTIFLOW_PARALLEL") {
            orchestrator.parallel = parse_bool("ARTIFLOW_PARALLEL", &v)?;
        }
        if let Some(v) = get("ARTIFLOW_MAX_PARALLEL") {
            orchestrator.max_parallel = parse_positive("ARTIFLOW_MAX_PARALLEL", &v)? as usize;
        }
        if let Some(v) = get("ARTIFLOW_DEFAULT_TIMEOUT_MS") {
            let ms = parse_positive("ARTIFLOW_DEFAULT_TIMEOUT_MS", &v)?;
            orchestrator.default_timeout = Some(Duration::from_millis(ms));
        }

        Ok(Self { storage,
                  work_dir,
                  pipelines_dir,
                  orchestrator })
    }

    /// Reemplaza la raíz de almacenamiento; el directorio de trabajo la sigue
    /// salvo que se haya fijado explícitamente.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        let old_default = self.storage.home.join("work");
        self.storage = StorageConfig::new(home);
        if self.work_dir == old_default {
            self.work_dir = self.storage.home.join("work");
        }
        self
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { var,
                                            value: value.to_string() }),
    }
}

fn parse_positive(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidNumber { var,
                                              value: value.to_string() }),
    }
}
