use std::path::PathBuf;

use artiflow_core::{CoreEngineError, PlanError, StoreError};
use thiserror::Error;

/// Errores de configuración leída del entorno.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a boolean, got {value:?}")]
    InvalidBool { var: &'static str, value: String },
    #[error("{var} must be a positive integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

/// Errores al cargar un archivo de pipeline.
#[derive(Debug, Error)]
pub enum PipelineFileError {
    #[error("pipeline {0} not found")]
    NotFound(String),
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid pipeline file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("stage {0}: program must not be empty")]
    EmptyProgram(String),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Lo que puede terminar un comando del CLI antes de tener un `RunReport`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineFileError),
    #[error(transparent)]
    Engine(#[from] CoreEngineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot seed {name}: {detail}")]
    Seed { name: String, detail: String },
    #[error("cannot render output: {0}")]
    Output(#[from] serde_json::Error),
}

impl AppError {
    /// Código de salida: 3 cuando hace falta confirmación del operador, 1 en
    /// cualquier otro caso.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Engine(CoreEngineError::AmbiguousState { .. }) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_state_asks_for_the_operator() {
        let err = AppError::from(CoreEngineError::AmbiguousState { stage_id: "venv".into(),
                                                                    attempt_number: 2 });
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn definition_errors_exit_with_one() {
        let err = AppError::from(PipelineFileError::Plan(PlanError::CyclicDependency("a".into())));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "cyclic dependency involving stage a");
    }

    #[test]
    fn config_error_format() {
        let err = ConfigError::InvalidNumber { var: "ARTIFLOW_MAX_PARALLEL",
                                               value: "x".into() };
        assert_eq!(err.to_string(), "ARTIFLOW_MAX_PARALLEL must be a positive integer, got \"x\"");
    }
}
