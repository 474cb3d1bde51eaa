//! artiflow
//!
//! Binario y piezas de aplicación sobre los crates del workspace:
//! - `config`: `AppConfig` leído del entorno (.env incluido).
//! - `pipeline_file`: pipelines declarados en JSON como procesos externos.
//! - `cli`: comandos `run`, `status`, `confirm` y `seed`.
//! - `errors`: errores de aplicación y su código de salida.
//!
//! El motor vive en `artiflow-core`; la persistencia en disco en
//! `artiflow-persistence`; los stages concretos en `artiflow-adapters`.

pub mod cli;
pub mod config;
pub mod errors;
pub mod pipeline_file;

pub use config::AppConfig;
pub use errors::{AppError, ConfigError, PipelineFileError};
pub use pipeline_file::{load_pipeline, resolve_pipeline_path, LoadedPipeline, PipelineFile, StageEntry};
