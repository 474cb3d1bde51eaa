//! artiflow-adapters: stages concretos sobre el contrato `StageRunner`.
//!
//! - `process`: ejecuta un programa externo con inputs/outputs en archivos.
//! - `llm`: plantilla de prompt + llamada a modelo + validación de salida.
//! - `json_extraction` / `file_blocks`: parseo de texto libre de modelos.

pub mod file_blocks;
pub mod json_extraction;
pub mod llm;
pub mod process;

pub use file_blocks::parse_file_blocks;
pub use json_extraction::{extract_json, JsonExtractionError};
pub use llm::{LlmClient, LlmConfig, LlmError, LlmStage, OutputFormat};
pub use process::{payload_from_path, ProcessStage};
