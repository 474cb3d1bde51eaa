//! Stages respaldados por un modelo de lenguaje.
//!
//! `LlmStage` renderiza una plantilla tera con los inputs resueltos
//! (`{{ inputs.brd }}`, `{{ inputs["requirement-pkgs"] }}`), llama al modelo y
//! valida la respuesta según `OutputFormat`. La configuración del modelo se
//! fija al construir el stage y entra al hash de definición vía `params()`.

use std::collections::BTreeMap;
use std::sync::Arc;

use artiflow_core::{Payload, StageContext, StageFailure, StageOutputs, StageRunner};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::file_blocks::parse_file_blocks;
use crate::json_extraction::extract_json;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited(_) | LlmError::Network(_))
    }
}

impl From<LlmError> for StageFailure {
    fn from(err: LlmError) -> Self {
        if err.is_retryable() {
            StageFailure::transient(err.to_string())
        } else {
            StageFailure::permanent(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { model: "gpt-4o".to_string(),
               temperature: 0.0,
               max_tokens: None }
    }
}

/// Colaborador externo. Las implementaciones clasifican sus errores:
/// red y rate-limit son transitorios, una petición rechazada es permanente.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str, config: &LlmConfig) -> Result<String, LlmError>;

    /// Consulta sobre un índice de documentos previamente cargado.
    fn query(&self, index: &str, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    /// Extrae el JSON de la respuesta; no encontrarlo es fallo permanente.
    Json,
    /// Bloques de código con ruta, guardados como árbol de archivos.
    FileTree,
}

pub struct LlmStage {
    client: Arc<dyn LlmClient>,
    template: String,
    config: LlmConfig,
    output: String,
    format: OutputFormat,
    index: Option<String>,
}

impl LlmStage {
    pub fn new(client: Arc<dyn LlmClient>, template: impl Into<String>, output: impl Into<String>) -> Self {
        Self { client,
               template: template.into(),
               config: LlmConfig::default(),
               output: output.into(),
               format: OutputFormat::Text,
               index: None }
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Usa `query` sobre el índice dado en lugar de `complete`.
    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn render_prompt(&self, ctx: &StageContext) -> Result<String, StageFailure> {
        let inputs: BTreeMap<&str, String> = ctx.inputs
                                                .iter()
                                                .map(|(name, input)| (name.as_str(), input.payload.render()))
                                                .collect();
        let mut context = tera::Context::new();
        context.insert("inputs", &inputs);
        context.insert("stage_id", &ctx.stage_id);
        context.insert("attempt", &ctx.attempt_number);
        tera::Tera::one_off(&self.template, &context, false).map_err(|e| {
            StageFailure::permanent(format!("failed to render prompt for {}: {e}", ctx.stage_id))
        })
    }

    fn parse_response(&self, response: &str) -> Result<Payload, StageFailure> {
        match self.format {
            OutputFormat::Text => Ok(Payload::text(response)),
            OutputFormat::Json => Ok(Payload::Json(extract_json(response)?)),
            OutputFormat::FileTree => {
                let files = parse_file_blocks(response);
                if files.is_empty() {
                    return Err(StageFailure::permanent("model response contains no file blocks"));
                }
                Ok(Payload::Tree(files))
            }
        }
    }
}

impl StageRunner for LlmStage {
    fn execute(&self, ctx: &StageContext) -> Result<StageOutputs, StageFailure> {
        let prompt = self.render_prompt(ctx)?;
        debug!("[llm] {} prompt de {} caracteres", ctx.stage_id, prompt.len());
        let response = match &self.index {
            Some(index) => self.client.query(index, &prompt),
            None => self.client.complete(&prompt, &self.config),
        };
        let response = response.inspect_err(|e| warn!("[llm] {} falló: {e}", ctx.stage_id))?;
        let payload = self.parse_response(&response)?;
        Ok(BTreeMap::from([(self.output.clone(), payload)]))
    }

    fn params(&self) -> Value {
        json!({
            "template": self.template,
            "config": self.config,
            "format": self.format,
            "index": self.index,
        })
    }
}
