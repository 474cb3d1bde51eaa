//! Extracción de JSON desde respuestas de modelos.
//!
//! Estrategias, en orden:
//! 1. El texto completo es JSON.
//! 2. Bloques de código con cerca (```json primero, luego cualquiera).
//! 3. Primer objeto/array balanceado encontrado por conteo de llaves.
//! 4. Regex codiciosa `{...}` / `[...]` sobre todo el texto.
//!
//! No encontrar JSON es un fallo permanente: reintentar la misma salida no
//! cambia el resultado.

use artiflow_core::StageFailure;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static FENCED: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)```([A-Za-z0-9_-]*)[^\n]*\n(.*?)```").ok());
static GREEDY: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?s)(\{.*\}|\[.*\])").ok());

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JsonExtractionError {
    #[error("JSON appears truncated: {unclosed} unclosed delimiters. Partial: {preview}...")]
    Truncated { preview: String, unclosed: usize },
    #[error("no JSON content found in response. Content starts with: '{preview}'")]
    NotFound { preview: String },
}

impl From<JsonExtractionError> for StageFailure {
    fn from(err: JsonExtractionError) -> Self {
        StageFailure::permanent(err.to_string())
    }
}

fn preview(s: &str, max: usize) -> String {
    s.trim().chars().take(max).collect()
}

fn parse(candidate: &str) -> Option<Value> {
    serde_json::from_str(candidate.trim()).ok()
}

/// Primer valor balanceado que empieza en `start` (posición de `{` o `[`).
/// Devuelve `Err(profundidad)` si el texto se acaba antes de cerrar.
fn balanced_from(s: &str, start: usize) -> Result<&str, usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(&s[start..start + i + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    Err(depth)
}

pub fn extract_json(text: &str) -> Result<Value, JsonExtractionError> {
    if let Some(v) = parse(text) {
        return Ok(v);
    }

    if let Some(fenced) = FENCED.as_ref() {
        let blocks: Vec<(String, String)> = fenced.captures_iter(text)
                                                  .map(|c| (c[1].to_ascii_lowercase(), c[2].to_string()))
                                                  .collect();
        let json_first = blocks.iter().filter(|(lang, _)| lang == "json");
        let others = blocks.iter().filter(|(lang, _)| lang != "json");
        if let Some(v) = json_first.chain(others).find_map(|(_, body)| parse(body)) {
            return Ok(v);
        }
    }

    let mut truncated: Option<(usize, usize)> = None;
    for (start, _) in text.char_indices().filter(|(_, c)| matches!(c, '{' | '[')) {
        match balanced_from(text, start) {
            Ok(candidate) => {
                if let Some(v) = parse(candidate) {
                    return Ok(v);
                }
            }
            Err(unclosed) => {
                truncated.get_or_insert((start, unclosed));
            }
        }
    }

    if let Some(v) = GREEDY.as_ref()
                           .and_then(|re| re.find(text))
                           .and_then(|m| parse(m.as_str()))
    {
        return Ok(v);
    }

    match truncated {
        Some((start, unclosed)) => Err(JsonExtractionError::Truncated { preview: preview(&text[start..], 100),
                                                                        unclosed }),
        None => Err(JsonExtractionError::NotFound { preview: preview(text, 50) }),
    }
}
