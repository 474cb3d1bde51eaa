//! Contenido de un artifact.
//!
//! El motor no interpreta el payload: lo pasa tal cual de la store al stage y
//! del stage a la store. Sólo valida que encaje con el `ArtifactKind`
//! declarado.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ArtifactKind;
use crate::hashing::{hash_bytes, hash_str, hash_value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// Documento o reporte en texto.
    Text(String),
    /// Registro JSON ya validado por el stage.
    Json(Value),
    /// Árbol de ficheros: ruta relativa -> contenido.
    Tree(BTreeMap<String, String>),
    /// Contenido binario opaco (p.ej. un PDF).
    Binary(Vec<u8>),
}

impl Payload {
    pub fn text(s: impl Into<String>) -> Self {
        Payload::Text(s.into())
    }

    /// ¿Puede este payload almacenarse bajo `kind`?
    pub fn fits(&self, kind: ArtifactKind) -> bool {
        matches!((kind, self),
                 (ArtifactKind::Json, Payload::Json(_))
                 | (ArtifactKind::FileTree, Payload::Tree(_))
                 | (ArtifactKind::Document, Payload::Text(_) | Payload::Binary(_))
                 | (ArtifactKind::Report, Payload::Text(_) | Payload::Json(_) | Payload::Binary(_)))
    }

    pub fn content_hash(&self) -> String {
        match self {
            Payload::Text(s) => hash_str(s),
            Payload::Json(v) => hash_value(v),
            Payload::Tree(files) => {
                let v = serde_json::to_value(files).unwrap_or(Value::Null);
                hash_value(&v)
            }
            Payload::Binary(b) => hash_bytes(b),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Representación textual usada al interpolar inputs en prompts.
    pub fn render(&self) -> String {
        match self {
            Payload::Text(s) => s.clone(),
            Payload::Json(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            Payload::Tree(files) => files.iter()
                                         .map(|(path, body)| format!("--- {path}\n{body}"))
                                         .collect::<Vec<_>>()
                                         .join("\n"),
            Payload::Binary(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}
