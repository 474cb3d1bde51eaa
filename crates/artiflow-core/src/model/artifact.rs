//! Artifact versionado.
//!
//! Un `Artifact` es el registro inmutable de una versión escrita en la
//! Artifact Store:
//! - Identidad = `(name, version)`. Una escritura nueva crea una versión nueva,
//!   nunca sobrescribe.
//! - `location` es un handle opaco; sólo la store que lo emitió sabe
//!   interpretarlo.
//! - `content_hash` es el hash canónico del payload (auditoría, no identidad).
//! - "latest" no vive aquí: es un puntero derivado que mantiene la store.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// Tipos de artifact conocidos.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Document,
    Json,
    FileTree,
    Report,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Document => "document",
            ArtifactKind::Json => "json",
            ArtifactKind::FileTree => "file_tree",
            ArtifactKind::Report => "report",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "document" | "doc" => Ok(ArtifactKind::Document),
            "json" => Ok(ArtifactKind::Json),
            "file_tree" | "file-tree" | "tree" => Ok(ArtifactKind::FileTree),
            "report" => Ok(ArtifactKind::Report),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// Selector de versión para `get` / `exists`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    #[default]
    Latest,
    Exact(u64),
}

/// Registro inmutable de una versión de artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    pub version: u64,
    pub location: String,
    pub produced_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
}

impl Artifact {
    /// Clave legible `name@vN`.
    pub fn key(&self) -> String {
        format!("{}@v{}", self.name, self.version)
    }
}

/// Los nombres se usan como segmento de ruta por los backends en disco: se
/// restringen a `[A-Za-z0-9_.-]`, sin punto inicial.
pub fn validate_artifact_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
                && name.len() <= 128
                && !name.starts_with('.')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_must_be_safe_path_segments() {
        assert!(validate_artifact_name("requirement.json").is_ok());
        assert!(validate_artifact_name("test_report-v2").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "a b", "x\\y"] {
            assert_eq!(validate_artifact_name(bad), Err(StoreError::InvalidName(bad.to_string())), "{bad:?}");
        }
    }

    #[test]
    fn kind_parses_both_spellings() {
        assert_eq!("file-tree".parse::<ArtifactKind>(), Ok(ArtifactKind::FileTree));
        assert_eq!("file_tree".parse::<ArtifactKind>(), Ok(ArtifactKind::FileTree));
        assert!("pdf".parse::<ArtifactKind>().is_err());
        assert_eq!(ArtifactKind::Report.to_string(), "report");
    }
}
