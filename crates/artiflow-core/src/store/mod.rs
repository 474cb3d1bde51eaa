//! Artifact Store: almacenamiento versionado de artifacts con nombre.
//!
//! Las escrituras son de dos fases para que sólo un stage completado mueva el
//! puntero "latest":
//! 1. `stage_version` persiste una versión nueva e inmutable (visible por
//!    `get(name, Exact(v))`, invisible para `Latest`).
//! 2. `promote` avanza "latest" de todos los outputs del stage.
//!
//! `put` encadena ambas fases para escrituras externas (p.ej. artifacts
//! semilla).

mod memory;

pub use memory::InMemoryArtifactStore;

use crate::errors::StoreError;
use crate::model::{validate_artifact_name, Artifact, ArtifactKind, Payload, Version};

pub trait ArtifactStore: Send + Sync {
    /// Escribe una versión nueva sin mover "latest". Nunca sobrescribe una
    /// versión existente y es durable antes de retornar.
    fn stage_version(&self,
                     name: &str,
                     kind: ArtifactKind,
                     payload: Payload,
                     produced_by: Option<&str>)
                     -> Result<Artifact, StoreError>;

    /// Avanza "latest" a la versión de cada artifact. Nunca retrocede.
    fn promote(&self, artifacts: &[Artifact]) -> Result<(), StoreError>;

    fn get(&self, name: &str, version: Version) -> Result<Artifact, StoreError>;

    /// Contenido detrás de `artifact.location`.
    fn read(&self, artifact: &Artifact) -> Result<Payload, StoreError>;

    /// Todas las versiones escritas, ascendente.
    fn versions(&self, name: &str) -> Result<Vec<Artifact>, StoreError>;

    fn put(&self, name: &str, kind: ArtifactKind, payload: Payload) -> Result<Artifact, StoreError> {
        let artifact = self.stage_version(name, kind, payload, None)?;
        self.promote(std::slice::from_ref(&artifact))?;
        Ok(artifact)
    }

    /// Sin efectos secundarios.
    fn exists(&self, name: &str, version: Version) -> bool {
        self.get(name, version).is_ok()
    }

    fn load(&self, name: &str, version: Version) -> Result<(Artifact, Payload), StoreError> {
        let artifact = self.get(name, version)?;
        let payload = self.read(&artifact)?;
        Ok((artifact, payload))
    }
}

/// Validaciones comunes a todos los backends antes de escribir.
pub fn check_write(name: &str, kind: ArtifactKind, payload: &Payload) -> Result<(), StoreError> {
    validate_artifact_name(name)?;
    if !payload.fits(kind) {
        return Err(StoreError::KindMismatch { name: name.to_string(),
                                              kind: kind.to_string() });
    }
    Ok(())
}

impl<T: ArtifactStore + ?Sized> ArtifactStore for std::sync::Arc<T> {
    fn stage_version(&self,
                     name: &str,
                     kind: ArtifactKind,
                     payload: Payload,
                     produced_by: Option<&str>)
                     -> Result<Artifact, StoreError> {
        (**self).stage_version(name, kind, payload, produced_by)
    }

    fn promote(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        (**self).promote(artifacts)
    }

    fn get(&self, name: &str, version: Version) -> Result<Artifact, StoreError> {
        (**self).get(name, version)
    }

    fn read(&self, artifact: &Artifact) -> Result<Payload, StoreError> {
        (**self).read(artifact)
    }

    fn versions(&self, name: &str) -> Result<Vec<Artifact>, StoreError> {
        (**self).versions(name)
    }
}
