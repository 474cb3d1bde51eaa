//! `ArtifactStore` en disco.
//!
//! Layout por artifact:
//! - `artifacts/<name>/v<N>.json`: payload serializado (inmutable).
//! - `artifacts/<name>/v<N>.meta.json`: metadata; su existencia confirma la
//!   versión, por eso se escribe después del payload.
//! - `artifacts/<name>/LATEST`: número de la última versión promovida.
//!
//! `promote` mueve todos los `LATEST` de un stage o ninguno: si una escritura
//! falla, los punteros ya movidos vuelven a su valor anterior.

use std::path::PathBuf;
use std::sync::Mutex;

use artiflow_core::constants::FIRST_ARTIFACT_VERSION;
use artiflow_core::store::check_write;
use artiflow_core::{Artifact, ArtifactKind, ArtifactStore, Payload, StoreError, Version};
use chrono::Utc;
use log::{debug, info, warn};

use crate::backing::{BackingStore, LocalFs};
use crate::config::StorageConfig;
use crate::error::{with_retry, PersistenceError};

const META_SUFFIX: &str = ".meta.json";

fn dir_of(name: &str) -> String {
    format!("artifacts/{name}")
}

fn payload_path(name: &str, version: u64) -> String {
    format!("artifacts/{name}/v{version}.json")
}

fn meta_path(name: &str, version: u64) -> String {
    format!("artifacts/{name}/v{version}{META_SUFFIX}")
}

fn latest_path(name: &str) -> String {
    format!("artifacts/{name}/LATEST")
}

pub struct FsArtifactStore<B: BackingStore = LocalFs> {
    backing: B,
    /// Serializa escritores; los nombres de versión se derivan del listado.
    write_lock: Mutex<()>,
}

impl FsArtifactStore<LocalFs> {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::with_backing(LocalFs::new(root))
    }

    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self::open(cfg.home.clone())
    }
}

impl<B: BackingStore> FsArtifactStore<B> {
    pub fn with_backing(backing: B) -> Self {
        Self { backing,
               write_lock: Mutex::new(()) }
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Versiones confirmadas (con metadata), ascendentes.
    fn stored_versions(&self, name: &str) -> Result<Vec<u64>, StoreError> {
        let files = with_retry(|| self.backing.list(&dir_of(name))).map_err(|e| e.to_store_error())?;
        let mut versions: Vec<u64> = files.iter()
                                          .filter_map(|f| f.strip_suffix(META_SUFFIX))
                                          .filter_map(|f| f.strip_prefix('v'))
                                          .filter_map(|n| n.parse().ok())
                                          .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    fn read_meta(&self, name: &str, version: u64) -> Result<Artifact, StoreError> {
        let path = meta_path(name, version);
        let bytes = match with_retry(|| self.backing.read(&path)) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(StoreError::VersionNotFound { name: name.to_string(),
                                                         version });
            }
            Err(e) => return Err(e.to_store_error()),
        };
        serde_json::from_slice(&bytes).map_err(|e| PersistenceError::corrupt(path, e).to_store_error())
    }

    fn read_latest(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let path = latest_path(name);
        match with_retry(|| self.backing.read(&path)) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                text.trim()
                    .parse()
                    .map(Some)
                    .map_err(|e| PersistenceError::corrupt(path, e).to_store_error())
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.to_store_error()),
        }
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        with_retry(|| self.backing.write(path, bytes)).map_err(|e| e.to_store_error())
    }

    /// Devuelve cada `LATEST` ya movido a su valor previo, en orden inverso,
    /// y retorna el error original.
    fn restore_latest(&self, moved: &[(&str, Option<u64>)], cause: StoreError) -> StoreError {
        for (name, previous) in moved.iter().rev() {
            let path = latest_path(name);
            let restored = match previous {
                Some(v) => with_retry(|| self.backing.write(&path, v.to_string().as_bytes())),
                None => with_retry(|| self.backing.remove(&path)),
            };
            match restored {
                Ok(()) => warn!("promote of {name} rolled back to {previous:?}"),
                Err(e) => warn!("cannot roll back {path}: {e}"),
            }
        }
        cause
    }
}

impl<B: BackingStore> ArtifactStore for FsArtifactStore<B> {
    fn stage_version(&self,
                     name: &str,
                     kind: ArtifactKind,
                     payload: Payload,
                     produced_by: Option<&str>)
                     -> Result<Artifact, StoreError> {
        check_write(name, kind, &payload)?;
        let _guard = self.write_lock
                         .lock()
                         .map_err(|_| StoreError::Backend { transient: false,
                                                            detail: "artifact store lock poisoned".into() })?;
        let version = self.stored_versions(name)?
                          .last()
                          .map(|v| v + 1)
                          .unwrap_or(FIRST_ARTIFACT_VERSION);
        let location = payload_path(name, version);
        let artifact = Artifact { name: name.to_string(),
                                  kind,
                                  version,
                                  location: location.clone(),
                                  produced_by: produced_by.map(str::to_string),
                                  created_at: Utc::now(),
                                  content_hash: payload.content_hash() };

        let body = serde_json::to_vec(&payload).map_err(|e| StoreError::Backend { transient: false,
                                                                                  detail: e.to_string() })?;
        self.write(&location, &body)?;
        let meta = serde_json::to_vec_pretty(&artifact).map_err(|e| StoreError::Backend { transient: false,
                                                                                          detail: e.to_string() })?;
        self.write(&meta_path(name, version), &meta)?;
        debug!("staged {}", artifact.key());
        Ok(artifact)
    }

    fn promote(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        let _guard = self.write_lock
                         .lock()
                         .map_err(|_| StoreError::Backend { transient: false,
                                                            detail: "artifact store lock poisoned".into() })?;
        // Primero se verifica todo; después se mueven los punteros.
        for artifact in artifacts {
            self.read_meta(&artifact.name, artifact.version)?;
        }
        let mut moved: Vec<(&str, Option<u64>)> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let current = match self.read_latest(&artifact.name) {
                Ok(current) => current,
                Err(e) => return Err(self.restore_latest(&moved, e)),
            };
            if current.map_or(true, |l| l < artifact.version) {
                if let Err(e) = self.write(&latest_path(&artifact.name), artifact.version.to_string().as_bytes()) {
                    return Err(self.restore_latest(&moved, e));
                }
                moved.push((artifact.name.as_str(), current));
                info!("promoted {}", artifact.key());
            }
        }
        Ok(())
    }

    fn get(&self, name: &str, version: Version) -> Result<Artifact, StoreError> {
        artiflow_core::model::validate_artifact_name(name)?;
        match version {
            Version::Latest => match self.read_latest(name)? {
                Some(v) => self.read_meta(name, v),
                None => Err(StoreError::NotFound(name.to_string())),
            },
            Version::Exact(v) => match self.read_meta(name, v) {
                Err(StoreError::VersionNotFound { .. }) if self.stored_versions(name)?.is_empty() => {
                    Err(StoreError::NotFound(name.to_string()))
                }
                other => other,
            },
        }
    }

    fn read(&self, artifact: &Artifact) -> Result<Payload, StoreError> {
        let bytes = match with_retry(|| self.backing.read(&artifact.location)) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(StoreError::VersionNotFound { name: artifact.name.clone(),
                                                         version: artifact.version });
            }
            Err(e) => return Err(e.to_store_error()),
        };
        let payload: Payload = serde_json::from_slice(&bytes).map_err(|e| {
                                                                  PersistenceError::corrupt(artifact.location.clone(), e)
                                                                      .to_store_error()
                                                              })?;
        if payload.content_hash() != artifact.content_hash {
            return Err(PersistenceError::corrupt(artifact.location.clone(), "content hash mismatch").to_store_error());
        }
        Ok(payload)
    }

    fn versions(&self, name: &str) -> Result<Vec<Artifact>, StoreError> {
        artiflow_core::model::validate_artifact_name(name)?;
        let versions = self.stored_versions(name)?;
        if versions.is_empty() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        versions.into_iter().map(|v| self.read_meta(name, v)).collect()
    }
}
