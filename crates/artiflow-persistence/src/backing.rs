//! Acceso a archivos para los backends en disco.
//!
//! Las rutas son relativas a la raíz del backing store y usan `/` como
//! separador. Se rechaza cualquier ruta absoluta o con `..`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use log::debug;
use uuid::Uuid;

use crate::error::PersistenceError;

pub trait BackingStore: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, PersistenceError>;

    /// Reemplaza el contenido completo de forma atómica.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Agrega al final y no retorna hasta que los datos son durables.
    fn append(&self, path: &str, bytes: &[u8]) -> Result<(), PersistenceError>;

    /// Borra un archivo. Que no exista no es error.
    fn remove(&self, path: &str) -> Result<(), PersistenceError>;

    /// Nombres de archivo dentro de `dir`, ordenados. Un directorio
    /// inexistente es una lista vacía.
    fn list(&self, dir: &str) -> Result<Vec<String>, PersistenceError>;

    fn exists(&self, path: &str) -> bool;
}

/// Backing store sobre el sistema de archivos local.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, PersistenceError> {
        let rel = Path::new(path);
        let safe = !path.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(PersistenceError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn ensure_parent(full: &Path) -> Result<(), PersistenceError> {
        match full.parent() {
            Some(parent) => fs::create_dir_all(parent).map_err(|e| PersistenceError::io_at(parent, e)),
            None => Ok(()),
        }
    }
}

impl BackingStore for LocalFs {
    fn read(&self, path: &str) -> Result<Vec<u8>, PersistenceError> {
        let full = self.resolve(path)?;
        fs::read(&full).map_err(|e| PersistenceError::io_at(&full, e))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let file_name = full.file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .ok_or_else(|| PersistenceError::InvalidPath(path.to_string()))?;
        let tmp = full.with_file_name(format!(".{file_name}.tmp-{}", Uuid::new_v4()));
        let written = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &full)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(PersistenceError::io_at(&full, e));
        }
        debug!("write {} ({} bytes)", full.display(), bytes.len());
        Ok(())
    }

    fn append(&self, path: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full)?;
        let mut file = OpenOptions::new().create(true)
                                         .append(true)
                                         .open(&full)
                                         .map_err(|e| PersistenceError::io_at(&full, e))?;
        file.write_all(bytes).map_err(|e| PersistenceError::io_at(&full, e))?;
        file.sync_data().map_err(|e| PersistenceError::io_at(&full, e))
    }

    fn remove(&self, path: &str) -> Result<(), PersistenceError> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io_at(&full, e)),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, PersistenceError> {
        let full = self.resolve(dir)?;
        let entries = match fs::read_dir(&full) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::io_at(&full, e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::io_at(&full, e))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }
}
