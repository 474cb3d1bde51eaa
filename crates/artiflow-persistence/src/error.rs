//! Errores de persistencia.
//! Mapea errores de IO / serialización a variantes semánticas y a la
//! clasificación transitorio/permanente que usa el orquestador.

use std::io;
use std::path::Path;

use artiflow_core::{LedgerError, StoreError};
use log::warn;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt data in {path}: {detail}")]
    Corrupt { path: String, detail: String },
    #[error("transient IO error: {0}")]
    TransientIo(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl PersistenceError {
    /// Traduce un `io::Error` conservando la ruta afectada.
    pub fn io_at(path: &Path, err: io::Error) -> Self {
        let at = path.display();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(at.to_string()),
            io::ErrorKind::InvalidInput => Self::InvalidPath(format!("{at}: {err}")),
            io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidData | io::ErrorKind::Unsupported => {
                Self::Io(format!("{at}: {err}"))
            }
            _ => Self::TransientIo(format!("{at}: {err}")),
        }
    }

    pub fn corrupt(path: impl Into<String>, detail: impl ToString) -> Self {
        Self::Corrupt { path: path.into(),
                        detail: detail.to_string() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn to_store_error(&self) -> StoreError {
        StoreError::Backend { transient: self.is_retryable(),
                              detail: self.to_string() }
    }

    pub fn to_ledger_write_error(&self) -> LedgerError {
        LedgerError::WriteFailed(self.to_string())
    }

    pub fn to_ledger_read_error(&self) -> LedgerError {
        LedgerError::ReadFailed(self.to_string())
    }
}

/// Reintenta operaciones idempotentes (lecturas y reemplazos atómicos) ante
/// errores transitorios de IO.
pub(crate) fn with_retry<F, T>(mut f: F) -> Result<T, PersistenceError>
    where F: FnMut() -> Result<T, PersistenceError>
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempts < 3 => {
                let delay_ms = 15 * ((attempts + 1) as u64);
                warn!("retryable error (attempt {}): {:?} -> sleeping {}ms",
                      attempts + 1,
                      e,
                      delay_ms);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}
