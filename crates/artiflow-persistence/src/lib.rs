//! artiflow-persistence
//!
//! Implementaciones en disco de `ArtifactStore` y `RunLedger` sobre un
//! `BackingStore` de archivos.
//!
//! Módulos:
//! - `backing`: acceso a archivos (lectura, escritura atómica, append durable).
//! - `fs_store`: artifacts versionados en `artifacts/<name>/vN.*`.
//! - `jsonl_ledger`: un archivo JSON Lines por run en `runs/<run_id>.jsonl`.
//! - `config`: carga de configuración desde .env.
//! - `error`: `PersistenceError` y su clasificación transitorio/permanente.

pub mod backing;
pub mod config;
pub mod error;
pub mod fs_store;
pub mod jsonl_ledger;

pub use backing::{BackingStore, LocalFs};
pub use config::{init_dotenv, StorageConfig};
pub use error::PersistenceError;
pub use fs_store::FsArtifactStore;
pub use jsonl_ledger::JsonlRunLedger;
