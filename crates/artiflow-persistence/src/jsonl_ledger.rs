//! `RunLedger` sobre archivos JSON Lines, uno por run.
//!
//! Cada entrada es una línea terminada en `\n` y escrita con `sync_data`
//! antes de retornar. Una última línea sin terminar es la huella de un crash a
//! mitad de escritura: se ignora al leer y se recorta antes del siguiente
//! append. Cualquier otra línea ilegible es corrupción.

use std::path::PathBuf;
use std::sync::Mutex;

use artiflow_core::ledger::check_append_order;
use artiflow_core::{LedgerEntry, LedgerEntryKind, LedgerError, RunLedger};
use chrono::Utc;
use log::{debug, warn};
use uuid::Uuid;

use crate::backing::{BackingStore, LocalFs};
use crate::config::StorageConfig;
use crate::error::{with_retry, PersistenceError};

const RUNS_DIR: &str = "runs";
const EXTENSION: &str = ".jsonl";

fn run_path(run_id: Uuid) -> String {
    format!("{RUNS_DIR}/{run_id}{EXTENSION}")
}

/// Contenido parseado de un archivo de run.
struct Parsed {
    entries: Vec<LedgerEntry>,
    /// Bytes hasta el último `\n`, presente sólo si hubo cola truncada.
    torn_tail: Option<usize>,
}

fn parse(path: &str, bytes: &[u8]) -> Result<Parsed, PersistenceError> {
    let mut entries = Vec::new();
    let complete = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
    for (n, line) in bytes[..complete].split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let entry: LedgerEntry =
            serde_json::from_slice(line).map_err(|e| PersistenceError::corrupt(path, format!("line {}: {e}", n + 1)))?;
        entries.push(entry);
    }
    let torn_tail = (complete < bytes.len()).then_some(complete);
    if torn_tail.is_some() {
        warn!("{path}: ignorando cola truncada de {} bytes", bytes.len() - complete);
    }
    Ok(Parsed { entries, torn_tail })
}

pub struct JsonlRunLedger<B: BackingStore = LocalFs> {
    backing: B,
    append_lock: Mutex<()>,
}

impl JsonlRunLedger<LocalFs> {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self::with_backing(LocalFs::new(root))
    }

    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self::open(cfg.home.clone())
    }
}

impl<B: BackingStore> JsonlRunLedger<B> {
    pub fn with_backing(backing: B) -> Self {
        Self { backing,
               append_lock: Mutex::new(()) }
    }

    fn load(&self, run_id: Uuid) -> Result<(Parsed, Vec<u8>), PersistenceError> {
        let path = run_path(run_id);
        let bytes = match with_retry(|| self.backing.read(&path)) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok((parse(&path, &bytes)?, bytes))
    }
}

impl<B: BackingStore> RunLedger for JsonlRunLedger<B> {
    fn append(&self, run_id: Uuid, kind: LedgerEntryKind) -> Result<LedgerEntry, LedgerError> {
        let _guard = self.append_lock
                         .lock()
                         .map_err(|_| LedgerError::WriteFailed("ledger lock poisoned".into()))?;
        let path = run_path(run_id);
        let (parsed, bytes) = self.load(run_id).map_err(|e| e.to_ledger_read_error())?;
        check_append_order(run_id, &parsed.entries, &kind)?;

        if let Some(keep) = parsed.torn_tail {
            with_retry(|| self.backing.write(&path, &bytes[..keep])).map_err(|e| e.to_ledger_write_error())?;
        }

        let entry = LedgerEntry { seq: parsed.entries.len() as u64,
                                  run_id,
                                  ts: Utc::now(),
                                  kind };
        let mut line = serde_json::to_vec(&entry).map_err(|e| LedgerError::WriteFailed(e.to_string()))?;
        line.push(b'\n');
        // Sin reintento: un append a medias seguido de otro dejaría una línea
        // corrupta en medio del archivo.
        self.backing
            .append(&path, &line)
            .map_err(|e| e.to_ledger_write_error())?;
        debug!("ledger {run_id} seq={}", entry.seq);
        Ok(entry)
    }

    fn entries(&self, run_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.load(run_id)
            .map(|(parsed, _)| parsed.entries)
            .map_err(|e| e.to_ledger_read_error())
    }

    fn runs(&self) -> Result<Vec<Uuid>, LedgerError> {
        let files = with_retry(|| self.backing.list(RUNS_DIR)).map_err(|e| e.to_ledger_read_error())?;
        let mut ids: Vec<Uuid> = files.iter()
                                      .filter_map(|f| f.strip_suffix(EXTENSION))
                                      .filter_map(|id| Uuid::parse_str(id).ok())
                                      .collect();
        ids.sort();
        Ok(ids)
    }
}
