//! Run Ledger: historial append-only de attempts.
//!
//! Rol en el flujo:
//! - El `Orchestrator` registra cada intento (`Started` + terminal) antes de
//!   seguir adelante; nada se reintenta sin dejar rastro.
//! - `replay` reconstruye el `Run` plegando las entradas en orden de append,
//!   sin leer relojes ni estado externo.

mod replay;
mod store;
mod types;

pub use replay::replay_entries;
pub use store::{check_append_order, InMemoryRunLedger, RunLedger};
pub use types::{LedgerEntry, LedgerEntryKind};
