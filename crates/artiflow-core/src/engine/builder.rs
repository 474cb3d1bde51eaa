//! Builder para `Orchestrator`.
//!
//! Las stores (artifact store + ledger) son obligatorias desde el inicio; el
//! resto de la configuración tiene valores por defecto razonables:
//! ejecución secuencial, sin timeout global.
//!
//! ```ignore
//! let orchestrator = Orchestrator::builder(store, ledger)
//!     .parallel(true)
//!     .max_parallel(4)
//!     .build();
//! ```

use std::time::Duration;

use log::warn;

use super::cancel::CancelHandle;
use super::core::Orchestrator;
use crate::ledger::RunLedger;
use crate::store::ArtifactStore;

/// Parámetros de ejecución del orquestador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Ejecuta en paralelo los stages independientes de una misma ola.
    pub parallel: bool,
    /// Tamaño del pool de rayon cuando `parallel` está activo.
    pub max_parallel: usize,
    /// Timeout aplicado a stages que no declaran uno propio.
    pub default_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { parallel: false,
               max_parallel: 4,
               default_timeout: None }
    }
}

#[derive(Debug)]
pub struct OrchestratorBuilder<S: ArtifactStore, L: RunLedger> {
    store: S,
    ledger: L,
    config: OrchestratorConfig,
    cancel: Option<CancelHandle>,
}

impl<S: ArtifactStore, L: RunLedger> OrchestratorBuilder<S, L> {
    pub(crate) fn new(store: S, ledger: L) -> Self {
        Self { store,
               ledger,
               config: OrchestratorConfig::default(),
               cancel: None }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.config.parallel = parallel;
        self
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel.max(1);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    /// Comparte un handle de cancelación creado fuera (p.ej. por el CLI).
    pub fn cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    pub fn build(self) -> Orchestrator<S, L> {
        let pool = if self.config.parallel {
            match rayon::ThreadPoolBuilder::new().num_threads(self.config.max_parallel.max(1))
                                                 .thread_name(|i| format!("artiflow-stage-{i}"))
                                                 .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("[orchestrator] no se pudo crear el pool paralelo, se ejecuta en secuencial: {e}");
                    None
                }
            }
        } else {
            None
        };
        Orchestrator::from_parts(self.store, self.ledger, self.config, self.cancel.unwrap_or_default(), pool)
    }
}
