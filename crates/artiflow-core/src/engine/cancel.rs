use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Solicitud externa de cancelación. El motor la observa en el siguiente
/// límite entre stages (o entre intentos de un mismo stage), nunca a mitad de
/// un `execute`.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Rearma el handle para el siguiente run.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
