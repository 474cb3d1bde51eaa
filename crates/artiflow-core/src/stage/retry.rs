use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Espera entre intentos. `delay(n)` es no decreciente en `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    None,
    Fixed { delay_ms: u64 },
    Linear { step_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Espera tras el intento fallido número `attempt_number` (base 1).
    pub fn delay(&self, attempt_number: u32) -> Duration {
        let n = attempt_number.max(1);
        let ms = match *self {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { step_ms } => step_ms.saturating_mul(n as u64),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor).min(max_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Un solo intento.
    pub fn none() -> Self {
        Self { max_attempts: 1,
               backoff: Backoff::None }
    }

    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts, backoff }
    }

    /// ¿Queda presupuesto para otro intento después de `attempt_number`?
    pub fn allows_retry_after(&self, attempt_number: u32) -> bool {
        attempt_number < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
