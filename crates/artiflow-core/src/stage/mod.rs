//! Definiciones relacionadas a Stages.
//!
//! Un Stage es una unidad de trabajo con inputs/outputs declarados por nombre
//! de artifact. Este módulo define:
//! - `StageRunner`: la lógica delegada (LLM, subproceso, transformación).
//! - `Stage`: la declaración inmutable que consume el plan.
//! - `RetryPolicy` / `Backoff`.
//! - `StageStatus`.

mod definition;
mod retry;
mod status;

pub use definition::{ResolvedInput, Stage, StageContext, StageOutputs, StageRunner};
pub use retry::{Backoff, RetryPolicy};
pub use status::StageStatus;
