//! Modelos neutrales (Artifact, Payload, Attempt, Run).

pub mod artifact;
pub mod attempt;
pub mod payload;
pub mod run;

pub use artifact::{validate_artifact_name, Artifact, ArtifactKind, Version};
pub use attempt::{Attempt, AttemptOutcome};
pub use payload::Payload;
pub use run::{Run, RunFailure, RunStatus, StageState};
