//! Constantes del motor core.
//!
//! `ENGINE_VERSION` entra en el hash de definición de un pipeline: un cambio
//! de versión del motor invalida la reanudación de runs creados con la
//! versión anterior (`DefinitionMismatch`).

/// Versión lógica del orquestador.
pub const ENGINE_VERSION: &str = "A1.0";

/// Primera versión asignada a un artifact nuevo.
pub const FIRST_ARTIFACT_VERSION: u64 = 1;

/// `error_kind` registrado cuando un attempt quedó abierto (crash del proceso)
/// y el motor lo cierra al reanudar.
pub const ERROR_KIND_INTERRUPTED: &str = "interrupted";

/// `error_kind` registrado cuando `execute` terminó bien pero sus outputs no
/// pudieron persistirse.
pub const ERROR_KIND_PARTIAL_SUCCESS: &str = "partial_success";

/// `error_kind` usado en el reporte cuando un input no puede resolverse.
pub const ERROR_KIND_UNRESOLVED_INPUT: &str = "unresolved_input";
