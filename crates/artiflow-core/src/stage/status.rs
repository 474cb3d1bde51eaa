use serde::{Deserialize, Serialize};

/// Estado de un Stage dentro de un run.
///
/// Las transiciones válidas son:
/// - `Pending` -> `Running`
/// - `Running` -> `Succeeded`
/// - `Running` -> `Failed`
/// - `Failed` -> `Pending` mientras la política de reintentos lo permita.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}
