//! Carga de configuración de almacenamiento desde variables de entorno.
//! Usa la convención `ARTIFLOW_HOME` (por defecto `.artiflow`).

use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;
use once_cell::sync::Lazy;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenv(); // ignora error si no existe .env
});

pub const DEFAULT_HOME: &str = ".artiflow";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    /// Raíz bajo la que viven `artifacts/` y `runs/`.
    pub home: PathBuf,
}

impl StorageConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn from_env() -> Self {
        Lazy::force(&DOTENV_LOADED);
        let home = env::var("ARTIFLOW_HOME").ok()
                                            .filter(|v| !v.trim().is_empty())
                                            .unwrap_or_else(|| DEFAULT_HOME.to_string());
        Self::new(home)
    }
}

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}
