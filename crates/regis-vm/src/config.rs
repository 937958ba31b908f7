//! Configuration de la machine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Variable listant les dossiers de modules natifs (séparés par `:`).
pub const NATIVE_PATH_VAR: &str = "REGIS_PATH";

/// Réglages d'exécution.
///
/// Les champs absents d'un fichier JSON prennent leur valeur par défaut.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Taille des jeux de registres (locaux par défaut, statiques, globaux).
    pub register_size: usize,
    /// Profondeur d'appel maximale.
    pub max_frames: usize,
    /// Dossiers où chercher les modules natifs.
    pub native_paths: Vec<PathBuf>,
    /// Trace chaque instruction (niveau `TRACE`).
    pub trace_ops: bool,
}

impl Default for VmConfig {
    fn default() -> Self { Self { register_size: 256, max_frames: 8192, native_paths: Vec::new(), trace_ops: false } }
}

impl VmConfig {
    /// Défauts + dossiers de `REGIS_PATH`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var(NATIVE_PATH_VAR) {
            cfg.native_paths = split_paths(&raw);
        }
        cfg
    }

    /// Lecture depuis un JSON partiel.
    pub fn from_json(text: &str) -> serde_json::Result<Self> { serde_json::from_str(text) }
}

/// Découpe une liste `a:b:~/c`, `~` étant le dossier personnel.
pub fn split_paths(raw: &str) -> Vec<PathBuf> {
    raw.split(':').filter(|s| !s.is_empty()).map(expand_tilde).collect()
}

fn expand_tilde(p: &str) -> PathBuf {
    match (p.strip_prefix('~'), dirs_next::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest.trim_start_matches('/')),
        _ => PathBuf::from(p),
    }
}
