use regis_core::bytecode::{ModuleError, ModuleKind};
use thiserror::Error;

/// Erreurs de chargement : fatales, avant toute exécution.
#[derive(Debug, Error)]
pub enum VmError {
    /// Module invalide (décodage ou validation).
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Seuls les exécutables liés se chargent.
    #[error("module '{name}' is {kind}, not an executable (link it first)")]
    NotExecutable {
        /// Nom du module.
        name: String,
        /// Type trouvé.
        kind: ModuleKind,
    },

    /// Exécutable sans point d'entrée.
    #[error("executable has no entry function")]
    NoEntry,

    /// Import de module natif impossible.
    #[error("native module import failed: {0}")]
    Native(String),

    /// Fonction native absente de son module.
    #[error("unresolved native function '{0}'")]
    UnresolvedNative(String),
}

/// Résultat de chargement.
pub type VmResult<T> = std::result::Result<T, VmError>;
