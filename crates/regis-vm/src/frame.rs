//! Cadres d'appel et cadres `try`.

use std::cell::RefCell;
use std::rc::Rc;

use regis_core::bytecode::{Operand, SetKind, SymbolId};
use regis_runtime::RegisterSet;
use smallvec::SmallVec;

/// Cadre en préparation (`frame` → `param`… → `call`).
#[derive(Debug)]
pub struct PendingFrame {
    /// Arguments transmis.
    pub args: RegisterSet,
    /// Taille des registres locaux de l'appelé.
    pub locals: usize,
}

/// Activation d'une fonction.
///
/// `locals` est partagé : une closure appelée tourne directement sur ses
/// registres capturés.
#[derive(Debug)]
pub struct Frame {
    /// Nom de la fonction (traces).
    pub function: String,
    /// Identité résolue (registres statiques).
    pub symbol: SymbolId,
    /// Arguments.
    pub args: RegisterSet,
    /// Registres locaux.
    pub locals: Rc<RefCell<RegisterSet>>,
    /// Reprise chez l'appelant.
    pub return_pc: usize,
    /// Registre de l'appelant recevant le retour.
    pub ret: Option<Operand>,
    /// Jeu de registres actif (`ress`).
    pub selected: SetKind,
}

/// Cadre `try` : attrapeurs actifs pour un bloc.
#[derive(Debug, Default)]
pub struct TryFrame {
    /// `(type, bloc)` ; `None` attrape tout.
    pub catchers: SmallVec<[(Option<String>, SymbolId); 4]>,
    /// Nombre de cadres d'appel à l'entrée du bloc.
    pub depth: usize,
    /// Reprise après `leave`.
    pub return_pc: usize,
}

impl TryFrame {
    /// Premier bloc acceptant une charge utile de type `kind`.
    pub fn matching(&self, kind: &str) -> Option<SymbolId> {
        self.catchers.iter().find(|(ty, _)| ty.as_deref().map_or(true, |t| t == kind)).map(|(_, block)| *block)
    }
}
