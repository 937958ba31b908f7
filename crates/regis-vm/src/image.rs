//! Exécutable chargé : code, cibles résolues, point d'entrée.
//!
//! Le chargement vérifie la structure du module, importe ses modules natifs
//! et résout chaque symbole une fois pour toutes ; l'image est ensuite
//! immuable pendant l'exécution.

use std::collections::HashMap;

use regis_core::bytecode::{Module, ModuleKind, Op, SymbolId, SymbolKind};
use regis_core::helpers::validate_module;
use regis_runtime::{NativeEntry, Runtime};
use tracing::debug;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};

/// Destination d'un symbole.
#[derive(Debug, Clone)]
pub enum Target {
    /// Fonction bytecode (adresse de départ).
    Bytecode {
        /// Première instruction.
        start: usize,
    },
    /// Fonction native résolue.
    Native(NativeEntry),
    /// Bloc `try`/`catch`.
    Block {
        /// Première instruction.
        start: usize,
    },
}

/// Image exécutable.
#[derive(Debug)]
pub struct Image {
    name: String,
    ops: Vec<Op>,
    names: Vec<String>,
    targets: Vec<Target>,
    by_name: HashMap<String, SymbolId>,
    entry: SymbolId,
}

impl Image {
    /// Valide `module`, importe ses natives dans `runtime` et résout ses symboles.
    pub fn load(module: Module, runtime: &mut Runtime, config: &VmConfig) -> VmResult<Self> {
        if module.kind != ModuleKind::Executable {
            return Err(VmError::NotExecutable { name: module.name, kind: module.kind });
        }
        let entry = module.entry.ok_or(VmError::NoEntry)?;
        validate_module(&module)?;

        for native in &module.natives {
            runtime.import(native, &config.native_paths).map_err(|e| VmError::Native(e.to_string()))?;
        }

        let mut names = Vec::with_capacity(module.symbols.len());
        let mut targets = Vec::with_capacity(module.symbols.len());
        let mut by_name = HashMap::new();
        for (id, sym) in module.symbols.iter() {
            let target = match (&sym.body, sym.kind) {
                (Some(body), SymbolKind::Function) => Target::Bytecode { start: body.start as usize },
                (Some(body), SymbolKind::Block) => Target::Block { start: body.start as usize },
                (None, _) => {
                    let entry = runtime.resolve(&sym.name).map_err(|_| VmError::UnresolvedNative(sym.name.clone()))?;
                    debug!(native = %sym.name, "fonction native résolue");
                    Target::Native(entry)
                }
            };
            if sym.kind == SymbolKind::Function {
                by_name.insert(sym.name.clone(), id);
            }
            names.push(sym.name.clone());
            targets.push(target);
        }

        debug!(module = %module.name, ops = module.ops.len(), symbols = names.len(), "image chargée");
        Ok(Self { name: module.name, ops: module.ops, names, targets, by_name, entry })
    }

    /// Nom du module d'origine.
    pub fn name(&self) -> &str { &self.name }

    /// Code.
    pub fn ops(&self) -> &[Op] { &self.ops }

    /// Fonction d'entrée.
    pub const fn entry(&self) -> SymbolId { self.entry }

    /// Nom d'un symbole.
    pub fn symbol_name(&self, id: SymbolId) -> &str { self.names.get(id.index()).map_or("?", String::as_str) }

    /// Cible d'un symbole.
    pub fn target(&self, id: SymbolId) -> Option<&Target> { self.targets.get(id.index()) }

    /// Recherche d'une fonction par nom (`fcall` sur une valeur Function/Closure).
    pub fn function(&self, name: &str) -> Option<SymbolId> { self.by_name.get(name).copied() }
}
