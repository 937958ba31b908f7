//! Chargement dynamique de modules natifs.
//!
//! Un module `name` est cherché dans l'ordre :
//! `./name.so`, `./libname.so`, puis les mêmes noms dans chaque dossier de
//! recherche (suffixe/préfixe de la plateforme). La bibliothèque doit exporter
//! `regis_module_exports` selon l'ABI C de [`crate::abi`] (générée par
//! [`regis_module!`](crate::regis_module)). Les noms sont copiés à
//! l'ouverture ; seuls les points d'entrée restent liés à la bibliothèque.

#![allow(unsafe_code)]

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::PathBuf;

use libloading::{Library, Symbol};
use tracing::trace;

use crate::abi::{self, ForeignExport, RawExportsFn};
use crate::{Error, RResult};

/// Symbole exporté par les modules natifs.
pub const EXPORTS_SYMBOL: &str = "regis_module_exports";

/// Chemins candidats pour `module`, dans l'ordre de recherche.
pub fn candidates(module: &str, search: &[PathBuf]) -> Vec<PathBuf> {
    let names = [format!("{module}{DLL_SUFFIX}"), format!("{DLL_PREFIX}{module}{DLL_SUFFIX}")];
    let mut dirs = vec![PathBuf::from(".")];
    dirs.extend(search.iter().cloned());

    let mut out = Vec::new();
    for dir in &dirs {
        for name in &names {
            let path = dir.join(name);
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    out
}

/// Ouvre le premier candidat existant et lit sa table d'exports.
///
/// Les points d'entrée visent la bibliothèque : l'appelant garde `Library`
/// en vie tant qu'ils servent.
pub(crate) fn open(module: &str, search: &[PathBuf]) -> RResult<(Library, PathBuf, Vec<ForeignExport>)> {
    let tried = candidates(module, search);
    let Some(path) = tried.iter().find(|p| p.is_file()) else {
        let list = tried.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ");
        return Err(Error::Load { module: module.to_owned(), reason: format!("essayé: {list}") });
    };
    trace!(module, path = %path.display(), "ouverture du module natif");
    let load_err = |reason: String| Error::Load { module: module.to_owned(), reason };

    // SAFETY: charger une bibliothèque exécute ses constructeurs ; les modules
    // natifs sont des binaires de confiance.
    let library = unsafe { Library::new(path) }.map_err(|e| load_err(e.to_string()))?;
    // SAFETY: `regis_module_exports` a la signature `RawExportsFn` de l'ABI ;
    // la table est lue pendant que `library` est ouverte.
    let exports = unsafe {
        let sym: Symbol<'_, RawExportsFn> = library.get(EXPORTS_SYMBOL.as_bytes()).map_err(|e| load_err(e.to_string()))?;
        abi::read_table(sym())
    }
    .map_err(|e| load_err(e.to_string()))?;
    Ok((library, path.clone(), exports))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use crate::{regis_native, Runtime, Value};
    use pretty_assertions::assert_eq;

    regis_native!(answer |frame, _ctx| {
        frame.ret(Value::Integer(42))
    });

    regis_native!(refuse |frame, _ctx| {
        let args = (0..frame.argc() as u32).map(|i| frame.arg(i)).collect::<RResult<Vec<_>>>()?;
        Err(Error::Throw(Value::Vector(args)))
    });

    crate::regis_module! {
        "answer" => (Some(0), answer),
        "refuse" => (None, refuse),
    }

    #[test]
    fn search_order_is_local_first() {
        let paths = candidates("World", &[PathBuf::from("/opt/regis")]);
        assert_eq!(paths.len(), 4);
        assert_eq!(paths[0], Path::new(".").join(format!("World{DLL_SUFFIX}")));
        assert_eq!(paths[2], Path::new("/opt/regis").join(format!("World{DLL_SUFFIX}")));
    }

    #[test]
    fn missing_module_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let err = open("ghost", &[dir.path().to_path_buf()]).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("module natif introuvable: ghost"));
        assert!(text.contains(&dir.path().display().to_string()));
    }

    #[test]
    fn export_table_registers_like_a_loaded_module() {
        let exports = unsafe { abi::read_table(regis_module_exports()) }.unwrap();
        assert_eq!(exports.len(), 2);
        assert_eq!((exports[0].name.as_str(), exports[0].arity), ("answer", Some(0)));
        assert_eq!((exports[1].name.as_str(), exports[1].arity), ("refuse", None));

        let mut rt = Runtime::new();
        for export in &exports {
            rt.register_foreign("world", export);
        }
        assert_eq!(rt.call("world.answer", &[]).unwrap(), Some(Value::Integer(42)));
        let thrown = rt.call("world.refuse", &[Value::from("no"), Value::Integer(3)]).unwrap_err();
        assert_eq!(thrown.into_payload(), Value::Vector(vec![Value::from("no"), Value::Integer(3)]));
    }
}
