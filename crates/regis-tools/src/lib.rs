//! regis-tools : bibliothèque commune pour les outils CLI regis.
//!
//! Objectifs : mutualiser I/O, chrono, couleurs, disasm et linker.
//!
//! ## Modules & zones clés
//! - `prelude` : import rapide des types/fns usuels
//! - I/O       : `read_bytes`, `read_module`, `write_text`, `write_bytes`, `write_module`
//! - Time      : `Timer`, `human_millis`
//! - Couleurs  : `ColorMode`, `setup_colors`
//! - Logs      : `init_tracing` (subscriber `EnvFilter` pour les bins)
//! - Disasm    : `disasm_full`, `disasm_compact` (to `String`)
//! - Linker    : `link_modules` en deux passes (collecte puis réécriture)
//!
//! Les fonctions renvoient `anyhow::Result`.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::debug;

pub use regis_core::bytecode::{Module, ModuleKind, Op, SymbolId, SymbolKind};
pub use regis_core::disasm::{disassemble_compact as core_disasm_compact, disassemble_full as core_disasm_full};
pub use regis_core::helpers::validate_module;

/// Version lisible du crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Petite bannière de version utile pour logs/outils.
pub fn version_banner(tool: &str) -> String { format!("{tool} (regis-tools {VERSION})") }

/* ------------------------------------------------------------------------- */
/* Prelude                                                                   */
/* ------------------------------------------------------------------------- */

/// Prelude pratique pour les bins: re-exports compacts.
pub mod prelude {
    pub use crate::{
        default_out_path, disasm_compact, disasm_full, human_millis, init_tracing, link_modules, read_bytes,
        read_module, setup_colors, to_utf8, version_banner, write_bytes, write_module, write_text, ColorMode,
        LinkManifest, LinkOptions, Timer,
    };
    pub use anyhow::{anyhow, Context, Result};
    pub use camino::{Utf8Path, Utf8PathBuf};
    pub use std::path::PathBuf;
}

/* ------------------------------------------------------------------------- */
/* I/O utils                                                                 */
/* ------------------------------------------------------------------------- */

/// Lis un fichier binaire.
pub fn read_bytes(path: &Utf8Path) -> Result<Vec<u8>> { fs::read(path).with_context(|| format!("lecture {path}")) }

/// Lis et décode un module (`.rgm`, `.rgl`, `.rgx`).
pub fn read_module(path: &Utf8Path) -> Result<Module> {
    let bytes = read_bytes(path)?;
    Module::from_bytes(&bytes).with_context(|| format!("chargement échoué : {path}"))
}

/// Écrit un texte (UTF-8). Crée les dossiers au besoin.
pub fn write_text(path: &Utf8Path, s: &str) -> Result<()> { write_bytes(path, s.as_bytes()) }

/// Écrit des bytes. Crée les dossiers au besoin.
pub fn write_bytes(path: &Utf8Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(path).with_context(|| format!("écriture {path}"))?;
    f.write_all(bytes)?;
    Ok(())
}

/// Encode et écrit un module.
pub fn write_module(path: &Utf8Path, module: &Module) -> Result<()> { write_bytes(path, &module.to_bytes()) }

/// Convertit un `PathBuf` en `Utf8PathBuf` (erreur si non UTF-8).
pub fn to_utf8(p: PathBuf) -> Result<Utf8PathBuf> { Utf8PathBuf::from_path_buf(p).map_err(|_| anyhow!("chemin non UTF-8")) }

/// Remplace l'extension par `ext` (sans point), ex: `rgx`.
pub fn default_out_path(input: &Utf8Path, ext: &str) -> Utf8PathBuf { input.with_extension(ext) }

/* ------------------------------------------------------------------------- */
/* Time / chrono                                                             */
/* ------------------------------------------------------------------------- */

/// Chrono de scope simple; loggable ensuite.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Démarre un chrono.
    pub fn start() -> Self { Self { start: Instant::now() } }
    /// Durée écoulée.
    pub fn elapsed(&self) -> Duration { self.start.elapsed() }
    /// Format humain court.
    pub fn pretty(&self) -> String { human_millis(self.elapsed()) }
}

/// Format "humain" d'une durée.
pub fn human_millis(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        return format!("{ms} ms");
    }
    let s = ms as f64 / 1000.0;
    if s < 60.0 {
        return format!("{s:.3} s");
    }
    let m = (s / 60.0).floor();
    let rest = s - m * 60.0;
    format!("{m:.0} min {rest:.1} s")
}

/* ------------------------------------------------------------------------- */
/* Couleurs & logs                                                           */
/* ------------------------------------------------------------------------- */

/// Contrôle l'application de couleurs ANSI dans les sorties CLI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ColorMode {
    /// Active les couleurs seulement si la sortie supporte ANSI.
    #[default]
    Auto,
    /// Force l'activation des couleurs.
    Always,
    /// Désactive complètement les couleurs ANSI.
    Never,
}

/// Configure le mode couleur global pour yansi (si feature `colors` active).
pub fn setup_colors(mode: ColorMode) {
    #[cfg(feature = "colors")]
    {
        match mode {
            ColorMode::Auto => yansi::whenever(yansi::Condition::DEFAULT),
            ColorMode::Always => yansi::enable(),
            ColorMode::Never => yansi::disable(),
        }
    }
    #[cfg(not(feature = "colors"))]
    {
        let _ = mode;
    }
}

/// Installe un subscriber `tracing` sur stderr ; `RUST_LOG` l'emporte sur `default`.
#[cfg(feature = "cli")]
pub fn init_tracing(default: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).try_init();
}

/// Sans feature `cli` : pas de subscriber.
#[cfg(not(feature = "cli"))]
pub fn init_tracing(default: &str) { let _ = default; }

/* ------------------------------------------------------------------------- */
/* Disasm helpers                                                            */
/* ------------------------------------------------------------------------- */

/// Désassemble en texte long (lisible).
pub fn disasm_full(module: &Module, title: &str) -> String { core_disasm_full(module, title) }

/// Désassemble en vue compacte (1 ligne / op).
pub fn disasm_compact(module: &Module) -> String { core_disasm_compact(module) }

/* ------------------------------------------------------------------------- */
/* Linker                                                                    */
/* ------------------------------------------------------------------------- */

/// Options du linker.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Fonction d'entrée imposée (sinon : `.main`, puis `main`, unité principale d'abord).
    pub entry: Option<String>,
    /// `Executable` (défaut) ou `Library` ; une bibliothèque garde ses imports et n'a pas d'entrée.
    pub kind: ModuleKind,
}

impl Default for LinkOptions {
    fn default() -> Self { Self { entry: None, kind: ModuleKind::Executable } }
}

/// Statuts et mapping renvoyés par le linker (utiles pour logs/JSON).
#[derive(Debug, Clone, Serialize)]
pub struct LinkManifest {
    /// Version du format de module émis.
    pub version: u16,
    /// Type du module produit.
    pub kind: String,
    /// Liste des entrées ayant contribué au lien.
    pub inputs: Vec<LinkInput>,
    /// Offset PC assigné à chaque entrée lors du lien.
    pub base_pcs: Vec<(String, u32)>,
    /// Modules natifs importés (union, ordre d'apparition).
    pub natives: Vec<String>,
    /// Symboles du module lié, dans l'ordre de la table.
    pub symbols: Vec<LinkSymbol>,
    /// Blocs renommés `<module>::<bloc>` pour éviter une collision.
    pub renamed_blocks: Vec<(String, String)>,
    /// Fonction d'entrée retenue.
    pub entry: Option<String>,
    /// Empreinte simple du module lié.
    pub hash: u64,
}

/// Statistiques par entrée.
#[derive(Debug, Clone, Serialize)]
pub struct LinkInput {
    /// Chemin source.
    pub file: String,
    /// Nom logique du module.
    pub module: String,
    /// Type du module source.
    pub kind: String,
    /// Nombre d'instructions.
    pub ops: usize,
    /// Fonctions définies.
    pub functions: usize,
}

/// Symbole résolu.
#[derive(Debug, Clone, Serialize)]
pub struct LinkSymbol {
    /// Nom final.
    pub name: String,
    /// `function` ou `block`.
    pub kind: &'static str,
    /// Première instruction ; absent pour une native.
    pub start: Option<u32>,
}

/// Décision de phase 1 pour un bloc : nom final.
fn block_names(inputs: &[(Utf8PathBuf, Module)]) -> HashMap<(usize, String), String> {
    let mut function_names = HashSet::new();
    let mut block_owners: HashMap<&str, usize> = HashMap::new();
    for (_, m) in inputs {
        for (_, sym) in m.symbols.iter() {
            match sym.kind {
                SymbolKind::Function => {
                    function_names.insert(sym.name.as_str());
                }
                SymbolKind::Block if sym.is_defined() => *block_owners.entry(sym.name.as_str()).or_default() += 1,
                SymbolKind::Block => {}
            }
        }
    }

    let mut names = HashMap::new();
    for (i, (_, m)) in inputs.iter().enumerate() {
        for (_, sym) in m.symbols.iter().filter(|(_, s)| s.kind == SymbolKind::Block) {
            let clash = block_owners.get(sym.name.as_str()).is_some_and(|n| *n > 1)
                || function_names.contains(sym.name.as_str());
            let name = if clash { format!("{}::{}", m.name, sym.name) } else { sym.name.clone() };
            names.insert((i, sym.name.clone()), name);
        }
    }
    names
}

fn rebase(pc: u32, base: u32) -> Result<u32> { pc.checked_add(base).ok_or_else(|| anyhow!("linked code too large")) }

/// Lien statique en deux passes.
///
/// La première entrée est l'unité principale, les suivantes des bibliothèques.
/// Passe 1 : validation de chaque entrée, collecte des fonctions définies
/// (doublons refusés), des natives et des noms de blocs. Une bibliothèque
/// qui définit `main` (ou son `.main`) déjà fourni plus tôt voit sa copie
/// ignorée ; ses appels vont vers la définition retenue. Passe 2 : concaténation du code, rebasage des cibles
/// de saut, renumérotation des symboles dans la table fusionnée.
pub fn link_modules(inputs: &[(Utf8PathBuf, Module)], opts: LinkOptions) -> Result<(Module, LinkManifest)> {
    let Some((_, main_unit)) = inputs.first() else {
        bail!("aucune entrée à lier");
    };
    if opts.kind == ModuleKind::Object {
        bail!("the linker produces executables or libraries, not objects");
    }
    for (file, m) in inputs.iter().skip(1) {
        if m.kind == ModuleKind::Executable {
            bail!("cannot link executable '{}' ({file}) as a library", m.name);
        }
    }

    /* ---- passe 1 : collecte ---- */

    let mut defined: HashMap<&str, &str> = HashMap::new();
    let mut shadowed: HashSet<(usize, &str)> = HashSet::new();
    let mut natives: Vec<String> = Vec::new();
    for (i, (file, m)) in inputs.iter().enumerate() {
        validate_module(m).with_context(|| format!("module '{}' ({file}) failed validation", m.name))?;
        let own_entry = m.main.as_deref().unwrap_or("main");
        for (_, sym) in m.symbols.functions() {
            let name = sym.name.as_str();
            if let Some(owner) = defined.get(name) {
                // L'entrée d'une bibliothèque cède devant celle d'une entrée précédente.
                if i > 0 && (name == "main" || name == own_entry) {
                    debug!(module = %m.name, function = name, winner = %owner, "entrée de bibliothèque ignorée");
                    shadowed.insert((i, name));
                    continue;
                }
                bail!("duplicate definition of function '{name}'");
            }
            defined.insert(name, m.name.as_str());
        }
        for n in &m.natives {
            if !natives.contains(n) {
                natives.push(n.clone());
            }
        }
    }
    let blocks = block_names(inputs);

    /* ---- passe 2 : réécriture ---- */

    let mut out = Module::new(main_unit.name.clone(), opts.kind);
    out.natives = natives.clone();
    let mut inputs_json = Vec::with_capacity(inputs.len());
    let mut base_pcs = Vec::with_capacity(inputs.len());

    for (i, (file, m)) in inputs.iter().enumerate() {
        let base = u32::try_from(out.ops.len()).context("linked code too large")?;
        base_pcs.push((file.to_string(), base));
        inputs_json.push(LinkInput {
            file: file.to_string(),
            module: m.name.clone(),
            kind: m.kind.to_string(),
            ops: m.ops.len(),
            functions: m.symbols.functions().count(),
        });

        let mut remap = Vec::with_capacity(m.symbols.len());
        for (_, sym) in m.symbols.iter() {
            let name = match sym.kind {
                SymbolKind::Function => {
                    let resolvable = sym.is_defined()
                        || defined.contains_key(sym.name.as_str())
                        || sym.native_parts().is_some_and(|(module, _)| natives.iter().any(|n| n == module));
                    if !resolvable && opts.kind == ModuleKind::Executable {
                        bail!("unresolved symbol '{}' (referenced from {})", sym.name, m.name);
                    }
                    sym.name.clone()
                }
                SymbolKind::Block => blocks.get(&(i, sym.name.clone())).cloned().unwrap_or_else(|| sym.name.clone()),
            };
            let id = out.symbols.intern(&name, sym.kind);
            if shadowed.contains(&(i, sym.name.as_str())) {
                remap.push(id);
                continue;
            }
            if let (Some(body), Some(target)) = (&sym.body, out.symbols.get_mut(id)) {
                target.body = Some(rebase(body.start, base)?..rebase(body.end, base)?);
            }
            remap.push(id);
        }

        for op in &m.ops {
            let mut op = op.clone();
            for t in op.targets() {
                rebase(t, base)?;
            }
            op.map_targets(|t| t + base);
            op.map_symbol(|id| remap.get(id.index()).copied().unwrap_or(id));
            out.ops.push(op);
        }
        debug!(module = %m.name, base, ops = m.ops.len(), "module fusionné");
    }

    /* ---- entrée ---- */

    if opts.kind == ModuleKind::Executable {
        let libraries = inputs.iter().skip(1).map(|(_, m)| m);
        let wanted = opts
            .entry
            .clone()
            .or_else(|| main_unit.main.clone())
            .or_else(|| main_unit.symbols.functions().any(|(_, s)| s.name == "main").then(|| "main".to_owned()))
            .or_else(|| libraries.clone().find_map(|m| m.main.clone()))
            .or_else(|| {
                libraries
                    .clone()
                    .find(|m| m.symbols.functions().any(|(_, s)| s.name == "main"))
                    .map(|_| "main".to_owned())
            })
            .unwrap_or_else(|| "main".to_owned());
        match out.symbols.find(&wanted) {
            Some((id, sym)) if sym.kind == SymbolKind::Function && sym.is_defined() => out.entry = Some(id),
            _ => bail!("main function is undefined: {wanted}"),
        }
    } else {
        out.main = main_unit.main.clone();
    }

    validate_module(&out).context("linked module failed validation")?;

    let renamed_blocks = {
        let mut v: Vec<(String, String)> = blocks
            .iter()
            .filter(|((_, old), new)| old != *new)
            .map(|((_, old), new)| (old.clone(), new.clone()))
            .collect();
        v.sort();
        v
    };
    let manifest = LinkManifest {
        version: out.version(),
        kind: out.kind.to_string(),
        inputs: inputs_json,
        base_pcs,
        natives,
        symbols: out
            .symbols
            .iter()
            .map(|(_, s)| LinkSymbol {
                name: s.name.clone(),
                kind: match s.kind {
                    SymbolKind::Function => "function",
                    SymbolKind::Block => "block",
                },
                start: s.body.as_ref().map(|b| b.start),
            })
            .collect(),
        renamed_blocks,
        entry: out.entry_name(),
        hash: out.compute_hash(),
    };
    debug!(ops = out.ops.len(), symbols = out.symbols.len(), entry = ?manifest.entry, "lien terminé");
    Ok((out, manifest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use regis_core::bytecode::{ModuleBuilder, Operand};

    fn unit(name: &str, kind: ModuleKind, build: impl FnOnce(&mut ModuleBuilder)) -> (Utf8PathBuf, Module) {
        let mut b = ModuleBuilder::new(name, kind);
        build(&mut b);
        (Utf8PathBuf::from(format!("{name}.{}", kind.extension())), b.build().unwrap())
    }

    fn caller() -> (Utf8PathBuf, Module) {
        unit("app", ModuleKind::Object, |b| {
            b.function("main").unwrap();
            b.emit(Op::Frame(Operand::reg(0), Operand::reg(0))).unwrap();
            b.call(None, "helper").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })
    }

    fn library() -> (Utf8PathBuf, Module) {
        unit("lib", ModuleKind::Library, |b| {
            b.function("helper").unwrap();
            let skip = b.label();
            b.jump(skip).unwrap();
            b.emit(Op::Nop).unwrap();
            b.mark(skip);
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })
    }

    #[test]
    fn jumps_are_rebased_and_symbols_remapped() {
        let (linked, manifest) = link_modules(&[caller(), library()], LinkOptions::default()).unwrap();
        assert_eq!(linked.kind, ModuleKind::Executable);
        assert_eq!(linked.entry_name().as_deref(), Some("main"));
        assert_eq!(manifest.base_pcs, vec![("app.rgm".to_owned(), 0), ("lib.rgl".to_owned(), 3)]);
        assert_eq!(linked.ops[3], Op::Jump(5));
        let (helper, _) = linked.symbols.find("helper").unwrap();
        assert_eq!(linked.ops[1], Op::Call(None, helper));
        assert_eq!(linked.body_start(helper), Some(3));
    }

    #[test]
    fn unresolved_and_duplicate_symbols() {
        let err = link_modules(&[caller()], LinkOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "unresolved symbol 'helper' (referenced from app)");

        let err = link_modules(&[caller(), library(), library()], LinkOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "duplicate definition of function 'helper'");
    }

    #[test]
    fn library_override_supplies_the_entry() {
        let lib = unit("boot", ModuleKind::Library, |b| {
            b.main("start");
            b.function("start").unwrap();
            b.emit(Op::Halt).unwrap();
            b.end().unwrap();
        });
        let app = unit("app", ModuleKind::Object, |b| {
            b.function("unused").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        });
        let (linked, _) = link_modules(&[app.clone(), lib], LinkOptions::default()).unwrap();
        assert_eq!(linked.entry_name().as_deref(), Some("start"));

        let err = link_modules(&[app], LinkOptions::default()).unwrap_err();
        assert_eq!(err.to_string(), "main function is undefined: main");
    }

    #[test]
    fn library_main_yields_to_the_unit_main() {
        let printing = |name: &str, kind, text: &str| {
            let text = text.to_owned();
            unit(name, kind, move |b| {
                b.function("main").unwrap();
                b.emit(Op::StrStore(Operand::reg(1), text)).unwrap();
                b.emit(Op::Print(Operand::reg(1))).unwrap();
                b.emit(Op::End).unwrap();
                b.end().unwrap();
            })
        };
        let app = printing("app", ModuleKind::Object, "app");
        let lib = printing("lib", ModuleKind::Library, "lib");
        let (linked, manifest) = link_modules(&[app, lib.clone()], LinkOptions::default()).unwrap();
        let (main, _) = linked.symbols.find("main").unwrap();
        assert_eq!(linked.entry, Some(main));
        assert_eq!(linked.body_start(main), Some(0));
        assert_eq!(manifest.symbols.iter().filter(|s| s.name == "main").count(), 1);

        let (alone, _) = link_modules(&[unit("empty", ModuleKind::Object, |_| {}), lib], LinkOptions::default()).unwrap();
        assert_eq!(alone.entry_name().as_deref(), Some("main"));
    }

    #[test]
    fn inputs_are_validated_before_rebasing() {
        let mut broken = Module::new("broken", ModuleKind::Library);
        let f = broken.symbols.intern("f", SymbolKind::Function);
        broken.symbols.get_mut(f).unwrap().body = Some(0..1);
        broken.ops = vec![Op::Jump(u32::MAX)];
        let err = link_modules(&[caller(), ("broken.rgl".into(), broken)], LinkOptions::default()).unwrap_err();
        assert!(format!("{err:#}").starts_with("module 'broken' (broken.rgl) failed validation"), "{err:#}");
    }

    #[test]
    fn colliding_blocks_are_prefixed() {
        let with_block = |name: &str, kind| {
            unit(name, kind, |b| {
                b.block("handler").unwrap();
                b.emit(Op::Leave).unwrap();
                b.end().unwrap();
                if kind == ModuleKind::Object {
                    b.function("main").unwrap();
                    b.emit(Op::TryFrame).unwrap();
                    b.catch(None, "handler").unwrap();
                    b.enter("handler").unwrap();
                    b.emit(Op::End).unwrap();
                    b.end().unwrap();
                }
            })
        };
        let (linked, manifest) =
            link_modules(&[with_block("a", ModuleKind::Object), with_block("b", ModuleKind::Library)], LinkOptions::default())
                .unwrap();
        assert!(linked.symbols.find("a::handler").is_some());
        assert!(linked.symbols.find("b::handler").is_some());
        assert_eq!(manifest.renamed_blocks.len(), 2);
        let (a_handler, _) = linked.symbols.find("a::handler").unwrap();
        assert_eq!(linked.ops[3], Op::Try(a_handler));
    }

    #[test]
    fn natives_pass_through_and_manifest_serializes() {
        let app = unit("app", ModuleKind::Object, |b| {
            b.native("math");
            b.function("main").unwrap();
            b.emit(Op::Frame(Operand::reg(1), Operand::reg(0))).unwrap();
            b.call(Some(Operand::reg(1)), "math.sqrt").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        });
        let (linked, manifest) = link_modules(&[app], LinkOptions::default()).unwrap();
        assert_eq!(linked.natives, vec!["math".to_owned()]);
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["entry"], "main");
        assert_eq!(json["symbols"][1]["name"], "math.sqrt");
        assert!(json["symbols"][1]["start"].is_null());
    }

    #[test]
    fn modules_roundtrip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = to_utf8(dir.path().to_path_buf()).unwrap();
        let (_, module) = caller();
        let path = root.join("out/app.rgm");
        write_module(&path, &module).unwrap();
        assert_eq!(read_module(&path).unwrap(), module);

        let junk = root.join("junk.rgx");
        write_text(&junk, "not a module").unwrap();
        let err = read_module(&junk).unwrap_err();
        assert!(format!("{err:#}").starts_with("chargement échoué"), "{err:#}");
        assert_eq!(default_out_path(&path, "rgx"), root.join("out/app.rgx"));
    }

    #[test]
    fn human_durations() {
        assert_eq!(human_millis(Duration::from_millis(12)), "12 ms");
        assert_eq!(human_millis(Duration::from_millis(1500)), "1.500 s");
        assert_eq!(human_millis(Duration::from_secs(90)), "1 min 30.0 s");
    }
}
