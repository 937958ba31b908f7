//! regis-cli: bibliothèque interne du binaire `regis`
//!
//! But : garder le CLI testable sans mélanger E/S et parsing d'arguments
//! (laissé à `main.rs`).
//!
//! Points clés :
//! - Commandes **run / link / disasm / inspect** décrites par des tâches
//! - Hooks (pointeurs de fonction) branchés par défaut sur `regis-vm` et `regis-tools`
//! - Configuration VM : défauts + `REGIS_PATH`, fichier JSON, puis drapeaux
//! - Traces (`feature = "trace"`) et couleurs (`feature = "color"`) optionnelles
//! - Codes de sortie : 0 succès, 1 erreur de chargement ou exception non rattrapée

#![deny(unused_must_use)]
#![forbid(unsafe_code)]

use std::{
    fs,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;

use regis_core::bytecode::{Module, SymbolKind};
use regis_runtime::Runtime;
use regis_tools::{link_modules, LinkOptions, ModuleKind};
use regis_vm::{
    config::{split_paths, NATIVE_PATH_VAR},
    Halt, VmConfig,
};

#[cfg(feature = "color")]
use owo_colors::OwoColorize;

// ───────────────────────────── Types publics ─────────────────────────────

/// Commande haut-niveau (le parsing CLI reste dans main.rs).
#[derive(Clone, Debug)]
pub enum Command {
    /// Exécute un exécutable lié.
    Run(RunTask),
    /// Lie une unité principale et des bibliothèques.
    Link(LinkTask),
    /// Désassemble un module.
    Disasm(DisasmTask),
    /// Résume un module (texte ou JSON).
    Inspect(InspectTask),
}

/// Paramètres de `run`.
#[derive(Clone, Debug, Default)]
pub struct RunTask {
    /// Exécutable (`.rgx`).
    pub program: PathBuf,
    /// Arguments transmis à `main`.
    pub args: Vec<String>,
    /// Fichier de configuration JSON.
    pub config: Option<PathBuf>,
    /// Surcharge de la taille des jeux de registres.
    pub register_size: Option<usize>,
    /// Surcharge de la profondeur d'appel maximale.
    pub max_frames: Option<usize>,
    /// Trace chaque instruction.
    pub trace_ops: bool,
    /// Affiche la durée.
    pub time: bool,
}

/// Paramètres de `link`.
#[derive(Clone, Debug, Default)]
pub struct LinkTask {
    /// Unité principale puis bibliothèques.
    pub inputs: Vec<PathBuf>,
    /// Sortie ; défaut : même nom que l'unité principale, extension du type produit.
    pub output: Option<PathBuf>,
    /// Produit une bibliothèque.
    pub library: bool,
    /// Fonction d'entrée imposée.
    pub entry: Option<String>,
    /// Écrit le manifest JSON.
    pub manifest: Option<PathBuf>,
}

/// Paramètres de `disasm`.
#[derive(Clone, Debug, Default)]
pub struct DisasmTask {
    /// Module à lire.
    pub input: PathBuf,
    /// Sortie texte (stdout si absent).
    pub output: Option<PathBuf>,
    /// Une ligne par instruction, sans en-têtes.
    pub compact: bool,
}

/// Paramètres de `inspect`.
#[derive(Clone, Debug, Default)]
pub struct InspectTask {
    /// Module à lire.
    pub input: PathBuf,
    /// Sortie JSON.
    pub json: bool,
}

/// Options passées au hook d'exécution.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Arguments du programme.
    pub args: Vec<String>,
    /// Configuration VM résolue.
    pub config: VmConfig,
}

/// Exécution : module encodé → code de sortie.
pub type RunFn = fn(bytes: &[u8], opts: &RunOptions) -> Result<i32>;
/// Lien : modules encodés (nom, bytes) → (exécutable encodé, manifest JSON).
pub type LinkFn = fn(inputs: &[(String, Vec<u8>)], opts: &LinkOptions) -> Result<(Vec<u8>, String)>;
/// Désassemblage : bytes → texte.
pub type DisasmFn = fn(bytes: &[u8], title: &str, compact: bool) -> Result<String>;
/// Inspection : bytes → texte ou JSON.
pub type InspectFn = fn(bytes: &[u8], json: bool) -> Result<String>;

/// Hooks branchés par `main.rs`.
#[derive(Clone, Default)]
pub struct Hooks {
    /// `run`.
    pub run: Option<RunFn>,
    /// `link`.
    pub link: Option<LinkFn>,
    /// `disasm`.
    pub disasm: Option<DisasmFn>,
    /// `inspect`.
    pub inspect: Option<InspectFn>,
}

impl Hooks {
    /// Implémentations regis (VM, linker, désassembleur).
    pub fn regis() -> Self {
        Self { run: Some(run_module), link: Some(link_encoded), disasm: Some(disasm_module), inspect: Some(inspect_module) }
    }
}

// ───────────────────────────── Initialisation ─────────────────────────────

/// Initialise le logger selon la feature `trace`.
pub fn init_logger() {
    #[cfg(feature = "trace")]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .try_init();
    }
}

/// Configuration VM : défauts, fichier JSON, `REGIS_PATH`, puis drapeaux.
pub fn resolve_config(task: &RunTask) -> Result<VmConfig> {
    let mut config = match &task.config {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("lecture config: {}", display(path)))?;
            VmConfig::from_json(&text).with_context(|| format!("config JSON invalide: {}", display(path)))?
        }
        None => VmConfig::default(),
    };
    if let Ok(raw) = std::env::var(NATIVE_PATH_VAR) {
        config.native_paths.extend(split_paths(&raw));
    }
    if let Some(n) = task.register_size {
        config.register_size = n;
    }
    if let Some(n) = task.max_frames {
        config.max_frames = n;
    }
    config.trace_ops |= task.trace_ops;
    if config.register_size == 0 {
        anyhow::bail!("register set size must be at least 1");
    }
    Ok(config)
}

// ───────────────────────────── Exécution ─────────────────────────────

/// Exécute une commande avec les hooks fournis. Retourne un code de sortie.
pub fn execute(cmd: Command, hooks: &Hooks) -> Result<i32> {
    match cmd {
        Command::Run(t) => run_entry(t, hooks),
        Command::Link(t) => {
            link_entry(t, hooks)?;
            Ok(0)
        }
        Command::Disasm(t) => {
            disasm_entry(t, hooks)?;
            Ok(0)
        }
        Command::Inspect(t) => {
            inspect_entry(t, hooks)?;
            Ok(0)
        }
    }
}

fn run_entry(task: RunTask, hooks: &Hooks) -> Result<i32> {
    let runner = hooks.run.ok_or_else(|| anyhow!("Exécution indisponible (hook `run` manquant)"))?;
    let config = resolve_config(&task)?;
    let bytes = fs::read(&task.program).with_context(|| format!("lecture module: {}", display(&task.program)))?;

    #[cfg(feature = "trace")]
    log::debug!("run {} (registers={}, max_frames={})", display(&task.program), config.register_size, config.max_frames);

    let start = Instant::now();
    let code = runner(&bytes, &RunOptions { args: task.args, config })?;
    if task.time {
        status_info("TIME", &format!("run: {} ms", start.elapsed().as_millis()));
    }
    Ok(code)
}

fn link_entry(task: LinkTask, hooks: &Hooks) -> Result<()> {
    let linker = hooks.link.ok_or_else(|| anyhow!("Lien indisponible (hook `link` manquant)"))?;
    let first = task.inputs.first().ok_or_else(|| anyhow!("aucune entrée à lier"))?;
    let kind = if task.library { ModuleKind::Library } else { ModuleKind::Executable };

    let mut inputs = Vec::with_capacity(task.inputs.len());
    for p in &task.inputs {
        let bytes = fs::read(p).with_context(|| format!("lecture module: {}", display(p)))?;
        inputs.push((display(p), bytes));
    }
    let (bytes, manifest) = linker(&inputs, &LinkOptions { entry: task.entry.clone(), kind })?;

    let out = task.output.clone().unwrap_or_else(|| first.with_extension(kind.extension()));
    write_bytes_atomic(&out, &bytes).with_context(|| format!("écriture de {}", display(&out)))?;
    if let Some(path) = &task.manifest {
        write_bytes_atomic(path, manifest.as_bytes())?;
    }
    status_ok("LINK", &display(&out));
    Ok(())
}

fn disasm_entry(task: DisasmTask, hooks: &Hooks) -> Result<()> {
    let f = hooks.disasm.ok_or_else(|| anyhow!("Désassemblage indisponible (hook `disasm` manquant)"))?;
    let bytes = fs::read(&task.input).with_context(|| format!("lecture module: {}", display(&task.input)))?;
    let title = task.input.file_name().map_or_else(|| "module".to_owned(), |n| n.to_string_lossy().into_owned());
    let text = f(&bytes, &title, task.compact)?;
    match &task.output {
        None => write_stdout(&text)?,
        Some(p) => {
            write_bytes_atomic(p, text.as_bytes())?;
            status_ok("DISASM", &display(p));
        }
    }
    Ok(())
}

fn inspect_entry(task: InspectTask, hooks: &Hooks) -> Result<()> {
    let f = hooks.inspect.ok_or_else(|| anyhow!("Inspection indisponible (hook `inspect` manquant)"))?;
    let bytes = fs::read(&task.input).with_context(|| format!("lecture module: {}", display(&task.input)))?;
    write_stdout(&f(&bytes, task.json)?)
}

// ───────────────────────────── Hooks regis ─────────────────────────────

fn decode(bytes: &[u8]) -> Result<Module> { Ok(Module::from_bytes(bytes)?) }

/// Exécute un module encodé ; une exception non rattrapée imprime la pile sur stderr et vaut 1.
pub fn run_module(bytes: &[u8], opts: &RunOptions) -> Result<i32> {
    let module = decode(bytes)?;
    let halt = regis_vm::run(module, Runtime::with_defaults(), &opts.config, &opts.args)?;
    if let Halt::Uncaught(u) = &halt {
        eprintln!("{}", u.report());
    }
    Ok(halt.exit_code())
}

/// Lie des modules encodés ; renvoie l'exécutable et le manifest JSON.
pub fn link_encoded(inputs: &[(String, Vec<u8>)], opts: &LinkOptions) -> Result<(Vec<u8>, String)> {
    let modules = inputs
        .iter()
        .map(|(name, bytes)| {
            let m = decode(bytes).with_context(|| format!("chargement échoué : {name}"))?;
            Ok((Utf8PathBuf::from(name.as_str()), m))
        })
        .collect::<Result<Vec<_>>>()?;
    let (linked, manifest) = link_modules(&modules, opts.clone())?;
    Ok((linked.to_bytes(), serde_json::to_string_pretty(&manifest)?))
}

/// Désassemble un module encodé.
pub fn disasm_module(bytes: &[u8], title: &str, compact: bool) -> Result<String> {
    let module = decode(bytes)?;
    Ok(if compact { regis_tools::disasm_compact(&module) } else { regis_tools::disasm_full(&module, title) })
}

/// Résumé d'un module : texte aligné ou JSON.
pub fn inspect_module(bytes: &[u8], json: bool) -> Result<String> {
    let module = decode(bytes)?;
    let symbols: Vec<_> = module
        .symbols
        .iter()
        .map(|(_, s)| {
            serde_json::json!({
                "name": s.name,
                "kind": match s.kind { SymbolKind::Function => "function", SymbolKind::Block => "block" },
                "body": s.body.as_ref().map(|b| [b.start, b.end]),
            })
        })
        .collect();
    if json {
        let payload = serde_json::json!({
            "name": module.name,
            "kind": module.kind.to_string(),
            "version": module.version(),
            "main": module.main,
            "entry": module.entry_name(),
            "natives": module.natives,
            "ops": module.ops.len(),
            "symbols": symbols,
            "hash": format!("0x{:016x}", module.compute_hash()),
        });
        return Ok(format!("{}\n", serde_json::to_string_pretty(&payload)?));
    }

    let mut out = String::new();
    out.push_str(&format!("{:<10} {}\n", "name", module.name));
    out.push_str(&format!("{:<10} {}\n", "kind", module.kind));
    out.push_str(&format!("{:<10} {}\n", "version", module.version()));
    out.push_str(&format!("{:<10} {}\n", "ops", module.ops.len()));
    out.push_str(&format!("{:<10} {}\n", "symbols", module.symbols.len()));
    if let Some(entry) = module.entry_name() {
        out.push_str(&format!("{:<10} {entry}\n", "entry"));
    }
    if !module.natives.is_empty() {
        out.push_str(&format!("{:<10} {}\n", "natives", module.natives.join(", ")));
    }
    out.push_str(&format!("{:<10} 0x{:016x}\n", "hash", module.compute_hash()));
    Ok(out)
}

// ───────────────────────────── Utilitaires E/S ─────────────────────────────

fn write_stdout(text: &str) -> Result<()> {
    let mut w = BufWriter::new(io::stdout().lock());
    w.write_all(text.as_bytes())?;
    w.flush()?;
    Ok(())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let tmp = unique_tmp_path(&parent, path.file_name().unwrap_or_default());
    {
        let mut w = BufWriter::new(fs::File::create(&tmp)?);
        w.write_all(bytes)?;
        w.flush()?;
    }
    if path.exists() {
        // Windows : Rename sur cible existante peut échouer
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path)
        .or_else(|_| fs::copy(&tmp, path).map(|_| ()).and_then(|()| fs::remove_file(&tmp)))?;
    Ok(())
}

fn unique_tmp_path(dir: &Path, base: &std::ffi::OsStr) -> PathBuf {
    let mut i = 0u32;
    loop {
        let candidate = dir.join(format!("{}.tmp{}", base.to_string_lossy(), i));
        if !candidate.exists() {
            return candidate;
        }
        i = i.wrapping_add(1);
    }
}

fn display(p: &Path) -> String { p.to_string_lossy().to_string() }

// ───────────────────────────── Sorties jolies ─────────────────────────────

fn status_ok(tag: &str, msg: &str) {
    #[cfg(feature = "color")]
    {
        eprintln!("{} {}", tag.green().bold(), msg);
    }
    #[cfg(not(feature = "color"))]
    {
        eprintln!("{} {}", tag, msg);
    }
}

fn status_info(tag: &str, msg: &str) {
    #[cfg(feature = "color")]
    {
        eprintln!("{} {}", tag.blue().bold(), msg);
    }
    #[cfg(not(feature = "color"))]
    {
        eprintln!("{} {}", tag, msg);
    }
}

// ───────────────────────────── Tests ─────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fake_run(bytes: &[u8], opts: &RunOptions) -> Result<i32> { Ok(i32::from(bytes.is_empty()) + opts.args.len() as i32) }

    #[test]
    fn missing_hook_is_an_error() {
        let err = execute(Command::Inspect(InspectTask::default()), &Hooks::default()).unwrap_err();
        assert!(err.to_string().contains("hook `inspect` manquant"));
    }

    #[test]
    fn run_passes_arguments_through_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let program = dir.path().join("p.rgx");
        fs::write(&program, b"x").unwrap();
        let hooks = Hooks { run: Some(fake_run), ..Hooks::default() };
        let task = RunTask { program, args: vec!["a".into(), "b".into()], ..RunTask::default() };
        assert_eq!(execute(Command::Run(task), &hooks).unwrap(), 2);
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regis.json");
        fs::write(&path, r#"{ "register_size": 16, "max_frames": 32 }"#).unwrap();
        let task = RunTask { config: Some(path), max_frames: Some(64), ..RunTask::default() };
        let cfg = resolve_config(&task).unwrap();
        assert_eq!(cfg.register_size, 16);
        assert_eq!(cfg.max_frames, 64);

        let bad = RunTask { register_size: Some(0), ..RunTask::default() };
        assert!(resolve_config(&bad).is_err());
    }

    #[test]
    fn atomic_writes_replace_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/a.txt");
        write_bytes_atomic(&path, b"one").unwrap();
        write_bytes_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
