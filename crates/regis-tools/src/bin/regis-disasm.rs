//! Désassembleur regis pour modules `.rgm` / `.rgl` / `.rgx`.
//!
//! Exemples :
//!   regis-disasm app.rgx
//!   regis-disasm app.rgx lib.rgl --out-dir target/disasm/
//!   regis-disasm app.rgx --compact
//!   regis-disasm app.rgx --summary --verify

use anyhow::{bail, Result};
use clap::Parser;
use yansi::{Color, Paint};

use regis_tools::prelude::*;
use regis_tools::{validate_module, Module};

#[derive(Parser, Debug)]
#[command(name = "regis-disasm", version, about = "Désassembleur regis (module -> texte)")]
struct Cli {
    /// Module(s) à analyser
    inputs: Vec<Utf8PathBuf>,

    /// Dossier où écrire le(s) désassemblage(s) au lieu de stdout
    #[arg(long)]
    out_dir: Option<Utf8PathBuf>,

    /// Vue compacte (1 ligne par op)
    #[arg(long)]
    compact: bool,

    /// Résumé rapide (kind/version/symboles/hash)
    #[arg(long)]
    summary: bool,

    /// Valide la structure du module
    #[arg(long)]
    verify: bool,

    /// Échec si module vide (0 op)
    #[arg(long)]
    strict: bool,

    /// Couleurs du résumé : auto|always|never
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Affiche la durée de traitement
    #[arg(long)]
    time: bool,
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    color_eyre::install().ok();
    init_tracing("warn");

    let cli = Cli::parse();
    setup_colors(cli.color);

    if cli.inputs.is_empty() {
        bail!("Aucune entrée. Exemple: regis-disasm app.rgx");
    }

    let timer = Timer::start();
    for path in &cli.inputs {
        let module = read_module(path)?;
        process_one(path, &module, &cli)?;
    }
    if cli.time {
        eprintln!("⏱️  {}", timer.pretty());
    }
    Ok(())
}

fn process_one(path: &Utf8Path, module: &Module, cli: &Cli) -> Result<()> {
    if cli.strict && module.ops.is_empty() {
        bail!("{path}: module vide (0 op)");
    }
    if cli.verify {
        validate_module(module)?;
        eprintln!("{} {path}", "✓ verify OK".paint(Color::Green));
    }
    if cli.summary {
        eprintln!("{}", format!("== {path} ==").paint(Color::Cyan).bold());
        eprintln!("• kind: {}   version: {}", module.kind, module.version());
        eprintln!("• ops: {}   symbols: {}", module.ops.len(), module.symbols.len());
        eprintln!("• hash: 0x{:016x}", module.compute_hash());
    }

    let title = path.file_name().unwrap_or("module");
    let text = if cli.compact { disasm_compact(module) } else { disasm_full(module, title) };
    match &cli.out_dir {
        Some(dir) => {
            let out = dir.join(format!("{}.disasm.txt", path.file_stem().unwrap_or("module")));
            write_text(&out, &text)?;
            eprintln!("📝 Disasm → {out}");
        }
        None => print!("{text}"),
    }
    Ok(())
}
