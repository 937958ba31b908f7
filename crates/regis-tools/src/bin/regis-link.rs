//! Linker regis : fusionne une unité principale et des bibliothèques.
//!
//! Exemples :
//!   regis-link app.rgm lib.rgl --out app.rgx --summary
//!   regis-link app.rgm lib.rgl --out app.rgx --emit-json app.manifest.json --verify
//!   regis-link util.rgm extra.rgm --lib --out util.rgl
//!
//! Remarques :
//! - La première entrée est l'unité principale ; l'entrée vient de son `.main`,
//!   puis de sa fonction `main`, puis des bibliothèques dans l'ordre.
//! - Les cibles `jump`/`branch` sont rebasées sur l'offset de chaque entrée.
//! - Les blocs homonymes sont renommés `<module>::<bloc>`.

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser};
use yansi::{Color, Paint};

use regis_tools::prelude::*;
use regis_tools::ModuleKind;

#[derive(Parser, Debug)]
#[command(name = "regis-link", version, about = "Linker regis (unité principale + bibliothèques)")]
struct Cli {
    /// Modules à lier (unité principale d'abord)
    inputs: Vec<Utf8PathBuf>,

    /// Fichier de sortie (défaut : <principal>.rgx ou .rgl)
    #[arg(short, long)]
    out: Option<Utf8PathBuf>,

    /// Produit une bibliothèque au lieu d'un exécutable
    #[arg(long, action = ArgAction::SetTrue)]
    lib: bool,

    /// Fonction d'entrée imposée
    #[arg(long)]
    entry: Option<String>,

    /// Vérifie le résultat en le rechargeant (round-trip)
    #[arg(long, action = ArgAction::SetTrue)]
    verify: bool,

    /// Résumé humain : entrées/offsets/symboles/hash
    #[arg(long, action = ArgAction::SetTrue)]
    summary: bool,

    /// Écrit un désassemblage du résultat
    #[arg(long)]
    emit_disasm: Option<Utf8PathBuf>,

    /// Écrit le manifest JSON
    #[arg(long)]
    emit_json: Option<Utf8PathBuf>,

    /// Couleurs : auto|always|never
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Affiche la durée
    #[arg(long, action = ArgAction::SetTrue)]
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

    let Some(first) = cli.inputs.first() else {
        return Err(anyhow!("Aucune entrée fournie. Exemple : regis-link app.rgm lib.rgl --out app.rgx"));
    };
    let kind = if cli.lib { ModuleKind::Library } else { ModuleKind::Executable };
    let out = cli.out.clone().unwrap_or_else(|| default_out_path(first, kind.extension()));

    let timer = Timer::start();
    let inputs = cli
        .inputs
        .iter()
        .map(|p| read_module(p).map(|m| (p.clone(), m)))
        .collect::<Result<Vec<_>>>()?;
    let (linked, manifest) = link_modules(&inputs, LinkOptions { entry: cli.entry.clone(), kind })?;

    if cli.verify {
        let back = regis_tools::Module::from_bytes(&linked.to_bytes())?;
        regis_tools::validate_module(&back)?;
        eprintln!("{}", "✓ verify round-trip OK".paint(Color::Green));
    }

    if cli.summary {
        print_summary(&manifest, linked.ops.len());
    }

    if let Some(path) = &cli.emit_disasm {
        let title = path.file_name().unwrap_or("linked");
        write_text(path, &disasm_full(&linked, title))?;
        eprintln!("📝 Disasm → {path}");
    }

    if let Some(path) = &cli.emit_json {
        write_text(path, &serde_json::to_string_pretty(&manifest)?)?;
        eprintln!("🧾 Manifest JSON → {path}");
    }

    write_module(&out, &linked)?;
    eprintln!("✅ Link → {out}");

    if cli.time {
        eprintln!("⏱️  {}", timer.pretty());
    }
    Ok(())
}

fn print_summary(m: &LinkManifest, ops: usize) {
    eprintln!("{}", "== Link summary ==".paint(Color::Cyan).bold());
    eprintln!("• inputs: {}", m.inputs.len());
    for (i, (_, base)) in m.inputs.iter().zip(&m.base_pcs) {
        eprintln!("  - {} [{}] (ops={}, functions={}, base={base})", i.file, i.kind, i.ops, i.functions);
    }
    eprintln!("• ops: {ops}   symbols: {}", m.symbols.len());
    if !m.natives.is_empty() {
        eprintln!("• natives: {}", m.natives.join(", "));
    }
    for (old, new) in &m.renamed_blocks {
        eprintln!("• block renamed: {old} → {new}");
    }
    eprintln!("• version: {}   kind: {}", m.version, m.kind);
    eprintln!("• hash: 0x{:016x}", m.hash);
    if let Some(e) = &m.entry {
        eprintln!("• entry: {}", e.paint(Color::Yellow));
    }
}
