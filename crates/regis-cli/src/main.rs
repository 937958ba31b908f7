//! Binaire `regis` : parsing des arguments, puis délégation à `regis_cli::execute`.

use std::{ffi::OsString, path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use regis_cli as cli;

#[derive(Debug, Parser)]
#[command(name = "regis", version, about = "regis: exécuter, lier, désassembler, inspecter des modules", long_about = None)]
struct Opt {
    /// Verbosité (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Silencieux (erreurs seulement)
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    quiet: bool,

    /// Couleurs
    #[arg(long = "color", value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exécute un exécutable lié (.rgx)
    Run {
        program: PathBuf,
        /// Arguments transmis à `main` (après `--`)
        #[arg(last = true)]
        args: Vec<OsString>,
        /// Fichier de configuration JSON
        #[arg(long)]
        config: Option<PathBuf>,
        /// Taille des jeux de registres
        #[arg(long = "register-size")]
        register_size: Option<usize>,
        /// Profondeur d'appel maximale
        #[arg(long = "max-frames")]
        max_frames: Option<usize>,
        /// Trace chaque instruction (avec -vvv)
        #[arg(long = "trace-ops")]
        trace_ops: bool,
        /// Affiche la durée
        #[arg(long)]
        time: bool,
    },
    /// Lie une unité principale et ses bibliothèques
    Link {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Produit une bibliothèque (.rgl)
        #[arg(long)]
        lib: bool,
        /// Fonction d'entrée
        #[arg(long)]
        entry: Option<String>,
        /// Écrit le manifest JSON
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Désassemble un module
    Disasm {
        input: PathBuf,
        #[arg(short, long)]
        out: Option<PathBuf>,
        #[arg(long)]
        compact: bool,
    },
    /// Résume un module
    Inspect {
        input: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

// ──────────────────────────── Logger / Verbosité ────────────────────────────

fn init_telemetry(verbose: u8, quiet: bool) {
    #[cfg(feature = "trace")]
    {
        let level = if quiet {
            "error"
        } else {
            match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
        };
        std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()));
        cli::init_logger();
    }
    #[cfg(not(feature = "trace"))]
    let _ = (verbose, quiet);
}

fn init_color(choice: ColorChoice) {
    match choice {
        ColorChoice::Auto => {}
        ColorChoice::Always => {
            std::env::set_var("CLICOLOR_FORCE", "1");
            std::env::remove_var("NO_COLOR");
        }
        ColorChoice::Never => {
            std::env::set_var("NO_COLOR", "1");
            std::env::remove_var("CLICOLOR_FORCE");
        }
    }
}

// ──────────────────────────── main ────────────────────────────

fn main() -> ExitCode {
    match real_main() {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn real_main() -> Result<i32> {
    let opt = Opt::parse();

    init_color(opt.color);
    init_telemetry(opt.verbose, opt.quiet);

    use cli::{Command as C, DisasmTask, InspectTask, LinkTask, RunTask};

    let command = match opt.cmd {
        Command::Run { program, args, config, register_size, max_frames, trace_ops, time } => {
            let args = args.into_iter().map(|s| s.to_string_lossy().to_string()).collect();
            C::Run(RunTask { program, args, config, register_size, max_frames, trace_ops, time })
        }
        Command::Link { inputs, out, lib, entry, manifest } => {
            C::Link(LinkTask { inputs, output: out, library: lib, entry, manifest })
        }
        Command::Disasm { input, out, compact } => C::Disasm(DisasmTask { input, output: out, compact }),
        Command::Inspect { input, json } => C::Inspect(InspectTask { input, json }),
    };

    cli::execute(command, &cli::Hooks::regis())
}
