//! regis-vm: machine à registres
//!
//! Exécute un module lié (`ModuleKind::Executable`) :
//! - [`Image`] : validation, import des natives, résolution des symboles
//! - [`Cpu`] : boucle fetch-decode-execute, cadres d'appel, `try`/`catch`
//! - [`VmConfig`] : tailles des jeux de registres, profondeur max, chemins natifs
//!
//! Les erreurs de chargement ([`VmError`]) sont fatales ; les erreurs
//! d'exécution deviennent des exceptions attrapables et, sinon, un
//! [`Halt::Uncaught`] avec la pile d'appels.
//!
//! ```no_run
//! use regis_core::bytecode::Module;
//! use regis_runtime::Runtime;
//! use regis_vm::{run, VmConfig};
//!
//! # fn demo(module: Module) -> regis_vm::VmResult<()> {
//! let halt = run(module, Runtime::with_defaults(), &VmConfig::from_env(), &[])?;
//! std::process::exit(halt.exit_code());
//! # }
//! ```

#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

/// Configuration d'exécution.
pub mod config;
/// Boucle d'exécution.
pub mod cpu;
mod error;
/// Cadres d'appel et cadres `try`.
pub mod frame;
/// Image exécutable chargée.
pub mod image;

pub use config::VmConfig;
pub use cpu::{Cpu, Halt, Uncaught};
pub use error::{VmError, VmResult};
pub use image::Image;

use regis_core::bytecode::Module;
use regis_runtime::Runtime;

/// Charge `module` puis l'exécute jusqu'au bout.
pub fn run(module: Module, mut runtime: Runtime, config: &VmConfig, argv: &[String]) -> VmResult<Halt> {
    let image = Image::load(module, &mut runtime, config)?;
    let mut cpu = Cpu::new(image, runtime, config.clone());
    Ok(cpu.run(argv))
}
