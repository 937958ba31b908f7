//! regis-runtime: valeurs, registres et pont FFI de la machine regis
//!
//! Ce crate porte tout ce que la VM manipule sans exécuter de bytecode :
//!
//! - `Value`       : union fermée des types de la machine (Integer, Float, Boolean,
//!   Byte, String, Vector, Function, Closure, Exception)
//! - `RegisterSet` : slots nullables à taille fixe, alias par cellule partagée
//! - `Runtime`     : registre de natives, modules importés, sortie capturable
//! - `NativeFrame` : vue passée aux natives (arguments + registres locaux)
//! - `regis_native!` / `regis_module!` : macros pour écrire/exporter des natives
//! - `abi`         : ABI C stable des modules natifs (tables `#[repr(C)]`)
//! - feature `ffi` : chargement dynamique de modules natifs (`libloading`)
//!
//! ⚠️ Ce crate **n'exécute pas** le bytecode (c'est le rôle de `regis-vm`).

#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

pub mod abi;
pub mod registers;
pub mod value;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use registers::{Cell, RegisterSet, SlotFlags};
pub use value::{format_float, Closure, Exception, Value};

/* ------------------------------ Erreurs ------------------------------ */

/// Erreurs runtime.
///
/// Les variantes « machine » deviennent des exceptions attrapables (voir
/// [`Error::into_payload`]) ; les variantes « hôte » sont fatales au chargement.
#[derive(Debug, Error)]
pub enum Error {
    /// Lecture d'un slot vide.
    #[error("(get) read from null register: {0}")]
    NullRegister(u32),

    /// Index hors du jeu de registres.
    #[error("register index out of bounds: {0}")]
    OutOfBounds(u32),

    /// Type d'opérande inattendu.
    #[error("expected {expected} operand, got {got}")]
    Type {
        /// Type attendu.
        expected: &'static str,
        /// Type trouvé.
        got: &'static str,
    },

    /// Division ou modulo entier par zéro.
    #[error("division by zero")]
    DivisionByZero,

    /// Index de vecteur invalide.
    #[error("index out of range: {index} (length {len})")]
    IndexOutOfRange {
        /// Index demandé (avant normalisation).
        index: i64,
        /// Longueur du vecteur.
        len: usize,
    },

    /// Conversion texte → nombre impossible.
    #[error("invalid cast: cannot parse '{input}' as {kind}")]
    Cast {
        /// Texte source.
        input: String,
        /// Type visé.
        kind: &'static str,
    },

    /// Valeur levée telle quelle (par `throw` ou une native).
    #[error("{0}")]
    Throw(Value),

    /// Fonction native introuvable.
    #[error("fonction native introuvable: {0}")]
    NotFound(String),

    /// Arité invalide.
    #[error("mauvaise arité pour {name}: attendu {expected}, reçu {got}")]
    Arity {
        /// Nom complet de la native.
        name: String,
        /// Nombre d'arguments attendus par la native.
        expected: usize,
        /// Nombre d'arguments effectivement fournis lors de l'appel.
        got: usize,
    },

    /// Module natif introuvable ou illisible.
    #[error("module natif introuvable: {module} ({reason})")]
    Load {
        /// Nom du module.
        module: String,
        /// Détail (chemins essayés, erreur du chargeur).
        reason: String,
    },

    /// I/O hôte.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Message générique.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Erreur de type à partir de la valeur fautive.
    pub const fn type_mismatch(expected: &'static str, got: &Value) -> Self { Error::Type { expected, got: got.kind() } }

    /// Charge utile d'exception correspondante.
    pub fn into_payload(self) -> Value {
        match self {
            Error::Throw(v) => v,
            other => Value::Exception(Exception::new(other.to_string())),
        }
    }
}

/// Résultat du runtime.
pub type RResult<T> = std::result::Result<T, Error>;

/* -------------------------- Signature des natives -------------------------- */

/// Vue d'un appel natif : arguments du cadre + registres locaux de l'appelé.
///
/// La valeur de retour s'écrit dans le registre local 0, comme en bytecode.
pub struct NativeFrame<'a> {
    /// Arguments (`param`/`paref`).
    pub args: &'a RegisterSet,
    /// Registres locaux de l'appel.
    pub locals: &'a mut RegisterSet,
}

impl NativeFrame<'_> {
    /// Argument `i` (copie).
    pub fn arg(&self, i: u32) -> RResult<Value> {
        if i as usize >= self.args.size() {
            return Err(Error::Msg(format!("invalid read: read from argument register out of bounds: {i}")));
        }
        self.args.get(i)
    }

    /// Nombre d'arguments.
    pub fn argc(&self) -> usize { self.args.size() }

    /// Écrit la valeur de retour.
    pub fn ret(&mut self, value: Value) -> RResult<()> { self.locals.set(0, value) }
}

/// Fonction native : lit ses arguments et écrit son retour dans les registres.
pub type NativeFn = fn(&mut NativeFrame<'_>, &mut RuntimeCtx) -> RResult<()>;

/// Code d'une native : fonction Rust liée au binaire, ou point d'entrée C
/// d'un module chargé.
#[derive(Clone, Copy, Debug)]
pub enum NativeCode {
    /// Native compilée avec l'hôte.
    Builtin(NativeFn),
    /// Native d'un module dynamique (voir [`abi`]).
    Foreign(abi::RawNativeFn),
}

/// Descripteur d'une native.
#[derive(Clone, Debug)]
pub struct NativeEntry {
    /// Nom complet `module.name`
    pub fqname: String,
    /// Arité (si connue). Si `None`, libre.
    pub arity: Option<usize>,
    /// Code à exécuter.
    pub func: NativeCode,
}

/* ------------------------------ Contexte ------------------------------ */

/// Contexte passé aux natives.
pub struct RuntimeCtx {
    /// Sortie des instructions `print`/`echo` et des natives `io.*` (capturable en tests).
    pub stdout: Box<dyn Write + Send>,
}

impl RuntimeCtx {
    /// Écrit un texte brut dans `stdout`.
    pub fn write_str(&mut self, s: &str) -> io::Result<()> { self.stdout.write_all(s.as_bytes()) }
    /// Écrit une ligne terminée par `\n`.
    pub fn writeln_str(&mut self, s: &str) -> io::Result<()> {
        self.stdout.write_all(s.as_bytes())?;
        self.stdout.write_all(b"\n")
    }
    /// Vide la sortie.
    pub fn flush(&mut self) -> io::Result<()> { self.stdout.flush() }
}

/* ------------------------------ Runtime ------------------------------ */

/// Runtime : registre de natives + contexte partagé.
pub struct Runtime {
    registry: HashMap<String, NativeEntry>,
    available: HashSet<String>,
    imported: Vec<String>,
    ctx: RuntimeCtx,
    // déclaré en dernier : les pointeurs du registre doivent mourir avant les bibliothèques
    #[cfg(feature = "ffi")]
    libraries: Vec<libloading::Library>,
}

impl Default for Runtime {
    fn default() -> Self { Self::new() }
}

impl Runtime {
    /// Crée un runtime avec `stdout` réel et aucune native.
    pub fn new() -> Self {
        Self {
            registry: HashMap::new(),
            available: HashSet::new(),
            imported: Vec::new(),
            ctx: RuntimeCtx { stdout: Box::new(io::stdout()) },
            #[cfg(feature = "ffi")]
            libraries: Vec::new(),
        }
    }

    /// Natives par défaut + `stdout` capturé (tests, REPL).
    pub fn with_captured_stdout() -> (Self, Captured) {
        let cap = Captured::default();
        (Self::with_defaults().with_stdout(cap.clone()), cap)
    }

    /// Permet d'injecter un writer custom (ex: buffer, fichier…).
    pub fn with_stdout<W: Write + Send + 'static>(mut self, w: W) -> Self {
        self.ctx.stdout = Box::new(w);
        self
    }

    /// Contexte partagé avec les natives.
    pub fn ctx_mut(&mut self) -> &mut RuntimeCtx { &mut self.ctx }

    /// Enregistre une fonction native sous `module` + `name`.
    pub fn register_fn(&mut self, module: &str, name: &str, arity: Option<usize>, func: NativeFn) {
        self.insert(module, name, arity, NativeCode::Builtin(func));
    }

    /// Enregistre un export lu dans une table d'ABI C.
    pub fn register_foreign(&mut self, module: &str, export: &abi::ForeignExport) {
        self.insert(module, &export.name, export.arity, NativeCode::Foreign(export.func));
    }

    fn insert(&mut self, module: &str, name: &str, arity: Option<usize>, func: NativeCode) {
        let fq = format!("{module}.{name}");
        self.available.insert(module.to_owned());
        self.registry.insert(fq.clone(), NativeEntry { fqname: fq, arity, func });
    }

    /// Enregistre un lot (module complet).
    pub fn register_all(&mut self, module: &str, entries: &[(&str, Option<usize>, NativeFn)]) {
        for (name, arity, func) in entries {
            self.register_fn(module, name, *arity, *func);
        }
    }

    /// Le module est-il disponible sans chargement ?
    pub fn has_module(&self, module: &str) -> bool { self.available.contains(module) }

    /// Modules importés, dans l'ordre.
    pub fn imported(&self) -> &[String] { &self.imported }

    /// Importe un module natif : intégré, sinon chargé depuis `search` (feature `ffi`).
    pub fn import(&mut self, module: &str, search: &[PathBuf]) -> RResult<()> {
        if self.imported.iter().any(|m| m == module) {
            return Ok(());
        }
        if !self.available.contains(module) {
            self.load_external(module, search)?;
        }
        debug!(module, "module natif importé");
        self.imported.push(module.to_owned());
        Ok(())
    }

    #[cfg(feature = "ffi")]
    fn load_external(&mut self, module: &str, search: &[PathBuf]) -> RResult<()> {
        let (library, path, exports) = ffi::open(module, search)?;
        debug!(module, path = %path.display(), count = exports.len(), "bibliothèque native chargée");
        for export in &exports {
            self.register_foreign(module, export);
        }
        self.available.insert(module.to_owned());
        self.libraries.push(library);
        Ok(())
    }

    #[cfg(not(feature = "ffi"))]
    fn load_external(&mut self, module: &str, _search: &[PathBuf]) -> RResult<()> {
        Err(Error::Load { module: module.to_owned(), reason: "chargement dynamique désactivé (feature `ffi`)".into() })
    }

    /// Résout `module.name` en descripteur.
    pub fn resolve(&self, fqname: &str) -> RResult<NativeEntry> {
        self.registry.get(fqname).cloned().ok_or_else(|| Error::NotFound(fqname.to_owned()))
    }

    /// Exécute une native sur un cadre préparé par l'appelant.
    pub fn invoke(&mut self, entry: &NativeEntry, frame: &mut NativeFrame<'_>) -> RResult<()> {
        if let Some(expected) = entry.arity {
            if frame.argc() != expected {
                return Err(Error::Arity { name: entry.fqname.clone(), expected, got: frame.argc() });
            }
        }
        match entry.func {
            NativeCode::Builtin(func) => func(frame, &mut self.ctx),
            NativeCode::Foreign(func) => {
                // le module écrit directement sur le stdout du processus
                self.ctx.flush()?;
                abi::call_foreign(func, frame)
            }
        }
    }

    /// Appelle une native par `module.name` avec des arguments ; renvoie le registre local 0.
    pub fn call<S: AsRef<str>>(&mut self, fqname: S, args: &[Value]) -> RResult<Option<Value>> {
        let entry = self.resolve(fqname.as_ref())?;
        let mut arg_set = RegisterSet::new(args.len());
        for (i, v) in args.iter().enumerate() {
            arg_set.set(i as u32, v.clone())?;
        }
        let mut locals = RegisterSet::new(1);
        self.invoke(&entry, &mut NativeFrame { args: &arg_set, locals: &mut locals })?;
        if locals.is_null(0)? { Ok(None) } else { locals.take(0).map(Some) }
    }

    /// Précharge un **set de natives par défaut** (`io`, `time`, `math`, `os`).
    pub fn with_defaults() -> Self {
        let mut rt = Self::new();

        rt.register_all("io", &[
            ("print",   Some(1), native_io_print as NativeFn),
            ("println", Some(1), native_io_println as NativeFn),
        ]);

        rt.register_all("time", &[
            ("now_ms",  Some(0), native_time_now_ms as NativeFn),
        ]);

        rt.register_all("math", &[
            ("sqrt",  Some(1), native_math_sqrt as NativeFn),
            ("abs",   Some(1), native_math_abs as NativeFn),
            ("floor", Some(1), native_math_floor as NativeFn),
            ("ceil",  Some(1), native_math_ceil as NativeFn),
            ("pow",   Some(2), native_math_pow as NativeFn),
        ]);

        rt.register_all("os", &[
            ("getenv", Some(1), native_os_getenv as NativeFn),
        ]);

        rt
    }
}

/* --------------------------- Impl natives par défaut --------------------------- */

fn number(v: &Value) -> RResult<f64> {
    match v {
        Value::Integer(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        other => Err(Error::type_mismatch("Float", other)),
    }
}

fn native_io_print(frame: &mut NativeFrame<'_>, ctx: &mut RuntimeCtx) -> RResult<()> {
    ctx.write_str(&frame.arg(0)?.to_string())?;
    Ok(())
}

fn native_io_println(frame: &mut NativeFrame<'_>, ctx: &mut RuntimeCtx) -> RResult<()> {
    ctx.writeln_str(&frame.arg(0)?.to_string())?;
    Ok(())
}

fn native_time_now_ms(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let t = SystemTime::now().duration_since(UNIX_EPOCH).map_err(|e| Error::Msg(format!("clock error: {e}")))?;
    frame.ret(Value::Integer(i64::try_from(t.as_millis()).unwrap_or(i64::MAX)))
}

fn native_math_sqrt(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let x = number(&frame.arg(0)?)?;
    frame.ret(Value::Float(x.sqrt()))
}

fn native_math_abs(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let v = match frame.arg(0)? {
        Value::Integer(i) => Value::Integer(i.wrapping_abs()),
        Value::Float(x) => Value::Float(x.abs()),
        other => return Err(Error::type_mismatch("Integer", &other)),
    };
    frame.ret(v)
}

fn native_math_floor(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let v = match frame.arg(0)? {
        Value::Float(x) => Value::Float(x.floor()),
        i @ Value::Integer(_) => i,
        other => return Err(Error::type_mismatch("Float", &other)),
    };
    frame.ret(v)
}

fn native_math_ceil(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let v = match frame.arg(0)? {
        Value::Float(x) => Value::Float(x.ceil()),
        i @ Value::Integer(_) => i,
        other => return Err(Error::type_mismatch("Float", &other)),
    };
    frame.ret(v)
}

fn native_math_pow(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let v = match (frame.arg(0)?, frame.arg(1)?) {
        (Value::Integer(b), Value::Integer(e)) if e >= 0 => {
            Value::Integer(b.wrapping_pow(u32::try_from(e).unwrap_or(u32::MAX)))
        }
        (b, e) => Value::Float(number(&b)?.powf(number(&e)?)),
    };
    frame.ret(v)
}

fn native_os_getenv(frame: &mut NativeFrame<'_>, _ctx: &mut RuntimeCtx) -> RResult<()> {
    let key = frame.arg(0)?;
    match std::env::var(key.as_str()?) {
        Ok(v) => frame.ret(Value::String(v)),
        Err(_) => Err(Error::Msg(format!("environment variable not set: {key}"))),
    }
}

/* ----------------------------- Macros sucrées ----------------------------- */

/// Macro pour déclarer une native rapidement.
///
/// # Exemple
/// ```
/// use regis_runtime::{regis_native, Value};
/// regis_native!(hello |frame, _ctx| {
///     let name = frame.arg(0)?;
///     frame.ret(Value::String(format!("Hello, {name}!")))
/// });
/// ```
#[macro_export]
macro_rules! regis_native {
    ($name:ident |$frame:ident, $ctx:ident| $body:block) => {
        pub fn $name($frame: &mut $crate::NativeFrame<'_>, $ctx: &mut $crate::RuntimeCtx) -> $crate::RResult<()> {
            $body
        }
    };
}

/// Exporte la table de natives d'une bibliothèque dynamique (`crate-type = ["cdylib"]`).
///
/// Génère `extern "C" fn regis_module_exports() -> *const RawModule` et un
/// trampoline `extern "C"` par native (voir [`abi`] pour le contrat).
///
/// ```ignore
/// regis_runtime::regis_module! {
///     "hello" => (Some(0), hello),
/// }
/// ```
#[macro_export]
macro_rules! regis_module {
    ($($name:literal => ($arity:expr, $func:path)),* $(,)?) => {
        /// Table d'exports regis (ABI C).
        #[no_mangle]
        pub extern "C" fn regis_module_exports() -> *const $crate::abi::RawModule {
            const ENTRIES: &[$crate::abi::RawExport] = &[
                $($crate::abi::RawExport {
                    name: concat!($name, "\0").as_ptr().cast(),
                    arity: $crate::abi::RawExport::arity($arity),
                    func: {
                        unsafe extern "C" fn trampoline(
                            args: *const $crate::abi::RawValue,
                            argc: usize,
                            out: *mut $crate::abi::RawValue,
                        ) -> u32 {
                            // SAFETY: l'hôte respecte le contrat de `abi`.
                            unsafe { $crate::abi::serve($func, args, argc, out) }
                        }
                        trampoline
                    },
                }),*
            ];
            static MODULE: $crate::abi::RawModule = $crate::abi::RawModule {
                abi: $crate::abi::ABI_VERSION,
                len: ENTRIES.len(),
                entries: ENTRIES.as_ptr(),
            };
            &MODULE
        }
    };
}

/* ------------------------ Outil de capture stdout ------------------------ */

/// Petit writer qui **capture** le stdout dans une String (utile en tests/REPL).
#[derive(Default, Clone)]
pub struct Captured(Arc<Mutex<String>>);

impl Captured {
    /// Récupère le buffer (copie).
    pub fn get(&self) -> String { self.0.lock().clone() }
    /// Lignes capturées.
    pub fn lines(&self) -> Vec<String> { self.0.lock().lines().map(str::to_owned).collect() }
    /// Réinitialise le buffer.
    pub fn clear(&self) { self.0.lock().clear(); }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}

/* -------------------------------- Prelude -------------------------------- */

/// Prelude pratique pour importer d'un coup.
pub mod prelude {
    pub use crate::{
        regis_native, Captured, Closure, Error, Exception, NativeCode, NativeEntry, NativeFn, NativeFrame, RResult,
        RegisterSet, Runtime, RuntimeCtx, SlotFlags, Value,
    };
}

/* --------------------------------- Tests --------------------------------- */
