//! ABI C des modules natifs dynamiques (version [`ABI_VERSION`]).
//!
//! Seuls des types `#[repr(C)]` traversent la frontière : un module compilé par
//! un autre rustc, ou écrit en C, reste chargeable. Vue côté C :
//!
//! ```text
//! typedef struct {
//!     uint32_t    tag;     /* RawTag */
//!     int64_t     int_;    /* Integer, Boolean (0/1), Byte */
//!     double      float_;  /* Float */
//!     const void *ptr;     /* String : octets UTF-8 ; Vector : RegisValue[] */
//!     size_t      len;
//! } RegisValue;
//!
//! typedef uint32_t (*RegisNativeFn)(const RegisValue *args, size_t argc, RegisValue *out);
//!
//! typedef struct { const char *name; int64_t arity; RegisNativeFn func; } RegisExport;
//! typedef struct { uint32_t abi; size_t len; const RegisExport *entries; } RegisModule;
//!
//! const RegisModule *regis_module_exports(void);
//! ```
//!
//! - `abi` doit valoir [`ABI_VERSION`], sinon le chargement échoue.
//! - `name` : chaîne C UTF-8 terminée par NUL. `arity < 0` : arité libre.
//! - Tag `Null` : registre vide en argument, absence de retour en sortie.
//! - Statut ([`RawStatus`]) : `Ok` (retour dans `*out`), `Error` (message
//!   `String` dans `*out`), `Throw` (charge utile levée telle quelle).
//! - Les arguments appartiennent à l'hôte et ne vivent que le temps de l'appel.
//!   `*out` appartient au module et reste valide jusqu'au prochain appel sur le
//!   même thread ; l'hôte le copie avant de rendre la main.
//! - Fonctions, fermetures et exceptions ne traversent pas la frontière.
//!
//! Côté Rust, [`regis_module!`](crate::regis_module) génère la table et les
//! trampolines ; les natives restent écrites avec [`NativeFrame`].

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::{ptr, slice};

use crate::{Error, NativeFn, NativeFrame, RResult, RegisterSet, RuntimeCtx, Value};

/// Version de l'ABI portée par [`RawModule::abi`].
pub const ABI_VERSION: u32 = 1;

/// Type d'une [`RawValue`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawTag {
    /// Registre vide.
    Null = 0,
    /// Entier dans `int`.
    Integer = 1,
    /// Flottant dans `float`.
    Float = 2,
    /// Booléen dans `int` (0 ou 1).
    Boolean = 3,
    /// Octet dans `int`.
    Byte = 4,
    /// UTF-8 `ptr`/`len`.
    String = 5,
    /// Tableau de `RawValue` `ptr`/`len`.
    Vector = 6,
}

impl RawTag {
    /// Décode un tag lu en mémoire étrangère.
    pub const fn from_raw(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::Null,
            1 => Self::Integer,
            2 => Self::Float,
            3 => Self::Boolean,
            4 => Self::Byte,
            5 => Self::String,
            6 => Self::Vector,
            _ => return None,
        })
    }
}

/// Statut renvoyé par une [`RawNativeFn`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RawStatus {
    /// Succès ; `*out` porte le retour (ou `Null`).
    Ok = 0,
    /// Échec ; `*out` porte le message.
    Error = 1,
    /// Valeur levée ; `*out` porte la charge utile.
    Throw = 2,
}

impl RawStatus {
    /// Décode un statut renvoyé par un module.
    pub const fn from_raw(status: u32) -> Option<Self> {
        Some(match status {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Throw,
            _ => return None,
        })
    }
}

/// Valeur à plat ; les champs inutilisés par le tag valent zéro.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawValue {
    /// [`RawTag`] encodé.
    pub tag: u32,
    /// Charge entière.
    pub int: i64,
    /// Charge flottante.
    pub float: f64,
    /// Données de `String`/`Vector`.
    pub ptr: *const c_void,
    /// Longueur (octets ou éléments).
    pub len: usize,
}

impl RawValue {
    /// Registre vide.
    pub const NULL: Self = Self { tag: RawTag::Null as u32, int: 0, float: 0.0, ptr: ptr::null(), len: 0 };

    const fn scalar(tag: RawTag, int: i64) -> Self { Self { tag: tag as u32, int, ..Self::NULL } }

    const fn span(tag: RawTag, ptr: *const c_void, len: usize) -> Self { Self { tag: tag as u32, ptr, len, ..Self::NULL } }
}

/// Point d'entrée d'une native exportée.
pub type RawNativeFn = unsafe extern "C" fn(args: *const RawValue, argc: usize, out: *mut RawValue) -> u32;

/// Entrée de la table d'exports.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawExport {
    /// Nom court, chaîne C terminée par NUL.
    pub name: *const c_char,
    /// Arité ; négative si libre.
    pub arity: i64,
    /// Point d'entrée.
    pub func: RawNativeFn,
}

impl RawExport {
    /// Encode une arité Rust.
    #[allow(clippy::cast_possible_wrap)]
    pub const fn arity(arity: Option<usize>) -> i64 {
        match arity {
            Some(n) => n as i64,
            None => -1,
        }
    }
}

/// Table renvoyée par `regis_module_exports`.
#[repr(C)]
#[derive(Debug)]
pub struct RawModule {
    /// Doit valoir [`ABI_VERSION`].
    pub abi: u32,
    /// Nombre d'entrées.
    pub len: usize,
    /// Premier élément.
    pub entries: *const RawExport,
}

// SAFETY: les tables sont des statiques en lecture seule ; les pointeurs visent
// des données `'static` du module.
unsafe impl Sync for RawExport {}
// SAFETY: idem.
unsafe impl Sync for RawModule {}

/// Signature de `regis_module_exports`.
pub type RawExportsFn = unsafe extern "C" fn() -> *const RawModule;

/* ------------------------------ Conversions ------------------------------ */

/// Tableaux imbriqués produits par [`Lowered::lower`], tenus en vie avec lui.
#[derive(Default)]
pub struct Lowered {
    arrays: Vec<Box<[RawValue]>>,
}

impl Lowered {
    /// Met `value` à plat. Le résultat emprunte `value` et `self` : les deux
    /// doivent survivre à son usage.
    pub fn lower(&mut self, value: &Value) -> RResult<RawValue> {
        Ok(match value {
            Value::Integer(i) => RawValue::scalar(RawTag::Integer, *i),
            Value::Float(x) => RawValue { tag: RawTag::Float as u32, float: *x, ..RawValue::NULL },
            Value::Boolean(b) => RawValue::scalar(RawTag::Boolean, i64::from(*b)),
            Value::Byte(b) => RawValue::scalar(RawTag::Byte, i64::from(*b)),
            Value::String(s) => RawValue::span(RawTag::String, s.as_ptr().cast(), s.len()),
            Value::Vector(items) => {
                let array = items.iter().map(|v| self.lower(v)).collect::<RResult<Box<[RawValue]>>>()?;
                let raw = RawValue::span(RawTag::Vector, array.as_ptr().cast(), array.len());
                self.arrays.push(array);
                raw
            }
            other => return Err(Error::Msg(format!("cannot pass {} across the native ABI", other.kind()))),
        })
    }
}

unsafe fn slice_of<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if len == 0 || ptr.is_null() { &[] } else { slice::from_raw_parts(ptr, len) }
}

/// Relève une valeur étrangère ; `None` pour `Null`.
///
/// # Safety
/// `ptr`/`len` de `raw` (et des éléments d'un `Vector`) décrivent une mémoire lisible.
pub unsafe fn raise(raw: &RawValue) -> RResult<Option<Value>> {
    let Some(tag) = RawTag::from_raw(raw.tag) else {
        return Err(Error::Msg(format!("unknown native value tag {}", raw.tag)));
    };
    let value = match tag {
        RawTag::Null => return Ok(None),
        RawTag::Integer => Value::Integer(raw.int),
        RawTag::Float => Value::Float(raw.float),
        RawTag::Boolean => Value::Boolean(raw.int != 0),
        RawTag::Byte => Value::Byte(
            u8::try_from(raw.int).map_err(|_| Error::Msg(format!("byte out of range: {}", raw.int)))?,
        ),
        RawTag::String => {
            let bytes = slice_of(raw.ptr.cast::<u8>(), raw.len);
            let text = std::str::from_utf8(bytes).map_err(|e| Error::Msg(format!("invalid native string: {e}")))?;
            Value::String(text.to_owned())
        }
        RawTag::Vector => {
            let mut items = Vec::with_capacity(raw.len);
            for item in slice_of(raw.ptr.cast::<RawValue>(), raw.len) {
                match raise(item)? {
                    Some(v) => items.push(v),
                    None => return Err(Error::Msg("null element in native vector".into())),
                }
            }
            Value::Vector(items)
        }
    };
    Ok(Some(value))
}

/* ------------------------------- Côté hôte ------------------------------- */

/// Export lu dans une table étrangère (nom copié).
#[derive(Clone, Debug)]
pub struct ForeignExport {
    /// Nom court.
    pub name: String,
    /// Arité (si connue).
    pub arity: Option<usize>,
    /// Point d'entrée.
    pub func: RawNativeFn,
}

/// Lit la table d'un module.
///
/// # Safety
/// `table` est nul ou pointe une [`RawModule`] conforme, vivante pendant la lecture.
pub unsafe fn read_table(table: *const RawModule) -> RResult<Vec<ForeignExport>> {
    let Some(table) = table.as_ref() else {
        return Err(Error::Msg("null export table".into()));
    };
    if table.abi != ABI_VERSION {
        return Err(Error::Msg(format!("unsupported native ABI version {} (expected {ABI_VERSION})", table.abi)));
    }
    let mut out = Vec::with_capacity(table.len);
    for entry in slice_of(table.entries, table.len) {
        if entry.name.is_null() {
            return Err(Error::Msg("export without a name".into()));
        }
        let name = CStr::from_ptr(entry.name).to_str().map_err(|e| Error::Msg(format!("invalid export name: {e}")))?;
        out.push(ForeignExport { name: name.to_owned(), arity: usize::try_from(entry.arity).ok(), func: entry.func });
    }
    Ok(out)
}

/// Appelle une native étrangère sur `frame`.
pub(crate) fn call_foreign(func: RawNativeFn, frame: &mut NativeFrame<'_>) -> RResult<()> {
    let mut values = Vec::with_capacity(frame.argc());
    for i in 0..frame.argc() {
        let i = u32::try_from(i).map_err(|_| Error::OutOfBounds(u32::MAX))?;
        values.push(if frame.args.is_null(i)? { None } else { Some(frame.args.get(i)?) });
    }
    let mut lowered = Lowered::default();
    let args = values
        .iter()
        .map(|v| v.as_ref().map_or(Ok(RawValue::NULL), |v| lowered.lower(v)))
        .collect::<RResult<Vec<_>>>()?;

    let mut out = RawValue::NULL;
    // SAFETY: `args` et `lowered` vivent jusqu'à la fin de l'appel ; `out` est
    // relevé (copié) avant tout autre appel sur ce thread.
    let (status, returned) = unsafe {
        let status = func(args.as_ptr(), args.len(), &mut out);
        (status, raise(&out)?)
    };

    match RawStatus::from_raw(status) {
        Some(RawStatus::Ok) => returned.map_or(Ok(()), |v| frame.ret(v)),
        Some(RawStatus::Throw) => Err(Error::Throw(returned.ok_or_else(|| Error::Msg("native threw no payload".into()))?)),
        Some(RawStatus::Error) => Err(Error::Msg(returned.map_or_else(|| "native error".to_owned(), |v| v.to_string()))),
        None => Err(Error::Msg(format!("unknown native status {status}"))),
    }
}

/* ------------------------------ Côté module ------------------------------ */

thread_local! {
    // Dernier retour publié vers l'hôte, et ses tableaux.
    static RETURNED: RefCell<(Option<Value>, Lowered)> = RefCell::new((None, Lowered::default()));
}

fn publish(payload: Option<Value>, out: &mut RawValue) -> RResult<()> {
    RETURNED.with(|slot| {
        let mut slot = slot.borrow_mut();
        let (kept, lowered) = &mut *slot;
        *lowered = Lowered::default();
        *kept = payload;
        *out = match kept {
            Some(v) => lowered.lower(v)?,
            None => RawValue::NULL,
        };
        Ok(())
    })
}

unsafe fn run(func: NativeFn, args: *const RawValue, argc: usize) -> RResult<Option<Value>> {
    let mut arg_set = RegisterSet::new(argc);
    for (i, raw) in slice_of(args, argc).iter().enumerate() {
        if let Some(v) = raise(raw)? {
            arg_set.set(u32::try_from(i).map_err(|_| Error::OutOfBounds(u32::MAX))?, v)?;
        }
    }
    let mut locals = RegisterSet::new(1);
    let mut ctx = RuntimeCtx { stdout: Box::new(io::stdout()) };
    let result = func(&mut NativeFrame { args: &arg_set, locals: &mut locals }, &mut ctx);
    ctx.flush()?;
    result?;
    if locals.is_null(0)? { Ok(None) } else { locals.take(0).map(Some) }
}

/// Sert un appel de l'hôte : relève les arguments, exécute `func`, publie le
/// résultat dans `*out`. Une panique devient une erreur.
///
/// Les natives servies ici écrivent sur le `stdout` du processus.
///
/// # Safety
/// `args` pointe `argc` valeurs conformes ; `out` est inscriptible.
pub unsafe fn serve(func: NativeFn, args: *const RawValue, argc: usize, out: *mut RawValue) -> u32 {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { run(func, args, argc) }))
        .unwrap_or_else(|_| Err(Error::Msg("native function panicked".into())));
    let (status, payload) = match outcome {
        Ok(ret) => (RawStatus::Ok, ret),
        Err(Error::Throw(v)) => (RawStatus::Throw, Some(v)),
        Err(e) => (RawStatus::Error, Some(Value::String(e.to_string()))),
    };
    let out = &mut *out;
    match publish(payload, out) {
        Ok(()) => status as u32,
        Err(e) => {
            // un message se met toujours à plat
            let _ = publish(Some(Value::String(e.to_string())), out);
            RawStatus::Error as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nested_values_survive_the_boundary() {
        let value = Value::Vector(vec![
            Value::Integer(-3),
            Value::String("é".into()),
            Value::Vector(vec![Value::Byte(255), Value::Boolean(true), Value::Float(0.5)]),
        ]);
        let mut lowered = Lowered::default();
        let raw = lowered.lower(&value).unwrap();
        assert_eq!(unsafe { raise(&raw) }.unwrap(), Some(value));
        assert_eq!(unsafe { raise(&RawValue::NULL) }.unwrap(), None);
    }

    #[test]
    fn callables_stay_on_the_host_side() {
        let err = Lowered::default().lower(&Value::Function("main".into())).unwrap_err();
        assert_eq!(err.to_string(), "cannot pass Function across the native ABI");
    }

    #[test]
    fn foreign_garbage_is_rejected() {
        let bad_tag = RawValue { tag: 42, ..RawValue::NULL };
        assert!(unsafe { raise(&bad_tag) }.is_err());
        let bad_byte = RawValue::scalar(RawTag::Byte, 300);
        assert_eq!(unsafe { raise(&bad_byte) }.unwrap_err().to_string(), "byte out of range: 300");

        let old = RawModule { abi: ABI_VERSION + 1, len: 0, entries: ptr::null() };
        let err = unsafe { read_table(&old) }.unwrap_err();
        assert_eq!(err.to_string(), "unsupported native ABI version 2 (expected 1)");
        assert!(unsafe { read_table(ptr::null()) }.is_err());
    }

    #[test]
    fn arity_encoding() {
        assert_eq!(RawExport::arity(Some(2)), 2);
        assert_eq!(RawExport::arity(None), -1);
    }
}
