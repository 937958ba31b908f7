//! Valeurs dynamiques de la machine.
//!
//! Une valeur est toujours complète : l'absence de valeur (Null) n'est pas
//! une variante, c'est un slot vide du [`RegisterSet`](crate::RegisterSet).

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::registers::RegisterSet;
use crate::{Error, RResult};

/* --------------------------- Types de valeur --------------------------- */

/// Closure : fonction + registres capturés, partagés entre toutes les closures
/// créées par le même cadre.
#[derive(Clone)]
pub struct Closure {
    /// Nom de la fonction appelée.
    pub function: String,
    /// Registres capturés (servent de registres locaux à l'appel).
    pub captured: Rc<RefCell<RegisterSet>>,
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && Rc::ptr_eq(&self.captured, &other.captured)
    }
}

/// Exception levée par la machine (ou par une native).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    /// Message affiché et comparé par les tests.
    pub message: String,
}

impl Exception {
    /// Nouvelle exception.
    pub fn new(message: impl Into<String>) -> Self { Self { message: message.into() } }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.message) }
}

/// Valeur dynamique portée par un registre.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Entier 64 bits signé.
    Integer(i64),
    /// Flottant double précision.
    Float(f64),
    /// Booléen.
    Boolean(bool),
    /// Octet.
    Byte(u8),
    /// Chaîne UTF-8 possédée.
    String(String),
    /// Séquence hétérogène.
    Vector(Vec<Value>),
    /// Référence de fonction (par nom).
    Function(String),
    /// Fonction + registres capturés.
    Closure(Closure),
    /// Charge utile d'exception machine.
    Exception(Exception),
}

impl Value {
    /// Nom du type, tel qu'utilisé par `catch`.
    pub const fn kind(&self) -> &'static str {
        match self {
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Boolean(_) => "Boolean",
            Value::Byte(_) => "Byte",
            Value::String(_) => "String",
            Value::Vector(_) => "Vector",
            Value::Function(_) => "Function",
            Value::Closure(_) => "Closure",
            Value::Exception(_) => "Exception",
        }
    }

    /// Vérité : nombres non nuls, conteneurs non vides, le reste est vrai.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Integer(i) => *i != 0,
            Value::Float(x) => *x != 0.0,
            Value::Boolean(b) => *b,
            Value::Byte(b) => *b != 0,
            Value::String(s) => !s.is_empty(),
            Value::Vector(v) => !v.is_empty(),
            Value::Function(_) | Value::Closure(_) | Value::Exception(_) => true,
        }
    }

    /// Lecture entière ; un Boolean vaut 0 ou 1.
    pub fn as_int(&self) -> RResult<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            Value::Boolean(b) => Ok(i64::from(*b)),
            other => Err(Error::type_mismatch("Integer", other)),
        }
    }

    /// Lecture flottante stricte.
    pub fn as_float(&self) -> RResult<f64> {
        match self {
            Value::Float(x) => Ok(*x),
            other => Err(Error::type_mismatch("Float", other)),
        }
    }

    /// Lecture texte stricte.
    pub fn as_str(&self) -> RResult<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(Error::type_mismatch("String", other)),
        }
    }

    /// Contenu d'un vecteur, en écriture.
    pub fn as_vec_mut(&mut self) -> RResult<&mut Vec<Value>> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(Error::type_mismatch("Vector", other)),
        }
    }

    /// Contenu d'un vecteur, en lecture.
    pub fn as_vec(&self) -> RResult<&[Value]> {
        match self {
            Value::Vector(v) => Ok(v),
            other => Err(Error::type_mismatch("Vector", other)),
        }
    }

    /// Vrai pour les chaînes et vecteurs de longueur nulle.
    pub fn is_empty_container(&self) -> bool {
        match self {
            Value::String(s) => s.is_empty(),
            Value::Vector(v) => v.is_empty(),
            _ => false,
        }
    }
}

/// Rendu d'un flottant : six décimales, zéros finaux retirés, au moins une décimale.
pub fn format_float(x: f64) -> String {
    let mut s = format!("{x:.6}");
    if !s.contains('.') {
        return s;
    }
    while s.ends_with('0') && !s.ends_with(".0") {
        s.pop();
    }
    s
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Byte(b) => write!(f, "{}", char::from(*b)),
            Value::String(s) => f.write_str(s),
            Value::Vector(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match item {
                        Value::String(s) => write!(f, "{s:?}")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("]")
            }
            Value::Function(name) => write!(f, "Function: {name}"),
            Value::Closure(c) => write!(f, "Closure: {}", c.function),
            Value::Exception(e) => f.write_str(&e.message),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Vector(v) => write!(f, "Vector(len={})", v.len()),
            Value::Closure(c) => write!(f, "Closure({})", c.function),
            other => write!(f, "{}({other})", other.kind()),
        }
    }
}

/* Conversions */
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Integer(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Value::Boolean(v) } }
impl From<u8> for Value { fn from(v: u8) -> Self { Value::Byte(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_owned()) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Value::Vector(v) } }
impl From<Exception> for Value { fn from(e: Exception) -> Self { Value::Exception(e) } }
