//! regis-core: primitives partagées de la machine à registres
//!
//! Fournit :
//! - Constantes du conteneur (`MODULE_MAGIC`, `MODULE_VERSION`)
//! - IO mémoire (little-endian) : `ByteWriter`, `ByteReader`
//! - `crc32_ieee` (adossé à `crc32fast`)
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//! - `bytecode` : opérandes, instructions, modules, builder, validation, désassembleur
//!
//! Features :
//! - `serde` (par défaut) : derive (dé)sérialisation sur les types descriptifs

#![deny(missing_docs)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::borrow::Cow;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Primitives de bytecode (instructions, module, builder, désassembleur, helpers).
pub mod bytecode;

/// Raccourci : validation structurelle.
pub use bytecode::helpers;
/// Raccourci : désassembleur textuel.
pub use bytecode::disasm;

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/* ─────────────────────────── Conteneur: constantes ─────────────────────────── */

/// Magic d'un module regis : `b"RGMD"`.
pub const MODULE_MAGIC: &[u8; 4] = b"RGMD";

/// Version actuelle du format de module.
pub const MODULE_VERSION: u16 = 1;

/* ─────────────────────────── CRC32 IEEE ─────────────────────────── */

/// CRC32 (IEEE 802.3) du payload.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/* ─────────────────────────── Byte Writer (LE) ─────────────────────────── */

/// Buffer d'écriture (croît automatiquement).
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub fn new() -> Self { Self { buf: Vec::new() } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Taille courante.
    pub fn len(&self) -> usize { self.buf.len() }
    /// Vrai si rien n'a été écrit.
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Écrit un octet.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Écrit un u16 little-endian.
    pub fn write_u16_le(&mut self, v: u16) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un u32 little-endian.
    pub fn write_u32_le(&mut self, v: u32) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un u64 little-endian.
    pub fn write_u64_le(&mut self, v: u64) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un i64 little-endian.
    pub fn write_i64_le(&mut self, v: i64) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit un f64 little-endian.
    pub fn write_f64_le(&mut self, v: f64) { self.buf.extend_from_slice(&v.to_le_bytes()); }
    /// Écrit une chaîne préfixée par sa longueur (u32).
    pub fn write_str(&mut self, s: &str) {
        self.write_u32_le(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }
}

/* ─────────────────────────── Byte Reader (LE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d'octets (helpers LE).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub fn new(data: &'a [u8]) -> Self { Self { data, off: 0 } }
    /// Offset courant.
    pub fn offset(&self) -> usize { self.off }
    /// Taille restante.
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.off as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Lit un octet.
    pub fn read_u8(&mut self) -> CoreResult<u8> { Ok(self.read_bytes(1)?[0]) }

    /// Lit un u16 LE.
    pub fn read_u16_le(&mut self) -> CoreResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Lit un u32 LE.
    pub fn read_u32_le(&mut self) -> CoreResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Lit un u64 LE.
    pub fn read_u64_le(&mut self) -> CoreResult<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// Lit un i64 LE.
    pub fn read_i64_le(&mut self) -> CoreResult<i64> { Ok(self.read_u64_le()? as i64) }

    /// Lit un f64 LE.
    pub fn read_f64_le(&mut self) -> CoreResult<f64> { Ok(f64::from_bits(self.read_u64_le()?)) }

    /// Lit une chaîne préfixée par sa longueur (u32).
    pub fn read_str(&mut self) -> CoreResult<String> {
        let len = self.read_u32_le()? as usize;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| CoreError::InvalidUtf8)
    }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CoreError {
    /// Magic invalide (attendu `b"RGMD"`).
    InvalidMagic,
    /// Fin de buffer inattendue.
    UnexpectedEof {
        /// Nombre d'octets manquants.
        needed: u64,
        /// Offset où l'erreur s'est produite.
        at: u64,
    },
    /// UTF-8 invalide.
    InvalidUtf8,
    /// Données corrompues (tag, format).
    Corrupted(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Corrupted(msg.into()) }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidMagic => write!(f, "invalid module magic"),
            CoreError::UnexpectedEof { needed, at } => write!(f, "unexpected EOF: need {needed} bytes at {at}"),
            CoreError::InvalidUtf8 => write!(f, "invalid utf-8"),
            CoreError::Corrupted(msg) => write!(f, "corrupted: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/* ─────────────────────────── Prélude ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        bytecode::{
            ArithOp, CmpOp, Index, Module, ModuleBuilder, ModuleError, ModuleKind, Op, Operand,
            SetKind, Symbol, SymbolId, SymbolKind, SymbolTable,
        },
        crc32_ieee, ByteReader, ByteWriter, CoreError, CoreResult, MODULE_MAGIC, MODULE_VERSION,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
