//! Bytecode module container plus its compact binary roundtrip.
//!
//! Layout (little-endian):
//!
//! ```text
//! "RGMD" version:u16 kind:u8 reserved:u8
//! name:str  main?:str  natives:[str]
//! symbols:[name:str kind:u8 body?:(start:u32 end:u32)]
//! entry?:u32  ops:[op]  crc32:u32
//! ```

use std::fmt;
use std::ops::Range;

use indexmap::IndexMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::op::{Op, SymbolId};
use crate::{crc32_ieee, ByteReader, ByteWriter, CoreError, MODULE_MAGIC, MODULE_VERSION};

/* ─────────────────────────── Kinds ─────────────────────────── */

/// What a module is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ModuleKind {
    /// Translation unit awaiting a link.
    #[default]
    Object,
    /// Linkable library.
    Library,
    /// Linked image, loadable standalone.
    Executable,
}

impl ModuleKind {
    /// Default file extension.
    pub const fn extension(self) -> &'static str {
        match self {
            ModuleKind::Object => "rgm",
            ModuleKind::Library => "rgl",
            ModuleKind::Executable => "rgx",
        }
    }

    const fn tag(self) -> u8 {
        match self {
            ModuleKind::Object => 0,
            ModuleKind::Library => 1,
            ModuleKind::Executable => 2,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleKind::Object => "object",
            ModuleKind::Library => "library",
            ModuleKind::Executable => "executable",
        })
    }
}

/// Callable function or catch/try block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SymbolKind {
    /// Function (`call`, `function`, `closure`).
    Function,
    /// Block (`try`, `catch`).
    Block,
}

/// One symbol-table entry. `body == None` marks an import.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Symbol {
    /// Symbol name (`main`, `math.sqrt`, `handler`).
    pub name: String,
    /// Function or block.
    pub kind: SymbolKind,
    /// Code range `[start, end)` when defined here.
    pub body: Option<Range<u32>>,
}

impl Symbol {
    /// True when the body lives in this module.
    pub const fn is_defined(&self) -> bool { self.body.is_some() }

    /// Native-qualified name split as `(module, function)`.
    pub fn native_parts(&self) -> Option<(&str, &str)> { self.name.split_once('.') }
}

/* ─────────────────────────── Symbol table ─────────────────────────── */

/// Ordered symbol table; a symbol's position is its [`SymbolId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    entries: IndexMap<String, Symbol>,
}

impl SymbolTable {
    /// Empty table.
    pub fn new() -> Self { Self { entries: IndexMap::new() } }

    /// Number of symbols.
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Returns the id of `name`, adding an undefined entry if needed.
    pub fn intern(&mut self, name: &str, kind: SymbolKind) -> SymbolId {
        if let Some(ix) = self.entries.get_index_of(name) {
            return SymbolId(ix as u32);
        }
        let (ix, _) = self.entries.insert_full(name.to_owned(), Symbol { name: name.to_owned(), kind, body: None });
        SymbolId(ix as u32)
    }

    /// Lookup by id.
    pub fn get(&self, id: SymbolId) -> Option<&Symbol> { self.entries.get_index(id.index()).map(|(_, s)| s) }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: SymbolId) -> Option<&mut Symbol> {
        self.entries.get_index_mut(id.index()).map(|(_, s)| s)
    }

    /// Lookup by name.
    pub fn find(&self, name: &str) -> Option<(SymbolId, &Symbol)> {
        self.entries.get_full(name).map(|(ix, _, s)| (SymbolId(ix as u32), s))
    }

    /// Name of a symbol, or `#id` when out of range.
    pub fn name_of(&self, id: SymbolId) -> String {
        self.get(id).map_or_else(|| id.to_string(), |s| s.name.clone())
    }

    /// Iterate as `(SymbolId, &Symbol)`.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> + '_ {
        self.entries.values().enumerate().map(|(ix, s)| (SymbolId(ix as u32), s))
    }

    /// Defined functions, in table order.
    pub fn functions(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> + '_ {
        self.iter().filter(|(_, s)| s.kind == SymbolKind::Function && s.is_defined())
    }

    /// Functions referenced but not defined here.
    pub fn imports(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> + '_ {
        self.iter().filter(|(_, s)| s.kind == SymbolKind::Function && !s.is_defined())
    }
}

/* ─────────────────────────── Errors ─────────────────────────── */

/// Errors returned while building, decoding or validating a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    /// A body was opened while another one was still open.
    Gathering {
        /// Body still open.
        open: String,
    },
    /// The unit ended with a body still open.
    Unterminated {
        /// Body still open.
        open: String,
    },
    /// Instruction emitted outside any body.
    OutsideBody,
    /// Close request without a matching open body.
    NothingToClose,
    /// Symbol defined twice, or with two kinds.
    Duplicate(String),
    /// Label used but never marked.
    UndefinedLabel(u32),
    /// Binary payload does not match the expected layout.
    Format(CoreError),
    /// CRC32 mismatch detected while decoding a payload.
    HashMismatch {
        /// CRC32 recomputed from the payload.
        expected: u32,
        /// CRC32 value read from the payload.
        found: u32,
    },
    /// Structural check failed.
    Invalid(String),
}

impl ModuleError {
    /// Pipeline stage that produced the error.
    pub const fn stage(&self) -> &'static str {
        match self {
            ModuleError::Gathering { .. } | ModuleError::Unterminated { .. } => "function gathering",
            ModuleError::OutsideBody | ModuleError::NothingToClose | ModuleError::Duplicate(_)
            | ModuleError::UndefinedLabel(_) => "assembly",
            ModuleError::Format(_) | ModuleError::HashMismatch { .. } => "decoding",
            ModuleError::Invalid(_) => "verification",
        }
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: ", self.stage())?;
        match self {
            ModuleError::Gathering { open } => write!(
                f,
                "another function opened before assembler reached .end after '{open}' function"
            ),
            ModuleError::Unterminated { open } => write!(f, "missing .end after '{open}' function"),
            ModuleError::OutsideBody => write!(f, "instruction outside of a function body"),
            ModuleError::NothingToClose => write!(f, ".end without an open function"),
            ModuleError::Duplicate(name) => write!(f, "duplicate symbol '{name}'"),
            ModuleError::UndefinedLabel(l) => write!(f, "label L{l} is never marked"),
            ModuleError::Format(e) => write!(f, "{e}"),
            ModuleError::HashMismatch { expected, found } => write!(
                f,
                "hash mismatch (crc32): expected=0x{expected:08X}, found=0x{found:08X}"
            ),
            ModuleError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ModuleError {}

impl From<CoreError> for ModuleError {
    fn from(e: CoreError) -> Self { ModuleError::Format(e) }
}

/* ─────────────────────────── Module ─────────────────────────── */

/// Bytecode module: instruction stream, symbol table and link metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    version: u16,
    /// Logical name (file stem for assembled units).
    pub name: String,
    /// Object, library or executable.
    pub kind: ModuleKind,
    /// Entry override (`.main:`), honored by the linker.
    pub main: Option<String>,
    /// Native modules to import at load time.
    pub natives: Vec<String>,
    /// Functions and blocks.
    pub symbols: SymbolTable,
    /// Entry function of an executable.
    pub entry: Option<SymbolId>,
    /// Linear instruction stream.
    pub ops: Vec<Op>,
}

impl Module {
    /// Create an empty module.
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            version: MODULE_VERSION,
            name: name.into(),
            kind,
            main: None,
            natives: Vec::new(),
            symbols: SymbolTable::new(),
            entry: None,
            ops: Vec::new(),
        }
    }

    /// Format version.
    pub const fn version(&self) -> u16 { self.version }

    /// Name of the entry function, if any.
    pub fn entry_name(&self) -> Option<String> { self.entry.map(|id| self.symbols.name_of(id)) }

    /// Start of a defined body.
    pub fn body_start(&self, id: SymbolId) -> Option<u32> {
        self.symbols.get(id).and_then(|s| s.body.as_ref()).map(|b| b.start)
    }

    /// Simple hash (crc32 + length) used by tooling for cache invalidation.
    pub fn compute_hash(&self) -> u64 {
        let bytes = self.to_bytes();
        (u64::from(crc32_ieee(&bytes)) << 32) | (bytes.len() as u64)
    }

    /// Encode the module to its binary payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(MODULE_MAGIC);
        w.write_u16_le(self.version);
        w.write_u8(self.kind.tag());
        w.write_u8(0);

        w.write_str(&self.name);
        match &self.main {
            Some(main) => {
                w.write_u8(1);
                w.write_str(main);
            }
            None => w.write_u8(0),
        }

        w.write_u32_le(self.natives.len() as u32);
        for n in &self.natives {
            w.write_str(n);
        }

        w.write_u32_le(self.symbols.len() as u32);
        for (_, sym) in self.symbols.iter() {
            w.write_str(&sym.name);
            w.write_u8(match sym.kind {
                SymbolKind::Function => 0,
                SymbolKind::Block => 1,
            });
            match &sym.body {
                Some(body) => {
                    w.write_u8(1);
                    w.write_u32_le(body.start);
                    w.write_u32_le(body.end);
                }
                None => w.write_u8(0),
            }
        }

        match self.entry {
            Some(id) => {
                w.write_u8(1);
                w.write_u32_le(id.0);
            }
            None => w.write_u8(0),
        }

        w.write_u32_le(self.ops.len() as u32);
        for op in &self.ops {
            op.encode(&mut w);
        }

        let crc = crc32_ieee(w.as_slice());
        w.write_u32_le(crc);
        w.into_vec()
    }

    /// Decode a module from [`Module::to_bytes`] output.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ModuleError> {
        if data.len() < MODULE_MAGIC.len() + 2 + 2 + 4 {
            return Err(CoreError::corrupted("too short").into());
        }

        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let found = ByteReader::new(crc_bytes).read_u32_le()?;
        let expected = crc32_ieee(payload);
        if expected != found {
            return Err(ModuleError::HashMismatch { expected, found });
        }

        let mut r = ByteReader::new(payload);
        if r.read_bytes(MODULE_MAGIC.len())? != MODULE_MAGIC {
            return Err(CoreError::InvalidMagic.into());
        }
        let version = r.read_u16_le()?;
        if version != MODULE_VERSION {
            return Err(CoreError::corrupted(format!("unsupported version {version}")).into());
        }
        let kind = match r.read_u8()? {
            0 => ModuleKind::Object,
            1 => ModuleKind::Library,
            2 => ModuleKind::Executable,
            _ => return Err(CoreError::corrupted("unknown module kind").into()),
        };
        let _reserved = r.read_u8()?;

        let mut module = Module::new(r.read_str()?, kind);
        module.version = version;
        module.main = match r.read_u8()? {
            0 => None,
            1 => Some(r.read_str()?),
            _ => return Err(CoreError::corrupted("invalid main flag").into()),
        };

        let native_count = r.read_u32_le()?;
        for _ in 0..native_count {
            module.natives.push(r.read_str()?);
        }

        let symbol_count = r.read_u32_le()?;
        for _ in 0..symbol_count {
            let name = r.read_str()?;
            let kind = match r.read_u8()? {
                0 => SymbolKind::Function,
                1 => SymbolKind::Block,
                _ => return Err(CoreError::corrupted("unknown symbol kind").into()),
            };
            let body = match r.read_u8()? {
                0 => None,
                1 => Some(r.read_u32_le()?..r.read_u32_le()?),
                _ => return Err(CoreError::corrupted("invalid body flag").into()),
            };
            let id = module.symbols.intern(&name, kind);
            if id.index() + 1 != module.symbols.len() {
                return Err(ModuleError::Duplicate(name));
            }
            if let Some(sym) = module.symbols.get_mut(id) {
                sym.body = body;
            }
        }

        module.entry = match r.read_u8()? {
            0 => None,
            1 => Some(SymbolId(r.read_u32_le()?)),
            _ => return Err(CoreError::corrupted("invalid entry flag").into()),
        };

        let op_count = r.read_u32_le()?;
        for _ in 0..op_count {
            module.ops.push(Op::decode(&mut r)?);
        }

        if r.remaining() != 0 {
            return Err(CoreError::corrupted("trailing bytes").into());
        }
        Ok(module)
    }
}
