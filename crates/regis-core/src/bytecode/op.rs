//! Instruction set: operands, opcodes and their binary encoding.
//!
//! Every register operand carries an `indirect` bit. When it is set the
//! effective register index is the Integer currently stored in register
//! `value` of the active register set.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{ByteReader, ByteWriter, CoreError, CoreResult};

/* ─────────────────────────── Operands ─────────────────────────── */

/// Register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Operand {
    /// Register index, or the register holding the index when `indirect`.
    pub value: u32,
    /// Read the effective index from register `value`.
    pub indirect: bool,
}

impl Operand {
    /// Direct register operand.
    pub const fn reg(value: u32) -> Self { Self { value, indirect: false } }
    /// Register-reference operand (`@N`).
    pub const fn at(value: u32) -> Self { Self { value, indirect: true } }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.indirect { write!(f, "@{}", self.value) } else { write!(f, "{}", self.value) }
    }
}

/// Index argument of vector instructions: an immediate or a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Index {
    /// Literal index; negative values count from the end.
    Const(i64),
    /// Index read from an Integer register.
    Reg(Operand),
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Const(i) => write!(f, "{i}"),
            Index::Reg(op) => write!(f, "%{op}"),
        }
    }
}

/// Register set selected by `ress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SetKind {
    /// Shared by the whole image.
    Global,
    /// Frame lifetime.
    #[default]
    Local,
    /// Per function, persists across calls.
    Static,
}

impl SetKind {
    /// Mnemonic used by `ress`.
    pub const fn name(self) -> &'static str {
        match self {
            SetKind::Global => "global",
            SetKind::Local => "local",
            SetKind::Static => "static",
        }
    }
}

/// Arithmetic operator shared by integer and float instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/` (truncating for integers)
    Div,
    /// `%` (integers only)
    Mod,
}

impl ArithOp {
    const ALL: [ArithOp; 5] = [ArithOp::Add, ArithOp::Sub, ArithOp::Mul, ArithOp::Div, ArithOp::Mod];

    /// Mnemonic suffix (`add`, `sub`...).
    pub const fn suffix(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Div => "div",
            ArithOp::Mod => "mod",
        }
    }
}

/// Comparison operator; always produces a Boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CmpOp {
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `==`
    Eq,
}

impl CmpOp {
    const ALL: [CmpOp; 5] = [CmpOp::Lt, CmpOp::Lte, CmpOp::Gt, CmpOp::Gte, CmpOp::Eq];

    /// Mnemonic suffix (`lt`, `lte`...).
    pub const fn suffix(self) -> &'static str {
        match self {
            CmpOp::Lt => "lt",
            CmpOp::Lte => "lte",
            CmpOp::Gt => "gt",
            CmpOp::Gte => "gte",
            CmpOp::Eq => "eq",
        }
    }

    /// Applies the comparison to any partially ordered pair.
    pub fn test<T: PartialOrd>(self, lhs: &T, rhs: &T) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Lte => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Gte => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
        }
    }
}

/// Index into a module's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SymbolId(pub u32);

impl SymbolId {
    /// Position in the table.
    pub const fn index(self) -> usize { self.0 as usize }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/* ─────────────────────────── Opcodes ─────────────────────────── */

/// One instruction. Binary operations are laid out `(lhs, rhs, dst)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Op {
    /// No operation.
    Nop,
    /// Stop the machine.
    Halt,
    /// Return from the current function.
    End,
    /// Absolute jump.
    Jump(u32),
    /// `branch cond, if_true, if_false` on the truthiness of `cond`.
    Branch(Operand, u32, u32),

    /// Store integer 0.
    IZero(Operand),
    /// Store an integer literal.
    IStore(Operand, i64),
    /// Integer arithmetic.
    IArith(ArithOp, Operand, Operand, Operand),
    /// Integer comparison.
    ICmp(CmpOp, Operand, Operand, Operand),
    /// Increment in place.
    IInc(Operand),
    /// Decrement in place.
    IDec(Operand),

    /// Store a float literal.
    FStore(Operand, f64),
    /// Float arithmetic (`Mod` is rejected by validation).
    FArith(ArithOp, Operand, Operand, Operand),
    /// Float comparison.
    FCmp(CmpOp, Operand, Operand, Operand),

    /// Store a byte literal.
    BStore(Operand, u8),

    /// Integer to float.
    IToF(Operand, Operand),
    /// Float to integer, truncating.
    FToI(Operand, Operand),
    /// Parse a decimal integer from a string.
    SToI(Operand, Operand),
    /// Parse a float from a string.
    SToF(Operand, Operand),

    /// Store a string literal.
    StrStore(Operand, String),
    /// String equality.
    StrEq(Operand, Operand, Operand),

    /// Store an empty vector.
    Vec(Operand),
    /// `vinsert vec, src, index`.
    VInsert(Operand, Operand, Index),
    /// `vpush vec, src`.
    VPush(Operand, Operand),
    /// `vpop vec, dst?, index`.
    VPop(Operand, Option<Operand>, Index),
    /// `vat vec, dst, index`.
    VAt(Operand, Operand, Index),
    /// `vlen vec, dst`.
    VLen(Operand, Operand),

    /// Replace with truthiness.
    Bool(Operand),
    /// Logical negation in place.
    Not(Operand),
    /// Logical and.
    And(Operand, Operand, Operand),
    /// Logical or.
    Or(Operand, Operand, Operand),

    /// `move src, dst`.
    Move(Operand, Operand),
    /// `copy src, dst`.
    Copy(Operand, Operand),
    /// `ref src, dst`: dst aliases src.
    Ref(Operand, Operand),
    /// Exchange two slots.
    Swap(Operand, Operand),
    /// Clear a slot.
    Free(Operand),
    /// `isnull src, dst`.
    IsNull(Operand, Operand),
    /// `empty src, dst`.
    Empty(Operand, Operand),
    /// Select the active register set.
    Ress(SetKind),
    /// Copy into the temporary register.
    TmpRi(Operand),
    /// Move the temporary register out.
    TmpRo(Operand),

    /// Print with a trailing newline.
    Print(Operand),
    /// Print without newline.
    Echo(Operand),

    /// `frame args, locals` (0 locals means the configured default).
    Frame(Operand, Operand),
    /// `param i, src` by value.
    Param(Operand, Operand),
    /// `paref i, src` by reference.
    ParRef(Operand, Operand),
    /// `arg i, dst`.
    Arg(Operand, Operand),
    /// Number of arguments of the current frame.
    ArgC(Operand),
    /// `call ret?, function`.
    Call(Option<Operand>, SymbolId),
    /// Store a function reference.
    Function(Operand, SymbolId),
    /// Mark a register for capture by the next `closure`.
    ClBind(Operand),
    /// Create a closure over the marked registers.
    Closure(Operand, SymbolId),
    /// `fcall callable, ret?`.
    FCall(Operand, Option<Operand>),

    /// Open a pending try frame.
    TryFrame,
    /// `catch type|*, block`.
    Catch(Option<String>, SymbolId),
    /// Enter a block under the pending try frame.
    Try(SymbolId),
    /// Move the caught payload out.
    Pull(Operand),
    /// Leave the current block.
    Leave,
    /// Throw the value of a register.
    Throw(Operand),
}

impl Op {
    /// True for instructions that may close a body.
    pub const fn is_terminator(&self) -> bool {
        matches!(self, Op::End | Op::Leave | Op::Halt | Op::Jump(_) | Op::Throw(_))
    }

    /// Absolute code targets carried by the instruction.
    pub fn targets(&self) -> Vec<u32> {
        match *self {
            Op::Jump(t) => vec![t],
            Op::Branch(_, t, f) => vec![t, f],
            _ => Vec::new(),
        }
    }

    /// Rewrites absolute code targets.
    pub fn map_targets(&mut self, f: impl Fn(u32) -> u32) {
        match self {
            Op::Jump(t) => *t = f(*t),
            Op::Branch(_, t, e) => {
                *t = f(*t);
                *e = f(*e);
            }
            _ => {}
        }
    }

    /// Symbol carried by the instruction, if any.
    pub const fn symbol(&self) -> Option<SymbolId> {
        match *self {
            Op::Call(_, s) | Op::Function(_, s) | Op::Closure(_, s) | Op::Catch(_, s) | Op::Try(s) => Some(s),
            _ => None,
        }
    }

    /// Rewrites the symbol carried by the instruction.
    pub fn map_symbol(&mut self, f: impl Fn(SymbolId) -> SymbolId) {
        match self {
            Op::Call(_, s) | Op::Function(_, s) | Op::Closure(_, s) | Op::Catch(_, s) | Op::Try(s) => *s = f(*s),
            _ => {}
        }
    }

    /// Mnemonic as written by the disassembler.
    pub fn mnemonic(&self) -> String {
        let fixed = match self {
            Op::Nop => "nop",
            Op::Halt => "halt",
            Op::End => "end",
            Op::Jump(_) => "jump",
            Op::Branch(..) => "branch",
            Op::IZero(_) => "izero",
            Op::IStore(..) => "istore",
            Op::IArith(a, ..) => return format!("i{}", a.suffix()),
            Op::ICmp(c, ..) => return format!("i{}", c.suffix()),
            Op::IInc(_) => "iinc",
            Op::IDec(_) => "idec",
            Op::FStore(..) => "fstore",
            Op::FArith(a, ..) => return format!("f{}", a.suffix()),
            Op::FCmp(c, ..) => return format!("f{}", c.suffix()),
            Op::BStore(..) => "bstore",
            Op::IToF(..) => "itof",
            Op::FToI(..) => "ftoi",
            Op::SToI(..) => "stoi",
            Op::SToF(..) => "stof",
            Op::StrStore(..) => "strstore",
            Op::StrEq(..) => "streq",
            Op::Vec(_) => "vec",
            Op::VInsert(..) => "vinsert",
            Op::VPush(..) => "vpush",
            Op::VPop(..) => "vpop",
            Op::VAt(..) => "vat",
            Op::VLen(..) => "vlen",
            Op::Bool(_) => "bool",
            Op::Not(_) => "not",
            Op::And(..) => "and",
            Op::Or(..) => "or",
            Op::Move(..) => "move",
            Op::Copy(..) => "copy",
            Op::Ref(..) => "ref",
            Op::Swap(..) => "swap",
            Op::Free(_) => "free",
            Op::IsNull(..) => "isnull",
            Op::Empty(..) => "empty",
            Op::Ress(_) => "ress",
            Op::TmpRi(_) => "tmpri",
            Op::TmpRo(_) => "tmpro",
            Op::Print(_) => "print",
            Op::Echo(_) => "echo",
            Op::Frame(..) => "frame",
            Op::Param(..) => "param",
            Op::ParRef(..) => "paref",
            Op::Arg(..) => "arg",
            Op::ArgC(_) => "argc",
            Op::Call(..) => "call",
            Op::Function(..) => "function",
            Op::ClBind(_) => "clbind",
            Op::Closure(..) => "closure",
            Op::FCall(..) => "fcall",
            Op::TryFrame => "tryframe",
            Op::Catch(..) => "catch",
            Op::Try(_) => "try",
            Op::Pull(_) => "pull",
            Op::Leave => "leave",
            Op::Throw(_) => "throw",
        };
        fixed.to_owned()
    }

    /// Operands rendered as text; `name` resolves symbol ids.
    pub fn render_operands(&self, name: &dyn Fn(SymbolId) -> String) -> String {
        let opt = |o: &Option<Operand>| o.map_or_else(|| "void".to_owned(), |o| o.to_string());
        match self {
            Op::Nop | Op::Halt | Op::End | Op::TryFrame | Op::Leave => String::new(),
            Op::Jump(t) => format!("{t}"),
            Op::Branch(c, t, f) => format!("{c} {t} {f}"),
            Op::IZero(r) | Op::IInc(r) | Op::IDec(r) | Op::Vec(r) | Op::Bool(r) | Op::Not(r) | Op::Free(r)
            | Op::TmpRi(r) | Op::TmpRo(r) | Op::Print(r) | Op::Echo(r) | Op::ArgC(r) | Op::ClBind(r)
            | Op::Pull(r) | Op::Throw(r) => format!("{r}"),
            Op::IStore(r, v) => format!("{r} {v}"),
            Op::FStore(r, v) => format!("{r} {v:?}"),
            Op::BStore(r, v) => format!("{r} {v}"),
            Op::StrStore(r, s) => format!("{r} {s:?}"),
            Op::IArith(_, a, b, d) | Op::ICmp(_, a, b, d) | Op::FArith(_, a, b, d) | Op::FCmp(_, a, b, d)
            | Op::StrEq(a, b, d) | Op::And(a, b, d) | Op::Or(a, b, d) => format!("{a} {b} {d}"),
            Op::IToF(a, b) | Op::FToI(a, b) | Op::SToI(a, b) | Op::SToF(a, b) | Op::VPush(a, b) | Op::VLen(a, b)
            | Op::Move(a, b) | Op::Copy(a, b) | Op::Ref(a, b) | Op::Swap(a, b) | Op::IsNull(a, b)
            | Op::Empty(a, b) | Op::Frame(a, b) | Op::Param(a, b) | Op::ParRef(a, b) | Op::Arg(a, b) => {
                format!("{a} {b}")
            }
            Op::VInsert(v, s, i) => format!("{v} {s} {i}"),
            Op::VPop(v, d, i) => format!("{v} {} {i}", opt(d)),
            Op::VAt(v, d, i) => format!("{v} {d} {i}"),
            Op::Ress(k) => k.name().to_owned(),
            Op::Call(r, s) => format!("{} {}", opt(r), name(*s)),
            Op::Function(r, s) | Op::Closure(r, s) => format!("{r} {}", name(*s)),
            Op::FCall(c, r) => format!("{c} {}", opt(r)),
            Op::Catch(t, s) => format!("{:?} {}", t.as_deref().unwrap_or("*"), name(*s)),
            Op::Try(s) => name(*s),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operands = self.render_operands(&|s: SymbolId| s.to_string());
        if operands.is_empty() { f.write_str(&self.mnemonic()) } else { write!(f, "{} {operands}", self.mnemonic()) }
    }
}

/* ─────────────────────────── Binary encoding ─────────────────────────── */

const OP_NOP: u8 = 0x00;
const OP_HALT: u8 = 0x01;
const OP_END: u8 = 0x02;
const OP_JUMP: u8 = 0x03;
const OP_BRANCH: u8 = 0x04;
const OP_IZERO: u8 = 0x10;
const OP_ISTORE: u8 = 0x11;
const OP_IARITH: u8 = 0x12;
const OP_ICMP: u8 = 0x13;
const OP_IINC: u8 = 0x14;
const OP_IDEC: u8 = 0x15;
const OP_FSTORE: u8 = 0x18;
const OP_FARITH: u8 = 0x19;
const OP_FCMP: u8 = 0x1A;
const OP_BSTORE: u8 = 0x1C;
const OP_ITOF: u8 = 0x20;
const OP_FTOI: u8 = 0x21;
const OP_STOI: u8 = 0x22;
const OP_STOF: u8 = 0x23;
const OP_STRSTORE: u8 = 0x28;
const OP_STREQ: u8 = 0x29;
const OP_VEC: u8 = 0x30;
const OP_VINSERT: u8 = 0x31;
const OP_VPUSH: u8 = 0x32;
const OP_VPOP: u8 = 0x33;
const OP_VAT: u8 = 0x34;
const OP_VLEN: u8 = 0x35;
const OP_BOOL: u8 = 0x38;
const OP_NOT: u8 = 0x39;
const OP_AND: u8 = 0x3A;
const OP_OR: u8 = 0x3B;
const OP_MOVE: u8 = 0x40;
const OP_COPY: u8 = 0x41;
const OP_REF: u8 = 0x42;
const OP_SWAP: u8 = 0x43;
const OP_FREE: u8 = 0x44;
const OP_ISNULL: u8 = 0x45;
const OP_EMPTY: u8 = 0x46;
const OP_RESS: u8 = 0x47;
const OP_TMPRI: u8 = 0x48;
const OP_TMPRO: u8 = 0x49;
const OP_PRINT: u8 = 0x50;
const OP_ECHO: u8 = 0x51;
const OP_FRAME: u8 = 0x60;
const OP_PARAM: u8 = 0x61;
const OP_PAREF: u8 = 0x62;
const OP_ARG: u8 = 0x63;
const OP_ARGC: u8 = 0x64;
const OP_CALL: u8 = 0x65;
const OP_FUNCTION: u8 = 0x66;
const OP_CLBIND: u8 = 0x67;
const OP_CLOSURE: u8 = 0x68;
const OP_FCALL: u8 = 0x69;
const OP_TRYFRAME: u8 = 0x70;
const OP_CATCH: u8 = 0x71;
const OP_TRY: u8 = 0x72;
const OP_PULL: u8 = 0x73;
const OP_LEAVE: u8 = 0x74;
const OP_THROW: u8 = 0x75;

fn put_operand(w: &mut ByteWriter, op: Operand) {
    w.write_u8(u8::from(op.indirect));
    w.write_u32_le(op.value);
}

fn put_opt(w: &mut ByteWriter, op: Option<Operand>) {
    match op {
        Some(op) => {
            w.write_u8(1);
            put_operand(w, op);
        }
        None => w.write_u8(0),
    }
}

fn put_index(w: &mut ByteWriter, ix: Index) {
    match ix {
        Index::Const(i) => {
            w.write_u8(0);
            w.write_i64_le(i);
        }
        Index::Reg(op) => {
            w.write_u8(1);
            put_operand(w, op);
        }
    }
}

fn put3(w: &mut ByteWriter, a: Operand, b: Operand, c: Operand) {
    put_operand(w, a);
    put_operand(w, b);
    put_operand(w, c);
}

fn put2(w: &mut ByteWriter, a: Operand, b: Operand) {
    put_operand(w, a);
    put_operand(w, b);
}

fn get_flag(r: &mut ByteReader<'_>, what: &'static str) -> CoreResult<bool> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(CoreError::corrupted(what)),
    }
}

fn get_operand(r: &mut ByteReader<'_>) -> CoreResult<Operand> {
    let indirect = get_flag(r, "invalid operand flag")?;
    Ok(Operand { value: r.read_u32_le()?, indirect })
}

fn get_opt(r: &mut ByteReader<'_>) -> CoreResult<Option<Operand>> {
    if get_flag(r, "invalid optional operand flag")? { Ok(Some(get_operand(r)?)) } else { Ok(None) }
}

fn get_index(r: &mut ByteReader<'_>) -> CoreResult<Index> {
    if get_flag(r, "invalid index flag")? { Ok(Index::Reg(get_operand(r)?)) } else { Ok(Index::Const(r.read_i64_le()?)) }
}

fn get_sym(r: &mut ByteReader<'_>) -> CoreResult<SymbolId> { Ok(SymbolId(r.read_u32_le()?)) }

fn get_arith(r: &mut ByteReader<'_>) -> CoreResult<ArithOp> {
    ArithOp::ALL.get(r.read_u8()? as usize).copied().ok_or_else(|| CoreError::corrupted("unknown arith operator"))
}

fn get_cmp(r: &mut ByteReader<'_>) -> CoreResult<CmpOp> {
    CmpOp::ALL.get(r.read_u8()? as usize).copied().ok_or_else(|| CoreError::corrupted("unknown comparison operator"))
}

impl Op {
    /// Appends the binary form of the instruction.
    pub fn encode(&self, w: &mut ByteWriter) {
        match self {
            Op::Nop => w.write_u8(OP_NOP),
            Op::Halt => w.write_u8(OP_HALT),
            Op::End => w.write_u8(OP_END),
            Op::Jump(t) => {
                w.write_u8(OP_JUMP);
                w.write_u32_le(*t);
            }
            Op::Branch(c, t, f) => {
                w.write_u8(OP_BRANCH);
                put_operand(w, *c);
                w.write_u32_le(*t);
                w.write_u32_le(*f);
            }
            Op::IZero(r) => { w.write_u8(OP_IZERO); put_operand(w, *r); }
            Op::IStore(r, v) => {
                w.write_u8(OP_ISTORE);
                put_operand(w, *r);
                w.write_i64_le(*v);
            }
            Op::IArith(a, l, r, d) => {
                w.write_u8(OP_IARITH);
                w.write_u8(*a as u8);
                put3(w, *l, *r, *d);
            }
            Op::ICmp(c, l, r, d) => {
                w.write_u8(OP_ICMP);
                w.write_u8(*c as u8);
                put3(w, *l, *r, *d);
            }
            Op::IInc(r) => { w.write_u8(OP_IINC); put_operand(w, *r); }
            Op::IDec(r) => { w.write_u8(OP_IDEC); put_operand(w, *r); }
            Op::FStore(r, v) => {
                w.write_u8(OP_FSTORE);
                put_operand(w, *r);
                w.write_f64_le(*v);
            }
            Op::FArith(a, l, r, d) => {
                w.write_u8(OP_FARITH);
                w.write_u8(*a as u8);
                put3(w, *l, *r, *d);
            }
            Op::FCmp(c, l, r, d) => {
                w.write_u8(OP_FCMP);
                w.write_u8(*c as u8);
                put3(w, *l, *r, *d);
            }
            Op::BStore(r, b) => {
                w.write_u8(OP_BSTORE);
                put_operand(w, *r);
                w.write_u8(*b);
            }
            Op::IToF(a, b) => { w.write_u8(OP_ITOF); put2(w, *a, *b); }
            Op::FToI(a, b) => { w.write_u8(OP_FTOI); put2(w, *a, *b); }
            Op::SToI(a, b) => { w.write_u8(OP_STOI); put2(w, *a, *b); }
            Op::SToF(a, b) => { w.write_u8(OP_STOF); put2(w, *a, *b); }
            Op::StrStore(r, s) => {
                w.write_u8(OP_STRSTORE);
                put_operand(w, *r);
                w.write_str(s);
            }
            Op::StrEq(a, b, d) => { w.write_u8(OP_STREQ); put3(w, *a, *b, *d); }
            Op::Vec(r) => { w.write_u8(OP_VEC); put_operand(w, *r); }
            Op::VInsert(v, s, i) => {
                w.write_u8(OP_VINSERT);
                put2(w, *v, *s);
                put_index(w, *i);
            }
            Op::VPush(v, s) => { w.write_u8(OP_VPUSH); put2(w, *v, *s); }
            Op::VPop(v, d, i) => {
                w.write_u8(OP_VPOP);
                put_operand(w, *v);
                put_opt(w, *d);
                put_index(w, *i);
            }
            Op::VAt(v, d, i) => {
                w.write_u8(OP_VAT);
                put2(w, *v, *d);
                put_index(w, *i);
            }
            Op::VLen(v, d) => { w.write_u8(OP_VLEN); put2(w, *v, *d); }
            Op::Bool(r) => { w.write_u8(OP_BOOL); put_operand(w, *r); }
            Op::Not(r) => { w.write_u8(OP_NOT); put_operand(w, *r); }
            Op::And(a, b, d) => { w.write_u8(OP_AND); put3(w, *a, *b, *d); }
            Op::Or(a, b, d) => { w.write_u8(OP_OR); put3(w, *a, *b, *d); }
            Op::Move(a, b) => { w.write_u8(OP_MOVE); put2(w, *a, *b); }
            Op::Copy(a, b) => { w.write_u8(OP_COPY); put2(w, *a, *b); }
            Op::Ref(a, b) => { w.write_u8(OP_REF); put2(w, *a, *b); }
            Op::Swap(a, b) => { w.write_u8(OP_SWAP); put2(w, *a, *b); }
            Op::Free(r) => { w.write_u8(OP_FREE); put_operand(w, *r); }
            Op::IsNull(a, b) => { w.write_u8(OP_ISNULL); put2(w, *a, *b); }
            Op::Empty(a, b) => { w.write_u8(OP_EMPTY); put2(w, *a, *b); }
            Op::Ress(k) => {
                w.write_u8(OP_RESS);
                w.write_u8(match k {
                    SetKind::Global => 0,
                    SetKind::Local => 1,
                    SetKind::Static => 2,
                });
            }
            Op::TmpRi(r) => { w.write_u8(OP_TMPRI); put_operand(w, *r); }
            Op::TmpRo(r) => { w.write_u8(OP_TMPRO); put_operand(w, *r); }
            Op::Print(r) => { w.write_u8(OP_PRINT); put_operand(w, *r); }
            Op::Echo(r) => { w.write_u8(OP_ECHO); put_operand(w, *r); }
            Op::Frame(a, b) => { w.write_u8(OP_FRAME); put2(w, *a, *b); }
            Op::Param(a, b) => { w.write_u8(OP_PARAM); put2(w, *a, *b); }
            Op::ParRef(a, b) => { w.write_u8(OP_PAREF); put2(w, *a, *b); }
            Op::Arg(a, b) => { w.write_u8(OP_ARG); put2(w, *a, *b); }
            Op::ArgC(r) => { w.write_u8(OP_ARGC); put_operand(w, *r); }
            Op::Call(r, s) => {
                w.write_u8(OP_CALL);
                put_opt(w, *r);
                w.write_u32_le(s.0);
            }
            Op::Function(r, s) => {
                w.write_u8(OP_FUNCTION);
                put_operand(w, *r);
                w.write_u32_le(s.0);
            }
            Op::ClBind(r) => { w.write_u8(OP_CLBIND); put_operand(w, *r); }
            Op::Closure(r, s) => {
                w.write_u8(OP_CLOSURE);
                put_operand(w, *r);
                w.write_u32_le(s.0);
            }
            Op::FCall(c, r) => {
                w.write_u8(OP_FCALL);
                put_operand(w, *c);
                put_opt(w, *r);
            }
            Op::TryFrame => w.write_u8(OP_TRYFRAME),
            Op::Catch(t, s) => {
                w.write_u8(OP_CATCH);
                match t {
                    Some(t) => {
                        w.write_u8(1);
                        w.write_str(t);
                    }
                    None => w.write_u8(0),
                }
                w.write_u32_le(s.0);
            }
            Op::Try(s) => {
                w.write_u8(OP_TRY);
                w.write_u32_le(s.0);
            }
            Op::Pull(r) => { w.write_u8(OP_PULL); put_operand(w, *r); }
            Op::Leave => w.write_u8(OP_LEAVE),
            Op::Throw(r) => { w.write_u8(OP_THROW); put_operand(w, *r); }
        }
    }

    /// Reads one instruction produced by [`Op::encode`].
    pub fn decode(r: &mut ByteReader<'_>) -> CoreResult<Self> {
        let tag = r.read_u8()?;
        let op = match tag {
            OP_NOP => Op::Nop,
            OP_HALT => Op::Halt,
            OP_END => Op::End,
            OP_JUMP => Op::Jump(r.read_u32_le()?),
            OP_BRANCH => Op::Branch(get_operand(r)?, r.read_u32_le()?, r.read_u32_le()?),
            OP_IZERO => Op::IZero(get_operand(r)?),
            OP_ISTORE => Op::IStore(get_operand(r)?, r.read_i64_le()?),
            OP_IARITH => Op::IArith(get_arith(r)?, get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_ICMP => Op::ICmp(get_cmp(r)?, get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_IINC => Op::IInc(get_operand(r)?),
            OP_IDEC => Op::IDec(get_operand(r)?),
            OP_FSTORE => Op::FStore(get_operand(r)?, r.read_f64_le()?),
            OP_FARITH => Op::FArith(get_arith(r)?, get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_FCMP => Op::FCmp(get_cmp(r)?, get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_BSTORE => Op::BStore(get_operand(r)?, r.read_u8()?),
            OP_ITOF => Op::IToF(get_operand(r)?, get_operand(r)?),
            OP_FTOI => Op::FToI(get_operand(r)?, get_operand(r)?),
            OP_STOI => Op::SToI(get_operand(r)?, get_operand(r)?),
            OP_STOF => Op::SToF(get_operand(r)?, get_operand(r)?),
            OP_STRSTORE => Op::StrStore(get_operand(r)?, r.read_str()?),
            OP_STREQ => Op::StrEq(get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_VEC => Op::Vec(get_operand(r)?),
            OP_VINSERT => Op::VInsert(get_operand(r)?, get_operand(r)?, get_index(r)?),
            OP_VPUSH => Op::VPush(get_operand(r)?, get_operand(r)?),
            OP_VPOP => Op::VPop(get_operand(r)?, get_opt(r)?, get_index(r)?),
            OP_VAT => Op::VAt(get_operand(r)?, get_operand(r)?, get_index(r)?),
            OP_VLEN => Op::VLen(get_operand(r)?, get_operand(r)?),
            OP_BOOL => Op::Bool(get_operand(r)?),
            OP_NOT => Op::Not(get_operand(r)?),
            OP_AND => Op::And(get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_OR => Op::Or(get_operand(r)?, get_operand(r)?, get_operand(r)?),
            OP_MOVE => Op::Move(get_operand(r)?, get_operand(r)?),
            OP_COPY => Op::Copy(get_operand(r)?, get_operand(r)?),
            OP_REF => Op::Ref(get_operand(r)?, get_operand(r)?),
            OP_SWAP => Op::Swap(get_operand(r)?, get_operand(r)?),
            OP_FREE => Op::Free(get_operand(r)?),
            OP_ISNULL => Op::IsNull(get_operand(r)?, get_operand(r)?),
            OP_EMPTY => Op::Empty(get_operand(r)?, get_operand(r)?),
            OP_RESS => Op::Ress(match r.read_u8()? {
                0 => SetKind::Global,
                1 => SetKind::Local,
                2 => SetKind::Static,
                _ => return Err(CoreError::corrupted("unknown register set")),
            }),
            OP_TMPRI => Op::TmpRi(get_operand(r)?),
            OP_TMPRO => Op::TmpRo(get_operand(r)?),
            OP_PRINT => Op::Print(get_operand(r)?),
            OP_ECHO => Op::Echo(get_operand(r)?),
            OP_FRAME => Op::Frame(get_operand(r)?, get_operand(r)?),
            OP_PARAM => Op::Param(get_operand(r)?, get_operand(r)?),
            OP_PAREF => Op::ParRef(get_operand(r)?, get_operand(r)?),
            OP_ARG => Op::Arg(get_operand(r)?, get_operand(r)?),
            OP_ARGC => Op::ArgC(get_operand(r)?),
            OP_CALL => Op::Call(get_opt(r)?, get_sym(r)?),
            OP_FUNCTION => Op::Function(get_operand(r)?, get_sym(r)?),
            OP_CLBIND => Op::ClBind(get_operand(r)?),
            OP_CLOSURE => Op::Closure(get_operand(r)?, get_sym(r)?),
            OP_FCALL => Op::FCall(get_operand(r)?, get_opt(r)?),
            OP_TRYFRAME => Op::TryFrame,
            OP_CATCH => {
                let ty = if get_flag(r, "invalid catch flag")? { Some(r.read_str()?) } else { None };
                Op::Catch(ty, get_sym(r)?)
            }
            OP_TRY => Op::Try(get_sym(r)?),
            OP_PULL => Op::Pull(get_operand(r)?),
            OP_LEAVE => Op::Leave,
            OP_THROW => Op::Throw(get_operand(r)?),
            other => return Err(CoreError::corrupted(format!("unknown op tag 0x{other:02X}"))),
        };
        Ok(op)
    }
}
