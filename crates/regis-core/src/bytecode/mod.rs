//! Bytecode primitives: instruction set, module container, builder,
//! structural validation and disassembly.

/// Operands, opcodes and their binary encoding.
pub mod op;
/// Module container and symbol table.
pub mod module;
/// Programmatic assembler with label resolution.
pub mod builder;
/// Structural validation.
pub mod helpers;
/// Text listings.
pub mod disasm;

pub use builder::{Label, ModuleBuilder};
pub use module::{Module, ModuleError, ModuleKind, Symbol, SymbolKind, SymbolTable};
pub use op::{ArithOp, CmpOp, Index, Op, Operand, SetKind, SymbolId};
