//! Programmatic assembler used in place of a textual front end.
//!
//! ```
//! use regis_core::bytecode::{ModuleBuilder, ModuleKind, Op, Operand};
//!
//! let mut b = ModuleBuilder::new("hello", ModuleKind::Object);
//! b.function("main").unwrap();
//! b.emit(Op::StrStore(Operand::reg(1), "Hello World!".into())).unwrap();
//! b.emit(Op::Print(Operand::reg(1))).unwrap();
//! b.emit(Op::End).unwrap();
//! b.end().unwrap();
//! let module = b.build().unwrap();
//! assert_eq!(module.ops.len(), 3);
//! ```
//!
//! Jumps are written against labels and resolved to absolute instruction
//! indices by [`ModuleBuilder::build`].

use super::module::{Module, ModuleError, ModuleKind, SymbolKind};
use super::op::{Op, Operand, SymbolId};

/// Forward-declarable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

#[derive(Debug)]
struct OpenBody {
    id: SymbolId,
    name: String,
    start: u32,
}

/// Incremental module builder with label resolution.
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
    open: Option<OpenBody>,
    labels: Vec<Option<u32>>,
    /// `(pc, label slots)` patched at build time: up to two targets per op.
    fixups: Vec<(usize, [Option<Label>; 2])>,
}

impl ModuleBuilder {
    /// New builder for a module named `name`.
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self { module: Module::new(name, kind), open: None, labels: Vec::new(), fixups: Vec::new() }
    }

    /// Current instruction index.
    pub fn pc(&self) -> u32 { self.module.ops.len() as u32 }

    /// Entry override (`.main:`).
    pub fn main(&mut self, name: &str) -> &mut Self {
        self.module.main = Some(name.to_owned());
        self
    }

    /// Declare a native module import.
    pub fn native(&mut self, module: &str) -> &mut Self {
        if !self.module.natives.iter().any(|n| n == module) {
            self.module.natives.push(module.to_owned());
        }
        self
    }

    /// Open a function body.
    pub fn function(&mut self, name: &str) -> Result<SymbolId, ModuleError> { self.open_body(name, SymbolKind::Function) }

    /// Open a block body.
    pub fn block(&mut self, name: &str) -> Result<SymbolId, ModuleError> { self.open_body(name, SymbolKind::Block) }

    fn open_body(&mut self, name: &str, kind: SymbolKind) -> Result<SymbolId, ModuleError> {
        if let Some(open) = &self.open {
            return Err(ModuleError::Gathering { open: open.name.clone() });
        }
        let id = self.symbol(name, kind)?;
        if self.module.symbols.get(id).is_some_and(|s| s.is_defined()) {
            return Err(ModuleError::Duplicate(name.to_owned()));
        }
        self.open = Some(OpenBody { id, name: name.to_owned(), start: self.pc() });
        Ok(id)
    }

    /// Close the open body (`.end`).
    pub fn end(&mut self) -> Result<(), ModuleError> {
        let open = self.open.take().ok_or(ModuleError::NothingToClose)?;
        let end = self.pc();
        if let Some(sym) = self.module.symbols.get_mut(open.id) {
            sym.body = Some(open.start..end);
        }
        Ok(())
    }

    /// Interned symbol id; kinds must agree across uses.
    pub fn symbol(&mut self, name: &str, kind: SymbolKind) -> Result<SymbolId, ModuleError> {
        let id = self.module.symbols.intern(name, kind);
        match self.module.symbols.get(id) {
            Some(sym) if sym.kind != kind => Err(ModuleError::Duplicate(name.to_owned())),
            _ => Ok(id),
        }
    }

    /// Append an instruction to the open body.
    pub fn emit(&mut self, op: Op) -> Result<&mut Self, ModuleError> {
        if self.open.is_none() {
            return Err(ModuleError::OutsideBody);
        }
        self.module.ops.push(op);
        Ok(self)
    }

    /// Fresh, unmarked label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn mark(&mut self, label: Label) -> &mut Self {
        let pc = self.pc();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(pc);
        }
        self
    }

    /// Label already bound to the next instruction.
    pub fn here(&mut self) -> Label {
        let l = self.label();
        self.mark(l);
        l
    }

    /// `jump label`.
    pub fn jump(&mut self, target: Label) -> Result<&mut Self, ModuleError> {
        let pc = self.module.ops.len();
        self.emit(Op::Jump(0))?;
        self.fixups.push((pc, [Some(target), None]));
        Ok(self)
    }

    /// `branch cond, if_true, if_false`.
    pub fn branch(&mut self, cond: Operand, if_true: Label, if_false: Label) -> Result<&mut Self, ModuleError> {
        let pc = self.module.ops.len();
        self.emit(Op::Branch(cond, 0, 0))?;
        self.fixups.push((pc, [Some(if_true), Some(if_false)]));
        Ok(self)
    }

    /// `call ret?, name`.
    pub fn call(&mut self, ret: Option<Operand>, name: &str) -> Result<&mut Self, ModuleError> {
        let id = self.symbol(name, SymbolKind::Function)?;
        self.emit(Op::Call(ret, id))
    }

    /// `function dst, name`.
    pub fn function_ref(&mut self, dst: Operand, name: &str) -> Result<&mut Self, ModuleError> {
        let id = self.symbol(name, SymbolKind::Function)?;
        self.emit(Op::Function(dst, id))
    }

    /// `closure dst, name`.
    pub fn closure(&mut self, dst: Operand, name: &str) -> Result<&mut Self, ModuleError> {
        let id = self.symbol(name, SymbolKind::Function)?;
        self.emit(Op::Closure(dst, id))
    }

    /// `catch type, block`; `None` catches everything.
    pub fn catch(&mut self, ty: Option<&str>, block: &str) -> Result<&mut Self, ModuleError> {
        let id = self.symbol(block, SymbolKind::Block)?;
        self.emit(Op::Catch(ty.map(str::to_owned), id))
    }

    /// `try block`.
    pub fn enter(&mut self, block: &str) -> Result<&mut Self, ModuleError> {
        let id = self.symbol(block, SymbolKind::Block)?;
        self.emit(Op::Try(id))
    }

    /// Finish the module, resolving labels.
    pub fn build(mut self) -> Result<Module, ModuleError> {
        if let Some(open) = self.open.take() {
            return Err(ModuleError::Unterminated { open: open.name });
        }
        for (pc, slots) in std::mem::take(&mut self.fixups) {
            let mut resolved = [0u32; 2];
            for (i, slot) in slots.iter().enumerate() {
                if let Some(l) = slot {
                    resolved[i] = self.labels.get(l.0 as usize).copied().flatten().ok_or(ModuleError::UndefinedLabel(l.0))?;
                }
            }
            match self.module.ops.get_mut(pc) {
                Some(Op::Jump(t)) => *t = resolved[0],
                Some(Op::Branch(_, t, f)) => {
                    *t = resolved[0];
                    *f = resolved[1];
                }
                _ => {}
            }
        }
        Ok(self.module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn labels_resolve_forward_and_backward() {
        let mut b = ModuleBuilder::new("loop", ModuleKind::Object);
        b.function("main").unwrap();
        let top = b.here();
        let out = b.label();
        b.branch(Operand::reg(1), out, top).unwrap();
        b.jump(top).unwrap();
        b.mark(out);
        b.emit(Op::End).unwrap();
        b.end().unwrap();
        let m = b.build().unwrap();
        assert_eq!(m.ops, vec![Op::Branch(Operand::reg(1), 2, 0), Op::Jump(0), Op::End]);
        assert_eq!(m.symbols.find("main").and_then(|(_, s)| s.body.clone()), Some(0..3));
    }

    #[test]
    fn nested_function_fails_gathering() {
        let mut b = ModuleBuilder::new("bad", ModuleKind::Object);
        b.function("foo").unwrap();
        let err = b.function("main").unwrap_err();
        assert_eq!(err, ModuleError::Gathering { open: "foo".into() });
        assert!(err.to_string().contains("after 'foo' function"));
    }

    #[test]
    fn unterminated_unit_and_stray_ops() {
        let mut b = ModuleBuilder::new("bad", ModuleKind::Object);
        assert_eq!(b.emit(Op::Nop).err(), Some(ModuleError::OutsideBody));
        b.function("foo").unwrap();
        assert_eq!(b.build().unwrap_err(), ModuleError::Unterminated { open: "foo".into() });
    }

    #[test]
    fn kind_conflict_is_duplicate() {
        let mut b = ModuleBuilder::new("k", ModuleKind::Object);
        b.function("main").unwrap();
        b.call(None, "handler").unwrap();
        assert_eq!(b.enter("handler").err(), Some(ModuleError::Duplicate("handler".into())));
    }

    #[test]
    fn unmarked_label_is_reported() {
        let mut b = ModuleBuilder::new("l", ModuleKind::Object);
        b.function("main").unwrap();
        let nowhere = b.label();
        b.jump(nowhere).unwrap();
        b.end().unwrap();
        assert_eq!(b.build().unwrap_err(), ModuleError::UndefinedLabel(0));
    }
}
