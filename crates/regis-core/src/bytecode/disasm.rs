//! Minimal textual disassembly helpers used by the CLI tooling.

use std::fmt::Write;

use super::module::{Module, SymbolKind};

/// Produce a multi-line, human readable disassembly with metadata.
pub fn disassemble_full(module: &Module, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "== {title} == (version={}, kind={}, symbols={}, ops={})",
        module.version(),
        module.kind,
        module.symbols.len(),
        module.ops.len()
    );
    if let Some(main) = &module.main {
        let _ = writeln!(out, ";; main override: {main}");
    }
    if let Some(entry) = module.entry_name() {
        let _ = writeln!(out, ";; entry: {entry}");
    }
    if !module.natives.is_empty() {
        let _ = writeln!(out, ";; natives: {}", module.natives.join(", "));
    }
    let imports: Vec<&str> = module.symbols.imports().map(|(_, s)| s.name.as_str()).collect();
    if !imports.is_empty() {
        let _ = writeln!(out, ";; imports: {}", imports.join(", "));
    }

    let name = |id| module.symbols.name_of(id);
    for (pc, op) in module.ops.iter().enumerate() {
        for (_, sym) in module.symbols.iter() {
            if sym.body.as_ref().is_some_and(|b| b.start as usize == pc) {
                let directive = match sym.kind {
                    SymbolKind::Function => ".function",
                    SymbolKind::Block => ".block",
                };
                let _ = writeln!(out);
                let _ = writeln!(out, "{directive}: {}", sym.name);
            }
        }
        let operands = op.render_operands(&name);
        let line = format!("{pc:04} | {:<9} {operands}", op.mnemonic());
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

/// One-line-per-op variant used by quick CLI previews.
pub fn disassemble_compact(module: &Module) -> String {
    let mut out = String::new();
    let name = |id| module.symbols.name_of(id);
    for (pc, op) in module.ops.iter().enumerate() {
        let operands = op.render_operands(&name);
        let line = format!("{pc:04}: {} {operands}", op.mnemonic());
        let _ = writeln!(out, "{}", line.trim_end());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ModuleBuilder, ModuleKind, Op, Operand};

    #[test]
    fn full_listing_snapshot() {
        let mut b = ModuleBuilder::new("hello", ModuleKind::Object);
        b.native("math");
        b.function("main").unwrap();
        b.emit(Op::StrStore(Operand::reg(1), "Hello World!".into())).unwrap();
        b.emit(Op::Print(Operand::reg(1))).unwrap();
        b.emit(Op::Frame(Operand::reg(1), Operand::reg(0))).unwrap();
        b.call(Some(Operand::at(2)), "math.sqrt").unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();
        let m = b.build().unwrap();

        insta::assert_snapshot!(disassemble_full(&m, "hello"), @r###"
        == hello == (version=1, kind=object, symbols=2, ops=5)
        ;; natives: math
        ;; imports: math.sqrt

        .function: main
        0000 | strstore  1 "Hello World!"
        0001 | print     1
        0002 | frame     1 0
        0003 | call      @2 math.sqrt
        0004 | end
        "###);
    }

    #[test]
    fn compact_listing_names_symbols() {
        let mut b = ModuleBuilder::new("c", ModuleKind::Object);
        b.function("main").unwrap();
        b.emit(Op::Frame(Operand::reg(0), Operand::reg(0))).unwrap();
        b.call(None, "helper").unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();
        let text = disassemble_compact(&b.build().unwrap());
        assert!(text.contains("0001: call void helper"));
    }
}
