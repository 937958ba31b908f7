//! Structural validation reused by the linker, the loader and tooling.

use super::module::{Module, ModuleError, ModuleKind, SymbolKind};
use super::op::{ArithOp, Op};

/// Structural validation of a module.
///
/// Checks that bodies are in range, disjoint and terminated, that jump
/// targets stay inside the code, and that every symbol operand names a
/// symbol of the right kind. Executables must have an entry function and
/// no unresolved import other than native-qualified ones.
pub fn validate_module(module: &Module) -> Result<(), ModuleError> {
    let len = module.ops.len() as u32;
    let invalid = |msg: String| Err(ModuleError::Invalid(msg));

    let mut bodies: Vec<(u32, u32, &str)> = Vec::new();
    for (_, sym) in module.symbols.iter() {
        let Some(body) = &sym.body else { continue };
        if body.start >= body.end || body.end > len {
            return invalid(format!("body of '{}' ({}..{}) is out of range", sym.name, body.start, body.end));
        }
        if !module.ops[body.end as usize - 1].is_terminator() {
            return invalid(format!("body of '{}' does not end with a terminator", sym.name));
        }
        bodies.push((body.start, body.end, sym.name.as_str()));
    }
    bodies.sort_unstable();
    for pair in bodies.windows(2) {
        if pair[1].0 < pair[0].1 {
            return invalid(format!("bodies of '{}' and '{}' overlap", pair[0].2, pair[1].2));
        }
    }

    for (pc, op) in module.ops.iter().enumerate() {
        for t in op.targets() {
            if t >= len {
                return invalid(format!("op {pc} jumps to {t} but code size is {len}"));
            }
        }
        if let Op::FArith(ArithOp::Mod, ..) = op {
            return invalid(format!("op {pc}: modulo is not defined for floats"));
        }
        if let Some(id) = op.symbol() {
            let Some(sym) = module.symbols.get(id) else {
                return invalid(format!("op {pc} references symbol {id} but table size is {}", module.symbols.len()));
            };
            let expected = match op {
                Op::Try(_) | Op::Catch(..) => SymbolKind::Block,
                _ => SymbolKind::Function,
            };
            if sym.kind != expected {
                return match expected {
                    SymbolKind::Block => invalid(format!("cannot enter undefined block '{}'", sym.name)),
                    SymbolKind::Function => invalid(format!("'{}' is a block, not a function", sym.name)),
                };
            }
            if expected == SymbolKind::Block && !sym.is_defined() {
                return invalid(format!("cannot enter undefined block '{}'", sym.name));
            }
        }
    }

    if module.kind == ModuleKind::Executable {
        let Some(entry) = module.entry else {
            return invalid("executable has no entry function".to_owned());
        };
        match module.symbols.get(entry) {
            Some(s) if s.kind == SymbolKind::Function && s.is_defined() => {}
            _ => return invalid(format!("main function is undefined: {}", module.symbols.name_of(entry))),
        }
        for (_, sym) in module.symbols.imports() {
            let native = sym.native_parts().is_some_and(|(m, _)| module.natives.iter().any(|n| n == m));
            if !native {
                return invalid(format!("call to undefined function '{}'", sym.name));
            }
        }
    }

    Ok(())
}
