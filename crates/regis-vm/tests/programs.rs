//! Programmes complets : construction avec `ModuleBuilder`, lien, exécution
//! sur une sortie capturée.

use camino::Utf8PathBuf;
use pretty_assertions::assert_eq;

use regis_core::bytecode::{ArithOp, CmpOp, Index, Module, ModuleBuilder, ModuleKind, Op, Operand, SetKind};
use regis_runtime::Runtime;
use regis_tools::{link_modules, LinkOptions};
use regis_vm::{run, Halt, VmConfig, VmError};

const fn r(n: u32) -> Operand { Operand::reg(n) }

fn unit(name: &str, kind: ModuleKind, build: impl FnOnce(&mut ModuleBuilder)) -> (Utf8PathBuf, Module) {
    let mut b = ModuleBuilder::new(name, kind);
    build(&mut b);
    (Utf8PathBuf::from(format!("{name}.{}", kind.extension())), b.build().unwrap())
}

fn link(units: &[(Utf8PathBuf, Module)]) -> Module { link_modules(units, LinkOptions::default()).unwrap().0 }

fn exec_with(module: Module, config: &VmConfig, argv: &[&str]) -> (Halt, Vec<String>) {
    let (rt, out) = Runtime::with_captured_stdout();
    let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
    let halt = run(module, rt, config, &argv).unwrap();
    (halt, out.lines())
}

/// Exécute `main` (corps fourni, `end` ajouté) ; renvoie les lignes imprimées.
fn main_prints(body: impl FnOnce(&mut ModuleBuilder)) -> Vec<String> {
    let module = link(&[unit("prog", ModuleKind::Object, |b| {
        b.function("main").unwrap();
        body(b);
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    })]);
    let (halt, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(halt.exit_code(), 0, "unexpected halt: {halt:?}");
    lines
}

/// Exécute un programme qui doit échouer ; renvoie le message de l'exception.
fn uncaught(units: &[(Utf8PathBuf, Module)], config: &VmConfig) -> regis_vm::Uncaught {
    match exec_with(link(units), config, &[]).0 {
        Halt::Uncaught(u) => u,
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

fn failing_main(body: impl FnOnce(&mut ModuleBuilder)) -> String {
    let u = uncaught(
        &[unit("prog", ModuleKind::Object, |b| {
            b.function("main").unwrap();
            body(b);
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })],
        &VmConfig::default(),
    );
    u.payload.to_string()
}

fn emit_all(b: &mut ModuleBuilder, ops: impl IntoIterator<Item = Op>) {
    for op in ops {
        b.emit(op).unwrap();
    }
}

/* ---- arithmétique ---- */

#[test]
fn integer_arithmetic() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 1),
            Op::IStore(r(2), 0),
            Op::IArith(ArithOp::Add, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::IStore(r(1), 365),
            Op::IStore(r(2), 100),
            Op::IArith(ArithOp::Mod, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::IStore(r(1), -7),
            Op::IStore(r(2), 2),
            Op::IArith(ArithOp::Div, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::IArith(ArithOp::Mul, r(1), r(2), r(3)),
            Op::IInc(r(3)),
            Op::IInc(r(3)),
            Op::IDec(r(3)),
            Op::Print(r(3)),
        ]);
    });
    assert_eq!(lines, ["1", "65", "-3", "-13"]);
}

#[test]
fn comparisons_are_booleans_and_booleans_count_as_integers() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 69),
            Op::IStore(r(2), 1),
            Op::ICmp(CmpOp::Eq, r(2), r(2), r(3)),
            Op::Print(r(3)),
            Op::ICmp(CmpOp::Gt, r(2), r(1), r(4)),
            Op::Print(r(4)),
            Op::IArith(ArithOp::Add, r(1), r(3), r(5)),
            Op::Print(r(5)),
        ]);
    });
    assert_eq!(lines, ["true", "false", "70"]);
}

#[test]
fn float_arithmetic_formatting() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::FStore(r(1), 1.0),
            Op::FStore(r(2), 2.0),
            Op::FArith(ArithOp::Div, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::FStore(r(2), 0.015),
            Op::FArith(ArithOp::Add, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::FStore(r(1), 8.0),
            Op::FStore(r(2), 0.004),
            Op::FArith(ArithOp::Add, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::FStore(r(1), 3.14),
            Op::FStore(r(2), 2.0),
            Op::FArith(ArithOp::Div, r(1), r(2), r(3)),
            Op::Print(r(3)),
            Op::FCmp(CmpOp::Lt, r(2), r(1), r(4)),
            Op::Print(r(4)),
        ]);
    });
    assert_eq!(lines, ["0.5", "1.015", "8.004", "1.57", "true"]);
}

#[test]
fn casts() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 4),
            Op::IToF(r(1), r(2)),
            Op::Print(r(2)),
            Op::FStore(r(1), 3.7),
            Op::FToI(r(1), r(2)),
            Op::Print(r(2)),
            Op::StrStore(r(1), "69".into()),
            Op::SToI(r(1), r(2)),
            Op::Print(r(2)),
            Op::StrStore(r(1), "1.5".into()),
            Op::SToF(r(1), r(2)),
            Op::Print(r(2)),
        ]);
    });
    assert_eq!(lines, ["4.0", "3", "69", "1.5"]);
}

#[test]
fn malformed_cast_raises() {
    let msg = failing_main(|b| emit_all(b, [Op::StrStore(r(1), "x1".into()), Op::SToI(r(1), r(2))]));
    assert_eq!(msg, "invalid cast: cannot parse 'x1' as Integer");
}

#[test]
fn padded_or_signed_numbers_do_not_cast() {
    let msg = failing_main(|b| emit_all(b, [Op::StrStore(r(1), " 69".into()), Op::SToI(r(1), r(2))]));
    assert_eq!(msg, "invalid cast: cannot parse ' 69' as Integer");
    let msg = failing_main(|b| emit_all(b, [Op::StrStore(r(1), "+1.5".into()), Op::SToF(r(1), r(2))]));
    assert_eq!(msg, "invalid cast: cannot parse '+1.5' as Float");
}

/* ---- vecteurs ---- */

fn print_items(b: &mut ModuleBuilder, vec: Operand, count: i64) {
    for i in 0..count {
        emit_all(b, [Op::VAt(vec, r(9), Index::Const(i)), Op::Print(r(9))]);
    }
}

#[test]
fn vlen_counts_elements() {
    let lines = main_prints(|b| {
        b.emit(Op::Vec(r(1))).unwrap();
        for i in 0..8 {
            emit_all(b, [Op::IStore(r(2), i), Op::VPush(r(1), r(2))]);
        }
        emit_all(b, [Op::VLen(r(1), r(3)), Op::Print(r(3))]);
    });
    assert_eq!(lines, ["8"]);
}

#[test]
fn vinsert_shifts_elements() {
    let lines = main_prints(|b| {
        b.emit(Op::Vec(r(1))).unwrap();
        for (text, at) in [("sheep!", 0), ("Hurr", 0), ("durr", 1), ("Im'a", 2)] {
            emit_all(b, [Op::StrStore(r(2), text.into()), Op::VInsert(r(1), r(2), Index::Const(at))]);
        }
        print_items(b, r(1), 4);
    });
    assert_eq!(lines, ["Hurr", "durr", "Im'a", "sheep!"]);
}

#[test]
fn vpush_appends_copies() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::Vec(r(1)),
            Op::IStore(r(2), 0),
            Op::VPush(r(1), r(2)),
            Op::IInc(r(2)),
            Op::VPush(r(1), r(2)),
            Op::StrStore(r(2), "Hello World!".into()),
            Op::VPush(r(1), r(2)),
            Op::Print(r(2)),
        ]);
        print_items(b, r(1), 3);
    });
    assert_eq!(lines, ["Hello World!", "0", "1", "Hello World!"]);
}

#[test]
fn vpop_removes_by_index() {
    let lines = main_prints(|b| {
        b.emit(Op::Vec(r(1))).unwrap();
        for op in [
            Op::IStore(r(2), 0),
            Op::IStore(r(2), 1),
            Op::StrStore(r(2), "x".into()),
            Op::IStore(r(2), 0),
            Op::StrStore(r(2), "Hello World!".into()),
            Op::IStore(r(2), 9),
        ] {
            emit_all(b, [op, Op::VPush(r(1), r(2))]);
        }
        emit_all(b, [
            Op::VPop(r(1), None, Index::Const(-1)),
            Op::IStore(r(3), 2),
            Op::VPop(r(1), Some(r(5)), Index::Reg(r(3))),
        ]);
        print_items(b, r(1), 4);
        emit_all(b, [Op::Print(r(5)), Op::Print(r(1))]);
    });
    assert_eq!(lines, ["0", "1", "0", "Hello World!", "x", r#"[0, 1, 0, "Hello World!"]"#]);
}

#[test]
fn vat_supports_negative_indices() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::Vec(r(1)),
            Op::IStore(r(2), 0),
            Op::VPush(r(1), r(2)),
            Op::IStore(r(2), 1),
            Op::VPush(r(1), r(2)),
            Op::StrStore(r(2), "Hello World!".into()),
            Op::VPush(r(1), r(2)),
        ]);
        for i in [0, 1, -2, -1] {
            emit_all(b, [Op::VAt(r(1), r(3), Index::Const(i)), Op::Print(r(3))]);
        }
    });
    assert_eq!(lines, ["0", "1", "1", "Hello World!"]);
}

#[test]
fn vat_out_of_range_raises() {
    let msg = failing_main(|b| emit_all(b, [Op::Vec(r(1)), Op::VAt(r(1), r(2), Index::Const(0))]));
    assert_eq!(msg, "index out of range: 0 (length 0)");
}

/* ---- registres ---- */

#[test]
fn move_swap_free_and_null_checks() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 42),
            Op::Move(r(1), r(2)),
            Op::IsNull(r(1), r(3)),
            Op::Print(r(2)),
            Op::Print(r(3)),
            Op::IsNull(r(1), r(3)),
            Op::Print(r(3)),
            Op::StrStore(r(1), "two".into()),
            Op::Swap(r(1), r(2)),
            Op::Print(r(1)),
            Op::Print(r(2)),
            Op::Free(r(1)),
            Op::IsNull(r(1), r(3)),
            Op::Print(r(3)),
            Op::Copy(r(2), r(4)),
            Op::IsNull(r(2), r(3)),
            Op::Print(r(3)),
        ]);
    });
    assert_eq!(lines, ["42", "true", "true", "42", "two", "true", "false"]);
}

#[test]
fn empty_is_a_query() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::Empty(r(1), r(2)),
            Op::Print(r(2)),
            Op::Vec(r(1)),
            Op::Empty(r(1), r(2)),
            Op::Print(r(2)),
            Op::VPush(r(1), r(2)),
            Op::Empty(r(1), r(2)),
            Op::Print(r(2)),
            Op::Empty(r(1), r(2)),
            Op::Print(r(2)),
            Op::StrStore(r(3), String::new()),
            Op::Empty(r(3), r(2)),
            Op::Print(r(2)),
            Op::Print(r(1)),
        ]);
    });
    assert_eq!(lines, ["true", "true", "false", "false", "true", "[true]"]);
}

#[test]
fn references_write_through() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 2),
            Op::Ref(r(1), r(2)),
            Op::Vec(r(3)),
            Op::VPush(r(3), r(1)),
            Op::IStore(r(2), 16),
            Op::VPush(r(3), r(1)),
            Op::Print(r(3)),
        ]);
    });
    assert_eq!(lines, ["[2, 16]"]);
}

#[test]
fn indirect_operands_and_temporary_register() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 5),
            Op::IStore(r(5), 77),
            Op::Print(Operand::at(1)),
            Op::TmpRi(r(5)),
            Op::TmpRo(r(6)),
            Op::Print(r(6)),
            Op::BStore(r(7), b'A'),
            Op::Print(r(7)),
        ]);
    });
    assert_eq!(lines, ["77", "77", "A"]);
}

#[test]
fn logic_ops_use_truthiness() {
    let lines = main_prints(|b| {
        emit_all(b, [
            Op::IStore(r(1), 3),
            Op::Bool(r(1)),
            Op::Print(r(1)),
            Op::Not(r(1)),
            Op::Print(r(1)),
            Op::StrStore(r(2), "x".into()),
            Op::And(r(1), r(2), r(3)),
            Op::Or(r(1), r(2), r(4)),
            Op::Print(r(3)),
            Op::Print(r(4)),
            Op::StrStore(r(5), "x".into()),
            Op::StrEq(r(2), r(5), r(6)),
            Op::Print(r(6)),
        ]);
    });
    assert_eq!(lines, ["true", "false", "false", "true", "true"]);
}

#[test]
fn null_read_is_uncaught_without_handler() {
    let msg = failing_main(|b| {
        b.emit(Op::Print(r(1))).unwrap();
    });
    assert_eq!(msg, "(get) read from null register: 1");
}

/* ---- appels ---- */

#[test]
fn closures_share_captured_registers() {
    let module = link(&[unit("closures", ModuleKind::Object, |b| {
        b.function("set_answer").unwrap();
        emit_all(b, [Op::IStore(r(1), 42), Op::End]);
        b.end().unwrap();

        b.function("show").unwrap();
        emit_all(b, [Op::Print(r(1)), Op::End]);
        b.end().unwrap();

        b.function("main").unwrap();
        emit_all(b, [Op::IStore(r(1), 0), Op::ClBind(r(1))]);
        b.closure(r(2), "set_answer").unwrap();
        b.emit(Op::ClBind(r(1))).unwrap();
        b.closure(r(3), "show").unwrap();
        emit_all(b, [
            Op::Frame(r(0), r(0)),
            Op::FCall(r(2), None),
            Op::Frame(r(0), r(0)),
            Op::FCall(r(3), None),
            Op::IStore(r(1), 69),
            Op::Frame(r(0), r(0)),
            Op::FCall(r(3), None),
            Op::Print(r(3)),
            Op::End,
        ]);
        b.end().unwrap();
    })]);
    let (halt, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(halt.exit_code(), 0);
    assert_eq!(lines, ["42", "69", "Closure: show"]);
}

#[test]
fn closure_state_outlives_its_creating_call() {
    let module = link(&[unit("escape", ModuleKind::Object, |b| {
        b.function("bump").unwrap();
        emit_all(b, [Op::IInc(r(1)), Op::Print(r(1)), Op::End]);
        b.end().unwrap();

        b.function("make").unwrap();
        emit_all(b, [Op::IStore(r(1), 42), Op::ClBind(r(1))]);
        b.closure(r(0), "bump").unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();

        b.function("main").unwrap();
        b.emit(Op::Frame(r(0), r(0))).unwrap();
        b.call(Some(r(1)), "make").unwrap();
        emit_all(b, [
            Op::Frame(r(0), r(0)),
            Op::FCall(r(1), None),
            Op::Frame(r(0), r(0)),
            Op::FCall(r(1), None),
            Op::End,
        ]);
        b.end().unwrap();
    })]);
    let (halt, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(halt.exit_code(), 0, "{halt:?}");
    assert_eq!(lines, ["43", "44"]);
}

#[test]
fn static_registers_persist_across_calls() {
    let module = link(&[unit("counter", ModuleKind::Object, |b| {
        b.function("counter").unwrap();
        let init = b.label();
        let body = b.label();
        emit_all(b, [Op::Ress(SetKind::Static), Op::IsNull(r(1), r(2))]);
        b.branch(r(2), init, body).unwrap();
        b.mark(init);
        b.emit(Op::IZero(r(1))).unwrap();
        b.mark(body);
        emit_all(b, [Op::Print(r(1)), Op::IInc(r(1)), Op::Ress(SetKind::Local), Op::End]);
        b.end().unwrap();

        b.function("main").unwrap();
        for _ in 0..10 {
            b.emit(Op::Frame(r(0), r(0))).unwrap();
            b.call(None, "counter").unwrap();
        }
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
}

fn countdown(b: &mut ModuleBuilder) {
    b.function("countdown").unwrap();
    let recurse = b.label();
    let done = b.label();
    emit_all(b, [Op::Arg(r(0), r(1)), Op::Print(r(1)), Op::IZero(r(2)), Op::ICmp(CmpOp::Gt, r(1), r(2), r(3))]);
    b.branch(r(3), recurse, done).unwrap();
    b.mark(recurse);
    emit_all(b, [Op::IDec(r(1)), Op::Frame(r(1), r(0)), Op::Param(r(0), r(1))]);
    b.call(None, "countdown").unwrap();
    b.mark(done);
    b.emit(Op::End).unwrap();
    b.end().unwrap();
}

#[test]
fn recursion_counts_down() {
    let module = link(&[unit("rec", ModuleKind::Object, |b| {
        countdown(b);
        b.function("main").unwrap();
        emit_all(b, [Op::IStore(r(1), 9), Op::Frame(r(1), r(0)), Op::Param(r(0), r(1))]);
        b.call(None, "countdown").unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, (0..10).rev().map(|i| i.to_string()).collect::<Vec<_>>());
}

#[test]
fn parameters_by_reference_and_return_values() {
    let module = link(&[unit("refs", ModuleKind::Object, |b| {
        b.function("bump").unwrap();
        emit_all(b, [Op::Arg(r(0), r(1)), Op::IInc(r(1)), Op::End]);
        b.end().unwrap();

        b.function("twice").unwrap();
        emit_all(b, [Op::Arg(r(0), r(1)), Op::IArith(ArithOp::Add, r(1), r(1), r(0)), Op::End]);
        b.end().unwrap();

        b.function("main").unwrap();
        emit_all(b, [Op::IStore(r(1), 41), Op::Frame(r(1), r(0)), Op::ParRef(r(0), r(1))]);
        b.call(None, "bump").unwrap();
        emit_all(b, [Op::Print(r(1)), Op::Frame(r(1), r(0)), Op::Param(r(0), r(1))]);
        b.call(Some(r(2)), "twice").unwrap();
        emit_all(b, [Op::Print(r(2)), Op::Print(r(1)), Op::End]);
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, ["42", "84", "42"]);
}

#[test]
fn first_class_functions_apply_and_invoke() {
    let module = link(&[unit("apply", ModuleKind::Object, |b| {
        b.function("double").unwrap();
        emit_all(b, [Op::Arg(r(0), r(1)), Op::IArith(ArithOp::Add, r(1), r(1), r(0)), Op::End]);
        b.end().unwrap();

        b.function("apply").unwrap();
        emit_all(b, [
            Op::Arg(r(0), r(1)),
            Op::Arg(r(1), r(2)),
            Op::Frame(r(1), r(0)),
            Op::Param(r(0), r(2)),
            Op::FCall(r(1), Some(r(0))),
            Op::End,
        ]);
        b.end().unwrap();

        b.function("main").unwrap();
        b.function_ref(r(1), "double").unwrap();
        emit_all(b, [Op::Print(r(1)), Op::IStore(r(2), 21), Op::Frame(r(2), r(0)), Op::Param(r(0), r(1)), Op::Param(r(1), r(2))]);
        b.call(Some(r(3)), "apply").unwrap();
        emit_all(b, [Op::Print(r(3)), Op::End]);
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, ["Function: double", "42"]);
}

#[test]
fn calling_a_non_function_raises() {
    let msg = failing_main(|b| emit_all(b, [Op::IStore(r(1), 1), Op::Frame(r(0), r(0)), Op::FCall(r(1), None)]));
    assert_eq!(msg, "expected Function operand, got Integer");
}

#[test]
fn entry_receives_command_line_arguments() {
    let module = link(&[unit("args", ModuleKind::Object, |b| {
        b.function("main").unwrap();
        emit_all(b, [Op::Arg(r(0), r(1)), Op::Print(r(1)), Op::ArgC(r(2)), Op::Print(r(2)), Op::End]);
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &["a", "b"]);
    assert_eq!(lines, [r#"["a", "b"]"#, "1"]);
}

#[test]
fn global_registers_are_shared_between_functions() {
    let module = link(&[unit("globals", ModuleKind::Object, |b| {
        b.function("publish").unwrap();
        emit_all(b, [Op::Ress(SetKind::Global), Op::IStore(r(1), 99), Op::End]);
        b.end().unwrap();

        b.function("main").unwrap();
        b.emit(Op::Frame(r(0), r(0))).unwrap();
        b.call(None, "publish").unwrap();
        emit_all(b, [Op::IsNull(r(1), r(2)), Op::Print(r(2)), Op::Ress(SetKind::Global), Op::Print(r(1)), Op::End]);
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, ["true", "99"]);
}

#[test]
fn native_math_module() {
    let module = link(&[unit("native", ModuleKind::Object, |b| {
        b.native("math");
        b.function("main").unwrap();
        emit_all(b, [Op::FStore(r(1), 3.0), Op::Frame(r(1), r(0)), Op::Param(r(0), r(1))]);
        b.call(Some(r(2)), "math.sqrt").unwrap();
        b.emit(Op::Print(r(2))).unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    })]);
    let (_, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(lines, ["1.732051"]);
}

#[test]
fn call_protocol_errors() {
    let module = |ret: Option<Operand>, framed: bool| {
        unit("proto", ModuleKind::Object, move |b| {
            b.function("nothing").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
            b.function("main").unwrap();
            if framed {
                b.emit(Op::Frame(r(0), r(0))).unwrap();
            }
            b.call(ret, "nothing").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })
    };
    let u = uncaught(&[module(None, false)], &VmConfig::default());
    assert_eq!(
        u.payload.to_string(),
        "function call without a frame: use 'frame 0' if the function takes no parameters"
    );
    let u = uncaught(&[module(Some(r(1)), true)], &VmConfig::default());
    assert_eq!(u.payload.to_string(), "return value requested by frame but function did not set return register");
    assert_eq!(u.function, "nothing");
}

/* ---- lien ---- */

#[test]
fn library_functions_and_jumps_survive_linking() {
    let app = unit("app", ModuleKind::Object, |b| {
        b.function("main").unwrap();
        emit_all(b, [Op::IStore(r(1), 4), Op::Frame(r(1), r(0)), Op::Param(r(0), r(1))]);
        b.call(Some(r(2)), "triangle").unwrap();
        emit_all(b, [Op::Print(r(2)), Op::End]);
        b.end().unwrap();
    });
    let lib = unit("shapes", ModuleKind::Library, |b| {
        b.function("triangle").unwrap();
        let top = b.label();
        let body = b.label();
        let out = b.label();
        emit_all(b, [Op::Arg(r(0), r(1)), Op::IZero(r(0)), Op::IZero(r(2))]);
        b.mark(top);
        b.emit(Op::ICmp(CmpOp::Lt, r(2), r(1), r(3))).unwrap();
        b.branch(r(3), body, out).unwrap();
        b.mark(body);
        emit_all(b, [Op::IInc(r(2)), Op::IArith(ArithOp::Add, r(0), r(2), r(0))]);
        b.jump(top).unwrap();
        b.mark(out);
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    });
    let (halt, lines) = exec_with(link(&[app, lib]), &VmConfig::default(), &[]);
    assert_eq!(halt, Halt::Completed { ret: None });
    assert_eq!(lines, ["10"]);
}

#[test]
fn library_main_override_is_the_entry() {
    let app = unit("app", ModuleKind::Object, |b| {
        b.function("greet").unwrap();
        emit_all(b, [Op::StrStore(r(1), "Hello World!".into()), Op::Print(r(1)), Op::End]);
        b.end().unwrap();
    });
    let lib = unit("boot", ModuleKind::Library, |b| {
        b.main("start");
        b.function("start").unwrap();
        b.emit(Op::Frame(r(0), r(0))).unwrap();
        b.call(None, "greet").unwrap();
        b.emit(Op::Halt).unwrap();
        b.end().unwrap();
    });
    let (_, lines) = exec_with(link(&[app, lib]), &VmConfig::default(), &[]);
    assert_eq!(lines, ["Hello World!"]);
}

#[test]
fn linked_executable_survives_the_binary_container() {
    let module = link(&[unit("bin", ModuleKind::Object, |b| {
        b.function("main").unwrap();
        emit_all(b, [Op::IStore(r(0), 7), Op::Halt]);
        b.end().unwrap();
    })]);
    let decoded = Module::from_bytes(&module.to_bytes()).unwrap();
    let (halt, _) = exec_with(decoded, &VmConfig::default(), &[]);
    assert_eq!(halt, Halt::Completed { ret: Some(regis_runtime::Value::Integer(7)) });
}

#[test]
fn objects_must_be_linked_first() {
    let (_, object) = unit("raw", ModuleKind::Object, |b| {
        b.function("main").unwrap();
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    });
    let err = run(object, Runtime::new(), &VmConfig::default(), &[]).unwrap_err();
    assert!(matches!(err, VmError::NotExecutable { .. }));
    assert_eq!(err.to_string(), "module 'raw' is object, not an executable (link it first)");
}

/* ---- exceptions ---- */

fn guarded(b: &mut ModuleBuilder, catchers: &[(Option<&str>, &str)], guarded_block: &str) {
    b.emit(Op::TryFrame).unwrap();
    for (ty, block) in catchers {
        b.catch(*ty, block).unwrap();
    }
    b.enter(guarded_block).unwrap();
}

#[test]
fn null_read_is_caught_and_pulled() {
    let module = link(&[unit("catch", ModuleKind::Object, |b| {
        b.block("attempt").unwrap();
        emit_all(b, [Op::Print(r(1)), Op::Leave]);
        b.end().unwrap();

        b.block("handler").unwrap();
        emit_all(b, [
            Op::Pull(r(2)),
            Op::StrStore(r(3), "exception encountered: ".into()),
            Op::Echo(r(3)),
            Op::Print(r(2)),
            Op::Leave,
        ]);
        b.end().unwrap();

        b.function("main").unwrap();
        guarded(b, &[(Some("Exception"), "handler")], "attempt");
        emit_all(b, [Op::StrStore(r(4), "after".into()), Op::Print(r(4)), Op::End]);
        b.end().unwrap();
    })]);
    let (halt, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(halt.exit_code(), 0);
    assert_eq!(lines, ["exception encountered: (get) read from null register: 1", "after"]);
}

#[test]
fn thrown_values_unwind_frames_to_the_matching_catcher() {
    let module = link(&[unit("throw", ModuleKind::Object, |b| {
        b.function("thrower").unwrap();
        emit_all(b, [Op::IStore(r(1), 7), Op::Throw(r(1))]);
        b.end().unwrap();

        b.block("guarded").unwrap();
        b.emit(Op::Frame(r(0), r(0))).unwrap();
        b.call(None, "thrower").unwrap();
        b.emit(Op::Leave).unwrap();
        b.end().unwrap();

        b.block("strings").unwrap();
        emit_all(b, [Op::StrStore(r(1), "wrong handler".into()), Op::Print(r(1)), Op::Leave]);
        b.end().unwrap();

        b.block("ints").unwrap();
        emit_all(b, [Op::Pull(r(1)), Op::Print(r(1)), Op::Leave]);
        b.end().unwrap();

        b.function("main").unwrap();
        guarded(b, &[(Some("String"), "strings"), (Some("Integer"), "ints")], "guarded");
        guarded(b, &[(None, "ints")], "guarded");
        b.emit(Op::End).unwrap();
        b.end().unwrap();
    })]);
    let (halt, lines) = exec_with(module, &VmConfig::default(), &[]);
    assert_eq!(halt.exit_code(), 0);
    assert_eq!(lines, ["7", "7"]);
}

#[test]
fn uncaught_exception_reports_the_call_chain() {
    let u = uncaught(
        &[unit("trace", ModuleKind::Object, |b| {
            b.function("inner").unwrap();
            emit_all(b, [Op::Print(r(1)), Op::End]);
            b.end().unwrap();
            b.function("main").unwrap();
            b.emit(Op::Frame(r(0), r(0))).unwrap();
            b.call(None, "inner").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })],
        &VmConfig::default(),
    );
    assert_eq!(
        u.report(),
        "stack trace: from entry point...\n  called function: 'main'\n  called function: 'inner'\n\
         exception in function 'inner': Exception: (get) read from null register: 1"
    );
}

#[test]
fn pull_and_leave_need_an_active_catch() {
    assert_eq!(failing_main(|b| b.emit(Op::Pull(r(1))).map(drop).unwrap()), "no caught object to pull");
    assert_eq!(failing_main(|b| b.emit(Op::Leave).map(drop).unwrap()), "bad leave: no block has been entered");
    assert_eq!(failing_main(|b| b.emit(Op::Throw(r(3))).map(drop).unwrap()), "invalid throw: register 3 is empty");
}

/* ---- garde-fous ---- */

#[test]
fn jump_to_self_aborts() {
    let msg = failing_main(|b| {
        let here = b.here();
        b.jump(here).unwrap();
    });
    assert_eq!(msg, "aborting: JUMP instruction pointing to itself");
}

#[test]
fn integer_division_by_zero_raises() {
    let msg = failing_main(|b| {
        emit_all(b, [Op::IStore(r(1), 1), Op::IZero(r(2)), Op::IArith(ArithOp::Div, r(1), r(2), r(3))]);
    });
    assert_eq!(msg, "division by zero");
}

#[test]
fn unbounded_recursion_hits_the_frame_limit() {
    let config = VmConfig { max_frames: 16, ..VmConfig::default() };
    let u = uncaught(
        &[unit("deep", ModuleKind::Object, |b| {
            b.function("forever").unwrap();
            b.emit(Op::Frame(r(0), r(0))).unwrap();
            b.call(None, "forever").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
            b.function("main").unwrap();
            b.emit(Op::Frame(r(0), r(0))).unwrap();
            b.call(None, "forever").unwrap();
            b.emit(Op::End).unwrap();
            b.end().unwrap();
        })],
        &config,
    );
    assert_eq!(u.payload.to_string(), "stack size (16) exceeded with call to 'forever'");
    assert_eq!(u.trace.len(), 16);
}

#[test]
fn register_indices_are_bounded() {
    let config = VmConfig { register_size: 8, ..VmConfig::default() };
    let u = uncaught(
        &[unit("small", ModuleKind::Object, |b| {
            b.function("main").unwrap();
            emit_all(b, [Op::IStore(r(8), 1), Op::End]);
            b.end().unwrap();
        })],
        &config,
    );
    assert_eq!(u.payload.to_string(), "register index out of bounds: 8");
}

#[test]
fn frame_sizes_are_bounded_by_the_register_size() {
    let config = VmConfig { register_size: 8, ..VmConfig::default() };
    let huge = |args: Operand, locals: Operand| {
        uncaught(
            &[unit("huge", ModuleKind::Object, |b| {
                b.function("main").unwrap();
                emit_all(b, [Op::IStore(r(1), 9), Op::Frame(args, locals), Op::End]);
                b.end().unwrap();
            })],
            &config,
        )
        .payload
        .to_string()
    };
    assert_eq!(huge(Operand::reg(u32::MAX), r(0)), format!("register index out of bounds: {}", u32::MAX));
    assert_eq!(huge(r(0), Operand::reg(9)), "register index out of bounds: 9");
    assert_eq!(huge(Operand::at(1), r(0)), "register index out of bounds: 9");
}
