//! Moteur de dispatch : fetch-decode-execute sur une pile de cadres.
//!
//! Chaque instruction renvoie un [`Flow`] ou une erreur runtime ; une erreur
//! devient une charge utile d'exception et déclenche le déroulement de la
//! pile (`unwind`) vers le premier `catch` applicable. Sans attrapeur, la
//! machine s'arrête sur [`Halt::Uncaught`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::rc::Rc;

use regis_core::bytecode::{ArithOp, CmpOp, Index, Op, Operand, SetKind, SymbolId};
use regis_runtime::{Closure, Error, NativeFrame, RResult, RegisterSet, Runtime, SlotFlags, Value};
use tracing::{debug, trace};

use crate::config::VmConfig;
use crate::frame::{Frame, PendingFrame, TryFrame};
use crate::image::{Image, Target};

/* ─────────────────────────── Résultat ─────────────────────────── */

/// Exception arrivée au bout de la pile.
#[derive(Debug, Clone, PartialEq)]
pub struct Uncaught {
    /// Valeur levée.
    pub payload: Value,
    /// Fonction où elle a été levée.
    pub function: String,
    /// Pile d'appels au moment de la levée, point d'entrée d'abord.
    pub trace: Vec<String>,
}

impl Uncaught {
    /// Diagnostic multi-lignes (sans retour final).
    pub fn report(&self) -> String {
        let mut out = String::from("stack trace: from entry point...\n");
        for f in &self.trace {
            let _ = writeln!(out, "  called function: '{f}'");
        }
        let _ = write!(out, "exception in function '{}': {}: {}", self.function, self.payload.kind(), self.payload);
        out
    }
}

/// Fin d'exécution.
#[derive(Debug, Clone, PartialEq)]
pub enum Halt {
    /// Retour de la fonction d'entrée (ou `halt`) ; registre local 0 s'il est occupé.
    Completed {
        /// Valeur laissée dans le registre 0.
        ret: Option<Value>,
    },
    /// Exception non rattrapée.
    Uncaught(Uncaught),
}

impl Halt {
    /// Code de sortie processus.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Halt::Completed { .. } => 0,
            Halt::Uncaught(_) => 1,
        }
    }
}

enum Flow {
    Next,
    Goto(usize),
    Stop,
}

fn machine(msg: impl Into<String>) -> Error { Error::Msg(msg.into()) }

/* ─────────────────────────── CPU ─────────────────────────── */

/// Machine à registres.
pub struct Cpu {
    image: Rc<Image>,
    runtime: Runtime,
    config: VmConfig,
    globals: Rc<RefCell<RegisterSet>>,
    statics: HashMap<SymbolId, Rc<RefCell<RegisterSet>>>,
    frames: Vec<Frame>,
    pending: Option<PendingFrame>,
    tries: Vec<TryFrame>,
    pending_try: Option<TryFrame>,
    caught: Option<Value>,
    tmp: Option<Value>,
    pc: usize,
}

impl Cpu {
    /// Prépare une machine sur une image chargée.
    pub fn new(image: Image, runtime: Runtime, config: VmConfig) -> Self {
        let globals = Rc::new(RefCell::new(RegisterSet::new(config.register_size)));
        Self {
            image: Rc::new(image),
            runtime,
            config,
            globals,
            statics: HashMap::new(),
            frames: Vec::new(),
            pending: None,
            tries: Vec::new(),
            pending_try: None,
            caught: None,
            tmp: None,
            pc: 0,
        }
    }

    /// Runtime (natives, sortie).
    pub fn runtime_mut(&mut self) -> &mut Runtime { &mut self.runtime }

    /// Exécute la fonction d'entrée avec `argv` (Vector de String en argument 0).
    pub fn run(&mut self, argv: &[String]) -> Halt {
        let image = Rc::clone(&self.image);
        let entry = image.entry();
        let Some(&Target::Bytecode { start }) = image.target(entry) else {
            return self.uncaught_now(Value::from("entry point is not a bytecode function"));
        };

        let mut args = RegisterSet::new(1);
        let argv = Value::Vector(argv.iter().map(|a| Value::String(a.clone())).collect());
        if let Err(e) = args.set(0, argv) {
            return self.uncaught_now(e.into_payload());
        }
        self.frames.push(Frame {
            function: image.symbol_name(entry).to_owned(),
            symbol: entry,
            args,
            locals: Rc::new(RefCell::new(RegisterSet::new(self.config.register_size))),
            return_pc: 0,
            ret: None,
            selected: SetKind::Local,
        });
        self.pc = start;
        debug!(entry = image.symbol_name(entry), pc = start, "exécution");

        loop {
            let Some(op) = image.ops().get(self.pc) else {
                return self.uncaught_now(Value::from(format!("instruction pointer out of code: {}", self.pc)));
            };
            if self.config.trace_ops {
                trace!(pc = self.pc, depth = self.frames.len(), %op, "dispatch");
            }
            match self.exec(op, &image) {
                Ok(Flow::Next) => self.pc += 1,
                Ok(Flow::Goto(target)) => self.pc = target,
                Ok(Flow::Stop) => {
                    let ret = self.frames.last().and_then(|f| f.locals.borrow().get(0).ok());
                    let _ = self.runtime.ctx_mut().flush();
                    return Halt::Completed { ret };
                }
                Err(e) => {
                    let payload = e.into_payload();
                    if let Err(uncaught) = self.unwind(payload, &image) {
                        let _ = self.runtime.ctx_mut().flush();
                        return Halt::Uncaught(uncaught);
                    }
                }
            }
        }
    }

    fn uncaught_now(&self, payload: Value) -> Halt {
        let trace: Vec<String> = self.frames.iter().map(|f| f.function.clone()).collect();
        let function = trace.last().cloned().unwrap_or_default();
        Halt::Uncaught(Uncaught { payload, function, trace })
    }

    /// Cherche un attrapeur, du `try` le plus interne vers l'extérieur.
    fn unwind(&mut self, payload: Value, image: &Image) -> Result<(), Uncaught> {
        let kind = payload.kind();
        for i in (0..self.tries.len()).rev() {
            let Some(block) = self.tries[i].matching(kind) else { continue };
            let Some(&Target::Block { start }) = image.target(block) else { continue };
            debug!(kind, block = image.symbol_name(block), "exception attrapée");
            self.frames.truncate(self.tries[i].depth);
            self.tries.truncate(i + 1);
            self.tries[i].catchers.clear();
            self.pending = None;
            self.pending_try = None;
            self.caught = Some(payload);
            self.pc = start;
            return Ok(());
        }
        let trace: Vec<String> = self.frames.iter().map(|f| f.function.clone()).collect();
        let function = trace.last().cloned().unwrap_or_default();
        Err(Uncaught { payload, function, trace })
    }

    /* ─────────── registres ─────────── */

    fn frame(&self) -> RResult<&Frame> { self.frames.last().ok_or_else(|| machine("no active frame")) }

    fn frame_mut(&mut self) -> RResult<&mut Frame> { self.frames.last_mut().ok_or_else(|| machine("no active frame")) }

    fn active(&mut self) -> RResult<Rc<RefCell<RegisterSet>>> {
        let (selected, symbol, locals) = {
            let f = self.frame()?;
            (f.selected, f.symbol, Rc::clone(&f.locals))
        };
        Ok(match selected {
            SetKind::Local => locals,
            SetKind::Global => Rc::clone(&self.globals),
            SetKind::Static => {
                let size = self.config.register_size;
                Rc::clone(self.statics.entry(symbol).or_insert_with(|| Rc::new(RefCell::new(RegisterSet::new(size)))))
            }
        })
    }

    /// Index effectif ; un opérande `@N` lit l'index dans le registre N.
    fn slot(set: &RegisterSet, op: Operand) -> RResult<u32> {
        if !op.indirect {
            return Ok(op.value);
        }
        match set.get(op.value)? {
            Value::Integer(i) => u32::try_from(i).map_err(|_| machine(format!("register index out of bounds: {i}"))),
            _ => Err(machine(format!("invalid register reference in register {}", op.value))),
        }
    }

    /// Opérande de comptage (`frame`, `param`, `arg`) : valeur immédiate ou lue via `@N`.
    fn count(&mut self, op: Operand) -> RResult<u32> {
        if !op.indirect {
            return Ok(op.value);
        }
        let regs = self.active()?;
        let set = regs.borrow();
        Self::slot(&set, op)
    }

    fn read(&mut self, op: Operand) -> RResult<Value> {
        let regs = self.active()?;
        let set = regs.borrow();
        set.get(Self::slot(&set, op)?)
    }

    fn write(&mut self, op: Operand, value: Value) -> RResult<()> {
        let regs = self.active()?;
        let mut set = regs.borrow_mut();
        let i = Self::slot(&set, op)?;
        set.set(i, value)
    }

    fn update<T>(&mut self, op: Operand, f: impl FnOnce(&mut Value) -> RResult<T>) -> RResult<T> {
        let regs = self.active()?;
        let set = regs.borrow();
        set.update(Self::slot(&set, op)?, f)
    }

    fn with_set<T>(&mut self, f: impl FnOnce(&mut RegisterSet) -> RResult<T>) -> RResult<T> {
        let regs = self.active()?;
        let mut set = regs.borrow_mut();
        f(&mut set)
    }

    fn index(&mut self, index: Index) -> RResult<i64> {
        match index {
            Index::Const(i) => Ok(i),
            Index::Reg(op) => self.read(op)?.as_int(),
        }
    }

    /* ─────────── dispatch ─────────── */

    fn exec(&mut self, op: &Op, image: &Image) -> RResult<Flow> {
        match op {
            Op::Nop => {}
            Op::Halt => return Ok(Flow::Stop),
            Op::End => return self.ret(),
            Op::Jump(target) => {
                if *target as usize == self.pc {
                    return Err(machine("aborting: JUMP instruction pointing to itself"));
                }
                return Ok(Flow::Goto(*target as usize));
            }
            Op::Branch(cond, t, f) => {
                let target = if self.read(*cond)?.is_truthy() { *t } else { *f };
                return Ok(Flow::Goto(target as usize));
            }

            Op::IZero(r) => self.write(*r, Value::Integer(0))?,
            Op::IStore(r, v) => self.write(*r, Value::Integer(*v))?,
            Op::IArith(a, l, r, d) => {
                let (x, y) = (self.read(*l)?.as_int()?, self.read(*r)?.as_int()?);
                self.write(*d, Value::Integer(int_arith(*a, x, y)?))?;
            }
            Op::ICmp(c, l, r, d) => {
                let (x, y) = (self.read(*l)?.as_int()?, self.read(*r)?.as_int()?);
                self.write(*d, Value::Boolean(c.test(&x, &y)))?;
            }
            Op::IInc(r) => self.update(*r, |v| {
                *v = Value::Integer(v.as_int()?.wrapping_add(1));
                Ok(())
            })?,
            Op::IDec(r) => self.update(*r, |v| {
                *v = Value::Integer(v.as_int()?.wrapping_sub(1));
                Ok(())
            })?,

            Op::FStore(r, v) => self.write(*r, Value::Float(*v))?,
            Op::FArith(a, l, r, d) => {
                let (x, y) = (self.read(*l)?.as_float()?, self.read(*r)?.as_float()?);
                self.write(*d, Value::Float(float_arith(*a, x, y)?))?;
            }
            Op::FCmp(c, l, r, d) => {
                let (x, y) = (self.read(*l)?.as_float()?, self.read(*r)?.as_float()?);
                self.write(*d, Value::Boolean(cmp_float(*c, x, y)))?;
            }
            Op::BStore(r, b) => self.write(*r, Value::Byte(*b))?,

            Op::IToF(s, d) => {
                let x = self.read(*s)?.as_int()?;
                self.write(*d, Value::Float(x as f64))?;
            }
            Op::FToI(s, d) => {
                let x = self.read(*s)?.as_float()?;
                self.write(*d, Value::Integer(x.trunc() as i64))?;
            }
            Op::SToI(s, d) => {
                let text = self.read(*s)?;
                let text = text.as_str()?;
                let n = decimal::<i64>(text, "Integer")?;
                self.write(*d, Value::Integer(n))?;
            }
            Op::SToF(s, d) => {
                let text = self.read(*s)?;
                let text = text.as_str()?;
                let x = decimal::<f64>(text, "Float")?;
                self.write(*d, Value::Float(x))?;
            }

            Op::StrStore(r, s) => self.write(*r, Value::String(s.clone()))?,
            Op::StrEq(a, b, d) => {
                let (x, y) = (self.read(*a)?, self.read(*b)?);
                let eq = x.as_str()? == y.as_str()?;
                self.write(*d, Value::Boolean(eq))?;
            }

            Op::Vec(r) => self.write(*r, Value::Vector(Vec::new()))?,
            Op::VInsert(v, s, i) => {
                let (item, index) = (self.read(*s)?, self.index(*i)?);
                self.update(*v, |vec| {
                    let items = vec.as_vec_mut()?;
                    let at = position(index, items.len(), true)?;
                    items.insert(at, item);
                    Ok(())
                })?;
            }
            Op::VPush(v, s) => {
                let item = self.read(*s)?;
                self.update(*v, |vec| {
                    vec.as_vec_mut()?.push(item);
                    Ok(())
                })?;
            }
            Op::VPop(v, d, i) => {
                let index = self.index(*i)?;
                let item = self.update(*v, |vec| {
                    let items = vec.as_vec_mut()?;
                    let at = position(index, items.len(), false)?;
                    Ok(items.remove(at))
                })?;
                if let Some(d) = d {
                    self.write(*d, item)?;
                }
            }
            Op::VAt(v, d, i) => {
                let index = self.index(*i)?;
                let vec = self.read(*v)?;
                let items = vec.as_vec()?;
                let item = items[position(index, items.len(), false)?].clone();
                self.write(*d, item)?;
            }
            Op::VLen(v, d) => {
                let len = self.read(*v)?.as_vec()?.len();
                self.write(*d, Value::Integer(i64::try_from(len).unwrap_or(i64::MAX)))?;
            }

            Op::Bool(r) => self.update(*r, |v| {
                *v = Value::Boolean(v.is_truthy());
                Ok(())
            })?,
            Op::Not(r) => self.update(*r, |v| {
                *v = Value::Boolean(!v.is_truthy());
                Ok(())
            })?,
            Op::And(a, b, d) => {
                let x = self.read(*a)?.is_truthy() && self.read(*b)?.is_truthy();
                self.write(*d, Value::Boolean(x))?;
            }
            Op::Or(a, b, d) => {
                let x = self.read(*a)?.is_truthy() || self.read(*b)?.is_truthy();
                self.write(*d, Value::Boolean(x))?;
            }

            Op::Move(s, d) => {
                let value = self.with_set(|set| {
                    let i = Self::slot(set, *s)?;
                    set.take(i)
                })?;
                self.write(*d, value)?;
            }
            Op::Copy(s, d) => {
                let value = self.read(*s)?;
                self.write(*d, value)?;
            }
            Op::Ref(s, d) => self.with_set(|set| {
                let (i, j) = (Self::slot(set, *s)?, Self::slot(set, *d)?);
                let cell = set.cell(i)?;
                set.alias(j, cell)
            })?,
            Op::Swap(a, b) => self.with_set(|set| {
                let (i, j) = (Self::slot(set, *a)?, Self::slot(set, *b)?);
                set.swap(i, j)
            })?,
            Op::Free(r) => self.with_set(|set| {
                let i = Self::slot(set, *r)?;
                set.free(i)
            })?,
            Op::IsNull(s, d) => {
                let null = self.with_set(|set| set.is_null(Self::slot(set, *s)?))?;
                self.write(*d, Value::Boolean(null))?;
            }
            Op::Empty(s, d) => {
                let empty = self.with_set(|set| {
                    let i = Self::slot(set, *s)?;
                    Ok(set.is_null(i)? || set.cell(i)?.borrow().is_empty_container())
                })?;
                self.write(*d, Value::Boolean(empty))?;
            }
            Op::Ress(kind) => {
                self.frame_mut()?.selected = *kind;
                self.active()?;
            }
            Op::TmpRi(r) => self.tmp = Some(self.read(*r)?),
            Op::TmpRo(r) => {
                let value = self.tmp.take().ok_or_else(|| machine("temporary register is empty"))?;
                self.with_set(|set| {
                    let i = Self::slot(set, *r)?;
                    set.free(i)?;
                    set.set(i, value)
                })?;
            }

            Op::Print(r) => {
                let text = self.read(*r)?.to_string();
                self.runtime.ctx_mut().writeln_str(&text)?;
            }
            Op::Echo(r) => {
                let text = self.read(*r)?.to_string();
                self.runtime.ctx_mut().write_str(&text)?;
            }

            Op::Frame(args, locals) => {
                if self.pending.is_some() {
                    return Err(machine("requested new frame while last one is unused"));
                }
                let (args, locals) = (self.count(*args)?, self.count(*locals)?);
                if let Some(n) = [args, locals].into_iter().find(|n| *n as usize > self.config.register_size) {
                    return Err(Error::OutOfBounds(n));
                }
                let locals = if locals == 0 { self.config.register_size } else { locals as usize };
                self.pending = Some(PendingFrame { args: RegisterSet::new(args as usize), locals });
            }
            Op::Param(i, s) => {
                let i = self.param_slot(*i)?;
                let value = self.read(*s)?;
                self.pending_args()?.set(i, value)?;
            }
            Op::ParRef(i, s) => {
                let i = self.param_slot(*i)?;
                let cell = self.with_set(|set| set.cell(Self::slot(set, *s)?))?;
                self.pending_args()?.alias(i, cell)?;
            }
            Op::Arg(i, d) => {
                let i = self.count(*i)?;
                let (cell, by_ref) = {
                    let args = &self.frame()?.args;
                    if i as usize >= args.size() {
                        return Err(machine(format!("invalid read: read from argument register out of bounds: {i}")));
                    }
                    (args.cell(i)?, args.flags(i)?.contains(SlotFlags::REFERENCE))
                };
                if by_ref {
                    self.with_set(|set| {
                        let j = Self::slot(set, *d)?;
                        set.alias(j, cell)
                    })?;
                } else {
                    let value = cell.borrow().clone();
                    self.write(*d, value)?;
                }
            }
            Op::ArgC(d) => {
                let n = self.frame()?.args.size();
                self.write(*d, Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)))?;
            }
            Op::Call(ret, f) => return self.call(*f, *ret, None, image),
            Op::Function(d, f) => self.write(*d, Value::Function(image.symbol_name(*f).to_owned()))?,
            Op::ClBind(r) => self.with_set(|set| {
                let i = Self::slot(set, *r)?;
                set.mark(i, SlotFlags::BIND)
            })?,
            Op::Closure(d, f) => {
                let captured = self.with_set(|set| {
                    let mut captured = RegisterSet::new(set.size());
                    for i in set.marked(SlotFlags::BIND) {
                        captured.alias(i, set.cell(i)?)?;
                        set.mark(i, SlotFlags::REFERENCE)?;
                    }
                    set.unmark_all(SlotFlags::BIND);
                    Ok(captured)
                })?;
                let closure = Closure { function: image.symbol_name(*f).to_owned(), captured: Rc::new(RefCell::new(captured)) };
                self.write(*d, Value::Closure(closure))?;
            }
            Op::FCall(callable, ret) => {
                let (name, captured) = match self.read(*callable)? {
                    Value::Function(name) => (name, None),
                    Value::Closure(c) => (c.function, Some(c.captured)),
                    other => return Err(Error::type_mismatch("Function", &other)),
                };
                let f = image.function(&name).ok_or(Error::NotFound(name))?;
                return self.call(f, *ret, captured, image);
            }

            Op::TryFrame => {
                if self.pending_try.is_some() {
                    return Err(machine("requested new try frame while last one is unused"));
                }
                self.pending_try = Some(TryFrame::default());
            }
            Op::Catch(ty, block) => {
                let t = self.pending_try.as_mut().ok_or_else(|| machine("catch without a try frame"))?;
                t.catchers.push((ty.clone(), *block));
            }
            Op::Try(block) => {
                let mut t = self.pending_try.take().ok_or_else(|| machine("try without a try frame"))?;
                let Some(&Target::Block { start }) = image.target(*block) else {
                    return Err(machine(format!("cannot enter undefined block '{}'", image.symbol_name(*block))));
                };
                t.depth = self.frames.len();
                t.return_pc = self.pc + 1;
                self.tries.push(t);
                return Ok(Flow::Goto(start));
            }
            Op::Pull(d) => {
                let value = self.caught.take().ok_or_else(|| machine("no caught object to pull"))?;
                self.write(*d, value)?;
            }
            Op::Leave => {
                let depth = self.frames.len();
                if self.tries.last().map_or(true, |t| t.depth != depth) {
                    return Err(machine("bad leave: no block has been entered"));
                }
                let t = self.tries.pop().ok_or_else(|| machine("bad leave: no block has been entered"))?;
                return Ok(Flow::Goto(t.return_pc));
            }
            Op::Throw(r) => {
                let value = self.with_set(|set| {
                    let i = Self::slot(set, *r)?;
                    if set.is_null(i)? {
                        return Err(machine(format!("invalid throw: register {i} is empty")));
                    }
                    set.take(i)
                })?;
                return Err(Error::Throw(value));
            }
        }
        Ok(Flow::Next)
    }

    fn param_slot(&mut self, op: Operand) -> RResult<u32> {
        let i = self.count(op)?;
        let size = self.pending.as_ref().ok_or_else(|| machine("parameter passed without a frame"))?.args.size();
        if i as usize >= size {
            return Err(machine(
                "parameter register index out of bounds (greater than arguments set size) while adding parameter",
            ));
        }
        Ok(i)
    }

    fn pending_args(&mut self) -> RResult<&mut RegisterSet> {
        self.pending.as_mut().map(|p| &mut p.args).ok_or_else(|| machine("parameter passed without a frame"))
    }

    fn call(
        &mut self,
        f: SymbolId,
        ret: Option<Operand>,
        captured: Option<Rc<RefCell<RegisterSet>>>,
        image: &Image,
    ) -> RResult<Flow> {
        let name = image.symbol_name(f);
        let pending = self.pending.take().ok_or_else(|| {
            machine("function call without a frame: use 'frame 0' if the function takes no parameters")
        })?;
        if self.frames.len() >= self.config.max_frames {
            return Err(machine(format!("stack size ({}) exceeded with call to '{name}'", self.config.max_frames)));
        }

        match image.target(f) {
            Some(Target::Bytecode { start }) => {
                let locals = captured.unwrap_or_else(|| Rc::new(RefCell::new(RegisterSet::new(pending.locals))));
                self.frames.push(Frame {
                    function: name.to_owned(),
                    symbol: f,
                    args: pending.args,
                    locals,
                    return_pc: self.pc + 1,
                    ret,
                    selected: SetKind::Local,
                });
                Ok(Flow::Goto(*start))
            }
            Some(Target::Native(entry)) => {
                let mut locals = RegisterSet::new(pending.locals.max(1));
                self.runtime.invoke(entry, &mut NativeFrame { args: &pending.args, locals: &mut locals })?;
                if let Some(dst) = ret {
                    if locals.is_null(0)? {
                        return Err(machine("return value requested by frame but function did not set return register"));
                    }
                    self.write(dst, locals.take(0)?)?;
                }
                Ok(Flow::Next)
            }
            Some(Target::Block { .. }) | None => Err(machine(format!("'{name}' is not a callable function"))),
        }
    }

    /// `end` : dépile le cadre et transmet le registre local 0 si l'appelant l'a demandé.
    fn ret(&mut self) -> RResult<Flow> {
        if self.frames.len() <= 1 {
            return Ok(Flow::Stop);
        }
        let returned = {
            let frame = self.frame()?;
            match frame.ret {
                None => None,
                Some(dst) => {
                    let locals = frame.locals.borrow();
                    if locals.is_null(0)? {
                        return Err(machine(
                            "return value requested by frame but function did not set return register",
                        ));
                    }
                    let by_ref = locals.flags(0)?.contains(SlotFlags::REFERENCE);
                    Some((dst, locals.cell(0)?, by_ref))
                }
            }
        };
        let frame = self.frames.pop().ok_or_else(|| machine("no active frame"))?;
        let depth = self.frames.len();
        self.tries.retain(|t| t.depth <= depth);

        if let Some((dst, cell, by_ref)) = returned {
            if by_ref {
                self.with_set(|set| {
                    let i = Self::slot(set, dst)?;
                    set.alias(i, cell)
                })?;
            } else {
                let value = cell.borrow().clone();
                self.write(dst, value)?;
            }
        }
        Ok(Flow::Goto(frame.return_pc))
    }
}

/* ─────────────────────────── Arithmétique ─────────────────────────── */

fn int_arith(op: ArithOp, x: i64, y: i64) -> RResult<i64> {
    Ok(match op {
        ArithOp::Add => x.wrapping_add(y),
        ArithOp::Sub => x.wrapping_sub(y),
        ArithOp::Mul => x.wrapping_mul(y),
        ArithOp::Div if y == 0 => return Err(Error::DivisionByZero),
        ArithOp::Div => x.wrapping_div(y),
        ArithOp::Mod if y == 0 => return Err(Error::DivisionByZero),
        ArithOp::Mod => x.wrapping_rem(y),
    })
}

fn float_arith(op: ArithOp, x: f64, y: f64) -> RResult<f64> {
    Ok(match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::Mod => return Err(machine("modulo is not defined for floats")),
    })
}

#[allow(clippy::float_cmp)]
fn cmp_float(op: CmpOp, x: f64, y: f64) -> bool { op.test(&x, &y) }

/// Littéral décimal strict : signe `-` optionnel, chiffres en tête, ni espaces ni `inf`/`NaN`.
fn decimal<T: std::str::FromStr>(text: &str, kind: &'static str) -> RResult<T> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let well_formed = digits.starts_with(|c: char| c.is_ascii_digit())
        && digits.bytes().all(|c| c.is_ascii_digit() || matches!(c, b'.' | b'e' | b'E' | b'-' | b'+'));
    well_formed.then(|| text.parse::<T>().ok()).flatten().ok_or_else(|| Error::Cast { input: text.to_owned(), kind })
}

/// Index normalisé ; négatif = depuis la fin. `insert` accepte `len`.
fn position(index: i64, len: usize, insert: bool) -> RResult<usize> {
    let limit = if insert { len + 1 } else { len };
    let signed = i64::try_from(limit).unwrap_or(i64::MAX);
    let at = if index < 0 { signed + index } else { index };
    if (0..signed).contains(&at) {
        Ok(at as usize)
    } else {
        Err(Error::IndexOutOfRange { index, len })
    }
}
