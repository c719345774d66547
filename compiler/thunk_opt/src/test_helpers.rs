//! Shared test utilities: id shorthands, promise factories, and a reference
//! evaluator used to check that rewrites preserve behavior. Only compiled in
//! test builds.

use rustc_hash::FxHashMap;

use crate::ir::{
    BlockId, Body, ClosureVersion, Effects, Instr, InstrId, InstrKind, PrimOp, PromiseId,
    Terminator,
};

/// Shorthand for `InstrId::new(n)`.
pub(crate) fn i(n: u32) -> InstrId {
    InstrId::new(n)
}

/// Shorthand for `BlockId::new(n)`.
pub(crate) fn b(n: u32) -> BlockId {
    BlockId::new(n)
}

/// Promise body `env = LdFunctionEnv; c = value; return c`.
pub(crate) fn pure_promise(value: i64) -> Body {
    let mut body = Body::new();
    let entry = body.entry;
    body.append(entry, Instr::ld_function_env());
    let c = body.append(entry, Instr::ld_const(value));
    body.set_terminator(entry, Terminator::Return { value: c });
    body
}

/// Promise body that performs a visible call before producing `value`.
pub(crate) fn effectful_promise(callee: u32, value: i64) -> Body {
    let mut body = Body::new();
    let entry = body.entry;
    body.append(entry, Instr::ld_function_env());
    body.append(entry, Instr::call(callee, vec![], Effects::VISIBLE));
    let c = body.append(entry, Instr::ld_const(value));
    body.set_terminator(entry, Terminator::Return { value: c });
    body
}

/// Placed `Force` instructions.
pub(crate) fn count_forces(body: &Body) -> usize {
    count_placed(body, |k| matches!(k, InstrKind::Force { .. }))
}

/// Placed instructions whose kind satisfies `pred`.
pub(crate) fn count_placed(body: &Body, pred: impl Fn(&InstrKind) -> bool) -> usize {
    body.placed()
        .filter(|&(_, id)| pred(&body.instr(id).kind))
        .count()
}

// ── Reference evaluator ─────────────────────────────────────────────

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Val {
    Int(i64),
    /// Index into the evaluator's promise cells.
    Cell(usize),
    Env(usize),
    Unit,
}

/// Observable effect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// An argument promise ran.
    ArgForced(u32),
    /// An opaque call, with each argument's value if known (`None` for an
    /// unevaluated promise or an environment).
    Call { callee: u32, args: Vec<Option<i64>> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EvalError {
    Deopt,
    Unreachable,
    OutOfFuel,
    NotAnInt,
    Unbound(InstrId),
}

#[derive(Clone, Copy, Debug)]
enum Code {
    Arg(u32),
    Promise(PromiseId),
}

#[derive(Clone, Copy, Debug)]
struct PromiseCell {
    code: Code,
    env: Val,
    result: Option<Val>,
}

struct Evaluator<'u> {
    unit: &'u ClosureVersion,
    args: &'u [i64],
    arg_cells: FxHashMap<u32, usize>,
    cells: Vec<PromiseCell>,
    envs: usize,
    events: Vec<Event>,
    fuel: usize,
}

/// Run `unit` with arguments passed as (unevaluated) promises of `args`.
///
/// Returns the integer result and the effect log.
pub(crate) fn evaluate(
    unit: &ClosureVersion,
    args: &[i64],
) -> Result<(i64, Vec<Event>), EvalError> {
    let mut eval = Evaluator {
        unit,
        args,
        arg_cells: FxHashMap::default(),
        cells: Vec::new(),
        envs: 1,
        events: Vec::new(),
        fuel: 10_000,
    };
    let result = eval.run_body(&unit.body, Val::Env(0))?;
    let forced = eval.force(result)?;
    let value = eval.int(forced)?;
    Ok((value, eval.events))
}

impl Evaluator<'_> {
    fn run_body(&mut self, body: &Body, env: Val) -> Result<Val, EvalError> {
        let mut values: FxHashMap<InstrId, Val> = FxHashMap::default();
        let mut block = body.entry;
        let mut prev: Option<BlockId> = None;

        loop {
            for &id in &body.block(block).body {
                self.fuel = self.fuel.checked_sub(1).ok_or(EvalError::OutOfFuel)?;
                let v = self.step(body, id, env, prev, &values)?;
                values.insert(id, v);
            }
            let get = |v: InstrId| values.get(&v).copied().ok_or(EvalError::Unbound(v));
            match body.block(block).terminator {
                Terminator::Return { value } => return get(value),
                Terminator::Jump { target } => {
                    prev = Some(block);
                    block = target;
                }
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let c = self.int(get(cond)?)?;
                    prev = Some(block);
                    block = if c == 0 { else_block } else { then_block };
                }
                Terminator::Checkpoint { normal, .. } => {
                    prev = Some(block);
                    block = normal;
                }
                Terminator::Deopt => return Err(EvalError::Deopt),
                Terminator::Unreachable => return Err(EvalError::Unreachable),
            }
        }
    }

    fn step(
        &mut self,
        body: &Body,
        id: InstrId,
        env: Val,
        prev: Option<BlockId>,
        values: &FxHashMap<InstrId, Val>,
    ) -> Result<Val, EvalError> {
        let get = |v: InstrId| values.get(&v).copied().ok_or(EvalError::Unbound(v));
        let instr = body.instr(id);
        Ok(match &instr.kind {
            InstrKind::LdArg { index } => {
                let cell = match self.arg_cells.get(index) {
                    Some(&cell) => cell,
                    None => {
                        let cell = self.alloc(Code::Arg(*index), Val::Unit, None);
                        self.arg_cells.insert(*index, cell);
                        cell
                    }
                };
                Val::Cell(cell)
            }
            InstrKind::LdConst { value } => Val::Int(*value),
            InstrKind::LdFunctionEnv => env,
            InstrKind::MkEnv { .. } => {
                self.envs += 1;
                Val::Env(self.envs)
            }
            InstrKind::MkArg {
                promise,
                eager,
                env,
            } => {
                let result = eager.map(get).transpose()?;
                Val::Cell(self.alloc(Code::Promise(*promise), get(*env)?, result))
            }
            InstrKind::Force { value, .. } => self.force(get(*value)?)?,
            InstrKind::CastType { value } => get(*value)?,
            InstrKind::UpdatePromise { promise, value } => {
                if let Val::Cell(c) = get(*promise)? {
                    self.cells[c].result = Some(get(*value)?);
                }
                Val::Unit
            }
            InstrKind::Call { callee, args } => {
                let mut observed = Vec::with_capacity(args.len());
                for &arg in args {
                    let mut v = get(arg)?;
                    if instr.effects.contains(Effects::FORCE) {
                        v = self.force(v)?;
                    }
                    observed.push(self.peek(v));
                }
                self.events.push(Event::Call {
                    callee: *callee,
                    args: observed,
                });
                Val::Int(i64::from(*callee))
            }
            InstrKind::PrimOp { op, args } => {
                let a = self.int(get(args[0])?)?;
                let b = self.int(get(args[1])?)?;
                Val::Int(match op {
                    PrimOp::Add => a + b,
                    PrimOp::Sub => a - b,
                    PrimOp::Lt => i64::from(a < b),
                })
            }
            InstrKind::Phi { inputs } => {
                let (_, v) = inputs
                    .iter()
                    .find(|(pred, _)| Some(*pred) == prev)
                    .ok_or(EvalError::Unreachable)?;
                get(*v)?
            }
        })
    }

    fn alloc(&mut self, code: Code, env: Val, result: Option<Val>) -> usize {
        self.cells.push(PromiseCell { code, env, result });
        self.cells.len() - 1
    }

    fn force(&mut self, v: Val) -> Result<Val, EvalError> {
        let Val::Cell(c) = v else {
            return Ok(v);
        };
        if let Some(result) = self.cells[c].result {
            return Ok(result);
        }
        let cell = self.cells[c];
        let result = match cell.code {
            Code::Arg(index) => {
                self.events.push(Event::ArgForced(index));
                Val::Int(self.args.get(index as usize).copied().unwrap_or(0))
            }
            Code::Promise(p) => {
                let unit = self.unit;
                let r = self.run_body(&unit.promise(p).body, cell.env)?;
                self.force(r)?
            }
        };
        self.cells[c].result = Some(result);
        Ok(result)
    }

    /// Integer view of a value; an evaluated promise shows its result.
    fn int(&self, v: Val) -> Result<i64, EvalError> {
        self.peek(v).ok_or(EvalError::NotAnInt)
    }

    fn peek(&self, v: Val) -> Option<i64> {
        match v {
            Val::Int(n) => Some(n),
            Val::Cell(c) => match self.cells[c].result {
                Some(Val::Int(n)) => Some(n),
                _ => None,
            },
            Val::Env(_) | Val::Unit => None,
        }
    }
}
