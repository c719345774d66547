//! Optimizing IR — SSA instructions in basic blocks.
//!
//! # Architecture
//!
//! - **[`ClosureVersion`]** — one compiled unit: argument count, main body,
//!   the promise templates its `MkArg`s refer to, and a property bag the
//!   optimizer fills in.
//! - **[`Body`]** — an instruction arena plus basic blocks. Instructions
//!   live in the arena and blocks hold [`InstrId`]s in execution order, so
//!   moving an instruction between blocks never changes its identity.
//! - **[`Block`]** — instruction list and one [`Terminator`].
//! - **[`Instr`]** — one SSA operation: kind, result [`Type`], declared
//!   [`Effects`]. An instruction *is* its value.
//!
//! Block ids are allocated monotonically and never reused. Removing an
//! instruction detaches it from its block; the arena slot stays so ids held
//! elsewhere remain meaningful.

use bitflags::bitflags;
use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

// ── ID newtypes ─────────────────────────────────────────────────────

/// Instruction (and value) ID within a [`Body`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct InstrId(u32);

impl InstrId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Basic block ID within a [`Body`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Promise template ID within a [`ClosureVersion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PromiseId(u32);

impl PromiseId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ── Types and effects ───────────────────────────────────────────────

bitflags! {
    /// Static type of an instruction's result, as a set of possibilities.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Type: u8 {
        /// A concrete value.
        const VALUE = 1 << 0;
        /// May be a deferred value that still needs forcing.
        const LAZY = 1 << 1;
        /// May be a value still wrapped in an evaluated promise.
        const PROMISE_WRAPPED = 1 << 2;
        /// An environment.
        const ENV = 1 << 3;
        /// No result.
        const VOID = 1 << 4;
    }
}

impl Type {
    #[inline]
    pub fn maybe_lazy(self) -> bool {
        self.contains(Type::LAZY)
    }

    #[inline]
    pub fn maybe_promise_wrapped(self) -> bool {
        self.contains(Type::PROMISE_WRAPPED)
    }
}

bitflags! {
    /// Effects an instruction may have when executed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Effects: u8 {
        /// May force promises, running arbitrary code.
        const FORCE = 1 << 0;
        /// Observable output.
        const VISIBLE = 1 << 1;
        /// May raise an error.
        const ERROR = 1 << 2;
        const READS_ENV = 1 << 3;
        const WRITES_ENV = 1 << 4;
        /// May fall back to the less-optimized version.
        const DEOPT = 1 << 5;
    }
}

impl Effects {
    /// Everything an opaque call may do.
    pub fn opaque() -> Self {
        Effects::FORCE | Effects::VISIBLE | Effects::ERROR | Effects::READS_ENV | Effects::WRITES_ENV
    }
}

/// Primitive arithmetic and comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimOp {
    Add,
    Sub,
    Lt,
}

// ── Instructions ────────────────────────────────────────────────────

/// What an instruction does.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum InstrKind {
    /// Load the `index`th argument of the closure.
    LdArg { index: u32 },
    LdConst { value: i64 },
    /// The environment the current code runs in. Promise bodies start with
    /// one.
    LdFunctionEnv,
    /// Create an environment. A `stub` environment is materialized lazily
    /// and does not leak its bindings; a `context` environment is visible
    /// to promises forced from this frame.
    MkEnv {
        parent: Option<InstrId>,
        bindings: Vec<InstrId>,
        context: bool,
        stub: bool,
    },
    /// Construct a deferred value for `promise` closing over `env`. An
    /// `eager` value means the promise already holds its result.
    MkArg {
        promise: PromiseId,
        eager: Option<InstrId>,
        env: InstrId,
    },
    /// Evaluate a deferred value (if it is one) and yield its result.
    /// `strict` is set once the force is known to be the first on every
    /// path.
    Force {
        value: InstrId,
        env: Option<InstrId>,
        strict: bool,
    },
    /// Type refinement; no runtime behavior.
    CastType { value: InstrId },
    /// Store `value` as the result of the deferred value `promise`.
    UpdatePromise { promise: InstrId, value: InstrId },
    /// Call to code the optimizer cannot see.
    Call { callee: u32, args: Vec<InstrId> },
    PrimOp { op: PrimOp, args: Vec<InstrId> },
    Phi { inputs: Vec<(BlockId, InstrId)> },
}

/// A single SSA instruction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Instr {
    pub kind: InstrKind,
    pub ty: Type,
    pub effects: Effects,
}

impl Instr {
    pub fn new(kind: InstrKind, ty: Type, effects: Effects) -> Self {
        Self { kind, ty, effects }
    }

    /// Argument load. Arguments may still be unevaluated.
    pub fn ld_arg(index: u32) -> Self {
        Self::new(
            InstrKind::LdArg { index },
            Type::VALUE | Type::LAZY,
            Effects::empty(),
        )
    }

    pub fn ld_const(value: i64) -> Self {
        Self::new(InstrKind::LdConst { value }, Type::VALUE, Effects::empty())
    }

    pub fn ld_function_env() -> Self {
        Self::new(InstrKind::LdFunctionEnv, Type::ENV, Effects::empty())
    }

    pub fn mk_env(parent: Option<InstrId>, bindings: Vec<InstrId>, context: bool) -> Self {
        Self::new(
            InstrKind::MkEnv {
                parent,
                bindings,
                context,
                stub: false,
            },
            Type::ENV,
            Effects::empty(),
        )
    }

    pub fn mk_env_stub(parent: Option<InstrId>, bindings: Vec<InstrId>) -> Self {
        Self::new(
            InstrKind::MkEnv {
                parent,
                bindings,
                context: false,
                stub: true,
            },
            Type::ENV,
            Effects::empty(),
        )
    }

    pub fn mk_arg(promise: PromiseId, eager: Option<InstrId>, env: InstrId) -> Self {
        Self::new(
            InstrKind::MkArg {
                promise,
                eager,
                env,
            },
            Type::LAZY,
            Effects::empty(),
        )
    }

    pub fn force(value: InstrId, env: Option<InstrId>) -> Self {
        Self::new(
            InstrKind::Force {
                value,
                env,
                strict: false,
            },
            Type::VALUE,
            Effects::opaque(),
        )
    }

    pub fn cast(value: InstrId, ty: Type) -> Self {
        Self::new(InstrKind::CastType { value }, ty, Effects::empty())
    }

    pub fn update_promise(promise: InstrId, value: InstrId) -> Self {
        Self::new(
            InstrKind::UpdatePromise { promise, value },
            Type::VOID,
            Effects::empty(),
        )
    }

    pub fn call(callee: u32, args: Vec<InstrId>, effects: Effects) -> Self {
        Self::new(InstrKind::Call { callee, args }, Type::VALUE, effects)
    }

    pub fn prim(op: PrimOp, args: Vec<InstrId>) -> Self {
        Self::new(InstrKind::PrimOp { op, args }, Type::VALUE, Effects::empty())
    }

    pub fn phi(inputs: Vec<(BlockId, InstrId)>, ty: Type) -> Self {
        Self::new(InstrKind::Phi { inputs }, ty, Effects::empty())
    }

    /// Values read by this instruction, in operand order.
    pub fn operands(&self) -> SmallVec<[InstrId; 4]> {
        match &self.kind {
            InstrKind::LdArg { .. } | InstrKind::LdConst { .. } | InstrKind::LdFunctionEnv => {
                SmallVec::new()
            }
            InstrKind::MkEnv {
                parent, bindings, ..
            } => parent.iter().chain(bindings).copied().collect(),
            InstrKind::MkArg { eager, env, .. } => eager.iter().copied().chain([*env]).collect(),
            InstrKind::Force { value, env, .. } => {
                std::iter::once(*value).chain(env.iter().copied()).collect()
            }
            InstrKind::CastType { value } => smallvec![*value],
            InstrKind::UpdatePromise { promise, value } => smallvec![*promise, *value],
            InstrKind::Call { args, .. } | InstrKind::PrimOp { args, .. } => {
                args.iter().copied().collect()
            }
            InstrKind::Phi { inputs } => inputs.iter().map(|&(_, v)| v).collect(),
        }
    }

    /// Apply `f` to every operand slot.
    pub fn map_operands(&mut self, mut f: impl FnMut(&mut InstrId)) {
        match &mut self.kind {
            InstrKind::LdArg { .. } | InstrKind::LdConst { .. } | InstrKind::LdFunctionEnv => {}
            InstrKind::MkEnv {
                parent, bindings, ..
            } => {
                parent.iter_mut().for_each(&mut f);
                bindings.iter_mut().for_each(f);
            }
            InstrKind::MkArg { eager, env, .. } => {
                eager.iter_mut().for_each(&mut f);
                f(env);
            }
            InstrKind::Force { value, env, .. } => {
                f(value);
                env.iter_mut().for_each(f);
            }
            InstrKind::CastType { value } => f(value),
            InstrKind::UpdatePromise { promise, value } => {
                f(promise);
                f(value);
            }
            InstrKind::Call { args, .. } | InstrKind::PrimOp { args, .. } => {
                args.iter_mut().for_each(f);
            }
            InstrKind::Phi { inputs } => inputs.iter_mut().for_each(|(_, v)| f(v)),
        }
    }

    /// Replace every read of `old` with `new`.
    pub fn substitute(&mut self, old: InstrId, new: InstrId) {
        self.map_operands(|v| {
            if *v == old {
                *v = new;
            }
        });
    }

    pub fn is_force(&self) -> bool {
        matches!(self.kind, InstrKind::Force { .. })
    }
}

// ── Terminators ─────────────────────────────────────────────────────

/// How control leaves a basic block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Terminator {
    Return {
        value: InstrId,
    },
    Jump {
        target: BlockId,
    },
    Branch {
        cond: InstrId,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Continue at `normal` unless a speculation fails, in which case
    /// control takes `deopt`, which ends in [`Terminator::Deopt`].
    Checkpoint {
        normal: BlockId,
        deopt: BlockId,
    },
    /// Fall back to the less-optimized version.
    Deopt,
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Terminator::Return { .. } | Terminator::Deopt | Terminator::Unreachable => {
                SmallVec::new()
            }
            Terminator::Jump { target } => smallvec![*target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => smallvec![*then_block, *else_block],
            Terminator::Checkpoint { normal, deopt } => smallvec![*normal, *deopt],
        }
    }

    pub fn operands(&self) -> SmallVec<[InstrId; 1]> {
        match self {
            Terminator::Return { value } => smallvec![*value],
            Terminator::Branch { cond, .. } => smallvec![*cond],
            _ => SmallVec::new(),
        }
    }

    pub fn substitute(&mut self, old: InstrId, new: InstrId) {
        match self {
            Terminator::Return { value: v } | Terminator::Branch { cond: v, .. } if *v == old => {
                *v = new;
            }
            _ => {}
        }
    }

    /// Apply `f` to every successor slot.
    pub fn map_successors(&mut self, mut f: impl FnMut(&mut BlockId)) {
        match self {
            Terminator::Return { .. } | Terminator::Deopt | Terminator::Unreachable => {}
            Terminator::Jump { target } => f(target),
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                f(then_block);
                f(else_block);
            }
            Terminator::Checkpoint { normal, deopt } => {
                f(normal);
                f(deopt);
            }
        }
    }

    /// Does this terminator leave the code (no successors)?
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            Terminator::Return { .. } | Terminator::Deopt | Terminator::Unreachable
        )
    }
}

// ── Blocks and bodies ───────────────────────────────────────────────

/// A basic block.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub id: BlockId,
    pub body: Vec<InstrId>,
    pub terminator: Terminator,
}

/// A control-flow graph with its instruction arena.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Body {
    /// Indexed by `BlockId::index()`.
    pub blocks: Vec<Block>,
    /// Indexed by `InstrId::index()`. Includes detached instructions.
    pub instrs: Vec<Instr>,
    pub entry: BlockId,
}

impl Default for Body {
    fn default() -> Self {
        Self::new()
    }
}

impl Body {
    /// A body with one empty, unreachable-terminated entry block.
    pub fn new() -> Self {
        let mut body = Self {
            blocks: Vec::new(),
            instrs: Vec::new(),
            entry: BlockId::new(0),
        };
        body.add_block();
        body
    }

    /// Append a fresh empty block. Ids are never reused.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId::new(
            u32::try_from(self.blocks.len())
                .unwrap_or_else(|_| panic!("block count exceeds u32::MAX")),
        );
        self.blocks.push(Block {
            id,
            body: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        id
    }

    /// Put `instr` in the arena without placing it in a block.
    pub fn push_instr(&mut self, instr: Instr) -> InstrId {
        let id = InstrId::new(
            u32::try_from(self.instrs.len())
                .unwrap_or_else(|_| panic!("instruction count exceeds u32::MAX")),
        );
        self.instrs.push(instr);
        id
    }

    /// Add `instr` at the end of `block`.
    pub fn append(&mut self, block: BlockId, instr: Instr) -> InstrId {
        let id = self.push_instr(instr);
        self.blocks[block.index()].body.push(id);
        id
    }

    /// Add `instr` at position `pos` of `block`.
    pub fn insert(&mut self, block: BlockId, pos: usize, instr: Instr) -> InstrId {
        let id = self.push_instr(instr);
        self.blocks[block.index()].body.insert(pos, id);
        id
    }

    /// Detach the instruction at `pos` of `block`.
    pub fn remove(&mut self, block: BlockId, pos: usize) -> InstrId {
        self.blocks[block.index()].body.remove(pos)
    }

    /// Detach `instr` wherever it is. Returns `false` if it was not placed.
    pub fn remove_instr(&mut self, instr: InstrId) -> bool {
        match self.position_of(instr) {
            Some((block, pos)) => {
                self.remove(block, pos);
                true
            }
            None => false,
        }
    }

    pub fn set_terminator(&mut self, block: BlockId, terminator: Terminator) {
        self.blocks[block.index()].terminator = terminator;
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn instr(&self, id: InstrId) -> &Instr {
        &self.instrs[id.index()]
    }

    #[inline]
    pub fn instr_mut(&mut self, id: InstrId) -> &mut Instr {
        &mut self.instrs[id.index()]
    }

    /// Placed instructions in block order.
    pub fn placed(&self) -> impl Iterator<Item = (BlockId, InstrId)> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| b.body.iter().map(move |&i| (b.id, i)))
    }

    /// Block and position of a placed instruction.
    pub fn position_of(&self, instr: InstrId) -> Option<(BlockId, usize)> {
        self.blocks.iter().find_map(|b| {
            b.body
                .iter()
                .position(|&i| i == instr)
                .map(|pos| (b.id, pos))
        })
    }

    /// Index of every placed instruction's position.
    pub fn positions(&self) -> FxHashMap<InstrId, (BlockId, usize)> {
        let mut map = FxHashMap::default();
        for block in &self.blocks {
            for (pos, &i) in block.body.iter().enumerate() {
                map.insert(i, (block.id, pos));
            }
        }
        map
    }

    /// Number of placed instructions.
    pub fn size(&self) -> usize {
        self.blocks.iter().map(|b| b.body.len()).sum()
    }

    /// Skip over type casts.
    pub fn follow_casts(&self, mut id: InstrId) -> InstrId {
        while let InstrKind::CastType { value } = self.instr(id).kind {
            id = value;
        }
        id
    }

    /// Skip over type casts and forces.
    pub fn follow_casts_and_force(&self, mut id: InstrId) -> InstrId {
        loop {
            match self.instr(id).kind {
                InstrKind::CastType { value } | InstrKind::Force { value, .. } => id = value,
                _ => return id,
            }
        }
    }

    /// Rewrite every read of `old` (instructions and terminators) to `new`.
    pub fn replace_uses_with(&mut self, old: InstrId, new: InstrId) {
        for block in &mut self.blocks {
            for &i in &block.body {
                self.instrs[i.index()].substitute(old, new);
            }
            block.terminator.substitute(old, new);
        }
    }

    /// Is `value` read by any placed instruction or terminator?
    pub fn has_uses(&self, value: InstrId) -> bool {
        self.blocks.iter().any(|b| {
            b.terminator.operands().contains(&value)
                || b.body
                    .iter()
                    .any(|&i| self.instr(i).operands().contains(&value))
        })
    }
}

// ── Closures ────────────────────────────────────────────────────────

/// A promise template: the code of a deferred value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Promise {
    pub id: PromiseId,
    /// Starts with [`InstrKind::LdFunctionEnv`] and returns the value.
    pub body: Body,
}

impl Promise {
    pub fn size(&self) -> usize {
        self.body.size()
    }
}

/// Facts the optimizer persists on a closure version for callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Properties {
    /// Every argument is forced, in order, before any other effect.
    pub is_eager: bool,
    /// Argument indices in the order they are first forced, as far as that
    /// order is known not to depend on the path taken.
    pub argument_force_order: Vec<u32>,
}

/// One compiled unit of the optimizing tier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureVersion {
    pub name: String,
    /// Number of arguments the callee receives after matching.
    pub arg_count: u32,
    pub body: Body,
    pub promises: Vec<Promise>,
    pub properties: Properties,
}

impl ClosureVersion {
    pub fn new(name: impl Into<String>, arg_count: u32) -> Self {
        Self {
            name: name.into(),
            arg_count,
            body: Body::new(),
            promises: Vec::new(),
            properties: Properties::default(),
        }
    }

    pub fn entry(&self) -> BlockId {
        self.body.entry
    }

    /// Register a promise template. Returns its id.
    pub fn add_promise(&mut self, body: Body) -> PromiseId {
        let id = PromiseId::new(
            u32::try_from(self.promises.len())
                .unwrap_or_else(|_| panic!("promise count exceeds u32::MAX")),
        );
        self.promises.push(Promise { id, body });
        id
    }

    pub fn promise(&self, id: PromiseId) -> &Promise {
        &self.promises[id.index()]
    }

    /// Size metric used by inlining budgets: placed instructions of the
    /// main body.
    pub fn size(&self) -> usize {
        self.body.size()
    }
}

#[cfg(test)]
mod tests;
