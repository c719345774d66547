//! Force-dominance analysis.
//!
//! Tracks, for every deferred value in scope, which `Force` evaluated it
//! first. A force is *dominating* when it is the attributed forcer at every
//! exit it can reach: no path evaluates the value before it, so later forces
//! of the same value are redundant and its promise body may be spliced in
//! place.
//!
//! Escapes are tracked only as far as forcing decisions need them. Once a
//! value escapes through an operand the analysis cannot see into, any
//! instruction that may force as a side effect makes its forcing state
//! [`ForceRecord::Ambiguous`], and ambiguity is never retracted.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::{AbstractResult, AbstractState, Analysis};
use crate::ir::{Body, Effects, InstrId, InstrKind, Promise, PromiseId, Terminator};

/// Who forced a value first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ForceRecord {
    ForcedBy(InstrId),
    /// Forced, but not by one attributable instruction.
    Ambiguous,
}

/// Whether a promise body may be spliced in at a dominating force.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PromiseInlineable {
    SafeToInline,
    /// Safe, but the value escaped: aliases must see the result through an
    /// explicit `UpdatePromise`.
    SafeToInlineWithUpdate,
    NotSafeToInline,
}

// ── Deoptimization queries ──────────────────────────────────────────

/// Answers whether running a promise body may fall back to a less
/// optimized version.
pub trait DeoptQuery {
    fn may_deoptimize(&self, promise: &Promise) -> bool;
}

/// Inspects the body: any `Checkpoint`, `Deopt` or instruction with the
/// `DEOPT` effect may deoptimize.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralDeoptQuery;

impl DeoptQuery for StructuralDeoptQuery {
    fn may_deoptimize(&self, promise: &Promise) -> bool {
        let body = &promise.body;
        body.blocks.iter().any(|block| {
            matches!(
                block.terminator,
                Terminator::Checkpoint { .. } | Terminator::Deopt
            ) || block
                .body
                .iter()
                .any(|&i| body.instr(i).effects.contains(Effects::DEOPT))
        })
    }
}

/// Per-template memo of [`DeoptQuery::may_deoptimize`].
#[derive(Clone, Debug, Default)]
pub struct DeoptCache {
    has_deopt: FxHashMap<PromiseId, bool>,
}

impl DeoptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn may_deoptimize(&mut self, promise: &Promise, oracle: &dyn DeoptQuery) -> bool {
        *self
            .has_deopt
            .entry(promise.id)
            .or_insert_with(|| oracle.may_deoptimize(promise))
    }

    /// Number of templates queried so far.
    pub fn len(&self) -> usize {
        self.has_deopt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.has_deopt.is_empty()
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Forcing state at one program point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForcedBy {
    /// Absent means in scope but not yet forced.
    pub forced_by: FxHashMap<InstrId, ForceRecord>,
    pub in_scope: FxHashSet<InstrId>,
    pub escaped: FxHashSet<InstrId>,
    /// Argument indices in first-force order.
    pub argument_force_order: Vec<u32>,
    /// Set once the order above stops being trustworthy. Never cleared.
    pub ambiguous_force_order: bool,
}

impl ForcedBy {
    /// Bring `value` into scope with a clean record.
    pub fn declare(&mut self, value: InstrId) -> bool {
        let mut changed = self.in_scope.insert(value);
        changed |= self.forced_by.remove(&value).is_some();
        changed |= self.escaped.remove(&value);
        changed
    }

    /// An instruction that may force arbitrary values ran: every escaped,
    /// not yet forced value may have been forced by it.
    pub fn side_effect(&mut self) -> bool {
        let mut changed = false;
        for &value in &self.escaped {
            if !self.forced_by.contains_key(&value) {
                self.forced_by.insert(value, ForceRecord::Ambiguous);
                changed = true;
            }
        }
        changed
    }

    /// Record `force` as the forcer of `value` unless one is known.
    pub fn forced_at(&mut self, value: InstrId, force: InstrId) -> bool {
        if self.forced_by.contains_key(&value) {
            return false;
        }
        self.in_scope.insert(value);
        self.forced_by.insert(value, ForceRecord::ForcedBy(force));
        true
    }

    /// Mark `value` as escaped unless it is already forced or escaped.
    pub fn escape(&mut self, value: InstrId) -> bool {
        !self.forced_by.contains_key(&value) && self.escaped.insert(value)
    }

    pub fn record(&self, value: InstrId) -> Option<ForceRecord> {
        self.forced_by.get(&value).copied()
    }

    /// Could argument `index` have been forced already?
    pub fn maybe_forced(&self, index: u32) -> bool {
        self.ambiguous_force_order || self.argument_force_order.contains(&index)
    }

    /// Are the first `arg_count` arguments forced, in order, before anything
    /// else observable happens?
    pub fn eager_like_function(&self, arg_count: u32) -> bool {
        if self.ambiguous_force_order || self.argument_force_order.len() < arg_count as usize {
            return false;
        }
        (0..arg_count).all(|i| self.argument_force_order[i as usize] == i)
    }

    /// The force recorded for the value `force` evaluates, if unambiguous.
    pub fn dominating_force_of(&self, body: &Body, force: InstrId) -> Option<InstrId> {
        let InstrKind::Force { value, .. } = body.instr(force).kind else {
            return None;
        };
        match self.record(body.follow_casts(value))? {
            ForceRecord::ForcedBy(f) => Some(f),
            ForceRecord::Ambiguous => None,
        }
    }

    pub fn is_dominating_force(&self, body: &Body, force: InstrId) -> bool {
        self.dominating_force_of(body, force) == Some(force)
    }

    /// May the promise behind `mk` be spliced in here?
    ///
    /// Bodies that may deoptimize are never inlined: there is no way to
    /// synthesize the promise's frame on demand.
    pub fn is_safe_to_inline(
        &self,
        mk: InstrId,
        promise: &Promise,
        cache: &mut DeoptCache,
        oracle: &dyn DeoptQuery,
    ) -> PromiseInlineable {
        if cache.may_deoptimize(promise, oracle) {
            return PromiseInlineable::NotSafeToInline;
        }
        if self.escaped.contains(&mk) {
            PromiseInlineable::SafeToInlineWithUpdate
        } else {
            PromiseInlineable::SafeToInline
        }
    }

    fn merge_force_order(&mut self, other: &Self) -> AbstractResult {
        let mut res = AbstractResult::None;
        if !self.ambiguous_force_order && other.ambiguous_force_order {
            self.ambiguous_force_order = true;
            res.update(AbstractResult::Updated);
        }
        if self.argument_force_order == other.argument_force_order {
            return res;
        }

        let common = self
            .argument_force_order
            .iter()
            .zip(&other.argument_force_order)
            .take_while(|(a, b)| a == b)
            .count();
        if common < self.argument_force_order.len() || !self.ambiguous_force_order {
            self.argument_force_order.truncate(common);
            self.ambiguous_force_order = true;
            res.update(AbstractResult::Updated);
        }
        res
    }
}

impl AbstractState for ForcedBy {
    fn merge(&mut self, other: &Self) -> AbstractResult {
        let mut res = AbstractResult::None;

        // Forced on one side, merely in scope on the other.
        for (value, record) in &mut self.forced_by {
            if !other.forced_by.contains_key(value)
                && other.in_scope.contains(value)
                && *record != ForceRecord::Ambiguous
            {
                *record = ForceRecord::Ambiguous;
                res.update(AbstractResult::LostPrecision);
            }
        }
        for value in other.forced_by.keys() {
            if !self.forced_by.contains_key(value) && self.in_scope.contains(value) {
                self.forced_by.insert(*value, ForceRecord::Ambiguous);
                res.update(AbstractResult::LostPrecision);
            }
        }

        res.update(self.merge_exit(other));
        res
    }

    fn merge_exit(&mut self, other: &Self) -> AbstractResult {
        let mut res = AbstractResult::None;

        for (value, record) in &mut self.forced_by {
            if let Some(theirs) = other.forced_by.get(value) {
                if *theirs != *record && *record != ForceRecord::Ambiguous {
                    *record = ForceRecord::Ambiguous;
                    res.update(AbstractResult::LostPrecision);
                }
            }
        }
        for (value, record) in &other.forced_by {
            if !self.forced_by.contains_key(value) {
                self.forced_by.insert(*value, *record);
                res.update(AbstractResult::Updated);
            }
        }
        for value in &other.in_scope {
            if self.in_scope.insert(*value) {
                res.update(AbstractResult::Updated);
            }
        }
        for value in &other.escaped {
            if self.escaped.insert(*value) {
                res.update(AbstractResult::Updated);
            }
        }

        res.update(self.merge_force_order(other));
        res
    }
}

// ── Transfer function ───────────────────────────────────────────────

/// The analysis over one closure version's main body.
#[derive(Clone, Copy, Debug)]
pub struct ForceDominanceAnalysis {
    /// Arguments the closure receives; bounds the recorded force order.
    pub arg_count: u32,
}

impl ForceDominanceAnalysis {
    pub fn new(arg_count: u32) -> Self {
        Self { arg_count }
    }

    /// Operands that may be deferred values escape into `instr`.
    fn escape_operands(state: &mut ForcedBy, body: &Body, instr: InstrId) -> bool {
        let mut changed = false;
        for operand in body.instr(instr).operands() {
            let value = body.follow_casts(operand);
            let def = body.instr(value);
            let deferred = matches!(def.kind, InstrKind::MkArg { .. } | InstrKind::LdArg { .. })
                || def.ty.maybe_lazy();
            if deferred {
                changed |= state.escape(value);
            }
        }
        changed
    }
}

impl Analysis for ForceDominanceAnalysis {
    type State = ForcedBy;

    fn apply(&self, state: &mut ForcedBy, body: &Body, instr: InstrId) -> AbstractResult {
        let mut res = AbstractResult::None;
        let mut note = |changed: bool, r: AbstractResult| {
            if changed {
                res.update(r);
            }
        };

        let current = body.instr(instr);
        match &current.kind {
            InstrKind::Force { value, .. } => {
                let target = body.follow_casts(*value);
                let def = body.instr(target);
                match def.kind {
                    InstrKind::LdArg { index } => {
                        if def.ty.maybe_lazy() {
                            note(state.forced_at(target, instr), AbstractResult::Updated);
                            if !state.maybe_forced(index) {
                                state.argument_force_order.push(index);
                                note(true, AbstractResult::Updated);
                            }
                        }
                    }
                    InstrKind::MkArg { .. } => {
                        note(state.forced_at(target, instr), AbstractResult::Updated);
                    }
                    _ if def.ty.maybe_lazy() => {
                        note(state.forced_at(target, instr), AbstractResult::Updated);
                    }
                    _ => {}
                }
            }
            InstrKind::MkArg { .. } => note(state.declare(instr), AbstractResult::Updated),
            InstrKind::MkEnv { stub, .. } => {
                if !stub {
                    note(
                        Self::escape_operands(state, body, instr),
                        AbstractResult::Updated,
                    );
                }
            }
            InstrKind::CastType { .. } => {}
            _ => {
                if current.ty.maybe_lazy() {
                    note(state.declare(instr), AbstractResult::Updated);
                }
                note(
                    Self::escape_operands(state, body, instr),
                    AbstractResult::Updated,
                );

                if current.effects.contains(Effects::FORCE) {
                    note(state.side_effect(), AbstractResult::Tainted);
                }
                let unattributed = current.effects.intersects(Effects::FORCE | Effects::VISIBLE);
                if unattributed
                    && !state.ambiguous_force_order
                    && state.argument_force_order.len() < self.arg_count as usize
                {
                    // Trusting later entries would reorder this effect with
                    // argument evaluation.
                    state.ambiguous_force_order = true;
                    note(true, AbstractResult::Tainted);
                }
            }
        }
        res
    }
}

#[cfg(test)]
mod tests;
