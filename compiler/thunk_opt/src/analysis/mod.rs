//! Generic forward dataflow over a [`Body`].
//!
//! # Algorithm
//!
//! Forward abstract interpretation with fixed-point iteration:
//!
//! 1. **Seed** the entry block with `State::default()`.
//! 2. **Reverse postorder sweep**: replay each reachable block's
//!    instructions through [`Analysis::apply`], then propagate the exit
//!    state to every successor. The first state to arrive at a block is
//!    copied; later ones are folded in with [`AbstractState::merge`].
//! 3. Repeat until a sweep changes no block entry.
//!
//! Only block entry and exit states are stored. Per-instruction states
//! ([`StaticAnalysis::before`], [`StaticAnalysis::after`]) are recomputed
//! by replaying the block from its entry, which keeps memory linear in
//! the block count.
//!
//! Termination follows from the states forming a finite-height lattice
//! that `merge` only moves down. The sweep count is still bounded and
//! exceeding the bound is treated as an internal error.

use rustc_hash::FxHashMap;

use crate::graph::{live_reachable, reverse_postorder};
use crate::ir::{BlockId, Body, InstrId};

/// Outcome of a transfer or merge step, ordered by severity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AbstractResult {
    /// Nothing changed.
    #[default]
    None,
    /// The state gained information.
    Updated,
    /// The state lost precision (something became ambiguous).
    LostPrecision,
    /// The state was invalidated wholesale by an unknown effect.
    Tainted,
}

impl AbstractResult {
    pub fn changed(self) -> bool {
        self != AbstractResult::None
    }

    /// Record `other`, keeping the more severe of the two.
    pub fn update(&mut self, other: AbstractResult) {
        *self = (*self).max(other);
    }
}

/// A lattice element tracked at every program point.
pub trait AbstractState: Clone + Default {
    /// Join at a true control-flow merge.
    fn merge(&mut self, other: &Self) -> AbstractResult;

    /// Looser join, used when combining the states at different exits.
    fn merge_exit(&mut self, other: &Self) -> AbstractResult;
}

/// A concrete analysis: a state type and a transfer function.
pub trait Analysis {
    type State: AbstractState;

    /// Transfer `state` across `instr`.
    fn apply(&self, state: &mut Self::State, body: &Body, instr: InstrId) -> AbstractResult;
}

/// Fixed-point solution of an [`Analysis`] over one [`Body`].
pub struct StaticAnalysis<'a, A: Analysis> {
    analysis: A,
    body: &'a Body,
    /// Indexed by block index. `None` for blocks never reached.
    entry_states: Vec<Option<A::State>>,
    /// Indexed by block index. Only filled for blocks without successors.
    exit_states: Vec<Option<A::State>>,
    positions: FxHashMap<InstrId, (BlockId, usize)>,
    iterations: usize,
}

impl<'a, A: Analysis> StaticAnalysis<'a, A> {
    /// Run `analysis` over `body` to a fixed point.
    ///
    /// # Panics
    ///
    /// If the sweeps do not converge within `(blocks + 1) * (instrs + 1) * 4`.
    pub fn run(analysis: A, body: &'a Body) -> Self {
        let num_blocks = body.blocks.len();
        let mut this = Self {
            analysis,
            body,
            entry_states: vec![None; num_blocks],
            exit_states: vec![None; num_blocks],
            positions: body.positions(),
            iterations: 0,
        };
        if num_blocks == 0 {
            return this;
        }

        let rpo = reverse_postorder(body);
        let bound = (num_blocks + 1) * (body.size() + 1) * 4;
        this.entry_states[body.entry.index()] = Some(A::State::default());

        tracing::debug!(num_blocks, instrs = body.size(), "running static analysis");

        loop {
            this.iterations += 1;
            assert!(
                this.iterations <= bound,
                "static analysis did not converge after {bound} sweeps"
            );

            let mut changed = false;
            for &block in &rpo {
                let Some(mut state) = this.entry_states[block.index()].clone() else {
                    continue;
                };
                let mut effect = AbstractResult::None;
                for &instr in &body.block(block).body {
                    effect.update(this.analysis.apply(&mut state, body, instr));
                }
                if effect >= AbstractResult::LostPrecision {
                    tracing::trace!(block = block.raw(), ?effect, "block transfer");
                }

                let successors = body.block(block).terminator.successors();
                for succ in &successors {
                    let slot = &mut this.entry_states[succ.index()];
                    if let Some(existing) = slot.as_mut() {
                        changed |= existing.merge(&state).changed();
                    } else {
                        *slot = Some(state.clone());
                        changed = true;
                    }
                }
                if successors.is_empty() {
                    this.exit_states[block.index()] = Some(state);
                }
            }

            if !changed {
                break;
            }
        }

        tracing::debug!(iterations = this.iterations, "static analysis converged");
        this
    }

    /// Number of sweeps the fixed point took.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// State at the entry of `block`, `None` if it is unreachable.
    pub fn block_entry(&self, block: BlockId) -> Option<&A::State> {
        self.entry_states.get(block.index())?.as_ref()
    }

    /// State immediately before `instr`.
    pub fn before(&self, instr: InstrId) -> Option<A::State> {
        let &(block, pos) = self.positions.get(&instr)?;
        Some(self.replay(block, pos))
    }

    /// State immediately after `instr`.
    pub fn after(&self, instr: InstrId) -> Option<A::State> {
        let &(block, pos) = self.positions.get(&instr)?;
        Some(self.replay(block, pos + 1))
    }

    /// Exit-merge of the states at every reachable exit.
    pub fn result(&self) -> A::State {
        Self::merge_exits(self.exit_states.iter().flatten())
    }

    /// Exit-merge of the states at the exits reachable from `instr` over
    /// live edges.
    ///
    /// Exits only reachable through statically dead branches do not
    /// contribute. Falls back to [`after`](Self::after) when no exit is
    /// reachable (for example, an infinite loop).
    pub fn result_ignoring_unreachable_exits(&self, instr: InstrId) -> Option<A::State> {
        let &(block, _) = self.positions.get(&instr)?;
        let mut exits = live_reachable(self.body, block)
            .into_iter()
            .filter_map(|b| self.exit_states[b.index()].as_ref())
            .peekable();
        if exits.peek().is_none() {
            return self.after(instr);
        }
        Some(Self::merge_exits(exits))
    }

    fn merge_exits<'s>(mut exits: impl Iterator<Item = &'s A::State>) -> A::State
    where
        A::State: 's,
    {
        let Some(first) = exits.next() else {
            return A::State::default();
        };
        let mut merged = first.clone();
        for state in exits {
            merged.merge_exit(state);
        }
        merged
    }

    /// State before position `upto` of `block`. Unreachable blocks replay
    /// from the default state.
    fn replay(&self, block: BlockId, upto: usize) -> A::State {
        let mut state = self.entry_states[block.index()]
            .clone()
            .unwrap_or_default();
        for &instr in &self.body.block(block).body[..upto] {
            self.analysis.apply(&mut state, self.body, instr);
        }
        state
    }
}
