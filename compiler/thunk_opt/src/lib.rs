//! Optimizing IR for the Thunk compiler.
//!
//! This crate provides:
//!
//! - **SSA IR** ([`ClosureVersion`], [`Body`], [`Instr`], [`Terminator`]) —
//!   one optimizable unit with its promise bodies, laid out as basic blocks
//!   over an instruction arena.
//!
//! - **CFG toolkit** ([`graph`]) — predecessors, postorder, dominator tree,
//!   block splitting and body cloning for inlining.
//!
//! - **Dataflow framework** ([`StaticAnalysis`], [`Analysis`],
//!   [`AbstractState`]) — forward fixpoint over a lattice with queries at any
//!   instruction, and a separate merge rule for exit states.
//!
//! - **Force dominance** ([`ForceDominanceAnalysis`], [`ForcedBy`]) — which
//!   force first evaluates each deferred value, whether it escaped, and in
//!   which order arguments are forced.
//!
//! - **Promise inlining** ([`force_dominance`]) — splices promise bodies in
//!   at their dominating force and removes forces that are always preceded
//!   by another force of the same value.
//!
//! # Deoptimization
//!
//! A promise body that may deoptimize is never inlined: a deopt inside a
//! spliced body would resume with a frame the interpreter does not expect.
//! Callers describe this through [`DeoptQuery`]; [`StructuralDeoptQuery`]
//! answers from the body's effects.

pub mod analysis;
pub mod config;
pub mod force_dominance;
pub mod graph;
pub mod inline;
pub mod ir;

use std::sync::Once;

pub use analysis::{AbstractResult, AbstractState, Analysis, StaticAnalysis};
pub use config::{InlinerConfig, MAX_SIZE_VAR};
pub use force_dominance::{
    DeoptCache, DeoptQuery, ForceDominanceAnalysis, ForceRecord, ForcedBy, PromiseInlineable,
    StructuralDeoptQuery,
};
pub use inline::{force_dominance, InlineStats};
pub use ir::{
    Block, BlockId, Body, ClosureVersion, Effects, Instr, InstrId, InstrKind, PrimOp, Promise,
    PromiseId, Properties, Terminator, Type,
};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for debug output.
///
/// Call this once at startup. Safe to call multiple times.
/// Enable with `RUST_LOG=thunk_opt=debug` or `RUST_LOG=thunk_opt=trace`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        // Only initialize if RUST_LOG is set
        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_level(true))
                .with(filter)
                .init();
        }
    });
}

#[cfg(test)]
mod test_helpers;
