//! Promise inlining and redundant-force elimination.
//!
//! Driven by [`ForceDominanceAnalysis`]. Rewrites, in order:
//!
//! 0. **Plan** (analysis alive, IR read-only): classify every force on the
//!    no-deopt path as dominating (and possibly inlineable) or dominated by
//!    another force; find `UpdatePromise`s on values that never escaped.
//!    Every decision that can fail is taken here, so the rewrites below
//!    cannot leave a unit half transformed.
//! 1. **Inline dominating forces**: splice the promise body in at the force,
//!    merge its exits into one result, and leave an eager `MkArg` behind
//!    that carries the result. Forces and casts of eager `MkArg`s collapse
//!    to the eager value.
//! 2. **Elide dominated forces**: reuse the dominating force's result.
//! 3. **Reroute dominated uses** of an inlined `MkArg` to its eager twin.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::StaticAnalysis;
use crate::config::InlinerConfig;
use crate::force_dominance::{DeoptCache, DeoptQuery, ForceDominanceAnalysis, PromiseInlineable};
use crate::graph::{
    clone_body, inline_exits, no_deopt_blocks, returns, split_block, DominatorTree,
};
use crate::ir::{BlockId, Body, ClosureVersion, Instr, InstrId, InstrKind, Promise, Terminator};

/// What one run of [`force_dominance`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InlineStats {
    /// Promise bodies spliced in.
    pub inlined: usize,
    /// Forces (and casts) of eager values replaced by the value.
    pub eager_collapsed: usize,
    /// Forces replaced by a dominating force's result.
    pub dominated: usize,
    /// `UpdatePromise`s on values that never escaped.
    pub dead_updates: usize,
    /// Operands rerouted to an inlined value's eager `MkArg`.
    pub rerouted_uses: usize,
}

/// Decisions taken while the analysis is alive.
#[derive(Debug, Default)]
struct ForcePlan {
    to_inline: FxHashSet<InstrId>,
    needs_update: FxHashSet<InstrId>,
    dominated_by: FxHashMap<InstrId, InstrId>,
    strict: Vec<InstrId>,
    dead_updates: Vec<InstrId>,
    is_eager: bool,
    argument_force_order: Vec<u32>,
}

/// Bookkeeping of pass 1 consumed by passes 2 and 3.
#[derive(Debug, Default)]
struct Rewrites {
    /// Inlined force → promise result.
    inlined: FxHashMap<InstrId, InstrId>,
    /// Removed force → value now standing in for it.
    replaced: FxHashMap<InstrId, InstrId>,
    /// Original `MkArg` → eager `MkArg` inserted after inlining.
    fixed: Vec<(InstrId, InstrId)>,
}

/// Eliminate redundant forces in `unit` and inline the promises whose
/// force is dominating.
///
/// Also records on `unit.properties` whether every argument is forced in
/// order up front, and the argument force order.
pub fn force_dominance(
    unit: &mut ClosureVersion,
    config: &InlinerConfig,
    oracle: &dyn DeoptQuery,
) -> InlineStats {
    let plan = plan(unit, config, oracle);
    let mut stats = InlineStats::default();

    unit.properties.is_eager = plan.is_eager;
    unit.properties.argument_force_order = plan.argument_force_order.clone();
    for &force in &plan.strict {
        if let InstrKind::Force { strict, .. } = &mut unit.body.instr_mut(force).kind {
            *strict = true;
        }
    }
    for &update in &plan.dead_updates {
        if unit.body.remove_instr(update) {
            stats.dead_updates += 1;
        }
    }

    let mut rewrites = Rewrites::default();
    inline_dominating(unit, &plan, &mut rewrites, &mut stats);
    elide_dominated(&mut unit.body, &plan, &mut rewrites, &mut stats);
    reroute_dominated_uses(&mut unit.body, &rewrites, &mut stats);

    tracing::debug!(
        unit = %unit.name,
        inlined = stats.inlined,
        eager = stats.eager_collapsed,
        dominated = stats.dominated,
        dead_updates = stats.dead_updates,
        rerouted = stats.rerouted_uses,
        is_eager = unit.properties.is_eager,
        "force dominance done"
    );
    stats
}

// ── Plan ────────────────────────────────────────────────────────────

fn plan(unit: &ClosureVersion, config: &InlinerConfig, oracle: &dyn DeoptQuery) -> ForcePlan {
    let body = &unit.body;
    let analysis = StaticAnalysis::run(ForceDominanceAnalysis::new(unit.arg_count), body);
    let result = analysis.result();
    let mut plan = ForcePlan {
        is_eager: result.eager_like_function(unit.arg_count),
        argument_force_order: result.argument_force_order,
        ..ForcePlan::default()
    };
    let mut cache = DeoptCache::new();

    for block in no_deopt_blocks(body) {
        for &instr in &body.block(block).body {
            match &body.instr(instr).kind {
                InstrKind::Force { .. } => {
                    let Some(state) = analysis.result_ignoring_unreachable_exits(instr) else {
                        continue;
                    };
                    if state.is_dominating_force(body, instr) {
                        plan.strict.push(instr);
                        let Some(after) = analysis.after(instr) else {
                            continue;
                        };
                        let target = body.follow_casts_and_force(instr);
                        match inline_candidate(unit, config, target) {
                            Some(promise) => {
                                match after.is_safe_to_inline(target, promise, &mut cache, oracle)
                                {
                                    PromiseInlineable::SafeToInline => {
                                        plan.to_inline.insert(instr);
                                    }
                                    PromiseInlineable::SafeToInlineWithUpdate => {
                                        plan.to_inline.insert(instr);
                                        plan.needs_update.insert(instr);
                                    }
                                    PromiseInlineable::NotSafeToInline => {
                                        tracing::trace!(
                                            force = instr.raw(),
                                            "promise may deoptimize, not inlined"
                                        );
                                    }
                                }
                            }
                            None => {
                                tracing::trace!(force = instr.raw(), "force not inlineable");
                            }
                        }
                    } else if let Some(dom) = state.dominating_force_of(body, instr) {
                        plan.dominated_by.insert(instr, dom);
                    }
                }
                InstrKind::UpdatePromise { promise, .. } => {
                    let is_mk_arg = matches!(body.instr(*promise).kind, InstrKind::MkArg { .. });
                    let escaped = analysis
                        .before(instr)
                        .map_or(true, |s| s.escaped.contains(promise));
                    if is_mk_arg && !escaped {
                        plan.dead_updates.push(instr);
                    }
                }
                _ => {}
            }
        }
    }

    tracing::debug!(
        unit = %unit.name,
        iterations = analysis.iterations(),
        to_inline = plan.to_inline.len(),
        dominated = plan.dominated_by.len(),
        deopt_queries = cache.len(),
        "force dominance planned"
    );
    plan
}

/// The promise behind `target` if it passes every structural gate.
fn inline_candidate<'u>(
    unit: &'u ClosureVersion,
    config: &InlinerConfig,
    target: InstrId,
) -> Option<&'u Promise> {
    let InstrKind::MkArg {
        promise,
        eager: None,
        ..
    } = unit.body.instr(target).kind
    else {
        return None;
    };
    let promise = unit.promises.get(promise.index())?;
    if !config.admits(unit.size(), promise.size()) {
        return None;
    }
    let body = &promise.body;
    let starts_with_env = body
        .block(body.entry)
        .body
        .first()
        .is_some_and(|&i| matches!(body.instr(i).kind, InstrKind::LdFunctionEnv));
    (starts_with_env && returns(body)).then_some(promise)
}

// ── Pass 1: inline dominating forces ────────────────────────────────

fn inline_dominating(
    unit: &mut ClosureVersion,
    plan: &ForcePlan,
    rewrites: &mut Rewrites,
    stats: &mut InlineStats,
) {
    let ClosureVersion { body, promises, .. } = unit;
    let mut visited = FxHashSet::default();
    let mut worklist = vec![body.entry];

    while let Some(block) = worklist.pop() {
        if !visited.insert(block) {
            continue;
        }

        let mut pos = 0;
        while pos < body.block(block).body.len() {
            let instr = body.block(block).body[pos];
            match body.instr(instr).kind {
                InstrKind::Force { .. } => {
                    let target = body.follow_casts_and_force(instr);
                    match body.instr(target).kind {
                        InstrKind::MkArg {
                            eager: Some(value), ..
                        } => {
                            body.replace_uses_with(instr, value);
                            body.remove(block, pos);
                            rewrites.replaced.insert(instr, value);
                            stats.eager_collapsed += 1;
                            continue;
                        }
                        InstrKind::MkArg { .. } if plan.to_inline.contains(&instr) => {
                            let needs_update = plan.needs_update.contains(&instr);
                            if let Some((result, fixed)) =
                                inline_force(body, promises, block, pos, target, needs_update)
                            {
                                rewrites.inlined.insert(instr, result);
                                rewrites.fixed.push((target, fixed));
                                stats.inlined += 1;
                            }
                            // The rest of the block moved to the continuation,
                            // reached through the successors below.
                            break;
                        }
                        _ => {}
                    }
                }
                InstrKind::CastType { value } => {
                    if let InstrKind::MkArg {
                        eager: Some(eager), ..
                    } = body.instr(value).kind
                    {
                        body.replace_uses_with(instr, eager);
                        body.remove(block, pos);
                        rewrites.replaced.insert(instr, eager);
                        stats.eager_collapsed += 1;
                        continue;
                    }
                }
                _ => {}
            }
            pos += 1;
        }

        for succ in body.block(block).terminator.successors() {
            if !visited.contains(&succ) {
                worklist.push(succ);
            }
        }
    }
}

/// Splice the promise of `mk` in place of the force at `pos` of `block`.
///
/// Returns the promise result and the eager `MkArg` inserted after it.
fn inline_force(
    body: &mut Body,
    promises: &[Promise],
    block: BlockId,
    pos: usize,
    mk: InstrId,
    needs_update: bool,
) -> Option<(InstrId, InstrId)> {
    let force = body.block(block).body[pos];
    let InstrKind::Force { env: force_env, .. } = body.instr(force).kind else {
        return None;
    };
    let InstrKind::MkArg { promise, env, .. } = body.instr(mk).kind else {
        return None;
    };
    let template = promises.get(promise.index())?;
    if !returns(&template.body) {
        return None;
    }

    let cont = split_block(body, block, pos);
    let region = clone_body(&template.body, body);
    body.set_terminator(
        block,
        Terminator::Jump {
            target: region.entry,
        },
    );

    // The copy runs in the environment the promise closed over.
    if let Some(&first) = body.block(region.entry).body.first() {
        if matches!(body.instr(first).kind, InstrKind::LdFunctionEnv) {
            body.replace_uses_with(first, env);
            body.remove(region.entry, 0);
        }
    }

    // Forces in the copy may share a context environment with the caller.
    if let Some(caller_env) = force_env {
        let is_context = matches!(
            body.instr(body.follow_casts(caller_env)).kind,
            InstrKind::MkEnv { context: true, .. }
        );
        if is_context {
            for &copied in &region.order {
                for idx in 0..body.block(copied).body.len() {
                    let id = body.block(copied).body[idx];
                    if let InstrKind::Force { env: Some(e), .. } = &mut body.instr_mut(id).kind {
                        *e = caller_env;
                    }
                }
            }
        }
    }

    let Some(result) = inline_exits(body, &region, cont) else {
        unreachable!("clone_body copies every block `returns` inspects");
    };
    debug_assert!(
        !body.instr(result).ty.maybe_promise_wrapped(),
        "promise result is still promise wrapped"
    );

    body.replace_uses_with(force, result);
    body.remove(cont, 0);
    let fixed = body.insert(cont, 0, Instr::mk_arg(promise, Some(result), env));
    if needs_update {
        body.insert(cont, 1, Instr::update_promise(mk, result));
    }

    tracing::trace!(
        force = force.raw(),
        promise = promise.index(),
        blocks = region.order.len(),
        exits = region.exits.len(),
        needs_update,
        "inlined promise"
    );
    Some((result, fixed))
}

// ── Pass 2: elide dominated forces ──────────────────────────────────

fn elide_dominated(
    body: &mut Body,
    plan: &ForcePlan,
    rewrites: &mut Rewrites,
    stats: &mut InlineStats,
) {
    let dominated: Vec<(InstrId, InstrId)> = body
        .placed()
        .filter_map(|(_, i)| plan.dominated_by.get(&i).map(|&dom| (i, dom)))
        .collect();

    for (force, dom) in dominated {
        let replacement = resolve(rewrites, dom);
        body.replace_uses_with(force, replacement);
        body.remove_instr(force);
        rewrites.replaced.insert(force, replacement);
        stats.dominated += 1;
        tracing::trace!(
            force = force.raw(),
            by = replacement.raw(),
            "dominated force elided"
        );
    }
}

/// Follow inlining results and earlier replacements from `value`.
fn resolve(rewrites: &Rewrites, mut value: InstrId) -> InstrId {
    let bound = rewrites.inlined.len() + rewrites.replaced.len();
    for _ in 0..=bound {
        match rewrites
            .inlined
            .get(&value)
            .or_else(|| rewrites.replaced.get(&value))
        {
            Some(&next) if next != value => value = next,
            _ => break,
        }
    }
    value
}

// ── Pass 3: reroute dominated uses ──────────────────────────────────

fn reroute_dominated_uses(body: &mut Body, rewrites: &Rewrites, stats: &mut InlineStats) {
    if rewrites.fixed.is_empty() {
        return;
    }
    let dom = DominatorTree::build(body);
    let positions = body.positions();

    for &(mk, fixed) in &rewrites.fixed {
        let Some(&(fixed_block, fixed_pos)) = positions.get(&fixed) else {
            continue;
        };
        // Casts of `mk` stand for it too.
        let aliases: FxHashSet<InstrId> = positions
            .keys()
            .copied()
            .filter(|&v| body.follow_casts(v) == mk)
            .collect();
        let sees_fixed = |block: BlockId, pos: usize| {
            if block == fixed_block {
                pos > fixed_pos
            } else {
                dom.dominates(fixed_block, block)
            }
        };

        for b in 0..body.blocks.len() {
            let block = body.blocks[b].id;
            for pos in 0..body.blocks[b].body.len() {
                let id = body.blocks[b].body[pos];
                // The update publishing the result keeps the original value.
                let publishes = matches!(
                    body.instr(id).kind,
                    InstrKind::UpdatePromise { promise, .. } if aliases.contains(&promise)
                );
                if id == fixed || publishes {
                    continue;
                }

                let instr = body.instr_mut(id);
                if let InstrKind::Phi { inputs } = &mut instr.kind {
                    for (pred, value) in inputs.iter_mut() {
                        if aliases.contains(&*value) && dom.dominates(fixed_block, *pred) {
                            *value = fixed;
                            stats.rerouted_uses += 1;
                        }
                    }
                } else if sees_fixed(block, pos) {
                    instr.map_operands(|v| {
                        if aliases.contains(&*v) {
                            *v = fixed;
                            stats.rerouted_uses += 1;
                        }
                    });
                }
            }

            if sees_fixed(block, usize::MAX) {
                let terminator = &mut body.blocks[b].terminator;
                for used in terminator.operands() {
                    if aliases.contains(&used) {
                        terminator.substitute(used, fixed);
                        stats.rerouted_uses += 1;
                    }
                }
            }
        }
    }
}
