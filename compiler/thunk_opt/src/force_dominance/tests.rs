#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::cell::Cell;

use pretty_assertions::assert_eq;
use proptest::collection::vec;
use proptest::prelude::*;

use crate::analysis::StaticAnalysis;
use crate::ir::{Body, Effects, Instr, InstrId, Promise, PromiseId, Terminator};
use crate::test_helpers::{i, pure_promise};

use super::*;

fn run(body: &Body, arg_count: u32) -> StaticAnalysis<'_, ForceDominanceAnalysis> {
    StaticAnalysis::run(ForceDominanceAnalysis::new(arg_count), body)
}

/// Entry block with `env = LdFunctionEnv; v = MkArg(p0, env)`.
fn with_promise() -> (Body, InstrId) {
    let mut body = Body::new();
    let entry = body.entry;
    let env = body.append(entry, Instr::ld_function_env());
    let v = body.append(entry, Instr::mk_arg(PromiseId::new(0), None, env));
    (body, v)
}

// ── Transfer rules ──────────────────────────────────────────

#[test]
fn single_force_dominates() {
    let (mut body, v) = with_promise();
    let f = body.append(body.entry, Instr::force(v, None));
    body.set_terminator(body.entry, Terminator::Return { value: f });

    let analysis = run(&body, 0);
    let before = analysis.before(f).unwrap();
    assert!(before.in_scope.contains(&v));
    assert_eq!(before.record(v), None);
    assert_eq!(
        analysis.after(f).unwrap().record(v),
        Some(ForceRecord::ForcedBy(f))
    );

    let at_exit = analysis.result_ignoring_unreachable_exits(f).unwrap();
    assert!(at_exit.is_dominating_force(&body, f));
}

#[test]
fn second_force_is_dominated_by_first() {
    let (mut body, v) = with_promise();
    let entry = body.entry;
    let f1 = body.append(entry, Instr::force(v, None));
    let cast = body.append(entry, Instr::cast(v, crate::ir::Type::LAZY));
    let f2 = body.append(entry, Instr::force(cast, None));
    let sum = body.append(
        entry,
        Instr::prim(crate::ir::PrimOp::Add, vec![f1, f2]),
    );
    body.set_terminator(entry, Terminator::Return { value: sum });

    let analysis = run(&body, 0);
    let state = analysis.result_ignoring_unreachable_exits(f2).unwrap();
    assert!(state.is_dominating_force(&body, f1));
    assert!(!state.is_dominating_force(&body, f2));
    assert_eq!(state.dominating_force_of(&body, f2), Some(f1));
}

#[test]
fn force_on_one_branch_is_ambiguous_at_join() {
    let (mut body, v) = with_promise();
    let b0 = body.entry;
    let b1 = body.add_block();
    let b2 = body.add_block();
    let b3 = body.add_block();
    let c = body.append(b0, Instr::ld_arg(0));
    body.set_terminator(
        b0,
        Terminator::Branch {
            cond: c,
            then_block: b1,
            else_block: b2,
        },
    );
    let r1 = body.append(b1, Instr::force(v, None));
    body.set_terminator(b1, Terminator::Jump { target: b3 });
    body.set_terminator(b2, Terminator::Jump { target: b3 });
    let r2 = body.append(b3, Instr::force(v, None));
    body.set_terminator(b3, Terminator::Return { value: r2 });

    let analysis = run(&body, 1);
    assert_eq!(
        analysis.before(r2).unwrap().record(v),
        Some(ForceRecord::Ambiguous)
    );
    for f in [r1, r2] {
        let state = analysis.result_ignoring_unreachable_exits(f).unwrap();
        assert!(!state.is_dominating_force(&body, f));
        assert_eq!(state.dominating_force_of(&body, f), None);
    }
}

#[test]
fn escape_then_forcing_effect_is_ambiguous() {
    let (mut body, v) = with_promise();
    let entry = body.entry;
    let log = body.append(entry, Instr::call(0, vec![v], Effects::VISIBLE));
    let opaque = body.append(entry, Instr::call(1, vec![], Effects::FORCE));
    let f = body.append(entry, Instr::force(v, None));
    body.set_terminator(entry, Terminator::Return { value: f });

    let analysis = run(&body, 0);
    let after_log = analysis.after(log).unwrap();
    assert!(after_log.escaped.contains(&v));
    assert_eq!(after_log.record(v), None);

    assert_eq!(
        analysis.after(opaque).unwrap().record(v),
        Some(ForceRecord::Ambiguous)
    );
    assert_eq!(
        analysis.after(f).unwrap().record(v),
        Some(ForceRecord::Ambiguous)
    );
}

#[test]
fn escaped_but_never_side_effected_stays_inlineable_with_update() {
    let (mut body, v) = with_promise();
    let entry = body.entry;
    body.append(entry, Instr::call(0, vec![v], Effects::VISIBLE));
    let f = body.append(entry, Instr::force(v, None));
    body.set_terminator(entry, Terminator::Return { value: f });

    let analysis = run(&body, 0);
    let state = analysis.after(f).unwrap();
    assert_eq!(state.record(v), Some(ForceRecord::ForcedBy(f)));

    let promise = Promise {
        id: PromiseId::new(0),
        body: pure_promise(1),
    };
    let mut cache = DeoptCache::new();
    assert_eq!(
        state.is_safe_to_inline(v, &promise, &mut cache, &StructuralDeoptQuery),
        PromiseInlineable::SafeToInlineWithUpdate
    );
}

#[test]
fn stub_environment_does_not_escape() {
    let (mut body, v) = with_promise();
    let entry = body.entry;
    let stub = body.append(entry, Instr::mk_env_stub(None, vec![v]));
    let env = body.append(entry, Instr::mk_env(None, vec![v], false));
    body.set_terminator(entry, Terminator::Return { value: env });

    let analysis = run(&body, 0);
    assert!(!analysis.after(stub).unwrap().escaped.contains(&v));
    assert!(analysis.after(env).unwrap().escaped.contains(&v));
}

#[test]
fn forced_value_does_not_escape() {
    let (mut body, v) = with_promise();
    let entry = body.entry;
    let f = body.append(entry, Instr::force(v, None));
    let call = body.append(entry, Instr::call(0, vec![v], Effects::opaque()));
    body.set_terminator(entry, Terminator::Return { value: f });

    let state = run(&body, 0).after(call).unwrap();
    assert!(!state.escaped.contains(&v));
    assert_eq!(state.record(v), Some(ForceRecord::ForcedBy(f)));
}

#[test]
fn redeclaration_in_loop_clears_record() {
    let mut body = Body::new();
    let env = body.append(body.entry, Instr::ld_function_env());
    let c = body.append(body.entry, Instr::ld_arg(0));
    let head = body.add_block();
    let exit = body.add_block();
    body.set_terminator(body.entry, Terminator::Jump { target: head });
    let v = body.append(head, Instr::mk_arg(PromiseId::new(0), None, env));
    let f = body.append(head, Instr::force(v, None));
    body.set_terminator(
        head,
        Terminator::Branch {
            cond: c,
            then_block: head,
            else_block: exit,
        },
    );
    body.set_terminator(exit, Terminator::Return { value: f });

    let analysis = run(&body, 1);
    assert_eq!(analysis.before(f).unwrap().record(v), None);
    assert!(analysis
        .result_ignoring_unreachable_exits(f)
        .unwrap()
        .is_dominating_force(&body, f));
}

// ── Argument force order ────────────────────────────────────

fn force_args(order: &[u32], effect_first: bool) -> Body {
    let mut body = Body::new();
    let entry = body.entry;
    let args: Vec<_> = (0..3).map(|n| body.append(entry, Instr::ld_arg(n))).collect();
    if effect_first {
        body.append(entry, Instr::call(9, vec![], Effects::VISIBLE));
    }
    let mut last = args[0];
    for &n in order {
        last = body.append(entry, Instr::force(args[n as usize], None));
    }
    body.set_terminator(entry, Terminator::Return { value: last });
    body
}

#[test]
fn in_order_forcing_is_eager_like() {
    let body = force_args(&[0, 1, 2, 1], false);
    let result = run(&body, 3).result();

    assert_eq!(result.argument_force_order, vec![0, 1, 2]);
    assert!(!result.ambiguous_force_order);
    assert!(result.eager_like_function(3));
    assert!(result.maybe_forced(2));
}

#[test]
fn out_of_order_forcing_is_recorded_but_not_eager() {
    let body = force_args(&[1, 0], false);
    let result = run(&body, 3).result();

    assert_eq!(result.argument_force_order, vec![1, 0]);
    assert!(!result.eager_like_function(3));
    assert!(!result.eager_like_function(2));
    assert!(!result.maybe_forced(2));
}

#[test]
fn visible_effect_before_forcing_makes_order_unreliable() {
    let body = force_args(&[0, 1, 2], true);
    let result = run(&body, 3).result();

    assert!(result.ambiguous_force_order);
    assert!(result.argument_force_order.is_empty());
    assert!(!result.eager_like_function(3));
    assert!(result.maybe_forced(1));
}

#[test]
fn zero_arguments_are_trivially_eager() {
    let body = force_args(&[], true);
    assert!(run(&body, 0).result().eager_like_function(0));
}

// ── Merging ─────────────────────────────────────────────────

fn ordered(order: &[u32]) -> ForcedBy {
    ForcedBy {
        argument_force_order: order.to_vec(),
        ..ForcedBy::default()
    }
}

#[test]
fn order_prefix_law() {
    let mut a = ordered(&[0, 1, 2]);
    a.merge(&ordered(&[0, 1, 3]));
    assert_eq!(a.argument_force_order, vec![0, 1]);
    assert!(a.ambiguous_force_order);
}

#[test]
fn order_length_mismatch_is_unreliable() {
    let mut a = ordered(&[0]);
    assert_eq!(a.merge(&ordered(&[0, 1])), AbstractResult::Updated);
    assert_eq!(a.argument_force_order, vec![0]);
    assert!(a.ambiguous_force_order);

    // Nothing left to lose.
    assert_eq!(a.merge(&ordered(&[0, 1])), AbstractResult::None);
}

#[test]
fn different_forcers_become_ambiguous() {
    let v = i(0);
    let mut a = ForcedBy::default();
    a.forced_at(v, i(10));
    let mut b = ForcedBy::default();
    b.forced_at(v, i(11));

    assert_eq!(a.merge_exit(&b), AbstractResult::LostPrecision);
    assert_eq!(a.record(v), Some(ForceRecord::Ambiguous));
}

#[test]
fn exit_merge_tolerates_unforced_paths() {
    let v = i(0);
    let mut a = ForcedBy::default();
    a.declare(v);
    a.forced_at(v, i(10));
    let mut b = ForcedBy::default();
    b.declare(v);

    let mut strict = a.clone();
    strict.merge(&b);
    assert_eq!(strict.record(v), Some(ForceRecord::Ambiguous));

    a.merge_exit(&b);
    assert_eq!(a.record(v), Some(ForceRecord::ForcedBy(i(10))));
}

// ── Deopt cache ─────────────────────────────────────────────

struct CountingQuery {
    calls: Cell<usize>,
    answer: bool,
}

impl DeoptQuery for CountingQuery {
    fn may_deoptimize(&self, _promise: &Promise) -> bool {
        self.calls.set(self.calls.get() + 1);
        self.answer
    }
}

#[test]
fn deopt_answer_cached_per_template() {
    let oracle = CountingQuery {
        calls: Cell::new(0),
        answer: true,
    };
    let promise = Promise {
        id: PromiseId::new(3),
        body: pure_promise(0),
    };
    let state = ForcedBy::default();
    let mut cache = DeoptCache::new();

    for _ in 0..3 {
        assert_eq!(
            state.is_safe_to_inline(i(0), &promise, &mut cache, &oracle),
            PromiseInlineable::NotSafeToInline
        );
    }
    assert_eq!(oracle.calls.get(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn structural_query_finds_deopts() {
    let mut body = pure_promise(0);
    let id = PromiseId::new(0);
    assert!(!StructuralDeoptQuery.may_deoptimize(&Promise {
        id,
        body: body.clone()
    }));

    let entry = body.entry;
    body.append(
        entry,
        Instr::call(0, vec![], Effects::DEOPT | Effects::VISIBLE),
    );
    assert!(StructuralDeoptQuery.may_deoptimize(&Promise { id, body }));
}

// ── Lattice laws ────────────────────────────────────────────

const UNIVERSE: u32 = 4;

fn record() -> impl Strategy<Value = Option<ForceRecord>> {
    prop_oneof![
        Just(None),
        (10u32..13).prop_map(|f| Some(ForceRecord::ForcedBy(i(f)))),
        Just(Some(ForceRecord::Ambiguous)),
    ]
}

fn state() -> impl Strategy<Value = ForcedBy> {
    let n = UNIVERSE as usize;
    (
        vec(record(), n),
        vec(any::<bool>(), n),
        vec(any::<bool>(), n),
        vec(0..UNIVERSE, 0..n),
        any::<bool>(),
    )
        .prop_map(|(records, scope, escaped, order, ambiguous)| {
            let mut s = ForcedBy::default();
            for v in 0..UNIVERSE {
                let idx = v as usize;
                let id = i(v);
                if scope[idx] || records[idx].is_some() {
                    s.in_scope.insert(id);
                }
                if let Some(r) = records[idx] {
                    s.forced_by.insert(id, r);
                }
                if escaped[idx] {
                    s.escaped.insert(id);
                }
            }
            for o in order {
                if !s.argument_force_order.contains(&o) {
                    s.argument_force_order.push(o);
                }
            }
            s.ambiguous_force_order = ambiguous;
            s
        })
}

fn ambiguous_values(s: &ForcedBy) -> Vec<InstrId> {
    let mut v: Vec<_> = s
        .forced_by
        .iter()
        .filter(|(_, r)| **r == ForceRecord::Ambiguous)
        .map(|(k, _)| *k)
        .collect();
    v.sort();
    v
}

proptest! {
    #[test]
    fn merge_never_unambiguates(a in state(), b in state()) {
        for strict in [true, false] {
            let mut merged = a.clone();
            if strict {
                merged.merge(&b);
            } else {
                merged.merge_exit(&b);
            }
            for v in ambiguous_values(&a).into_iter().chain(ambiguous_values(&b)) {
                prop_assert_eq!(merged.record(v), Some(ForceRecord::Ambiguous));
            }
            prop_assert!(merged.ambiguous_force_order || !a.ambiguous_force_order);
            prop_assert!(merged.escaped.is_superset(&a.escaped));
            prop_assert!(merged.escaped.is_superset(&b.escaped));
        }
    }

    #[test]
    fn merged_order_is_common_prefix(a in state(), b in state()) {
        let mut merged = a.clone();
        merged.merge(&b);
        let order = &merged.argument_force_order;
        prop_assert!(a.argument_force_order.starts_with(order));
        prop_assert!(b.argument_force_order.starts_with(order));
        if a.argument_force_order != b.argument_force_order {
            prop_assert!(merged.ambiguous_force_order);
        }
    }

    #[test]
    fn merge_is_idempotent(a in state()) {
        let mut merged = a.clone();
        prop_assert_eq!(merged.merge(&a), AbstractResult::None);
        prop_assert_eq!(merged, a);
    }
}
