use pretty_assertions::assert_eq;

use crate::test_helpers::{b, i};

use super::*;

#[test]
fn body_starts_with_empty_entry() {
    let body = Body::new();
    assert_eq!(body.entry, b(0));
    assert_eq!(body.blocks.len(), 1);
    assert_eq!(body.block(b(0)).terminator, Terminator::Unreachable);
    assert_eq!(body.size(), 0);
}

#[test]
fn append_and_insert_keep_ids_stable() {
    let mut body = Body::new();
    let entry = body.entry;
    let c1 = body.append(entry, Instr::ld_const(1));
    let c3 = body.append(entry, Instr::ld_const(3));
    let c2 = body.insert(entry, 1, Instr::ld_const(2));

    assert_eq!(body.block(entry).body, vec![c1, c2, c3]);
    assert_eq!((c1, c2, c3), (i(0), i(2), i(1)));
    assert_eq!(body.position_of(c3), Some((entry, 2)));
}

#[test]
fn removed_instr_keeps_arena_slot() {
    let mut body = Body::new();
    let entry = body.entry;
    let a = body.append(entry, Instr::ld_const(1));
    let c = body.append(entry, Instr::ld_const(2));

    assert!(body.remove_instr(a));
    assert!(!body.remove_instr(a));
    assert_eq!(body.size(), 1);
    assert_eq!(body.instrs.len(), 2);
    assert_eq!(body.instr(a).kind, InstrKind::LdConst { value: 1 });
    assert_eq!(body.position_of(c), Some((entry, 0)));
}

#[test]
fn operands_in_order() {
    let env = i(0);
    let mk = Instr::mk_arg(PromiseId::new(0), Some(i(5)), env);
    assert_eq!(mk.operands().as_slice(), &[i(5), env]);

    let f = Instr::force(i(1), Some(env));
    assert_eq!(f.operands().as_slice(), &[i(1), env]);

    let e = Instr::mk_env(Some(env), vec![i(2), i(3)], false);
    assert_eq!(e.operands().as_slice(), &[env, i(2), i(3)]);

    let phi = Instr::phi(vec![(b(1), i(7)), (b(2), i(8))], Type::VALUE);
    assert_eq!(phi.operands().as_slice(), &[i(7), i(8)]);
}

#[test]
fn substitute_rewrites_every_slot() {
    let mut up = Instr::update_promise(i(1), i(1));
    up.substitute(i(1), i(9));
    assert_eq!(
        up.kind,
        InstrKind::UpdatePromise {
            promise: i(9),
            value: i(9)
        }
    );

    let mut term = Terminator::Return { value: i(1) };
    term.substitute(i(2), i(3));
    assert_eq!(term, Terminator::Return { value: i(1) });
    term.substitute(i(1), i(3));
    assert_eq!(term, Terminator::Return { value: i(3) });
}

#[test]
fn follow_casts_and_forces() {
    let mut body = Body::new();
    let entry = body.entry;
    let arg = body.append(entry, Instr::ld_arg(0));
    let cast = body.append(entry, Instr::cast(arg, Type::LAZY));
    let f = body.append(entry, Instr::force(cast, None));
    let cast2 = body.append(entry, Instr::cast(f, Type::VALUE));

    assert_eq!(body.follow_casts(cast2), f);
    assert_eq!(body.follow_casts_and_force(cast2), arg);
}

#[test]
fn replace_uses_reaches_terminators() {
    let mut body = Body::new();
    let entry = body.entry;
    let a = body.append(entry, Instr::ld_const(1));
    let c = body.append(entry, Instr::ld_const(2));
    let sum = body.append(entry, Instr::prim(PrimOp::Add, vec![a, a]));
    body.set_terminator(entry, Terminator::Return { value: a });

    body.replace_uses_with(a, c);

    assert_eq!(
        body.instr(sum).kind,
        InstrKind::PrimOp {
            op: PrimOp::Add,
            args: vec![c, c]
        }
    );
    assert_eq!(body.block(entry).terminator, Terminator::Return { value: c });
    assert!(!body.has_uses(a));
    assert!(body.has_uses(c));
}

#[test]
fn checkpoint_successors() {
    let t = Terminator::Checkpoint {
        normal: b(1),
        deopt: b(2),
    };
    assert_eq!(t.successors().as_slice(), &[b(1), b(2)]);
    assert!(!t.is_exit());
    assert!(Terminator::Deopt.is_exit());
}

#[test]
fn type_and_effect_queries() {
    assert!(Instr::ld_arg(0).ty.maybe_lazy());
    assert!(!Instr::ld_const(0).ty.maybe_lazy());
    assert!(Instr::force(i(0), None).effects.contains(Effects::FORCE));
    assert!(Instr::mk_arg(PromiseId::new(0), None, i(0)).effects.is_empty());
    assert!(!Type::VALUE.maybe_promise_wrapped());
}

#[test]
fn closure_size_counts_main_body() {
    let mut cv = ClosureVersion::new("f", 1);
    let mut prom = Body::new();
    let pe = prom.entry;
    prom.append(pe, Instr::ld_function_env());
    let p = cv.add_promise(prom);
    let entry = cv.entry();
    let env = cv.body.append(entry, Instr::ld_function_env());
    cv.body.append(entry, Instr::mk_arg(p, None, env));

    assert_eq!(cv.size(), 2);
    assert_eq!(cv.promise(p).size(), 1);
    assert_eq!(cv.promise(p).id, p);
}
