//! CFG utilities shared by the analysis framework and the transforms.
//!
//! Traversals, dominance, and the structural rewrites inlining needs:
//! splitting a block, cloning a body into another, and joining the exits of
//! a cloned region back into the caller.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::ir::{BlockId, Body, Instr, InstrId, InstrKind, Terminator, Type};

/// Compute the predecessor list for each block (deduplicated).
///
/// Returns a vector indexed by block index.
pub fn compute_predecessors(body: &Body) -> Vec<Vec<usize>> {
    let num_blocks = body.blocks.len();
    let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); num_blocks];

    for (block_idx, block) in body.blocks.iter().enumerate() {
        let mut seen = FxHashSet::default();
        for succ in block.terminator.successors() {
            let succ_idx = succ.index();
            if succ_idx < num_blocks && seen.insert(succ_idx) {
                predecessors[succ_idx].push(block_idx);
            }
        }
    }

    predecessors
}

/// Postorder from the entry over the edges `succs` yields.
///
/// Iterative DFS with an explicit stack. Only visits reachable blocks.
fn postorder_by<F>(body: &Body, start: BlockId, succs: F) -> Vec<usize>
where
    F: Fn(BlockId) -> SmallVec<[BlockId; 2]>,
{
    let num_blocks = body.blocks.len();
    let mut visited = vec![false; num_blocks];
    let mut postorder = Vec::with_capacity(num_blocks);

    // (block_index, children_processed)
    let mut stack: Vec<(usize, bool)> = vec![(start.index(), false)];

    while let Some(&mut (block_idx, ref mut children_done)) = stack.last_mut() {
        if *children_done {
            postorder.push(block_idx);
            stack.pop();
            continue;
        }

        *children_done = true;

        if block_idx >= num_blocks || visited[block_idx] {
            stack.pop();
            continue;
        }
        visited[block_idx] = true;

        // Reversed so successors are explored in terminator order.
        for succ in succs(body.blocks[block_idx].id).into_iter().rev() {
            let succ_idx = succ.index();
            if succ_idx < num_blocks && !visited[succ_idx] {
                stack.push((succ_idx, false));
            }
        }
    }

    postorder
}

/// Postorder of the blocks reachable from the entry.
pub fn compute_postorder(body: &Body) -> Vec<usize> {
    postorder_by(body, body.entry, |b| body.block(b).terminator.successors())
}

/// Reverse postorder of the blocks reachable from the entry.
pub fn reverse_postorder(body: &Body) -> Vec<BlockId> {
    compute_postorder(body)
        .into_iter()
        .rev()
        .map(|idx| body.blocks[idx].id)
        .collect()
}

/// Whether a block reachable from the entry ends in `Return`.
///
/// Exactly the blocks [`clone_body`] copies are inspected, so a body that
/// passes this check always yields a region with at least one exit.
pub fn returns(body: &Body) -> bool {
    compute_postorder(body)
        .into_iter()
        .any(|idx| matches!(body.blocks[idx].terminator, Terminator::Return { .. }))
}

/// Successors of `block` minus the ones statically known to be dead.
///
/// A `Branch` whose condition is a constant only keeps the taken edge.
pub fn live_successors(body: &Body, block: BlockId) -> SmallVec<[BlockId; 2]> {
    let terminator = &body.block(block).terminator;
    if let Terminator::Branch {
        cond,
        then_block,
        else_block,
    } = terminator
    {
        if let InstrKind::LdConst { value } = body.instr(body.follow_casts(*cond)).kind {
            let taken = if value == 0 { *else_block } else { *then_block };
            return SmallVec::from_elem(taken, 1);
        }
    }
    terminator.successors()
}

/// Blocks reachable from `from` over live edges, `from` included.
pub fn live_reachable(body: &Body, from: BlockId) -> Vec<BlockId> {
    let mut postorder = postorder_by(body, from, |b| live_successors(body, b));
    postorder.reverse();
    postorder.into_iter().map(|idx| body.blocks[idx].id).collect()
}

/// Blocks reachable from the entry without taking a `Checkpoint`'s deopt
/// edge, in reverse postorder.
pub fn no_deopt_blocks(body: &Body) -> Vec<BlockId> {
    let mut postorder = postorder_by(body, body.entry, |b| {
        match body.block(b).terminator {
            Terminator::Checkpoint { normal, .. } => SmallVec::from_elem(normal, 1),
            ref t => t.successors(),
        }
    });
    postorder.reverse();
    postorder.into_iter().map(|idx| body.blocks[idx].id).collect()
}

// ── Dominance ───────────────────────────────────────────────────────

/// Dominator tree over a [`Body`].
///
/// Cooper-Harvey-Kennedy iterative algorithm on reverse postorder.
/// Unreachable blocks have no dominator and dominate nothing but
/// themselves.
///
/// Reference: Cooper, Harvey, Kennedy — "A Simple, Fast Dominance Algorithm" (2001)
pub struct DominatorTree {
    /// Immediate dominator for each block, indexed by block index.
    /// `idom[entry] == Some(entry)`, unreachable blocks are `None`.
    idom: Vec<Option<usize>>,
}

impl DominatorTree {
    pub fn build(body: &Body) -> Self {
        let n = body.blocks.len();
        if n == 0 {
            return Self { idom: vec![] };
        }

        let preds = compute_predecessors(body);
        let mut rpo = compute_postorder(body);
        rpo.reverse();

        let mut rpo_pos = vec![usize::MAX; n];
        for (pos, &block_idx) in rpo.iter().enumerate() {
            rpo_pos[block_idx] = pos;
        }

        let entry = body.entry.index();
        let mut idom: Vec<Option<usize>> = vec![None; n];
        idom[entry] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block_idx in rpo.iter().skip(1) {
                let mut processed = preds[block_idx]
                    .iter()
                    .copied()
                    .filter(|&p| idom[p].is_some());

                let Some(first) = processed.next() else {
                    continue;
                };
                let new_idom =
                    processed.fold(first, |acc, p| Self::intersect(p, acc, &idom, &rpo_pos));

                if idom[block_idx] != Some(new_idom) {
                    idom[block_idx] = Some(new_idom);
                    changed = true;
                }
            }
        }

        Self { idom }
    }

    /// Does block `a` dominate block `b`? A block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let a_idx = a.index();
        let mut current = b.index();
        loop {
            if current == a_idx {
                return true;
            }
            match self.idom.get(current).copied().flatten() {
                Some(dom) if dom != current => current = dom,
                _ => return false,
            }
        }
    }

    /// Immediate dominator of `block`, `None` for the entry and for
    /// unreachable blocks.
    pub fn immediate_dominator(&self, block: BlockId) -> Option<BlockId> {
        let idx = block.index();
        match self.idom.get(idx).copied().flatten() {
            Some(dom) if dom != idx => u32::try_from(dom).ok().map(BlockId::new),
            _ => None,
        }
    }

    /// CHK intersect: walk two fingers upward until they meet.
    fn intersect(mut a: usize, mut b: usize, idom: &[Option<usize>], rpo_pos: &[usize]) -> usize {
        while a != b {
            while rpo_pos[a] > rpo_pos[b] {
                let Some(next) = idom[a] else {
                    debug_assert!(false, "intersect: broken idom chain at {a}");
                    return a;
                };
                a = next;
            }
            while rpo_pos[b] > rpo_pos[a] {
                let Some(next) = idom[b] else {
                    debug_assert!(false, "intersect: broken idom chain at {b}");
                    return b;
                };
                b = next;
            }
        }
        a
    }
}

// ── Structural rewrites ─────────────────────────────────────────────

/// Split `block` before position `pos`.
///
/// Instructions `[pos..]` and the terminator move to a fresh block which the
/// original now jumps to. Phi inputs in the moved terminator's successors
/// are re-pointed at the new block. No other id changes.
pub fn split_block(body: &mut Body, block: BlockId, pos: usize) -> BlockId {
    let tail = body.add_block();
    let moved = body.blocks[block.index()].body.split_off(pos);
    let terminator = std::mem::replace(
        &mut body.blocks[block.index()].terminator,
        Terminator::Jump { target: tail },
    );

    for succ in terminator.successors() {
        let phis: Vec<InstrId> = body.block(succ).body.clone();
        for instr in phis {
            if let InstrKind::Phi { inputs } = &mut body.instr_mut(instr).kind {
                for (pred, _) in inputs.iter_mut() {
                    if *pred == block {
                        *pred = tail;
                    }
                }
            }
        }
    }

    let tail_block = &mut body.blocks[tail.index()];
    tail_block.body = moved;
    tail_block.terminator = terminator;
    tail
}

/// A copy of a body placed into another one by [`clone_body`].
#[derive(Clone, Debug)]
pub struct ClonedRegion {
    /// Copy of the source entry block.
    pub entry: BlockId,
    /// Source block → copy.
    pub blocks: FxHashMap<BlockId, BlockId>,
    /// Source instruction → copy.
    pub values: FxHashMap<InstrId, InstrId>,
    /// Copied blocks, in source reverse postorder.
    pub order: Vec<BlockId>,
    /// Copied blocks ending in `Return`, with the (copied) returned value.
    pub exits: Vec<(BlockId, InstrId)>,
}

/// Copy every block of `src` reachable from its entry into `dst` with fresh
/// block and instruction ids.
///
/// Operands and phi inputs are renamed into the copy. Terminators are
/// copied unchanged apart from renaming, so the caller decides what the
/// copied `Return`s become (see [`inline_exits`]).
pub fn clone_body(src: &Body, dst: &mut Body) -> ClonedRegion {
    let source_order = reverse_postorder(src);
    let mut blocks: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    let mut values: FxHashMap<InstrId, InstrId> = FxHashMap::default();
    let mut exits = Vec::new();

    for &block in &source_order {
        blocks.insert(block, dst.add_block());
    }
    for &block in &source_order {
        let copy = blocks[&block];
        for &instr in &src.block(block).body {
            let id = dst.append(copy, src.instr(instr).clone());
            values.insert(instr, id);
        }
    }

    let rename_value = |v: &mut InstrId| {
        if let Some(&new) = values.get(&*v) {
            *v = new;
        }
    };

    for &block in &source_order {
        let copy = blocks[&block];
        for idx in 0..dst.block(copy).body.len() {
            let id = dst.block(copy).body[idx];
            let instr = dst.instr_mut(id);
            instr.map_operands(rename_value);
            if let InstrKind::Phi { inputs } = &mut instr.kind {
                for (pred, _) in inputs.iter_mut() {
                    if let Some(&new) = blocks.get(&*pred) {
                        *pred = new;
                    }
                }
            }
        }

        let mut terminator = src.block(block).terminator.clone();
        terminator.map_successors(|b| {
            if let Some(&new) = blocks.get(&*b) {
                *b = new;
            }
        });
        if let Terminator::Return { value } | Terminator::Branch { cond: value, .. } =
            &mut terminator
        {
            rename_value(value);
        }
        if let Terminator::Return { value } = terminator {
            exits.push((copy, value));
        }
        dst.set_terminator(copy, terminator);
    }

    ClonedRegion {
        entry: blocks.get(&src.entry).copied().unwrap_or(src.entry),
        order: source_order.iter().map(|b| blocks[b]).collect(),
        blocks,
        values,
        exits,
    }
}

/// Route every copied `Return` of `region` to `continuation`.
///
/// Returns the value the region produces: the single returned value, or a
/// `Phi` in a fresh join block when there are several exits. `None` when
/// the region never returns.
pub fn inline_exits(
    body: &mut Body,
    region: &ClonedRegion,
    continuation: BlockId,
) -> Option<InstrId> {
    match region.exits.as_slice() {
        [] => None,
        [(exit, value)] => {
            body.set_terminator(
                *exit,
                Terminator::Jump {
                    target: continuation,
                },
            );
            Some(*value)
        }
        exits => {
            let join = body.add_block();
            let ty = exits
                .iter()
                .fold(Type::empty(), |acc, &(_, v)| acc | body.instr(v).ty);
            for &(exit, _) in exits {
                body.set_terminator(exit, Terminator::Jump { target: join });
            }
            let phi = body.append(join, Instr::phi(exits.to_vec(), ty));
            body.set_terminator(
                join,
                Terminator::Jump {
                    target: continuation,
                },
            );
            Some(phi)
        }
    }
}
