//! Reassociable-reduction recognition.
//!
//! A store whose nearest outgoing dependence is the reverse-time half
//! of a pair pointing at a load in the same loop is an accumulation
//! candidate: the value written this iteration is read back the next.
//! The candidate is accepted when the stored value reaches that load
//! through reassociable operations only, exactly once; the pair is then
//! cross-linked for the legality pass and later vectorization.

use crate::ir::{Addr, Block, Node, NodeKind, Opcode};
use crate::poly::dep::Dependencies;
use log::trace;

pub fn find_reductions(block: &mut Block, deps: &Dependencies, order: &[Addr]) {
    for &s in order {
        maybe_reassociable_reduction(block, deps, s);
    }
}

fn maybe_reassociable_reduction(block: &mut Block, deps: &Dependencies, s: Addr) {
    if block.addrs[s].dropped || !block.addrs[s].is_store {
        return;
    }
    let Some(&id) = deps.out_ids(block, s).first() else {
        return;
    };
    let e = &deps.edges[id];
    if e.rev_time_edge.is_none() {
        return;
    }
    let dst = e.output;
    if block.addrs[dst].is_store {
        return;
    }
    let (Some(sn), Some(dn)) = (block.addrs[s].node.expand(), block.addrs[dst].node.expand())
    else {
        return;
    };
    if block.nodes[sn].parent != block.nodes[dn].parent {
        return;
    }
    // The accumulator must have been hoisted clear of the carrying
    // loop; a store still inside it cannot be kept in a register.
    let depth = block.nodes[sn].depth as usize;
    if depth > e.sat_level as usize {
        return;
    }
    if block.addrs[s].reduction.expand() == Some(dst) {
        return; // multiple time dimensions, already found
    }
    let Some(val) = block.stored_val(s) else { return };
    if !matches!(block.nodes[val].kind, NodeKind::Compute { .. }) {
        return;
    }
    let (count, tainted) = find_through_reassociable(block, dn, val, false);
    if count != 1 || tainted {
        return;
    }
    trace!("reduction cycle: store {s:?} <-> load {dst:?}");
    block.addrs[s].reduction = Some(dst).into();
    block.addrs[dst].reduction = Some(s).into();
}

/// Count the paths from `v` to the target load through reassociable
/// operations, flagging any path that touches the target under a
/// non-reassociable op. With `relaxed`, float ops count as reassociable
/// even without their fast-math flag (fixed-order accumulation).
pub fn find_through_reassociable(
    block: &Block,
    target: Node,
    v: Node,
    relaxed: bool,
) -> (usize, bool) {
    if v == target {
        return (1, false);
    }
    match block.nodes[v].kind {
        NodeKind::Compute { op, reassoc, .. } => {
            if op.is_reassociable(reassoc || relaxed) || is_fneg_of_fmul(block, v) {
                let mut count = 0;
                let mut tainted = false;
                let args: Vec<Node> = block.nodes[v].args().collect();
                for a in args {
                    let (c, t) = find_through_reassociable(block, target, a, relaxed);
                    count += c;
                    tainted |= t;
                }
                (count, tainted)
            } else {
                (0, contains(block, v, target))
            }
        }
        _ => (0, false),
    }
}

/// A negated product folds into a reassociable fused chain.
fn is_fneg_of_fmul(block: &Block, v: Node) -> bool {
    let NodeKind::Compute { op: Opcode::FNeg, args, reassoc } = &block.nodes[v].kind else {
        return false;
    };
    if !*reassoc {
        return false;
    }
    args[0]
        .expand()
        .map_or(false, |a| matches!(block.nodes[a].kind, NodeKind::Compute { op: Opcode::FMul, .. }))
}

fn contains(block: &Block, v: Node, target: Node) -> bool {
    if v == target {
        return true;
    }
    block.nodes[v].args().any(|a| contains(block, a, target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Block;
    use crate::poly::loops::AffineLoopNest;
    use polylift_math::DMat;

    fn setup() -> (Block, crate::ir::Nest, crate::ir::ArrayBase) {
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
        let base = b.new_base("acc");
        (b, nest, base)
    }

    #[test]
    fn single_add_chain() {
        let (mut b, nest, base) = setup();
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let y = b.constant(3);
        let sum = b.compute(Opcode::Add, &[ld, y], false);
        let (count, tainted) = find_through_reassociable(&b, ld, sum, false);
        assert_eq!((count, tainted), (1, false));
    }

    #[test]
    fn fp_requires_reassoc_flag() {
        let (mut b, nest, base) = setup();
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let y = b.constant(3);
        let strict = b.compute(Opcode::FAdd, &[ld, y], false);
        assert_eq!(find_through_reassociable(&b, ld, strict, false).0, 0);
        // Relaxed mode accepts it (ordered accumulation).
        assert_eq!(find_through_reassociable(&b, ld, strict, true).0, 1);
        let fast = b.compute(Opcode::FAdd, &[ld, y], true);
        assert_eq!(find_through_reassociable(&b, ld, fast, false).0, 1);
    }

    #[test]
    fn double_reach_is_rejected() {
        let (mut b, nest, base) = setup();
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let twice = b.compute(Opcode::Add, &[ld, ld], false);
        assert_eq!(find_through_reassociable(&b, ld, twice, false).0, 2);
    }

    #[test]
    fn non_reassociable_op_taints() {
        let (mut b, nest, base) = setup();
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let y = b.constant(3);
        let div = b.compute(Opcode::SDiv, &[ld, y], false);
        let (count, tainted) = find_through_reassociable(&b, ld, div, false);
        assert_eq!(count, 0);
        assert!(tainted);
        let sum = b.compute(Opcode::Add, &[div, y], false);
        let (count, tainted) = find_through_reassociable(&b, ld, sum, false);
        assert_eq!(count, 0);
        assert!(tainted);
    }
}
