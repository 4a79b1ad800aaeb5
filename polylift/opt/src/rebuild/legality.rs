//! Per-loop reordering legality.
//!
//! Every dependence edge satisfied at some loop level lands in that
//! loop's bucket. A bucketed edge whose endpoints form a recognized
//! reduction counts as an unordered reduction; a carried accumulation
//! whose chain is associative but pinned to its order (float without
//! the reassociation flag) counts as ordered; anything else makes the
//! loop non-reorderable. A loop's summary then folds in its subloops'
//! (reordering a loop reorders everything it contains), so an outer
//! loop reports the combined verdict while an inner loop stays
//! independently reorderable.

use crate::ir::{Block, Node, NodeKind};
use crate::poly::dep::{DepId, Dependencies, UNSATISFIED};
use crate::rebuild::reduction::find_through_reassociable;
use crate::rebuild::simplify::program_order;
use crate::rebuild::tree::LoopTree;
use log::trace;
use rustc_hash::FxHashMap;

#[derive(Clone, Copy, Debug)]
pub struct Legality {
    pub ordered_reductions: u16,
    pub unordered_reductions: u16,
    pub reorderable: bool,
    /// All carried non-reduction dependences span a bounded constant
    /// distance, so the overlapping iterations could be peeled.
    pub peelable: bool,
}

impl Default for Legality {
    fn default() -> Legality {
        Legality {
            ordered_reductions: 0,
            unordered_reductions: 0,
            reorderable: true,
            peelable: true,
        }
    }
}

/// Compute legality for every loop in the tree.
pub fn annotate(block: &Block, deps: &Dependencies, tree: &LoopTree) -> FxHashMap<Node, Legality> {
    let mut buckets: FxHashMap<Node, Vec<DepId>> = FxHashMap::default();
    for a in program_order(block, tree) {
        for id in deps.in_ids(block, a) {
            let lvl = deps.sat_level(id);
            if lvl == UNSATISFIED {
                continue;
            }
            if let Some(l) = carrying_loop(block, tree, deps, id, lvl as usize) {
                buckets.entry(l).or_default().push(id);
            }
        }
    }
    let mut out: FxHashMap<Node, Legality> = FxHashMap::default();
    annotate_loop(block, deps, tree, tree.root, &buckets, &mut out);
    out
}

/// The loop at level `lvl` (0-based) that carries the edge. Usually an
/// ancestor of an endpoint; for an accumulation whose endpoints were
/// hoisted clear of the carrying loop, the loop sits between them in
/// their shared parent's body.
fn carrying_loop(
    block: &Block,
    tree: &LoopTree,
    deps: &Dependencies,
    id: DepId,
    lvl: usize,
) -> Option<Node> {
    let e = &deps.edges[id];
    let out_node = block.addrs[e.output].node.expand();
    let in_node = block.addrs[e.input].node.expand();
    for n in [out_node, in_node].into_iter().flatten() {
        if let Some(l) = loop_at_level(block, n, lvl) {
            return Some(l);
        }
    }
    let parent = block.nodes[out_node?].parent.expand()?;
    tree.body
        .get(&parent)?
        .iter()
        .copied()
        .find(|&n| matches!(block.nodes[n].kind, NodeKind::Loop { depth, .. } if depth as usize == lvl + 1))
}

/// The enclosing loop of `n` whose own level index is `lvl`
/// (0-based: the outermost loop is level 0).
fn loop_at_level(block: &Block, n: Node, lvl: usize) -> Option<Node> {
    let mut cur = n;
    loop {
        if let NodeKind::Loop { depth, .. } = block.nodes[cur].kind {
            if depth as usize == lvl + 1 {
                return Some(cur);
            }
        }
        match block.nodes[cur].parent.expand() {
            Some(p) => cur = p,
            None => return None,
        }
    }
}

fn annotate_loop(
    block: &Block,
    deps: &Dependencies,
    tree: &LoopTree,
    l: Node,
    buckets: &FxHashMap<Node, Vec<DepId>>,
    out: &mut FxHashMap<Node, Legality>,
) -> Legality {
    let mut leg = Legality::default();
    if let Some(bucket) = buckets.get(&l) {
        for &id in bucket {
            classify(block, deps, id, &mut leg);
        }
    }
    // Peeling is an escape hatch for carried deps; a loop that carries
    // none has nothing to peel.
    if buckets.get(&l).map_or(true, |v| v.is_empty()) {
        leg.peelable = false;
    }
    for &n in &tree.body[&l] {
        if block.nodes[n].is_loop() {
            let sub = annotate_loop(block, deps, tree, n, buckets, out);
            leg.ordered_reductions += sub.ordered_reductions;
            leg.unordered_reductions += sub.unordered_reductions;
            leg.reorderable &= sub.reorderable;
            // A reorderable subloop has nothing that needs peeling.
            leg.peelable &= sub.peelable || sub.reorderable;
        }
    }
    trace!(
        "loop {l:?}: reorderable={} reductions={}o/{}u",
        leg.reorderable,
        leg.ordered_reductions,
        leg.unordered_reductions
    );
    out.insert(l, leg);
    leg
}

fn classify(block: &Block, deps: &Dependencies, id: DepId, leg: &mut Legality) {
    let e = &deps.edges[id];
    let (store, load) = if block.addrs[e.input].is_store {
        (e.input, e.output)
    } else {
        (e.output, e.input)
    };
    if block.addrs[store].reduction.expand() == Some(load) {
        leg.unordered_reductions += 1;
        return;
    }
    // A store-to-load accumulation whose chain is associative but not
    // licensed to reassociate still admits a fixed-order treatment.
    if block.addrs[store].is_store && !block.addrs[load].is_store && e.rev_time_edge.is_some() {
        if let (Some(val), Some(dn)) =
            (block.stored_val(store), block.addrs[load].node.expand())
        {
            let (count, tainted) = find_through_reassociable(block, dn, val, true);
            if count == 1 && !tainted {
                leg.ordered_reductions += 1;
                leg.reorderable = false;
                return;
            }
        }
    }
    leg.reorderable = false;
    if constant_distance(e).is_none() {
        leg.peelable = false;
    }
}

/// The dependence distance along the loops, when every subscript tie is
/// a pure constant shift (`i_x - i_y == c`).
fn constant_distance(e: &crate::poly::dep::Dependence) -> Option<i64> {
    let dp = &e.poly;
    let nsym = dp.num_sym_cols();
    let mut dist = 0i64;
    for r in 0..dp.e.rows() {
        let row = dp.e.row(r);
        if row[1..nsym].iter().any(|&x| x != 0) {
            return None;
        }
        let common = dp.dim0.min(dp.dim1);
        for l in 0..common {
            if row[nsym + l] + row[nsym + dp.dim0 + l] != 0 {
                return None;
            }
        }
        dist = dist.max(row[0].abs());
    }
    Some(dist)
}
