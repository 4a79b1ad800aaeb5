//! Per-loop topological sorting with loop-invariant hoisting.
//!
//! Loops are processed innermost-first. For each loop we classify every
//! body node: nodes that (transitively) consume the loop's induction
//! variable stay; loop-independent nodes whose in-loop users are all
//! themselves hoisted move after the exit (final values: stores of
//! accumulators), the rest of the independent nodes move to the
//! pre-header (initial values and invariant computation). What remains
//! is sorted in reverse post-order over value edges plus the memory
//! edges that only the body order satisfies, and the result is written
//! into the loop's intrusive child/last links.
//!
//! Cycles among nodes of the same depth would mean an unsatisfiable
//! body order; the visit markers catch them in debug builds.

use crate::ir::node::{UNVISITED, VISITING};
use crate::ir::{Addr, Block, Node, NodeKind};
use crate::poly::dep::{Dependencies, UNSATISFIED};
use crate::rebuild::tree::LoopTree;
use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Sort the whole tree, innermost loops first.
pub fn sort_graph(block: &mut Block, deps: &Dependencies, tree: &mut LoopTree) {
    let root = tree.root;
    sort_loop(block, deps, tree, root);
}

fn sub_loops(block: &Block, tree: &LoopTree, l: Node) -> Vec<Node> {
    tree.body[&l].iter().copied().filter(|&n| block.nodes[n].is_loop()).collect()
}

fn sort_loop(block: &mut Block, deps: &Dependencies, tree: &mut LoopTree, l: Node) {
    for child in sub_loops(block, tree, l) {
        sort_loop(block, deps, tree, child);
    }
    let depth = tree.loop_depth(block, l);
    let body: Vec<Node> = tree.body[&l].clone();
    if body.is_empty() {
        write_links(block, l, &[]);
        return;
    }

    // Which nodes vary with this loop's own induction variable?
    let varies = compute_varying(block, &body, depth);
    for &n in &body {
        block.nodes[n].depends_on_parent = varies.contains(&n);
    }

    let is_root = block.nodes[l].parent.is_none();
    let (pre, body_stay, post) = if is_root {
        (Vec::new(), body, Vec::new())
    } else {
        partition_hoistable(block, deps, tree, l, &body, &varies)
    };

    // Hoisted nodes join the parent's body; the parent is sorted after
    // us, so order there is still pending. Pre-header nodes go before
    // the loop, after-exit nodes behind it.
    if let Some(parent) = block.nodes[l].parent.expand() {
        let pdepth = tree.loop_depth(block, parent);
        let pbody = tree.body.get_mut(&parent).expect("parent body exists");
        let at = pbody.iter().position(|&n| n == l).expect("loop is in its parent");
        for (i, &n) in pre.iter().enumerate() {
            pbody.insert(at + i, n);
        }
        let at = pbody.iter().position(|&n| n == l).unwrap();
        for (i, &n) in post.iter().enumerate() {
            pbody.insert(at + 1 + i, n);
        }
        for &n in pre.iter().chain(post.iter()) {
            block.nodes[n].parent = Some(parent).into();
            block.nodes[n].depth = pdepth as u8;
            trace!("hoisted {n:?} out of {l:?}");
        }
    }

    let sorted = topo_sort(block, deps, tree, &body_stay, depth);
    tree.body.insert(l, sorted.clone());
    write_links(block, l, &sorted);
}

/// Transitive "consumes this loop's induction variable" over the body.
fn compute_varying(block: &Block, body: &[Node], depth: usize) -> FxHashSet<Node> {
    let in_body: FxHashSet<Node> = body.iter().copied().collect();
    let mut varies: FxHashSet<Node> = FxHashSet::default();
    for &n in body {
        match block.nodes[n].kind {
            NodeKind::Loop { .. } => {
                varies.insert(n);
            }
            NodeKind::Load(a) | NodeKind::Store { addr: a, .. } => {
                if addr_uses_level(block, a, depth) {
                    varies.insert(n);
                }
            }
            _ => {}
        }
    }
    // Propagate through value uses within the body.
    let mut changed = true;
    while changed {
        changed = false;
        for &n in body {
            if varies.contains(&n) {
                continue;
            }
            let dep = block.nodes[n]
                .args()
                .any(|a| in_body.contains(&a) && varies.contains(&a));
            if dep && varies.insert(n) {
                changed = true;
            }
        }
    }
    varies
}

fn addr_uses_level(block: &Block, a: Addr, depth: usize) -> bool {
    let d = &block.addrs[a];
    depth >= 1 && d.num_loops() >= depth && !d.index.row_is_zero(depth - 1)
}

/// Split the body into (pre-header, staying, after-exit).
fn partition_hoistable(
    block: &Block,
    deps: &Dependencies,
    tree: &LoopTree,
    l: Node,
    body: &[Node],
    varies: &FxHashSet<Node>,
) -> (Vec<Node>, Vec<Node>, Vec<Node>) {
    let in_body: FxHashSet<Node> = body.iter().copied().collect();
    let mut hoistable: FxHashSet<Node> = FxHashSet::default();
    for &n in body {
        if varies.contains(&n) {
            continue;
        }
        if let Some(a) = block.nodes[n].addr() {
            // A memory access may only move when its partners inside
            // this loop move with it: an edge to a varying access pins
            // it.
            let pinned = deps
                .in_ids(block, a)
                .iter()
                .chain(deps.out_ids(block, a).iter())
                .any(|&id| {
                    let e = &deps.edges[id];
                    let other = if e.input == a { e.output } else { e.input };
                    let other_node = block.addrs[other].node.expand();
                    other_node
                        .map_or(false, |on| in_loop(block, tree, on, l) && varies_deep(block, tree, varies, on))
                });
            if pinned {
                continue;
            }
        }
        hoistable.insert(n);
    }
    // After-exit: hoistable nodes whose in-body consumers — value users
    // and body-order memory successors alike — are all after-exit
    // themselves (greatest fixpoint, seeded with "all").
    let mut after: FxHashSet<Node> = hoistable.clone();
    let mut changed = true;
    while changed {
        changed = false;
        for &n in body {
            if !after.contains(&n) {
                continue;
            }
            let mut ok = block.users[n]
                .iter()
                .all(|u| !in_body.contains(u) || after.contains(u));
            if ok {
                if let Some(a) = block.nodes[n].addr() {
                    ok = deps.out_ids(block, a).iter().all(|&id| {
                        deps.edges[id].sat_level != UNSATISFIED
                            || block.addrs[deps.edges[id].output]
                                .node
                                .expand()
                                .map_or(true, |on| !in_body.contains(&on) || after.contains(&on))
                    });
                }
            }
            if !ok {
                after.remove(&n);
                changed = true;
            }
        }
    }
    let mut pre = Vec::new();
    let mut stay = Vec::new();
    let mut post = Vec::new();
    for &n in body {
        if after.contains(&n) {
            post.push(n);
        } else if hoistable.contains(&n) {
            pre.push(n);
        } else {
            stay.push(n);
        }
    }
    (pre, stay, post)
}

fn in_loop(block: &Block, _tree: &LoopTree, n: Node, l: Node) -> bool {
    let mut cur = Some(n);
    while let Some(c) = cur {
        if c == l {
            return true;
        }
        cur = block.nodes[c].parent.expand();
    }
    false
}

/// Does `n` (or, for a subloop, anything inside it) vary with the
/// current loop?
fn varies_deep(block: &Block, tree: &LoopTree, varies: &FxHashSet<Node>, n: Node) -> bool {
    let mut cur = n;
    loop {
        if varies.contains(&cur) {
            return true;
        }
        match block.nodes[cur].parent.expand() {
            Some(p) if tree.body.contains_key(&p) => cur = p,
            _ => return false,
        }
    }
}

/// Reverse post-order over value edges and body-order memory edges,
/// with subloops as atomic members.
fn topo_sort(
    block: &mut Block,
    deps: &Dependencies,
    tree: &LoopTree,
    body: &[Node],
    depth: usize,
) -> Vec<Node> {
    let member: FxHashMap<Node, Node> = body
        .iter()
        .flat_map(|&n| collect_members(block, tree, n).into_iter().map(move |m| (m, n)))
        .collect();
    // successors[n] = body members that must run after n.
    let mut succ: FxHashMap<Node, SmallVec<[Node; 4]>> = FxHashMap::default();
    for &n in body {
        succ.entry(n).or_default();
    }
    let mut add_edge = |succ: &mut FxHashMap<Node, SmallVec<[Node; 4]>>, a: Node, b: Node| {
        if a != b {
            succ.get_mut(&a).expect("edge source in body").push(b);
        }
    };
    for (&m, &owner) in member.iter() {
        // Value edges: operand's owner precedes user's owner.
        for u in block.users[m].clone() {
            if let Some(&uo) = member.get(&u) {
                add_edge(&mut succ, owner, uo);
            }
        }
        // Memory edges satisfied only by body order. Anything carried
        // at a loop level is already ordered by iteration (or by the
        // pre/post hoist placement, for accesses pulled clear of the
        // carrying loop).
        if let Some(a) = block.nodes[m].addr() {
            for id in deps.out_ids(block, a) {
                if deps.edges[id].sat_level != UNSATISFIED {
                    continue;
                }
                if let Some(on) = block.addrs[deps.edges[id].output].node.expand() {
                    if let Some(&oo) = member.get(&on) {
                        add_edge(&mut succ, owner, oo);
                    }
                }
            }
        }
    }
    // Sibling loops execute in fusion order.
    let loops: Vec<Node> = body
        .iter()
        .copied()
        .filter(|n| tree.loop_key.contains_key(n))
        .collect();
    for (i, &li) in loops.iter().enumerate() {
        for &lj in &loops[i + 1..] {
            match tree.loop_key[&li].cmp(&tree.loop_key[&lj]) {
                std::cmp::Ordering::Less => add_edge(&mut succ, li, lj),
                std::cmp::Ordering::Greater => add_edge(&mut succ, lj, li),
                std::cmp::Ordering::Equal => {}
            }
        }
    }
    // Depth-first, pushing a node once all successors are placed, then
    // reversed (reverse post-order). Seeding in reverse body order
    // keeps unordered siblings in their original sequence. The visit
    // markers double as the same-depth cycle check.
    let mut order: Vec<Node> = Vec::new();
    for &start in body.iter().rev() {
        if block.nodes[start].visit != UNVISITED {
            continue;
        }
        let mut stack: Vec<(Node, usize)> = vec![(start, 0)];
        block.nodes[start].visit = VISITING;
        while let Some(&(n, ci)) = stack.last() {
            let children = &succ[&n];
            if ci < children.len() {
                stack.last_mut().unwrap().1 += 1;
                let c = children[ci];
                match block.nodes[c].visit {
                    UNVISITED => {
                        block.nodes[c].visit = VISITING;
                        stack.push((c, 0));
                    }
                    VISITING => {
                        debug_assert!(false, "cycle in same-depth body order");
                    }
                    _ => {}
                }
            } else {
                block.nodes[n].mark_visited(depth as u8);
                order.push(n);
                stack.pop();
            }
        }
    }
    order.reverse();
    order
}

/// The nodes whose ordering constraints attach to body member `n`: the
/// member itself, or everything inside it when it is a subloop.
fn collect_members(block: &Block, tree: &LoopTree, n: Node) -> Vec<Node> {
    match block.nodes[n].kind {
        NodeKind::Loop { .. } => {
            let mut out = vec![n];
            if let Some(body) = tree.body.get(&n) {
                for &c in body {
                    out.extend(collect_members(block, tree, c));
                }
            }
            out
        }
        _ => vec![n],
    }
}

pub(crate) fn write_links(block: &mut Block, l: Node, order: &[Node]) {
    let mut prev: Option<Node> = None;
    for &n in order {
        block.nodes[n].prev = prev.into();
        block.nodes[n].next = None.into();
        if let Some(p) = prev {
            block.nodes[p].next = Some(n).into();
        }
        prev = Some(n);
    }
    let first = order.first().copied();
    let last = order.last().copied();
    if let NodeKind::Loop { child, last: lst, .. } = &mut block.nodes[l].kind {
        *child = first.into();
        *lst = last.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poly::dep::Dependencies;
    use crate::poly::loops::AffineLoopNest;
    use crate::rebuild::tree::build_loop_tree;
    use crate::schedule::LoopBlock;
    use polylift_math::DMat;

    #[test]
    fn invariant_load_hoists_to_preheader() {
        // s[0] is not indexed by the loop and feeds an indexed store:
        // the load moves in front of the loop, the store stays.
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[8]));
        let s = b.new_base("s");
        let a = b.new_base("a");
        let (ld_node, _ld) = b.load(s, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let (st_node, _st) =
            b.store(a, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 1], ld_node);
        let mut deps = Dependencies::new();
        deps.build_all(&mut b);
        let mut lb = LoopBlock::build(&mut b);
        for (_, nd) in lb.nodes.iter_mut() {
            nd.set_identity();
        }
        let mut tree = build_loop_tree(&mut b, &lb);
        sort_graph(&mut b, &deps, &mut tree);
        let root_body = tree.body[&tree.root].clone();
        assert_eq!(root_body.len(), 2, "hoisted load plus the loop");
        assert_eq!(root_body[0], ld_node, "pre-header load comes first");
        assert!(b.nodes[root_body[1]].is_loop());
        assert_eq!(b.nodes[ld_node].parent.expand(), Some(tree.root));
        assert_eq!(b.nodes[st_node].parent.expand(), Some(root_body[1]));
        // The loop body holds exactly the store.
        assert_eq!(tree.sorted_body(&b, root_body[1]), vec![st_node]);
    }

    #[test]
    fn body_order_respects_value_edges() {
        // Two varying statements where the second consumes the first's
        // loaded value: load before compute before store.
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[8]));
        let x = b.new_base("x");
        let y = b.new_base("y");
        let idx = DMat::from_rows(&[&[1]]);
        let (ld, _) = b.load(x, nest, idx.clone(), vec![0], vec![0, 0]);
        let neg = b.compute(crate::ir::Opcode::Sub, &[ld, ld], false);
        let (st, _) = b.store(y, nest, idx, vec![0], vec![0, 1], neg);
        let mut deps = Dependencies::new();
        deps.build_all(&mut b);
        let mut lb = LoopBlock::build(&mut b);
        for (_, nd) in lb.nodes.iter_mut() {
            nd.set_identity();
        }
        let mut tree = build_loop_tree(&mut b, &lb);
        sort_graph(&mut b, &deps, &mut tree);
        let l = tree.body[&tree.root][0];
        let body = tree.sorted_body(&b, l);
        let pos = |n: Node| body.iter().position(|&m| m == n).unwrap();
        assert!(pos(ld) < pos(neg));
        assert!(pos(neg) < pos(st));
    }
}
