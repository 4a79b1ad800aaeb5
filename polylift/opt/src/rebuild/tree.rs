//! Loop-tree construction from the solved schedule.
//!
//! Nodes are placed by descending a trie keyed on their fusion-omega
//! tuples: statements sharing a prefix of length `d` share the loop at
//! depth `d`. Each loop gets the representative nest rotated by the
//! owning node's inverse schedule, and every member access is rewritten
//! into the new induction variables on insertion.

use crate::ir::{Addr, Block, Node, NodeData, NodeKind};
use crate::poly::loops::AffineLoopNest;
use crate::schedule::{LoopBlock, SNode};
use log::trace;
use polylift_math::normal_form::scaled_inverse;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// The tree under construction: loop nodes exist in the block's node
/// registry, body membership is tracked as ordered vectors until the
/// topological sort writes the final intrusive lists.
pub struct LoopTree {
    pub root: Node,
    pub body: FxHashMap<Node, Vec<Node>>,
    /// Fusion position of every loop within its parent; sibling loops
    /// execute in increasing key order.
    pub loop_key: FxHashMap<Node, i64>,
}

impl LoopTree {
    pub fn loop_depth(&self, block: &Block, l: Node) -> usize {
        match block.nodes[l].kind {
            NodeKind::Loop { depth, .. } => depth as usize,
            _ => unreachable!("not a loop node"),
        }
    }

    /// Iterate a loop's final (sorted) body via the intrusive links.
    pub fn sorted_body(&self, block: &Block, l: Node) -> Vec<Node> {
        let NodeKind::Loop { child, .. } = &block.nodes[l].kind else {
            unreachable!("not a loop node");
        };
        let mut out = Vec::new();
        let mut cur = child.expand();
        while let Some(n) = cur {
            out.push(n);
            cur = block.nodes[n].next.expand();
        }
        out
    }
}

struct TrieLevel {
    /// Fusion position → child loop node.
    children: FxHashMap<i64, Node>,
}

/// Build the post-schedule tree and rotate every access into its new
/// coordinates.
pub fn build_loop_tree(block: &mut Block, lb: &LoopBlock) -> LoopTree {
    let root_nest = block.add_nest(AffineLoopNest::rectangular(&[]));
    let root = block.nodes.push(NodeData::new(NodeKind::Loop {
        nest: root_nest,
        depth: 0,
        child: None.into(),
        last: None.into(),
    }));
    let mut tree = LoopTree {
        root,
        body: FxHashMap::default(),
        loop_key: FxHashMap::default(),
    };
    tree.body.insert(root, Vec::new());
    let mut tries: FxHashMap<Node, TrieLevel> = FxHashMap::default();
    tries.insert(root, TrieLevel { children: FxHashMap::default() });

    let snodes: Vec<SNode> = lb.nodes.keys().collect();
    for n in snodes {
        let nd = &lb.nodes[n];
        let d = nd.num_loops();
        let (phi_inv, denom) = scaled_inverse(&nd.phi)
            .expect("a completed schedule has a non-singular phi");
        let rotated = block.nests[nd.nest].rotate(&phi_inv, denom);
        let new_nest = block.add_nest(rotated);
        // Descend the fusion trie, creating loops as new prefixes
        // appear.
        let mut cur = root;
        for depth in 0..d {
            let pos = nd.fusion_omega[depth];
            let existing = tries.get(&cur).and_then(|t| t.children.get(&pos)).copied();
            let child = match existing {
                Some(c) => c,
                None => {
                    let c = block.nodes.push(NodeData::new(NodeKind::Loop {
                        nest: new_nest,
                        depth: (depth + 1) as u8,
                        child: None.into(),
                        last: None.into(),
                    }));
                    block.nodes[c].parent = Some(cur).into();
                    block.nodes[c].depth = depth as u8;
                    tree.body.entry(cur).or_default().push(c);
                    tree.body.insert(c, Vec::new());
                    tree.loop_key.insert(c, pos);
                    tries.insert(c, TrieLevel { children: FxHashMap::default() });
                    tries.get_mut(&cur).unwrap().children.insert(pos, c);
                    c
                }
            };
            cur = child;
        }
        // Rotate and insert every member access under the innermost
        // loop, then pull the stored-value compute chain in with it.
        let offsets = nd.offsets.clone();
        let omega = nd.offset_omega.clone();
        let mem: SmallVec<[Addr; 4]> = nd.mem.clone();
        for &a in mem.iter() {
            block.addrs[a].rotate(new_nest, &phi_inv, denom, &omega, offsets.as_deref());
            let an = block.addrs[a].node.expand().expect("addresses carry their IR node");
            place(block, &mut tree, an, cur, d as u8);
        }
        let repr = nd.repr;
        if let Some(v) = block.stored_val(repr) {
            place_chain(block, &mut tree, v, cur, d as u8);
        }
        trace!("placed node {n:?} under {cur:?} (depth {d})");
    }
    tree
}

fn place(block: &mut Block, tree: &mut LoopTree, n: Node, l: Node, depth: u8) {
    if block.nodes[n].parent.is_some() {
        return;
    }
    block.nodes[n].parent = Some(l).into();
    block.nodes[n].depth = depth;
    tree.body.entry(l).or_default().push(n);
}

/// Place the pure compute chain feeding a stored value under the same
/// loop as its statement; constants sit in the root.
fn place_chain(block: &mut Block, tree: &mut LoopTree, v: Node, l: Node, depth: u8) {
    let mut work: SmallVec<[Node; 8]> = SmallVec::new();
    work.push(v);
    while let Some(n) = work.pop() {
        if block.nodes[n].parent.is_some() {
            continue;
        }
        match block.nodes[n].kind {
            NodeKind::Compute { .. } => {
                place(block, tree, n, l, depth);
                let args: SmallVec<[Node; 4]> = block.nodes[n].args().collect();
                work.extend(args);
            }
            NodeKind::Constant(_) => {
                place(block, tree, n, tree.root, 0);
            }
            // Loads were placed with their own scheduled node.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Block;
    use crate::poly::loops::AffineLoopNest;
    use crate::schedule::LoopBlock;
    use polylift_math::DMat;

    #[test]
    fn canonical_schedule_round_trips() {
        // Two statements fused in one loop at body positions 0 and 1;
        // identity schedules must reproduce the fusion layout: one
        // loop, both stores inside.
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[8]));
        let base = b.new_base("a");
        let base2 = b.new_base("b");
        let c = b.constant(1);
        let (_, s0) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0], c);
        let (_, s1) = b.store(base2, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 1], c);
        let mut lb = LoopBlock::build(&mut b);
        for (_, nd) in lb.nodes.iter_mut() {
            nd.set_identity();
        }
        let tree = build_loop_tree(&mut b, &lb);
        let root_body = &tree.body[&tree.root];
        assert_eq!(root_body.len(), 1, "one fused loop expected");
        let l = root_body[0];
        let body = &tree.body[&l];
        let n0 = b.addrs[s0].node.expand().unwrap();
        let n1 = b.addrs[s1].node.expand().unwrap();
        assert!(body.contains(&n0) && body.contains(&n1));
        // Indices are unchanged under the identity rotation.
        assert_eq!(b.addrs[s0].index, DMat::from_rows(&[&[1]]));
        assert_eq!(b.addrs[s0].off_omega, vec![0]);
    }

    #[test]
    fn split_fusion_creates_two_loops() {
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[8]));
        let base = b.new_base("a");
        let c = b.constant(1);
        let (_, _s0) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0], c);
        let (_, _s1) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![1], vec![1, 0], c);
        let mut lb = LoopBlock::build(&mut b);
        for (_, nd) in lb.nodes.iter_mut() {
            nd.set_identity();
        }
        let tree = build_loop_tree(&mut b, &lb);
        assert_eq!(tree.body[&tree.root].len(), 2, "distinct fusion positions split");
    }
}
