//! Redundant-access elimination over the sorted graph.
//!
//! Two passes cooperate here. The edge-driven pass follows each
//! access's first (topologically nearest) outgoing dependence:
//!
//! | first | second | action                                   |
//! |-------|--------|------------------------------------------|
//! | store | store  | drop the first (shadowed)                |
//! | store | load   | forward the stored value, drop the load  |
//! | load  | load   | reuse the first, drop the second         |
//! | load  | store  | nothing                                  |
//!
//! Load-load pairs carry no dependence edge, so a per-loop scan with a
//! (base, subscripts) table catches those, invalidating a base's
//! entries whenever a store (or a subloop containing one) intervenes.
//! Finally, stores into non-escaping removable allocations with no
//! remaining loads are deleted and the allocation is queued for
//! erasure.

use crate::ir::{Addr, ArrayBase, Block, Node, NodeKind};
use crate::poly::dep::{Dependencies, UNSATISFIED};
use crate::rebuild::topsort::write_links;
use crate::rebuild::tree::LoopTree;
use log::trace;
use polylift_math::DMat;
use rustc_hash::{FxHashMap, FxHashSet};

/// Every undropped access in program order (pre-order walk of the
/// sorted tree).
pub fn program_order(block: &Block, tree: &LoopTree) -> Vec<Addr> {
    let mut out = Vec::new();
    walk(block, tree, tree.root, &mut out);
    out
}

fn walk(block: &Block, tree: &LoopTree, l: Node, out: &mut Vec<Addr>) {
    for &n in &tree.body[&l] {
        match block.nodes[n].kind {
            NodeKind::Loop { .. } => walk(block, tree, n, out),
            _ => {
                if let Some(a) = block.nodes[n].addr() {
                    if !block.addrs[a].dropped {
                        out.push(a);
                    }
                }
            }
        }
    }
}

/// Sort every access's outgoing edge chain by the topological position
/// of the downstream access, and assign those positions.
pub fn sort_edges(block: &mut Block, deps: &mut Dependencies, tree: &LoopTree) {
    let order = program_order(block, tree);
    let mut pos = 0i32;
    for &a in order.iter().rev() {
        block.addrs[a].top_position = pos;
        pos -= 1;
        for id in deps.in_ids(block, a) {
            deps.remove_out_edge(block, id);
            deps.push_out_edge_front(block, id);
        }
    }
}

/// The edge-driven elimination pass.
pub fn remove_redundant(block: &mut Block, deps: &Dependencies, tree: &mut LoopTree) {
    let order = program_order(block, tree);
    for &a in &order {
        if block.addrs[a].dropped {
            continue;
        }
        eliminate_addr(block, deps, tree, a);
    }
    same_loop_scan(block, tree, tree.root);
}

fn eliminate_addr(block: &mut Block, deps: &Dependencies, tree: &mut LoopTree, a: Addr) {
    let depth = addr_depth(block, a);
    for id in deps.out_ids(block, a) {
        let e = &deps.edges[id];
        // Only a pairing not carried by any loop at or above this
        // placement relates the same dynamic instances.
        if e.sat_level != UNSATISFIED && (e.sat_level as usize) <= depth {
            continue;
        }
        let b = e.output;
        if !block.addrs[a].same_reference(&block.addrs[b]) {
            return; // nearest output is a different cell: stop
        }
        let a_store = block.addrs[a].is_store;
        let b_store = block.addrs[b].is_store;
        if a_store && b_store {
            trace!("{a:?} shadowed by {b:?}");
            drop_addr(block, tree, a);
        } else if a_store {
            if same_loop(block, a, b) {
                let from = block.addrs[b].node.expand().unwrap();
                let to = block.stored_val(a).unwrap();
                trace!("forwarding stored value of {a:?} into {b:?}");
                block.replace_all_uses(from, to);
                drop_addr(block, tree, b);
            }
        } else if !b_store {
            if same_loop(block, a, b) {
                let from = block.addrs[b].node.expand().unwrap();
                let to = block.addrs[a].node.expand().unwrap();
                trace!("reusing {a:?} for duplicate load {b:?}");
                block.replace_all_uses(from, to);
                drop_addr(block, tree, b);
            }
        }
        return;
    }
}

fn addr_depth(block: &Block, a: Addr) -> usize {
    block.addrs[a].node.expand().map_or(0, |n| block.nodes[n].depth as usize)
}

fn same_loop(block: &Block, a: Addr, b: Addr) -> bool {
    let an = block.addrs[a].node.expand();
    let bn = block.addrs[b].node.expand();
    match (an, bn) {
        (Some(x), Some(y)) => block.nodes[x].parent == block.nodes[y].parent,
        _ => false,
    }
}

#[derive(PartialEq, Eq, Hash)]
struct CellKey {
    base: ArrayBase,
    index: DMat,
    off: Vec<i64>,
    sym: DMat,
}

fn cell_key(block: &Block, a: Addr) -> CellKey {
    let d = &block.addrs[a];
    CellKey {
        base: d.base,
        index: d.index.clone(),
        off: d.off_omega.clone(),
        sym: d.sym_off.clone(),
    }
}

/// Per-loop duplicate scan (catches the load-load pairs, which have no
/// dependence edge).
fn same_loop_scan(block: &mut Block, tree: &mut LoopTree, l: Node) {
    for n in tree.body[&l].clone() {
        if block.nodes[n].is_loop() {
            same_loop_scan(block, tree, n);
        }
    }
    let mut known: FxHashMap<CellKey, Addr> = FxHashMap::default();
    for n in tree.body[&l].clone() {
        if block.nodes[n].is_loop() {
            // A subloop may store anywhere; invalidate the bases it
            // writes.
            let mut stored: FxHashSet<ArrayBase> = FxHashSet::default();
            collect_stored_bases(block, tree, n, &mut stored);
            known.retain(|k, _| !stored.contains(&k.base));
            continue;
        }
        let Some(a) = block.nodes[n].addr() else { continue };
        if block.addrs[a].dropped {
            continue;
        }
        let key = cell_key(block, a);
        let prev = known.get(&key).copied();
        if block.addrs[a].is_store {
            if let Some(p) = prev {
                if block.addrs[p].is_store {
                    trace!("{p:?} shadowed by {a:?} (scan)");
                    drop_addr(block, tree, p);
                }
            }
            let base = block.addrs[a].base;
            known.retain(|k, _| k.base != base);
            known.insert(key, a);
        } else {
            match prev {
                Some(p) if block.addrs[p].is_store => {
                    let from = block.addrs[a].node.expand().unwrap();
                    let to = block.stored_val(p).unwrap();
                    trace!("forwarding {p:?} into {a:?} (scan)");
                    block.replace_all_uses(from, to);
                    drop_addr(block, tree, a);
                }
                Some(p) => {
                    let from = block.addrs[a].node.expand().unwrap();
                    let to = block.addrs[p].node.expand().unwrap();
                    trace!("reusing {p:?} for {a:?} (scan)");
                    block.replace_all_uses(from, to);
                    drop_addr(block, tree, a);
                }
                None => {
                    known.insert(key, a);
                }
            }
        }
    }
}

fn collect_stored_bases(block: &Block, tree: &LoopTree, l: Node, out: &mut FxHashSet<ArrayBase>) {
    for &n in &tree.body[&l] {
        match block.nodes[n].kind {
            NodeKind::Loop { .. } => collect_stored_bases(block, tree, n, out),
            NodeKind::Store { addr, .. } => {
                if !block.addrs[addr].dropped {
                    out.insert(block.addrs[addr].base);
                }
            }
            _ => {}
        }
    }
}

/// Drop stores into dead temporaries: removable, non-escaping
/// allocations that are never loaded again. Returns the allocations
/// queued for erasure.
pub fn eliminate_temporaries(block: &mut Block, tree: &mut LoopTree) -> Vec<ArrayBase> {
    let order = program_order(block, tree);
    let mut loaded: FxHashSet<ArrayBase> = FxHashSet::default();
    for &a in &order {
        if !block.addrs[a].is_store {
            loaded.insert(block.addrs[a].base);
        }
    }
    let mut candidates: FxHashSet<ArrayBase> = FxHashSet::default();
    for &a in &order {
        if block.addrs[a].dropped || !block.addrs[a].is_store {
            continue;
        }
        let base = block.addrs[a].base;
        if loaded.contains(&base) {
            continue;
        }
        let bd = &block.bases[base];
        if !bd.removable_alloc || bd.future_reads {
            continue;
        }
        trace!("dead temporary store {a:?} into {}", block.bases[base].name);
        drop_addr(block, tree, a);
        candidates.insert(base);
    }
    candidates.into_iter().collect()
}

/// Mark an access dropped and unlink its node from the containing body.
pub fn drop_addr(block: &mut Block, tree: &mut LoopTree, a: Addr) {
    block.addrs[a].dropped = true;
    let Some(n) = block.addrs[a].node.expand() else { return };
    let Some(parent) = block.nodes[n].parent.expand() else { return };
    if let Some(body) = tree.body.get_mut(&parent) {
        body.retain(|&x| x != n);
        let order = body.clone();
        write_links(block, parent, &order);
    }
}
