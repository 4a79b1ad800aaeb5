//! Pass orchestration: dependence analysis, scheduling, tree rebuild,
//! simplification, reductions, legality.

use crate::ir::{Addr, ArrayBase, Block, Node};
use crate::poly::dep::Dependencies;
use crate::rebuild::legality::{annotate, Legality};
use crate::rebuild::reduction::find_reductions;
use crate::rebuild::simplify::{
    eliminate_temporaries, program_order, remove_redundant, sort_edges,
};
use crate::rebuild::topsort::sort_graph;
use crate::rebuild::tree::{build_loop_tree, LoopTree};
use crate::schedule::{LoopBlock, Outcome};
use log::debug;
use rustc_hash::FxHashMap;

/// Everything downstream passes consume.
pub struct OptimizedBlock {
    /// Root of the rebuilt loop tree (a depth-0 loop node).
    pub root: Node,
    pub tree: LoopTree,
    /// Live accesses in program order.
    pub addr_chain: Vec<Addr>,
    /// The dependence registry, with final satisfaction levels.
    pub deps: Dependencies,
    pub legality: FxHashMap<Node, Legality>,
    /// Allocations whose last stores were deleted; safe to erase if no
    /// other user remains.
    pub erase_candidates: Vec<ArrayBase>,
    /// What the scheduler achieved (`Failure` means the identity
    /// schedule was kept).
    pub schedule_outcome: Outcome,
}

/// Run the whole pipeline over one block.
pub fn optimize(block: &mut Block) -> OptimizedBlock {
    let mut deps = Dependencies::new();
    deps.build_all(block);
    let mut lb = LoopBlock::build(block);
    let schedule_outcome = lb.optimize(block, &mut deps);
    debug!("schedule outcome: {schedule_outcome:?}");

    let mut tree = build_loop_tree(block, &lb);
    sort_graph(block, &deps, &mut tree);
    sort_edges(block, &mut deps, &tree);
    remove_redundant(block, &deps, &mut tree);
    let erase_candidates = eliminate_temporaries(block, &mut tree);
    let order = program_order(block, &tree);
    find_reductions(block, &deps, &order);
    let legality = annotate(block, &deps, &tree);
    let addr_chain = program_order(block, &tree);
    debug!(
        "optimized block: {} live accesses, {} erase candidates",
        addr_chain.len(),
        erase_candidates.len()
    );
    OptimizedBlock {
        root: tree.root,
        addr_chain,
        deps,
        legality,
        erase_candidates,
        schedule_outcome,
        tree,
    }
}
