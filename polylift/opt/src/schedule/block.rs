//! The loop-block scheduler.
//!
//! Level by level, outermost first, the scheduler assembles one
//! "omni-simplex" over every dependence edge still active at the
//! current depth: each edge contributes its satisfaction rows (legality
//! of the new level) stacked above its bounding rows (the `w + u*S`
//! bound on the dependence distance), every still-unscheduled node
//! contributes a fresh phi row and an omega offset, and a slack tail
//! forces each new phi row off the span of the rows already chosen.
//! The objective lexicographically minimizes the bounding block
//! `[w, u]`, then the omegas, then the phi coefficients.
//!
//! Edges whose bound solves to zero are re-verified with the chosen
//! rows (`check_empty_sat`) and dropped when the schedule separates
//! them; edges with a positive bound are carried at this level and
//! deactivated below it. An infeasible level is handled by splitting
//! the dependence graph into strongly connected components, scheduling
//! them at distinct fusion positions, and greedily re-fusing adjacent
//! components where a trial merge stays feasible.

use crate::ir::{Addr, Block, Node, NodeKind};
use crate::poly::dep::{DepId, Dependencies, UNSATISFIED};
use crate::schedule::node::{Outcome, SNode, ScheduledNode};
use cranelift_entity::PrimaryMap;
use log::{debug, trace};
use polylift_math::matrix::{denom_lcm, Rat};
use polylift_math::normal_form::{null_space, update_for_new_row};
use polylift_math::{DMat, Simplex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

pub struct LoopBlock {
    pub nodes: PrimaryMap<SNode, ScheduledNode>,
}

/// Column allocation for one omni-simplex instantiation. Variable
/// columns are 1-based: `[lambda | slack | omega | phi | w | u]`.
struct OmniPlan {
    edges: Vec<EdgeSlot>,
    omega_col: FxHashMap<SNode, usize>,
    phi_col: FxHashMap<SNode, usize>,
    slack_nodes: Vec<SNode>,
    slack_first: usize,
    omega_first: usize,
    phi_first: usize,
    w_first: usize,
    u_first: usize,
    num_vars: usize,
    num_rows: usize,
}

struct EdgeSlot {
    id: DepId,
    row0: usize,
    sat_lam0: usize,
    bnd_lam0: usize,
    w_col: usize,
    u0: usize,
    num_u: usize,
}

struct Stash {
    nodes: Vec<(SNode, ScheduledNode)>,
    edges: Vec<(DepId, u8, bool)>,
}

impl LoopBlock {
    /// Group the block's addresses into scheduled nodes: one per store
    /// (claiming the loads its stored value consumes), one per load
    /// left over.
    pub fn build(block: &mut Block) -> LoopBlock {
        let mut nodes: PrimaryMap<SNode, ScheduledNode> = PrimaryMap::new();
        let addrs: Vec<Addr> = block.addrs.keys().collect();
        for &a in &addrs {
            if !block.addrs[a].is_store {
                continue;
            }
            let nest = block.addrs[a].nest;
            let d = block.addrs[a].num_loops();
            let fusion = block.addrs[a].fusion.clone();
            let id = nodes.push(ScheduledNode::new(a, nest, d, fusion));
            block.addrs[a].snode = Some(id).into();
            // Claim the loads feeding the stored value.
            let mut work: SmallVec<[Node; 8]> = SmallVec::new();
            if let Some(v) = block.stored_val(a) {
                work.push(v);
            }
            let mut seen: FxHashSet<Node> = FxHashSet::default();
            while let Some(n) = work.pop() {
                if !seen.insert(n) {
                    continue;
                }
                match block.nodes[n].kind {
                    NodeKind::Load(la) => {
                        if block.addrs[la].snode.is_none() && block.addrs[la].nest == nest {
                            block.addrs[la].snode = Some(id).into();
                            nodes[id].mem.push(la);
                        }
                    }
                    NodeKind::Compute { .. } => {
                        let args: SmallVec<[Node; 4]> = block.nodes[n].args().collect();
                        work.extend(args);
                    }
                    _ => {}
                }
            }
        }
        for &a in &addrs {
            if block.addrs[a].snode.is_none() {
                let nest = block.addrs[a].nest;
                let d = block.addrs[a].num_loops();
                let fusion = block.addrs[a].fusion.clone();
                let id = nodes.push(ScheduledNode::new(a, nest, d, fusion));
                block.addrs[a].snode = Some(id).into();
            }
        }
        debug!("scheduler: {} nodes over {} addresses", nodes.len(), addrs.len());
        LoopBlock { nodes }
    }

    pub fn max_depth(&self, set: &[SNode]) -> usize {
        set.iter().map(|&n| self.nodes[n].num_loops()).max().unwrap_or(0)
    }

    /// Solve the whole block. On unresolvable failure every node is
    /// reset to the identity schedule and edge satisfaction is
    /// recomputed against the original order.
    pub fn optimize(&mut self, block: &mut Block, deps: &mut Dependencies) -> Outcome {
        let all: Vec<SNode> = self.nodes.keys().collect();
        for &n in &all {
            self.shift_omega(block, deps, n);
        }
        let r = self.opt_orth(block, deps, &all);
        if !r.ok() {
            debug!("scheduler: unresolvable; falling back to the identity schedule");
            self.identity_fallback(block, deps, &all);
        }
        r
    }

    /// Orthogonalization attempt: pre-seed phi with full-rank index
    /// matrices (favouring the array layout as loop levels), retrying
    /// unseeded on failure.
    fn opt_orth(&mut self, block: &mut Block, deps: &mut Dependencies, set: &[SNode]) -> Outcome {
        let max_depth = self.max_depth(set);
        let mut try_orth = false;
        for &n in set {
            if self.nodes[n].phi_is_scheduled(0) {
                continue;
            }
            let repr = self.nodes[n].repr;
            for id in deps.in_ids(block, repr) {
                let e = &deps.edges[id];
                if block.addrs[e.input].snode.expand() != Some(n) {
                    continue;
                }
                let ind = &block.addrs[e.input].index;
                if ind != &block.addrs[e.output].index {
                    continue;
                }
                let rows = ind.transpose();
                let r = polylift_math::normal_form::rank(&rows);
                if r != rows.rows() || r >= self.nodes[n].num_loops() {
                    continue;
                }
                self.nodes[n].schedule_phi(&rows);
                try_orth = true;
                break;
            }
        }
        if try_orth {
            let st = self.stash(deps, set);
            let r = self.optimize_rec(block, deps, set, 0, max_depth);
            if r.ok() {
                return r;
            }
            self.restore(deps, st);
            for &n in set {
                self.nodes[n].unschedule_phi();
            }
        }
        self.optimize_rec(block, deps, set, 0, max_depth)
    }

    fn optimize_rec(
        &mut self,
        block: &mut Block,
        deps: &mut Dependencies,
        set: &[SNode],
        d: usize,
        max_depth: usize,
    ) -> Outcome {
        if d >= max_depth {
            return Outcome::Independent;
        }
        let before = self.stash(deps, set);
        let r = self.solve_graph(block, deps, set, d, false);
        if r.ok() {
            if d + 1 == max_depth {
                return r;
            }
            let n = self.optimize_rec(block, deps, set, d + 1, max_depth);
            if n.ok() {
                if r == Outcome::Dependent && n == Outcome::Dependent {
                    return self.optimize_sat_dep(block, deps, set, d, max_depth, r & n, before);
                }
                return r & n;
            }
        }
        self.break_graph(block, deps, set, d)
    }

    /// Retry the level from its pre-solve state with every active edge
    /// forced strictly satisfied (consolidating dependences into one
    /// sequential loop); keep the already-found solution if that fails.
    fn optimize_sat_dep(
        &mut self,
        block: &mut Block,
        deps: &mut Dependencies,
        set: &[SNode],
        d: usize,
        max_depth: usize,
        backup: Outcome,
        before: Stash,
    ) -> Outcome {
        let solved = self.stash(deps, set);
        self.restore(deps, before);
        let sat = self.solve_graph(block, deps, set, d, true);
        if sat.ok() {
            let deeper = self.optimize_rec(block, deps, set, d + 1, max_depth);
            if deeper.ok() {
                trace!("depth {d}: consolidated every dependence at this level");
                return sat & deeper;
            }
        }
        self.restore(deps, solved);
        backup
    }

    /// Active edges at `d` with both endpoints in `set`, in a stable
    /// instantiation order.
    fn active_edges(
        &self,
        block: &Block,
        deps: &Dependencies,
        set: &[SNode],
        d: usize,
    ) -> Vec<DepId> {
        let inside: FxHashSet<SNode> = set.iter().copied().collect();
        let mut out = Vec::new();
        for &n in set {
            for &a in self.nodes[n].mem.iter() {
                for id in deps.out_ids(block, a) {
                    if !deps.active_at(block, id, d) {
                        continue;
                    }
                    let dst = block.addrs[deps.edges[id].output].snode.expand();
                    if dst.map_or(false, |o| inside.contains(&o)) {
                        out.push(id);
                    }
                }
            }
        }
        out
    }

    fn plan(&self, block: &Block, deps: &Dependencies, set: &[SNode], d: usize, active: &[DepId]) -> OmniPlan {
        let mut incident: FxHashSet<SNode> = FxHashSet::default();
        let mut num_lambda = 0;
        let mut num_rows = 0;
        for &id in active {
            let e = &deps.edges[id];
            incident.insert(block.addrs[e.input].snode.unwrap());
            incident.insert(block.addrs[e.output].snode.unwrap());
            num_lambda += 2 * e.lay.num_lambda();
            num_rows += e.sat.rows() + e.bnd.rows();
        }
        let mut slack_nodes = Vec::new();
        for &n in set {
            if incident.contains(&n)
                && d < self.nodes[n].num_loops()
                && !self.nodes[n].phi_is_scheduled(d)
            {
                slack_nodes.push(n);
            }
        }
        let slack_first = num_lambda + 1;
        let mut col = num_lambda + slack_nodes.len();
        let omega_first = col + 1;
        let mut omega_col = FxHashMap::default();
        for &n in set {
            if incident.contains(&n) && d < self.nodes[n].num_loops() {
                col += 1;
                omega_col.insert(n, col);
            }
        }
        let phi_first = col + 1;
        let mut phi_col = FxHashMap::default();
        for &n in &slack_nodes {
            phi_col.insert(n, col + 1);
            col += self.nodes[n].num_loops();
        }
        let w_first = col + 1;
        let mut edges = Vec::new();
        let mut row = 0;
        let mut wc = w_first;
        let mut lam = 1;
        for &id in active {
            let e = &deps.edges[id];
            let slot = EdgeSlot {
                id,
                row0: row,
                sat_lam0: lam,
                bnd_lam0: lam + e.lay.num_lambda(),
                w_col: wc,
                u0: 0,
                num_u: e.lay.num_syms,
            };
            lam += 2 * e.lay.num_lambda();
            row += e.sat.rows() + e.bnd.rows();
            wc += 1;
            edges.push(slot);
        }
        let u_first = wc;
        let mut uc = u_first;
        for slot in edges.iter_mut() {
            slot.u0 = uc;
            uc += slot.num_u;
        }
        let num_rows = num_rows + slack_nodes.len();
        OmniPlan {
            edges,
            omega_col,
            phi_col,
            slack_nodes,
            slack_first,
            omega_first,
            phi_first,
            w_first,
            u_first,
            num_vars: uc - 1,
            num_rows,
        }
    }

    fn solve_graph(
        &mut self,
        block: &mut Block,
        deps: &mut Dependencies,
        set: &[SNode],
        d: usize,
        satisfy: bool,
    ) -> Outcome {
        let active = self.active_edges(block, deps, set, d);
        if active.is_empty() {
            for &n in set {
                if d >= self.nodes[n].num_loops() {
                    continue;
                }
                if self.nodes[n].phi_is_scheduled(d) {
                    self.nodes[n].offset_omega[d] = 0;
                    self.nodes[n].scheduled = self.nodes[n].scheduled.max(d + 1);
                } else {
                    self.set_dep_free_schedule(block, n, d);
                }
            }
            self.check_empty_sat_edges(block, deps, set, d);
            return Outcome::Independent;
        }
        let plan = self.plan(block, deps, set, d, &active);
        let omni = self.instantiate(block, deps, d, &plan, satisfy);
        let mut simplex = Simplex::from_tableau(omni, 0);
        if simplex.init_feasible() {
            trace!("depth {d}: omni-simplex infeasible");
            return Outcome::Failure;
        }
        // Objective: bounding block first (w then u), then omegas, then
        // phis (inner columns first within a node, to bias new rows
        // toward the outer original loops).
        let mut order: Vec<usize> = Vec::new();
        order.extend(plan.w_first..plan.u_first);
        order.extend(plan.u_first..=plan.num_vars);
        order.extend(plan.omega_first..plan.phi_first);
        for &n in set {
            if let Some(&p0) = plan.phi_col.get(&n) {
                let w = self.nodes[n].num_loops();
                order.extend((p0..p0 + w).rev());
            }
        }
        simplex.lex_minimize_seq(&order);
        self.update_schedules(block, d, &plan, &simplex, set);
        self.deactivate_satisfied_edges(block, deps, d, &plan, &simplex)
    }

    fn instantiate(
        &self,
        block: &Block,
        deps: &Dependencies,
        d: usize,
        plan: &OmniPlan,
        satisfy: bool,
    ) -> DMat {
        let mut c = DMat::zero(plan.num_rows, 1 + plan.num_vars);
        for slot in &plan.edges {
            let e = &deps.edges[slot.id];
            let lay = &e.lay;
            let sat_rows = e.sat.rows();
            let in_node = block.addrs[e.input].snode.unwrap();
            let out_node = block.addrs[e.output].snode.unwrap();
            let (x_node, y_node) =
                if e.forward { (in_node, out_node) } else { (out_node, in_node) };
            for r in 0..sat_rows + e.bnd.rows() {
                let (sys, lam0, local) = if r < sat_rows {
                    (&e.sat, slot.sat_lam0, r)
                } else {
                    (&e.bnd, slot.bnd_lam0, r - sat_rows)
                };
                let row = slot.row0 + r;
                c[(row, 0)] = sys[(local, 0)];
                if satisfy && r < sat_rows {
                    // Spend the satisfaction system's w column as a
                    // constant, forcing a strict (>= 1) level.
                    c[(row, 0)] += sys[(local, lay.col_w())];
                }
                for l in 0..lay.num_lambda() {
                    c[(row, lam0 + l)] = sys[(local, 1 + l)];
                }
                if r >= sat_rows {
                    c[(row, slot.w_col)] = sys[(local, lay.col_w())];
                    for p in 0..slot.num_u {
                        c[(row, slot.u0 + p)] = sys[(local, lay.col_u(p))];
                    }
                }
                // Schedule columns: omega and phi per side, folded into
                // the constants where already fixed.
                for (node, ocol, phi0, width) in [
                    (x_node, lay.col_omega_x(), 0, lay.dim0),
                    (y_node, lay.col_omega_y(), lay.dim0, lay.dim1),
                ] {
                    let wv = sys[(local, ocol)];
                    if wv != 0 {
                        if let Some(&oc) = plan.omega_col.get(&node) {
                            c[(row, oc)] += wv;
                        }
                    }
                    let nd = &self.nodes[node];
                    for i in 0..width {
                        let v = sys[(local, lay.col_phi(phi0 + i))];
                        if v == 0 {
                            continue;
                        }
                        if nd.phi_is_scheduled(d) {
                            c[(row, 0)] -= v * nd.phi[(d, i)];
                        } else if let Some(&p0) = plan.phi_col.get(&node) {
                            c[(row, p0 + i)] += v;
                        }
                    }
                }
            }
        }
        // Independence tail: each new phi row must reach at least one
        // along a basis of the directions the chosen rows do not cover.
        let mut row = plan.num_rows - plan.slack_nodes.len();
        for (idx, &n) in plan.slack_nodes.iter().enumerate() {
            let nd = &self.nodes[n];
            let p0 = plan.phi_col[&n];
            c[(row, 0)] = 1;
            c[(row, plan.slack_first + idx)] = -1;
            if d == 0 {
                for i in 0..nd.num_loops() {
                    c[(row, p0 + i)] = 1;
                }
            } else {
                let ns = null_space(&nd.phi_prefix(d - 1));
                for m in 0..ns.rows() {
                    let sign = ns.row(m).iter().find(|&&x| x != 0).map_or(1, |&x| x.signum());
                    for i in 0..nd.num_loops() {
                        c[(row, p0 + i)] += sign * ns[(m, i)];
                    }
                }
            }
            row += 1;
        }
        c
    }

    fn update_schedules(
        &mut self,
        block: &Block,
        d: usize,
        plan: &OmniPlan,
        simplex: &Simplex,
        set: &[SNode],
    ) {
        for &n in set {
            if d >= self.nodes[n].num_loops() {
                continue;
            }
            let Some(&oc) = plan.omega_col.get(&n) else {
                // No active edges constrain this node here.
                if self.nodes[n].phi_is_scheduled(d) {
                    self.nodes[n].offset_omega[d] = 0;
                    self.nodes[n].scheduled = self.nodes[n].scheduled.max(d + 1);
                } else {
                    self.set_dep_free_schedule(block, n, d);
                }
                continue;
            };
            let s_omega = simplex.solution(oc);
            if let Some(&p0) = plan.phi_col.get(&n) {
                let w = self.nodes[n].num_loops();
                let vals: Vec<Rat> = (0..w).map(|i| simplex.solution(p0 + i)).collect();
                let l = polylift_math::lcm(denom_lcm(&vals), s_omega.den);
                let nd = &mut self.nodes[n];
                for (i, v) in vals.iter().enumerate() {
                    nd.phi[(d, i)] = v.scaled(l);
                }
                debug_assert!(!nd.phi.row_is_zero(d), "solved phi row must be non-trivial");
                nd.offset_omega[d] = s_omega.scaled(l);
                nd.scheduled = nd.scheduled.max(d + 1);
                trace!(
                    "node {n:?} depth {d}: phi row {:?}, omega {}",
                    nd.phi.row(d),
                    nd.offset_omega[d]
                );
            } else {
                let nd = &mut self.nodes[n];
                debug_assert!(s_omega.is_integer());
                nd.offset_omega[d] = s_omega.num;
                nd.scheduled = nd.scheduled.max(d + 1);
            }
        }
    }

    fn deactivate_satisfied_edges(
        &mut self,
        block: &Block,
        deps: &mut Dependencies,
        d: usize,
        plan: &OmniPlan,
        simplex: &Simplex,
    ) -> Outcome {
        let mut result = Outcome::Independent;
        for slot in &plan.edges {
            let w = simplex.solution(slot.w_col);
            let u_active = (0..slot.num_u).any(|p| !simplex.solution(slot.u0 + p).is_zero());
            if !w.is_zero() || u_active {
                deps.set_sat_level(slot.id, d as u8);
                result = Outcome::Dependent;
                trace!("edge {:?} carried at depth {d}", slot.id);
            } else {
                self.verify_edge_empty(block, deps, slot.id, d);
            }
        }
        result
    }

    fn verify_edge_empty(&self, block: &Block, deps: &mut Dependencies, id: DepId, d: usize) {
        let e = &deps.edges[id];
        let in_node = block.addrs[e.input].snode.unwrap();
        let out_node = block.addrs[e.output].snode.unwrap();
        let in_phi = self.nodes[in_node].phi_prefix(d);
        let out_phi = self.nodes[out_node].phi_prefix(d);
        let in_off = self.nodes[in_node].offset_omega.clone();
        let out_off = self.nodes[out_node].offset_omega.clone();
        deps.check_empty_sat(id, &in_phi, &in_off, &out_phi, &out_off);
    }

    fn check_empty_sat_edges(&self, block: &Block, deps: &mut Dependencies, set: &[SNode], d: usize) {
        let inside: FxHashSet<SNode> = set.iter().copied().collect();
        for &n in set {
            let mem: SmallVec<[Addr; 4]> = self.nodes[n].mem.clone();
            for &a in mem.iter() {
                for id in deps.out_ids(block, a) {
                    if (deps.sat_level(id) as usize) <= d {
                        continue;
                    }
                    let dst = block.addrs[deps.edges[id].output].snode.expand();
                    if dst.map_or(false, |o| inside.contains(&o)) {
                        self.verify_edge_empty(block, deps, id, d);
                    }
                }
            }
        }
    }

    /// Free schedule row for a node with no active edges at `d`: keep
    /// the original order at the top, otherwise prefer directions that
    /// match the node's own index matrices (unit stride), falling back
    /// to the first still-free induction variable.
    fn set_dep_free_schedule(&mut self, block: &Block, n: SNode, d: usize) {
        let width = self.nodes[n].num_loops();
        self.nodes[n].offset_omega[d] = 0;
        if self.nodes[n].phi_is_scheduled(d) {
            return;
        }
        if d == 0 {
            let nd = &mut self.nodes[n];
            for x in nd.phi.row_mut(0) {
                *x = 0;
            }
            nd.phi[(0, 0)] = 1;
            nd.scheduled = nd.scheduled.max(1);
            return;
        }
        let ns = null_space(&self.nodes[n].phi_prefix(d - 1));
        debug_assert_eq!(ns.rows(), width - d);
        // Candidate rows: index-matrix axes not already covered by the
        // chosen rows, weighted by how many accesses repeat them.
        let mut candidates: Vec<(i64, Vec<i64>)> = Vec::new();
        for &a in &self.nodes[n].mem {
            let ind = &block.addrs[a].index;
            if ind.rows() != width {
                continue;
            }
            let proj = ns.mul(ind);
            for ax in 0..ind.cols() {
                if (0..proj.rows()).all(|r| proj[(r, ax)] == 0) {
                    continue;
                }
                let col: Vec<i64> = (0..width).map(|l| ind[(l, ax)]).collect();
                match candidates.iter_mut().find(|(_, v)| *v == col) {
                    Some((count, _)) => *count += 1,
                    None => candidates.push((1, col)),
                }
            }
        }
        let best = candidates.into_iter().max().map(|(_, v)| v);
        let nd = &mut self.nodes[n];
        match best {
            Some(row) => nd.phi.row_mut(d).copy_from_slice(&row),
            None => {
                for x in nd.phi.row_mut(d) {
                    *x = 0;
                }
                let free = (0..width)
                    .find(|&c| (0..ns.rows()).any(|r| ns[(r, c)] != 0))
                    .expect("a direction must remain for an unsolved level");
                nd.phi[(d, free)] = 1;
            }
        }
        nd.scheduled = nd.scheduled.max(d + 1);
        trace!("node {n:?} depth {d}: free schedule row {:?}", self.nodes[n].phi.row(d));
    }

    /// Split the level's dependence graph into strongly connected
    /// components, schedule them at distinct fusion positions, then
    /// greedily try to re-fuse neighbours.
    fn break_graph(
        &mut self,
        block: &mut Block,
        deps: &mut Dependencies,
        set: &[SNode],
        d: usize,
    ) -> Outcome {
        let comps = self.sccs(block, deps, set, d);
        if comps.len() <= 1 {
            return Outcome::Failure;
        }
        debug!("depth {d}: splitting into {} components", comps.len());
        let mut result = Outcome::Independent;
        for comp in &comps {
            let r = self.solve_split(block, deps, comp, d);
            if !r.ok() {
                return Outcome::Failure;
            }
            result = result & r;
        }
        // Greedy re-fusion pass over topologically adjacent components.
        let mut groups: Vec<Vec<SNode>> = Vec::new();
        let mut seed = comps[0].clone();
        for comp in comps.iter().skip(1) {
            let mut merged = seed.clone();
            merged.extend(comp.iter().copied());
            let st = self.stash(deps, &merged);
            let r = self.solve_split(block, deps, &merged, d);
            if r.ok() {
                result = result & r;
                seed = merged;
            } else {
                self.restore(deps, st);
                groups.push(std::mem::replace(&mut seed, comp.clone()));
            }
        }
        groups.push(seed);
        for (pos, group) in groups.iter().enumerate() {
            for &n in group {
                self.nodes[n].fusion_omega[d] = pos as i64;
            }
        }
        result
    }

    /// Satisfy edges entering the subgraph from outside (they are
    /// ordered by the fusion split), then solve the level and recurse
    /// deeper within the subgraph.
    fn solve_split(
        &mut self,
        block: &mut Block,
        deps: &mut Dependencies,
        comp: &[SNode],
        d: usize,
    ) -> Outcome {
        let inside: FxHashSet<SNode> = comp.iter().copied().collect();
        let mut split = Outcome::Independent;
        for &n in comp {
            let mem: SmallVec<[Addr; 4]> = self.nodes[n].mem.clone();
            for &a in mem.iter() {
                for id in deps.in_ids(block, a) {
                    if !deps.active_at(block, id, d) {
                        continue;
                    }
                    let src = block.addrs[deps.edges[id].input].snode.unwrap();
                    if !inside.contains(&src) {
                        deps.set_sat_level(id, d as u8);
                        split = Outcome::Dependent;
                    }
                }
            }
        }
        let r = self.solve_graph(block, deps, comp, d, false);
        if !r.ok() {
            return r;
        }
        let max_depth = self.max_depth(comp);
        if d + 1 < max_depth {
            let deeper = self.optimize_rec(block, deps, comp, d + 1, max_depth);
            if !deeper.ok() {
                return deeper;
            }
            return r & deeper & split;
        }
        r & split
    }

    /// Tarjan over the active-edge subgraph at depth `d`, returning the
    /// components in topological (execution) order.
    fn sccs(&self, block: &Block, deps: &Dependencies, set: &[SNode], d: usize) -> Vec<Vec<SNode>> {
        let inside: FxHashSet<SNode> = set.iter().copied().collect();
        let mut succ: FxHashMap<SNode, SmallVec<[SNode; 4]>> = FxHashMap::default();
        for &n in set {
            succ.entry(n).or_default();
            for &a in self.nodes[n].mem.iter() {
                for id in deps.out_ids(block, a) {
                    if !deps.active_at(block, id, d) {
                        continue;
                    }
                    let dst = block.addrs[deps.edges[id].output].snode.unwrap();
                    if dst != n && inside.contains(&dst) {
                        succ.get_mut(&n).unwrap().push(dst);
                    }
                }
            }
        }
        let mut index: FxHashMap<SNode, u32> = FxHashMap::default();
        let mut low: FxHashMap<SNode, u32> = FxHashMap::default();
        let mut on_stack: FxHashSet<SNode> = FxHashSet::default();
        let mut stack: Vec<SNode> = Vec::new();
        let mut comps: Vec<Vec<SNode>> = Vec::new();
        let mut counter = 0u32;
        for &root in set {
            if index.contains_key(&root) {
                continue;
            }
            let mut call: Vec<(SNode, usize)> = vec![(root, 0)];
            while let Some(&(v, ci)) = call.last() {
                if ci == 0 && !index.contains_key(&v) {
                    index.insert(v, counter);
                    low.insert(v, counter);
                    counter += 1;
                    stack.push(v);
                    on_stack.insert(v);
                }
                if ci < succ[&v].len() {
                    call.last_mut().unwrap().1 += 1;
                    let w = succ[&v][ci];
                    if !index.contains_key(&w) {
                        call.push((w, 0));
                    } else if on_stack.contains(&w) {
                        let lv = low[&v].min(index[&w]);
                        low.insert(v, lv);
                    }
                } else {
                    if low[&v] == index[&v] {
                        let mut comp = Vec::new();
                        while let Some(w) = stack.pop() {
                            on_stack.remove(&w);
                            comp.push(w);
                            if w == v {
                                break;
                            }
                        }
                        comps.push(comp);
                    }
                    call.pop();
                    if let Some(&(p, _)) = call.last() {
                        let lp = low[&p].min(low[&v]);
                        low.insert(p, lp);
                    }
                }
            }
        }
        // Tarjan emits the condensation in reverse topological order.
        comps.reverse();
        comps
    }

    /// Solve for per-loop shifts that zero the constant offsets of the
    /// node's dependences, and rewrite every touched Farkas tableau so
    /// the ILP sees the shifted frame.
    fn shift_omega(&mut self, block: &mut Block, deps: &mut Dependencies, n: SNode) {
        let d = self.nodes[n].num_loops();
        if d == 0 {
            return;
        }
        let mut a = DMat::zero(d + 1, d + 1);
        let mut rank = 0;
        let mut found_offset = false;
        // (edge, apply to x side, apply to y side)
        let mut touched: Vec<(DepId, bool, bool)> = Vec::new();
        let mem: SmallVec<[Addr; 4]> = self.nodes[n].mem.clone();
        let mut add_row = |a: &mut DMat, rank: &mut usize, x: &[i64]| {
            if *rank > d {
                return;
            }
            a.row_mut(*rank).copy_from_slice(x);
            *rank = update_for_new_row(a, *rank);
        };
        for &m in mem.iter() {
            for id in deps.in_ids(block, m) {
                let e = &deps.edges[id];
                let within = block.addrs[e.input].snode.expand() == Some(n);
                // `n` is the output side here.
                let out_is_x = !e.forward;
                touched.push((id, within || out_is_x, within || !out_is_x));
                let nsym = e.poly.num_sym_cols();
                for r in 0..e.poly.e.rows() {
                    let row = e.poly.e.row(r);
                    let mut x = vec![0i64; d + 1];
                    x[d] = row[0];
                    found_offset |= row[0] != 0;
                    if within {
                        let common = e.lay.dim0.min(e.lay.dim1);
                        for j in 0..common.min(d) {
                            x[j] = row[nsym + j] + row[nsym + e.lay.dim0 + j];
                        }
                    } else {
                        let (off, nd) = if out_is_x {
                            (nsym, e.lay.dim0)
                        } else {
                            (nsym + e.lay.dim0, e.lay.dim1)
                        };
                        for j in 0..nd.min(d) {
                            x[j] = row[off + j];
                        }
                    }
                    add_row(&mut a, &mut rank, &x);
                }
            }
            for id in deps.out_ids(block, m) {
                let e = &deps.edges[id];
                if block.addrs[e.output].snode.expand() == Some(n) {
                    continue; // within-node, handled above
                }
                let in_is_x = e.forward;
                touched.push((id, in_is_x, !in_is_x));
                let nsym = e.poly.num_sym_cols();
                let (off, nd) = if in_is_x {
                    (nsym, e.lay.dim0)
                } else {
                    (nsym + e.lay.dim0, e.lay.dim1)
                };
                for r in 0..e.poly.e.rows() {
                    let row = e.poly.e.row(r);
                    let mut x = vec![0i64; d + 1];
                    x[d] = row[0];
                    found_offset |= row[0] != 0;
                    for j in 0..nd.min(d) {
                        x[j] = row[off + j];
                    }
                    add_row(&mut a, &mut rank, &x);
                }
            }
        }
        if !found_offset || rank == 0 || rank > d {
            return;
        }
        // Back-substitution over the echelon system: a shift is usable
        // only where the division is exact.
        let mut offs = vec![0i64; d];
        let mut nonzero = false;
        for r in 0..rank {
            let off = a[(r, d)];
            if off == 0 {
                continue;
            }
            let Some(c) = (0..d).find(|&c| a[(r, c)] != 0) else {
                return; // a pure constant row: no shift can zero it
            };
            let pivot = a[(r, c)];
            if off % pivot != 0 {
                continue;
            }
            offs[c] = off / pivot;
            nonzero = true;
        }
        if !nonzero {
            return;
        }
        debug!("node {n:?}: shifting loops by {offs:?}");
        self.nodes[n].offsets = Some(offs.clone());
        for (id, apply_x, apply_y) in touched {
            let e = &mut deps.edges[id];
            let nsym = e.poly.num_sym_cols();
            let num_lambda = e.lay.num_lambda();
            for (apply, off, nd) in [
                (apply_x, nsym, e.lay.dim0),
                (apply_y, nsym + e.lay.dim0, e.lay.dim1),
            ] {
                if !apply {
                    continue;
                }
                for (l, &mlt) in offs.iter().enumerate().take(nd) {
                    if mlt == 0 {
                        continue;
                    }
                    for sys in [&mut e.sat, &mut e.bnd] {
                        for ccol in 1..=num_lambda {
                            let v = mlt * sys[(off + l, ccol)];
                            sys[(0, ccol)] -= v;
                        }
                    }
                }
            }
        }
    }

    /// Reset every node to the identity schedule and recompute edge
    /// satisfaction levels against the original loop order.
    fn identity_fallback(&mut self, block: &Block, deps: &mut Dependencies, set: &[SNode]) {
        for &n in set {
            self.nodes[n].set_identity();
        }
        let ids: Vec<DepId> = deps.edges.keys().collect();
        for id in ids {
            deps.edges[id].sat_level = UNSATISFIED;
            deps.edges[id].dead = false;
            let (in_node, out_node, common) = {
                let e = &deps.edges[id];
                let in_node = block.addrs[e.input].snode.unwrap();
                let out_node = block.addrs[e.output].snode.unwrap();
                (in_node, out_node, e.in_num_loops().min(e.out_num_loops()))
            };
            for lvl in 0..common {
                let in_phi = self.nodes[in_node].phi_prefix(lvl);
                let out_phi = self.nodes[out_node].phi_prefix(lvl);
                if deps.check_empty_sat(id, &in_phi, &[], &out_phi, &[]) {
                    // Separated strictly at `lvl`: carried there. The
                    // edge stays alive for legality accounting.
                    deps.edges[id].dead = false;
                    deps.edges[id].sat_level = lvl as u8;
                    break;
                }
            }
        }
    }

    fn stash(&self, deps: &Dependencies, set: &[SNode]) -> Stash {
        let nodes = set.iter().map(|&n| (n, self.nodes[n].clone())).collect();
        let edges = deps.edges.iter().map(|(id, e)| (id, e.sat_level, e.dead)).collect();
        Stash { nodes, edges }
    }

    fn restore(&mut self, deps: &mut Dependencies, st: Stash) {
        for (n, data) in st.nodes {
            self.nodes[n] = data;
        }
        for (id, lvl, dead) in st.edges {
            deps.edges[id].sat_level = lvl;
            deps.edges[id].dead = dead;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Opcode;
    use crate::poly::loops::AffineLoopNest;
    use cranelift_entity::EntityRef;

    #[test]
    fn recurrence_is_carried_at_its_loop() {
        // a[i] = a[i-1] + 1: the only legal level-0 row moves along i,
        // so the edge is carried there and the schedule is the
        // identity.
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
        let base = b.new_base("a");
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![-1], vec![0, 0]);
        let one = b.constant(1);
        let add = b.compute(Opcode::Add, &[ld, one], false);
        let (_, _st) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 1], add);
        let mut deps = Dependencies::new();
        deps.build_all(&mut b);
        assert_eq!(deps.len(), 1);
        let mut lb = LoopBlock::build(&mut b);
        assert_eq!(lb.nodes.len(), 1, "store claims its producer load");
        let r = lb.optimize(&mut b, &mut deps);
        assert_eq!(r, Outcome::Dependent);
        let id = deps.edges.keys().next().unwrap();
        assert_eq!(deps.sat_level(id), 0);
        let node = lb.nodes[SNode::new(0)].clone();
        assert_eq!(node.phi.row(0), &[1]);
        assert_eq!(node.offset_omega, vec![0]);
    }

    #[test]
    fn independent_statements_get_free_schedules() {
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
        let x = b.new_base("x");
        let y = b.new_base("y");
        let c = b.constant(1);
        let idx = DMat::from_rows(&[&[1]]);
        let (_, _sx) = b.store(x, nest, idx.clone(), vec![0], vec![0, 0], c);
        let (_, _sy) = b.store(y, nest, idx, vec![0], vec![0, 1], c);
        let mut deps = Dependencies::new();
        deps.build_all(&mut b);
        assert_eq!(deps.len(), 0);
        let mut lb = LoopBlock::build(&mut b);
        let r = lb.optimize(&mut b, &mut deps);
        assert_eq!(r, Outcome::Independent);
        for (_, nd) in lb.nodes.iter() {
            assert_eq!(nd.phi.row(0), &[1], "free rows keep the original order");
        }
    }

    #[test]
    fn node_grouping_leaves_unclaimed_loads_alone() {
        // A load feeding no store becomes its own scheduled node.
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[4]));
        let base = b.new_base("x");
        let (_, _ld) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0]);
        let lb = LoopBlock::build(&mut b);
        assert_eq!(lb.nodes.len(), 1);
        assert!(!b.addrs[lb.nodes[SNode::new(0)].repr].is_store);
    }
}
