//! Dependence polyhedra, Farkas systems, and the edge registry.
//!
//! For two accesses `x`, `y` on the same base pointer we form the joint
//! polyhedron of iteration pairs referencing the same cell, over the
//! variables `[1 | S | i_x | i_y | t]`: merged symbols, both iteration
//! vectors, and the time dimensions `t` spanning the directions along
//! which the joint index map is constant (repeated accesses to one
//! address). From the polyhedron we derive two Farkas systems over the
//! variables
//!
//! ```text
//! [ l0 | l_ineq | l_eq+ | l_eq- | w_x w_y | phi_x | phi_y | w | u ]
//! ```
//!
//! with one equality row per polyhedron variable. The forward system
//! certifies `sched_y - sched_x >= -(w + u*S)` on the polyhedron, the
//! backward system bounds it: `sched_y - sched_x <= w + u*S`. The
//! system matching the dependence's actual direction becomes its
//! satisfaction (legality) block, the opposite one its bounding block.

use crate::ir::{Addr, Block, Sym};
use crate::poly::comparator::SymbolicComparator;
use cranelift_entity::entity_impl;
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::PrimaryMap;
use log::trace;
use polylift_math::constraints::dedup_rows;
use polylift_math::matrix::dot;
use polylift_math::normal_form::null_space;
use polylift_math::{DMat, Simplex};
use smallvec::SmallVec;

/// A dependence-edge id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepId(u32);
entity_impl!(DepId, "dep");

/// Satisfaction level meaning "not satisfied by any loop": only the
/// sequential order at the innermost position guarantees the edge.
pub const UNSATISFIED: u8 = 255;

/// Joint polyhedron for a pair of accesses.
#[derive(Clone, Debug)]
pub struct DepPoly {
    pub syms: Vec<Sym>,
    pub dim0: usize,
    pub dim1: usize,
    pub time_dim: usize,
    /// Inequalities over `[1 | S | i_x | i_y | t]`.
    pub a: DMat,
    /// Equalities (index match and time ties).
    pub e: DMat,
    /// Squared norm of each time basis vector.
    pub null_step: Vec<i64>,
}

impl DepPoly {
    pub fn num_syms(&self) -> usize {
        self.syms.len()
    }

    /// Columns before the iteration blocks: the constant plus symbols.
    pub fn num_sym_cols(&self) -> usize {
        1 + self.syms.len()
    }

    pub fn num_cols(&self) -> usize {
        self.num_sym_cols() + self.dim0 + self.dim1 + self.time_dim
    }

    pub fn num_phi(&self) -> usize {
        self.dim0 + self.dim1
    }

    pub fn num_lambda(&self) -> usize {
        1 + self.a.rows() + 2 * self.e.rows()
    }

    /// Build the joint polyhedron, or `None` when the accesses provably
    /// never alias.
    pub fn build(block: &Block, x: Addr, y: Addr) -> Option<DepPoly> {
        let xd = &block.addrs[x];
        let yd = &block.addrs[y];
        debug_assert!(xd.sizes_match(yd));
        let nest_x = &block.nests[xd.nest];
        let nest_y = &block.nests[yd.nest];
        let dim0 = xd.num_loops();
        let dim1 = yd.num_loops();

        // Merge symbol lists, preserving x's order.
        let mut syms: Vec<Sym> = nest_x.syms().to_vec();
        let map_y: Vec<usize> = nest_y
            .syms()
            .iter()
            .map(|s| {
                syms.iter().position(|t| t == s).unwrap_or_else(|| {
                    syms.push(*s);
                    syms.len() - 1
                })
            })
            .collect();
        let k = syms.len();
        let nsym = 1 + k;

        // Time dimensions: directions in the common (fused) loop prefix
        // along which both accesses' subscripts are constant.
        let common = xd
            .fusion
            .iter()
            .zip(yd.fusion.iter())
            .take_while(|(a, b)| a == b)
            .count()
            .min(dim0.min(dim1));
        let ns = {
            let mut m = DMat::zero(0, common);
            let dim = xd.array_dim();
            for ax in 0..dim {
                let row: Vec<i64> = (0..common).map(|l| xd.index[(l, ax)]).collect();
                m.push_row(&row);
            }
            for ax in 0..dim {
                let row: Vec<i64> = (0..common).map(|l| yd.index[(l, ax)]).collect();
                m.push_row(&row);
            }
            null_space(&m)
        };
        let time_dim = ns.rows();
        let null_step: Vec<i64> = (0..time_dim).map(|i| dot(ns.row(i), ns.row(i))).collect();

        let ncols = nsym + dim0 + dim1 + time_dim;
        let (xoff, yoff, toff) = (nsym, nsym + dim0, nsym + dim0 + dim1);

        // Inequality block: both loop domains (with their non-negative
        // facets materialized) rewritten into the joint layout.
        let mut a = DMat::zero(0, ncols);
        let ax = nest_x.inequalities();
        for r in 0..ax.rows() {
            let mut row = vec![0; ncols];
            row[0] = ax[(r, 0)];
            for p in 0..nest_x.num_syms() {
                row[1 + p] = ax[(r, 1 + p)];
            }
            for l in 0..dim0 {
                row[xoff + l] = ax[(r, 1 + nest_x.num_syms() + l)];
            }
            a.push_row(&row);
        }
        let ay = nest_y.inequalities();
        for r in 0..ay.rows() {
            let mut row = vec![0; ncols];
            row[0] = ay[(r, 0)];
            for (q, &p) in map_y.iter().enumerate() {
                row[1 + p] = ay[(r, 1 + q)];
            }
            for l in 0..dim1 {
                row[yoff + l] = ay[(r, 1 + nest_y.num_syms() + l)];
            }
            a.push_row(&row);
        }

        // Equality block: per-axis subscript match, then time ties.
        let mut e = DMat::zero(0, ncols);
        for ax_i in 0..xd.array_dim() {
            let mut row = vec![0; ncols];
            row[0] = xd.off_omega[ax_i] - yd.off_omega[ax_i];
            for p in 0..nest_x.num_syms() {
                row[1 + p] += xd.sym_off[(ax_i, p)];
            }
            for (q, &p) in map_y.iter().enumerate() {
                row[1 + p] -= yd.sym_off[(ax_i, q)];
            }
            for l in 0..dim0 {
                row[xoff + l] = xd.index[(l, ax_i)];
            }
            for l in 0..dim1 {
                row[yoff + l] -= yd.index[(l, ax_i)];
            }
            e.push_row(&row);
        }
        for t in 0..time_dim {
            let mut row = vec![0; ncols];
            for l in 0..common {
                row[xoff + l] = ns[(t, l)];
                row[yoff + l] = -ns[(t, l)];
            }
            row[toff + t] = 1;
            e.push_row(&row);
        }

        let mut dp = DepPoly { syms, dim0, dim1, time_dim, a, e, null_step };
        dp.prune_bounds();
        if dp.is_empty() {
            trace!("dep poly {x:?} vs {y:?}: empty, no aliasing");
            return None;
        }
        Some(dp)
    }

    fn comparator(&self) -> SymbolicComparator {
        // Symbols are non-negative but not a trailing block here, so
        // their facets go in as explicit rows.
        let mut a = self.a.clone();
        for p in 0..self.num_syms() {
            let mut row = vec![0; self.num_cols()];
            row[1 + p] = 1;
            a.push_row(&row);
        }
        SymbolicComparator::new(a, Some(self.e.clone()), true, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.comparator().is_empty()
    }

    pub fn prune_bounds(&mut self) {
        dedup_rows(&mut self.a);
        let mut r = 0;
        while r < self.a.rows() {
            let row = self.a.row(r).to_vec();
            let mut rest = self.clone();
            rest.a.remove_row(r);
            if rest.comparator().greater_equal(&row) {
                self.a = rest.a;
            } else {
                r += 1;
            }
        }
    }

    /// Drop the time columns. The tie equalities stay: with their time
    /// variable pinned (0 for the timeless half, the baked step for the
    /// reverse-time half, already folded into the constants) they
    /// constrain the common loops to the same — or step-shifted —
    /// iteration, which is exactly the half-pair's meaning.
    pub fn truncate_time(&mut self) {
        if self.time_dim == 0 {
            return;
        }
        let keep = self.num_sym_cols() + self.dim0 + self.dim1;
        while self.a.cols() > keep {
            let c = self.a.cols() - 1;
            self.a.remove_col(c);
            self.e.remove_col(c);
        }
        self.time_dim = 0;
        self.null_step.clear();
    }

    /// Farkas pair `(fw, bw)` (see the module docs for the layout).
    /// One constraint row per non-time variable of the polyhedron: the
    /// time variables never carry schedule coefficients, so their rows
    /// would only pin the tie multipliers to zero.
    pub fn farkas_pair(&self) -> (DMat, DMat, FarkasLayout) {
        let lay = FarkasLayout {
            num_ineq: self.a.rows(),
            num_eq: self.e.rows(),
            dim0: self.dim0,
            dim1: self.dim1,
            num_syms: self.num_syms(),
        };
        let rows = self.num_cols() - self.time_dim;
        let mut fw = DMat::zero(rows, 1 + lay.num_vars());
        for j in 0..rows {
            if j == 0 {
                fw[(j, lay.col_lambda0())] = 1;
            }
            for r in 0..self.a.rows() {
                fw[(j, lay.col_ineq(r))] = self.a[(r, j)];
            }
            for r in 0..self.e.rows() {
                fw[(j, lay.col_eq_pos(r))] = self.e[(r, j)];
                fw[(j, lay.col_eq_neg(r))] = -self.e[(r, j)];
            }
            // Bounding block: -(w + u * S) on the constant and symbol
            // rows.
            if j == 0 {
                fw[(j, lay.col_w())] = -1;
            } else if j < self.num_sym_cols() {
                fw[(j, lay.col_u(j - 1))] = -1;
            }
        }
        let mut bw = fw.clone();
        // Schedule block. Forward: + phi_x, - phi_y, + w_x, - w_y.
        fw[(0, lay.col_omega_x())] = 1;
        fw[(0, lay.col_omega_y())] = -1;
        bw[(0, lay.col_omega_x())] = -1;
        bw[(0, lay.col_omega_y())] = 1;
        for i in 0..self.num_phi() {
            let s = if i < self.dim0 { 1 } else { -1 };
            let row = self.num_sym_cols() + i;
            fw[(row, lay.col_phi(i))] = s;
            bw[(row, lay.col_phi(i))] = -s;
        }
        (fw, bw, lay)
    }
}

/// Column indices within a Farkas tableau (column 0 is the constants
/// column of the simplex, variables are 1-based).
#[derive(Clone, Copy, Debug)]
pub struct FarkasLayout {
    pub num_ineq: usize,
    pub num_eq: usize,
    pub dim0: usize,
    pub dim1: usize,
    pub num_syms: usize,
}

impl FarkasLayout {
    pub fn num_lambda(&self) -> usize {
        1 + self.num_ineq + 2 * self.num_eq
    }
    pub fn num_phi(&self) -> usize {
        self.dim0 + self.dim1
    }
    /// All variables: lambda, two omegas, phis, w, and the symbol
    /// bounds u.
    pub fn num_vars(&self) -> usize {
        self.num_lambda() + 2 + self.num_phi() + 1 + self.num_syms
    }
    /// Variables kept in the satisfaction system (u dropped).
    pub fn num_sat_vars(&self) -> usize {
        self.num_lambda() + 2 + self.num_phi() + 1
    }
    pub fn col_lambda0(&self) -> usize {
        1
    }
    pub fn col_ineq(&self, r: usize) -> usize {
        2 + r
    }
    pub fn col_eq_pos(&self, r: usize) -> usize {
        2 + self.num_ineq + r
    }
    pub fn col_eq_neg(&self, r: usize) -> usize {
        2 + self.num_ineq + self.num_eq + r
    }
    pub fn col_omega_x(&self) -> usize {
        1 + self.num_lambda()
    }
    pub fn col_omega_y(&self) -> usize {
        2 + self.num_lambda()
    }
    /// `i` indexes `[phi_x | phi_y]` jointly, outer→inner per side.
    pub fn col_phi(&self, i: usize) -> usize {
        3 + self.num_lambda() + i
    }
    pub fn col_w(&self) -> usize {
        3 + self.num_lambda() + self.num_phi()
    }
    pub fn col_u(&self, p: usize) -> usize {
        self.col_w() + 1 + p
    }
}

/// Feasibility probe: fix the schedule variables (those at columns
/// `off+1 ..= off+xs.len()`) to `xs`, zero every later variable, keep
/// only the first `keep_rows` constraints, and ask whether non-negative
/// multipliers for the rest exist. `true` means unsatisfiable.
pub fn unsatisfiable_zero_rem(sys: &DMat, xs: &[i64], off: usize, keep_rows: usize) -> bool {
    if xs.iter().any(|&x| x < 0) {
        return true;
    }
    let mut sub = DMat::zero(keep_rows, 1 + off);
    for r in 0..keep_rows {
        let row = sys.row(r);
        let fixed: i64 = xs.iter().enumerate().map(|(j, &x)| row[1 + off + j] * x).sum();
        sub[(r, 0)] = row[0] - fixed;
        sub.row_mut(r)[1..].copy_from_slice(&row[1..=off]);
    }
    let mut s = Simplex::from_tableau(sub, 0);
    s.init_feasible()
}

/// One dependence edge.
#[derive(Clone, Debug)]
pub struct Dependence {
    pub poly: DepPoly,
    pub lay: FarkasLayout,
    /// Satisfaction (legality) system for the actual direction,
    /// truncated after its `w` column.
    pub sat: DMat,
    /// Bounding system, with the `u` block.
    pub bnd: DMat,
    pub input: Addr,
    pub output: Addr,
    /// True iff the edge runs `x -> y` in the polyhedron's layout; the
    /// input occupies the `dim0` block exactly when `forward`.
    pub forward: bool,
    pub sat_level: u8,
    /// Proven empty under the chosen schedule; skipped everywhere.
    pub dead: bool,
    /// The other half of a time pair.
    pub rev_time_edge: PackedOption<DepId>,
    pub next_in: PackedOption<DepId>,
    pub prev_in: PackedOption<DepId>,
    pub next_out: PackedOption<DepId>,
    pub prev_out: PackedOption<DepId>,
}

impl Dependence {
    pub fn in_num_loops(&self) -> usize {
        if self.forward { self.lay.dim0 } else { self.lay.dim1 }
    }
    pub fn out_num_loops(&self) -> usize {
        if self.forward { self.lay.dim1 } else { self.lay.dim0 }
    }
    /// Structurally inactive past the common depth.
    pub fn inactive_at(&self, depth: usize) -> bool {
        depth >= self.in_num_loops().min(self.out_num_loops())
    }
}

/// Central edge registry. Addresses hold chain heads; edges hold the
/// links.
#[derive(Default)]
pub struct Dependencies {
    pub edges: PrimaryMap<DepId, Dependence>,
}

impl Dependencies {
    pub fn new() -> Dependencies {
        Dependencies::default()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.len() == 0
    }

    /// Analyze every aliasing-relevant pair in the block (shared base,
    /// matching sizes, at least one store).
    pub fn build_all(&mut self, block: &mut Block) {
        let addrs: Vec<Addr> = block.addrs.keys().collect();
        for (i, &x) in addrs.iter().enumerate() {
            for &y in &addrs[i + 1..] {
                let (xd, yd) = (&block.addrs[x], &block.addrs[y]);
                if xd.base != yd.base || !(xd.is_store || yd.is_store) {
                    continue;
                }
                if !xd.sizes_match(yd) {
                    continue;
                }
                self.check(block, x, y);
            }
        }
        trace!("dependence analysis: {} edges", self.edges.len());
    }

    /// Build the polyhedron for `(x, y)`, decide direction (and time
    /// pairing), and register the resulting edge(s).
    pub fn check(&mut self, block: &mut Block, x: Addr, y: Addr) {
        let Some(dp) = DepPoly::build(block, x, y) else {
            return;
        };
        if dp.time_dim == 0 {
            self.timeless_check(block, dp, x, y);
        } else {
            self.time_check(block, dp, x, y);
        }
    }

    fn timeless_check(&mut self, block: &mut Block, dp: DepPoly, x: Addr, y: Addr) {
        let (fw, bw, lay) = dp.farkas_pair();
        let keep = dp.num_cols() - dp.time_dim;
        let Some(fwd) = check_direction(block, &fw, &bw, x, y, &lay, keep) else {
            trace!("inconsistent direction pair {x:?}/{y:?}: zero dependence");
            return;
        };
        let (sat, bnd, input, output) = if fwd {
            (truncate_sat(&fw, &lay), bw, x, y)
        } else {
            (truncate_sat(&bw, &lay), fw, y, x)
        };
        let id = self.edges.push(Dependence {
            poly: dp,
            lay,
            sat,
            bnd,
            input,
            output,
            forward: fwd,
            sat_level: UNSATISFIED,
            dead: false,
            rev_time_edge: None.into(),
            next_in: None.into(),
            prev_in: None.into(),
            next_out: None.into(),
            prev_out: None.into(),
        });
        self.link(block, id);
        trace!("edge {id:?}: {input:?} -> {output:?} (forward={fwd})");
    }

    fn time_check(&mut self, block: &mut Block, mut dp: DepPoly, x: Addr, y: Addr) {
        let (fw, bw, lay) = dp.farkas_pair();
        let keep = dp.num_cols() - dp.time_dim;
        let Some(fwd) = check_direction(block, &fw, &bw, x, y, &lay, keep) else {
            trace!("inconsistent direction pair {x:?}/{y:?}: zero dependence");
            return;
        };
        // The timeless half, exactly as in the no-time case.
        let mut poly0 = dp.clone();
        poly0.truncate_time();
        let (sat0, bnd0, in0, out0) = if fwd {
            (truncate_sat(&fw, &lay), bw.clone(), x, y)
        } else {
            (truncate_sat(&bw, &lay), fw.clone(), y, x)
        };
        // The reverse-time half: bake each time dimension at the step
        // whose direction points from `out0` back to `in0`, so the pair
        // closes the cycle.
        let mut rfw = fw;
        let mut rbw = bw;
        let nsym = dp.num_sym_cols();
        let keep_cols = nsym + dp.dim0 + dp.dim1;
        for t in 0..dp.time_dim {
            let step = dp.null_step[t];
            let tcol = keep_cols + t;
            // Probe with t = +step: which way does the shifted
            // dependence point?
            let mut pfw = rfw.clone();
            let mut pbw = rbw.clone();
            bake_time(&mut pfw, &mut pbw, &dp, &lay, tcol, step);
            let dir = check_direction(block, &pfw, &pbw, x, y, &lay, keep);
            let chosen = if dir == Some(fwd) { -step } else { step };
            bake_time(&mut rfw, &mut rbw, &dp, &lay, tcol, chosen);
            for c in 0..dp.a.rows() {
                dp.a[(c, 0)] += dp.a[(c, tcol)] * chosen;
            }
            for c in 0..dp.e.rows() {
                dp.e[(c, 0)] += dp.e[(c, tcol)] * chosen;
            }
        }
        let (sat1, bnd1, in1, out1) = if fwd {
            (truncate_sat(&rbw, &lay), rfw, y, x)
        } else {
            (truncate_sat(&rfw, &lay), rbw, x, y)
        };
        dp.truncate_time();
        let id0 = self.edges.push(Dependence {
            poly: poly0,
            lay,
            sat: sat0,
            bnd: bnd0,
            input: in0,
            output: out0,
            forward: fwd,
            sat_level: UNSATISFIED,
            dead: false,
            rev_time_edge: None.into(),
            next_in: None.into(),
            prev_in: None.into(),
            next_out: None.into(),
            prev_out: None.into(),
        });
        let id1 = self.edges.push(Dependence {
            poly: dp,
            lay,
            sat: sat1,
            bnd: bnd1,
            input: in1,
            output: out1,
            forward: !fwd,
            sat_level: UNSATISFIED,
            dead: false,
            rev_time_edge: Some(id0).into(),
            next_in: None.into(),
            prev_in: None.into(),
            next_out: None.into(),
            prev_out: None.into(),
        });
        self.edges[id0].rev_time_edge = Some(id1).into();
        self.link(block, id0);
        self.link(block, id1);
        trace!("time pair {id0:?}/{id1:?}: {x:?} <-> {y:?} (forward={fwd})");
    }

    fn link(&mut self, block: &mut Block, id: DepId) {
        let (input, output) = (self.edges[id].input, self.edges[id].output);
        let old_out = block.addrs[input].edge_out;
        self.edges[id].next_out = old_out;
        if let Some(o) = old_out.expand() {
            self.edges[o].prev_out = Some(id).into();
        }
        block.addrs[input].edge_out = Some(id).into();
        let old_in = block.addrs[output].edge_in;
        self.edges[id].next_in = old_in;
        if let Some(o) = old_in.expand() {
            self.edges[o].prev_in = Some(id).into();
        }
        block.addrs[output].edge_in = Some(id).into();
    }

    /// Ids of edges whose output is `a` (skipping dead edges and
    /// dropped endpoints).
    pub fn in_ids(&self, block: &Block, a: Addr) -> SmallVec<[DepId; 8]> {
        let mut out = SmallVec::new();
        let mut cur = block.addrs[a].edge_in;
        while let Some(id) = cur.expand() {
            let e = &self.edges[id];
            if !e.dead && !block.addrs[e.input].dropped && !block.addrs[e.output].dropped {
                out.push(id);
            }
            cur = e.next_in;
        }
        out
    }

    /// Ids of edges whose input is `a`.
    pub fn out_ids(&self, block: &Block, a: Addr) -> SmallVec<[DepId; 8]> {
        let mut out = SmallVec::new();
        let mut cur = block.addrs[a].edge_out;
        while let Some(id) = cur.expand() {
            let e = &self.edges[id];
            if !e.dead && !block.addrs[e.input].dropped && !block.addrs[e.output].dropped {
                out.push(id);
            }
            cur = e.next_out;
        }
        out
    }

    /// Active at `depth`: not yet satisfied at an outer level and both
    /// endpoints still have a loop there.
    pub fn active_at(&self, block: &Block, id: DepId, depth: usize) -> bool {
        let e = &self.edges[id];
        !e.dead
            && !block.addrs[e.input].dropped
            && !block.addrs[e.output].dropped
            && (e.sat_level as usize) > depth
            && !e.inactive_at(depth)
    }

    pub fn sat_level(&self, id: DepId) -> u8 {
        self.edges[id].sat_level
    }

    pub fn set_sat_level(&mut self, id: DepId, depth: u8) {
        let lvl = &mut self.edges[id].sat_level;
        debug_assert!(*lvl == UNSATISFIED || *lvl >= depth);
        *lvl = depth;
    }

    /// Unlink `id` from its input's output chain (for re-sorting).
    pub fn remove_out_edge(&mut self, block: &mut Block, id: DepId) {
        let (prev, next, input) =
            (self.edges[id].prev_out, self.edges[id].next_out, self.edges[id].input);
        match prev.expand() {
            Some(p) => self.edges[p].next_out = next,
            None => block.addrs[input].edge_out = next,
        }
        if let Some(n) = next.expand() {
            self.edges[n].prev_out = prev;
        }
        self.edges[id].prev_out = None.into();
        self.edges[id].next_out = None.into();
    }

    /// Push `id` to the front of its input's output chain.
    pub fn push_out_edge_front(&mut self, block: &mut Block, id: DepId) {
        let input = self.edges[id].input;
        let old = block.addrs[input].edge_out;
        self.edges[id].next_out = old;
        self.edges[id].prev_out = None.into();
        if let Some(o) = old.expand() {
            self.edges[o].prev_out = Some(id).into();
        }
        block.addrs[input].edge_out = Some(id).into();
    }

    /// Is the edge provably empty once both endpoints run under the
    /// given partial schedules (rows `0..=depth`)? Empty edges are
    /// marked dead.
    pub fn check_empty_sat(
        &mut self,
        id: DepId,
        in_phi: &DMat,
        in_off: &[i64],
        out_phi: &DMat,
        out_off: &[i64],
    ) -> bool {
        let e = &self.edges[id];
        let dp = &e.poly;
        let nsym = dp.num_sym_cols();
        let ncols = dp.num_cols();
        let levels = in_phi.rows().min(out_phi.rows());
        // Equalities: schedule values agree at every solved level; an
        // instance separated strictly at an outer level is already
        // ordered there, so only the equal-schedule slice can still
        // carry the dependence.
        let mut eq = dp.e.clone();
        let (x_phi, x_off, y_phi, y_off) = if e.forward {
            (in_phi, in_off, out_phi, out_off)
        } else {
            (out_phi, out_off, in_phi, in_off)
        };
        for r in 0..levels {
            let mut row = vec![0; ncols];
            row[0] = x_off.get(r).copied().unwrap_or(0) - y_off.get(r).copied().unwrap_or(0);
            for l in 0..dp.dim0.min(x_phi.cols()) {
                row[nsym + l] = x_phi[(r, l)];
            }
            for l in 0..dp.dim1.min(y_phi.cols()) {
                row[nsym + dp.dim0 + l] -= y_phi[(r, l)];
            }
            eq.push_row(&row);
        }
        let mut a = dp.a.clone();
        for p in 0..dp.num_syms() {
            let mut row = vec![0; ncols];
            row[1 + p] = 1;
            a.push_row(&row);
        }
        let empty = SymbolicComparator::new(a, Some(eq), true, 0).is_empty();
        if empty {
            trace!("edge {id:?} empty under chosen schedule; dropping");
            self.edges[id].dead = true;
        }
        empty
    }
}

fn truncate_sat(sys: &DMat, lay: &FarkasLayout) -> DMat {
    let keep = 1 + lay.num_sat_vars();
    let mut out = DMat::zero(sys.rows(), keep);
    for r in 0..sys.rows() {
        out.row_mut(r).copy_from_slice(&sys.row(r)[..keep]);
    }
    out
}

/// Shift the Farkas systems' constant-variable row as if the time
/// column `tcol` of the polyhedron were fixed at `step`.
fn bake_time(
    fw: &mut DMat,
    bw: &mut DMat,
    dp: &DepPoly,
    lay: &FarkasLayout,
    tcol: usize,
    step: i64,
) {
    for c in 0..dp.a.rows() {
        let d = dp.a[(c, tcol)] * step;
        if d != 0 {
            fw[(0, lay.col_ineq(c))] += d;
            bw[(0, lay.col_ineq(c))] += d;
        }
    }
    for c in 0..dp.e.rows() {
        let d = dp.e[(c, tcol)] * step;
        if d != 0 {
            fw[(0, lay.col_eq_pos(c))] += d;
            fw[(0, lay.col_eq_neg(c))] -= d;
            bw[(0, lay.col_eq_pos(c))] += d;
            bw[(0, lay.col_eq_neg(c))] -= d;
        }
    }
}

/// Structural direction of the dependence between `x` and `y`:
/// `Some(true)` means `x` happens before `y` on the original schedule,
/// `None` that both directions are infeasible (inconsistent pair, no
/// dependence). Decided by the fusion-omega prefix where it differs,
/// otherwise by probing each common level with unit schedules.
fn check_direction(
    block: &Block,
    fw: &DMat,
    bw: &DMat,
    x: Addr,
    y: Addr,
    lay: &FarkasLayout,
    keep_rows: usize,
) -> Option<bool> {
    let xf = &block.addrs[x].fusion;
    let yf = &block.addrs[y].fusion;
    let common = lay.dim0.min(lay.dim1);
    let num_lambda = lay.num_lambda();
    for i in 0..common {
        if xf[i] != yf[i] {
            return Some(yf[i] > xf[i]);
        }
        // Unit probe: schedule both statements by loop `i` alone.
        let mut xs = vec![0; 2 + lay.num_phi()];
        xs[2 + i] = 1;
        xs[2 + lay.dim0 + i] = 1;
        let fw_unsat = unsatisfiable_zero_rem(fw, &xs, num_lambda, keep_rows);
        let bw_unsat = unsatisfiable_zero_rem(bw, &xs, num_lambda, keep_rows);
        match (fw_unsat, bw_unsat) {
            (true, true) => return None,
            (true, false) => return Some(false),
            (false, true) => return Some(true),
            (false, false) => {}
        }
    }
    // Both directions stay representable on every common level; the
    // fusion order at the body level decides.
    Some(yf[common] >= xf[common])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Block;
    use crate::poly::loops::AffineLoopNest;

    fn one_loop_block(trip: i64) -> (Block, crate::ir::Nest) {
        let mut b = Block::new();
        let nest = b.add_nest(AffineLoopNest::rectangular(&[trip]));
        (b, nest)
    }

    #[test]
    fn forward_shift_dependence() {
        // a[i] stored at position 0, a[i-1] loaded at position 1:
        // store(i) -> load(i+1).
        let (mut b, nest) = one_loop_block(10);
        let base = b.new_base("a");
        let c = b.constant(1);
        let (_, st) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0], c);
        let (_, ld) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![-1], vec![0, 1]);
        let mut deps = Dependencies::new();
        deps.check(&mut b, st, ld);
        assert_eq!(deps.len(), 1);
        let e = &deps.edges[DepId::from_u32(0)];
        assert_eq!(e.input, st);
        assert_eq!(e.output, ld);
        assert!(e.forward);
        assert_eq!(e.sat_level, UNSATISFIED);
    }

    #[test]
    fn mismatched_axis_decompositions_are_not_paired() {
        // Same base, but the load re-views the allocation through a
        // different shape: the pair never reaches the polyhedron.
        use crate::ir::AxisSize;
        let (mut b, nest) = one_loop_block(10);
        let base = b.new_sized_base("a", vec![AxisSize::Fixed(64)]);
        let c = b.constant(1);
        let (_, _st) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0], c);
        let (_, ld) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 1]);
        b.addrs[ld].sizes = vec![AxisSize::Fixed(32)];
        let mut deps = Dependencies::new();
        deps.build_all(&mut b);
        assert_eq!(deps.len(), 0);
    }

    #[test]
    fn no_edge_for_disjoint_offsets() {
        // a[2i] vs a[2i+1] never alias.
        let (mut b, nest) = one_loop_block(10);
        let base = b.new_base("a");
        let c = b.constant(1);
        let (_, st) = b.store(base, nest, DMat::from_rows(&[&[2]]), vec![0], vec![0, 0], c);
        let (_, ld) = b.load(base, nest, DMat::from_rows(&[&[2]]), vec![1], vec![0, 1]);
        let mut deps = Dependencies::new();
        deps.check(&mut b, st, ld);
        // The joint polyhedron has 2 i_x = 2 i_y + 1: no integer
        // solutions, but rationally it is non-empty, so an edge may
        // survive; a GCD-style refinement is future work. What must
        // hold: no panic and a consistent direction if present.
        for (_, e) in deps.edges.iter() {
            assert!(e.input == st || e.input == ld);
        }
    }

    #[test]
    fn reuse_creates_time_pair() {
        // s[0] accumulated in a loop: store s[0] and load s[0] with no
        // loop-variant subscript. One timeless edge (load -> store in
        // body order) plus the reverse-time store -> load edge.
        let (mut b, nest) = one_loop_block(10);
        let base = b.new_base("s");
        let (_, ld) = b.load(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 0]);
        let lv = b.load_of(ld).unwrap();
        let (_, st) = b.store(base, nest, DMat::from_rows(&[&[0]]), vec![0], vec![0, 1], lv);
        let mut deps = Dependencies::new();
        deps.check(&mut b, ld, st);
        assert_eq!(deps.len(), 2);
        let e0 = &deps.edges[DepId::from_u32(0)];
        let e1 = &deps.edges[DepId::from_u32(1)];
        assert_eq!(e0.rev_time_edge.expand(), Some(DepId::from_u32(1)));
        assert_eq!(e1.rev_time_edge.expand(), Some(DepId::from_u32(0)));
        // Timeless half follows body order (load before store), the
        // time half runs store -> load.
        assert_eq!(e0.input, ld);
        assert_eq!(e0.output, st);
        assert_eq!(e1.input, st);
        assert_eq!(e1.output, ld);
        // Time columns are gone from both stored polyhedra.
        assert_eq!(e0.poly.time_dim, 0);
        assert_eq!(e1.poly.time_dim, 0);
    }

    #[test]
    fn farkas_layout_shapes() {
        let (mut b, nest) = one_loop_block(10);
        let base = b.new_base("a");
        let c = b.constant(1);
        let (_, st) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0], c);
        let (_, ld) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![-1], vec![0, 1]);
        let dp = DepPoly::build(&b, st, ld).unwrap();
        let (fw, bw, lay) = dp.farkas_pair();
        // One constraint row per polyhedron variable.
        assert_eq!(fw.rows(), dp.num_cols());
        assert_eq!(fw.cols(), 1 + lay.num_vars());
        assert_eq!(bw.rows(), fw.rows());
        // Forward: +phi_x at the x row, -phi_y at the y row.
        let nsym = dp.num_sym_cols();
        assert_eq!(fw[(nsym, lay.col_phi(0))], 1);
        assert_eq!(fw[(nsym + dp.dim0, lay.col_phi(dp.dim0))], -1);
        assert_eq!(bw[(nsym, lay.col_phi(0))], -1);
    }
}
