//! Affine loop nests as integer constraint systems.
//!
//! A nest of depth `d` with `k` dynamic symbols is the set of integer
//! points `i` with `A * [1; s; i] >= 0`, loop columns ordered
//! outer→inner. Nests constructed from backedge-taken counts start in
//! "non-negative" form: the `i_j >= 0` facets are implicit and only
//! materialized when an operation (rotation, elimination) needs them.

use super::comparator::SymbolicComparator;
use crate::ir::Sym;
use cranelift_entity::PrimaryMap;
use log::trace;
use polylift_math::constraints::{dedup_rows, fourier_motzkin};
use polylift_math::gcd::normalize_row;
use polylift_math::DMat;
use std::fmt::Write;

/// A backedge-taken count, affine in the symbols and outer induction
/// variables — or not affine at all, in which case the nest cannot be
/// modeled and the block is skipped.
#[derive(Clone, Debug)]
pub enum AffineExpr {
    Affine {
        constant: i64,
        syms: Vec<(Sym, i64)>,
        /// `(outer loop position, coefficient)` pairs; the position is
        /// the 0-based depth of the referenced loop.
        ivs: Vec<(usize, i64)>,
    },
    NonAffine,
}

impl AffineExpr {
    pub fn constant(c: i64) -> AffineExpr {
        AffineExpr::Affine { constant: c, syms: Vec::new(), ivs: Vec::new() }
    }

    pub fn sym(s: Sym) -> AffineExpr {
        AffineExpr::Affine { constant: 0, syms: vec![(s, 1)], ivs: Vec::new() }
    }

    pub fn sym_minus(s: Sym, c: i64) -> AffineExpr {
        AffineExpr::Affine { constant: -c, syms: vec![(s, 1)], ivs: Vec::new() }
    }

    /// `sym - c - iv(depth)`, the usual triangular bound.
    pub fn sym_minus_iv(s: Sym, c: i64, depth: usize) -> AffineExpr {
        AffineExpr::Affine { constant: -c, syms: vec![(s, 1)], ivs: vec![(depth, -1)] }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("backedge-taken count of loop {depth} is not affine")]
    NonAffine { depth: usize },
    #[error("backedge-taken count of loop {depth} references loop {referenced} which is not outer to it")]
    NotOuter { depth: usize, referenced: usize },
    #[error("unknown symbol in backedge-taken count of loop {depth}")]
    UnknownSymbol { depth: usize },
}

#[derive(Clone, Debug)]
pub struct AffineLoopNest {
    syms: Vec<Sym>,
    num_loops: usize,
    /// `m x (1 + k + d)`.
    a: DMat,
    /// Implicit `i_j >= 0` facets for every loop column.
    non_negative: bool,
}

impl AffineLoopNest {
    /// Descend a chain of backedge-taken counts, outer to inner, and
    /// emit one `BT_j - i_j >= 0` row per loop.
    pub fn from_backedge_counts(
        counts: &[AffineExpr],
        syms: Vec<Sym>,
    ) -> Result<AffineLoopNest, BuildError> {
        let d = counts.len();
        let k = syms.len();
        let mut a = DMat::zero(d, 1 + k + d);
        for (j, bt) in counts.iter().enumerate() {
            match bt {
                AffineExpr::NonAffine => return Err(BuildError::NonAffine { depth: j }),
                AffineExpr::Affine { constant, syms: cs, ivs } => {
                    a[(j, 0)] = *constant;
                    for &(s, c) in cs {
                        let Some(p) = syms.iter().position(|&x| x == s) else {
                            return Err(BuildError::UnknownSymbol { depth: j });
                        };
                        a[(j, 1 + p)] += c;
                    }
                    for &(iv, c) in ivs {
                        if iv >= j {
                            return Err(BuildError::NotOuter { depth: j, referenced: iv });
                        }
                        a[(j, 1 + k + iv)] += c;
                    }
                    a[(j, 1 + k + j)] = -1;
                }
            }
        }
        trace!("affine nest built: {d} loops, {k} symbols");
        Ok(AffineLoopNest { syms, num_loops: d, a, non_negative: true })
    }

    /// Constant-trip rectangular nest (`0 <= i_j < trips[j]`), handy in
    /// tests and for front ends with fully static bounds.
    pub fn rectangular(trips: &[i64]) -> AffineLoopNest {
        let exprs: Vec<AffineExpr> =
            trips.iter().map(|&t| AffineExpr::constant(t - 1)).collect();
        AffineLoopNest::from_backedge_counts(&exprs, Vec::new()).unwrap()
    }

    pub fn num_loops(&self) -> usize {
        self.num_loops
    }

    pub fn num_syms(&self) -> usize {
        self.syms.len()
    }

    pub fn syms(&self) -> &[Sym] {
        &self.syms
    }

    pub fn is_non_negative(&self) -> bool {
        self.non_negative
    }

    /// Constraint matrix as stored (implicit facets not included).
    pub fn a(&self) -> &DMat {
        &self.a
    }

    /// Full inequality system with the implicit `i_j >= 0` facets
    /// materialized.
    pub fn inequalities(&self) -> DMat {
        let mut a = self.a.clone();
        if self.non_negative {
            let (k, d) = (self.num_syms(), self.num_loops);
            for j in 0..d {
                let mut row = vec![0; 1 + k + d];
                row[1 + k + j] = 1;
                a.push_row(&row);
            }
        }
        a
    }

    /// Append the implicit facets as real rows.
    pub fn add_zero_lower_bounds(&mut self) {
        if self.non_negative {
            self.a = self.inequalities();
            self.non_negative = false;
        }
    }

    fn comparator(&self) -> SymbolicComparator {
        let nn = if self.non_negative {
            self.num_syms() + self.num_loops
        } else {
            // Symbols stay non-negative, but they are not a trailing
            // block once loop columns stop being implicit; add their
            // facets explicitly instead.
            0
        };
        let mut a = self.a.clone();
        if !self.non_negative {
            let (k, d) = (self.num_syms(), self.num_loops);
            for p in 0..k {
                let mut row = vec![0; 1 + k + d];
                row[1 + p] = 1;
                a.push_row(&row);
            }
        }
        SymbolicComparator::new(a, None, true, nn)
    }

    pub fn is_empty(&self) -> bool {
        self.comparator().is_empty()
    }

    /// Remove rows implied by the remaining system. Idempotent; the
    /// solution set is untouched.
    pub fn prune_bounds(&mut self) {
        dedup_rows(&mut self.a);
        let mut r = 0;
        while r < self.a.rows() {
            let row = self.a.row(r).to_vec();
            let mut rest = self.a.clone();
            rest.remove_row(r);
            let stripped = AffineLoopNest {
                syms: self.syms.clone(),
                num_loops: self.num_loops,
                a: rest.clone(),
                non_negative: self.non_negative,
            };
            if stripped.comparator().greater_equal(&row) {
                trace!("prune_bounds: dropping redundant row {row:?}");
                self.a = rest;
            } else {
                r += 1;
            }
        }
    }

    /// Right-multiply the loop columns by `r` (the scaled inverse of a
    /// schedule), scaling constant and symbol columns by `denom`.
    ///
    /// A non-negative nest only stays implicit when `r` cannot send the
    /// old facets negative; anything but a non-negative matrix forces
    /// the facets explicit first.
    pub fn rotate(&self, r: &DMat, denom: i64) -> AffineLoopNest {
        debug_assert_eq!(r.rows(), self.num_loops);
        debug_assert_eq!(r.cols(), self.num_loops);
        debug_assert!(denom > 0);
        let preserves_sign = (0..r.rows()).all(|i| r.row(i).iter().all(|&x| x >= 0));
        let mut base = self.clone();
        if self.non_negative && !preserves_sign {
            base.add_zero_lower_bounds();
        }
        let (k, d) = (base.num_syms(), base.num_loops);
        let m = base.a.rows();
        let mut loops = DMat::zero(m, d);
        for i in 0..m {
            loops.row_mut(i).copy_from_slice(&base.a.row(i)[1 + k..]);
        }
        let rotated = loops.mul(r);
        let mut a = DMat::zero(m, 1 + k + d);
        for i in 0..m {
            for j in 0..=k {
                a[(i, j)] = denom * base.a[(i, j)];
            }
            a.row_mut(i)[1 + k..].copy_from_slice(rotated.row(i));
            normalize_row(a.row_mut(i));
        }
        AffineLoopNest {
            syms: base.syms,
            num_loops: d,
            a,
            non_negative: base.non_negative,
        }
    }

    /// Fourier–Motzkin elimination of loop `v` (0-based, outer→inner).
    pub fn remove_loop(&self, v: usize) -> AffineLoopNest {
        debug_assert!(v < self.num_loops);
        let col = 1 + self.num_syms() + v;
        let sys = self.inequalities();
        let a = fourier_motzkin(&sys, col);
        let mut out = AffineLoopNest {
            syms: self.syms.clone(),
            num_loops: self.num_loops - 1,
            a,
            non_negative: false,
        };
        out.prune_bounds();
        out
    }

    /// Turn the `n` outermost loops into fresh dynamic symbols capturing
    /// their values.
    pub fn peel_outer(
        &self,
        n: usize,
        syms: &mut PrimaryMap<Sym, String>,
    ) -> AffineLoopNest {
        debug_assert!(n <= self.num_loops);
        let d = self.num_loops;
        let mut new_syms = self.syms.clone();
        for j in 0..n {
            new_syms.push(syms.push(format!("peeled_iv{j}")));
        }
        // Column layout [1 | s | i_0..i_{n-1} | rest] reads unchanged
        // as [1 | s, i_0..i_{n-1} | rest]: the peeled columns simply
        // reinterpret as symbol columns (non-negative either way).
        let mut out = AffineLoopNest {
            syms: new_syms,
            num_loops: d - n,
            a: self.a.clone(),
            non_negative: self.non_negative,
        };
        out.prune_bounds();
        out
    }

    /// Drop the innermost loop column. Precondition: no other row
    /// references the innermost induction variable.
    pub fn remove_inner_most(&self) -> AffineLoopNest {
        let d = self.num_loops;
        debug_assert!(d > 0);
        let col = 1 + self.num_syms() + d - 1;
        let mut a = DMat::zero(0, self.a.cols());
        for r in 0..self.a.rows() {
            if self.a[(r, col)] == 0 {
                a.push_row(self.a.row(r));
            }
        }
        a.remove_col(col);
        AffineLoopNest {
            syms: self.syms.clone(),
            num_loops: d - 1,
            a,
            non_negative: self.non_negative,
        }
    }

    /// Render the bounds of the innermost loop in the given direction
    /// (`sign > 0` upper bounds, `sign < 0` lower bounds), for
    /// diagnostics.
    pub fn bound_text(&self, sign: i64, names: &PrimaryMap<Sym, String>) -> String {
        let col = 1 + self.num_syms() + self.num_loops - 1;
        let mut out = String::new();
        for r in 0..self.a.rows() {
            let c = self.a[(r, col)];
            if c * sign <= 0 {
                continue;
            }
            // rest + c*i >= 0 reads `|c|*i >= -rest` when c > 0 and
            // `|c|*i <= rest` otherwise.
            let (rel, flip) = if c > 0 { (">=", -1) } else { ("<=", 1) };
            let _ = write!(out, "{}*i{} {} ", c.abs(), self.num_loops - 1, rel);
            let mut first = true;
            let row = self.a.row(r);
            if row[0] != 0 {
                let _ = write!(out, "{}", flip * row[0]);
                first = false;
            }
            for (p, &s) in self.syms.iter().enumerate() {
                let coef = flip * row[1 + p];
                if coef != 0 {
                    if !first {
                        let _ = write!(out, " + ");
                    }
                    let _ = write!(out, "{}*{}", coef, names[s]);
                    first = false;
                }
            }
            for j in 0..self.num_loops - 1 {
                let coef = flip * row[1 + self.num_syms() + j];
                if coef != 0 {
                    if !first {
                        let _ = write!(out, " + ");
                    }
                    let _ = write!(out, "{coef}*i{j}");
                    first = false;
                }
            }
            if first {
                let _ = write!(out, "0");
            }
            let _ = writeln!(out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectangular_shape() {
        let n = AffineLoopNest::rectangular(&[10, 20]);
        assert_eq!(n.num_loops(), 2);
        assert_eq!(n.a()[(0, 0)], 9);
        assert_eq!(n.a()[(0, 1)], -1);
        assert!(!n.is_empty());
    }

    #[test]
    fn non_affine_is_rejected() {
        let r = AffineLoopNest::from_backedge_counts(
            &[AffineExpr::constant(3), AffineExpr::NonAffine],
            Vec::new(),
        );
        assert_eq!(r.unwrap_err(), BuildError::NonAffine { depth: 1 });
    }

    #[test]
    fn triangular_nest() {
        // for i in 0..N { for j in i+1..N } — BT_j = N - 2 - i at j's
        // depth (j runs from i+1, modeled as j' in 0..N-1-i).
        let mut syms = PrimaryMap::<Sym, String>::new();
        let n_sym = syms.push("N".to_string());
        let nest = AffineLoopNest::from_backedge_counts(
            &[
                AffineExpr::sym_minus(n_sym, 1),
                AffineExpr::sym_minus_iv(n_sym, 2, 0),
            ],
            vec![n_sym],
        )
        .unwrap();
        assert_eq!(nest.num_loops(), 2);
        // Row 1: N - 2 - i - j >= 0.
        assert_eq!(nest.a().row(1), &[-2, 1, -1, -1]);
        assert!(!nest.is_empty());
    }

    #[test]
    fn prune_is_idempotent() {
        let mut n = AffineLoopNest::rectangular(&[10]);
        // Redundant: i <= 20.
        let mut a = n.a().clone();
        a.push_row(&[20, -1]);
        n.a = a;
        n.prune_bounds();
        assert_eq!(n.a().rows(), 1);
        let before = n.a().clone();
        n.prune_bounds();
        assert_eq!(n.a(), &before);
    }

    #[test]
    fn rotation_identity_keeps_rows() {
        let n = AffineLoopNest::rectangular(&[4, 4]);
        let r = n.rotate(&DMat::identity(2), 1);
        assert!(r.is_non_negative());
        assert_eq!(r.a(), n.a());
    }

    #[test]
    fn rotation_with_negative_entries_goes_explicit() {
        let n = AffineLoopNest::rectangular(&[4, 4]);
        // Skew inverse has a negative entry.
        let r = n.rotate(&DMat::from_rows(&[&[1, 0], &[-1, 1]]), 1);
        assert!(!r.is_non_negative());
        // The old i >= 0 facets must survive as rows.
        assert_eq!(r.a().rows(), 4);
        assert!(!r.is_empty());
    }

    #[test]
    fn remove_loop_projects() {
        // 0 <= i < 10, 0 <= j <= i: removing j keeps 0 <= i < 10.
        let mut syms = PrimaryMap::<Sym, String>::new();
        let _ = &mut syms;
        let nest = AffineLoopNest::from_backedge_counts(
            &[
                AffineExpr::constant(9),
                AffineExpr::Affine { constant: 0, syms: vec![], ivs: vec![(0, 1)] },
            ],
            Vec::new(),
        )
        .unwrap();
        let projected = nest.remove_loop(1);
        assert_eq!(projected.num_loops(), 1);
        assert!(!projected.is_empty());
    }

    #[test]
    fn remove_inner_most_drops_rows() {
        let nest = AffineLoopNest::rectangular(&[5, 7]);
        let outer = nest.remove_inner_most();
        assert_eq!(outer.num_loops(), 1);
        assert_eq!(outer.a().rows(), 1);
        assert_eq!(outer.a().row(0), &[4, -1]);
    }

    #[test]
    fn peel_outer_converts_ivs_to_symbols() {
        let mut syms = PrimaryMap::<Sym, String>::new();
        let nest = AffineLoopNest::rectangular(&[5, 7]);
        let peeled = nest.peel_outer(1, &mut syms);
        assert_eq!(peeled.num_loops(), 1);
        assert_eq!(peeled.num_syms(), 1);
        assert!(!peeled.is_empty());
    }
}
