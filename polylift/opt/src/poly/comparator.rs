//! Symbolic comparison over a polyhedron.
//!
//! A comparator answers questions of the form "is `q * x >= 0` for
//! every `x` in the polyhedron `{A x >= 0, E x == 0}`?" by searching
//! for a Farkas certificate: non-negative multipliers over the
//! inequality rows (plus free multipliers over the equalities, a
//! non-negative multiplier per variable known non-negative, and a
//! non-negative constant slack when column 0 is the literal `1`) whose
//! combination reproduces `q`.
//!
//! Construction factors the generator stack once: with
//! `U * G = [H; 0]` (`H` in row echelon of rank `R`, `U` unimodular), a
//! query reduces to the triangular solve `z^T H = q^T` followed by
//! `y = U^T z`. When the generators are linearly independent (`R`
//! equals their count) the multipliers are unique and a sign check on
//! the back-substituted solution decides — no simplex runs at all.
//! Otherwise the tail rows of `U` span the multiplier null space, and
//! a Phase-I simplex over the doubled (`±`) free block decides whether
//! some completion keeps every sign-constrained multiplier
//! non-negative.
//!
//! The answer is conservative: `false` means "not provable with linear
//! non-negative multipliers", not "false on the polyhedron". Callers
//! re-query after tightening, so this is the right default.

use log::trace;
use polylift_math::matrix::Rat;
use polylift_math::normal_form::hermite_cols;
use polylift_math::{DMat, Simplex};

pub struct SymbolicComparator {
    a: DMat,
    e: DMat,
    /// Column 0 is the constant 1 (so `x_0 >= 0` holds and constant
    /// slack may be spent).
    pos0: bool,
    /// The trailing `num_non_negative` columns are known `>= 0`.
    num_non_negative: usize,
    /// Farkas generators, one row each: the inequality rows, the
    /// (reduced) equality rows, a unit per implicitly non-negative
    /// variable, and the constant slack.
    gens: DMat,
    /// Which generators require a non-negative multiplier; equality
    /// rows are free.
    nonneg: Vec<bool>,
    /// Echelon factorization `U * gens = [h; 0]` with `h` of `rank`
    /// rows; `u` holds all of `U`, its tail rows spanning the
    /// multiplier null space.
    h: DMat,
    u: DMat,
    rank: usize,
}

impl SymbolicComparator {
    /// Build from inequalities `a * x >= 0` and optional equalities
    /// `e * x == 0`; both share the column layout of future queries.
    pub fn new(a: DMat, e: Option<DMat>, pos0: bool, num_non_negative: usize) -> Self {
        let cols = a.cols();
        let mut e = e.unwrap_or_else(|| DMat::zero(0, cols));
        debug_assert!(e.is_empty() || e.cols() == cols);
        // Redundant equalities only widen the multiplier space; reduce
        // them once up front.
        if e.rows() > 1 {
            let rank = polylift_math::normal_form::hermite(&mut e);
            e.truncate_rows(rank);
        }
        let mut gens = DMat::zero(0, cols);
        let mut nonneg = Vec::new();
        for r in 0..a.rows() {
            gens.push_row(a.row(r));
            nonneg.push(true);
        }
        for r in 0..e.rows() {
            gens.push_row(e.row(r));
            nonneg.push(false);
        }
        for j in 0..num_non_negative {
            let mut row = vec![0; cols];
            row[cols - num_non_negative + j] = 1;
            gens.push_row(&row);
            nonneg.push(true);
        }
        if pos0 {
            let mut row = vec![0; cols];
            row[0] = 1;
            gens.push_row(&row);
            nonneg.push(true);
        }
        let m = gens.rows();
        let mut aug = DMat::zero(m, cols + m);
        for r in 0..m {
            aug.row_mut(r)[..cols].copy_from_slice(gens.row(r));
            aug[(r, cols + r)] = 1;
        }
        let rank = hermite_cols(&mut aug, cols);
        let mut h = DMat::zero(0, cols);
        for r in 0..rank {
            h.push_row(&aug.row(r)[..cols]);
        }
        let mut u = DMat::zero(0, m);
        for r in 0..m {
            u.push_row(&aug.row(r)[cols..]);
        }
        SymbolicComparator { a, e, pos0, num_non_negative, gens, nonneg, h, u, rank }
    }

    fn num_cols(&self) -> usize {
        self.a.cols()
    }

    /// The multipliers are uniquely determined by the query.
    pub fn is_full_rank(&self) -> bool {
        self.rank == self.gens.rows()
    }

    /// Is `q * x >= 0` valid on the polyhedron?
    pub fn greater_equal(&self, q: &[i64]) -> bool {
        debug_assert_eq!(q.len(), self.num_cols());
        let Some(z) = self.solve_rowspace(q) else {
            trace!("comparator: {q:?} >= 0: outside the generator span");
            return false;
        };
        let certified = if self.is_full_rank() {
            self.greater_equal_full_rank(&z)
        } else {
            self.greater_equal_rank_deficient(&z)
        };
        trace!("comparator: {q:?} >= 0 certified: {certified}");
        certified
    }

    /// Triangular solve of `z^T h = q^T` over the echelon pivots, with
    /// a consistency check on every column. `None` means `q` is outside
    /// the generators' row space, so no certificate can exist.
    fn solve_rowspace(&self, q: &[i64]) -> Option<Vec<Rat>> {
        let mut residual: Vec<Rat> = q.iter().map(|&x| Rat::from_int(x)).collect();
        let mut z = vec![Rat::ZERO; self.rank];
        for k in 0..self.rank {
            let row = self.h.row(k);
            let p = row
                .iter()
                .position(|&x| x != 0)
                .expect("echelon rows are non-zero");
            let zk = residual[p].div_int(row[p]);
            if !zk.is_zero() {
                for (c, &hv) in row.iter().enumerate() {
                    if hv != 0 {
                        residual[c] = residual[c] - zk.mul_int(hv);
                    }
                }
            }
            z[k] = zk;
        }
        residual.iter().all(|r| r.is_zero()).then_some(z)
    }

    /// Full-rank case: back-substitute the unique multipliers
    /// `y = U^T z` and check the sign of every constrained one. No
    /// simplex involved.
    fn greater_equal_full_rank(&self, z: &[Rat]) -> bool {
        debug_assert_eq!(self.rank, self.gens.rows());
        for (i, &constrained) in self.nonneg.iter().enumerate() {
            if !constrained {
                continue;
            }
            if self.particular(z, i) < Rat::ZERO {
                return false;
            }
        }
        true
    }

    /// Rank-deficient case: the tail rows of `U` span the multiplier
    /// null space. Split each free coefficient into `w+ - w-` and ask
    /// Phase I whether some completion keeps the constrained
    /// multipliers non-negative.
    fn greater_equal_rank_deficient(&self, z: &[Rat]) -> bool {
        let free = self.gens.rows() - self.rank;
        let mut rows = DMat::zero(0, 1 + 2 * free);
        for (i, &constrained) in self.nonneg.iter().enumerate() {
            if !constrained {
                continue;
            }
            // y0_i + sum_j f_ij (w+_j - w-_j) >= 0, scaled integral by
            // the particular solution's denominator.
            let y0 = self.particular(z, i);
            let mut row = vec![0; 1 + 2 * free];
            row[0] = y0.num;
            for j in 0..free {
                let c = y0.den * self.u[(self.rank + j, i)];
                row[1 + j] = c;
                row[1 + free + j] = -c;
            }
            rows.push_row(&row);
        }
        Simplex::positive_variables(&rows, None).is_some()
    }

    /// Component `i` of the particular solution `U^T z`.
    fn particular(&self, z: &[Rat], i: usize) -> Rat {
        let mut y = Rat::ZERO;
        for (k, zk) in z.iter().enumerate() {
            let uv = self.u[(k, i)];
            if uv != 0 && !zk.is_zero() {
                y = y + zk.mul_int(uv);
            }
        }
        y
    }

    pub fn less_equal(&self, q: &[i64]) -> bool {
        self.greater_equal(&negate(q))
    }

    /// Strict `q * x > 0`, i.e. `q * x - 1 >= 0` (integer polyhedra).
    pub fn greater(&self, q: &[i64]) -> bool {
        debug_assert!(self.pos0);
        let mut s = q.to_vec();
        s[0] -= 1;
        self.greater_equal(&s)
    }

    pub fn less(&self, q: &[i64]) -> bool {
        self.greater(&negate(q))
    }

    pub fn equal(&self, q: &[i64]) -> bool {
        self.greater_equal(q) && self.less_equal(q)
    }

    /// Is `q1 * x == -(q2 * x)` on the polyhedron?
    pub fn equal_negative(&self, q1: &[i64], q2: &[i64]) -> bool {
        let sum: Vec<i64> = q1.iter().zip(q2.iter()).map(|(a, b)| a + b).collect();
        self.equal(&sum)
    }

    /// Does the polyhedron contain no rational point (with `x_0 = 1`
    /// when `pos0`)?
    pub fn is_empty(&self) -> bool {
        if !self.pos0 {
            // Homogeneous system: the origin always satisfies it.
            return false;
        }
        let ncols = self.num_cols();
        let nn = self.num_non_negative;
        let nfree = ncols - 1 - nn;
        // Variables: [free+ | free- | trailing non-negative].
        let nv = 2 * nfree + nn;
        let expand = |src: &DMat| -> DMat {
            let mut out = DMat::zero(src.rows(), 1 + nv);
            for r in 0..src.rows() {
                let row = out.row_mut(r);
                row[0] = src[(r, 0)];
                for j in 0..nfree {
                    row[1 + j] = src[(r, 1 + j)];
                    row[1 + nfree + j] = -src[(r, 1 + j)];
                }
                for j in 0..nn {
                    row[1 + 2 * nfree + j] = src[(r, 1 + nfree + j)];
                }
            }
            out
        };
        let ineq = expand(&self.a);
        let eq = expand(&self.e);
        let e = if eq.rows() > 0 { Some(&eq) } else { None };
        Simplex::positive_variables(&ineq, e).is_none()
    }
}

fn negate(q: &[i64]) -> Vec<i64> {
    q.iter().map(|&x| -x).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 0 <= i <= N - 1 over columns [1, N, i], with N and i
    /// non-negative.
    fn triangle() -> SymbolicComparator {
        let a = DMat::from_rows(&[&[-1, 1, -1], &[0, 0, 1]]);
        SymbolicComparator::new(a, None, true, 2)
    }

    #[test]
    fn bounds_are_provable() {
        let c = triangle();
        // More generators than dimensions: the simplex path.
        assert!(!c.is_full_rank());
        // i >= 0.
        assert!(c.greater_equal(&[0, 0, 1]));
        // N - 1 - i >= 0.
        assert!(c.greater_equal(&[-1, 1, -1]));
        // N - i >= 0 (weaker).
        assert!(c.greater_equal(&[0, 1, -1]));
        // i - 1 >= 0 is not valid (i may be 0).
        assert!(!c.greater_equal(&[-1, 0, 1]));
        // N - 1 - i can also be read through less_equal.
        assert!(c.less_equal(&[1, -1, 1]));
    }

    #[test]
    fn equalities_participate() {
        // x == y, x >= 0 over [1, x, y].
        let a = DMat::from_rows(&[&[0, 1, 0]]);
        let e = DMat::from_rows(&[&[0, 1, -1]]);
        let c = SymbolicComparator::new(a, Some(e), true, 0);
        // y >= 0 follows only through the equality.
        assert!(c.greater_equal(&[0, 0, 1]));
        assert!(c.equal(&[0, 1, -1]));
        assert!(c.equal_negative(&[0, 1, 0], &[0, 0, -1]));
    }

    #[test]
    fn full_rank_queries_skip_the_simplex() {
        // Three independent generators over three columns: unique
        // multipliers, decided by the sign check alone.
        let a = DMat::from_rows(&[&[0, 1, 0]]);
        let e = DMat::from_rows(&[&[0, 1, -1]]);
        let c = SymbolicComparator::new(a, Some(e), true, 0);
        assert!(c.is_full_rank());
        // y = x - (x - y): multiplier on x >= 0 is +1, on the equality
        // -1 (free), on the slack 0.
        assert!(c.greater_equal(&[0, 0, 1]));
        // -x - 1 >= 0 needs a negative constrained multiplier.
        assert!(!c.greater_equal(&[-1, -1, 0]));
        // A single generator cannot reach the y column: the consistency
        // check rejects before any sign test.
        let a2 = DMat::from_rows(&[&[0, 1, 0]]);
        let c2 = SymbolicComparator::new(a2, None, false, 0);
        assert!(c2.is_full_rank());
        assert!(!c2.greater_equal(&[0, 0, 1]), "outside the generator span");
        assert!(c2.greater_equal(&[0, 1, 0]));
    }

    #[test]
    fn rank_deficient_free_completion() {
        // Two parallel inequality generators x >= 0 (duplicated):
        // rank 1 over 2 generators, feasible split exists for x >= 0.
        let a = DMat::from_rows(&[&[0, 1], &[0, 1]]);
        let c = SymbolicComparator::new(a, None, false, 0);
        assert!(!c.is_full_rank());
        assert!(c.greater_equal(&[0, 1]));
        assert!(!c.greater_equal(&[0, -1]));
    }

    #[test]
    fn emptiness() {
        // 1 <= x <= -1: empty.
        let a = DMat::from_rows(&[&[-1, 1], &[-1, -1]]);
        let c = SymbolicComparator::new(a, None, true, 1);
        assert!(c.is_empty());
        let c2 = triangle();
        assert!(!c2.is_empty());
    }

    #[test]
    fn strict_comparisons() {
        let c = triangle();
        // N >= 1 holds (N - 1 >= 0 is a row combined with i >= 0).
        assert!(c.greater(&[0, 1, 0]));
        // i > 0 does not hold.
        assert!(!c.greater(&[0, 0, 1]));
    }
}
