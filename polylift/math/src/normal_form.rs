//! Hermite reduction, rank, integer null spaces, and scaled inverses.
//!
//! The reductions here use only unimodular row operations (swap,
//! negate, subtract an integer multiple), so the row space — and
//! therefore the solution set of any system the rows describe — is
//! preserved exactly.

use crate::gcd::normalize_row;
use crate::matrix::DMat;

/// Row-echelon Hermite reduction in place; returns the rank.
///
/// After the call the first `rank` rows are in echelon form with
/// positive pivots and the remaining rows are zero.
pub fn hermite(a: &mut DMat) -> usize {
    hermite_cols(a, a.cols())
}

/// Hermite reduction pivoting only within the first `k` columns.
///
/// Rows whose leading `k` entries cannot host a pivot are left (in
/// whatever combination the elimination produced) below the `rank`
/// echelon rows. Used with an identity block appended to the right to
/// recover null-space combinations.
pub fn hermite_cols(a: &mut DMat, k: usize) -> usize {
    let mut r = 0;
    for c in 0..k.min(a.cols()) {
        if r == a.rows() {
            break;
        }
        // Euclidean elimination within the column: repeatedly reduce
        // every sub-row by the smallest non-zero entry until one
        // non-zero remains.
        loop {
            let mut piv: Option<usize> = None;
            for i in r..a.rows() {
                let x = a[(i, c)];
                if x != 0 && piv.map_or(true, |p| a[(p, c)].abs() > x.abs()) {
                    piv = Some(i);
                }
            }
            let Some(p) = piv else { break };
            a.swap_rows(r, p);
            if a[(r, c)] < 0 {
                a.negate_row(r);
            }
            let mut done = true;
            for i in r + 1..a.rows() {
                let x = a[(i, c)];
                if x != 0 {
                    let q = x.div_euclid(a[(r, c)]);
                    a.row_sub_scaled(i, r, q);
                    done = done && a[(i, c)] == 0;
                }
            }
            if done {
                break;
            }
        }
        if a[(r, c)] != 0 {
            // Reduce the rows above the pivot as well.
            for i in 0..r {
                let q = a[(i, c)].div_euclid(a[(r, c)]);
                a.row_sub_scaled(i, r, q);
            }
            r += 1;
        }
    }
    r
}

/// Rank of `a` (non-destructive).
pub fn rank(a: &DMat) -> usize {
    let mut b = a.clone();
    hermite(&mut b)
}

/// Incremental rank update: rows `0..rank` of `a` are in echelon form
/// and row `rank` was just written. Returns the new rank; the matrix is
/// re-reduced so the invariant holds for the next call.
pub fn update_for_new_row(a: &mut DMat, rank: usize) -> usize {
    debug_assert!(rank < a.rows());
    let mut b = DMat::zero(0, a.cols());
    for r in 0..=rank {
        b.push_row(a.row(r));
    }
    let new_rank = hermite(&mut b);
    for r in 0..=rank {
        a.row_mut(r).copy_from_slice(b.row(r));
    }
    new_rank
}

/// Integer basis (as rows) of `{x : a * x = 0}`.
///
/// Each basis row is GCD-primitive. The basis spans the orthogonal
/// complement of the row space of `a`, which is what the time-dimension
/// and schedule-independence computations consume.
pub fn null_space(a: &DMat) -> DMat {
    let t = a.transpose(); // cols(a) x rows(a)
    let n = t.rows();
    let m = t.cols();
    // [ t | I ]: row-reduce the left block; rows whose left block is
    // zero record left-null combinations of t, i.e. null vectors of a.
    let mut aug = DMat::zero(n, m + n);
    for r in 0..n {
        aug.row_mut(r)[..m].copy_from_slice(t.row(r));
        aug[(r, m + r)] = 1;
    }
    let rank = hermite_cols(&mut aug, m);
    let mut ns = DMat::zero(0, n);
    for r in rank..n {
        debug_assert!(aug.row(r)[..m].iter().all(|&x| x == 0));
        let mut v: Vec<i64> = aug.row(r)[m..].to_vec();
        normalize_row(&mut v);
        ns.push_row(&v);
    }
    ns
}

/// Basis of the orthogonal complement of the row space of `a`, i.e.
/// `{v : a * v = 0}` with `a`'s rows read as linear forms over `v`.
pub fn orthogonal_null_space(a: &DMat) -> DMat {
    null_space(a)
}

/// Determinant by fraction-free (Bareiss) elimination.
pub fn determinant(a: &DMat) -> i64 {
    let n = a.rows();
    assert_eq!(n, a.cols());
    if n == 0 {
        return 1;
    }
    let mut m = a.clone();
    let mut sign = 1i64;
    let mut prev = 1i64;
    for k in 0..n - 1 {
        if m[(k, k)] == 0 {
            let Some(p) = (k + 1..n).find(|&i| m[(i, k)] != 0) else {
                return 0;
            };
            m.swap_rows(k, p);
            sign = -sign;
        }
        for i in k + 1..n {
            for j in k + 1..n {
                m[(i, j)] = (m[(k, k)] * m[(i, j)] - m[(i, k)] * m[(k, j)]) / prev;
            }
            m[(i, k)] = 0;
        }
        prev = m[(k, k)];
    }
    sign * m[(n - 1, n - 1)]
}

/// Scaled inverse `(adj, det)` with `a * adj == det * I` and `det > 0`
/// after sign normalization; `None` iff `a` is singular.
///
/// The pair is reduced by the common GCD of all adjugate entries and
/// the determinant.
pub fn scaled_inverse(a: &DMat) -> Option<(DMat, i64)> {
    let n = a.rows();
    assert_eq!(n, a.cols());
    let det = determinant(a);
    if det == 0 {
        return None;
    }
    let mut adj = DMat::zero(n, n);
    if n == 1 {
        adj[(0, 0)] = 1;
        return Some(normalize_scaled(adj, det));
    }
    for i in 0..n {
        for j in 0..n {
            // Minor with row i and column j removed; cofactor goes to
            // the transposed slot.
            let mut minor = DMat::zero(n - 1, n - 1);
            for (mi, r) in (0..n).filter(|&r| r != i).enumerate() {
                for (mj, c) in (0..n).filter(|&c| c != j).enumerate() {
                    minor[(mi, mj)] = a[(r, c)];
                }
            }
            let s = if (i + j) % 2 == 0 { 1 } else { -1 };
            adj[(j, i)] = s * determinant(&minor);
        }
    }
    Some(normalize_scaled(adj, det))
}

fn normalize_scaled(mut adj: DMat, mut det: i64) -> (DMat, i64) {
    if det < 0 {
        det = -det;
        for r in 0..adj.rows() {
            adj.negate_row(r);
        }
    }
    let mut g = det;
    for r in 0..adj.rows() {
        g = adj.row(r).iter().fold(g, |g, &x| crate::gcd::gcd(g, x));
    }
    if g > 1 {
        det /= g;
        for r in 0..adj.rows() {
            for x in adj.row_mut(r) {
                *x /= g;
            }
        }
    }
    (adj, det)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hermite_rank() {
        let mut a = DMat::from_rows(&[&[2, 4], &[1, 2], &[0, 1]]);
        assert_eq!(hermite(&mut a), 2);
        let b = DMat::from_rows(&[&[1, 2, 3], &[2, 4, 6]]);
        assert_eq!(rank(&b), 1);
    }

    #[test]
    fn null_space_of_projection() {
        // a = [1 0 0; 0 1 0]: null space spanned by e3.
        let a = DMat::from_rows(&[&[1, 0, 0], &[0, 1, 0]]);
        let ns = null_space(&a);
        assert_eq!(ns.rows(), 1);
        assert_eq!(ns.row(0)[0], 0);
        assert_eq!(ns.row(0)[1], 0);
        assert_eq!(ns.row(0)[2].abs(), 1);
        // Every null vector annihilates a.
        assert_eq!(a.mul_vec(ns.row(0)), vec![0, 0]);
    }

    #[test]
    fn null_space_full_rank_is_empty() {
        let a = DMat::identity(3);
        assert_eq!(null_space(&a).rows(), 0);
    }

    #[test]
    fn determinant_and_inverse() {
        let a = DMat::from_rows(&[&[1, 0], &[1, 1]]);
        assert_eq!(determinant(&a), 1);
        let (inv, den) = scaled_inverse(&a).unwrap();
        assert_eq!(den, 1);
        assert_eq!(inv, DMat::from_rows(&[&[1, 0], &[-1, 1]]));

        let b = DMat::from_rows(&[&[2, 0], &[0, 2]]);
        let (inv, den) = scaled_inverse(&b).unwrap();
        // a * adj == det * I, reduced: adj = I, den = 2.
        assert_eq!(den, 2);
        assert_eq!(inv, DMat::identity(2));

        let sing = DMat::from_rows(&[&[1, 2], &[2, 4]]);
        assert!(scaled_inverse(&sing).is_none());
    }

    #[test]
    fn incremental_rank() {
        let mut a = DMat::zero(3, 3);
        a.row_mut(0).copy_from_slice(&[1, 0, 0]);
        let mut r = hermite_cols(&mut a, 3).min(1);
        assert_eq!(r, 1);
        a.row_mut(r).copy_from_slice(&[1, 0, 0]);
        r = update_for_new_row(&mut a, r);
        assert_eq!(r, 1);
        a.row_mut(r).copy_from_slice(&[0, 1, 0]);
        r = update_for_new_row(&mut a, r);
        assert_eq!(r, 2);
    }
}
