//! Fourier–Motzkin elimination and inequality-system housekeeping.
//!
//! Systems are matrices `A` whose rows are inequalities `A[r] * x >= 0`
//! over some variable layout chosen by the caller; equality systems
//! `E * x == 0` ride along where noted.

use crate::gcd::{div_gcd, normalize_row};
use crate::matrix::DMat;

/// Eliminate variable (column) `v` from the inequality system by
/// Fourier–Motzkin. The returned system has column `v` removed; every
/// surviving row is GCD-primitive and all-zero rows are dropped.
pub fn fourier_motzkin(a: &DMat, v: usize) -> DMat {
    let mut out = DMat::zero(0, a.cols() - 1);
    let mut pos: Vec<usize> = Vec::new();
    let mut neg: Vec<usize> = Vec::new();
    for r in 0..a.rows() {
        match a[(r, v)].signum() {
            0 => {
                let mut row = drop_col(a.row(r), v);
                normalize_row(&mut row);
                if row.iter().any(|&x| x != 0) {
                    out.push_row(&row);
                }
            }
            1 => pos.push(r),
            _ => neg.push(r),
        }
    }
    for &p in &pos {
        for &n in &neg {
            // a[p,v] > 0 gives a lower bound, a[n,v] < 0 an upper one;
            // scale so the v terms cancel.
            let (cp, cn) = div_gcd(a[(p, v)], -a[(n, v)]);
            let mut row: Vec<i64> = a
                .row(p)
                .iter()
                .zip(a.row(n).iter())
                .map(|(&xp, &xn)| cn * xp + cp * xn)
                .collect();
            let row_v = row.remove(v);
            debug_assert_eq!(row_v, 0);
            normalize_row(&mut row);
            if row.iter().any(|&x| x != 0) {
                out.push_row(&row);
            }
        }
    }
    out
}

fn drop_col(row: &[i64], v: usize) -> Vec<i64> {
    let mut out = Vec::with_capacity(row.len() - 1);
    out.extend_from_slice(&row[..v]);
    out.extend_from_slice(&row[v + 1..]);
    out
}

/// GCD-normalize every row and drop all-zero rows in place.
pub fn simplify_system(a: &mut DMat) {
    let mut r = 0;
    while r < a.rows() {
        normalize_row(a.row_mut(r));
        if a.row_is_zero(r) {
            a.remove_row(r);
        } else {
            r += 1;
        }
    }
}

/// Remove duplicate rows (exact matches after normalization).
pub fn dedup_rows(a: &mut DMat) {
    simplify_system(a);
    let mut r = 0;
    while r < a.rows() {
        let mut s = r + 1;
        while s < a.rows() {
            if a.row(r) == a.row(s) {
                a.remove_row(s);
            } else {
                s += 1;
            }
        }
        r += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eliminate_middle_variable() {
        // x >= 0, y - x >= 0, 10 - y >= 0 over [1, x, y]; eliminating y
        // leaves x >= 0 and 10 - x >= 0.
        let a = DMat::from_rows(&[&[0, 1, 0], &[0, -1, 1], &[10, 0, -1]]);
        let b = fourier_motzkin(&a, 2);
        assert_eq!(b.cols(), 2);
        let rows: Vec<&[i64]> = (0..b.rows()).map(|r| b.row(r)).collect();
        assert!(rows.contains(&&[0i64, 1][..]));
        assert!(rows.contains(&&[10i64, -1][..]));
    }

    #[test]
    fn gcd_rescaling() {
        // x <= 5 combined with x >= 1 eliminates to a tautology row
        // that the GCD rescale reduces to its primitive form.
        let a = DMat::from_rows(&[&[10, -2], &[-4, 4]]);
        let b = fourier_motzkin(&a, 1);
        assert_eq!(b.rows(), 1);
        assert_eq!(b.row(0), &[1]);
    }

    #[test]
    fn simplify_drops_zero_rows() {
        let mut a = DMat::from_rows(&[&[2, 4], &[0, 0], &[3, 3]]);
        simplify_system(&mut a);
        assert_eq!(a, DMat::from_rows(&[&[1, 2], &[1, 1]]));
    }
}
