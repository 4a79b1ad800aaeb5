//! Integer-tableau simplex.
//!
//! The tableau holds equality constraints over non-negative variables:
//! row 0 is the cost row, rows `1..=m` are constraints, column 0 holds
//! the constants and columns `1..=n` the variables, so a constraint row
//! reads `sum_v C[c][v] * x_v == C[c][0]`. Pivoting is fraction-free:
//! rows are combined with GCD-scaled integer operations and
//! re-normalized, so entries stay exact. A basic variable's value is
//! the rational `C[c][0] / C[c][v]`.
//!
//! Bookkeeping mirrors the constraint matrix: `basic_vars[c]` names the
//! variable column basic in constraint `c` (or -1), `basic_cons[v]` the
//! constraint a variable is basic in (or -1; -2 transiently during
//! initialization).

use crate::gcd::{gcd, normalize_row};
use crate::matrix::{DMat, Rat};

/// Phase-I/II integer simplex over non-negative variables.
#[derive(Clone)]
pub struct Simplex {
    tab: DMat,
    basic_vars: Vec<i64>,
    basic_cons: Vec<i64>,
    num_slack: usize,
    canonical: bool,
}

impl Simplex {
    /// Wrap an equality tableau (rows `[const | vars]`, no cost row).
    /// The first `num_slack` variable columns are slack variables.
    pub fn from_tableau(constraints: DMat, num_slack: usize) -> Simplex {
        let n = constraints.cols() - 1;
        let m = constraints.rows();
        let mut tab = DMat::zero(m + 1, n + 1);
        for r in 0..m {
            tab.row_mut(r + 1).copy_from_slice(constraints.row(r));
        }
        Simplex {
            tab,
            basic_vars: vec![-1; m],
            basic_cons: vec![-2; n + 1],
            num_slack,
            canonical: false,
        }
    }

    /// Feasibility of `a[r][0] + a[r][1..] * x >= 0` (rows of `a`) and
    /// `e[r][0] + e[r][1..] * x == 0` (rows of `e`) over `x >= 0`.
    /// Returns the canonicalized simplex, or `None` if infeasible.
    pub fn positive_variables(a: &DMat, e: Option<&DMat>) -> Option<Simplex> {
        let n = a.cols() - 1;
        let num_slack = a.rows();
        let num_eq = e.map_or(0, |e| e.rows());
        let mut tab = DMat::zero(num_slack + num_eq, 1 + num_slack + n);
        for r in 0..num_slack {
            // s_r - sum a[r][j] x_j = a[r][0], with s_r >= 0 the slack.
            tab[(r, 0)] = a[(r, 0)];
            tab[(r, 1 + r)] = 1;
            for j in 0..n {
                tab[(r, 1 + num_slack + j)] = -a[(r, 1 + j)];
            }
        }
        if let Some(e) = e {
            for r in 0..num_eq {
                tab[(num_slack + r, 0)] = -e[(r, 0)];
                for j in 0..n {
                    tab[(num_slack + r, 1 + num_slack + j)] = e[(r, 1 + j)];
                }
            }
        }
        let mut s = Simplex::from_tableau(tab, num_slack);
        if s.init_feasible() { None } else { Some(s) }
    }

    pub fn num_vars(&self) -> usize {
        self.tab.cols() - 1
    }

    pub fn num_cons(&self) -> usize {
        self.tab.rows() - 1
    }

    pub fn num_slack(&self) -> usize {
        self.num_slack
    }

    fn cost_mut(&mut self) -> &mut [i64] {
        self.tab.row_mut(0)
    }

    /// Bring the tableau to canonical form; `true` means infeasible.
    pub fn init_feasible(&mut self) -> bool {
        // Remove linearly dependent constraint rows first: equalities
        // implied by the others would otherwise pin augmented
        // variables to empty rows.
        self.drop_dependent_rows();
        let n = self.num_vars();
        let m = self.num_cons();
        for x in &mut self.basic_cons {
            *x = -2;
        }
        // Sign-normalize so constants are non-negative, and look for
        // columns holding the only (positive) entry of some row: those
        // seed the basis for free.
        for c in 1..=m {
            if self.tab[(c, 0)] < 0 {
                self.tab.negate_row(c);
            }
            for v in 1..=n {
                let x = self.tab[(c, v)];
                if x != 0 {
                    self.basic_cons[v] = if self.basic_cons[v] == -2 && x > 0 {
                        (c - 1) as i64
                    } else {
                        -1
                    };
                }
            }
        }
        for x in &mut self.basic_vars {
            *x = -1;
        }
        for v in 1..=n {
            let r = self.basic_cons[v];
            if r >= 0 {
                if self.basic_vars[r as usize] == -1 {
                    self.basic_vars[r as usize] = v as i64;
                } else {
                    self.basic_cons[v] = -1;
                }
            } else if self.basic_cons[v] == -2 {
                self.basic_cons[v] = -1;
            }
        }
        self.canonical = true;
        let augment: Vec<usize> =
            (0..m).filter(|&c| self.basic_vars[c] == -1).collect();
        if !augment.is_empty() && self.remove_augment_vars(&augment, n) {
            return true;
        }
        debug_assert!(self.check_canonical());
        false
    }

    fn drop_dependent_rows(&mut self) {
        let m = self.num_cons();
        if m <= 1 {
            return;
        }
        let mut rows = DMat::zero(0, self.tab.cols());
        for c in 1..=m {
            rows.push_row(self.tab.row(c));
        }
        let rank = crate::normal_form::hermite(&mut rows);
        if rank == m {
            return;
        }
        let n = self.num_vars();
        let mut tab = DMat::zero(rank + 1, n + 1);
        for r in 0..rank {
            tab.row_mut(r + 1).copy_from_slice(rows.row(r));
        }
        self.tab = tab;
        self.basic_vars.truncate(rank);
    }

    fn remove_augment_vars(&mut self, augment: &[usize], n: usize) -> bool {
        let k = augment.len();
        self.tab.zero_extend_cols(n + 1 + k);
        self.basic_cons.resize(n + 1 + k, -1);
        for (i, &a) in augment.iter().enumerate() {
            let v = n + 1 + i;
            self.basic_vars[a] = v as i64;
            self.basic_cons[v] = a as i64;
            self.tab[(a + 1, v)] = 1;
            // Implicit cost of 1 on the augment variable, folded into
            // the true-variable columns.
            for col in 0..=n {
                let x = self.tab[(a + 1, col)];
                self.tab[(0, col)] -= x;
            }
        }
        match self.run_core(1) {
            Some(r) if r.is_zero() => {}
            _ => return true,
        }
        // Pivot leftover augmented variables out of the basis.
        for c in 0..self.num_cons() {
            if self.basic_vars[c] <= n as i64 {
                continue;
            }
            debug_assert_eq!(self.tab[(c + 1, 0)], 0);
            let mut replaced = false;
            for v in (1..=n).rev() {
                if self.basic_cons[v] >= 0 || self.tab[(c + 1, v)] == 0 {
                    continue;
                }
                if self.tab[(c + 1, v)] < 0 {
                    self.tab.negate_row(c + 1);
                }
                for i in 0..=self.num_cons() {
                    if i != c + 1 {
                        self.zero_with_row_op(i, c + 1, v, 0);
                    }
                }
                self.basic_vars[c] = v as i64;
                self.basic_cons[v] = c as i64;
                replaced = true;
                break;
            }
            if !replaced {
                // 0 == 0 row; retire it from the basis.
                self.basic_vars[c] = -1;
            }
        }
        self.truncate_vars(n);
        false
    }

    /// Drop all variable columns past `n` (callers guarantee the
    /// dropped variables are non-basic or zero).
    pub fn truncate_vars(&mut self, n: usize) {
        while self.num_vars() > n {
            let last = self.num_vars();
            self.tab.remove_col(last);
            self.basic_cons.pop();
        }
        for bv in &mut self.basic_vars {
            if *bv > n as i64 {
                *bv = -1;
            }
        }
    }

    /// Project variable `v` out while preserving canonical form: make
    /// it basic (isolating it in one constraint), then drop that
    /// constraint together with the column.
    pub fn remove_variable(&mut self, v: usize) {
        debug_assert!(self.canonical);
        if self.basic_cons[v] < 0 {
            self.make_basic(0, v);
        }
        if self.basic_cons[v] >= 0 {
            let c = self.basic_cons[v] as usize;
            let last = self.num_cons() - 1;
            if c != last {
                self.tab.swap_rows(c + 1, last + 1);
                let moved = self.basic_vars[last];
                self.basic_vars[c] = moved;
                if moved >= 0 {
                    self.basic_cons[moved as usize] = c as i64;
                }
            }
            self.tab.truncate_rows(self.tab.rows() - 1);
            self.basic_vars.pop();
        }
        self.tab.remove_col(v);
        self.basic_cons.remove(v);
        for bv in &mut self.basic_vars {
            if *bv > v as i64 {
                *bv -= 1;
            }
        }
    }

    /// `row(i) := a/g * row(i) - b/g * row(j)` zeroing column `v` of
    /// row `i`, where `a = tab[j][v]`, `b = tab[i][v]`. `f` tracks the
    /// cost-row denominator (pass 0 for plain rows). Returns the
    /// updated `f`.
    fn zero_with_row_op(&mut self, i: usize, j: usize, v: usize, f: i64) -> i64 {
        let b = self.tab[(i, v)];
        if b == 0 {
            return f;
        }
        let a = self.tab[(j, v)];
        debug_assert_ne!(a, 0);
        let g = gcd(a, b);
        let (mut aa, mut bb) = (a / g, b / g);
        if aa < 0 {
            aa = -aa;
            bb = -bb;
        }
        {
            let (ri, rj) = self.tab.two_rows_mut(i, j);
            for (x, y) in ri.iter_mut().zip(rj.iter()) {
                *x = aa * *x - bb * *y;
            }
        }
        debug_assert_eq!(self.tab[(i, v)], 0);
        let mut nf = if f != 0 { f * aa } else { 0 };
        let mut g2 = self.tab.row(i).iter().fold(0, |g, &x| gcd(g, x));
        if nf != 0 {
            g2 = gcd(g2, nf);
        }
        if g2 > 1 {
            for x in self.tab.row_mut(i) {
                *x /= g2;
            }
            if nf != 0 {
                nf /= g2;
            }
        }
        nf
    }

    /// Bland's rule: first variable column in `lo..=hi` with negative
    /// cost.
    fn entering(&self, lo: usize, hi: usize) -> Option<usize> {
        (lo..=hi).find(|&v| self.tab[(0, v)] < 0)
    }

    fn leaving(&self, enter: usize) -> Option<usize> {
        let mut best: Option<(usize, i64, i64)> = None; // (row, num, den)
        for c in 1..=self.num_cons() {
            let cv = self.tab[(c, enter)];
            if cv <= 0 {
                continue;
            }
            let c0 = self.tab[(c, 0)];
            if c0 == 0 {
                return Some(c - 1);
            }
            debug_assert!(c0 > 0);
            match best {
                Some((_, n, d)) if n * c0 <= cv * d => {}
                _ => best = Some((c - 1, cv, c0)),
            }
        }
        best.map(|(c, _, _)| c)
    }

    fn make_basic(&mut self, f: i64, enter: usize) -> i64 {
        let Some(leave) = self.leaving(enter) else {
            return 0; // unbounded
        };
        let mut nf = f;
        for i in 0..=self.num_cons() {
            if i != leave + 1 {
                let m = self.zero_with_row_op(i, leave + 1, enter, if i == 0 { f } else { 0 });
                if i == 0 {
                    nf = m;
                }
            }
        }
        let old = self.basic_vars[leave];
        self.basic_vars[leave] = enter as i64;
        if old >= 0 {
            self.basic_cons[old as usize] = -1;
        }
        self.basic_cons[enter] = leave as i64;
        nf
    }

    /// Minimize the cost row assuming basic costs are already zeroed;
    /// `None` signals an unbounded problem.
    fn run_core(&mut self, mut f: i64) -> Option<Rat> {
        debug_assert!(self.canonical);
        loop {
            let Some(enter) = self.entering(1, self.num_vars()) else {
                return Some(Rat::new(self.tab[(0, 0)], f));
            };
            f = self.make_basic(f, enter);
            if f == 0 {
                return None;
            }
        }
    }

    /// Optimize the current cost row (zeroing basic costs first).
    pub fn run(&mut self) -> Option<Rat> {
        debug_assert!(self.canonical);
        let mut f = 1;
        for c in 0..self.num_cons() {
            let v = self.basic_vars[c];
            if v > 0 && self.tab[(0, v as usize)] != 0 {
                f = self.zero_with_row_op(0, c + 1, v as usize, f);
            }
        }
        self.run_core(f)
    }

    /// Replace the cost row; `cost[0]` is the constant slot and
    /// `cost[v]` the coefficient of variable column `v`.
    pub fn set_cost(&mut self, cost: &[i64]) {
        debug_assert_eq!(cost.len(), self.num_vars() + 1);
        self.cost_mut().copy_from_slice(cost);
    }

    /// Value of variable `v` (1-based column) in the current basis.
    pub fn solution(&self, v: usize) -> Rat {
        let c = self.basic_cons[v];
        if c < 0 {
            return Rat::ZERO;
        }
        let c = c as usize + 1;
        Rat::new(self.tab[(c, 0)], self.tab[(c, v)])
    }

    /// Lexicographically minimize the listed variable columns, in the
    /// given order. Variables earlier in `order` are frozen once
    /// minimized: later steps may neither move them nor use them as
    /// entering columns. Columns not listed never enter.
    pub fn lex_minimize_seq(&mut self, order: &[usize]) {
        debug_assert!(self.canonical);
        for (i, &v) in order.iter().enumerate() {
            self.lex_minimize_one(v, &order[i + 1..]);
        }
    }

    fn lex_minimize_one(&mut self, v: usize, later: &[usize]) {
        let c = self.basic_cons[v];
        if c < 0 {
            return; // non-basic: already zero, the lex minimum
        }
        let c = c as usize + 1;
        // Cost := minimize the expression of `v` over the columns that
        // are still free to move.
        for x in self.cost_mut() {
            *x = 0;
        }
        self.tab[(0, 0)] = -self.tab[(c, 0)];
        for &x in later {
            self.tab[(0, x)] = -self.tab[(c, x)];
        }
        self.lex_core(later);
        self.make_zero_basic(v, later);
    }

    fn lex_core(&mut self, allowed: &[usize]) {
        loop {
            let Some(&enter) = allowed.iter().find(|&&x| self.tab[(0, x)] < 0) else {
                return;
            };
            let Some(leave) = self.leaving(enter) else {
                return;
            };
            for i in 0..=self.num_cons() {
                if i != leave + 1 {
                    self.zero_with_row_op(i, leave + 1, enter, 0);
                }
            }
            let old = self.basic_vars[leave];
            self.basic_vars[leave] = enter as i64;
            if old >= 0 {
                self.basic_cons[old as usize] = -1;
            }
            self.basic_cons[enter] = leave as i64;
        }
    }

    /// If `v` is basic at value zero, pivot it out so later steps see
    /// it as settled.
    fn make_zero_basic(&mut self, v: usize, later: &[usize]) {
        let c = self.basic_cons[v];
        if c < 0 {
            return;
        }
        let row = c as usize + 1;
        if self.tab[(row, 0)] != 0 {
            return; // minimized to a non-zero value; stays basic
        }
        for &ev in later.iter().rev() {
            if self.basic_cons[ev] >= 0 || self.tab[(row, ev)] == 0 {
                continue;
            }
            if self.tab[(row, ev)] < 0 {
                self.tab.negate_row(row);
            }
            for i in 1..=self.num_cons() {
                if i != row {
                    self.zero_with_row_op(i, row, ev, 0);
                }
            }
            self.basic_vars[c as usize] = ev as i64;
            self.basic_cons[v] = -1;
            self.basic_cons[ev] = c;
            break;
        }
    }

    fn check_canonical(&self) -> bool {
        for c in 1..=self.num_cons() {
            if self.tab[(c, 0)] < 0 {
                return false;
            }
            let v = self.basic_vars[c - 1];
            if v >= 0
                && (self.basic_cons[v as usize] != (c - 1) as i64
                    || self.tab[(c, v as usize)] < 0)
            {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Simplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Simplex {{ vars: {}, cons: {}, tableau: {:?} }}",
            self.num_vars(),
            self.num_cons(),
            self.tab
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feasible_box() {
        // 0 <= x <= 5, 0 <= y <= 3.
        let a = DMat::from_rows(&[&[5, -1, 0], &[3, 0, -1]]);
        assert!(Simplex::positive_variables(&a, None).is_some());
    }

    #[test]
    fn infeasible_gap() {
        // x >= 4 and x <= 2.
        let a = DMat::from_rows(&[&[-4, 1], &[2, -1]]);
        assert!(Simplex::positive_variables(&a, None).is_none());
    }

    #[test]
    fn infeasible_equality() {
        // x + y == -1 with x, y >= 0.
        let a = DMat::from_rows(&[&[10, -1, 0]]);
        let e = DMat::from_rows(&[&[1, 1, 1]]);
        assert!(Simplex::positive_variables(&a, Some(&e)).is_none());
    }

    #[test]
    fn equality_pins_solution() {
        // x - y == 1, x <= 3: feasible, e.g. (x, y) = (1, 0).
        let a = DMat::from_rows(&[&[3, -1, 0]]);
        let e = DMat::from_rows(&[&[-1, 1, -1]]);
        assert!(Simplex::positive_variables(&a, Some(&e)).is_some());
    }

    #[test]
    fn lex_min_prefers_earlier_columns() {
        // x + y == 2 over x, y >= 0; minimizing [x, y] should land on
        // x = 0, y = 2.
        let tab = DMat::from_rows(&[&[2, 1, 1]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        s.lex_minimize_seq(&[1, 2]);
        assert_eq!(s.solution(1), Rat::ZERO);
        assert_eq!(s.solution(2), Rat::from_int(2));
    }

    #[test]
    fn lex_min_respects_order() {
        // Same system, reversed priority: y first.
        let tab = DMat::from_rows(&[&[2, 1, 1]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        s.lex_minimize_seq(&[2, 1]);
        assert_eq!(s.solution(2), Rat::ZERO);
        assert_eq!(s.solution(1), Rat::from_int(2));
    }

    #[test]
    fn rational_solutions() {
        // 2x == 3: x = 3/2.
        let tab = DMat::from_rows(&[&[3, 2]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        assert_eq!(s.solution(1), Rat::new(3, 2));
    }

    #[test]
    fn phase_two_objective() {
        // Maximize x subject to x + y == 4 (minimize -x).
        let tab = DMat::from_rows(&[&[4, 1, 1]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        s.set_cost(&[0, -1, 0]);
        let r = s.run().unwrap();
        assert_eq!(r, Rat::from_int(-4));
        assert_eq!(s.solution(1), Rat::from_int(4));
    }

    #[test]
    fn remove_variable_preserves_feasibility() {
        // x + y == 3, x - y == 1: removing y leaves a consistent
        // one-variable system.
        let tab = DMat::from_rows(&[&[3, 1, 1], &[1, 1, -1]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        s.remove_variable(2);
        assert_eq!(s.num_vars(), 1);
        assert_eq!(s.num_cons(), 1);
        assert_eq!(s.solution(1), Rat::from_int(2));
    }

    #[test]
    fn dependent_rows_are_dropped() {
        // Same equality twice.
        let tab = DMat::from_rows(&[&[2, 1, 1], &[4, 2, 2]]);
        let mut s = Simplex::from_tableau(tab, 0);
        assert!(!s.init_feasible());
        assert_eq!(s.num_cons(), 1);
    }
}
