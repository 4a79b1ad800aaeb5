//! Scheduled nodes: one store with its producer loads, plus the
//! schedule being solved for them.

use crate::ir::{Addr, Nest};
use cranelift_entity::entity_impl;
use polylift_math::DMat;
use smallvec::SmallVec;

/// A scheduled-node id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SNode(u32);
entity_impl!(SNode, "snode");

/// Tri-state result lattice for the solver: `Failure < Dependent <
/// Independent`. `&` is meet, `|` is join; any non-failure outcome is
/// "progress".
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub enum Outcome {
    Failure,
    Dependent,
    Independent,
}

impl Outcome {
    pub fn ok(self) -> bool {
        self != Outcome::Failure
    }
}

impl std::ops::BitAnd for Outcome {
    type Output = Outcome;
    fn bitand(self, rhs: Outcome) -> Outcome {
        self.min(rhs)
    }
}

impl std::ops::BitOr for Outcome {
    type Output = Outcome;
    fn bitor(self, rhs: Outcome) -> Outcome {
        self.max(rhs)
    }
}

/// A group of co-scheduled addresses: the representative store and the
/// loads feeding it, all sharing one affine nest and one schedule.
#[derive(Clone, Debug)]
pub struct ScheduledNode {
    /// Representative access (a store, except for load groups with no
    /// consuming store in the block).
    pub repr: Addr,
    /// Every member access, `repr` included.
    pub mem: SmallVec<[Addr; 4]>,
    pub nest: Nest,
    /// Square schedule matrix; row `r` is the `r`-th new loop level,
    /// columns are original induction variables, both outer→inner.
    pub phi: DMat,
    /// Schedule offset at each level.
    pub offset_omega: Vec<i64>,
    /// Fusion position at each level plus the body level.
    pub fusion_omega: Vec<i64>,
    /// Per-loop shift applied before scheduling, when the offset solve
    /// found one.
    pub offsets: Option<Vec<i64>>,
    /// Number of outer phi rows already determined.
    pub scheduled: usize,
    /// The leading rows were pre-seeded from an index matrix rather
    /// than solved; they may be revoked wholesale.
    pub seeded: bool,
}

impl ScheduledNode {
    pub fn new(repr: Addr, nest: Nest, num_loops: usize, fusion_omega: Vec<i64>) -> ScheduledNode {
        ScheduledNode {
            repr,
            mem: SmallVec::from_slice(&[repr]),
            nest,
            phi: DMat::zero(num_loops, num_loops),
            offset_omega: vec![0; num_loops],
            fusion_omega,
            offsets: None,
            scheduled: 0,
            seeded: false,
        }
    }

    pub fn num_loops(&self) -> usize {
        self.phi.rows()
    }

    pub fn phi_is_scheduled(&self, depth: usize) -> bool {
        depth < self.scheduled
    }

    /// Pre-seed the leading rows (orthogonalization attempt).
    pub fn schedule_phi(&mut self, rows: &DMat) {
        debug_assert!(rows.cols() == self.num_loops());
        for r in 0..rows.rows() {
            self.phi.row_mut(r).copy_from_slice(rows.row(r));
        }
        self.scheduled = rows.rows();
        self.seeded = true;
    }

    pub fn unschedule_phi(&mut self) {
        self.scheduled = 0;
        self.seeded = false;
    }

    /// Force the identity schedule (fallback when the solver cannot do
    /// better than the original order).
    pub fn set_identity(&mut self) {
        let d = self.num_loops();
        self.phi = DMat::identity(d);
        self.offset_omega = vec![0; d];
        self.offsets = None;
        self.scheduled = d;
        self.seeded = false;
    }

    /// Solved phi rows `0..=depth`, for satisfaction probing.
    pub fn phi_prefix(&self, depth: usize) -> DMat {
        let mut m = DMat::zero(0, self.num_loops());
        for r in 0..=depth.min(self.num_loops().saturating_sub(1)) {
            m.push_row(self.phi.row(r));
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_lattice() {
        use Outcome::*;
        assert_eq!(Failure & Independent, Failure);
        assert_eq!(Dependent & Independent, Dependent);
        assert_eq!(Dependent | Independent, Independent);
        assert!(!Failure.ok());
        assert!(Dependent.ok());
    }
}
