//! Affine memory references.
//!
//! An address is a base pointer plus an affine map from the owning
//! nest's induction variables and symbols to array axes:
//!
//! ```text
//! x = C' i + o + O s        C: num_loops x array_dim (rows outer→inner)
//! ```
//!
//! Rotating a schedule `j = phi i + omega` rewrites `C` and `o` so the
//! same cells are referenced in the new coordinates; the reference set
//! is unchanged.

use super::node::Node;
use super::{Nest, Sym};
use crate::poly::dep::DepId;
use crate::schedule::node::SNode;
use cranelift_entity::entity_impl;
use cranelift_entity::packed_option::PackedOption;
use polylift_math::DMat;

/// A base-pointer identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayBase(u32);
entity_impl!(ArrayBase, "array");

/// The stride expression of one array axis: a compile-time extent or a
/// loop-invariant symbol. Two accesses are comparable only when their
/// per-axis stride expressions coincide; an access re-viewing an
/// allocation through a different decomposition must not be paired
/// with one using the original shape.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AxisSize {
    Fixed(i64),
    Dynamic(Sym),
}

/// What the front end knows about a base pointer.
#[derive(Clone, Debug)]
pub struct ArrayBaseData {
    pub name: String,
    /// Declared per-axis stride expressions; accesses inherit them on
    /// creation. Empty when the front end left the shape unspecified.
    pub sizes: Vec<AxisSize>,
    /// The allocation is local and removable (`alloca`-like or a known
    /// allocation call) and its pointer never escapes.
    pub removable_alloc: bool,
    /// The allocation is read again after this block.
    pub future_reads: bool,
}

/// An address id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr(u32);
entity_impl!(Addr, "addr");

#[derive(Clone, Debug)]
pub struct AddrData {
    pub base: ArrayBase,
    pub nest: Nest,
    pub is_store: bool,
    /// `num_loops x array_dim`, loop rows outer→inner.
    pub index: DMat,
    /// Constant offset per array axis; rewritten by rotation.
    pub off_omega: Vec<i64>,
    /// `array_dim x num_syms` symbolic offsets, columns in the owning
    /// nest's symbol order.
    pub sym_off: DMat,
    /// Per-axis stride expressions of the viewed layout, length
    /// `array_dim` (or empty when unspecified).
    pub sizes: Vec<AxisSize>,
    /// Fusion position at every loop level, length `num_loops + 1`.
    pub fusion: Vec<i64>,
    /// Stored value (stores only).
    pub stored_val: PackedOption<Node>,
    /// The IR node carrying this access.
    pub node: PackedOption<Node>,
    /// Heads of the input/output dependence-edge chains.
    pub edge_in: PackedOption<DepId>,
    pub edge_out: PackedOption<DepId>,
    /// Owning scheduled node, once grouped.
    pub snode: PackedOption<SNode>,
    /// Rotation denominator (1 until rotated).
    pub denom: i64,
    /// Topological position assigned by edge sorting; later is larger.
    pub top_position: i32,
    /// Reassociable-reduction partner (store<->load).
    pub reduction: PackedOption<Addr>,
    pub dropped: bool,
}

impl AddrData {
    pub fn new(
        base: ArrayBase,
        nest: Nest,
        is_store: bool,
        index: DMat,
        off_omega: Vec<i64>,
        sym_off: DMat,
        sizes: Vec<AxisSize>,
        fusion: Vec<i64>,
    ) -> AddrData {
        debug_assert_eq!(index.cols(), off_omega.len());
        debug_assert_eq!(index.rows() + 1, fusion.len());
        debug_assert!(sizes.is_empty() || sizes.len() == index.cols());
        AddrData {
            base,
            nest,
            is_store,
            index,
            off_omega,
            sym_off,
            sizes,
            fusion,
            stored_val: None.into(),
            node: None.into(),
            edge_in: None.into(),
            edge_out: None.into(),
            snode: None.into(),
            denom: 1,
            top_position: 0,
            reduction: None.into(),
            dropped: false,
        }
    }

    pub fn array_dim(&self) -> usize {
        self.index.cols()
    }

    pub fn num_loops(&self) -> usize {
        self.index.rows()
    }

    /// Do any axes reference induction variables at depth `d` or
    /// deeper?
    pub fn depends_on_ind_vars(&self, d: usize) -> bool {
        (d..self.num_loops()).any(|r| !self.index.row_is_zero(r))
    }

    /// Whether the innermost loop's induction variable appears in the
    /// subscripts.
    pub fn indexed_by_innermost_loop(&self) -> bool {
        let d = self.num_loops();
        d > 0 && !self.index.row_is_zero(d - 1)
    }

    /// The array axis count and the per-axis stride expressions both
    /// coincide: the precondition for dependence analysis between two
    /// accesses. Subscripts (index entries, offsets) are free to
    /// differ — those are what the dependence polyhedron relates.
    pub fn sizes_match(&self, other: &AddrData) -> bool {
        self.array_dim() == other.array_dim() && self.sizes == other.sizes
    }

    /// Identical affine reference: equal offsets and index rows over
    /// the common depth, with the deeper access's extra rows all zero
    /// (a hoisted access keeps its padded shape).
    pub fn same_reference(&self, other: &AddrData) -> bool {
        if self.array_dim() != other.array_dim()
            || self.off_omega != other.off_omega
            || self.sym_off != other.sym_off
        {
            return false;
        }
        let common = self.num_loops().min(other.num_loops());
        for r in 0..common {
            if self.index.row(r) != other.index.row(r) {
                return false;
            }
        }
        let deep = if self.num_loops() > common { &self.index } else { &other.index };
        (common..deep.rows()).all(|r| deep.row_is_zero(r))
    }

    /// Rewrite the access for the schedule `j = phi i + omega` whose
    /// scaled inverse is `(phi_inv, denom)`, placing it under a nest of
    /// `new_depth >= num_loops()` loops. `offsets` is the per-loop
    /// shift applied before scheduling (§ shifting), if any.
    pub fn rotate(
        &mut self,
        new_nest: Nest,
        phi_inv: &DMat,
        denom: i64,
        omega: &[i64],
        offsets: Option<&[i64]>,
    ) {
        let old_d = self.num_loops();
        let new_d = phi_inv.rows();
        debug_assert!(old_d <= new_d);
        debug_assert_eq!(omega.len(), new_d);
        // new_C = phi_inv[0..old_d, :]^T * C  (the old index rows are
        // implicitly zero-padded to the new depth).
        let mut top = DMat::zero(old_d, new_d);
        for r in 0..old_d {
            top.row_mut(r).copy_from_slice(phi_inv.row(r));
        }
        let new_index = top.transpose().mul(&self.index);
        // o* = o - C*^T omega - C_old^T offsets
        let axis_omega = new_index.transpose().mul_vec(omega);
        for (o, w) in self.off_omega.iter_mut().zip(axis_omega) {
            debug_assert_eq!(w % denom, 0);
            *o -= w / denom;
        }
        if let Some(offs) = offsets {
            let axis_shift = self.index.transpose().mul_vec(offs);
            for (o, s) in self.off_omega.iter_mut().zip(axis_shift) {
                *o -= s;
            }
        }
        self.index = new_index;
        self.denom = denom;
        self.nest = new_nest;
    }

    /// Drop the `n` outermost loop rows and shift the fusion tuple
    /// left; offsets are unaffected.
    pub fn peel_loops(&mut self, n: usize) {
        debug_assert!(n <= self.num_loops());
        let mut index = DMat::zero(0, self.array_dim());
        for r in n..self.num_loops() {
            index.push_row(self.index.row(r));
        }
        self.index = index;
        self.fusion.drain(..n);
    }
}
