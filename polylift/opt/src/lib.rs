//! Polyhedral loop-nest scheduling and post-schedule IR optimization.
//!
//! Given a block of loop nests whose bounds and memory subscripts are
//! affine in the induction variables and a set of symbolic parameters,
//! this crate:
//!
//! 1. models each nest as an integer constraint system
//!    ([`poly::loops::AffineLoopNest`]),
//! 2. builds dependence polyhedra and Farkas feasibility systems for
//!    every pair of accesses that may alias ([`poly::dep`]),
//! 3. solves, level by level, for a new affine schedule (a per-statement
//!    `phi` matrix and fusion offsets) that respects every dependence
//!    while minimizing dependence distances ([`schedule`]),
//! 4. rebuilds the loop tree in the new order, hoists loop-invariant
//!    operations, forwards stores to loads, deletes dead temporaries,
//!    recognizes reassociable reductions, and annotates each loop with
//!    reordering legality ([`rebuild`]).
//!
//! The crate is a pure in-process library: no CLI, no persisted state,
//! and the whole pass is synchronous and single-threaded. Entry point:
//! [`optimize`].

pub mod ir;
pub mod poly;
pub mod rebuild;
pub mod schedule;

pub use ir::block::Block;
pub use rebuild::driver::{optimize, OptimizedBlock};
