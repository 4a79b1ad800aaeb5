//! Polyhedral machinery: symbolic comparison, affine loop nests, and
//! dependence polyhedra with their Farkas systems.

pub mod comparator;
pub mod dep;
pub mod loops;

pub use comparator::SymbolicComparator;
pub use loops::{AffineExpr, AffineLoopNest, BuildError};
