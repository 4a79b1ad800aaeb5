//! Post-schedule reconstruction: the rotated loop tree, the sorted
//! instruction graph, memory simplification, reductions, and per-loop
//! legality.

pub mod driver;
pub mod legality;
pub mod reduction;
pub mod simplify;
pub mod topsort;
pub mod tree;

pub use driver::{optimize, OptimizedBlock};
pub use legality::Legality;
pub use tree::LoopTree;
