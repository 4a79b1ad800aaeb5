//! The typed node graph the optimizer transforms.
//!
//! Everything is held in entity registries keyed by small integer ids:
//! both the IR proper and the dependence graph are cyclic, so no node
//! owns another. Chains (loop bodies, per-access edge lists) are
//! intrusive: each element stores the id of its neighbor and a niche
//! (`PackedOption`) terminates the walk.

pub mod addr;
pub mod block;
pub mod node;

use cranelift_entity::entity_impl;

pub use addr::{Addr, AddrData, ArrayBase, ArrayBaseData, AxisSize};
pub use block::Block;
pub use node::{Node, NodeData, NodeKind, Opcode};

/// An affine loop nest registered with the block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nest(u32);
entity_impl!(Nest, "nest");

/// A dynamic symbol: a loop-invariant program quantity treated as an
/// unknown non-negative integer parameter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sym(u32);
entity_impl!(Sym, "sym");
