//! Tagged IR nodes.
//!
//! A node is a flat struct: a kind tag with a fixed payload, plus the
//! intrusive links (`prev`/`next` within the current body list,
//! `parent` pointing at the enclosing loop node) and the small markers
//! the rebuild passes scribble on (current depth, visit depth,
//! parent-dependence flag).

use super::addr::Addr;
use super::Nest;
use cranelift_entity::entity_impl;
use cranelift_entity::packed_option::PackedOption;

/// An IR node id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "node");

/// Compute opcodes. The set is the closure of what reduction detection
/// and stored-value chains need; anything else a front end hands us is
/// `Opaque` and blocks reassociation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    Add,
    Sub,
    Mul,
    SDiv,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FNeg,
    And,
    Or,
    Xor,
    /// Fused multiply-add call (`fma`/`fmuladd`): reassociable as a
    /// unit when its result feeds an accumulation.
    FMulAdd,
    Select,
    Opaque,
}

impl Opcode {
    /// Whether a chain through this op may be reassociated. Floating
    /// ops additionally require the instruction's `reassoc` flag.
    pub fn is_reassociable(self, reassoc_flag: bool) -> bool {
        match self {
            Opcode::Add | Opcode::Mul | Opcode::And | Opcode::Or | Opcode::Xor => true,
            Opcode::FAdd | Opcode::FMul | Opcode::FMulAdd => reassoc_flag,
            _ => false,
        }
    }

    pub fn num_args(self) -> usize {
        match self {
            Opcode::FNeg => 1,
            Opcode::FMulAdd | Opcode::Select => 3,
            _ => 2,
        }
    }
}

/// Node payloads, one fixed-size variant per tag.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// A memory read; the polyhedral payload lives in the `Addr`
    /// registry.
    Load(Addr),
    /// A memory write of `value` through `addr`.
    Store { addr: Addr, value: Node },
    /// A pure computation over up to three operands.
    Compute {
        op: Opcode,
        args: [PackedOption<Node>; 3],
        /// Fast-math reassociation permission for float ops.
        reassoc: bool,
    },
    /// A loop-invariant constant.
    Constant(i64),
    /// A post-schedule loop; `child` heads the body list, `last` is the
    /// final body node.
    Loop {
        nest: Nest,
        depth: u8,
        child: PackedOption<Node>,
        last: PackedOption<Node>,
    },
}

/// Visit marker meaning "never visited".
pub const UNVISITED: u8 = 0xff;
/// Debug-only marker for in-progress same-depth visits (cycle check).
pub const VISITING: u8 = 0xfe;

#[derive(Clone, Debug)]
pub struct NodeData {
    pub kind: NodeKind,
    pub prev: PackedOption<Node>,
    pub next: PackedOption<Node>,
    /// Enclosing loop node once placed in the rebuilt tree.
    pub parent: PackedOption<Node>,
    /// Depth of the body list currently holding the node.
    pub depth: u8,
    /// Topological-sort visit marker; see [`UNVISITED`].
    pub visit: u8,
    /// Set when the node (transitively) requires the parent loop's
    /// induction variable, which blocks hoisting.
    pub depends_on_parent: bool,
}

impl NodeData {
    pub fn new(kind: NodeKind) -> NodeData {
        NodeData {
            kind,
            prev: None.into(),
            next: None.into(),
            parent: None.into(),
            depth: 0,
            visit: UNVISITED,
            depends_on_parent: false,
        }
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.kind, NodeKind::Loop { .. })
    }

    pub fn addr(&self) -> Option<Addr> {
        match self.kind {
            NodeKind::Load(a) | NodeKind::Store { addr: a, .. } => Some(a),
            _ => None,
        }
    }

    /// Operand nodes, in slot order.
    pub fn args(&self) -> impl Iterator<Item = Node> + '_ {
        let (fixed, from_kind): ([PackedOption<Node>; 3], Option<Node>) = match self.kind {
            NodeKind::Compute { args, .. } => (args, None),
            NodeKind::Store { value, .. } => ([None.into(); 3], Some(value)),
            _ => ([None.into(); 3], None),
        };
        fixed.into_iter().filter_map(|a| a.expand()).chain(from_kind)
    }

    pub fn mark_visited(&mut self, depth: u8) {
        self.visit = depth;
    }

    pub fn was_visited(&self, depth: u8) -> bool {
        self.visit != UNVISITED && self.visit >= depth
    }
}
