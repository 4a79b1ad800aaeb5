//! The per-invocation container for one optimizable region.
//!
//! A `Block` owns every registry the pass mutates: loop nests, symbols,
//! IR nodes, addresses, and base pointers. The front end populates it
//! (addresses grouped by their stores, compute chains for stored
//! values), the scheduler and rebuild passes rewrite it in place.

use super::addr::{Addr, AddrData, ArrayBase, ArrayBaseData, AxisSize};
use super::node::{Node, NodeData, NodeKind, Opcode};
use super::{Nest, Sym};
use crate::poly::loops::AffineLoopNest;
use cranelift_entity::{PrimaryMap, SecondaryMap};
use polylift_math::DMat;
use smallvec::SmallVec;

#[derive(Default)]
pub struct Block {
    pub nests: PrimaryMap<Nest, AffineLoopNest>,
    pub syms: PrimaryMap<Sym, String>,
    pub nodes: PrimaryMap<Node, NodeData>,
    pub addrs: PrimaryMap<Addr, AddrData>,
    pub bases: PrimaryMap<ArrayBase, ArrayBaseData>,
    /// Def→use back-edges for the compute graph, maintained on node
    /// creation and by `replace_all_uses`.
    pub users: SecondaryMap<Node, SmallVec<[Node; 4]>>,
}

impl Block {
    pub fn new() -> Block {
        Block::default()
    }

    pub fn new_sym(&mut self, name: &str) -> Sym {
        self.syms.push(name.to_string())
    }

    pub fn add_nest(&mut self, nest: AffineLoopNest) -> Nest {
        self.nests.push(nest)
    }

    pub fn new_base(&mut self, name: &str) -> ArrayBase {
        self.bases.push(ArrayBaseData {
            name: name.to_string(),
            sizes: Vec::new(),
            removable_alloc: false,
            future_reads: false,
        })
    }

    /// Base with declared per-axis stride expressions; accesses created
    /// against it inherit them, and only accesses agreeing on them are
    /// compared for dependences.
    pub fn new_sized_base(&mut self, name: &str, sizes: Vec<AxisSize>) -> ArrayBase {
        let b = self.new_base(name);
        self.bases[b].sizes = sizes;
        b
    }

    pub fn new_removable_base(&mut self, name: &str) -> ArrayBase {
        let b = self.new_base(name);
        self.bases[b].removable_alloc = true;
        b
    }

    pub fn constant(&mut self, v: i64) -> Node {
        self.nodes.push(NodeData::new(NodeKind::Constant(v)))
    }

    pub fn compute(&mut self, op: Opcode, args: &[Node], reassoc: bool) -> Node {
        debug_assert!(args.len() <= 3 && args.len() == op.num_args());
        let mut slots = [None.into(); 3];
        for (s, &a) in slots.iter_mut().zip(args) {
            *s = Some(a).into();
        }
        let n = self.nodes.push(NodeData::new(NodeKind::Compute {
            op,
            args: slots,
            reassoc,
        }));
        for &a in args {
            self.users[a].push(n);
        }
        n
    }

    /// Register a load of `base` with the given affine reference and
    /// fusion position; returns the node and its address.
    pub fn load(
        &mut self,
        base: ArrayBase,
        nest: Nest,
        index: DMat,
        off: Vec<i64>,
        fusion: Vec<i64>,
    ) -> (Node, Addr) {
        let dim = index.cols();
        let addr = self.addrs.push(AddrData::new(
            base,
            nest,
            false,
            index,
            off,
            DMat::zero(dim, self.nests[nest].num_syms()),
            self.bases[base].sizes.clone(),
            fusion,
        ));
        let node = self.nodes.push(NodeData::new(NodeKind::Load(addr)));
        self.addrs[addr].node = Some(node).into();
        (node, addr)
    }

    /// Register a store of `value` to `base`.
    pub fn store(
        &mut self,
        base: ArrayBase,
        nest: Nest,
        index: DMat,
        off: Vec<i64>,
        fusion: Vec<i64>,
        value: Node,
    ) -> (Node, Addr) {
        let dim = index.cols();
        let addr = self.addrs.push(AddrData::new(
            base,
            nest,
            true,
            index,
            off,
            DMat::zero(dim, self.nests[nest].num_syms()),
            self.bases[base].sizes.clone(),
            fusion,
        ));
        self.addrs[addr].stored_val = Some(value).into();
        let node = self.nodes.push(NodeData::new(NodeKind::Store { addr, value }));
        self.addrs[addr].node = Some(node).into();
        self.users[value].push(node);
        (node, addr)
    }

    /// Fresh load with the same reference as `store` (the counterpart
    /// of re-reading a just-written cell).
    pub fn reload(&mut self, store: Addr) -> (Node, Addr) {
        debug_assert!(self.addrs[store].is_store);
        let d = &self.addrs[store];
        let (base, nest) = (d.base, d.nest);
        let (index, off, fusion) = (d.index.clone(), d.off_omega.clone(), d.fusion.clone());
        let sizes = d.sizes.clone();
        let (n, a) = self.load(base, nest, index, off, fusion);
        // The reload views the layout exactly as the store does, even
        // when that differs from the base's declared shape.
        self.addrs[a].sizes = sizes;
        (n, a)
    }

    /// Rewrite every use of `from` (as a compute operand or stored
    /// value) to `to`.
    pub fn replace_all_uses(&mut self, from: Node, to: Node) {
        if from == to {
            return;
        }
        let uses = std::mem::take(&mut self.users[from]);
        for &u in &uses {
            match &mut self.nodes[u].kind {
                NodeKind::Compute { args, .. } => {
                    for a in args.iter_mut() {
                        if a.expand() == Some(from) {
                            *a = Some(to).into();
                        }
                    }
                }
                NodeKind::Store { value, .. } => {
                    if *value == from {
                        *value = to;
                        if let Some(addr) = self.nodes[u].addr() {
                            self.addrs[addr].stored_val = Some(to).into();
                        }
                    }
                }
                _ => {}
            }
            self.users[to].push(u);
        }
    }

    /// The value produced by a load node's address, if the node is an
    /// undropped load.
    pub fn load_of(&self, addr: Addr) -> Option<Node> {
        self.addrs[addr].node.expand()
    }

    pub fn stored_val(&self, addr: Addr) -> Option<Node> {
        self.addrs[addr].stored_val.expand()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poly::loops::AffineLoopNest;

    #[test]
    fn use_rewriting() {
        let mut b = Block::new();
        let nest = {
            let n = AffineLoopNest::rectangular(&[10]);
            b.add_nest(n)
        };
        let base = b.new_base("x");
        let (ld, _) = b.load(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0]);
        let c = b.constant(2);
        let m = b.compute(Opcode::Mul, &[ld, c], false);
        let (_, _st) = b.store(base, nest, DMat::from_rows(&[&[1]]), vec![0], vec![0, 1], m);
        let ld2 = b.constant(7);
        b.replace_all_uses(ld, ld2);
        match b.nodes[m].kind {
            NodeKind::Compute { args, .. } => {
                assert_eq!(args[0].expand(), Some(ld2));
                assert_eq!(args[1].expand(), Some(c));
            }
            _ => unreachable!(),
        }
        assert!(b.users[ld2].contains(&m));
    }
}
