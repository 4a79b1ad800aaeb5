//! End-to-end scenarios through the full pipeline: dependence
//! analysis, scheduling, tree rebuild, simplification, reductions, and
//! legality.

use polylift_math::DMat;
use polylift_opt::ir::{Addr, Block, Node, NodeKind, Opcode};
use polylift_opt::poly::loops::{AffineExpr, AffineLoopNest};
use polylift_opt::rebuild::Legality;
use polylift_opt::{optimize, OptimizedBlock};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loops of the rebuilt tree, outermost first along the leftmost spine.
fn loop_spine(block: &Block, opt: &OptimizedBlock) -> Vec<Node> {
    let mut out = Vec::new();
    let mut frontier = vec![opt.root];
    while let Some(l) = frontier.pop() {
        for &n in &opt.tree.body[&l] {
            if block.nodes[n].is_loop() {
                out.push(n);
                frontier.push(n);
            }
        }
    }
    out
}

fn legality_of(opt: &OptimizedBlock, l: Node) -> Legality {
    *opt.legality.get(&l).expect("loop is annotated")
}

fn undropped_stores(block: &Block) -> usize {
    block
        .addrs
        .iter()
        .filter(|(_, a)| a.is_store && !a.dropped)
        .count()
}

/// for i in 0..I { x[i] /= U[i,i]; for j in i+1..I { x[j] -= x[i]*U[i,j] } }
///
/// The outer loop carries the substitution dependence; the inner loop
/// is free. The inner statement's `x[i]` load is redundant with the
/// value just stored by the division and must be forwarded away.
#[test]
fn triangular_substitution() {
    init_logging();
    let mut b = Block::new();
    let i_sym = b.new_sym("I");
    let nest1 = b.add_nest(
        AffineLoopNest::from_backedge_counts(&[AffineExpr::sym_minus(i_sym, 1)], vec![i_sym])
            .unwrap(),
    );
    let nest2 = b.add_nest(
        AffineLoopNest::from_backedge_counts(
            &[
                AffineExpr::sym_minus(i_sym, 1),
                AffineExpr::sym_minus_iv(i_sym, 2, 0),
            ],
            vec![i_sym],
        )
        .unwrap(),
    );
    let x = b.new_base("x");
    let u = b.new_base("U");

    // x[i] /= U[i,i]
    let (xi_ld, _) = b.load(x, nest1, DMat::from_rows(&[&[1]]), vec![0], vec![0, 0]);
    let (uii_ld, _) = b.load(u, nest1, DMat::from_rows(&[&[1, 1]]), vec![0, 0], vec![0, 1]);
    let div = b.compute(Opcode::FDiv, &[xi_ld, uii_ld], false);
    let (_, xi_st) = b.store(x, nest1, DMat::from_rows(&[&[1]]), vec![0], vec![0, 2], div);

    // x[j] -= x[i] * U[i,j], with j = i + 1 + j'
    let idx_xj = DMat::from_rows(&[&[1], &[1]]);
    let (xj_ld, _) = b.load(x, nest2, idx_xj.clone(), vec![1], vec![0, 3, 0]);
    let (xi2_ld, xi2) = b.load(x, nest2, DMat::from_rows(&[&[1], &[0]]), vec![0], vec![0, 3, 1]);
    let (uij_ld, _) = b.load(
        u,
        nest2,
        DMat::from_rows(&[&[1, 1], &[0, 1]]),
        vec![0, 1],
        vec![0, 3, 2],
    );
    let mul = b.compute(Opcode::FMul, &[xi2_ld, uij_ld], false);
    let sub = b.compute(Opcode::FSub, &[xj_ld, mul], false);
    let (_, _xj_st) = b.store(x, nest2, idx_xj, vec![1], vec![0, 3, 3], sub);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());

    // The inner x[i] load was forwarded from the outer store.
    assert!(b.addrs[xi2].dropped, "x[i] reload must be forwarded");
    // Its consumer now reads the division result directly.
    match b.nodes[mul].kind {
        NodeKind::Compute { args, .. } => assert_eq!(args[0].expand(), Some(div)),
        _ => unreachable!(),
    }
    // Both stores survive.
    assert_eq!(undropped_stores(&b), 2);
    assert!(!b.addrs[xi_st].dropped);

    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 2, "an i loop with a nested j loop");
    let outer = legality_of(&opt, spine[0]);
    let inner = legality_of(&opt, spine[1]);
    assert!(!outer.reorderable, "the i loop carries the substitution");
    assert!(inner.reorderable, "the j loop is free to reorder");
}

/// for m, n, k { C[m,n] += A[m,k] * B[k,n] }
///
/// The C store/load pair is a reassociable reduction over k: the pair
/// is cross-linked, and the k loop carries exactly one unordered
/// reduction while staying reorderable.
#[test]
fn matmul_reduction() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[8, 8, 8]));
    let c = b.new_base("C");
    let a = b.new_base("A");
    let bb = b.new_base("B");

    let idx_c = DMat::from_rows(&[&[1, 0], &[0, 1], &[0, 0]]);
    let idx_a = DMat::from_rows(&[&[1, 0], &[0, 0], &[0, 1]]);
    let idx_b = DMat::from_rows(&[&[0, 0], &[0, 1], &[1, 0]]);
    let (c_ld, c_ld_addr) = b.load(c, nest, idx_c.clone(), vec![0, 0], vec![0, 0, 0, 0]);
    let (a_ld, _) = b.load(a, nest, idx_a, vec![0, 0], vec![0, 0, 0, 1]);
    let (b_ld, _) = b.load(bb, nest, idx_b, vec![0, 0], vec![0, 0, 0, 2]);
    let fma = b.compute(Opcode::FMulAdd, &[a_ld, b_ld, c_ld], true);
    let (_, c_st) = b.store(c, nest, idx_c, vec![0, 0], vec![0, 0, 0, 3], fma);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());

    assert_eq!(
        b.addrs[c_st].reduction.expand(),
        Some(c_ld_addr),
        "store half of the accumulation cycle"
    );
    assert_eq!(b.addrs[c_ld_addr].reduction.expand(), Some(c_st));

    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 3);
    let k = legality_of(&opt, spine[2]);
    assert_eq!(k.unordered_reductions, 1);
    assert!(k.reorderable, "a reassociable reduction does not pin k");
    // The accumulator was hoisted clear of the k loop.
    let ld_node = b.addrs[c_ld_addr].node.expand().unwrap();
    let st_node = b.addrs[c_st].node.expand().unwrap();
    assert_eq!(b.nodes[ld_node].depth, 2);
    assert_eq!(b.nodes[st_node].depth, 2);
}

/// for i, j { out[i,j] = x[i,j] + x[i,j-1] + x[i,j+1] }
///
/// Loads of one array at distinct offsets never alias a store, so the
/// block has no dependences at all: both loops fully reorderable, no
/// reductions.
#[test]
fn stencil_is_fully_parallel() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[16, 16]));
    let out = b.new_base("out");
    let x = b.new_base("x");
    let idx = DMat::identity(2);
    let (l0, _) = b.load(x, nest, idx.clone(), vec![0, 0], vec![0, 0, 0]);
    let (l1, _) = b.load(x, nest, idx.clone(), vec![0, -1], vec![0, 0, 1]);
    let (l2, _) = b.load(x, nest, idx.clone(), vec![0, 1], vec![0, 0, 2]);
    let s0 = b.compute(Opcode::FAdd, &[l0, l1], false);
    let s1 = b.compute(Opcode::FAdd, &[s0, l2], false);
    let (_, _st) = b.store(out, nest, idx, vec![0, 0], vec![0, 0, 3], s1);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());
    assert_eq!(opt.deps.len(), 0, "distinct bases and read-only reuse carry no edges");

    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 2);
    for l in spine {
        let leg = legality_of(&opt, l);
        assert!(leg.reorderable);
        assert_eq!(leg.ordered_reductions + leg.unordered_reductions, 0);
    }
    // All three x loads survive: distinct cells.
    assert_eq!(b.addrs.iter().filter(|(_, a)| !a.is_store && !a.dropped).count(), 3);
}

/// tmp[i] = c; out[i] = tmp[i] — with the producer and consumer fused,
/// the store forwards into the load, and the now write-only removable
/// temporary is queued for erasure.
#[test]
fn temporary_elimination() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
    let tmp = b.new_removable_base("tmp");
    let out = b.new_base("out");
    let idx = DMat::from_rows(&[&[1]]);
    let v = b.constant(7);
    let (_, tmp_st) = b.store(tmp, nest, idx.clone(), vec![0], vec![0, 0], v);
    let (_, tmp_ld) = b.load(tmp, nest, idx.clone(), vec![0], vec![0, 1]);
    let ld_node = b.addrs[tmp_ld].node.expand().unwrap();
    let (_, out_st) = b.store(out, nest, idx, vec![0], vec![0, 2], ld_node);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());

    assert!(b.addrs[tmp_ld].dropped, "load forwarded from the store");
    assert!(b.addrs[tmp_st].dropped, "write-only temporary store deleted");
    assert_eq!(opt.erase_candidates, vec![tmp]);
    // The surviving store writes the forwarded constant.
    assert_eq!(b.stored_val(out_st), Some(v));
    assert!(opt.addr_chain.iter().all(|&a| a != tmp_ld && a != tmp_st));
}

/// for i { a[i] = b[i] + a[i-1]; c[i] = a[i] * 2 }
///
/// The recurrence pins the i loop; both statements stay fused in it,
/// and the second statement's a[i] load forwards from the store.
#[test]
fn recurrence_keeps_loop_sequential() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
    let a = b.new_base("a");
    let bbase = b.new_base("b");
    let c = b.new_base("c");
    let idx = DMat::from_rows(&[&[1]]);
    let (b_ld, _) = b.load(bbase, nest, idx.clone(), vec![0], vec![0, 0]);
    let (am1_ld, _) = b.load(a, nest, idx.clone(), vec![-1], vec![0, 1]);
    let add = b.compute(Opcode::Add, &[b_ld, am1_ld], false);
    let (_, a_st) = b.store(a, nest, idx.clone(), vec![0], vec![0, 2], add);
    let (ai_ld, ai_addr) = b.load(a, nest, idx.clone(), vec![0], vec![0, 3]);
    let two = b.constant(2);
    let mul = b.compute(Opcode::Mul, &[ai_ld, two], false);
    let (_, _c_st) = b.store(c, nest, idx, vec![0], vec![0, 4], mul);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());

    // One fused loop holds both statements.
    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 1);
    let leg = legality_of(&opt, spine[0]);
    assert!(!leg.reorderable, "a[i-1] recurrence pins the loop");
    assert!(leg.peelable, "the carried distance is the constant 1");
    // a[i] forwarded into the second statement.
    assert!(b.addrs[ai_addr].dropped);
    match b.nodes[mul].kind {
        NodeKind::Compute { args, .. } => assert_eq!(args[0].expand(), Some(add)),
        _ => unreachable!(),
    }
    assert!(!b.addrs[a_st].dropped, "a is observable; its store stays");
}

/// for i, j { a[i,j] = a[i-1,j] + a[i,j-1] }
///
/// Both dependences are carried; consolidating them at the outer level
/// requires the skew (i, j) -> (i + j, ...), after which the rebuilt
/// subscripts read the skewed coordinates.
#[test]
fn skewing_carries_both_deps_outermost() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[8, 8]));
    let a = b.new_base("a");
    let idx = DMat::identity(2);
    let (l0, _) = b.load(a, nest, idx.clone(), vec![-1, 0], vec![0, 0, 0]);
    let (l1, _) = b.load(a, nest, idx.clone(), vec![0, -1], vec![0, 0, 1]);
    let add = b.compute(Opcode::FAdd, &[l0, l1], true);
    let (_, a_st) = b.store(a, nest, idx, vec![0, 0], vec![0, 0, 2], add);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());

    // Every edge is carried by the new outermost loop.
    for (_, e) in opt.deps.edges.iter() {
        if !e.dead {
            assert_eq!(e.sat_level, 0, "outer level carries all dependences");
        }
    }
    // The store's subscripts were rewritten by the skew: with the new
    // outer index s = i + j, the access reads (t, s - t) for some
    // unimodular completion t.
    let st_idx = &b.addrs[a_st].index;
    assert_eq!(st_idx.rows(), 2);
    // Axis subscripts must still jointly invert (the reference set is
    // preserved), and the skewed outer variable must appear in at
    // least one axis with the inner one.
    assert!(
        st_idx != &DMat::identity(2),
        "the identity schedule cannot carry both dependences at the outer loop"
    );
    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 2, "still a two-deep nest");
    assert!(!legality_of(&opt, spine[0]).reorderable);
    assert!(legality_of(&opt, spine[1]).reorderable, "inner loop is free after the skew");
}

/// A block already in canonical order round-trips: identity schedules,
/// the same fusion sequence, untouched subscripts.
#[test]
fn canonical_round_trip() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[6]));
    let x = b.new_base("x");
    let y = b.new_base("y");
    let idx = DMat::from_rows(&[&[1]]);
    let c = b.constant(1);
    let (_, sx) = b.store(x, nest, idx.clone(), vec![0], vec![0, 0], c);
    let (_, sy) = b.store(y, nest, idx.clone(), vec![0], vec![0, 1], c);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());
    let spine = loop_spine(&b, &opt);
    assert_eq!(spine.len(), 1, "both statements stay fused");
    // Subscripts unchanged under the identity rotation.
    assert_eq!(b.addrs[sx].index, idx);
    assert_eq!(b.addrs[sx].off_omega, vec![0]);
    assert_eq!(b.addrs[sy].index, idx);
    // Program order preserved.
    let pos_x = opt.addr_chain.iter().position(|&a| a == sx).unwrap();
    let pos_y = opt.addr_chain.iter().position(|&a| a == sy).unwrap();
    assert!(pos_x < pos_y);
}

/// Non-affine bounds refuse modeling, leaving the block untouched.
#[test]
fn non_affine_bounds_are_rejected() {
    let r = AffineLoopNest::from_backedge_counts(
        &[AffineExpr::constant(7), AffineExpr::NonAffine],
        Vec::new(),
    );
    assert!(r.is_err());
}

/// Helper coverage: the addr chain never contains dropped accesses.
#[test]
fn addr_chain_skips_dropped() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[4]));
    let t = b.new_base("t");
    let idx = DMat::from_rows(&[&[1]]);
    let c = b.constant(3);
    // Two identical stores back to back: the first is shadowed.
    let (_, s0) = b.store(t, nest, idx.clone(), vec![0], vec![0, 0], c);
    let (_, s1) = b.store(t, nest, idx, vec![0], vec![0, 1], c);
    let opt = optimize(&mut b);
    assert!(b.addrs[s0].dropped, "shadowed store dropped");
    assert!(!b.addrs[s1].dropped);
    let chain: Vec<Addr> = opt.addr_chain;
    assert_eq!(chain, vec![s1]);
}

/// Two identical loads in one loop with no store in between collapse
/// to one, even though load-load pairs carry no dependence edge.
#[test]
fn duplicate_loads_are_merged() {
    init_logging();
    let mut b = Block::new();
    let nest = b.add_nest(AffineLoopNest::rectangular(&[10]));
    let x = b.new_base("x");
    let y = b.new_base("y");
    let z = b.new_base("z");
    let idx = DMat::from_rows(&[&[1]]);
    let (l1_node, l1) = b.load(x, nest, idx.clone(), vec![0], vec![0, 0]);
    let (_, sy) = b.store(y, nest, idx.clone(), vec![0], vec![0, 1], l1_node);
    let (l2_node, l2) = b.load(x, nest, idx.clone(), vec![0], vec![0, 2]);
    let (_, sz) = b.store(z, nest, idx, vec![0], vec![0, 3], l2_node);

    let opt = optimize(&mut b);
    assert!(opt.schedule_outcome.ok());
    let dropped = [l1, l2].iter().filter(|&&a| b.addrs[a].dropped).count();
    assert_eq!(dropped, 1, "exactly one of the duplicate loads goes away");
    // Both stores now read the single surviving load.
    let sv_y = b.stored_val(sy).unwrap();
    let sv_z = b.stored_val(sz).unwrap();
    assert_eq!(sv_y, sv_z);
    assert!(sv_y == l1_node || sv_y == l2_node);
}
