//! Remainder transform.
//!
//! Prepares a counted loop for vectorization at width `W`:
//!
//! - **Epilog remainder** (default): the loop is cloned; the clone becomes
//!   the main vector loop with its exit test strengthened to "at least `W`
//!   full iterations remain" (`iv + step*(W-1) < bound`), and the original
//!   loop runs after it as the scalar remainder
//! - **Tail predication**: no clone, no remainder; the loop keeps its exit
//!   test and computes a per-iteration active vector length
//!   `avl = umin(W, bound - iv)`
//! - **Known trip alignment**: when the trip count is a known multiple of
//!   `W`, the loop is vectorizable as-is and no remainder is emitted
//!
//! The exit-condition values of the produced loop are returned as uniform
//! overrides; the driver pins them before shape analysis so the main loop's
//! exit is guaranteed uniform.
//!
//! Capability checks come first: a single counted induction variable, one
//! exit edge testing it at the loop header with the continue path on the
//! true edge, and loop-carried phis limited to recognized reductions. On
//! any shortfall the transform returns `None` and the caller falls back to
//! the scalar loop.

use crate::analysis::induction::{analyze_exit_condition, classify_loop_carried, ExitCondition};
use crate::error::VectorizeResult;
use crate::ir::{BlockId, CmpPred, Function, InsertionBuilder, LoopForest, ValueId};
#[cfg(test)]
use crate::ir::{Opcode, Type};
use crate::vecinfo::VectorizationInfo;
use crate::shape::VectorShape;

// =============================================================================
// Results
// =============================================================================

/// A loop the vectorizer may widen without further trip-count concern.
#[derive(Debug, Clone)]
pub struct PreparedLoop {
    /// Header of the vectorizable loop.
    pub header: BlockId,

    /// Initial active vector length (tail predication only).
    pub entry_avl: Option<ValueId>,

    /// Values the driver must pin uniform (the exit-condition chain).
    pub uniform_overrides: Vec<ValueId>,

    /// The loop's induction phi and its step; lanes map to consecutive
    /// iterations, so the driver pins it contiguous.
    pub induction: (ValueId, i64),
}

/// Statistics from the remainder transform.
#[derive(Debug, Clone, Default)]
pub struct RemainderStats {
    /// Loops prepared for vectorization.
    pub loops_prepared: usize,
    /// Loops handled by tail predication.
    pub tail_predicated: usize,
    /// Scalar remainder loops emitted.
    pub remainders_emitted: usize,
    /// Remainders skipped due to trip alignment.
    pub remainders_skipped: usize,
}

// =============================================================================
// Capability checks
// =============================================================================

/// Check that the transform can handle the loop; returns the recognized
/// exit condition when it can.
fn can_transform_loop(
    func: &Function,
    loops: &LoopForest,
    loop_idx: usize,
) -> Option<ExitCondition> {
    let cond = analyze_exit_condition(func, loops, loop_idx)?;
    let lp = loops.get(loop_idx);

    // The test must sit at the loop header with the continue path on the
    // true edge (canonical top-tested form).
    if cond.exiting != lp.header || !cond.continue_on_true {
        return None;
    }
    if cond.iv.step <= 0 {
        return None;
    }
    // Inequality tests only make sense with unit step.
    if cond.pred == CmpPred::Ne && cond.iv.step != 1 {
        return None;
    }
    // Every other loop-carried phi must be a recognized reduction.
    classify_loop_carried(func, loops, loop_idx, &cond.iv)?;
    Some(cond)
}

// =============================================================================
// Transform
// =============================================================================

/// Create a vectorizable form of the loop, or `None` when the loop is
/// outside the supported subset.
pub fn create_vectorizable_loop(
    func: &mut Function,
    loops: &LoopForest,
    loop_idx: usize,
    use_tail_predication: bool,
    vector_width: u32,
    trip_align: u32,
    stats: &mut RemainderStats,
) -> VectorizeResult<Option<PreparedLoop>> {
    let Some(cond) = can_transform_loop(func, loops, loop_idx) else {
        return Ok(None);
    };
    let lp = loops.get(loop_idx);
    let header = lp.header;
    let width = vector_width.max(1) as i64;

    // Trip count divisible by the width: the loop is exact already.
    if trip_align > 0 && trip_align % vector_width.max(1) == 0 {
        log::debug!(
            "loop {}: trip alignment {} divides width, no remainder",
            func.block_name(header),
            trip_align
        );
        stats.loops_prepared += 1;
        stats.remainders_skipped += 1;
        return Ok(Some(PreparedLoop {
            header,
            entry_avl: None,
            uniform_overrides: vec![cond.cmp],
            induction: (cond.iv.phi, cond.iv.step),
        }));
    }

    if use_tail_predication {
        // Keep the scalar exit test; compute avl = umin(W, bound - iv) per
        // iteration instead of peeling a remainder.
        let width_const = func.const_int(width);
        let mut builder = InsertionBuilder::at_front(func, header);
        let remaining = builder.sub(cond.bound, cond.iv.phi);
        let avl = builder.umin(width_const, remaining);
        log::debug!(
            "loop {}: tail predicated at width {}",
            func.block_name(header),
            width
        );
        stats.loops_prepared += 1;
        stats.tail_predicated += 1;
        return Ok(Some(PreparedLoop {
            header,
            entry_avl: Some(avl),
            uniform_overrides: vec![cond.cmp, remaining, avl],
            induction: (cond.iv.phi, cond.iv.step),
        }));
    }

    // Epilog remainder: clone the loop into the main vector loop; the
    // original becomes the scalar remainder running after it.
    let preheader = loops
        .preheader(func, loop_idx)
        .expect("checked by capability analysis");
    let body = lp.blocks.clone();
    let (vmap, bmap) = func.clone_blocks(&body, ".vec");
    let vec_header = bmap[&header];
    let vec_exiting = bmap[&cond.exiting];

    // Enter the vector loop from the pre-header; it exits into the scalar
    // remainder, which exits to the original exit block.
    func.replace_successor(preheader, header, vec_header);
    func.replace_successor(vec_exiting, cond.exit, header);

    // The remainder resumes from the vector loop's final state: each header
    // phi now reads its vector counterpart.
    for phi in func.block_phis(header) {
        let Some(i) = func.phi_incoming_index(phi, preheader) else {
            continue;
        };
        let vec_phi = vmap[&phi];
        func.set_phi_incoming_value(phi, i, vec_phi);
        func.set_phi_incoming_block(phi, i, vec_exiting);
    }

    // Strengthen the clone's exit test: continue only while a full vector
    // of iterations remains.
    let offset = cond
        .iv
        .step
        .checked_mul(width - 1)
        .expect("step * width overflows");
    let offset_const = func.const_int(offset);
    let vec_tested = vmap[&cond.tested];
    let mut builder = InsertionBuilder::before_terminator(func, vec_exiting);
    let adjusted = builder.add(vec_tested, offset_const);
    let new_pred = match cond.pred {
        CmpPred::Ne => CmpPred::Slt,
        other => other,
    };
    let vec_cmp = builder.icmp(new_pred, adjusted, cond.bound);
    let vec_branch = func.terminator(vec_exiting).expect("cloned loop branch");
    func.set_operand(vec_branch, 0, vec_cmp);

    log::debug!(
        "loop {}: peeled scalar remainder behind vector loop {}",
        func.block_name(header),
        func.block_name(vec_header)
    );
    stats.loops_prepared += 1;
    stats.remainders_emitted += 1;
    Ok(Some(PreparedLoop {
        header: vec_header,
        entry_avl: None,
        uniform_overrides: vec![adjusted, vec_cmp],
        induction: (vmap[&cond.iv.phi], cond.iv.step),
    }))
}

/// Pin the prepared loop's shapes: the exit-condition chain stays uniform
/// and the induction variable distributes consecutive iterations over the
/// lanes.
pub fn apply_uniform_overrides(vi: &mut VectorizationInfo, prepared: &PreparedLoop) {
    for &value in &prepared.uniform_overrides {
        vi.set_pinned_shape(value, VectorShape::uni());
    }
    let (iv, step) = prepared.induction;
    vi.set_pinned_shape(iv, VectorShape::cont(step, 0));
    vi.set_entry_avl(prepared.entry_avl);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DominatorTree;

    /// for (i = 0; i < n; ++i) c[i] = a[i] + b[i]
    /// Returns (func, header, body, latch, exit, iv, cmp, n).
    #[allow(clippy::type_complexity)]
    fn counted_loop() -> (
        Function,
        BlockId,
        BlockId,
        BlockId,
        BlockId,
        ValueId,
        ValueId,
        ValueId,
    ) {
        let mut f = Function::new("axpy");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let latch = f.create_block("latch");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let n = f.add_arg(Type::Int);
        let a = f.add_arg(Type::Ptr);
        let b = f.add_arg(Type::Ptr);
        let c = f.add_arg(Type::Ptr);
        let c0 = f.const_int(0);
        let c1 = f.const_int(1);
        f.set_jump(entry, header);
        let iv = f.insert_phi(header, Type::Int, &[(c0, entry)]);
        let cmp = f.push_inst(header, Opcode::Icmp(CmpPred::Slt), &[iv, n], Type::Bool);
        f.set_branch(header, cmp, body, exit);
        let pa = f.push_inst(body, Opcode::Gep { elem_size: 8 }, &[a, iv], Type::Ptr);
        let pb = f.push_inst(body, Opcode::Gep { elem_size: 8 }, &[b, iv], Type::Ptr);
        let la = f.push_inst(body, Opcode::Load, &[pa], Type::Int);
        let lb = f.push_inst(body, Opcode::Load, &[pb], Type::Int);
        let sum = f.push_inst(body, Opcode::Add, &[la, lb], Type::Int);
        let pc = f.push_inst(body, Opcode::Gep { elem_size: 8 }, &[c, iv], Type::Ptr);
        f.push_inst(body, Opcode::Store, &[sum, pc], Type::Int);
        f.set_jump(body, latch);
        let next = f.push_inst(latch, Opcode::Add, &[iv, c1], Type::Int);
        f.add_phi_incoming(iv, next, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);
        (f, header, body, latch, exit, iv, cmp, n)
    }

    #[test]
    fn test_tail_predication_computes_avl() {
        let (mut f, header, _, _, _, iv, cmp, n) = counted_loop();
        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut stats = RemainderStats::default();

        let prepared = create_vectorizable_loop(&mut f, &loops, 0, true, 8, 0, &mut stats)
            .unwrap()
            .expect("loop is transformable");

        assert_eq!(prepared.header, header);
        assert_eq!(stats.tail_predicated, 1);
        assert_eq!(stats.remainders_emitted, 0);

        // avl = umin(8, n - iv), computed in the header.
        let avl = prepared.entry_avl.expect("tail predication sets an avl");
        let avl_inst = f.inst(avl).unwrap();
        assert_eq!(avl_inst.op, Opcode::UMin);
        assert_eq!(f.as_const_int(avl_inst.operands[0]), Some(8));
        let remaining = f.inst(avl_inst.operands[1]).unwrap();
        assert_eq!(remaining.op, Opcode::Sub);
        assert_eq!(remaining.operands.as_slice(), &[n, iv]);
        assert_eq!(f.def_block(avl), Some(header));

        // The scalar exit test is kept and pinned uniform.
        assert!(prepared.uniform_overrides.contains(&cmp));
    }

    #[test]
    fn test_remainder_peeling_clones_loop() {
        let (mut f, header, _, _, exit, iv, _, n) = counted_loop();
        let entry = f.entry();
        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut stats = RemainderStats::default();

        let prepared = create_vectorizable_loop(&mut f, &loops, 0, false, 4, 0, &mut stats)
            .unwrap()
            .expect("loop is transformable");

        assert_ne!(prepared.header, header);
        assert_eq!(stats.remainders_emitted, 1);
        assert!(prepared.entry_avl.is_none());

        // The pre-header now enters the vector loop; the vector loop exits
        // into the scalar remainder; the remainder exits to the old exit.
        let vec_header = prepared.header;
        assert!(f.succs(entry).contains(&vec_header));
        assert!(f.succs(vec_header).contains(&header));
        assert!(f.succs(header).contains(&exit));

        // The vector exit test is iv.vec + step*(W-1) < n.
        let vec_branch = f.terminator(vec_header).unwrap();
        let vec_cmp = f.inst(vec_branch).unwrap().operands[0];
        let cmp_inst = f.inst(vec_cmp).unwrap();
        assert_eq!(cmp_inst.op, Opcode::Icmp(CmpPred::Slt));
        assert_eq!(cmp_inst.operands[1], n);
        let adjusted = f.inst(cmp_inst.operands[0]).unwrap();
        assert_eq!(adjusted.op, Opcode::Add);
        assert_eq!(f.as_const_int(adjusted.operands[1]), Some(3));
        assert!(prepared.uniform_overrides.contains(&vec_cmp));

        // The remainder's induction variable resumes from the vector phi.
        let incoming = f.phi_incoming(iv);
        let from_vec = incoming
            .iter()
            .find(|&&(_, b)| b == vec_header)
            .expect("remainder iv seeded by the vector loop");
        assert!(f.is_phi(from_vec.0));
        assert_eq!(f.def_block(from_vec.0), Some(vec_header));

        // Both loops exist and are well formed.
        let dom = DominatorTree::build(&f);
        let forest = LoopForest::compute(&f, &dom);
        assert_eq!(forest.len(), 2);
        assert!(!forest.is_irreducible());
    }

    #[test]
    fn test_trip_alignment_skips_remainder() {
        let (mut f, header, ..) = counted_loop();
        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut stats = RemainderStats::default();

        let prepared = create_vectorizable_loop(&mut f, &loops, 0, false, 4, 8, &mut stats)
            .unwrap()
            .expect("loop is transformable");

        assert_eq!(prepared.header, header);
        assert_eq!(stats.remainders_skipped, 1);
        assert_eq!(stats.remainders_emitted, 0);
    }

    #[test]
    fn test_unrecognized_loop_falls_back() {
        // Loop-carried phi with an unrecognized update (xor) blocks the
        // transform.
        let mut f = Function::new("weird");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let latch = f.create_block("latch");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let n = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let c1 = f.const_int(1);
        f.set_jump(entry, header);
        let iv = f.insert_phi(header, Type::Int, &[(c0, entry)]);
        let acc = f.insert_phi(header, Type::Int, &[(c0, entry)]);
        let cmp = f.push_inst(header, Opcode::Icmp(CmpPred::Slt), &[iv, n], Type::Bool);
        f.set_branch(header, cmp, latch, exit);
        let folded = f.push_inst(latch, Opcode::Xor, &[acc, iv], Type::Int);
        let next = f.push_inst(latch, Opcode::Add, &[iv, c1], Type::Int);
        f.add_phi_incoming(iv, next, latch);
        f.add_phi_incoming(acc, folded, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);

        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut stats = RemainderStats::default();
        let prepared =
            create_vectorizable_loop(&mut f, &loops, 0, false, 4, 0, &mut stats).unwrap();
        assert!(prepared.is_none());
        assert_eq!(stats.loops_prepared, 0);
    }
}
