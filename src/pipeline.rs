//! The vectorization pipeline driver.
//!
//! Orchestrates the passes in their required order with hard phase
//! barriers:
//!
//! 1. **Remainder transform** (outer-loop ABI only): peel a scalar
//!    remainder or install tail predication, pin the uniform overrides
//! 2. **Mask materialization**: seed per-block predicates
//! 3. **Shape analysis**: fixed-point shapes; divergence derivation
//! 4. **Divergent-loop transform**: loops become uniform, innermost-first
//! 5. **Linearizer**: divergent branches fold into predicated straight-line
//!    control
//!
//! The driver aborts on the first failure and leaves partial state behind
//! only in the IR it owns; callers keep their scalar original and fall back
//! to it on a capability error. Analysis structures (dominators,
//! post-dominators, loop forest) are rebuilt between phases whenever a
//! transform leaves them dirty.

use crate::analysis::shapes::{run_shape_analysis, ShapeAnalysisStats};
use crate::error::{VectorizeError, VectorizeResult};
use crate::ir::{DominatorTree, Function, LoopForest, Opcode, PostDominatorTree};
use crate::transform::div_loop::{regularize_divergent_loops, DivLoopStats};
use crate::transform::linearize::{linearize, LinearizeStats};
use crate::transform::masks::{materialize_masks, MaskStats};
use crate::transform::remainder::{
    apply_uniform_overrides, create_vectorizable_loop, RemainderStats,
};
use crate::vecinfo::{Region, VectorAbi, VectorMapping, VectorizationInfo};

// =============================================================================
// Options
// =============================================================================

/// Caller-facing knobs of the pipeline.
#[derive(Debug, Clone)]
pub struct VectorizeOptions {
    /// SIMD lane count.
    pub vector_width: u32,

    /// Use a per-iteration AVL instead of peeling a scalar remainder.
    pub use_tail_predication: bool,

    /// Known divisor of the trip count (0 = unknown); a multiple of the
    /// vector width lets the remainder transform skip the epilog.
    pub trip_align: u32,
}

impl Default for VectorizeOptions {
    fn default() -> Self {
        VectorizeOptions {
            vector_width: 4,
            use_tail_predication: false,
            trip_align: 0,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Merged statistics of a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct VectorizeStats {
    pub remainder: RemainderStats,
    pub masks: MaskStats,
    pub shapes: ShapeAnalysisStats,
    pub div_loops: DivLoopStats,
    pub linearize: LinearizeStats,
}

// =============================================================================
// Public surface
// =============================================================================

/// Construct the shared vectorization state for a function/region.
pub fn build_vectorization_info(
    _func: &Function,
    region: Region,
    mapping: VectorMapping,
) -> VectorizationInfo {
    VectorizationInfo::new(region, mapping)
}

/// Drive the whole pipeline over `func`, rewriting it in place into a form
/// whose control flow is uniform across the SIMD group. Returns the final
/// vectorization state (shapes, masks, divergence record) for the
/// downstream vector code generator.
pub fn vectorize_function(
    func: &mut Function,
    mapping: VectorMapping,
    region: Region,
    options: &VectorizeOptions,
) -> VectorizeResult<(VectorizationInfo, VectorizeStats)> {
    if options.vector_width == 0 {
        return Err(VectorizeError::capability("vector width must be positive"));
    }
    let mut mapping = mapping;
    mapping.vector_width = options.vector_width;

    let mut stats = VectorizeStats::default();
    log::debug!(
        "vectorizing {} at width {}",
        func.name,
        options.vector_width
    );

    // Pre-pipeline structures.
    let mut dom = DominatorTree::build(func);
    let mut forest = LoopForest::compute(func, &dom);
    if forest.is_irreducible() {
        return Err(VectorizeError::capability(
            "irreducible control flow is unsupported",
        ));
    }

    // Phase 1: remainder transform for outer-loop vectorization. The region
    // then narrows to the prepared loop; the scalar remainder stays outside.
    let mut region = region;
    let mut prepared_override = None;
    if mapping.abi == VectorAbi::OuterLoop {
        let target = forest
            .top_level()
            .into_iter()
            .find(|&idx| region.contains(forest.get(idx).header))
            .ok_or_else(|| {
                VectorizeError::capability("outer-loop vectorization without a loop")
            })?;
        let prepared = create_vectorizable_loop(
            func,
            &forest,
            target,
            options.use_tail_predication,
            options.vector_width,
            options.trip_align,
            &mut stats.remainder,
        )?
        .ok_or_else(|| {
            VectorizeError::capability("loop is outside the remainder transform's subset")
        })?;

        dom = DominatorTree::build(func);
        forest = LoopForest::compute(func, &dom);
        let idx = forest.loop_with_header(prepared.header).ok_or_else(|| {
            VectorizeError::invariant("prepared loop lost its header")
        })?;
        region = Region::Blocks(forest.get(idx).blocks.iter().copied().collect());
        prepared_override = Some(prepared);
    }

    let mut vi = build_vectorization_info(func, region, mapping);
    if let Some(prepared) = &prepared_override {
        apply_uniform_overrides(&mut vi, prepared);
    }

    // Phase 2: masks. Only phis and straight-line logic are inserted, so
    // the trees stay valid.
    let (mut masks, mask_stats) = materialize_masks(&mut vi, func, &dom);
    stats.masks = mask_stats;

    // Phase 3: shapes and divergence.
    let pdt = PostDominatorTree::build(func);
    stats.shapes = run_shape_analysis(&mut vi, func, &dom, &pdt, &forest);

    // Phase 4: divergent loops. Hard barrier: the loop transform must fully
    // settle before linearization reads the loop forest.
    stats.div_loops = regularize_divergent_loops(&mut vi, func, &mut masks)?;
    let mut dom = DominatorTree::build(func);
    let forest = LoopForest::compute(func, &dom);

    // Phase 5: linearization.
    stats.linearize = linearize(&mut vi, func, &mut dom, &forest, &masks)?;

    verify_uniform_control(&vi, func)?;
    Ok((vi, stats))
}

/// Every surviving conditional branch in the region must be uniform.
fn verify_uniform_control(vi: &VectorizationInfo, func: &Function) -> VectorizeResult<()> {
    for block in func.blocks() {
        if !vi.in_region(block) {
            continue;
        }
        let Some(term) = func.terminator(block) else {
            continue;
        };
        if func.inst(term).unwrap().op != Opcode::Branch {
            continue;
        }
        let shape = vi.shape(term);
        if shape.is_defined() && !shape.is_uniform() {
            return Err(VectorizeError::invariant(format!(
                "non-uniform branch left in {}",
                func.block_name(block)
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockId, CmpPred, Type};
    use crate::shape::VectorShape;

    #[test]
    fn test_zero_width_rejected() {
        let mut f = Function::new("w0");
        let entry = f.create_block("entry");
        f.set_entry(entry);
        f.set_ret(entry, None);

        let options = VectorizeOptions {
            vector_width: 0,
            ..Default::default()
        };
        let err = vectorize_function(
            &mut f,
            VectorMapping::new(0),
            Region::WholeFunction,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, VectorizeError::Capability { .. }));
    }

    #[test]
    fn test_irreducible_cfg_rejected() {
        // Two blocks jumping into each other with two entries.
        let mut f = Function::new("irr");
        let entry = f.create_block("entry");
        let a = f.create_block("a");
        let b = f.create_block("b");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let c1 = f.add_arg(Type::Bool);
        let c2 = f.add_arg(Type::Bool);
        f.set_branch(entry, c1, a, b);
        f.set_branch(a, c2, b, exit);
        f.set_branch(b, c2, a, exit);
        f.set_ret(exit, None);

        let err = vectorize_function(
            &mut f,
            VectorMapping::new(4),
            Region::WholeFunction,
            &VectorizeOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, VectorizeError::Capability { .. }));
    }

    #[test]
    fn test_uniform_branch_noop_pipeline() {
        // S1: a single uniform if; the CFG shape survives the pipeline.
        let mut f = Function::new("uniform_if");
        let entry = f.create_block("entry");
        let then = f.create_block("then");
        let join = f.create_block("join");
        f.set_entry(entry);
        let x = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let cmp = f.push_inst(entry, Opcode::Icmp(CmpPred::Sgt), &[x, c0], Type::Bool);
        f.set_branch(entry, cmp, then, join);
        f.set_jump(then, join);
        f.set_ret(join, None);

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::uni()];
        let (vi, stats) = vectorize_function(
            &mut f,
            mapping,
            Region::WholeFunction,
            &VectorizeOptions::default(),
        )
        .unwrap();

        assert!(vi.shape(cmp).is_uniform());
        assert_eq!(stats.linearize.branches_folded, 0);
        assert_eq!(stats.div_loops.divergent_loops, 0);
        // The conditional structure survives.
        let term = f.terminator(entry).unwrap();
        assert_eq!(f.inst(term).unwrap().op, Opcode::Branch);
        assert_eq!(f.succs(entry).len(), 2);
    }

    fn collect_blocks(f: &Function) -> Vec<BlockId> {
        f.blocks().collect()
    }

    #[test]
    fn test_divergent_if_linearized_end_to_end() {
        // S2-shaped: a per-lane if/else storing through a select afterwards.
        let mut f = Function::new("divergent_if");
        let entry = f.create_block("entry");
        let then = f.create_block("then");
        let other = f.create_block("else");
        let join = f.create_block("join");
        f.set_entry(entry);
        let lane = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let c2 = f.const_int(2);
        let cmp = f.push_inst(entry, Opcode::Icmp(CmpPred::Sgt), &[lane, c0], Type::Bool);
        f.set_branch(entry, cmp, then, other);
        let t = f.push_inst(then, Opcode::Mul, &[lane, c2], Type::Int);
        f.set_jump(then, join);
        let e = f.push_inst(other, Opcode::Add, &[lane, c2], Type::Int);
        f.set_jump(other, join);
        let phi = f.insert_phi(join, Type::Int, &[(t, then), (e, other)]);
        f.set_ret(join, Some(phi));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::cont(1, 0)];
        let (vi, stats) = vectorize_function(
            &mut f,
            mapping,
            Region::WholeFunction,
            &VectorizeOptions::default(),
        )
        .unwrap();

        assert!(vi.is_join_divergent(join));
        assert_eq!(stats.linearize.branches_folded, 1);
        assert!(stats.linearize.phis_folded >= 1);

        // Straight line, and every block still has a shape-annotated
        // terminator.
        for block in collect_blocks(&f) {
            assert!(f.succs(block).len() <= 1);
        }
        assert!(f.block_phis(join).is_empty());
    }
}
