//! Vectorization shape analysis.
//!
//! A worklist fixed-point solver that assigns a [`VectorShape`] to every
//! value in the region. Shapes only rise along the finite lattice chain, so
//! the solver terminates; the dequeue order does not affect the fixed point.
//!
//! # Algorithm Overview
//!
//! 1. Seed arguments from the vector mapping, constants as uniform, pinned
//!    values with their frozen shapes
//! 2. Process the worklist: compute each instruction's transfer from its
//!    operand shapes; on change, re-enqueue the users
//! 3. When a conditional branch settles on a non-uniform shape, derive the
//!    join-divergent blocks and reclassify loops; phis in join blocks and
//!    users outside newly divergent loops are re-enqueued
//! 4. Cast values that stayed undefined (dead or unreachable) to uniform
//!
//! Operand shapes are read through the observation rule: a value defined in
//! a divergent loop is varying for users outside that loop, whatever its
//! in-loop shape.

use super::divergence::{update_loop_divergence, BranchDependence};
use crate::ir::{
    BlockId, DominatorTree, Function, LoopForest, Opcode, PostDominatorTree, ValueId, ValueKind,
};
use crate::shape::{
    self, ShapeTerm, VectorShape,
};
use crate::vecinfo::{CallShapeRule, VectorizationInfo};

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from one shape analysis run.
#[derive(Debug, Clone, Default)]
pub struct ShapeAnalysisStats {
    /// Number of worklist pops.
    pub values_visited: usize,
    /// Number of lattice value changes.
    pub shape_changes: usize,
    /// Branches that settled on a non-uniform shape.
    pub varying_branches: usize,
    /// Blocks marked join-divergent.
    pub join_blocks: usize,
    /// Loops marked divergent.
    pub divergent_loops: usize,
    /// Values cast from undef to uniform in the final pass.
    pub undef_fixed: usize,
}

// =============================================================================
// Entry point
// =============================================================================

/// Run shape analysis to a fixed point, updating `vi` in place.
pub fn run_shape_analysis(
    vi: &mut VectorizationInfo,
    func: &Function,
    dom: &DominatorTree,
    pdt: &PostDominatorTree,
    loops: &LoopForest,
) -> ShapeAnalysisStats {
    let mut analysis = ShapeAnalysis {
        func,
        loops,
        bda: BranchDependence::new(func, dom, pdt),
        worklist: VecDeque::new(),
        alloca_content: FxHashMap::default(),
        stats: ShapeAnalysisStats::default(),
    };
    analysis.init(vi);
    analysis.compute(vi);
    analysis.fix_undefined_shapes(vi);
    analysis.stats
}

// =============================================================================
// Solver
// =============================================================================

struct ShapeAnalysis<'f> {
    func: &'f Function,
    loops: &'f LoopForest,
    bda: BranchDependence<'f>,
    worklist: VecDeque<ValueId>,

    /// Flow-insensitive shape of values stored into each alloca.
    alloca_content: FxHashMap<ValueId, VectorShape>,

    stats: ShapeAnalysisStats,
}

impl<'f> ShapeAnalysis<'f> {
    /// Initialize statically known shapes and seed the worklist.
    fn init(&mut self, vi: &mut VectorizationInfo) {
        let arg_shapes = vi.mapping().arg_shapes.clone();
        for (i, &arg) in self.func.args().iter().enumerate() {
            if vi.is_pinned(arg) {
                continue;
            }
            let shape = arg_shapes.get(i).copied().unwrap_or(VectorShape::uni());
            vi.set_shape(arg, shape);
        }

        for block in self.func.blocks() {
            if !vi.in_region(block) {
                continue;
            }
            for &inst in self.func.block_insts(block) {
                self.worklist.push_back(inst);
            }
        }
    }

    /// Main fixed-point loop.
    fn compute(&mut self, vi: &mut VectorizationInfo) {
        while let Some(value) = self.worklist.pop_front() {
            self.stats.values_visited += 1;

            let Some(inst) = self.func.inst(value) else {
                continue;
            };
            if !vi.in_region(inst.block) || vi.is_pinned(value) {
                continue;
            }

            let new_shape = match inst.op {
                Opcode::Phi => self.compute_phi_shape(vi, value),
                Opcode::Store => {
                    self.process_store(vi, value);
                    continue;
                }
                _ => self.compute_inst_shape(vi, value),
            };

            let Some(new_shape) = new_shape else {
                continue;
            };
            self.update(vi, value, new_shape);
        }
    }

    /// Shape of a phi: meet over the incoming shapes that are already known;
    /// at a join of disjoint paths from a varying branch the result is at
    /// least varying.
    fn compute_phi_shape(&mut self, vi: &VectorizationInfo, phi: ValueId) -> Option<VectorShape> {
        let block = self.func.def_block(phi).unwrap();
        let incoming = self.func.phi_incoming(phi);

        let mut merged = VectorShape::undef();
        let mut missing = Vec::new();
        for (value, _) in incoming {
            let shape = self.observed(vi, block, value);
            if shape.is_undef() {
                missing.push(value);
                continue;
            }
            merged = merged.meet(&shape);
        }

        if merged.is_undef() {
            // Nothing known yet: wait for a producer to settle.
            self.push_producers(&missing);
            return None;
        }
        if vi.is_join_divergent(block) {
            merged = merged.meet(&VectorShape::varying(merged.alignment()));
        }
        Some(merged)
    }

    /// Transfer for non-phi instructions. Returns `None` while an operand is
    /// still undefined (the producers get re-enqueued instead).
    fn compute_inst_shape(&mut self, vi: &VectorizationInfo, value: ValueId) -> Option<VectorShape> {
        let inst = self.func.inst(value).unwrap();
        let block = inst.block;
        let operands = inst.operands.clone();
        let op = inst.op.clone();

        let mut terms = Vec::with_capacity(operands.len());
        let mut missing = Vec::new();
        for &operand in &operands {
            let term = self.operand_term(vi, block, operand);
            if term.shape.is_undef() {
                missing.push(operand);
            }
            terms.push(term);
        }
        if !missing.is_empty() {
            self.push_producers(&missing);
            return None;
        }

        let shape = match op {
            Opcode::Add => shape::transfer_add(terms[0], terms[1]),
            Opcode::Sub => shape::transfer_sub(terms[0], terms[1]),
            Opcode::Mul => shape::transfer_mul(terms[0], terms[1]),
            Opcode::Shl => shape::transfer_shl(terms[0], terms[1]),
            Opcode::SDiv | Opcode::AShr => shape::transfer_sdiv(terms[0], terms[1]),
            Opcode::SRem | Opcode::Icmp(_) | Opcode::UMin => shape::transfer_generic(&terms),
            Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Not => shape::transfer_generic(&terms),
            Opcode::ZExt | Opcode::SExt => shape::transfer_ext(terms[0]),
            Opcode::Trunc => shape::transfer_trunc(terms[0]),
            Opcode::Gep { elem_size } => shape::transfer_gep(terms[0], terms[1], elem_size),
            Opcode::Select => shape::transfer_select(terms[0], terms[1], terms[2]),
            Opcode::Load => self.compute_load_shape(&terms[0], operands[0]),
            Opcode::Call { ref callee } => self.compute_call_shape(vi, callee, &terms),
            // The alloca pointer is the same for all lanes; encode the object
            // alignment as a zero-stride affine base.
            Opcode::Alloca { align } => VectorShape::cont(0, align as u64),
            // Horizontal reductions produce one lane-invariant scalar.
            Opcode::AnyLane => VectorShape::uni(),
            // A branch diverges exactly as its condition does.
            Opcode::Branch => terms[0].shape,
            Opcode::Jump | Opcode::Ret => VectorShape::uni(),
            Opcode::Phi | Opcode::Store => unreachable!("handled by the caller"),
        };
        Some(shape)
    }

    /// Loads: a lane-invariant address yields the stored content shape (or
    /// uniform for untouched memory); per-lane addresses yield varying data.
    fn compute_load_shape(&self, ptr_term: &ShapeTerm, ptr: ValueId) -> VectorShape {
        if ptr_term.shape.stride() == Some(0) || ptr_term.shape.is_uniform() {
            let base = underlying_alloca(self.func, ptr);
            match base.and_then(|a| self.alloca_content.get(&a)) {
                Some(content) => content.meet(&VectorShape::uni()),
                None => VectorShape::uni(),
            }
        } else {
            VectorShape::varying(1)
        }
    }

    /// Calls: consult the scalar-to-vector function map; unknown callees are
    /// assumed to have side effects and go varying.
    fn compute_call_shape(
        &self,
        vi: &VectorizationInfo,
        callee: &str,
        args: &[ShapeTerm],
    ) -> VectorShape {
        match vi.mapping().function(callee) {
            Some(info) => match info.result {
                CallShapeRule::Fixed(shape) => shape,
                CallShapeRule::UniformIfUniformArgs => {
                    if info.pure_fn && args.iter().all(|t| t.shape.is_uniform()) {
                        VectorShape::uni()
                    } else {
                        VectorShape::varying(1)
                    }
                }
            },
            None => VectorShape::varying(1),
        }
    }

    /// Stores update the flow-insensitive content shape of the underlying
    /// alloca; dependent loads are re-enqueued when it coarsens.
    fn process_store(&mut self, vi: &mut VectorizationInfo, store: ValueId) {
        let inst = self.func.inst(store).unwrap();
        let block = inst.block;
        let stored = inst.operands[0];
        let ptr = inst.operands[1];

        let stored_term = self.operand_term(vi, block, stored);
        let ptr_term = self.operand_term(vi, block, ptr);
        if stored_term.shape.is_undef() || ptr_term.shape.is_undef() {
            self.push_producers(&[stored, ptr]);
            return;
        }

        // The store itself carries the shape of the stored operand.
        self.update(vi, store, stored_term.shape);

        let Some(alloca) = underlying_alloca(self.func, ptr) else {
            return;
        };
        let scattered = !(ptr_term.shape.stride() == Some(0) || ptr_term.shape.is_uniform());
        let incoming = if scattered {
            VectorShape::varying(1)
        } else {
            stored_term.shape
        };

        let content = self
            .alloca_content
            .entry(alloca)
            .or_insert_with(VectorShape::undef);
        if content.merge(&incoming) {
            log::trace!(
                "store chain of alloca {alloca} coarsened to {}",
                self.alloca_content[&alloca]
            );
            self.push_alloca_dependents(alloca);
        }
    }

    /// Operand view for the transfer functions.
    fn operand_term(&self, vi: &VectorizationInfo, observer: BlockId, value: ValueId) -> ShapeTerm {
        match &self.func.value(value).kind {
            ValueKind::ConstInt(c) => ShapeTerm::new(VectorShape::uni(), Some(*c)),
            ValueKind::ConstBool(b) => ShapeTerm::new(VectorShape::uni(), Some(*b as i64)),
            ValueKind::Undef => ShapeTerm::new(VectorShape::uni(), None),
            ValueKind::Arg { .. } => ShapeTerm::new(vi.shape(value), None),
            ValueKind::Inst(_) => ShapeTerm::new(
                vi.observed_shape(self.func, self.loops, observer, value),
                None,
            ),
            ValueKind::Removed => ShapeTerm::new(VectorShape::uni(), None),
        }
    }

    fn observed(&self, vi: &VectorizationInfo, observer: BlockId, value: ValueId) -> VectorShape {
        self.operand_term(vi, observer, value).shape
    }

    /// Record a value's computed shape; on change, propagate to the users
    /// and re-derive divergence for settled branches.
    fn update(&mut self, vi: &mut VectorizationInfo, value: ValueId, computed: VectorShape) {
        let mut shape = vi.shape(value);
        if !shape.merge(&computed) {
            return;
        }
        self.stats.shape_changes += 1;
        vi.set_shape(value, shape);
        log::trace!("shape({value}) = {shape}");

        for &user in self.func.uses(value) {
            self.worklist.push_back(user);
        }

        let is_branch = self
            .func
            .inst(value)
            .is_some_and(|i| i.op == Opcode::Branch);
        if is_branch && !shape.is_uniform() {
            self.analyze_divergence(vi, value);
        }
    }

    /// A branch settled varying: derive join-divergent blocks, reclassify
    /// loops, and re-enqueue everything whose observed shape may coarsen.
    fn analyze_divergence(&mut self, vi: &mut VectorizationInfo, branch: ValueId) {
        self.stats.varying_branches += 1;
        let block = self.func.def_block(branch).unwrap();
        log::debug!(
            "varying branch in {}: deriving joins",
            self.func.block_name(block)
        );

        for join in self.bda.join_blocks(block) {
            if !vi.in_region(join) {
                continue;
            }
            if vi.add_join_divergent(join) {
                self.stats.join_blocks += 1;
                vi.set_varying_predicate_flag(join, true);
                for phi in self.func.block_phis(join) {
                    self.worklist.push_back(phi);
                }
            }
        }

        for header in update_loop_divergence(vi, self.func, self.loops) {
            self.stats.divergent_loops += 1;
            log::debug!(
                "loop with header {} is divergent",
                self.func.block_name(header)
            );
            self.push_loop_escaping_users(header);
        }
    }

    /// Re-enqueue users outside a newly divergent loop: their operands are
    /// now observed varying (LCSSA phis in particular).
    fn push_loop_escaping_users(&mut self, header: BlockId) {
        let Some(idx) = self.loops.loop_with_header(header) else {
            return;
        };
        let lp = self.loops.get(idx);
        for &block in &lp.blocks.clone() {
            for &inst in self.func.block_insts(block) {
                for &user in self.func.uses(inst) {
                    let outside = self
                        .func
                        .def_block(user)
                        .is_some_and(|b| !lp.contains(b));
                    if outside {
                        self.worklist.push_back(user);
                    }
                }
            }
        }
    }

    /// Re-enqueue the producers of still-undefined operands.
    fn push_producers(&mut self, operands: &[ValueId]) {
        for &operand in operands {
            if self.func.is_inst(operand) {
                self.worklist.push_back(operand);
            }
        }
    }

    /// Re-enqueue loads (and stores) reachable from an alloca through
    /// address computations.
    fn push_alloca_dependents(&mut self, alloca: ValueId) {
        let mut visited = FxHashSet::default();
        let mut stack = vec![alloca];
        while let Some(value) = stack.pop() {
            if !visited.insert(value) {
                continue;
            }
            for &user in self.func.uses(value) {
                match self.func.inst(user).map(|i| &i.op) {
                    Some(Opcode::Load) | Some(Opcode::Store) => {
                        self.worklist.push_back(user);
                    }
                    Some(Opcode::Gep { .. }) | Some(Opcode::Select) | Some(Opcode::Phi) => {
                        stack.push(user);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Values that stayed undefined are dead or unreachable; cast them to
    /// uniform so no undef leaks out of the analysis.
    fn fix_undefined_shapes(&mut self, vi: &mut VectorizationInfo) {
        for block in self.func.blocks() {
            if !vi.in_region(block) {
                continue;
            }
            for &inst in self.func.block_insts(block) {
                if vi.shape(inst).is_undef() {
                    vi.set_shape(inst, VectorShape::uni());
                    self.stats.undef_fixed += 1;
                }
            }
        }
        for &arg in self.func.args() {
            if vi.shape(arg).is_undef() {
                vi.set_shape(arg, VectorShape::uni());
                self.stats.undef_fixed += 1;
            }
        }
    }
}

/// Walk an address computation down to its alloca, if it has one.
fn underlying_alloca(func: &Function, ptr: ValueId) -> Option<ValueId> {
    let mut current = ptr;
    loop {
        match func.inst(current).map(|i| (&i.op, i.operands.as_slice())) {
            Some((Opcode::Alloca { .. }, _)) => return Some(current),
            Some((Opcode::Gep { .. }, operands)) => current = operands[0],
            _ => return None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpPred, Type};
    use crate::vecinfo::{Region, VectorMapping};

    fn run(
        func: &Function,
        mapping: VectorMapping,
    ) -> (VectorizationInfo, ShapeAnalysisStats) {
        let dom = DominatorTree::build(func);
        let pdt = PostDominatorTree::build(func);
        let loops = LoopForest::compute(func, &dom);
        let mut vi = VectorizationInfo::new(Region::WholeFunction, mapping);
        let stats = run_shape_analysis(&mut vi, func, &dom, &pdt, &loops);
        (vi, stats)
    }

    fn straight_line() -> (Function, BlockId) {
        let mut f = Function::new("straight");
        let entry = f.create_block("entry");
        f.set_entry(entry);
        (f, entry)
    }

    #[test]
    fn test_contiguous_arithmetic_chain() {
        // t = 2*i + 1; u = t + i with shape(i) = cont(1, 0)
        let (mut f, entry) = straight_line();
        let i = f.add_arg(Type::Int);
        let c2 = f.const_int(2);
        let c1 = f.const_int(1);
        let two_i = f.push_inst(entry, Opcode::Mul, &[c2, i], Type::Int);
        let t = f.push_inst(entry, Opcode::Add, &[two_i, c1], Type::Int);
        let u = f.push_inst(entry, Opcode::Add, &[t, i], Type::Int);
        f.set_ret(entry, Some(u));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::cont(1, 0)];
        let (vi, _) = run(&f, mapping);

        assert_eq!(vi.shape(t), VectorShape::cont(2, 1));
        assert_eq!(vi.shape(u), VectorShape::cont(3, 1));
    }

    #[test]
    fn test_monotone_rerun_is_identical() {
        let (mut f, entry) = straight_line();
        let i = f.add_arg(Type::Int);
        let c3 = f.const_int(3);
        let x = f.push_inst(entry, Opcode::Mul, &[i, c3], Type::Int);
        f.set_ret(entry, Some(x));

        let dom = DominatorTree::build(&f);
        let pdt = PostDominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::cont(1, 0)];
        let mut vi = VectorizationInfo::new(Region::WholeFunction, mapping);

        run_shape_analysis(&mut vi, &f, &dom, &pdt, &loops);
        let first = vi.shapes().clone();
        run_shape_analysis(&mut vi, &f, &dom, &pdt, &loops);
        assert_eq!(&first, vi.shapes());
    }

    #[test]
    fn test_pinned_shape_preserved() {
        let (mut f, entry) = straight_line();
        let i = f.add_arg(Type::Int);
        let c2 = f.const_int(2);
        let x = f.push_inst(entry, Opcode::Mul, &[i, c2], Type::Int);
        f.set_ret(entry, Some(x));

        let dom = DominatorTree::build(&f);
        let pdt = PostDominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::cont(1, 0)];
        let mut vi = VectorizationInfo::new(Region::WholeFunction, mapping);
        vi.set_pinned_shape(x, VectorShape::uni());

        run_shape_analysis(&mut vi, &f, &dom, &pdt, &loops);
        assert_eq!(vi.shape(x), VectorShape::uni());
    }

    #[test]
    fn test_uniform_branch_no_divergence() {
        let mut f = Function::new("uni_branch");
        let entry = f.create_block("entry");
        let then = f.create_block("then");
        let join = f.create_block("join");
        f.set_entry(entry);
        let x = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let cmp = f.push_inst(entry, Opcode::Icmp(CmpPred::Sgt), &[x, c0], Type::Bool);
        let branch = f.set_branch(entry, cmp, then, join);
        f.set_jump(then, join);
        f.set_ret(join, None);

        let (vi, stats) = run(&f, VectorMapping::new(4));
        assert!(vi.shape(cmp).is_uniform());
        assert!(vi.shape(branch).is_uniform());
        assert!(!vi.is_join_divergent(join));
        assert_eq!(stats.varying_branches, 0);
    }

    #[test]
    fn test_varying_branch_marks_join() {
        let mut f = Function::new("div_branch");
        let entry = f.create_block("entry");
        let then = f.create_block("then");
        let other = f.create_block("other");
        let join = f.create_block("join");
        f.set_entry(entry);
        let lane_val = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let c7 = f.const_int(7);
        let cmp = f.push_inst(entry, Opcode::Icmp(CmpPred::Sgt), &[lane_val, c0], Type::Bool);
        f.set_branch(entry, cmp, then, other);
        f.set_jump(then, join);
        f.set_jump(other, join);
        let c1 = f.const_int(1);
        let phi = f.insert_phi(join, Type::Int, &[(c1, then), (c7, other)]);
        f.set_ret(join, Some(phi));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::varying(1)];
        let (vi, stats) = run(&f, mapping);

        assert!(vi.shape(cmp).is_varying());
        assert!(vi.is_join_divergent(join));
        assert_eq!(vi.varying_predicate_flag(join), Some(true));
        // The phi merges two uniform constants but sits at a divergent join.
        assert!(vi.shape(phi).is_varying());
        assert!(stats.varying_branches >= 1);
    }

    #[test]
    fn test_divergent_loop_and_lcssa() {
        // while (p != 0) { p = next(p) } with per-lane p
        let mut f = Function::new("div_loop");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let p0 = f.add_arg(Type::Int);
        f.set_jump(entry, header);
        let phi = f.insert_phi(header, Type::Int, &[(p0, entry)]);
        let c0 = f.const_int(0);
        let cmp = f.push_inst(header, Opcode::Icmp(CmpPred::Ne), &[phi, c0], Type::Bool);
        f.set_branch(header, cmp, body, exit);
        let c1 = f.const_int(1);
        let next = f.push_inst(body, Opcode::Sub, &[phi, c1], Type::Int);
        f.add_phi_incoming(phi, next, body);
        f.set_jump(body, header);
        let lcssa = f.insert_phi(exit, Type::Int, &[(phi, header)]);
        f.set_ret(exit, Some(lcssa));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::varying(1)];
        let (vi, stats) = run(&f, mapping);

        assert!(vi.is_divergent_loop(header));
        assert!(vi.is_divergent_loop_exit(exit));
        assert_eq!(stats.divergent_loops, 1);
        // The loop-carried value escapes a divergent loop: observed varying.
        assert!(vi.shape(lcssa).is_varying());
    }

    #[test]
    fn test_no_undef_leaks() {
        let (mut f, entry) = straight_line();
        let x = f.add_arg(Type::Int);
        let y = f.push_inst(entry, Opcode::Add, &[x, x], Type::Int);
        f.set_ret(entry, Some(y));

        let (vi, _) = run(&f, VectorMapping::new(4));
        for block in f.blocks() {
            for &inst in f.block_insts(block) {
                assert!(vi.shape(inst).is_defined(), "{inst} leaked undef");
            }
        }
    }

    #[test]
    fn test_store_chain_pollutes_loads() {
        // alloca; store varying into it; load from it (uniform address)
        let (mut f, entry) = straight_line();
        let v = f.add_arg(Type::Int);
        let slot = f.push_inst(entry, Opcode::Alloca { align: 8 }, &[], Type::Ptr);
        f.push_inst(entry, Opcode::Store, &[v, slot], Type::Int);
        let load = f.push_inst(entry, Opcode::Load, &[slot], Type::Int);
        f.set_ret(entry, Some(load));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::varying(1)];
        let (vi, _) = run(&f, mapping);
        assert!(vi.shape(load).is_varying());

        // With a uniform stored value the load stays uniform.
        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::uni()];
        let (vi, _) = run(&f, mapping);
        assert!(vi.shape(load).is_uniform());
    }

    #[test]
    fn test_call_through_function_map() {
        use crate::vecinfo::VectorFuncInfo;

        let (mut f, entry) = straight_line();
        let x = f.add_arg(Type::Int);
        let known = f.push_inst(
            entry,
            Opcode::Call {
                callee: "next".into(),
            },
            &[x],
            Type::Int,
        );
        let unknown = f.push_inst(
            entry,
            Opcode::Call {
                callee: "mystery".into(),
            },
            &[x],
            Type::Int,
        );
        f.set_ret(entry, Some(unknown));

        let mut mapping = VectorMapping::new(4);
        mapping.arg_shapes = vec![VectorShape::uni()];
        mapping.functions.insert(
            "next".into(),
            VectorFuncInfo {
                vector_name: "next_v4".into(),
                pure_fn: true,
                result: CallShapeRule::UniformIfUniformArgs,
            },
        );
        let (vi, _) = run(&f, mapping);

        assert!(vi.shape(known).is_uniform());
        assert!(vi.shape(unknown).is_varying());
    }
}
