//! Induction variable and exit condition recognition.
//!
//! The remainder transform only handles loops it can reason about: a single
//! counted induction variable, a recognized `iv <cmp> bound` exit test and
//! loop-carried phis limited to the induction variable plus simple
//! reductions. This module performs that pattern matching.

use crate::ir::{BlockId, CmpPred, Function, LoopForest, Opcode, ValueId};

// =============================================================================
// Induction variables
// =============================================================================

/// A basic induction variable: `init + step * iteration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InductionVariable {
    /// The header phi that defines the variable.
    pub phi: ValueId,

    /// Initial value flowing in from the pre-header.
    pub init: ValueId,

    /// Constant step per iteration.
    pub step: i64,

    /// The back-edge update instruction (the add that moves the variable).
    pub update: ValueId,
}

/// Find the counted induction variable of a loop: a header phi whose
/// back-edge value is `phi + constant`.
pub fn find_induction_variable(
    func: &Function,
    loops: &LoopForest,
    loop_idx: usize,
) -> Option<InductionVariable> {
    let lp = loops.get(loop_idx);
    let latch = lp.latch()?;
    let preheader = loops.preheader(func, loop_idx)?;

    for phi in func.block_phis(lp.header) {
        let init_idx = func.phi_incoming_index(phi, preheader)?;
        let latch_idx = func.phi_incoming_index(phi, latch)?;
        let incoming = func.phi_incoming(phi);
        let init = incoming[init_idx].0;
        let update = incoming[latch_idx].0;

        let Some(inst) = func.inst(update) else {
            continue;
        };
        if inst.op != Opcode::Add {
            continue;
        }
        let step = match (
            inst.operands[0] == phi,
            func.as_const_int(inst.operands[1]),
            inst.operands[1] == phi,
            func.as_const_int(inst.operands[0]),
        ) {
            (true, Some(c), _, _) => c,
            (_, _, true, Some(c)) => c,
            _ => continue,
        };
        if step == 0 {
            continue;
        }
        return Some(InductionVariable {
            phi,
            init,
            step,
            update,
        });
    }
    None
}

// =============================================================================
// Exit conditions
// =============================================================================

/// A recognized loop exit test of the form `iv <cmp> bound`.
#[derive(Debug, Clone)]
pub struct ExitCondition {
    /// Block holding the exit branch.
    pub exiting: BlockId,

    /// The exit block outside the loop.
    pub exit: BlockId,

    /// The branch instruction.
    pub branch: ValueId,

    /// The comparison feeding the branch.
    pub cmp: ValueId,

    /// Comparison predicate.
    pub pred: CmpPred,

    /// The induction variable under test.
    pub iv: InductionVariable,

    /// The value of the induction variable being compared (the phi itself
    /// or its update).
    pub tested: ValueId,

    /// Loop-invariant bound.
    pub bound: ValueId,

    /// Whether the true edge of the branch stays in the loop.
    pub continue_on_true: bool,
}

/// Check that a value does not change inside the loop.
pub fn is_loop_invariant(func: &Function, loops: &LoopForest, loop_idx: usize, value: ValueId) -> bool {
    match func.def_block(value) {
        Some(block) => !loops.get(loop_idx).contains(block),
        None => true,
    }
}

/// Recognize the exit condition of a single-exit counted loop.
pub fn analyze_exit_condition(
    func: &Function,
    loops: &LoopForest,
    loop_idx: usize,
) -> Option<ExitCondition> {
    let iv = find_induction_variable(func, loops, loop_idx)?;
    let lp = loops.get(loop_idx);

    let exit_edges = loops.exit_edges(func, loop_idx);
    let [(exiting, exit)] = exit_edges.as_slice() else {
        return None;
    };
    let (exiting, exit) = (*exiting, *exit);

    let branch = func.terminator(exiting)?;
    let branch_inst = func.inst(branch)?;
    if branch_inst.op != Opcode::Branch {
        return None;
    }
    let cmp = branch_inst.operands[0];
    let continue_on_true = lp.contains(branch_inst.blocks[0]);

    let cmp_inst = func.inst(cmp)?;
    let Opcode::Icmp(pred) = cmp_inst.op else {
        return None;
    };
    if !matches!(pred, CmpPred::Slt | CmpPred::Sle | CmpPred::Ne) {
        return None;
    }

    let (tested, bound) = if cmp_inst.operands[0] == iv.phi || cmp_inst.operands[0] == iv.update {
        (cmp_inst.operands[0], cmp_inst.operands[1])
    } else if cmp_inst.operands[1] == iv.phi || cmp_inst.operands[1] == iv.update {
        (cmp_inst.operands[1], cmp_inst.operands[0])
    } else {
        return None;
    };
    if !is_loop_invariant(func, loops, loop_idx, bound) {
        return None;
    }

    Some(ExitCondition {
        exiting,
        exit,
        branch,
        cmp,
        pred,
        iv,
        tested,
        bound,
        continue_on_true,
    })
}

// =============================================================================
// Reductions
// =============================================================================

/// Kinds of reduction updates the remainder transform tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReductionKind {
    Add,
    Mul,
    Min,
}

/// A loop-carried reduction: `acc = acc <op> x` through a header phi.
#[derive(Debug, Clone)]
pub struct Reduction {
    pub phi: ValueId,
    pub kind: ReductionKind,
    pub update: ValueId,
}

/// Classify every loop-carried header phi as the induction variable or a
/// recognized reduction. Returns `None` when an unrecognized phi remains.
pub fn classify_loop_carried(
    func: &Function,
    loops: &LoopForest,
    loop_idx: usize,
    iv: &InductionVariable,
) -> Option<Vec<Reduction>> {
    let lp = loops.get(loop_idx);
    let latch = lp.latch()?;
    let mut reductions = Vec::new();

    for phi in func.block_phis(lp.header) {
        if phi == iv.phi {
            continue;
        }
        let latch_idx = func.phi_incoming_index(phi, latch)?;
        let update = func.phi_incoming(phi)[latch_idx].0;
        let inst = func.inst(update)?;
        let kind = match inst.op {
            Opcode::Add => ReductionKind::Add,
            Opcode::Mul => ReductionKind::Mul,
            Opcode::UMin => ReductionKind::Min,
            _ => return None,
        };
        if !inst.operands.iter().any(|&op| op == phi) {
            return None;
        }
        reductions.push(Reduction { phi, kind, update });
    }
    Some(reductions)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DominatorTree, Type};

    /// for (i = 0; i < n; i += step) body
    fn counted_loop(step: i64) -> (Function, ValueId, ValueId, BlockId) {
        let mut f = Function::new("counted");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let latch = f.create_block("latch");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let n = f.add_arg(Type::Int);
        let c0 = f.const_int(0);
        let cstep = f.const_int(step);
        f.set_jump(entry, header);
        let iv = f.insert_phi(header, Type::Int, &[(c0, entry)]);
        let cmp = f.push_inst(header, Opcode::Icmp(CmpPred::Slt), &[iv, n], Type::Bool);
        f.set_branch(header, cmp, body, exit);
        f.set_jump(body, latch);
        let next = f.push_inst(latch, Opcode::Add, &[iv, cstep], Type::Int);
        f.add_phi_incoming(iv, next, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);
        (f, iv, n, header)
    }

    #[test]
    fn test_find_induction_variable() {
        let (f, iv_phi, _, _) = counted_loop(1);
        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);

        let iv = find_induction_variable(&f, &loops, 0).expect("iv not found");
        assert_eq!(iv.phi, iv_phi);
        assert_eq!(iv.step, 1);
        assert_eq!(f.as_const_int(iv.init), Some(0));
    }

    #[test]
    fn test_exit_condition_recognized() {
        let (f, iv_phi, n, _) = counted_loop(2);
        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);

        let cond = analyze_exit_condition(&f, &loops, 0).expect("exit not recognized");
        assert_eq!(cond.pred, CmpPred::Slt);
        assert_eq!(cond.tested, iv_phi);
        assert_eq!(cond.bound, n);
        assert!(cond.continue_on_true);
        assert_eq!(cond.iv.step, 2);
    }

    #[test]
    fn test_two_exit_loop_rejected() {
        // Add a second exit out of the body.
        let mut f = Function::new("two_exit");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let latch = f.create_block("latch");
        let exit = f.create_block("exit");
        let exit2 = f.create_block("exit2");
        f.set_entry(entry);
        let n = f.add_arg(Type::Int);
        let flag = f.add_arg(Type::Bool);
        let c0 = f.const_int(0);
        let c1 = f.const_int(1);
        f.set_jump(entry, header);
        let iv = f.insert_phi(header, Type::Int, &[(c0, entry)]);
        let cmp = f.push_inst(header, Opcode::Icmp(CmpPred::Slt), &[iv, n], Type::Bool);
        f.set_branch(header, cmp, body, exit);
        f.set_branch(body, flag, exit2, latch);
        let next = f.push_inst(latch, Opcode::Add, &[iv, c1], Type::Int);
        f.add_phi_incoming(iv, next, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);
        f.set_ret(exit2, None);

        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        assert!(analyze_exit_condition(&f, &loops, 0).is_none());
    }

    #[test]
    fn test_classify_reduction() {
        // Add an accumulator acc += iv in the loop.
        let mut f = Function::new("red");
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
        let sum = f.push_inst(latch, Opcode::Add, &[acc, iv], Type::Int);
        let next = f.push_inst(latch, Opcode::Add, &[iv, c1], Type::Int);
        f.add_phi_incoming(iv, next, latch);
        f.add_phi_incoming(acc, sum, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);

        let dom = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dom);
        let found_iv = find_induction_variable(&f, &loops, 0).unwrap();
        assert_eq!(found_iv.phi, iv);

        let reductions = classify_loop_carried(&f, &loops, 0, &found_iv).unwrap();
        assert_eq!(reductions.len(), 1);
        assert_eq!(reductions[0].phi, acc);
        assert_eq!(reductions[0].kind, ReductionKind::Add);
    }
}
