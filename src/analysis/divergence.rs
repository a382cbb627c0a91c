//! Branch dependence analysis.
//!
//! Given a varying branch, this module answers two questions:
//!
//! 1. **Which blocks are control-dependent on it?** Classical formulation
//!    over the post-dominator tree (a block `X` is control-dependent on the
//!    branch block `B` when `B` has a successor from which `X` is reached on
//!    every path, while another successor can bypass `X`).
//! 2. **Which blocks join disjoint paths from it?** A block reachable from
//!    the branch along two node-disjoint paths needs predicated phis. The
//!    join set equals the iterated dominance frontier of the branch's
//!    successor set - the same construction that places phis for a virtual
//!    variable assigned differently on the two edges.
//!
//! Loop divergence derives from both: a loop is divergent when one of its
//!    exiting branches is varying, or when its header joins disjoint paths
//!    (temporal divergence across the back edge).

use crate::ir::{BlockId, DominatorTree, Function, LoopForest, PostDominatorTree};
use crate::vecinfo::VectorizationInfo;

use rustc_hash::{FxHashMap, FxHashSet};

/// Divergence queries for one function.
pub struct BranchDependence<'a> {
    func: &'a Function,
    pdt: &'a PostDominatorTree,

    /// Dominance frontier over forward edges only. Back edges are excluded
    /// so that an in-loop join (two paths meeting at the latch) does not
    /// spuriously leak into the header through the back edge - that would
    /// violate the disjoint-path containment invariant.
    fwd_frontier: FxHashMap<BlockId, Vec<BlockId>>,
}

impl<'a> BranchDependence<'a> {
    /// Create the analysis over prebuilt trees.
    pub fn new(func: &'a Function, dom: &'a DominatorTree, pdt: &'a PostDominatorTree) -> Self {
        let mut fwd_frontier: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &block in &dom.rpo {
            // Forward predecessors: drop back edges (source dominated by the
            // target).
            let preds: Vec<BlockId> = func
                .preds(block)
                .iter()
                .copied()
                .filter(|&p| !dom.dominates(block, p))
                .collect();
            if preds.len() < 2 {
                continue;
            }
            for &pred in &preds {
                let mut runner = pred;
                while dom.idom(block) != Some(runner) {
                    let frontier = fwd_frontier.entry(runner).or_default();
                    if !frontier.contains(&block) {
                        frontier.push(block);
                    }
                    match dom.idom(runner) {
                        Some(up) => runner = up,
                        None => break,
                    }
                }
            }
        }
        BranchDependence {
            func,
            pdt,
            fwd_frontier,
        }
    }

    /// Blocks control-dependent on the branch terminating `block`.
    pub fn control_dependent_on(&self, block: BlockId) -> &[BlockId] {
        self.pdt.control_dependent_on(block)
    }

    /// Join points of disjoint paths from the branch terminating `block`:
    /// the iterated forward dominance frontier of its successor set (the
    /// blocks where a phi would be placed for a virtual variable assigned
    /// differently on the two edges).
    pub fn join_blocks(&self, block: BlockId) -> FxHashSet<BlockId> {
        let succs = self.func.succs(block);
        let mut joins = FxHashSet::default();
        if succs.len() < 2 {
            return joins;
        }
        // A branch with both edges into the same block joins immediately.
        if succs.iter().all(|&s| s == succs[0]) {
            joins.insert(succs[0]);
            return joins;
        }

        let mut worklist: Vec<BlockId> = succs.iter().copied().collect();
        let mut seen: FxHashSet<BlockId> = worklist.iter().copied().collect();
        while let Some(b) = worklist.pop() {
            let Some(frontier) = self.fwd_frontier.get(&b) else {
                continue;
            };
            for &frontier_block in frontier {
                joins.insert(frontier_block);
                if seen.insert(frontier_block) {
                    worklist.push(frontier_block);
                }
            }
        }
        joins
    }
}

/// Reclassify every loop after a branch settled varying, per the invariant:
/// a loop is divergent iff one of its exit branches is varying or its header
/// is join-divergent. Returns headers of loops that newly became divergent.
pub fn update_loop_divergence(
    vi: &mut VectorizationInfo,
    func: &Function,
    loops: &LoopForest,
) -> Vec<BlockId> {
    let mut newly_divergent = Vec::new();
    for idx in 0..loops.len() {
        let lp = loops.get(idx);
        if vi.is_divergent_loop(lp.header) {
            continue;
        }

        let mut divergent = vi.is_join_divergent(lp.header);
        if !divergent {
            for (exiting, _) in loops.exit_edges(func, idx) {
                if exiting_branch_varying(vi, func, exiting) {
                    divergent = true;
                    break;
                }
            }
        }

        if divergent {
            vi.add_divergent_loop(lp.header);
            newly_divergent.push(lp.header);
        }
    }

    // Classify exits of divergent loops: an exit whose exiting branch is
    // varying defers lanes one by one (divergent exit); a uniform exit takes
    // all remaining lanes together (kill exit).
    for idx in 0..loops.len() {
        let lp = loops.get(idx);
        if !vi.is_divergent_loop(lp.header) {
            continue;
        }
        for (exiting, exit) in loops.exit_edges(func, idx) {
            if exiting_branch_varying(vi, func, exiting) {
                vi.add_divergent_loop_exit(exit);
            }
        }
    }

    newly_divergent
}

fn exiting_branch_varying(vi: &VectorizationInfo, func: &Function, exiting: BlockId) -> bool {
    func.terminator(exiting)
        .is_some_and(|t| vi.shape(t).is_defined() && !vi.shape(t).is_uniform())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::shape::VectorShape;
    use crate::vecinfo::{Region, VectorMapping};

    fn analysis_for(func: &Function) -> (DominatorTree, PostDominatorTree) {
        (DominatorTree::build(func), PostDominatorTree::build(func))
    }

    #[test]
    fn test_diamond_join() {
        let mut f = Function::new("diamond");
        let entry = f.create_block("entry");
        let left = f.create_block("left");
        let right = f.create_block("right");
        let join = f.create_block("join");
        f.set_entry(entry);
        let cond = f.add_arg(Type::Bool);
        f.set_branch(entry, cond, left, right);
        f.set_jump(left, join);
        f.set_jump(right, join);
        f.set_ret(join, None);

        let (dt, pdt) = analysis_for(&f);
        let bda = BranchDependence::new(&f, &dt, &pdt);

        let joins = bda.join_blocks(entry);
        assert!(joins.contains(&join));
        assert_eq!(joins.len(), 1);

        let deps = bda.control_dependent_on(entry);
        assert!(deps.contains(&left));
        assert!(deps.contains(&right));
        assert!(!deps.contains(&join));
    }

    #[test]
    fn test_triangle_join() {
        // entry -> (then | join); then -> join
        let mut f = Function::new("triangle");
        let entry = f.create_block("entry");
        let then = f.create_block("then");
        let join = f.create_block("join");
        f.set_entry(entry);
        let cond = f.add_arg(Type::Bool);
        f.set_branch(entry, cond, then, join);
        f.set_jump(then, join);
        f.set_ret(join, None);

        let (dt, pdt) = analysis_for(&f);
        let bda = BranchDependence::new(&f, &dt, &pdt);
        let joins = bda.join_blocks(entry);
        assert!(joins.contains(&join));
    }

    #[test]
    fn test_loop_header_join_from_inner_branch() {
        // Loop body splits and re-merges at the header via the latch:
        // header -> (body | exit); body -> (a | b); a -> latch; b -> latch;
        // latch -> header. The varying branch in body joins at latch.
        let mut f = Function::new("loop_join");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let a = f.create_block("a");
        let b = f.create_block("b");
        let latch = f.create_block("latch");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let c1 = f.add_arg(Type::Bool);
        let c2 = f.add_arg(Type::Bool);
        f.set_jump(entry, header);
        f.set_branch(header, c1, body, exit);
        f.set_branch(body, c2, a, b);
        f.set_jump(a, latch);
        f.set_jump(b, latch);
        f.set_jump(latch, header);
        f.set_ret(exit, None);

        let (dt, pdt) = analysis_for(&f);
        let bda = BranchDependence::new(&f, &dt, &pdt);

        let joins = bda.join_blocks(body);
        assert!(joins.contains(&latch));
        assert!(!joins.contains(&exit));
        // Once joined at the latch, the divergence is resolved: the header
        // is not reachable on disjoint paths from the body branch.
        assert!(!joins.contains(&header));

        // The header's own exit branch has no acyclic join (the exit block
        // has a single predecessor); its divergence is a loop-level matter.
        let joins = bda.join_blocks(header);
        assert!(joins.is_empty());
    }

    #[test]
    fn test_loop_divergence_from_varying_exit() {
        let mut f = Function::new("divloop");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let cond = f.add_arg(Type::Bool);
        f.set_jump(entry, header);
        let branch = f.set_branch(header, cond, body, exit);
        f.set_jump(body, header);
        f.set_ret(exit, None);

        let dt = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dt);

        let mut vi = VectorizationInfo::new(Region::WholeFunction, VectorMapping::new(4));

        // Uniform exit branch: loop stays uniform.
        vi.set_shape(branch, VectorShape::uni());
        assert!(update_loop_divergence(&mut vi, &f, &loops).is_empty());
        assert!(!vi.is_divergent_loop(header));

        // Varying exit branch: loop becomes divergent, exit is divergent.
        vi.set_shape(branch, VectorShape::varying(1));
        let newly = update_loop_divergence(&mut vi, &f, &loops);
        assert_eq!(newly, vec![header]);
        assert!(vi.is_divergent_loop(header));
        assert!(vi.is_divergent_loop_exit(exit));
        assert!(!vi.is_kill_exit(exit));
    }
}
