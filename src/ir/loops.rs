//! Natural loop detection and the loop forest.
//!
//! Loops are found from back edges (a CFG edge whose target dominates its
//! source); bodies are collected by a reverse walk from the back-edge source.
//! The forest records nesting and exposes the canonical-form queries the
//! transforms need: unique latch, pre-header, exiting edges, innermost-first
//! order.

use super::cfg::DominatorTree;
use super::entity::{BlockId, DenseSet};
use super::func::Function;

use rustc_hash::FxHashMap;
use std::collections::VecDeque;

// =============================================================================
// Loop
// =============================================================================

/// A natural loop.
#[derive(Debug, Clone)]
pub struct Loop {
    /// The loop header block.
    pub header: BlockId,

    /// Back edge sources (blocks that jump back to the header).
    pub back_edges: Vec<BlockId>,

    /// All blocks in the loop body (header included).
    pub blocks: Vec<BlockId>,

    /// Membership set over block handles.
    body: DenseSet<BlockId>,

    /// Parent loop (if nested).
    pub parent: Option<usize>,

    /// Child loops.
    pub children: Vec<usize>,

    /// Loop depth (1 = outermost).
    pub depth: u32,
}

impl Loop {
    /// Check if the loop contains a block.
    #[inline]
    pub fn contains(&self, block: BlockId) -> bool {
        self.body.contains(block)
    }

    /// The unique latch, if the loop has exactly one back edge.
    pub fn latch(&self) -> Option<BlockId> {
        match self.back_edges.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }
}

// =============================================================================
// Loop Forest
// =============================================================================

/// All natural loops of a function.
#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: Vec<Loop>,
    header_to_loop: FxHashMap<BlockId, usize>,
    block_to_loop: FxHashMap<BlockId, usize>,
    /// A back edge whose target does not dominate its source was found.
    irreducible: bool,
}

impl LoopForest {
    /// Compute the loop forest.
    pub fn compute(func: &Function, dom: &DominatorTree) -> Self {
        let mut forest = LoopForest::default();

        let mut rpo_index: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, &block) in dom.rpo.iter().enumerate() {
            rpo_index.insert(block, i);
        }

        // Retreating edges: target dominates source -> back edge of a natural
        // loop; otherwise the CFG is irreducible.
        for &block in &dom.rpo {
            for &succ in func.succs(block).iter() {
                if dom.dominates(succ, block) {
                    forest.add_loop(succ, block, func);
                } else if let (Some(si), Some(bi)) = (rpo_index.get(&succ), rpo_index.get(&block)) {
                    if si <= bi {
                        forest.irreducible = true;
                    }
                }
            }
        }

        forest.compute_nesting();
        forest.assign_innermost();
        forest
    }

    fn add_loop(&mut self, header: BlockId, back_edge: BlockId, func: &Function) {
        if let Some(&idx) = self.header_to_loop.get(&header) {
            if !self.loops[idx].back_edges.contains(&back_edge) {
                self.loops[idx].back_edges.push(back_edge);
                // Grow the body with the new back edge's reaching set.
                let mut body = std::mem::take(&mut self.loops[idx].body);
                collect_body(func, header, back_edge, &mut body);
                self.loops[idx].blocks = body.iter().collect();
                self.loops[idx].body = body;
            }
            return;
        }

        let mut body = DenseSet::with_capacity(func.block_count());
        collect_body(func, header, back_edge, &mut body);

        let blocks = body.iter().collect();
        let idx = self.loops.len();
        self.loops.push(Loop {
            header,
            back_edges: vec![back_edge],
            blocks,
            body,
            parent: None,
            children: Vec::new(),
            depth: 1,
        });
        self.header_to_loop.insert(header, idx);
    }

    /// Compute parent/child links and depths.
    fn compute_nesting(&mut self) {
        let n = self.loops.len();
        for i in 0..n {
            let header = self.loops[i].header;
            let mut smallest: Option<usize> = None;
            let mut smallest_size = usize::MAX;
            for j in 0..n {
                if i != j && self.loops[j].contains(header) {
                    let size = self.loops[j].blocks.len();
                    if size < smallest_size {
                        smallest_size = size;
                        smallest = Some(j);
                    }
                }
            }
            if let Some(parent) = smallest {
                self.loops[i].parent = Some(parent);
                self.loops[parent].children.push(i);
            }
        }
        for i in 0..n {
            let mut depth = 1;
            let mut current = self.loops[i].parent;
            while let Some(parent) = current {
                depth += 1;
                current = self.loops[parent].parent;
            }
            self.loops[i].depth = depth;
        }
    }

    /// Map each block to its innermost containing loop.
    fn assign_innermost(&mut self) {
        for idx in self.innermost_first() {
            for &block in &self.loops[idx].blocks {
                self.block_to_loop.entry(block).or_insert(idx);
            }
        }
    }

    /// All loops.
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Get a loop by index.
    pub fn get(&self, idx: usize) -> &Loop {
        &self.loops[idx]
    }

    /// Number of loops.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Check if the function is loop-free.
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Whether an irreducible retreating edge was seen.
    pub fn is_irreducible(&self) -> bool {
        self.irreducible
    }

    /// The innermost loop containing a block.
    pub fn loop_of(&self, block: BlockId) -> Option<usize> {
        self.block_to_loop.get(&block).copied()
    }

    /// The loop headed by `block`, if any.
    pub fn loop_with_header(&self, block: BlockId) -> Option<usize> {
        self.header_to_loop.get(&block).copied()
    }

    /// Loop indices ordered innermost-first (children before parents).
    pub fn innermost_first(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.loops.len()).collect();
        order.sort_by(|&a, &b| self.loops[b].depth.cmp(&self.loops[a].depth));
        order
    }

    /// Top-level loops (depth 1).
    pub fn top_level(&self) -> Vec<usize> {
        (0..self.loops.len())
            .filter(|&i| self.loops[i].parent.is_none())
            .collect()
    }

    /// The pre-header: the unique predecessor of the header outside the loop.
    pub fn preheader(&self, func: &Function, idx: usize) -> Option<BlockId> {
        let lp = &self.loops[idx];
        let mut outside = func
            .preds(lp.header)
            .iter()
            .copied()
            .filter(|&p| !lp.contains(p));
        let pre = outside.next()?;
        outside.next().is_none().then_some(pre)
    }

    /// Edges leaving the loop, as (exiting block, exit block) pairs.
    pub fn exit_edges(&self, func: &Function, idx: usize) -> Vec<(BlockId, BlockId)> {
        let lp = &self.loops[idx];
        let mut edges = Vec::new();
        for &block in &lp.blocks {
            for &succ in func.succs(block).iter() {
                if !lp.contains(succ) {
                    edges.push((block, succ));
                }
            }
        }
        edges
    }

    /// Blocks outside the loop targeted by exit edges (deduplicated).
    pub fn exit_blocks(&self, func: &Function, idx: usize) -> Vec<BlockId> {
        let mut exits = Vec::new();
        for (_, exit) in self.exit_edges(func, idx) {
            if !exits.contains(&exit) {
                exits.push(exit);
            }
        }
        exits
    }
}

/// Reverse walk from the back-edge source, stopping at the header.
fn collect_body(func: &Function, header: BlockId, back_edge: BlockId, body: &mut DenseSet<BlockId>) {
    body.insert(header);
    let mut worklist = VecDeque::new();
    worklist.push_back(back_edge);
    while let Some(block) = worklist.pop_front() {
        if body.insert(block) {
            for &pred in func.preds(block) {
                worklist.push_back(pred);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::func::Type;

    fn simple_loop() -> (Function, BlockId, BlockId, BlockId, BlockId) {
        // entry -> header; header -> (body | exit); body -> header
        let mut f = Function::new("loop");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let body = f.create_block("body");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let cond = f.add_arg(Type::Bool);
        f.set_jump(entry, header);
        f.set_branch(header, cond, body, exit);
        f.set_jump(body, header);
        f.set_ret(exit, None);
        (f, entry, header, body, exit)
    }

    #[test]
    fn test_simple_loop_detected() {
        let (f, entry, header, body, exit) = simple_loop();
        let dt = DominatorTree::build(&f);
        let forest = LoopForest::compute(&f, &dt);

        assert_eq!(forest.len(), 1);
        let lp = forest.get(0);
        assert_eq!(lp.header, header);
        assert_eq!(lp.latch(), Some(body));
        assert!(lp.contains(header));
        assert!(lp.contains(body));
        assert!(!lp.contains(entry));
        assert!(!lp.contains(exit));
        assert_eq!(forest.preheader(&f, 0), Some(entry));
        assert_eq!(forest.exit_edges(&f, 0), vec![(header, exit)]);
    }

    #[test]
    fn test_nested_loops() {
        // entry -> oh; oh -> (ih | exit); ih -> (ibody | olatch);
        // ibody -> ih; olatch -> oh
        let mut f = Function::new("nested");
        let entry = f.create_block("entry");
        let oh = f.create_block("outer_header");
        let ih = f.create_block("inner_header");
        let ibody = f.create_block("inner_body");
        let olatch = f.create_block("outer_latch");
        let exit = f.create_block("exit");
        f.set_entry(entry);
        let c1 = f.add_arg(Type::Bool);
        let c2 = f.add_arg(Type::Bool);
        f.set_jump(entry, oh);
        f.set_branch(oh, c1, ih, exit);
        f.set_branch(ih, c2, ibody, olatch);
        f.set_jump(ibody, ih);
        f.set_jump(olatch, oh);
        f.set_ret(exit, None);

        let dt = DominatorTree::build(&f);
        let forest = LoopForest::compute(&f, &dt);
        assert_eq!(forest.len(), 2);

        let outer = forest.loop_with_header(oh).unwrap();
        let inner = forest.loop_with_header(ih).unwrap();
        assert_eq!(forest.get(inner).parent, Some(outer));
        assert_eq!(forest.get(outer).depth, 1);
        assert_eq!(forest.get(inner).depth, 2);

        // Innermost-first order processes the inner loop before the outer.
        let order = forest.innermost_first();
        let inner_pos = order.iter().position(|&i| i == inner).unwrap();
        let outer_pos = order.iter().position(|&i| i == outer).unwrap();
        assert!(inner_pos < outer_pos);

        // The inner body maps to the inner loop.
        assert_eq!(forest.loop_of(ibody), Some(inner));
        assert_eq!(forest.loop_of(olatch), Some(outer));
    }

    #[test]
    fn test_two_exits() {
        // header -> (b1 | exit1); b1 -> (latch | exit2); latch -> header
        let mut f = Function::new("two_exits");
        let entry = f.create_block("entry");
        let header = f.create_block("header");
        let b1 = f.create_block("b1");
        let latch = f.create_block("latch");
        let exit1 = f.create_block("exit1");
        let exit2 = f.create_block("exit2");
        f.set_entry(entry);
        let c1 = f.add_arg(Type::Bool);
        let c2 = f.add_arg(Type::Bool);
        f.set_jump(entry, header);
        f.set_branch(header, c1, b1, exit1);
        f.set_branch(b1, c2, latch, exit2);
        f.set_jump(latch, header);
        f.set_ret(exit1, None);
        f.set_ret(exit2, None);

        let dt = DominatorTree::build(&f);
        let forest = LoopForest::compute(&f, &dt);
        assert_eq!(forest.len(), 1);

        let mut edges = forest.exit_edges(&f, 0);
        edges.sort();
        let mut expected = vec![(header, exit1), (b1, exit2)];
        expected.sort();
        assert_eq!(edges, expected);
        assert_eq!(forest.exit_blocks(&f, 0).len(), 2);
    }
}
