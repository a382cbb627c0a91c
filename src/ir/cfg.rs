//! Dominance information.
//!
//! Both trees are produced by the same machinery: the walked subgraph is
//! renumbered in traversal order, so that every (post)dominator carries a
//! lower number than the blocks it covers, and the immediate-dominator
//! links are then solved by iterated intersection entirely in that number
//! space. The forward walk is rooted at the function entry; the backward
//! walk at the return blocks, under a virtual exit that post-dominates
//! everything.
//!
//! Transforms either patch a dominator link in place (`set_idom`) for small
//! local edits or mark the tree dirty; a dirty tree must be rebuilt before
//! the next analysis consumes it. The link queries stay total even while
//! local patches temporarily break the numbering discipline (walks carry
//! fuel instead of trusting monotone numbers).

use super::entity::{BlockId, DenseSet};
use super::func::Function;

use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Number-space solver
// =============================================================================

/// Link of a position that has not been reached yet.
const UNSOLVED: u32 = u32::MAX;
/// Link of a position whose dominator is the virtual root.
const VIRTUAL: u32 = u32::MAX - 1;

/// Traversal numbering of the walked subgraph.
struct Numbering {
    /// Blocks in traversal order (dominators before dominated).
    order: Vec<BlockId>,
    /// Inverse mapping.
    position: FxHashMap<BlockId, u32>,
}

/// Depth-first numbering from `seeds`, walking successors (forward) or
/// predecessors (backward). Reversed postorder, so ancestors in the result
/// always carry lower numbers than the blocks they reach.
fn number_traversal(func: &Function, seeds: &[BlockId], forward: bool) -> Numbering {
    let mut visited: DenseSet<BlockId> = DenseSet::with_capacity(func.block_count());
    let mut postorder = Vec::new();

    let mut stack: Vec<(BlockId, bool)> = seeds.iter().rev().map(|&b| (b, false)).collect();
    while let Some((block, expanded)) = stack.pop() {
        if expanded {
            postorder.push(block);
            continue;
        }
        if !visited.insert(block) {
            continue;
        }
        stack.push((block, true));
        let neighbors: Vec<BlockId> = if forward {
            func.succs(block).to_vec()
        } else {
            func.preds(block).to_vec()
        };
        for &next in neighbors.iter().rev() {
            if !visited.contains(next) {
                stack.push((next, false));
            }
        }
    }

    postorder.reverse();
    let mut position = FxHashMap::default();
    for (i, &block) in postorder.iter().enumerate() {
        position.insert(block, i as u32);
    }
    Numbering {
        order: postorder,
        position,
    }
}

/// Solve the immediate-dominator links by iterated intersection.
///
/// `incoming[p]` lists the numbered positions whose edges enter position
/// `p`; roots come pre-seeded in `link` (the entry as a self-link, exit
/// blocks as `VIRTUAL`) and carry no incoming entries.
fn solve_links(incoming: &[Vec<u32>], link: &mut [u32]) {
    let mut settled = false;
    while !settled {
        settled = true;
        for p in 0..incoming.len() {
            let mut joined = UNSOLVED;
            for &q in &incoming[p] {
                if link[q as usize] == UNSOLVED {
                    continue;
                }
                joined = if joined == UNSOLVED {
                    q
                } else {
                    join_positions(link, joined, q)
                };
            }
            if joined != UNSOLVED && link[p] != joined {
                link[p] = joined;
                settled = false;
            }
        }
    }
}

/// Nearest common ancestor of two positions along the links. Reaching the
/// virtual root on either side absorbs the join.
fn join_positions(link: &[u32], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        if a == VIRTUAL || b == VIRTUAL {
            return VIRTUAL;
        }
        if a > b {
            a = link[a as usize];
        } else {
            b = link[b as usize];
        }
    }
    a
}

// =============================================================================
// Dominator Tree
// =============================================================================

/// Dominator tree over the blocks reachable from the function entry.
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Reverse postorder of reachable blocks.
    pub rpo: Vec<BlockId>,

    position: FxHashMap<BlockId, u32>,
    link: Vec<u32>,

    /// Dominance frontier, kept sparse: only blocks that actually front a
    /// merge have an entry.
    frontier: FxHashMap<BlockId, Vec<BlockId>>,

    entry: BlockId,
    dirty: bool,
}

impl DominatorTree {
    /// Build the dominator tree for `func`.
    pub fn build(func: &Function) -> Self {
        let entry = func.entry();
        let Numbering { order, position } = number_traversal(func, &[entry], true);

        let incoming: Vec<Vec<u32>> = order
            .iter()
            .map(|&block| {
                func.preds(block)
                    .iter()
                    .filter_map(|p| position.get(p).copied())
                    .collect()
            })
            .collect();

        let mut link = vec![UNSOLVED; order.len()];
        if !order.is_empty() {
            link[0] = 0; // the entry roots itself
        }
        solve_links(&incoming, &mut link);

        let mut dom = DominatorTree {
            rpo: order,
            position,
            link,
            frontier: FxHashMap::default(),
            entry,
            dirty: false,
        };
        dom.collect_frontier(func);
        dom
    }

    /// The dominance frontier: for every merge block, charge it to each
    /// block on the predecessor chains up to (but excluding) the merge's
    /// immediate dominator.
    fn collect_frontier(&mut self, func: &Function) {
        for &join in &self.rpo.clone() {
            let preds: Vec<BlockId> = func
                .preds(join)
                .iter()
                .copied()
                .filter(|p| self.position.contains_key(p))
                .collect();
            if preds.len() < 2 {
                continue;
            }
            let stop = self.idom(join);
            for &pred in &preds {
                let mut walker = Some(pred);
                let mut fuel = self.link.len() + 1;
                while let Some(block) = walker {
                    if Some(block) == stop || fuel == 0 {
                        break;
                    }
                    fuel -= 1;
                    let edge = self.frontier.entry(block).or_default();
                    if !edge.contains(&join) {
                        edge.push(join);
                    }
                    walker = self.idom(block);
                }
            }
        }
    }

    /// Get the immediate dominator (None for the entry).
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        let &p = self.position.get(&block)?;
        let up = self.link[p as usize];
        if up == UNSOLVED || up == VIRTUAL || up == p {
            return None;
        }
        Some(self.rpo[up as usize])
    }

    /// Get the dominance frontier of a block.
    pub fn frontier(&self, block: BlockId) -> &[BlockId] {
        self.frontier
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Check if `a` dominates `b`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut fuel = self.link.len() + 1;
        let mut walk = b;
        while let Some(up) = self.idom(walk) {
            if up == a {
                return true;
            }
            walk = up;
            fuel -= 1;
            if fuel == 0 {
                break;
            }
        }
        false
    }

    /// Check if `a` strictly dominates `b`.
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Nearest common dominator of two blocks.
    pub fn nearest_common_dominator(&self, a: BlockId, b: BlockId) -> BlockId {
        let mut ancestors = FxHashSet::default();
        let mut walk = a;
        ancestors.insert(walk);
        while let Some(up) = self.idom(walk) {
            if !ancestors.insert(up) {
                break;
            }
            walk = up;
        }

        let mut fuel = self.link.len() + 1;
        let mut walk = b;
        loop {
            if ancestors.contains(&walk) {
                return walk;
            }
            match self.idom(walk) {
                Some(up) if fuel > 0 => {
                    fuel -= 1;
                    walk = up;
                }
                _ => return self.entry,
            }
        }
    }

    /// Patch the immediate dominator of a block after a local CFG edit.
    ///
    /// The caller is responsible for the new link being consistent with the
    /// rewritten CFG; large-scale edits should `mark_dirty` instead.
    pub fn set_idom(&mut self, block: BlockId, idom: BlockId) {
        if let (Some(&bp), Some(&ip)) = (self.position.get(&block), self.position.get(&idom)) {
            self.link[bp as usize] = ip;
        }
    }

    /// Mark the tree as stale after a structural rewrite.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Check whether the tree needs a rebuild.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The function entry this tree was built for.
    pub fn entry(&self) -> BlockId {
        self.entry
    }
}

// =============================================================================
// Post-Dominator Tree
// =============================================================================

/// Post-dominator tree, rooted at a virtual exit above all return blocks.
#[derive(Debug, Clone)]
pub struct PostDominatorTree {
    order: Vec<BlockId>,
    position: FxHashMap<BlockId, u32>,
    link: Vec<u32>,

    /// Control dependence: branch block -> blocks control-dependent on it.
    control_deps: FxHashMap<BlockId, Vec<BlockId>>,
}

impl PostDominatorTree {
    /// Build the post-dominator tree for `func`.
    pub fn build(func: &Function) -> Self {
        let exits: Vec<BlockId> = func
            .blocks()
            .filter(|&b| func.succs(b).is_empty())
            .collect();
        let Numbering { order, position } = number_traversal(func, &exits, false);

        // Incoming edges of the reversed graph are forward successors.
        let incoming: Vec<Vec<u32>> = order
            .iter()
            .map(|&block| {
                func.succs(block)
                    .iter()
                    .filter_map(|s| position.get(s).copied())
                    .collect()
            })
            .collect();

        let mut link = vec![UNSOLVED; order.len()];
        for exit in &exits {
            if let Some(&p) = position.get(exit) {
                link[p as usize] = VIRTUAL;
            }
        }
        solve_links(&incoming, &mut link);

        let mut pdt = PostDominatorTree {
            order,
            position,
            link,
            control_deps: FxHashMap::default(),
        };
        pdt.collect_control_deps(func);
        pdt
    }

    /// Control dependence via the post-dominance frontier: for every edge
    /// `b -> s` of a multi-successor block, the blocks from `s` up to (but
    /// excluding) `ipdom(b)` are control-dependent on `b`.
    fn collect_control_deps(&mut self, func: &Function) {
        for block in func.blocks() {
            let succs = func.succs(block);
            if succs.len() < 2 {
                continue;
            }
            let stop = self.ipdom(block);
            for &succ in succs.iter() {
                let mut walker = Some(succ);
                let mut fuel = self.link.len() + 1;
                while let Some(cur) = walker {
                    if Some(cur) == stop || fuel == 0 {
                        break;
                    }
                    fuel -= 1;
                    let deps = self.control_deps.entry(block).or_default();
                    if !deps.contains(&cur) {
                        deps.push(cur);
                    }
                    walker = self.ipdom(cur);
                }
            }
        }
    }

    /// Immediate post-dominator (None = virtual exit).
    pub fn ipdom(&self, block: BlockId) -> Option<BlockId> {
        let &p = self.position.get(&block)?;
        let up = self.link[p as usize];
        if up == UNSOLVED || up == VIRTUAL || up == p {
            return None;
        }
        Some(self.order[up as usize])
    }

    /// Check if `a` post-dominates `b`.
    pub fn post_dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        let mut fuel = self.link.len() + 1;
        let mut walk = b;
        while let Some(up) = self.ipdom(walk) {
            if up == a {
                return true;
            }
            walk = up;
            fuel -= 1;
            if fuel == 0 {
                break;
            }
        }
        false
    }

    /// Blocks control-dependent on the branch in `block`.
    pub fn control_dependent_on(&self, block: BlockId) -> &[BlockId] {
        self.control_deps
            .get(&block)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

// =============================================================================
// Tests
// =============================================================================
