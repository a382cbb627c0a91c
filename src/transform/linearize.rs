//! Control-flow linearization.
//!
//! Eliminates divergent non-loop branches by scheduling the region's blocks
//! in a total topological order and merging control-equivalent paths:
//!
//! 1. **Block index**: a topological order consistent with the loop nest
//!    (each loop's blocks contiguous, header first, latch last; verified)
//! 2. **Relay nodes**: synthetic empty blocks that defer the execution of a
//!    target until all its logical predecessors have been emitted, threaded
//!    as a chain sorted by topological index
//! 3. **Phi folding**: phis whose predecessor set changed fold into select
//!    cascades over the incoming edge masks
//! 4. **Dominator repair**: an emitted block's immediate dominator becomes
//!    the nearest common dominator of its rewired predecessors; the tree is
//!    rebuilt wholesale at the end
//! 5. **Repair phis**: placeholder phis registered during earlier transforms
//!    are resolved by promoting the preferred definition down the
//!    topological span
//! 6. **Cleanup**: conditional branches whose successors coincide collapse
//!    to unconditional jumps
//!
//! Divergent loops must have been regularized before this pass runs; a
//! still-divergent loop is an invariant violation.

use super::masks::MaskAssignment;
use crate::error::{VectorizeError, VectorizeResult};
use crate::ir::{
    BlockId, DominatorTree, Function, InsertionBuilder, LoopForest, Opcode, ValueId,
};
use crate::vecinfo::VectorizationInfo;
use crate::shape::VectorShape;

use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from linearization.
#[derive(Debug, Clone, Default)]
pub struct LinearizeStats {
    /// Blocks scheduled.
    pub blocks_processed: usize,
    /// Divergent branches folded away.
    pub branches_folded: usize,
    /// Phis folded into select cascades.
    pub phis_folded: usize,
    /// Relay blocks created.
    pub relays_created: usize,
    /// Repair phis resolved.
    pub repair_phis_resolved: usize,
    /// Redundant conditional branches simplified in cleanup.
    pub branches_simplified: usize,
}

// =============================================================================
// Entry point
// =============================================================================

/// Linearize the divergent acyclic control flow of the region.
pub fn linearize(
    vi: &mut VectorizationInfo,
    func: &mut Function,
    dom: &mut DominatorTree,
    loops: &LoopForest,
    masks: &MaskAssignment,
) -> VectorizeResult<LinearizeStats> {
    let mut lin = Linearizer {
        vi,
        func,
        dom,
        loops,
        masks,
        blocks: Vec::new(),
        block_index: FxHashMap::default(),
        relays: FxHashMap::default(),
        stats: LinearizeStats::default(),
    };
    lin.run()?;
    let stats = lin.stats;

    // The local idom patches kept mid-pass queries sane; finish with a full
    // rebuild so downstream consumers see an exact tree.
    *dom = DominatorTree::build(func);
    Ok(stats)
}

// =============================================================================
// Relay chains
// =============================================================================

/// A deferred target: branches that must eventually reach the target block
/// point at `block` until the target is emitted. `next` threads the chain of
/// further mandatory targets, ordered by topological index.
#[derive(Debug, Clone)]
struct RelayNode {
    block: BlockId,
    next: Option<usize>,
}

// =============================================================================
// Linearizer
// =============================================================================

struct Linearizer<'a> {
    vi: &'a mut VectorizationInfo,
    func: &'a mut Function,
    dom: &'a mut DominatorTree,
    loops: &'a LoopForest,
    masks: &'a MaskAssignment,

    /// Topological block order.
    blocks: Vec<BlockId>,
    block_index: FxHashMap<BlockId, usize>,

    /// Pending relays by target index.
    relays: FxHashMap<usize, RelayNode>,

    stats: LinearizeStats,
}

impl<'a> Linearizer<'a> {
    fn run(&mut self) -> VectorizeResult<()> {
        self.build_block_index()?;
        self.verify_block_index()?;

        if self.blocks.len() <= 1 {
            return Ok(());
        }

        log::debug!("linearizing {} blocks", self.blocks.len());
        self.process_range(0, self.blocks.len(), None)?;
        self.cleanup();
        self.resolve_repair_phis()?;
        self.verify()
    }

    // =========================================================================
    // Block index
    // =========================================================================

    /// Build the topological order: Kahn's algorithm per loop level,
    /// treating child loops as single units, with the header emitted first
    /// and the latch held back until last.
    fn build_block_index(&mut self) -> VectorizeResult<()> {
        self.schedule_level(None)?;
        Ok(())
    }

    fn assign_index(&mut self, block: BlockId) {
        let id = self.blocks.len();
        self.block_index.insert(block, id);
        self.blocks.push(block);
    }

    /// Schedule the blocks directly at one loop level.
    fn schedule_level(&mut self, loop_idx: Option<usize>) -> VectorizeResult<()> {
        // Units at this level: plain blocks plus immediate child loops.
        let level_blocks: Vec<BlockId> = match loop_idx {
            Some(idx) => self.loops.get(idx).blocks.clone(),
            None => self
                .dom
                .rpo
                .iter()
                .copied()
                .filter(|&b| self.vi.in_region(b))
                .collect(),
        };

        let header = loop_idx.map(|idx| self.loops.get(idx).header);
        let latch = loop_idx.and_then(|idx| self.loops.get(idx).latch());

        // Map each block to its unit representative: itself, or the header
        // of the outermost child loop containing it.
        let unit_of = |lin: &Self, block: BlockId| -> Option<BlockId> {
            let mut current = lin.loops.loop_of(block);
            let mut repr = block;
            while let Some(idx) = current {
                if current == loop_idx {
                    break;
                }
                if lin.loops.get(idx).parent == loop_idx {
                    repr = lin.loops.get(idx).header;
                    break;
                }
                repr = lin.loops.get(idx).header;
                current = lin.loops.get(idx).parent;
            }
            Some(repr)
        };

        let mut members: FxHashSet<BlockId> = FxHashSet::default();
        for &b in &level_blocks {
            if let Some(u) = unit_of(self, b) {
                members.insert(u);
            }
        }

        // In-degrees over unit edges, ignoring the back edge to this level's
        // header.
        let mut indegree: FxHashMap<BlockId, usize> = members.iter().map(|&u| (u, 0)).collect();
        let mut out_edges: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for &b in &level_blocks {
            let from_unit = unit_of(self, b).unwrap();
            for succ in self.func.succs(b) {
                if Some(succ) == header {
                    continue; // back edge of the current loop
                }
                if !level_blocks.contains(&succ) {
                    continue; // leaves this level; handled by the parent
                }
                let to_unit = unit_of(self, succ).unwrap();
                if to_unit == from_unit {
                    continue;
                }
                // Skip edges into a child unit's interior state: only the
                // unit representative matters, and back edges inside the
                // child never reach here (the child owns them).
                out_edges.entry(from_unit).or_default().push(to_unit);
                *indegree.entry(to_unit).or_default() += 1;
            }
        }

        let mut ready: Vec<BlockId> = Vec::new();
        if let Some(h) = header {
            ready.push(h);
        } else {
            for &u in &members {
                if indegree[&u] == 0 {
                    ready.push(u);
                }
            }
        }

        let mut emitted = 0usize;
        let total = members.len();
        let mut latch_held: Option<BlockId> = None;

        while emitted < total {
            let unit = match ready.pop() {
                Some(u) => u,
                None => match latch_held.take() {
                    Some(l) => l,
                    None => {
                        return Err(VectorizeError::capability(
                            "region contains an irreducible or unschedulable subgraph",
                        ))
                    }
                },
            };

            // Hold the latch back until every other unit is out.
            if Some(unit) == latch && emitted + 1 < total {
                if ready.is_empty() {
                    return Err(VectorizeError::capability(
                        "loop blocks cannot be scheduled before the latch",
                    ));
                }
                latch_held = Some(unit);
                continue;
            }

            emitted += 1;
            if self.loops.loop_with_header(unit).is_some()
                && self.loops.loop_of(unit) != loop_idx
            {
                // A child loop unit: schedule its body recursively.
                let child = self
                    .loops
                    .loop_with_header(unit)
                    .expect("unit is a child header");
                self.schedule_level(Some(child))?;
            } else {
                self.assign_index(unit);
            }

            for succ in out_edges.remove(&unit).unwrap_or_default() {
                let d = indegree.get_mut(&succ).unwrap();
                *d -= 1;
                if *d == 0 {
                    ready.push(succ);
                }
            }

            if ready.is_empty() {
                if let Some(l) = latch_held.take() {
                    ready.push(l);
                }
            }
        }
        Ok(())
    }

    /// Every loop must occupy a contiguous index range with the header first
    /// and the latch last.
    fn verify_block_index(&self) -> VectorizeResult<()> {
        for idx in 0..self.loops.len() {
            let lp = self.loops.get(idx);
            let mut start = usize::MAX;
            let mut end = 0usize;
            for &b in &lp.blocks {
                let Some(&i) = self.block_index.get(&b) else {
                    continue;
                };
                start = start.min(i);
                end = end.max(i);
            }
            if start > end {
                continue; // loop outside the region
            }
            for i in start..=end {
                if !lp.contains(self.blocks[i]) {
                    return Err(VectorizeError::invariant(format!(
                        "non-loop block {} inside the index range of loop {}",
                        self.func.block_name(self.blocks[i]),
                        self.func.block_name(lp.header)
                    )));
                }
            }
            if self.blocks[start] != lp.header {
                return Err(VectorizeError::invariant("loop header is not scheduled first"));
            }
            if let Some(latch) = lp.latch() {
                if self.blocks[end] != latch {
                    return Err(VectorizeError::invariant("loop latch is not scheduled last"));
                }
            }
        }
        Ok(())
    }

    fn index_of(&self, block: BlockId) -> VectorizeResult<usize> {
        self.block_index.get(&block).copied().ok_or_else(|| {
            VectorizeError::invariant(format!(
                "block {} outside the region appears in the schedule",
                self.func.block_name(block)
            ))
        })
    }

    // =========================================================================
    // Folding predicates
    // =========================================================================

    /// A terminator must be folded when it is a conditional branch with a
    /// non-uniform shape and genuinely distinct targets.
    fn needs_folding(&self, term: ValueId) -> bool {
        let Some(inst) = self.func.inst(term) else {
            return false;
        };
        if inst.op != Opcode::Branch {
            return false;
        }
        if inst.blocks[0] == inst.blocks[1] {
            return false;
        }
        let shape = self.vi.shape(term);
        shape.is_defined() && !shape.is_uniform()
    }

    /// A phi must be folded when its incoming blocks no longer mirror the
    /// block's predecessors (an edge was relayed away or a new one arrived).
    fn phi_needs_folding(&self, phi: ValueId, block: BlockId) -> bool {
        let incoming = self.func.phi_incoming(phi);
        let preds: FxHashSet<BlockId> = self.func.preds(block).iter().copied().collect();
        let listed: FxHashSet<BlockId> = incoming.iter().map(|&(_, b)| b).collect();
        preds.iter().any(|p| !listed.contains(p)) || listed.iter().any(|b| !preds.contains(b))
    }

    // =========================================================================
    // Relays
    // =========================================================================

    /// Get or create the relay node for a target index.
    fn request_relay(&mut self, id: usize) -> BlockId {
        if let Some(node) = self.relays.get(&id) {
            return node.block;
        }
        let name = format!("relay.{}", self.func.block_name(self.blocks[id]));
        let block = self.func.create_block(name);
        self.vi.add_to_region(block);
        self.stats.relays_created += 1;
        self.relays.insert(id, RelayNode { block, next: None });
        block
    }

    /// Merge two sorted relay chains, returning the merged head.
    fn merge_chains(&mut self, a: Option<usize>, b: Option<usize>) -> Option<usize> {
        match (a, b) {
            (None, x) | (x, None) => x,
            (Some(x), Some(y)) if x == y => Some(x),
            (Some(x), Some(y)) => {
                let (head, other) = if x < y { (x, y) } else { (y, x) };
                let head_next = self.relays[&head].next;
                let merged = self.merge_chains(head_next, Some(other));
                self.relays.get_mut(&head).unwrap().next = merged;
                Some(head)
            }
        }
    }

    /// Add `target` to the chain and return the merged chain's head (the
    /// relay the branch should enter through).
    fn add_target_to_relay(&mut self, chain: Option<usize>, target: usize) -> usize {
        self.request_relay(target);
        self.merge_chains(chain, Some(target))
            .expect("merged chain cannot be empty")
    }

    /// Consume the relay for an emitted target, returning its synthetic
    /// block and the remaining chain.
    fn advance_schedule_head(&mut self, target: usize) -> (Option<BlockId>, Option<usize>) {
        match self.relays.remove(&target) {
            Some(node) => (Some(node.block), node.next),
            None => (None, None),
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Forward all branches into the relay of `target` to the actual block,
    /// repair its dominator link, and free the relay. Returns the chain of
    /// still-mandatory targets.
    fn emit_block(&mut self, target_id: usize) -> Option<usize> {
        let target = self.blocks[target_id];
        log::trace!("emit {}", self.func.block_name(target));

        let (relay_block, advanced) = self.advance_schedule_head(target_id);
        let Some(relay_block) = relay_block else {
            return advanced;
        };

        let relay_preds: Vec<BlockId> = self.func.preds(relay_block).to_vec();
        for pred in relay_preds {
            self.func.replace_successor(pred, relay_block, target);
        }

        // New immediate dominator: nearest common dominator of the rewired
        // predecessor set.
        let preds: Vec<BlockId> = self.func.preds(target).to_vec();
        if let Some((&first, rest)) = preds.split_first() {
            let mut common = first;
            for &p in rest {
                common = self.dom.nearest_common_dominator(common, p);
            }
            self.dom.set_idom(target, common);
        }

        // Instructions stranded on the relay move to the front of the target.
        for inst in self.func.block_insts(relay_block).to_vec() {
            self.func.move_to_block_front(inst, target);
        }
        self.func.erase_block(relay_block);

        advanced
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn process_range(
        &mut self,
        start: usize,
        end: usize,
        parent_loop: Option<usize>,
    ) -> VectorizeResult<usize> {
        let mut i = start;
        while i < end {
            i = self.process_block(i, parent_loop)?;
        }
        Ok(end)
    }

    fn process_block(&mut self, head_id: usize, parent_loop: Option<usize>) -> VectorizeResult<usize> {
        let head = self.blocks[head_id];
        let lp = self.loops.loop_of(head);
        if lp != parent_loop {
            let entered = self.entered_child(head, parent_loop)?;
            return self.process_loop(head_id, entered);
        }

        self.stats.blocks_processed += 1;
        let advanced = self.emit_block(head_id);
        self.fold_phis(head);
        self.process_branch(head, advanced)?;
        Ok(head_id + 1)
    }

    /// The immediate child loop entered at `head` (which must be a header).
    fn entered_child(&self, head: BlockId, parent_loop: Option<usize>) -> VectorizeResult<usize> {
        let mut idx = self.loops.loop_of(head).ok_or_else(|| {
            VectorizeError::invariant("left the parent loop without entering a child")
        })?;
        while self.loops.get(idx).parent != parent_loop {
            idx = self.loops.get(idx).parent.ok_or_else(|| {
                VectorizeError::invariant("loop nest does not reach the parent level")
            })?;
        }
        if self.loops.get(idx).header != head {
            return Err(VectorizeError::invariant(
                "entered a loop somewhere other than its header",
            ));
        }
        Ok(idx)
    }

    fn process_loop(&mut self, head_id: usize, loop_idx: usize) -> VectorizeResult<usize> {
        let lp = self.loops.get(loop_idx);
        let header = lp.header;
        if self.vi.is_divergent_loop(header) {
            return Err(VectorizeError::invariant(format!(
                "loop {} is still divergent at linearization",
                self.func.block_name(header)
            )));
        }
        let latch = lp.latch().ok_or_else(|| {
            VectorizeError::capability(format!(
                "loop {} has multiple back edges",
                self.func.block_name(header)
            ))
        })?;
        let latch_id = self.index_of(latch)?;

        log::trace!(
            "process loop {} [{}..{}]",
            self.func.block_name(header),
            head_id,
            latch_id
        );

        // Emit the loop body (everything except the latch).
        self.process_range(head_id, latch_id, Some(loop_idx))?;

        // Emit the latch without descending into its successors: the back
        // edge must keep pointing at the header.
        let advanced = self.emit_block(latch_id);
        self.stats.blocks_processed += 1;
        let latch_block = self.blocks[latch_id];
        self.fold_phis(latch_block);

        // A regularized loop exits at the latch; thread that edge through
        // the pending chain so deferred targets stay mandatory. An exit
        // leaving the region keeps its direct edge.
        let succs = self.func.succs(latch_block);
        if succs.len() == 2 {
            let out = if succs[0] == header { succs[1] } else { succs[0] };
            if out != header {
                if let Some(&out_id) = self.block_index.get(&out) {
                    let rel = self.add_target_to_relay(advanced, out_id);
                    let rel_block = self.relays[&rel].block;
                    self.func.replace_successor(latch_block, out, rel_block);
                }
            }
        }

        // Emit the header again to pick up a relay created for it late, and
        // give its phis inputs for any new predecessors.
        self.emit_block(head_id);
        self.add_undef_inputs(header);

        Ok(latch_id + 1)
    }

    // =========================================================================
    // Branch processing
    // =========================================================================

    fn process_branch(&mut self, head: BlockId, exit_relay: Option<usize>) -> VectorizeResult<()> {
        let Some(term) = self.func.terminator(head) else {
            return Ok(());
        };
        let inst = self.func.inst(term).unwrap();
        let succs = inst.blocks.clone();

        if succs.is_empty() {
            return Ok(()); // control sink
        }

        // Unconditional (or degenerate two-way) branches extend the chain.
        if inst.op == Opcode::Jump || (succs.len() == 2 && succs[0] == succs[1]) {
            let next = succs[0];
            let Some(&next_id) = self.block_index.get(&next) else {
                return Ok(()); // leaves the region; edge stays
            };
            let rel = self.add_target_to_relay(exit_relay, next_id);
            let rel_block = self.relays[&rel].block;
            self.func.replace_successor(head, next, rel_block);
            return Ok(());
        }

        debug_assert_eq!(inst.op, Opcode::Branch);
        let must_fold = self.needs_folding(term);

        // Successors outside the region keep their edges; a divergent
        // branch is not allowed to leave the region.
        let id0 = self.block_index.get(&succs[0]).copied();
        let id1 = self.block_index.get(&succs[1]).copied();
        let (id0, id1) = match (id0, id1) {
            (Some(a), Some(b)) => (a, b),
            _ if must_fold => {
                return Err(VectorizeError::invariant(
                    "divergent branch leaves the region",
                ))
            }
            (Some(a), None) => {
                let rel = self.add_target_to_relay(exit_relay, a);
                let rel_block = self.relays[&rel].block;
                self.func.replace_successor(head, succs[0], rel_block);
                self.vi.set_shape(term, VectorShape::uni());
                return Ok(());
            }
            (None, Some(b)) => {
                let rel = self.add_target_to_relay(exit_relay, b);
                let rel_block = self.relays[&rel].block;
                self.func.replace_successor(head, succs[1], rel_block);
                self.vi.set_shape(term, VectorShape::uni());
                return Ok(());
            }
            (None, None) => return Ok(()),
        };
        let (first_block, first_id, second_block, second_id) = if id0 <= id1 {
            (succs[0], id0, succs[1], id1)
        } else {
            (succs[1], id1, succs[0], id0)
        };

        if must_fold {
            log::trace!(
                "folding branch of {}: {} then {}",
                self.func.block_name(head),
                self.func.block_name(first_block),
                self.func.block_name(second_block)
            );
            self.stats.branches_folded += 1;
        }

        // First successor; under folding the second becomes mandatory after
        // the first.
        let mut first_rel = self.add_target_to_relay(exit_relay, first_id);
        if must_fold {
            first_rel = self.add_target_to_relay(Some(first_rel), second_id);
            let rel_block = self.relays[&first_rel].block;
            self.func.replace_successor(head, second_block, rel_block);
        }
        let rel_block = self.relays[&first_rel].block;
        self.func.replace_successor(head, first_block, rel_block);

        // Dominator repair: without a pending relay for the second target,
        // every path to it now runs through the first.
        if self.dom.dominates(head, second_block) && !self.relays.contains_key(&second_id) {
            self.dom.set_idom(second_block, first_block);
        }

        // Second successor keeps its own relay when the branch survives.
        let second_rel = self.add_target_to_relay(exit_relay, second_id);
        if !must_fold {
            let rel_block = self.relays[&second_rel].block;
            self.func.replace_successor(head, second_block, rel_block);
        }

        self.vi.set_shape(term, VectorShape::uni());
        Ok(())
    }

    // =========================================================================
    // Phi folding
    // =========================================================================

    /// Fold the phis of a block into select cascades over the incoming edge
    /// masks, once relaying has changed its predecessor set.
    fn fold_phis(&mut self, block: BlockId) {
        let phis = self.func.block_phis(block);
        let Some(&first) = phis.first() else {
            return;
        };
        if !self.phi_needs_folding(first, block) {
            return;
        }
        log::trace!("folding phis in {}", self.func.block_name(block));

        for phi in phis {
            let incoming = self.func.phi_incoming(phi);
            if incoming.len() == 1 {
                // Loop-closed value: keep the single input, refresh its
                // edge label if the predecessor was rewired.
                let pred = match self.func.preds(block) {
                    [p] => Some(*p),
                    _ => None,
                };
                if let Some(pred) = pred {
                    if incoming[0].1 != pred {
                        self.func.set_phi_incoming_block(phi, 0, pred);
                    }
                }
                continue;
            }
            if self.vi.is_repair_phi(phi) {
                continue; // placeholder for deferred SSA repair
            }

            let phi_shape = self.vi.shape(phi);
            let mut value = incoming[0].0;
            for &(in_value, in_block) in &incoming[1..] {
                let edge_pred = self
                    .masks
                    .edge_mask(in_block, block)
                    .predicate()
                    .unwrap_or_else(|| self.func.const_bool(true));
                let mut builder = InsertionBuilder::at_front(self.func, block);
                value = builder.select(edge_pred, in_value, value);
                self.vi.set_shape(value, phi_shape);
            }

            self.func.replace_all_uses(phi, value);
            self.vi.drop_shape(phi);
            self.func.erase_inst(phi);
            self.stats.phis_folded += 1;
        }
    }

    /// Attach undef inputs to header phis for predecessors gained by the
    /// rewiring.
    fn add_undef_inputs(&mut self, block: BlockId) {
        for phi in self.func.block_phis(block) {
            let preds: Vec<BlockId> = self.func.preds(block).to_vec();
            for pred in preds {
                if self.func.phi_incoming_index(phi, pred).is_none() {
                    let ty = self.func.ty(phi);
                    let undef = self.func.undef(ty);
                    self.func.add_phi_incoming(phi, undef, pred);
                }
            }
        }
    }

    // =========================================================================
    // Repair phis
    // =========================================================================

    /// Resolve all registered repair phis: promote the preferred (first)
    /// definition across the topological span to the phi's block, then
    /// replace the placeholder.
    fn resolve_repair_phis(&mut self) -> VectorizeResult<()> {
        for phi in self.vi.take_repair_phis() {
            let incoming = self.func.phi_incoming(phi);
            if incoming.len() != 2 {
                return Err(VectorizeError::invariant(
                    "repair phi must have exactly an inner and an outer input",
                ));
            }
            let (inner_value, inner_block) = incoming[0];
            let (outer_value, _) = incoming[1];
            let dest = self.func.def_block(phi).unwrap();

            let start = self.index_of(inner_block)?;
            let dest_id = self.index_of(dest)?;
            log::trace!("resolving repair phi {phi} over [{start}..{dest_id}]");

            let promoted =
                self.promote_definition(inner_value, outer_value, start, dest_id)?;
            self.func.replace_all_uses(phi, promoted);
            self.vi.drop_shape(phi);
            self.func.erase_inst(phi);
            self.stats.repair_phis_resolved += 1;
        }
        Ok(())
    }

    /// Make `inst` (defined at block index `def_id`) available at block
    /// index `dest_id`, inserting intermediate phis where distinct reaching
    /// definitions meet; predecessors before the definition contribute
    /// `default_def`.
    fn promote_definition(
        &mut self,
        inst: ValueId,
        default_def: ValueId,
        def_id: usize,
        dest_id: usize,
    ) -> VectorizeResult<ValueId> {
        if def_id > dest_id {
            return Err(VectorizeError::invariant(
                "definition scheduled after its promotion target",
            ));
        }
        if def_id == dest_id {
            return Ok(inst);
        }
        let span = dest_id - def_id;
        let shape = self.vi.shape(inst);
        let ty = self.func.ty(inst);

        let mut defs: Vec<Option<ValueId>> = vec![None; span + 1];
        defs[0] = Some(inst);

        for i in 1..=span {
            let block_id = def_id + i;
            let block = self.blocks[block_id];

            let mut local_def: Option<ValueId> = None;
            let mut local_phi: Option<ValueId> = None;
            let preds: Vec<BlockId> = self.func.preds(block).to_vec();
            let mut passed: Vec<BlockId> = Vec::new();

            for &pred in &preds {
                let pred_id = match self.block_index.get(&pred) {
                    Some(&id) => id,
                    None => continue,
                };
                if pred_id >= block_id {
                    continue; // reaching back edge
                }
                let in_value = if pred_id < def_id {
                    default_def
                } else {
                    defs[pred_id - def_id].unwrap_or(default_def)
                };

                match (local_def, local_phi) {
                    (None, _) => local_def = Some(in_value),
                    (Some(d), None) if d == in_value => {}
                    (Some(d), None) => {
                        // Two distinct reaching defs meet here: introduce a
                        // phi and backfill the edges already walked.
                        let seed: Vec<(ValueId, BlockId)> =
                            passed.iter().map(|&p| (d, p)).collect();
                        let phi = self.func.insert_phi(block, ty, &seed);
                        self.vi.set_shape(phi, shape);
                        self.func.add_phi_incoming(phi, in_value, pred);
                        local_phi = Some(phi);
                        local_def = Some(phi);
                    }
                    (_, Some(phi)) => {
                        self.func.add_phi_incoming(phi, in_value, pred);
                    }
                }
                passed.push(pred);
            }

            defs[i] = local_def;
        }

        defs[span].ok_or_else(|| {
            VectorizeError::invariant("promotion span ends without a reaching definition")
        })
    }

    // =========================================================================
    // Cleanup and verification
    // =========================================================================

    /// Replace conditional branches whose successors coincide with jumps.
    fn cleanup(&mut self) {
        let blocks: Vec<BlockId> = self.func.blocks().collect();
        for block in blocks {
            let Some(term) = self.func.terminator(block) else {
                continue;
            };
            let inst = self.func.inst(term).unwrap();
            if inst.op != Opcode::Branch {
                continue;
            }
            if inst.blocks[0] != inst.blocks[1] {
                continue;
            }
            let target = inst.blocks[0];
            self.vi.drop_shape(term);
            let jump = self.func.set_jump(block, target);
            self.vi.set_shape(jump, VectorShape::uni());
            self.stats.branches_simplified += 1;
        }
    }

    /// Post-conditions: no foldable branch survives, no loop is divergent.
    fn verify(&self) -> VectorizeResult<()> {
        for &block in &self.blocks {
            if self.func.is_block_dead(block) {
                continue;
            }
            if let Some(term) = self.func.terminator(block) {
                if self.needs_folding(term) {
                    return Err(VectorizeError::invariant(format!(
                        "divergent branch survived linearization in {}",
                        self.func.block_name(block)
                    )));
                }
            }
            if let Some(idx) = self.loops.loop_with_header(block) {
                let header = self.loops.get(idx).header;
                if self.vi.is_divergent_loop(header) {
                    return Err(VectorizeError::invariant(
                        "divergent loop survived linearization",
                    ));
                }
            }
        }
        if self.vi.repair_phi_count() != 0 {
            return Err(VectorizeError::invariant("unresolved repair phis remain"));
        }
        Ok(())
    }
}

/// Register a repair phi: a placeholder at `dest` whose first input is the
/// preferred (inner) definition and whose second is the outer fallback,
/// resolved by [`linearize`] after the schedule is final.
pub fn create_repair_phi(
    vi: &mut VectorizationInfo,
    func: &mut Function,
    dest: BlockId,
    inner: (ValueId, BlockId),
    outer: (ValueId, BlockId),
) -> ValueId {
    let ty = func.ty(inner.0);
    let phi = func.insert_phi(dest, ty, &[inner, outer]);
    let shape = vi.shape(inner.0);
    vi.set_shape(phi, shape);
    vi.add_repair_phi(phi);
    phi
}

// =============================================================================
// Tests
// =============================================================================
