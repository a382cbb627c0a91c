//! Divergent-loop transformation.
//!
//! Rewrites each divergent natural loop into a uniform shape: a single pure
//! latch with a single latch exit, taken when no lane is still active.
//! Per-lane termination is tracked by a live-mask phi in the header;
//! per-exit state by wrap/tracker/update phi triples:
//!
//! ```text
//!            header:  live    = phi [entry_mask, preheader] [live.next, latch]
//!                     wrap    = phi [false, preheader]      [wrap.next, latch]
//!                     track_v = phi [undef, preheader]      [track_v.next, latch]
//!   exiting block E:  exit    = <edge mask of the divergent exit>
//!                     wrap.E  = wrap | exit
//!                     track.E = select exit, v, track_v
//!                     br ... pure_latch            ; exit edge deferred
//!        pure_latch:  live.next  = phi [live & !exit, E] [live, old_latch]
//!                     wrap.next  = phi [wrap.E, E]       [wrap, old_latch]
//!                     track.next = phi [track.E, E]      [track_v, old_latch]
//!                     br (any_lane live.next), header, latch_exit
//!        latch_exit:  jmp exit_block               ; lcssa phis read trackers
//! ```
//!
//! Kill exits (uniform exit condition) keep their branches: when taken, all
//! remaining lanes leave together. Loops are processed innermost-first; the
//! loop forest is recomputed after each rewrite so enclosing loops observe
//! the new edges.
//!
//! Masks consumed here (the latch mask and the per-exit edge masks) are
//! cached from the mask assignment before any surgery, since the rewiring
//! invalidates the assignment for the touched edges.

use super::masks::MaskAssignment;
use crate::error::{VectorizeError, VectorizeResult};
use crate::ir::{
    BlockId, DominatorTree, Function, InsertionBuilder, LoopForest, Opcode, Type, ValueId,
};
use crate::mask::Mask;
use crate::shape::VectorShape;
use crate::vecinfo::VectorizationInfo;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Statistics
// =============================================================================

/// Statistics from divergent-loop regularization.
#[derive(Debug, Clone, Default)]
pub struct DivLoopStats {
    /// Loops inspected that were already uniform.
    pub uniform_loops: usize,
    /// Divergent loops rewritten.
    pub divergent_loops: usize,
    /// Kill exits left intact.
    pub kill_exits: usize,
    /// Divergent exit edges deferred through the latch.
    pub divergent_exits: usize,
    /// Tracker phis installed for cross-exit live-outs.
    pub trackers: usize,
}

// =============================================================================
// Entry point
// =============================================================================

/// Rewrite every divergent loop in the region into uniform form,
/// innermost-first.
pub fn regularize_divergent_loops(
    vi: &mut VectorizationInfo,
    func: &mut Function,
    masks: &mut MaskAssignment,
) -> VectorizeResult<DivLoopStats> {
    let mut stats = DivLoopStats::default();
    loop {
        let dom = DominatorTree::build(func);
        let forest = LoopForest::compute(func, &dom);

        let mut target = None;
        for idx in forest.innermost_first() {
            let header = forest.get(idx).header;
            if vi.is_divergent_loop(header) {
                target = Some(idx);
                break;
            }
        }
        let Some(idx) = target else {
            stats.uniform_loops = forest.len().saturating_sub(stats.divergent_loops);
            break;
        };

        match LoopSession::analyze(vi, func, &dom, &forest, masks, idx)? {
            Some(mut session) => session.transform(vi, func, masks, &mut stats)?,
            None => {
                // All exits take their lanes together: nothing to defer.
                vi.remove_divergent_loop(forest.get(idx).header);
            }
        }
    }
    Ok(stats)
}

// =============================================================================
// Per-loop session
// =============================================================================

/// One divergent exit edge with its cached mask and live-out values.
struct DivergentExit {
    exiting: BlockId,
    /// Edge predicate of the exit, cached before the rewiring.
    exit_pred: ValueId,
    /// Live-out values read by the exit block's phis over this edge, in
    /// phi order.
    live_outs: Vec<(ValueId, ValueId)>,
}

/// State tracking for one loop rewrite (header/latch layout plus the
/// wrap/tracker/update descriptors).
struct LoopSession {
    header: BlockId,
    preheader: BlockId,
    old_latch: BlockId,
    exit_block: BlockId,
    /// Predicate of the pre-header entry edge; None when all-true.
    entry_pred: Option<ValueId>,
    entry_avl: Option<ValueId>,
    /// Mask of the old back edge, cached before surgery.
    latch_mask: Mask,
    exits: Vec<DivergentExit>,
    /// Blocks of the loop at analysis time.
    body: Vec<BlockId>,
}

impl LoopSession {
    /// Validate the loop and cache everything the rewrite needs. Returns
    /// `None` when the loop has no divergent exit edge to defer.
    fn analyze(
        vi: &VectorizationInfo,
        func: &Function,
        _dom: &DominatorTree,
        forest: &LoopForest,
        masks: &MaskAssignment,
        idx: usize,
    ) -> VectorizeResult<Option<LoopSession>> {
        let lp = forest.get(idx);
        let header = lp.header;
        let latch = lp.latch().ok_or_else(|| {
            VectorizeError::capability(format!(
                "divergent loop {} has multiple back edges",
                func.block_name(header)
            ))
        })?;
        let preheader = forest.preheader(func, idx).ok_or_else(|| {
            VectorizeError::capability(format!(
                "divergent loop {} has no unique pre-header",
                func.block_name(header)
            ))
        })?;

        let mut exits = Vec::new();
        let mut exit_block = None;
        for (exiting, exit) in forest.exit_edges(func, idx) {
            let branch = func.terminator(exiting).ok_or_else(|| {
                VectorizeError::invariant(format!(
                    "exiting block {} has no terminator",
                    func.block_name(exiting)
                ))
            })?;
            if vi.shape(branch).is_uniform() {
                continue;
            }
            match exit_block {
                None => exit_block = Some(exit),
                Some(existing) if existing == exit => {}
                Some(_) => {
                    return Err(VectorizeError::capability(format!(
                        "divergent loop {} exits to several blocks",
                        func.block_name(header)
                    )))
                }
            }
            let exit_pred = divergent_exit_predicate(func, masks, exiting, exit)?;
            let live_outs = collect_live_outs(func, vi, exit, exiting);
            exits.push(DivergentExit {
                exiting,
                exit_pred,
                live_outs,
            });
        }

        let Some(exit_block) = exit_block else {
            return Ok(None);
        };

        let entry_mask = masks.edge_mask(preheader, header);
        Ok(Some(LoopSession {
            header,
            preheader,
            old_latch: latch,
            exit_block,
            entry_pred: entry_mask.predicate(),
            entry_avl: entry_mask.avl(),
            latch_mask: masks.edge_mask(latch, header),
            exits,
            body: lp.blocks.clone(),
        }))
    }

    /// Perform the rewrite.
    fn transform(
        &mut self,
        vi: &mut VectorizationInfo,
        func: &mut Function,
        masks: &mut MaskAssignment,
        stats: &mut DivLoopStats,
    ) -> VectorizeResult<()> {
        log::debug!(
            "regularizing divergent loop {} ({} divergent exit edges)",
            func.block_name(self.header),
            self.exits.len()
        );
        stats.divergent_loops += 1;
        stats.divergent_exits += self.exits.len();

        // Count kill exits for the record; their branches stay untouched.
        for &block in &self.body {
            for succ in func.succs(block) {
                let inside = self.body.contains(&succ);
                if !inside && vi.is_kill_exit(succ) && succ != self.exit_block {
                    stats.kill_exits += 1;
                }
            }
        }

        // Step 1: a pure latch whose only job is the back-edge test.
        let latch_name = format!("{}.pure_latch", func.block_name(self.header));
        let pure_latch = func.create_block(latch_name);
        func.set_jump(pure_latch, self.header);
        func.replace_successor(self.old_latch, self.header, pure_latch);
        let latch_index_fixups: Vec<ValueId> = func.block_phis(self.header);
        for phi in &latch_index_fixups {
            if let Some(i) = func.phi_incoming_index(*phi, self.old_latch) {
                func.set_phi_incoming_block(*phi, i, pure_latch);
            }
        }
        masks.set_edge_mask(self.old_latch, pure_latch, self.latch_mask);
        vi.add_to_region(pure_latch);

        // Step 2: defer every divergent exit edge through the pure latch.
        for exit in &self.exits {
            func.replace_successor(exit.exiting, self.exit_block, pure_latch);
            for phi in func.block_phis(self.exit_block) {
                while let Some(i) = func.phi_incoming_index(phi, exit.exiting) {
                    func.remove_phi_incoming(phi, i);
                }
            }
            // A branch left with both edges into the latch folds to a jump.
            if let Some(term) = func.terminator(exit.exiting) {
                let succs = func.inst(term).unwrap().blocks.clone();
                if succs.len() == 2 && succs[0] == succs[1] {
                    vi.drop_shape(term);
                    let jump = func.set_jump(exit.exiting, pure_latch);
                    vi.set_shape(jump, VectorShape::uni());
                }
            }
            masks.set_edge_mask(
                exit.exiting,
                pure_latch,
                Mask::new(Some(exit.exit_pred), self.entry_avl),
            );
        }

        let latch_preds: Vec<BlockId> = dedup(func.preds(pure_latch));
        let exit_of: FxHashMap<BlockId, usize> = self
            .exits
            .iter()
            .enumerate()
            .map(|(i, e)| (e.exiting, i))
            .collect();

        // Step 3: the live mask. Reuse the header's mask phi when the mask
        // pass installed one, otherwise seed a fresh phi from the entry mask.
        let live_phi = match vi.mask(self.header).predicate().filter(|&p| {
            func.is_phi(p) && func.def_block(p) == Some(self.header)
        }) {
            Some(phi) => phi,
            None => {
                let entry_pred = self
                    .entry_pred
                    .unwrap_or_else(|| func.const_bool(true));
                let phi = func.insert_phi(self.header, Type::Bool, &[(entry_pred, self.preheader)]);
                vi.set_mask(
                    self.header,
                    Mask::new(Some(phi), self.entry_avl),
                );
                phi
            }
        };
        vi.set_shape(live_phi, VectorShape::varying(1));

        // live.next = live & !(lane finished this iteration), merged per
        // latch predecessor.
        let mut live_incoming: Vec<(ValueId, BlockId)> = Vec::new();
        for &q in &latch_preds {
            let value = match exit_of.get(&q) {
                Some(&i) => {
                    let exit_pred = self.exits[i].exit_pred;
                    let mut builder = InsertionBuilder::before_terminator(func, q);
                    let gone = builder.not(exit_pred);
                    let live_next = builder.and(live_phi, gone);
                    vi.set_shape(gone, VectorShape::varying(1));
                    vi.set_shape(live_next, VectorShape::varying(1));
                    live_next
                }
                None => live_phi,
            };
            live_incoming.push((value, q));
        }
        let live_update = func.insert_phi(pure_latch, Type::Bool, &live_incoming);
        vi.set_shape(live_update, VectorShape::varying(1));
        set_or_add_incoming(func, live_phi, pure_latch, live_update);

        // Step 4: the wrap phi collects the exit-taken mask across
        // iterations; it becomes the entry mask of the deferred exit.
        let false_const = func.const_bool(false);
        let wrap_phi = func.insert_phi(self.header, Type::Bool, &[(false_const, self.preheader)]);
        vi.set_shape(wrap_phi, VectorShape::varying(1));
        let mut wrap_incoming: Vec<(ValueId, BlockId)> = Vec::new();
        for &q in &latch_preds {
            let value = match exit_of.get(&q) {
                Some(&i) => {
                    let exit_pred = self.exits[i].exit_pred;
                    let mut builder = InsertionBuilder::before_terminator(func, q);
                    let taken = builder.or(wrap_phi, exit_pred);
                    vi.set_shape(taken, VectorShape::varying(1));
                    taken
                }
                None => wrap_phi,
            };
            wrap_incoming.push((value, q));
        }
        let wrap_update = func.insert_phi(pure_latch, Type::Bool, &wrap_incoming);
        vi.set_shape(wrap_update, VectorShape::varying(1));
        func.add_phi_incoming(wrap_phi, wrap_update, pure_latch);

        // Step 5: the single deferred exit.
        let exit_name = format!("{}.latch_exit", func.block_name(self.header));
        let latch_exit = func.create_block(exit_name);
        let exit_jump = func.set_jump(latch_exit, self.exit_block);
        vi.set_shape(exit_jump, VectorShape::uni());
        vi.add_to_region(latch_exit);

        // Step 6: trackers for every value live across a divergent exit.
        let exit_mask_phi = vi.mask(self.exit_block).predicate();
        let lcssa_phis = func.block_phis(self.exit_block);
        let mut tracker_updates: FxHashMap<ValueId, ValueId> = FxHashMap::default();
        for &lx in &lcssa_phis {
            if vi.is_repair_phi(lx) {
                continue;
            }
            if exit_mask_phi == Some(lx) {
                // The exit block's own mask phi accumulates exactly the
                // wrapped exit mask.
                func.add_phi_incoming(lx, wrap_update, latch_exit);
                continue;
            }
            let update = self.install_tracker(vi, func, &latch_preds, &exit_of, pure_latch, lx);
            tracker_updates.insert(lx, update);
            func.add_phi_incoming(lx, update, latch_exit);
            stats.trackers += 1;
        }

        // Step 7: uniform latch exit on "no lane is still active".
        let any = func.push_inst(pure_latch, Opcode::AnyLane, &[live_update], Type::Bool);
        vi.set_shape(any, VectorShape::uni());
        let branch = func.set_branch(pure_latch, any, self.header, latch_exit);
        vi.set_shape(branch, VectorShape::uni());

        // Step 8: header phis whose back-edge value no longer dominates the
        // latch get a merge phi (the value is dead on lanes that left).
        self.repair_header_phis(vi, func, &latch_preds, pure_latch);

        // Step 9: bookkeeping.
        masks.set_edge_mask(
            pure_latch,
            self.header,
            Mask::new(Some(live_update), self.entry_avl),
        );
        let loop_entry_mask = Mask::new(self.entry_pred, self.entry_avl);
        masks.set_edge_mask(pure_latch, latch_exit, loop_entry_mask);
        masks.set_edge_mask(
            latch_exit,
            self.exit_block,
            Mask::new(Some(wrap_update), self.entry_avl),
        );
        vi.set_mask(pure_latch, Mask::new(Some(live_phi), self.entry_avl));
        vi.set_mask(latch_exit, loop_entry_mask);
        if func.preds(self.exit_block) == [latch_exit] {
            vi.set_mask(
                self.exit_block,
                Mask::new(Some(wrap_update), self.entry_avl),
            );
        }

        vi.remove_divergent_loop(self.header);
        vi.remove_divergent_loop_exit(self.exit_block);
        Ok(())
    }

    /// Install the tracker/update pair for one LCSSA phi of the deferred
    /// exit and return the update phi at the pure latch.
    fn install_tracker(
        &self,
        vi: &mut VectorizationInfo,
        func: &mut Function,
        latch_preds: &[BlockId],
        exit_of: &FxHashMap<BlockId, usize>,
        pure_latch: BlockId,
        lx: ValueId,
    ) -> ValueId {
        let ty = func.ty(lx);
        let undef = func.undef(ty);
        let tracker = func.insert_phi(self.header, ty, &[(undef, self.preheader)]);
        vi.set_shape(tracker, VectorShape::varying(1));

        let mut incoming: Vec<(ValueId, BlockId)> = Vec::new();
        for &q in latch_preds {
            let value = match exit_of.get(&q) {
                Some(&i) if self.exit_live_out(i, lx).is_some() => {
                    let exit = &self.exits[i];
                    let live_out = self.exit_live_out(i, lx).unwrap();
                    let mut builder = InsertionBuilder::before_terminator(func, q);
                    let update = builder.select(exit.exit_pred, live_out, tracker);
                    vi.set_shape(update, VectorShape::varying(1));
                    update
                }
                _ => tracker,
            };
            incoming.push((value, q));
        }
        let update_phi = func.insert_phi(pure_latch, ty, &incoming);
        vi.set_shape(update_phi, VectorShape::varying(1));
        func.add_phi_incoming(tracker, update_phi, pure_latch);
        update_phi
    }

    /// The value `lx` reads over divergent exit `i`, if any.
    fn exit_live_out(&self, i: usize, lx: ValueId) -> Option<ValueId> {
        self.exits[i]
            .live_outs
            .iter()
            .find(|&&(phi, _)| phi == lx)
            .map(|&(_, v)| v)
    }

    /// Header phis whose back-edge value is defined in the loop but does not
    /// dominate every latch predecessor get a merge phi at the pure latch
    /// with undef on the deferred-exit paths.
    fn repair_header_phis(
        &self,
        vi: &mut VectorizationInfo,
        func: &mut Function,
        latch_preds: &[BlockId],
        pure_latch: BlockId,
    ) {
        for phi in func.block_phis(self.header) {
            let Some(i) = func.phi_incoming_index(phi, pure_latch) else {
                continue;
            };
            let value = func.phi_incoming(phi)[i].0;
            if func.def_block(value) == Some(pure_latch) {
                continue; // already one of the update phis
            }
            let Some(def_block) = func.def_block(value) else {
                continue; // constants and arguments dominate everything
            };
            if !self.body.contains(&def_block) {
                continue;
            }
            let dominates_all = latch_preds
                .iter()
                .all(|&q| q == def_block || block_reaches_only_through(func, &self.body, q, def_block));
            if dominates_all {
                continue;
            }
            let ty = func.ty(value);
            let undef = func.undef(ty);
            let incoming: Vec<(ValueId, BlockId)> = latch_preds
                .iter()
                .map(|&q| {
                    if q == self.old_latch {
                        (value, q)
                    } else {
                        (undef, q)
                    }
                })
                .collect();
            let merge = func.insert_phi(pure_latch, ty, &incoming);
            vi.set_shape(merge, vi.shape(phi));
            func.set_phi_incoming_value(phi, i, merge);
        }
    }
}

/// Cheap in-loop dominance test used while the dominator tree is in flux:
/// does every loop path from the header to `to` pass through `through`?
/// Conservatively checked by a reverse walk from `to` that stops at the
/// header and must not bypass `through`.
fn block_reaches_only_through(
    func: &Function,
    body: &[BlockId],
    to: BlockId,
    through: BlockId,
) -> bool {
    let mut stack = vec![to];
    let mut seen: SmallVec<[BlockId; 8]> = SmallVec::new();
    while let Some(block) = stack.pop() {
        if block == through || seen.contains(&block) {
            continue;
        }
        seen.push(block);
        let preds = func.preds(block);
        if preds.iter().any(|p| !body.contains(p)) {
            return false; // reached the header / loop entry bypassing `through`
        }
        for &p in preds {
            stack.push(p);
        }
    }
    true
}

/// The edge predicate of a divergent exit, derived from the mask
/// assignment, falling back to the branch condition.
fn divergent_exit_predicate(
    func: &Function,
    masks: &MaskAssignment,
    exiting: BlockId,
    exit: BlockId,
) -> VectorizeResult<ValueId> {
    if let Some(pred) = masks.edge_mask(exiting, exit).predicate() {
        return Ok(pred);
    }
    // No materialized edge mask (mask generation was skipped): take the raw
    // branch condition; the false edge has its negation materialized by the
    // mask pass in every driver configuration, so this is a test-only path.
    let term = func
        .terminator(exiting)
        .ok_or_else(|| VectorizeError::invariant("exiting block without terminator"))?;
    let inst = func.inst(term).unwrap();
    if inst.op != Opcode::Branch {
        return Err(VectorizeError::capability(
            "divergent exit without conditional branch",
        ));
    }
    if inst.blocks[0] == exit {
        Ok(inst.operands[0])
    } else {
        Err(VectorizeError::capability(
            "divergent false-edge exit without materialized mask",
        ))
    }
}

/// Live-outs of one divergent exit edge: (exit phi, value carried over the
/// edge).
fn collect_live_outs(
    func: &Function,
    vi: &VectorizationInfo,
    exit: BlockId,
    exiting: BlockId,
) -> Vec<(ValueId, ValueId)> {
    let mut live_outs = Vec::new();
    for phi in func.block_phis(exit) {
        if vi.is_repair_phi(phi) {
            continue;
        }
        if let Some(i) = func.phi_incoming_index(phi, exiting) {
            live_outs.push((phi, func.phi_incoming(phi)[i].0));
        }
    }
    live_outs
}

fn dedup(blocks: &[BlockId]) -> Vec<BlockId> {
    let mut out = Vec::new();
    for &b in blocks {
        if !out.contains(&b) {
            out.push(b);
        }
    }
    out
}

fn set_or_add_incoming(func: &mut Function, phi: ValueId, block: BlockId, value: ValueId) {
    match func.phi_incoming_index(phi, block) {
        Some(i) => func.set_phi_incoming_value(phi, i, value),
        None => func.add_phi_incoming(phi, value, block),
    }
}

// =============================================================================
// Tests
// =============================================================================
