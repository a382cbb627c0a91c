//! Mask materialization.
//!
//! Synthesizes the per-block entry masks and per-edge masks as IR values:
//!
//! - the region entry executes under the caller's `(predicate, AVL)` pair
//! - an edge mask is the source block's entry predicate conjoined with the
//!   branch condition (negated for the false edge)
//! - a block with several predecessors merges the incoming edge predicates
//!   through a mask phi; when the linearizer later folds that phi over the
//!   same edge predicates, the select cascade it produces computes exactly
//!   the disjunction of the edge masks, so SSA stays valid both before and
//!   after linearization
//!
//! The disjunction short-circuits: one statically all-true input makes the
//! whole entry mask all-true and nothing is synthesized.

use crate::ir::{BlockId, DominatorTree, Function, InsertionBuilder, Opcode, Type, ValueId};
use crate::mask::Mask;
use crate::shape::VectorShape;
use crate::vecinfo::VectorizationInfo;

use rustc_hash::FxHashMap;

// =============================================================================
// Mask assignment
// =============================================================================

/// The per-edge masks produced by materialization; the per-block entry masks
/// live in [`VectorizationInfo`].
#[derive(Debug, Clone, Default)]
pub struct MaskAssignment {
    edges: FxHashMap<(BlockId, BlockId), Mask>,
}

impl MaskAssignment {
    /// The mask of CFG edge `from -> to` (all-true if never set).
    pub fn edge_mask(&self, from: BlockId, to: BlockId) -> Mask {
        self.edges
            .get(&(from, to))
            .copied()
            .unwrap_or_else(Mask::all_true)
    }

    /// Check if an edge mask was recorded.
    pub fn has_edge_mask(&self, from: BlockId, to: BlockId) -> bool {
        self.edges.contains_key(&(from, to))
    }

    /// Record the mask of a CFG edge.
    pub fn set_edge_mask(&mut self, from: BlockId, to: BlockId, mask: Mask) {
        self.edges.insert((from, to), mask);
    }
}

/// Statistics from mask materialization.
#[derive(Debug, Clone, Default)]
pub struct MaskStats {
    /// Blocks that received an entry mask.
    pub entry_masks: usize,
    /// Edge masks synthesized.
    pub edge_masks: usize,
    /// Mask phis created at merge points.
    pub mask_phis: usize,
    /// Disjunctions folded away because an input was all-true.
    pub all_true_folds: usize,
}

// =============================================================================
// Materialization
// =============================================================================

/// Materialize entry masks for every in-region block and masks for every
/// in-region edge.
pub fn materialize_masks(
    vi: &mut VectorizationInfo,
    func: &mut Function,
    dom: &DominatorTree,
) -> (MaskAssignment, MaskStats) {
    let mut assignment = MaskAssignment::default();
    let mut stats = MaskStats::default();

    // The region entry (function entry, or the loop header of a narrowed
    // region) executes under the caller's entry mask.
    let entry = dom
        .rpo
        .iter()
        .copied()
        .find(|&b| vi.in_region(b))
        .unwrap_or_else(|| func.entry());
    if !vi.has_mask(entry) {
        vi.set_mask(entry, Mask::new(None, vi.entry_avl()));
    }
    stats.entry_masks += 1;

    // Mask phis whose back-edge inputs are filled after the latch has been
    // processed: (phi, header, pending pred).
    let mut deferred: Vec<(ValueId, BlockId, BlockId)> = Vec::new();

    let rpo = dom.rpo.clone();
    for &block in &rpo {
        if block == entry || !vi.in_region(block) {
            continue;
        }
        let preds: Vec<BlockId> = func
            .preds(block)
            .iter()
            .copied()
            .filter(|&p| vi.in_region(p))
            .collect();

        let processed: Vec<BlockId> = preds
            .iter()
            .copied()
            .filter(|&p| vi.has_mask(p))
            .collect();
        let pending: Vec<BlockId> = preds
            .iter()
            .copied()
            .filter(|&p| !vi.has_mask(p))
            .collect();

        for &pred in &processed {
            if !assignment.has_edge_mask(pred, block) {
                let mask = synthesize_edge_mask(vi, func, &mut stats, pred, block);
                assignment.set_edge_mask(pred, block, mask);
            }
        }

        let mask = if processed.len() == 1 && pending.is_empty() {
            assignment.edge_mask(processed[0], block)
        } else if processed
            .iter()
            .any(|&p| assignment.edge_mask(p, block).known_all_true(func))
            && pending.is_empty()
        {
            stats.all_true_folds += 1;
            Mask::all_true()
        } else {
            // Merge point (or loop header with unprocessed back edges):
            // build the mask phi over the incoming edge predicates.
            let incoming: Vec<(ValueId, BlockId)> = processed
                .iter()
                .map(|&p| {
                    let edge = assignment.edge_mask(p, block);
                    let pred_val = edge
                        .predicate()
                        .unwrap_or_else(|| func.const_bool(true));
                    (pred_val, p)
                })
                .collect();
            let phi = func.insert_phi(block, Type::Bool, &incoming);
            stats.mask_phis += 1;
            for &p in &pending {
                deferred.push((phi, block, p));
            }
            if let Some(varying) = vi.varying_predicate_flag(block) {
                vi.set_shape(
                    phi,
                    if varying {
                        VectorShape::varying(1)
                    } else {
                        VectorShape::uni()
                    },
                );
            }

            // The AVL is uniform along the region; keep it when all
            // incoming edges agree.
            let mut avl = processed
                .first()
                .and_then(|&p| assignment.edge_mask(p, block).avl());
            for &p in processed.iter().skip(1) {
                if assignment.edge_mask(p, block).avl() != avl {
                    avl = None;
                }
            }
            Mask::new(Some(phi), avl)
        };

        vi.set_mask(block, mask);
        stats.entry_masks += 1;
    }

    // Fill the deferred back-edge inputs now that every block has a mask.
    for (phi, block, pred) in deferred {
        if !assignment.has_edge_mask(pred, block) {
            let mask = synthesize_edge_mask(vi, func, &mut stats, pred, block);
            assignment.set_edge_mask(pred, block, mask);
        }
        let edge = assignment.edge_mask(pred, block);
        let pred_val = edge.predicate().unwrap_or_else(|| func.const_bool(true));
        func.add_phi_incoming(phi, pred_val, pred);
    }

    (assignment, stats)
}

/// Synthesize the mask of edge `pred -> block` at the end of `pred`.
fn synthesize_edge_mask(
    vi: &mut VectorizationInfo,
    func: &mut Function,
    stats: &mut MaskStats,
    pred: BlockId,
    block: BlockId,
) -> Mask {
    let entry_mask = vi.mask(pred);
    let Some(term) = func.terminator(pred) else {
        return entry_mask;
    };
    let term_inst = func.inst(term).unwrap();
    if term_inst.op != Opcode::Branch {
        return entry_mask;
    }
    let on_true = term_inst.blocks[0];
    let on_false = term_inst.blocks[1];
    if on_true == on_false {
        return entry_mask;
    }
    let cond = term_inst.operands[0];
    stats.edge_masks += 1;

    let mut builder = InsertionBuilder::before_terminator(func, pred);
    let edge_cond = if block == on_true {
        cond
    } else {
        builder.not(cond)
    };

    let pred_val = match entry_mask.predicate() {
        // Short-circuit: an all-true entry mask contributes nothing.
        Some(entry_pred) if !entry_mask.known_all_true(builder.func()) => {
            builder.and(edge_cond, entry_pred)
        }
        _ => edge_cond,
    };
    annotate_mask_value(vi, func, pred_val);
    Mask::new(Some(pred_val), entry_mask.avl())
}

/// Propagate a shape onto a synthesized mask value when its inputs already
/// have shapes (a mask built from uniform inputs is uniform).
fn annotate_mask_value(vi: &mut VectorizationInfo, func: &Function, value: ValueId) {
    let Some(inst) = func.inst(value) else {
        return;
    };
    let mut shape = VectorShape::uni();
    for &operand in &inst.operands {
        let op_shape = if func.is_const_like(operand) {
            VectorShape::uni()
        } else {
            vi.shape(operand)
        };
        if op_shape.is_undef() {
            return;
        }
        if !op_shape.is_uniform() {
            shape = VectorShape::varying(1);
        }
    }
    vi.set_shape(value, shape);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::vecinfo::{Region, VectorMapping, VectorizationInfo};

    fn vi() -> VectorizationInfo {
        VectorizationInfo::new(Region::WholeFunction, VectorMapping::new(4))
    }

    #[test]
    fn test_diamond_masks() {
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

        let mut info = vi();
        let dom = DominatorTree::build(&f);
        let (assignment, stats) = materialize_masks(&mut info, &mut f, &dom);

        // The entry executes under all-true.
        assert!(info.mask(entry).known_all_true(&f));

        // The true edge is guarded by the plain condition (entry is
        // all-true, so no conjunction is inserted).
        let true_edge = assignment.edge_mask(entry, left);
        assert_eq!(true_edge.predicate(), Some(cond));

        // The false edge negates the condition.
        let false_edge = assignment.edge_mask(entry, right);
        let neg = false_edge.predicate().unwrap();
        assert_eq!(f.inst(neg).unwrap().op, Opcode::Xor);

        // The join merges both edges through a mask phi.
        let join_mask = info.mask(join).predicate().unwrap();
        assert!(f.is_phi(join_mask));
        assert_eq!(stats.mask_phis, 1);

        // Straight-line edges forward the source's entry mask.
        assert_eq!(assignment.edge_mask(left, join).predicate(), Some(cond));
    }

    #[test]
    fn test_loop_header_mask_phi_gets_back_edge() {
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

        let mut info = vi();
        let dom = DominatorTree::build(&f);
        let (_, stats) = materialize_masks(&mut info, &mut f, &dom);

        // The header has a mask phi with inputs from both the pre-header
        // and the latch.
        let header_mask = info.mask(header).predicate().unwrap();
        assert!(f.is_phi(header_mask));
        let incoming = f.phi_incoming(header_mask);
        assert_eq!(incoming.len(), 2);
        assert!(incoming.iter().any(|&(_, b)| b == entry));
        assert!(incoming.iter().any(|&(_, b)| b == body));
        assert_eq!(stats.mask_phis, 1);
    }

    #[test]
    fn test_avl_propagates_to_edges() {
        let mut f = Function::new("avl");
        let entry = f.create_block("entry");
        let next = f.create_block("next");
        f.set_entry(entry);
        f.set_jump(entry, next);
        f.set_ret(next, None);
        let avl = f.add_arg(Type::Int);

        let mut info = vi();
        info.set_entry_avl(Some(avl));
        let dom = DominatorTree::build(&f);
        let (assignment, _) = materialize_masks(&mut info, &mut f, &dom);

        assert_eq!(info.mask(entry).avl(), Some(avl));
        assert_eq!(assignment.edge_mask(entry, next).avl(), Some(avl));
        assert_eq!(info.mask(next).avl(), Some(avl));
    }
}
