//! Shared vectorization state.
//!
//! `VectorizationInfo` is the overlay object every analysis and transform
//! reads and updates: value shapes, per-block masks, divergence sets,
//! pinning, the region under transformation and the scalar-to-vector
//! mapping. It is constructed once per function and lives for the whole
//! pipeline; each pass owns it exclusively while running.
//!
//! Divergent loops are keyed by their header block, which survives loop
//! forest rebuilds between phases.

use crate::ir::{BlockId, Function, LoopForest, ValueId};
use crate::mask::Mask;
use crate::shape::VectorShape;

use rustc_hash::{FxHashMap, FxHashSet};

// =============================================================================
// Region
// =============================================================================

/// The subgraph under transformation.
#[derive(Debug, Clone, Default)]
pub enum Region {
    /// The whole function.
    #[default]
    WholeFunction,

    /// An explicit block set.
    Blocks(FxHashSet<BlockId>),
}

impl Region {
    /// Check if a block belongs to the region.
    pub fn contains(&self, block: BlockId) -> bool {
        match self {
            Region::WholeFunction => true,
            Region::Blocks(set) => set.contains(&block),
        }
    }

    /// Extend the region with a block created during a transform.
    pub fn add(&mut self, block: BlockId) {
        if let Region::Blocks(set) = self {
            set.insert(block);
        }
    }
}

// =============================================================================
// Scalar-to-vector mapping
// =============================================================================

/// How a call result's shape is derived from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShapeRule {
    /// Uniform when every argument is uniform, varying otherwise.
    UniformIfUniformArgs,

    /// Always this shape.
    Fixed(VectorShape),
}

/// A known scalar function with a vector counterpart.
#[derive(Debug, Clone)]
pub struct VectorFuncInfo {
    /// Name of the vector variant.
    pub vector_name: String,

    /// Whether the scalar function is side-effect free.
    pub pure_fn: bool,

    /// Result shape rule.
    pub result: CallShapeRule,
}

/// Vector ABI marker: what granularity the caller asked to vectorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VectorAbi {
    /// Vectorize the whole function body.
    #[default]
    WholeFunction,

    /// Vectorize the function's outer loop (remainder transform applies).
    OuterLoop,
}

/// Scalar-to-vector mapping for one function.
#[derive(Debug, Clone)]
pub struct VectorMapping {
    /// SIMD lane count.
    pub vector_width: u32,

    /// Shapes of the vectorized function's arguments, seeding the analysis.
    pub arg_shapes: Vec<VectorShape>,

    /// Known scalar functions with vector counterparts, by callee name.
    pub functions: FxHashMap<String, VectorFuncInfo>,

    /// Vectorization granularity.
    pub abi: VectorAbi,
}

impl VectorMapping {
    /// Create a mapping with the given width; arguments default to uniform.
    pub fn new(vector_width: u32) -> Self {
        VectorMapping {
            vector_width,
            arg_shapes: Vec::new(),
            functions: FxHashMap::default(),
            abi: VectorAbi::WholeFunction,
        }
    }

    /// Look up a callee.
    pub fn function(&self, callee: &str) -> Option<&VectorFuncInfo> {
        self.functions.get(callee)
    }
}

// =============================================================================
// VectorizationInfo
// =============================================================================

/// Vectorization state for one function/region.
#[derive(Debug, Clone)]
pub struct VectorizationInfo {
    region: Region,
    mapping: VectorMapping,

    /// Value, argument and instruction shapes.
    shapes: FxHashMap<ValueId, VectorShape>,

    /// Materialized per-block entry masks.
    masks: FxHashMap<BlockId, Mask>,

    /// Headers of detected divergent loops.
    divergent_loops: FxHashSet<BlockId>,

    /// Exit blocks reached through a divergent exit edge.
    divergent_loop_exits: FxHashSet<BlockId>,

    /// Join points of disjoint paths from a varying branch.
    join_divergent: FxHashSet<BlockId>,

    /// Tentative entry-predicate shapes (true = varying); absent = unknown.
    varying_predicate: FxHashMap<BlockId, bool>,

    /// Values whose shape is frozen and must survive re-analysis.
    pinned: FxHashSet<ValueId>,

    /// Placeholder phis pending SSA repair after linearization.
    repair_phis: FxHashSet<ValueId>,

    /// Initial active vector length, if any.
    entry_avl: Option<ValueId>,
}

impl VectorizationInfo {
    /// Create the vectorization state for a region of a function.
    pub fn new(region: Region, mapping: VectorMapping) -> Self {
        VectorizationInfo {
            region,
            mapping,
            shapes: FxHashMap::default(),
            masks: FxHashMap::default(),
            divergent_loops: FxHashSet::default(),
            divergent_loop_exits: FxHashSet::default(),
            join_divergent: FxHashSet::default(),
            varying_predicate: FxHashMap::default(),
            pinned: FxHashSet::default(),
            repair_phis: FxHashSet::default(),
            entry_avl: None,
        }
    }

    /// The region under transformation.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Extend the region with a transform-created block.
    pub fn add_to_region(&mut self, block: BlockId) {
        self.region.add(block);
    }

    /// Check if a block is inside the region.
    pub fn in_region(&self, block: BlockId) -> bool {
        self.region.contains(block)
    }

    /// The scalar-to-vector mapping.
    pub fn mapping(&self) -> &VectorMapping {
        &self.mapping
    }

    /// SIMD lane count.
    pub fn vector_width(&self) -> u32 {
        self.mapping.vector_width
    }

    // =========================================================================
    // Shapes
    // =========================================================================

    /// The shape of a value as observed in its defining block; `Undef` if
    /// not yet computed.
    pub fn shape(&self, value: ValueId) -> VectorShape {
        self.shapes.get(&value).copied().unwrap_or_default()
    }

    /// Check if a value has a computed shape.
    pub fn has_shape(&self, value: ValueId) -> bool {
        self.shapes.contains_key(&value)
    }

    /// Record a value's shape. Pinned values keep their frozen shape.
    pub fn set_shape(&mut self, value: ValueId, shape: VectorShape) {
        if self.pinned.contains(&value) && self.shapes.contains_key(&value) {
            return;
        }
        self.shapes.insert(value, shape);
    }

    /// Forget a value's shape (erased instructions).
    pub fn drop_shape(&mut self, value: ValueId) {
        self.shapes.remove(&value);
        self.pinned.remove(&value);
    }

    /// Snapshot of the full shape map (testing / debugging).
    pub fn shapes(&self) -> &FxHashMap<ValueId, VectorShape> {
        &self.shapes
    }

    /// The shape of `value` as observed from `observer`: a value defined in
    /// a divergent loop is varying once it is observed from outside that
    /// loop, whatever its in-loop shape.
    pub fn observed_shape(
        &self,
        func: &Function,
        loops: &LoopForest,
        observer: BlockId,
        value: ValueId,
    ) -> VectorShape {
        let shape = self.shape(value);
        if self.is_temporal_divergent(func, loops, observer, value) {
            VectorShape::varying(shape.alignment())
        } else {
            shape
        }
    }

    /// Check whether `value` crosses the boundary of a divergent loop on the
    /// way to `observer`.
    pub fn is_temporal_divergent(
        &self,
        func: &Function,
        loops: &LoopForest,
        observer: BlockId,
        value: ValueId,
    ) -> bool {
        let Some(def_block) = func.def_block(value) else {
            return false;
        };
        let mut current = loops.loop_of(def_block);
        while let Some(idx) = current {
            let lp = loops.get(idx);
            if lp.contains(observer) {
                break;
            }
            if self.is_divergent_loop(lp.header) {
                return true;
            }
            current = lp.parent;
        }
        false
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Freeze a value's current shape against recomputation.
    pub fn set_pinned(&mut self, value: ValueId) {
        self.pinned.insert(value);
    }

    /// Pin a value to an explicit shape.
    pub fn set_pinned_shape(&mut self, value: ValueId, shape: VectorShape) {
        self.shapes.insert(value, shape);
        self.pinned.insert(value);
    }

    /// Check if a value's shape is frozen.
    pub fn is_pinned(&self, value: ValueId) -> bool {
        self.pinned.contains(&value)
    }

    /// All pinned values.
    pub fn pinned_values(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.pinned.iter().copied()
    }

    // =========================================================================
    // Loop divergence
    // =========================================================================

    /// Mark the loop headed by `header` divergent.
    pub fn add_divergent_loop(&mut self, header: BlockId) -> bool {
        self.divergent_loops.insert(header)
    }

    /// Mark the loop headed by `header` uniform again.
    pub fn remove_divergent_loop(&mut self, header: BlockId) {
        self.divergent_loops.remove(&header);
    }

    /// Check if the loop headed by `header` is divergent.
    pub fn is_divergent_loop(&self, header: BlockId) -> bool {
        self.divergent_loops.contains(&header)
    }

    /// Mark an exit block as reached through a divergent exit edge.
    pub fn add_divergent_loop_exit(&mut self, block: BlockId) -> bool {
        self.divergent_loop_exits.insert(block)
    }

    /// Drop a divergent-exit record.
    pub fn remove_divergent_loop_exit(&mut self, block: BlockId) {
        self.divergent_loop_exits.remove(&block);
    }

    /// Check if an exit block is a divergent exit.
    pub fn is_divergent_loop_exit(&self, block: BlockId) -> bool {
        self.divergent_loop_exits.contains(&block)
    }

    /// A kill exit takes all still-active lanes together.
    pub fn is_kill_exit(&self, block: BlockId) -> bool {
        !self.is_divergent_loop_exit(block)
    }

    // =========================================================================
    // Join divergence
    // =========================================================================

    /// Record a join point of disjoint paths from a varying branch.
    pub fn add_join_divergent(&mut self, block: BlockId) -> bool {
        self.join_divergent.insert(block)
    }

    /// Check if a block is join-divergent.
    pub fn is_join_divergent(&self, block: BlockId) -> bool {
        self.join_divergent.contains(&block)
    }

    // =========================================================================
    // Tentative predicate shapes
    // =========================================================================

    /// Predict the entry-predicate shape of a block. Returns `None` while
    /// unknown, otherwise whether the predicate will be varying.
    pub fn varying_predicate_flag(&self, block: BlockId) -> Option<bool> {
        self.varying_predicate.get(&block).copied()
    }

    /// Set the tentative predicate shape of a block.
    pub fn set_varying_predicate_flag(&mut self, block: BlockId, varying: bool) {
        self.varying_predicate.insert(block, varying);
    }

    /// Forget the tentative predicate shape of a block.
    pub fn remove_varying_predicate_flag(&mut self, block: BlockId) {
        self.varying_predicate.remove(&block);
    }

    // =========================================================================
    // Masks
    // =========================================================================

    /// Check if a block has a materialized entry mask.
    pub fn has_mask(&self, block: BlockId) -> bool {
        self.masks.contains_key(&block)
    }

    /// The entry mask of a block.
    pub fn mask(&self, block: BlockId) -> Mask {
        self.masks.get(&block).copied().unwrap_or_else(Mask::all_true)
    }

    /// Install (or replace) the entry mask of a block.
    pub fn set_mask(&mut self, block: BlockId, mask: Mask) {
        self.masks.insert(block, mask);
    }

    /// Remove a block's entry mask.
    pub fn drop_mask(&mut self, block: BlockId) {
        self.masks.remove(&block);
    }

    /// The predicate component of a block's mask.
    pub fn predicate(&self, block: BlockId) -> Option<ValueId> {
        self.masks.get(&block).and_then(|m| m.predicate())
    }

    // =========================================================================
    // Repair phis
    // =========================================================================

    /// Register a placeholder phi pending SSA repair.
    pub fn add_repair_phi(&mut self, phi: ValueId) {
        self.repair_phis.insert(phi);
    }

    /// Check if a phi is a repair placeholder.
    pub fn is_repair_phi(&self, phi: ValueId) -> bool {
        self.repair_phis.contains(&phi)
    }

    /// Drain the pending repair phis.
    pub fn take_repair_phis(&mut self) -> Vec<ValueId> {
        let mut phis: Vec<ValueId> = self.repair_phis.drain().collect();
        phis.sort();
        phis
    }

    /// Number of unresolved repair phis.
    pub fn repair_phi_count(&self) -> usize {
        self.repair_phis.len()
    }

    // =========================================================================
    // Entry AVL
    // =========================================================================

    /// The initial active vector length, if one was established.
    pub fn entry_avl(&self) -> Option<ValueId> {
        self.entry_avl
    }

    /// Install the initial active vector length.
    pub fn set_entry_avl(&mut self, avl: Option<ValueId>) {
        self.entry_avl = avl;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DominatorTree, EntityId, Type};

    fn vi() -> VectorizationInfo {
        VectorizationInfo::new(Region::WholeFunction, VectorMapping::new(8))
    }

    #[test]
    fn test_shape_defaults_to_undef() {
        let mut info = vi();
        let v = ValueId::from_index(0);
        assert!(info.shape(v).is_undef());
        info.set_shape(v, VectorShape::uni());
        assert!(info.shape(v).is_uniform());
    }

    #[test]
    fn test_pinned_shape_survives_updates() {
        let mut info = vi();
        let v = ValueId::from_index(0);
        info.set_pinned_shape(v, VectorShape::cont(1, 0));
        info.set_shape(v, VectorShape::varying(1));
        assert_eq!(info.shape(v), VectorShape::cont(1, 0));
        assert!(info.is_pinned(v));
    }

    #[test]
    fn test_divergence_sets() {
        let mut info = vi();
        let header = BlockId::from_index(3);
        let exit = BlockId::from_index(5);

        assert!(info.add_divergent_loop(header));
        assert!(!info.add_divergent_loop(header));
        assert!(info.is_divergent_loop(header));

        info.add_divergent_loop_exit(exit);
        assert!(info.is_divergent_loop_exit(exit));
        assert!(!info.is_kill_exit(exit));
        assert!(info.is_kill_exit(BlockId::from_index(7)));

        info.remove_divergent_loop(header);
        assert!(!info.is_divergent_loop(header));
    }

    #[test]
    fn test_varying_predicate_tristate() {
        let mut info = vi();
        let b = BlockId::from_index(1);
        assert_eq!(info.varying_predicate_flag(b), None);
        info.set_varying_predicate_flag(b, true);
        assert_eq!(info.varying_predicate_flag(b), Some(true));
        info.remove_varying_predicate_flag(b);
        assert_eq!(info.varying_predicate_flag(b), None);
    }

    #[test]
    fn test_observed_shape_in_divergent_loop() {
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

        let dt = DominatorTree::build(&f);
        let loops = LoopForest::compute(&f, &dt);

        let x = f.add_arg(Type::Int);
        let y = f.push_inst(body, crate::ir::Opcode::Add, &[x, x], Type::Int);

        let mut info = vi();
        info.set_shape(y, VectorShape::uni());

        // Loop still uniform: the in-loop shape is visible everywhere.
        assert!(info.observed_shape(&f, &loops, exit, y).is_uniform());

        // Divergent loop: outside observers see varying.
        info.add_divergent_loop(header);
        assert!(info.observed_shape(&f, &loops, exit, y).is_varying());
        assert!(info.observed_shape(&f, &loops, body, y).is_uniform());
        assert!(info.is_temporal_divergent(&f, &loops, exit, y));
    }
}
