//! Block-structured SSA function IR.
//!
//! The vectorizer operates on a conventional CFG: blocks own an ordered
//! instruction list (phis first, terminator last), instructions reference
//! operands by value handle, and the function maintains use lists for every
//! value. Terminators are ordinary pooled values so that branches can carry
//! vector shapes like any other instruction.
//!
//! # Design Principles
//!
//! - **Pooled storage**: values and blocks live in dense pools; erased
//!   entities are tombstoned so handles held by the transforms stay stable
//! - **Use-def chains**: every mutation keeps the use lists and predecessor
//!   lists consistent
//! - **No raw pointers**: all cross-references are handles

use super::entity::{BlockId, Pool, SideTable, ValueId};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

// =============================================================================
// Types
// =============================================================================

/// Scalar value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// 1-bit predicate.
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// Pointer.
    Ptr,
}

/// Comparison predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

// =============================================================================
// Opcodes
// =============================================================================

/// Instruction opcodes.
///
/// The set covers what the shape transfer functions dispatch on (§ arithmetic,
/// casts, comparisons, memory, calls) plus the control opcodes the transforms
/// synthesize (selects, mask logic, lane reductions, terminators).
#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    // Arithmetic
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    Shl,
    AShr,

    // Bitwise / boolean
    And,
    Or,
    Xor,
    Not,

    // Comparison
    Icmp(CmpPred),

    // Casts
    ZExt,
    SExt,
    Trunc,

    // Pointer arithmetic: base + index * elem_size
    Gep { elem_size: u64 },

    // Memory
    Alloca { align: u32 },
    Load,
    Store,

    // Data flow
    Phi,
    Select,

    // Calls (resolved through the scalar->vector function map)
    Call { callee: String },

    // Horizontal mask reduction: true iff any lane of the operand is true
    AnyLane,
    // Unsigned minimum (AVL computation for tail predication)
    UMin,

    // Terminators
    Jump,
    Branch,
    Ret,
}

impl Opcode {
    /// Check if this opcode terminates a block.
    #[inline]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Branch | Opcode::Ret)
    }

    /// Check if this opcode has side effects.
    #[inline]
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Opcode::Store | Opcode::Call { .. })
    }
}

// =============================================================================
// Values
// =============================================================================

/// An instruction: opcode, operands, and the block that holds it.
///
/// `blocks` is overloaded by opcode: for a `Phi` it lists the incoming blocks
/// (parallel to `operands`), for `Jump`/`Branch` the successor blocks.
#[derive(Debug, Clone)]
pub struct Inst {
    pub op: Opcode,
    pub operands: SmallVec<[ValueId; 2]>,
    pub blocks: SmallVec<[BlockId; 2]>,
    pub block: BlockId,
}

/// What a value is.
#[derive(Debug, Clone)]
pub enum ValueKind {
    /// Function argument.
    Arg { index: u32 },
    /// Integer literal.
    ConstInt(i64),
    /// Boolean literal.
    ConstBool(bool),
    /// Undefined value of some type.
    Undef,
    /// An instruction.
    Inst(Inst),
    /// Tombstone for an erased instruction.
    Removed,
}

/// A value node: argument, constant or instruction.
#[derive(Debug, Clone)]
pub struct Value {
    pub kind: ValueKind,
    pub ty: Type,
}

// =============================================================================
// Blocks
// =============================================================================

/// A basic block: ordered instruction list plus predecessor edges.
#[derive(Debug, Clone, Default)]
pub struct BlockData {
    pub name: String,
    insts: Vec<ValueId>,
    preds: Vec<BlockId>,
    dead: bool,
}

// =============================================================================
// Function
// =============================================================================

/// An SSA function under vectorization.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    values: Pool<ValueId, Value>,
    blocks: Pool<BlockId, BlockData>,
    uses: SideTable<ValueId, Vec<ValueId>>,
    args: Vec<ValueId>,
    entry: Option<BlockId>,
    int_consts: FxHashMap<i64, ValueId>,
    bool_consts: FxHashMap<bool, ValueId>,
}

impl Function {
    /// Create a new empty function.
    pub fn new(name: impl Into<String>) -> Self {
        Function {
            name: name.into(),
            values: Pool::new(),
            blocks: Pool::new(),
            uses: SideTable::new(Vec::new()),
            args: Vec::new(),
            entry: None,
            int_consts: FxHashMap::default(),
            bool_consts: FxHashMap::default(),
        }
    }

    // =========================================================================
    // Arguments and constants
    // =========================================================================

    /// Append a function argument.
    pub fn add_arg(&mut self, ty: Type) -> ValueId {
        let index = self.args.len() as u32;
        let id = self.values.push(Value {
            kind: ValueKind::Arg { index },
            ty,
        });
        self.args.push(id);
        id
    }

    /// Get the argument list.
    #[inline]
    pub fn args(&self) -> &[ValueId] {
        &self.args
    }

    /// Get (or intern) an integer constant.
    pub fn const_int(&mut self, v: i64) -> ValueId {
        if let Some(&id) = self.int_consts.get(&v) {
            return id;
        }
        let id = self.values.push(Value {
            kind: ValueKind::ConstInt(v),
            ty: Type::Int,
        });
        self.int_consts.insert(v, id);
        id
    }

    /// Get (or intern) a boolean constant.
    pub fn const_bool(&mut self, v: bool) -> ValueId {
        if let Some(&id) = self.bool_consts.get(&v) {
            return id;
        }
        let id = self.values.push(Value {
            kind: ValueKind::ConstBool(v),
            ty: Type::Bool,
        });
        self.bool_consts.insert(v, id);
        id
    }

    /// Create an undef value of the given type.
    pub fn undef(&mut self, ty: Type) -> ValueId {
        self.values.push(Value {
            kind: ValueKind::Undef,
            ty,
        })
    }

    // =========================================================================
    // Value access
    // =========================================================================

    /// Get a value.
    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id]
    }

    /// Total number of value slots (including tombstones).
    #[inline]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Iterate over all value ids (including tombstones).
    pub fn value_ids(&self) -> impl Iterator<Item = ValueId> {
        self.values.keys()
    }

    /// Get the instruction payload of a value, if it is an instruction.
    #[inline]
    pub fn inst(&self, id: ValueId) -> Option<&Inst> {
        match &self.values[id].kind {
            ValueKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    fn inst_mut(&mut self, id: ValueId) -> &mut Inst {
        match &mut self.values[id].kind {
            ValueKind::Inst(inst) => inst,
            _ => panic!("{id} is not an instruction"),
        }
    }

    /// Check if a value is an instruction.
    #[inline]
    pub fn is_inst(&self, id: ValueId) -> bool {
        matches!(self.values[id].kind, ValueKind::Inst(_))
    }

    /// Check if a value is a phi.
    #[inline]
    pub fn is_phi(&self, id: ValueId) -> bool {
        self.inst(id).is_some_and(|i| i.op == Opcode::Phi)
    }

    /// The block defining an instruction, if the value is one.
    #[inline]
    pub fn def_block(&self, id: ValueId) -> Option<BlockId> {
        self.inst(id).map(|i| i.block)
    }

    /// Get a value's type.
    #[inline]
    pub fn ty(&self, id: ValueId) -> Type {
        self.values[id].ty
    }

    /// Get a value as an integer constant.
    pub fn as_const_int(&self, id: ValueId) -> Option<i64> {
        match self.values[id].kind {
            ValueKind::ConstInt(v) => Some(v),
            _ => None,
        }
    }

    /// Get a value as a boolean constant.
    pub fn as_const_bool(&self, id: ValueId) -> Option<bool> {
        match self.values[id].kind {
            ValueKind::ConstBool(v) => Some(v),
            _ => None,
        }
    }

    /// Check if a value is any constant or undef (no defining instruction).
    pub fn is_const_like(&self, id: ValueId) -> bool {
        matches!(
            self.values[id].kind,
            ValueKind::ConstInt(_) | ValueKind::ConstBool(_) | ValueKind::Undef
        )
    }

    /// Values using `id` as an operand.
    #[inline]
    pub fn uses(&self, id: ValueId) -> &[ValueId] {
        self.uses.get(id)
    }

    fn add_use(&mut self, used: ValueId, user: ValueId) {
        self.uses.row_mut(used).push(user);
    }

    fn remove_use(&mut self, used: ValueId, user: ValueId) {
        let list = self.uses.row_mut(used);
        if let Some(pos) = list.iter().position(|&u| u == user) {
            list.swap_remove(pos);
        }
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Create a new empty block.
    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        self.blocks.push(BlockData {
            name: name.into(),
            insts: Vec::new(),
            preds: Vec::new(),
            dead: false,
        })
    }

    /// Set the entry block.
    pub fn set_entry(&mut self, block: BlockId) {
        self.entry = Some(block);
    }

    /// Get the entry block.
    #[inline]
    pub fn entry(&self) -> BlockId {
        self.entry.expect("entry block not set")
    }

    /// Get a block's name.
    #[inline]
    pub fn block_name(&self, block: BlockId) -> &str {
        &self.blocks[block].name
    }

    /// Iterate over all live blocks.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks
            .iter()
            .filter(|(_, b)| !b.dead)
            .map(|(id, _)| id)
    }

    /// Total number of block slots (including dead ones).
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Check whether a block has been erased.
    #[inline]
    pub fn is_block_dead(&self, block: BlockId) -> bool {
        self.blocks[block].dead
    }

    /// The ordered instruction list of a block.
    #[inline]
    pub fn block_insts(&self, block: BlockId) -> &[ValueId] {
        &self.blocks[block].insts
    }

    /// The phis at the head of a block.
    pub fn block_phis(&self, block: BlockId) -> Vec<ValueId> {
        self.blocks[block]
            .insts
            .iter()
            .copied()
            .take_while(|&v| self.is_phi(v))
            .collect()
    }

    /// Index of the first non-phi instruction.
    pub fn first_non_phi(&self, block: BlockId) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .take_while(|&&v| self.is_phi(v))
            .count()
    }

    /// Predecessor blocks (one entry per incoming edge).
    #[inline]
    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block].preds
    }

    /// Successor blocks of a block's terminator.
    pub fn succs(&self, block: BlockId) -> SmallVec<[BlockId; 2]> {
        match self.terminator(block).and_then(|t| self.inst(t)) {
            Some(inst) if inst.op.is_terminator() => inst.blocks.clone(),
            _ => SmallVec::new(),
        }
    }

    /// The block's terminator instruction, if it has one.
    pub fn terminator(&self, block: BlockId) -> Option<ValueId> {
        let last = *self.blocks[block].insts.last()?;
        let inst = self.inst(last)?;
        inst.op.is_terminator().then_some(last)
    }

    // =========================================================================
    // Instruction creation
    // =========================================================================

    fn new_inst(
        &mut self,
        block: BlockId,
        op: Opcode,
        operands: SmallVec<[ValueId; 2]>,
        blocks: SmallVec<[BlockId; 2]>,
        ty: Type,
    ) -> ValueId {
        let id = self.values.push(Value {
            kind: ValueKind::Inst(Inst {
                op,
                operands: operands.clone(),
                blocks,
                block,
            }),
            ty,
        });
        for &operand in &operands {
            self.add_use(operand, id);
        }
        id
    }

    /// Insert a new instruction at `index` within `block`.
    pub fn insert_inst(
        &mut self,
        block: BlockId,
        index: usize,
        op: Opcode,
        operands: &[ValueId],
        ty: Type,
    ) -> ValueId {
        debug_assert!(!op.is_terminator() && op != Opcode::Phi);
        let id = self.new_inst(block, op, SmallVec::from_slice(operands), SmallVec::new(), ty);
        self.blocks[block].insts.insert(index, id);
        id
    }

    /// Append a new instruction before the block's terminator (or at the end
    /// if the block has none yet).
    pub fn push_inst(
        &mut self,
        block: BlockId,
        op: Opcode,
        operands: &[ValueId],
        ty: Type,
    ) -> ValueId {
        let index = match self.terminator(block) {
            Some(_) => self.blocks[block].insts.len() - 1,
            None => self.blocks[block].insts.len(),
        };
        self.insert_inst(block, index, op, operands, ty)
    }

    /// Insert a phi at the head of `block` (after any existing phis).
    pub fn insert_phi(
        &mut self,
        block: BlockId,
        ty: Type,
        incoming: &[(ValueId, BlockId)],
    ) -> ValueId {
        let operands: SmallVec<[ValueId; 2]> = incoming.iter().map(|&(v, _)| v).collect();
        let blocks: SmallVec<[BlockId; 2]> = incoming.iter().map(|&(_, b)| b).collect();
        let id = self.new_inst(block, Opcode::Phi, operands, blocks, ty);
        let at = self.first_non_phi(block);
        self.blocks[block].insts.insert(at, id);
        id
    }

    // =========================================================================
    // Terminators
    // =========================================================================

    fn clear_terminator(&mut self, block: BlockId) {
        if let Some(term) = self.terminator(block) {
            let succs = self.inst(term).unwrap().blocks.clone();
            for succ in succs {
                self.remove_pred(succ, block);
            }
            self.erase_from_block_only(term);
        }
    }

    fn remove_pred(&mut self, block: BlockId, pred: BlockId) {
        let preds = &mut self.blocks[block].preds;
        if let Some(pos) = preds.iter().position(|&p| p == pred) {
            preds.remove(pos);
        }
    }

    fn set_terminator(
        &mut self,
        block: BlockId,
        op: Opcode,
        operands: &[ValueId],
        succs: &[BlockId],
    ) -> ValueId {
        self.clear_terminator(block);
        let id = self.new_inst(
            block,
            op,
            SmallVec::from_slice(operands),
            SmallVec::from_slice(succs),
            Type::Bool,
        );
        self.blocks[block].insts.push(id);
        for &succ in succs {
            self.blocks[succ].preds.push(block);
        }
        id
    }

    /// Terminate `block` with an unconditional jump.
    pub fn set_jump(&mut self, block: BlockId, target: BlockId) -> ValueId {
        self.set_terminator(block, Opcode::Jump, &[], &[target])
    }

    /// Terminate `block` with a conditional branch.
    pub fn set_branch(
        &mut self,
        block: BlockId,
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    ) -> ValueId {
        self.set_terminator(block, Opcode::Branch, &[cond], &[on_true, on_false])
    }

    /// Terminate `block` with a return.
    pub fn set_ret(&mut self, block: BlockId, value: Option<ValueId>) -> ValueId {
        match value {
            Some(v) => self.set_terminator(block, Opcode::Ret, &[v], &[]),
            None => self.set_terminator(block, Opcode::Ret, &[], &[]),
        }
    }

    /// Redirect every `from` successor of `block`'s terminator to `to`,
    /// keeping predecessor lists consistent.
    pub fn replace_successor(&mut self, block: BlockId, from: BlockId, to: BlockId) {
        let Some(term) = self.terminator(block) else {
            return;
        };
        let mut replaced = 0;
        {
            let inst = self.inst_mut(term);
            for succ in inst.blocks.iter_mut() {
                if *succ == from {
                    *succ = to;
                    replaced += 1;
                }
            }
        }
        for _ in 0..replaced {
            self.remove_pred(from, block);
            self.blocks[to].preds.push(block);
        }
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Replace operand `index` of an instruction.
    pub fn set_operand(&mut self, inst: ValueId, index: usize, new: ValueId) {
        let old = self.inst_mut(inst).operands[index];
        if old == new {
            return;
        }
        self.inst_mut(inst).operands[index] = new;
        self.remove_use(old, inst);
        self.add_use(new, inst);
    }

    /// Replace all uses of `old` with `new`.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        let users: Vec<ValueId> = self.uses(old).to_vec();
        for user in users {
            let indices: Vec<usize> = self
                .inst(user)
                .map(|i| {
                    i.operands
                        .iter()
                        .enumerate()
                        .filter(|&(_, &op)| op == old)
                        .map(|(idx, _)| idx)
                        .collect()
                })
                .unwrap_or_default();
            for idx in indices {
                self.set_operand(user, idx, new);
            }
        }
    }

    fn erase_from_block_only(&mut self, inst: ValueId) {
        let block = self.inst(inst).unwrap().block;
        let insts = &mut self.blocks[block].insts;
        if let Some(pos) = insts.iter().position(|&i| i == inst) {
            insts.remove(pos);
        }
        let operands = self.inst(inst).unwrap().operands.clone();
        for operand in operands {
            self.remove_use(operand, inst);
        }
        self.values[inst].kind = ValueKind::Removed;
    }

    /// Erase an instruction. The instruction must have no remaining uses;
    /// erasing a terminator also detaches its successor edges.
    pub fn erase_inst(&mut self, inst: ValueId) {
        debug_assert!(self.uses(inst).is_empty(), "erasing {inst} with live uses");
        if self
            .inst(inst)
            .is_some_and(|i| i.op.is_terminator() && !i.blocks.is_empty())
        {
            let block = self.inst(inst).unwrap().block;
            self.clear_terminator(block);
        } else {
            self.erase_from_block_only(inst);
        }
    }

    /// Erase a block that has no predecessors and no instructions left.
    pub fn erase_block(&mut self, block: BlockId) {
        debug_assert!(self.blocks[block].preds.is_empty());
        self.clear_terminator(block);
        let insts = std::mem::take(&mut self.blocks[block].insts);
        for inst in insts {
            self.erase_from_block_only(inst);
        }
        self.blocks[block].dead = true;
    }

    /// Move an instruction to the front of another block (after its phis).
    pub fn move_to_block_front(&mut self, inst: ValueId, dest: BlockId) {
        let src = self.inst(inst).unwrap().block;
        let insts = &mut self.blocks[src].insts;
        if let Some(pos) = insts.iter().position(|&i| i == inst) {
            insts.remove(pos);
        }
        let at = self.first_non_phi(dest);
        self.blocks[dest].insts.insert(at, inst);
        self.inst_mut(inst).block = dest;
    }

    // =========================================================================
    // Phi edges
    // =========================================================================

    /// The (value, block) incoming pairs of a phi.
    pub fn phi_incoming(&self, phi: ValueId) -> Vec<(ValueId, BlockId)> {
        let inst = self.inst(phi).expect("not a phi");
        debug_assert_eq!(inst.op, Opcode::Phi);
        inst.operands
            .iter()
            .copied()
            .zip(inst.blocks.iter().copied())
            .collect()
    }

    /// Index of the incoming edge from `block`, if the phi lists it.
    pub fn phi_incoming_index(&self, phi: ValueId, block: BlockId) -> Option<usize> {
        self.inst(phi)
            .and_then(|i| i.blocks.iter().position(|&b| b == block))
    }

    /// Append an incoming edge to a phi.
    pub fn add_phi_incoming(&mut self, phi: ValueId, value: ValueId, block: BlockId) {
        self.inst_mut(phi).operands.push(value);
        self.inst_mut(phi).blocks.push(block);
        self.add_use(value, phi);
    }

    /// Replace the incoming value at `index`.
    pub fn set_phi_incoming_value(&mut self, phi: ValueId, index: usize, value: ValueId) {
        self.set_operand(phi, index, value);
    }

    /// Replace the incoming block at `index`.
    pub fn set_phi_incoming_block(&mut self, phi: ValueId, index: usize, block: BlockId) {
        self.inst_mut(phi).blocks[index] = block;
    }

    /// Remove the incoming edge at `index`.
    pub fn remove_phi_incoming(&mut self, phi: ValueId, index: usize) {
        let value = self.inst(phi).unwrap().operands[index];
        self.inst_mut(phi).operands.remove(index);
        self.inst_mut(phi).blocks.remove(index);
        self.remove_use(value, phi);
    }

    // =========================================================================
    // Cloning (remainder transform)
    // =========================================================================

    /// Clone a set of blocks, remapping intra-set operands, phi edges and
    /// successor edges. References to values and blocks outside the set are
    /// left untouched. Returns the value and block maps.
    pub fn clone_blocks(
        &mut self,
        blocks: &[BlockId],
        suffix: &str,
    ) -> (FxHashMap<ValueId, ValueId>, FxHashMap<BlockId, BlockId>) {
        let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
        for &b in blocks {
            let name = format!("{}{}", self.blocks[b].name, suffix);
            let nb = self.create_block(name);
            block_map.insert(b, nb);
        }

        let mut value_map: FxHashMap<ValueId, ValueId> = FxHashMap::default();
        // First pass: allocate clones so forward references (phis) resolve.
        for &b in blocks {
            for &inst in self.blocks[b].insts.clone().iter() {
                let src = self.inst(inst).unwrap().clone();
                let ty = self.values[inst].ty;
                let id = self.values.push(Value {
                    kind: ValueKind::Inst(Inst {
                        op: src.op,
                        operands: SmallVec::new(),
                        blocks: SmallVec::new(),
                        block: block_map[&b],
                    }),
                    ty,
                });
                value_map.insert(inst, id);
            }
        }
        // Second pass: fill in remapped operands and edges.
        for &b in blocks {
            let nb = block_map[&b];
            for &inst in self.blocks[b].insts.clone().iter() {
                let src = self.inst(inst).unwrap().clone();
                let clone_id = value_map[&inst];
                let operands: SmallVec<[ValueId; 2]> = src
                    .operands
                    .iter()
                    .map(|v| value_map.get(v).copied().unwrap_or(*v))
                    .collect();
                let edges: SmallVec<[BlockId; 2]> = src
                    .blocks
                    .iter()
                    .map(|blk| block_map.get(blk).copied().unwrap_or(*blk))
                    .collect();
                for &operand in &operands {
                    self.add_use(operand, clone_id);
                }
                if src.op.is_terminator() {
                    for &succ in &edges {
                        self.blocks[succ].preds.push(nb);
                    }
                }
                {
                    let inst_data = self.inst_mut(clone_id);
                    inst_data.operands = operands;
                    inst_data.blocks = edges;
                }
                self.blocks[nb].insts.push(clone_id);
            }
        }
        (value_map, block_map)
    }
}

// =============================================================================
// Tests
// =============================================================================
