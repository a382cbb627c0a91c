//! Scoped instruction builder.
//!
//! Transforms insert instruction sequences around existing branches; the
//! builder pins an insertion point inside one block and advances it as
//! instructions are created. The cursor lives only in the builder, so
//! dropping it restores the function to cursor-free state - nested builders
//! cannot leave a stale insertion point behind.

use super::entity::{BlockId, ValueId};
use super::func::{CmpPred, Function, Opcode, Type};

/// Builder that inserts instructions at a fixed point in a block.
pub struct InsertionBuilder<'f> {
    func: &'f mut Function,
    block: BlockId,
    index: usize,
}

impl<'f> InsertionBuilder<'f> {
    /// Insert immediately before the block's terminator (or at the end if
    /// the block has none yet).
    pub fn before_terminator(func: &'f mut Function, block: BlockId) -> Self {
        let index = match func.terminator(block) {
            Some(_) => func.block_insts(block).len() - 1,
            None => func.block_insts(block).len(),
        };
        InsertionBuilder { func, block, index }
    }

    /// Insert at the front of the block, after any phis.
    pub fn at_front(func: &'f mut Function, block: BlockId) -> Self {
        let index = func.first_non_phi(block);
        InsertionBuilder { func, block, index }
    }

    /// The block this builder inserts into.
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Access the underlying function.
    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    fn insert(&mut self, op: Opcode, operands: &[ValueId], ty: Type) -> ValueId {
        let id = self.func.insert_inst(self.block, self.index, op, operands, ty);
        self.index += 1;
        id
    }

    /// Bitwise and.
    pub fn and(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::And, &[a, b], ty)
    }

    /// Bitwise or.
    pub fn or(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::Or, &[a, b], ty)
    }

    /// Bitwise xor.
    pub fn xor(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::Xor, &[a, b], ty)
    }

    /// Boolean negation, encoded as xor with all-ones.
    pub fn not(&mut self, a: ValueId) -> ValueId {
        let all_ones = self.func.const_bool(true);
        self.xor(a, all_ones)
    }

    /// Select between two values.
    pub fn select(&mut self, cond: ValueId, on_true: ValueId, on_false: ValueId) -> ValueId {
        let ty = self.func.ty(on_true);
        self.insert(Opcode::Select, &[cond, on_true, on_false], ty)
    }

    /// Integer comparison.
    pub fn icmp(&mut self, pred: CmpPred, a: ValueId, b: ValueId) -> ValueId {
        self.insert(Opcode::Icmp(pred), &[a, b], Type::Bool)
    }

    /// Integer addition.
    pub fn add(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::Add, &[a, b], ty)
    }

    /// Integer subtraction.
    pub fn sub(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::Sub, &[a, b], ty)
    }

    /// Unsigned minimum.
    pub fn umin(&mut self, a: ValueId, b: ValueId) -> ValueId {
        let ty = self.func.ty(a);
        self.insert(Opcode::UMin, &[a, b], ty)
    }

    /// Horizontal any-lane reduction of a predicate.
    pub fn any_lane(&mut self, mask: ValueId) -> ValueId {
        self.insert(Opcode::AnyLane, &[mask], Type::Bool)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_before_terminator() {
        let mut f = Function::new("b");
        let entry = f.create_block("entry");
        f.set_entry(entry);
        let x = f.add_arg(Type::Bool);
        let y = f.add_arg(Type::Bool);
        f.set_ret(entry, None);

        let mut builder = InsertionBuilder::before_terminator(&mut f, entry);
        let a = builder.and(x, y);
        let o = builder.or(a, y);

        let insts = f.block_insts(entry);
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0], a);
        assert_eq!(insts[1], o);
        assert_eq!(f.terminator(entry), Some(insts[2]));
    }

    #[test]
    fn test_not_is_xor_all_ones() {
        let mut f = Function::new("n");
        let entry = f.create_block("entry");
        f.set_entry(entry);
        let x = f.add_arg(Type::Bool);

        let mut builder = InsertionBuilder::before_terminator(&mut f, entry);
        let n = builder.not(x);

        let inst = f.inst(n).unwrap();
        assert_eq!(inst.op, Opcode::Xor);
        assert_eq!(f.as_const_bool(inst.operands[1]), Some(true));
    }

    #[test]
    fn test_at_front_skips_phis() {
        let mut f = Function::new("p");
        let a = f.create_block("a");
        let b = f.create_block("b");
        f.set_entry(a);
        f.set_jump(a, b);
        let c0 = f.const_int(0);
        let phi = f.insert_phi(b, Type::Int, &[(c0, a)]);
        let x = f.add_arg(Type::Bool);

        let mut builder = InsertionBuilder::at_front(&mut f, b);
        let n = builder.not(x);

        let insts = f.block_insts(b);
        assert_eq!(insts[0], phi);
        assert_eq!(insts[1], n);
    }
}
