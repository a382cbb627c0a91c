//! Composite execution mask.
//!
//! A mask is the pair of a boolean-vector predicate and an active vector
//! length (AVL). Either component may be absent: a missing predicate means
//! all lanes, a missing AVL means all lanes up to the vector width. Both
//! components are held as stable value ids into the function arena, so masks
//! survive CFG surgery without dangling.

use crate::ir::{Function, ValueId};

/// Predicate x AVL pair guarding a block or edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mask {
    predicate: Option<ValueId>,
    avl: Option<ValueId>,
}

impl Mask {
    /// All lanes enabled.
    #[inline]
    pub fn all_true() -> Self {
        Mask {
            predicate: None,
            avl: None,
        }
    }

    /// Construct from both components.
    pub fn new(predicate: Option<ValueId>, avl: Option<ValueId>) -> Self {
        Mask { predicate, avl }
    }

    /// Best-effort inference from an i1 predicate: a literal true folds to
    /// the all-true mask.
    pub fn infer_from_predicate(func: &Function, predicate: ValueId) -> Self {
        if func.as_const_bool(predicate) == Some(true) {
            return Mask::all_true();
        }
        Mask {
            predicate: Some(predicate),
            avl: None,
        }
    }

    /// Construct a mask from an AVL value alone.
    pub fn from_vector_length(avl: ValueId) -> Self {
        Mask {
            predicate: None,
            avl: Some(avl),
        }
    }

    /// The predicate component.
    #[inline]
    pub fn predicate(&self) -> Option<ValueId> {
        self.predicate
    }

    /// Replace the predicate component.
    pub fn set_predicate(&mut self, predicate: Option<ValueId>) {
        self.predicate = predicate;
    }

    /// The AVL component.
    #[inline]
    pub fn avl(&self) -> Option<ValueId> {
        self.avl
    }

    /// Replace the AVL component.
    pub fn set_avl(&mut self, avl: Option<ValueId>) {
        self.avl = avl;
    }

    /// Best effort: all lanes statically known active.
    pub fn known_all_true(&self, func: &Function) -> bool {
        let pred_true = match self.predicate {
            None => true,
            Some(p) => func.as_const_bool(p) == Some(true),
        };
        pred_true && self.avl.is_none()
    }

    /// Best effort: all lanes statically known inactive.
    pub fn known_all_false(&self, func: &Function) -> bool {
        match self.predicate {
            Some(p) => func.as_const_bool(p) == Some(false),
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn test_all_true() {
        let f = Function::new("m");
        let m = Mask::all_true();
        assert!(m.known_all_true(&f));
        assert!(!m.known_all_false(&f));
    }

    #[test]
    fn test_infer_from_constant_predicate() {
        let mut f = Function::new("m");
        let t = f.const_bool(true);
        let m = Mask::infer_from_predicate(&f, t);
        assert_eq!(m, Mask::all_true());

        let fa = f.const_bool(false);
        let m = Mask::infer_from_predicate(&f, fa);
        assert!(m.known_all_false(&f));
        assert!(!m.known_all_true(&f));
    }

    #[test]
    fn test_component_equality() {
        let mut f = Function::new("m");
        let p = f.add_arg(Type::Bool);
        let q = f.add_arg(Type::Bool);
        let a = Mask::new(Some(p), None);
        let b = Mask::new(Some(p), None);
        let c = Mask::new(Some(q), None);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_avl_blocks_known_all_true() {
        let mut f = Function::new("m");
        let n = f.add_arg(Type::Int);
        let m = Mask::from_vector_length(n);
        assert!(!m.known_all_true(&f));
        assert_eq!(m.avl(), Some(n));
        assert_eq!(m.predicate(), None);
    }
}
