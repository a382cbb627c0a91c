//! Entity handles and dense side storage.
//!
//! IR entities (values, blocks) are named by compact typed handles and
//! stored in dense pools indexed by them. Handles are 1-based over a
//! `NonZeroU32`, so an `Option<ValueId>` costs nothing extra - absent
//! operands and unset links stay pointer-free. A handle stays meaningful
//! across CFG surgery: pools never move rows, erased entities are
//! tombstoned by their owner.
//!
//! - **`ValueId` / `BlockId`**: the handle types, printed as `v12` / `b3`
//! - **`Pool<K, V>`**: append-only dense storage, one row per handle
//! - **`SideTable<K, V>`**: analysis data attached to entities; rows that
//!   were never written read back as the table's default
//! - **`DenseSet<K>`**: a bit set over handles

use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};

// =============================================================================
// Entity handles
// =============================================================================

/// A compact, typed handle to an IR entity.
pub trait EntityId: Copy + Eq {
    /// Make the handle for a dense index.
    fn from_index(index: usize) -> Self;

    /// The dense index this handle names.
    fn index(self) -> usize;
}

macro_rules! entity_id {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(NonZeroU32);

        impl EntityId for $name {
            #[inline]
            fn from_index(index: usize) -> Self {
                debug_assert!(index < u32::MAX as usize);
                $name(NonZeroU32::new(index as u32 + 1).expect("index + 1 is nonzero"))
            }

            #[inline]
            fn index(self) -> usize {
                self.0.get() as usize - 1
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.index())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.index())
            }
        }
    };
}

entity_id!(
    /// Handle of a value (argument, constant or instruction).
    ValueId,
    "v"
);

entity_id!(
    /// Handle of a basic block.
    BlockId,
    "b"
);

// =============================================================================
// Pool
// =============================================================================

/// Dense append-only storage for one kind of IR entity.
///
/// Rows are addressed by handle and never move; `push` hands out the next
/// handle.
#[derive(Debug, Clone)]
pub struct Pool<K, V> {
    rows: Vec<V>,
    _key: PhantomData<fn(K) -> K>,
}

impl<K: EntityId, V> Pool<K, V> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Pool {
            rows: Vec::new(),
            _key: PhantomData,
        }
    }

    /// Store a new row, returning its handle.
    pub fn push(&mut self, row: V) -> K {
        let key = K::from_index(self.rows.len());
        self.rows.push(row);
        key
    }

    /// Look up a row.
    #[inline]
    pub fn get(&self, key: K) -> Option<&V> {
        self.rows.get(key.index())
    }

    /// Number of rows ever stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the pool has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All handles, in allocation order.
    pub fn keys(&self) -> impl Iterator<Item = K> {
        (0..self.rows.len()).map(K::from_index)
    }

    /// All rows with their handles.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, row)| (K::from_index(i), row))
    }
}

impl<K: EntityId, V> Default for Pool<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EntityId, V> Index<K> for Pool<K, V> {
    type Output = V;

    #[inline]
    fn index(&self, key: K) -> &V {
        &self.rows[key.index()]
    }
}

impl<K: EntityId, V> IndexMut<K> for Pool<K, V> {
    #[inline]
    fn index_mut(&mut self, key: K) -> &mut V {
        &mut self.rows[key.index()]
    }
}

// =============================================================================
// Side table
// =============================================================================

/// Analysis data attached to entities, growing on demand.
///
/// The table carries its own default row; handles that were never written
/// read back as that default, so consumers need no presence checks.
#[derive(Debug, Clone)]
pub struct SideTable<K, V> {
    rows: Vec<V>,
    default: V,
    _key: PhantomData<fn(K) -> K>,
}

impl<K: EntityId, V: Clone> SideTable<K, V> {
    /// Create a table whose unwritten rows read as `default`.
    pub fn new(default: V) -> Self {
        SideTable {
            rows: Vec::new(),
            default,
            _key: PhantomData,
        }
    }

    /// Read the row for a handle.
    #[inline]
    pub fn get(&self, key: K) -> &V {
        self.rows.get(key.index()).unwrap_or(&self.default)
    }

    /// Overwrite the row for a handle.
    pub fn set(&mut self, key: K, row: V) {
        self.grow_to(key);
        self.rows[key.index()] = row;
    }

    /// Mutable access to the row for a handle, materializing it if needed.
    pub fn row_mut(&mut self, key: K) -> &mut V {
        self.grow_to(key);
        &mut self.rows[key.index()]
    }

    fn grow_to(&mut self, key: K) {
        if key.index() >= self.rows.len() {
            self.rows.resize(key.index() + 1, self.default.clone());
        }
    }
}

// =============================================================================
// Dense set
// =============================================================================

/// A bit set over entity handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseSet<K> {
    words: Vec<u64>,
    _key: PhantomData<fn(K) -> K>,
}

impl<K: EntityId> DenseSet<K> {
    /// Create an empty set.
    pub fn new() -> Self {
        DenseSet {
            words: Vec::new(),
            _key: PhantomData,
        }
    }

    /// Create a set with room for `n` entities.
    pub fn with_capacity(n: usize) -> Self {
        DenseSet {
            words: vec![0; n.div_ceil(64)],
            _key: PhantomData,
        }
    }

    #[inline]
    fn slot(key: K) -> (usize, u64) {
        (key.index() / 64, 1u64 << (key.index() % 64))
    }

    /// Add a handle; returns true if it was not yet in the set.
    pub fn insert(&mut self, key: K) -> bool {
        let (word, bit) = Self::slot(key);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }

    /// Drop a handle from the set.
    pub fn remove(&mut self, key: K) {
        let (word, bit) = Self::slot(key);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !bit;
        }
    }

    /// Check membership.
    #[inline]
    pub fn contains(&self, key: K) -> bool {
        let (word, bit) = Self::slot(key);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    /// Number of handles in the set.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Iterate over members in handle order.
    pub fn iter(&self) -> impl Iterator<Item = K> + '_ {
        self.words.iter().enumerate().flat_map(|(word, &bits)| {
            let mut rest = bits;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let low = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(K::from_index(word * 64 + low))
            })
        })
    }
}

impl<K: EntityId> Default for DenseSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_one_based() {
        let v = ValueId::from_index(0);
        assert_eq!(v.index(), 0);
        assert_eq!(format!("{v}"), "v0");

        let b = BlockId::from_index(41);
        assert_eq!(b.index(), 41);
        assert_eq!(format!("{b:?}"), "b41");
    }

    #[test]
    fn test_option_handle_is_free() {
        assert_eq!(
            std::mem::size_of::<Option<ValueId>>(),
            std::mem::size_of::<ValueId>()
        );
    }

    #[test]
    fn test_pool_push_and_index() {
        let mut pool: Pool<ValueId, i32> = Pool::new();
        let a = pool.push(10);
        let b = pool.push(20);

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(pool[a], 10);

        pool[b] = 200;
        assert_eq!(pool[b], 200);
        assert_eq!(pool.len(), 2);

        let keys: Vec<_> = pool.keys().collect();
        assert_eq!(keys, vec![a, b]);
    }

    #[test]
    fn test_side_table_default_rows() {
        let mut table: SideTable<BlockId, u32> = SideTable::new(7);
        let near = BlockId::from_index(1);
        let far = BlockId::from_index(9);

        assert_eq!(*table.get(far), 7);
        table.set(near, 3);
        assert_eq!(*table.get(near), 3);
        // Rows materialized by growth still read as the default.
        assert_eq!(*table.get(BlockId::from_index(0)), 7);

        *table.row_mut(far) += 1;
        assert_eq!(*table.get(far), 8);
    }

    #[test]
    fn test_dense_set_membership() {
        let mut set: DenseSet<BlockId> = DenseSet::new();
        assert!(set.insert(BlockId::from_index(0)));
        assert!(set.insert(BlockId::from_index(63)));
        assert!(set.insert(BlockId::from_index(64)));
        assert!(!set.insert(BlockId::from_index(64)));

        assert!(set.contains(BlockId::from_index(63)));
        assert!(!set.contains(BlockId::from_index(1)));
        assert_eq!(set.len(), 3);

        set.remove(BlockId::from_index(63));
        assert!(!set.contains(BlockId::from_index(63)));

        let members: Vec<usize> = set.iter().map(|b| b.index()).collect();
        assert_eq!(members, vec![0, 64]);
    }
}
