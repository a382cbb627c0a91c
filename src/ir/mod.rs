//! SSA IR facade.
//!
//! Everything the vectorizer knows about the program goes through this
//! module:
//!
//! - **Entities** (`entity.rs`): typed handles, pools, side tables, dense
//!   sets
//! - **Function** (`func.rs`): blocks, instructions, use-def chains, mutation
//! - **CFG** (`cfg.rs`): dominator and post-dominator trees, frontiers
//! - **Loops** (`loops.rs`): natural-loop forest and canonical-form queries
//! - **Builder** (`builder.rs`): scoped instruction insertion
//!
//! # Design Principles
//!
//! - **Stable handles**: handles survive CFG surgery (tombstoned rows)
//! - **Consistent edges**: mutators keep use lists and predecessor lists
//!   in sync, so analyses never observe half-updated state
//! - **Explicit staleness**: the dominator tree is either correct or
//!   carries a dirty flag demanding a rebuild

pub mod builder;
pub mod cfg;
pub mod entity;
pub mod func;
pub mod loops;

pub use builder::InsertionBuilder;
pub use cfg::{DominatorTree, PostDominatorTree};
pub use entity::{BlockId, DenseSet, EntityId, Pool, SideTable, ValueId};
pub use func::{BlockData, CmpPred, Function, Inst, Opcode, Type, Value, ValueKind};
pub use loops::{Loop, LoopForest};
