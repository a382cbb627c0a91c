//! Structural transforms of the vectorizer.
//!
//! - `masks`: per-block entry and per-edge mask materialization
//! - `div_loop`: divergent-loop regularization (live mask, trackers)
//! - `linearize`: divergent-branch elimination and phi folding
//! - `remainder`: scalar remainder peeling / tail predication

pub mod div_loop;
pub mod linearize;
pub mod masks;
pub mod remainder;

pub use div_loop::{regularize_divergent_loops, DivLoopStats};
pub use linearize::{create_repair_phi, linearize, LinearizeStats};
pub use masks::{materialize_masks, MaskAssignment, MaskStats};
pub use remainder::{
    apply_uniform_overrides, create_vectorizable_loop, PreparedLoop, RemainderStats,
};
