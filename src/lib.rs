//! Region vectorizer core.
//!
//! The compile-time analyses and transforms that turn a scalar function with
//! divergent, possibly loop-carried control flow into a semantically
//! equivalent function whose control flow is uniform across a SIMD group:
//!
//! - **Shape analysis** (`analysis::shapes`): a fixed-point solver assigning
//!   every value a lane-distribution shape (uniform / affine / varying)
//! - **Branch dependence** (`analysis::divergence`): join-divergent blocks
//!   and divergent loops derived from varying branches
//! - **Divergent-loop transform** (`transform::div_loop`): loops become
//!   single-latch, single-exit, uniform-iteration form with explicit
//!   live-mask and live-out trackers
//! - **Linearizer** (`transform::linearize`): divergent branches fold into
//!   predicated straight-line control; phis become selects
//! - **Remainder transform** (`transform::remainder`): peels a scalar
//!   remainder (or installs tail predication) so the main loop is
//!   guaranteed vectorizable
//!
//! The crate owns its SSA IR facade (`ir`): arena-indexed blocks and
//! instructions, dominator/post-dominator trees and the natural-loop
//! forest. [`pipeline::vectorize_function`] drives the whole thing;
//! [`vecinfo::VectorizationInfo`] is the shared artifact every pass reads
//! and updates and the hand-off to a downstream vector code generator.
//!
//! The core is single-threaded per function and keeps no global state;
//! separate functions may be processed in parallel with separate IR and
//! [`vecinfo::VectorizationInfo`] instances.

pub mod analysis;
pub mod error;
pub mod ir;
pub mod mask;
pub mod pipeline;
pub mod shape;
pub mod transform;
pub mod vecinfo;

pub use error::{VectorizeError, VectorizeResult};
pub use mask::Mask;
pub use pipeline::{
    build_vectorization_info, vectorize_function, VectorizeOptions, VectorizeStats,
};
pub use shape::VectorShape;
pub use vecinfo::{Region, VectorAbi, VectorMapping, VectorizationInfo};
