//! Compile-time analyses of the vectorizer.
//!
//! - `shapes`: fixed-point vectorization shape analysis
//! - `divergence`: branch dependence (join blocks, divergent loops)
//! - `induction`: induction variables and exit conditions for the
//!   remainder transform

pub mod divergence;
pub mod induction;
pub mod shapes;

pub use divergence::{update_loop_divergence, BranchDependence};
pub use induction::{
    analyze_exit_condition, classify_loop_carried, find_induction_variable, ExitCondition,
    InductionVariable, Reduction, ReductionKind,
};
pub use shapes::{run_shape_analysis, ShapeAnalysisStats};
