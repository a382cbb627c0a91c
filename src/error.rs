//! Pipeline errors.
//!
//! Two kinds matter: *capability* errors (the input is outside the supported
//! subset; the caller falls back to the scalar function) and *invariant*
//! errors (internal bugs; they abort in debug builds and degrade to a
//! capability-style failure in release builds). Shape-inference pessimism is
//! never an error: unknown shapes fall to varying and propagate.

use thiserror::Error;

/// Why vectorization was abandoned for a function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VectorizeError {
    /// The input is outside the supported subset.
    #[error("unsupported input: {reason}")]
    Capability { reason: String },

    /// An internal invariant was violated (a bug).
    #[error("internal invariant violated: {detail}")]
    Invariant { detail: String },
}

impl VectorizeError {
    /// Build a capability error.
    pub fn capability(reason: impl Into<String>) -> Self {
        VectorizeError::Capability {
            reason: reason.into(),
        }
    }

    /// Build an invariant violation. Aborts in debug builds.
    pub fn invariant(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        debug_assert!(false, "invariant violated: {detail}");
        VectorizeError::Invariant { detail }
    }
}

/// Pipeline result alias.
pub type VectorizeResult<T> = Result<T, VectorizeError>;
