//! Error types for the SLIM solver.

use thiserror::Error;

/// Result type alias using [`SLIMError`].
pub type Result<T> = std::result::Result<T, SLIMError>;

/// Errors reported by the solver.
///
/// Input errors are raised by [`crate::SLIM::new`] before any work is done. Numerical errors are
/// raised by the global step; the iteration that produced them is discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SLIMError {
    /// No elements were given.
    #[error("mesh has no elements")]
    EmptyMesh,

    /// Elements are neither triangles nor tetrahedra.
    #[error("unsupported element arity {arity} (expected 3 or 4)")]
    UnsupportedArity {
        /// Number of indices of the first element.
        arity: usize,
    },

    /// Elements do not all have the same number of indices.
    #[error("element {element} has {arity} indices, expected {expected}")]
    MixedArity {
        /// The element index.
        element: usize,
        /// Its number of indices.
        arity: usize,
        /// Arity of the first element.
        expected: usize,
    },

    /// An element references a vertex that does not exist.
    #[error("element {element} references invalid vertex index {vertex}")]
    InvalidVertexIndex {
        /// The element index.
        element: usize,
        /// The invalid vertex index.
        vertex: usize,
    },

    /// A soft constraint targets a vertex that does not exist.
    #[error("soft constraint on invalid vertex index {vertex}")]
    InvalidConstraintVertex {
        /// The invalid vertex index.
        vertex: usize,
    },

    /// An element has zero area or volume in the reference shape.
    #[error("element {element} is degenerate")]
    DegenerateElement {
        /// The element index.
        element: usize,
    },

    /// An input array does not have the expected shape.
    #[error("{what}: expected {expected}, found {found}")]
    DimensionMismatch {
        /// What was being checked.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Actual size.
        found: usize,
    },

    /// Invalid option value.
    #[error("invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The invalid value (as string).
        value: String,
        /// Reason the value is invalid.
        reason: &'static str,
    },

    /// A sparse matrix could not be built.
    #[error("invalid sparse structure: {0}")]
    SparseStructure(String),

    /// The sparse Cholesky factorization failed.
    #[error("sparse factorization failed: {0}")]
    Factorization(String),

    /// The system matrix turned out not to be positive definite.
    #[error("system matrix is not positive definite")]
    NotPositiveDefinite,

    /// The iterative solver did not reach the requested tolerance.
    #[error("iterative solver did not converge after {iterations} iterations (residual {residual:e})")]
    NotConverged {
        /// Number of iterations attempted.
        iterations: usize,
        /// Relative residual reached.
        residual: f64,
    },

    /// Solver state was used before [`crate::SLIM::precompute`] built it.
    #[error("solver used before precomputation")]
    NotPrecomputed,

    /// The linear solve produced NaN or infinite positions.
    #[error("linear solve produced non-finite positions")]
    NonFiniteSolution,
}

impl SLIMError {
    /// Create an invalid parameter error.
    pub fn invalid_param<T: std::fmt::Display>(
        name: &'static str,
        value: T,
        reason: &'static str,
    ) -> Self {
        SLIMError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }

    /// Whether this error comes from the linear solve rather than from the input.
    pub fn is_solve_failure(&self) -> bool {
        matches!(
            self,
            SLIMError::Factorization(_)
                | SLIMError::NotPositiveDefinite
                | SLIMError::NotConverged { .. }
                | SLIMError::NonFiniteSolution
        )
    }
}
