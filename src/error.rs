//! Error types for exactk.

use thiserror::Error;

/// Errors that can occur while building or running a search.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusterError {
    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No documents were supplied.
    #[error("document set is empty")]
    EmptyInput,

    /// A document's dimension differs from the first document's.
    #[error("dimension mismatch at document {index}: expected {expected}, found {found}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    /// Assignment (e.g. a warm start) length differs from the document count.
    #[error("assignment covers {found} documents, expected {expected}")]
    AssignmentMismatch { expected: usize, found: usize },

    /// A node tried to assign a document to a cluster that is neither open
    /// nor the next one to open.
    #[error("cluster index {cluster} out of range ({open} clusters open)")]
    InvalidAssignment { cluster: usize, open: usize },

    /// Opening another cluster would exceed k.
    #[error("cannot open more than {k} clusters")]
    CapacityExceeded { k: usize },

    /// No complete assignment was reached (or the search has not run yet).
    #[error("no solution found")]
    NoSolutionFound,

    /// Task submitted after the executor shut down.
    #[error("executor is closed")]
    ExecutorClosed,

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for exactk operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
