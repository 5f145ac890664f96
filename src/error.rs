//! GwError: unified error type for gwflow-sieve public APIs.
//!
//! Every fallible public API in the crate returns `Result<_, GwError>` so
//! callers get non-panicking error handling end to end. Degraded-but-
//! recoverable conditions (degenerate stream segments, skipped clip
//! candidates, solver non-convergence) are *not* errors; they are logged
//! through the `log` facade and execution continues.

use thiserror::Error;

/// Unified error type for gwflow-sieve operations.
#[derive(Debug, Error)]
pub enum GwError {
    /// The stream input file could not be opened or read.
    #[error("cannot open stream file `{path}`: {source}")]
    StreamLoad {
        /// Path of the offending file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A stream record line could not be parsed.
    #[error("malformed stream record on line {line}: {reason}")]
    StreamParse {
        /// 1-based line number in the input.
        line: usize,
        /// What went wrong.
        reason: String,
    },
    /// The constraint set contains a cycle (DOF transitively constrained to itself).
    #[error("constraint cycle detected involving DOF {0}")]
    ConstraintCycle(usize),
    /// The constraint set was used before `close()` or mutated after it.
    #[error("constraint set is {0}")]
    ConstraintsNotReady(&'static str),
    /// A matrix entry outside the sparsity pattern was addressed.
    #[error("matrix entry ({row}, {col}) is not in the sparsity pattern")]
    EntryNotInPattern {
        /// Global row index.
        row: usize,
        /// Global column index.
        col: usize,
    },
    /// A global DOF index outside the current numbering was addressed.
    #[error("DOF index {index} out of range (global size {size})")]
    DofOutOfRange {
        /// Offending global index.
        index: usize,
        /// Global DOF count.
        size: usize,
    },
    /// Geometry input that cannot be processed (wrong vertex count, zero Jacobian, ...).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Refinement/coarsening transaction failure.
    #[error("mesh adaptation failed: {0}")]
    Adaptation(String),
    /// Communication failure in a collective or point-to-point exchange.
    #[error("communication error: {0}")]
    Comm(String),
    /// Output writing failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
