//! Error type shared by every layer of the crate.
//!
//! Shape, type and allocation problems are detected when an operation is
//! invoked and returned immediately; nothing is silently truncated or
//! broadcast beyond the documented shape-compatible cases.

use crate::ndarray::DType;

/// All errors that can occur within `ndtape`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Operand shapes are incompatible for the requested operation.
    #[error("shape mismatch in `{op}`: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        /// Operation that rejected the operands.
        op: &'static str,
        /// Shape of the first operand (or the expected shape).
        lhs: Vec<usize>,
        /// Shape of the second operand (or the actual shape).
        rhs: Vec<usize>,
    },

    /// The operation does not support the operand's dtype.
    #[error("`{op}` does not support dtype {dtype:?}")]
    UnsupportedType {
        /// Operation that rejected the operand.
        op: &'static str,
        /// Offending dtype.
        dtype: DType,
    },

    /// An array was read, written or disposed after it had been disposed.
    #[error("array data #{id} used after dispose")]
    UseAfterDispose {
        /// Identifier of the disposed data handle.
        id: usize,
    },

    /// Backward replay visited a tape node out of reverse creation order.
    #[error("tape order violation: expected node {expected:?}, got {got}")]
    TapeOrderViolation {
        /// Node that must be visited next, if any remain.
        expected: Option<usize>,
        /// Node that was requested.
        got: usize,
    },

    /// The tape was used in a state that does not allow the request.
    #[error("tape state error: {0}")]
    TapeState(&'static str),

    /// Scopes were ended out of stack order.
    #[error("scope order violation: innermost scope is depth {innermost}, tried to end depth {depth}")]
    ScopeOrder {
        /// Depth of the innermost open scope.
        innermost: usize,
        /// Depth of the scope that was ended.
        depth: usize,
    },

    /// The scope was already closed by an enclosing scope ending.
    #[error("scope at depth {depth} is already closed")]
    ScopeClosed {
        /// Depth the scope was opened at.
        depth: usize,
    },

    /// Index outside the valid range of an axis or encoding.
    #[error("index {index} out of range [0, {bound})")]
    IndexOutOfRange {
        /// Requested index.
        index: i64,
        /// Exclusive upper bound.
        bound: usize,
    },

    /// A checkpoint variable could not be found.
    #[error("missing checkpoint variable `{0}`")]
    MissingVariable(String),

    /// A sampled event index lies outside the event table.
    #[error("could not decode event index {0}")]
    UndecodableIndex(usize),

    /// Probabilities passed to multinomial sampling are not a distribution.
    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    /// A chord symbol is not part of the chord table.
    #[error("unknown chord `{0}`")]
    UnknownChord(String),

    /// Configuration values are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested compute device cannot be used.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A GPU dispatch or transfer failed.
    #[error("GPU failure: {0}")]
    Gpu(String),
}

impl Error {
    pub(crate) fn shape(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Self {
        Self::ShapeMismatch {
            op,
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        }
    }
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
