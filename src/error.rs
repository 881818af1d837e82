//! Error taxonomy for operator and kernel setup.
//!
//! Everything in here is a configuration error: a missing or ambiguous
//! kernel registration, malformed shapes handed to inference, an argument
//! the operator never declared. They surface while a graph is being built
//! or a kernel is being bound, never from inside a compiled kernel's
//! numeric loop. There is no recovery path inside this crate; the caller
//! is expected to abort graph construction with the message.

use thiserror::Error;

use crate::device::DeviceType;
use crate::dtype::DataType;

/// Errors raised while describing, resolving or binding operators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    /// No operator factory is registered for this type name.
    #[error("unknown operator type `{0}`")]
    UnknownOpType(String),

    /// Zero kernel registrations matched.
    #[error("no kernel registered for `{op_type}` matching {context}")]
    MissingKernel {
        /// Operator type name.
        op_type: String,
        /// Device and argument data types that were looked up.
        context: String,
    },

    /// More than one kernel registration matched.
    #[error("ambiguous kernel for `{op_type}` matching {context}: {count} candidates [{candidates}]")]
    AmbiguousKernel {
        /// Operator type name.
        op_type: String,
        /// Device and argument data types that were looked up.
        context: String,
        /// Number of matching registrations.
        count: usize,
        /// Matcher descriptions of the matching registrations.
        candidates: String,
    },

    /// An argument name/index the operator never declared.
    #[error("operator `{op}` has no argument `{arg}` at index {index}")]
    UnknownArg {
        /// Operator name or type.
        op: String,
        /// Argument name.
        arg: String,
        /// Argument index.
        index: usize,
    },

    /// A declared argument that was not supplied.
    #[error("operator `{op}` is missing argument `{arg}`: {reason}")]
    MissingArg {
        /// Operator name or type.
        op: String,
        /// Argument name (or blob name).
        arg: String,
        /// What was expected.
        reason: String,
    },

    /// A mutable tensor or the temp buffer was requested twice in one call.
    #[error("argument `{arg}` of `{op}` was already taken in this compute call")]
    ArgAlreadyTaken {
        /// Operator name.
        op: String,
        /// Blob name.
        arg: String,
    },

    /// An output was requested through the read-only input accessor.
    #[error("argument `{arg}` of `{op}` is an output; take it with `tensor_mut`")]
    OutputReadAsInput {
        /// Operator name.
        op: String,
        /// Blob name.
        arg: String,
    },

    /// Malformed shape: negative extents, overflowing element counts.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Shapes that must agree do not.
    #[error("shape mismatch in `{op}`: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Operator name or type.
        op: String,
        /// Expected shape or constraint.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// A tensor was read with the wrong element type, or inputs disagree.
    #[error("data type mismatch in `{op}`: expected {expected}, got {actual}")]
    DataTypeMismatch {
        /// Operator name or type, or the blob being read.
        op: String,
        /// Expected data type.
        expected: DataType,
        /// Actual data type.
        actual: DataType,
    },

    /// A required attribute is absent from the configuration.
    #[error("operator `{op}` has no attribute `{attr}`")]
    MissingAttr {
        /// Operator name.
        op: String,
        /// Attribute name.
        attr: String,
    },

    /// An attribute holds a different type than requested.
    #[error("attribute `{attr}` of `{op}` is {actual}, not {expected}")]
    AttrTypeMismatch {
        /// Operator name.
        op: String,
        /// Attribute name.
        attr: String,
        /// Requested type.
        expected: &'static str,
        /// Stored type.
        actual: &'static str,
    },

    /// A parallelization signature that cannot be satisfied.
    #[error("invalid sbp signature for `{op}`: {reason}")]
    InvalidSbpSignature {
        /// Operator name or type.
        op: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The bound temp buffer is smaller than the inferred size.
    #[error("temp buffer too small: requested {requested} bytes, {available} available")]
    TmpBufferTooSmall {
        /// Bytes requested.
        requested: usize,
        /// Bytes left in the buffer.
        available: usize,
    },

    /// A kernel compiled for one device was launched on another.
    #[error("kernel for `{op}` was compiled for {expected} but launched on {actual}")]
    DeviceMismatch {
        /// Operator name.
        op: String,
        /// Compiled device.
        expected: DeviceType,
        /// Launch device.
        actual: DeviceType,
    },

    /// A placeholder path that was actually exercised.
    #[error("`{op}` does not implement {what}")]
    Unimplemented {
        /// Operator type.
        op: String,
        /// The missing capability.
        what: &'static str,
    },
}

impl OpError {
    /// Shorthand for [`OpError::ShapeMismatch`].
    pub fn shape_mismatch(
        op: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            op: op.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Shorthand for [`OpError::InvalidSbpSignature`].
    pub fn invalid_sbp(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSbpSignature {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = OpError> = core::result::Result<T, E>;
