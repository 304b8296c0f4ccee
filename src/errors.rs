//! Errors reported by ragged tensor operations.

use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::ops::OpError;
use crate::value::{CastError, DataType, Value, ValueMeta};

/// Errors that occur when constructing, converting or running operations on
/// a [`RaggedTensor`](crate::RaggedTensor).
///
/// Operations either succeed for every entry or fail as a whole. A failed
/// operation never returns a partially updated container.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum RaggedError {
    /// Operands disagree in entry count, grouping, inner rank or extents, or
    /// an explicit shape is incompatible with a container.
    ShapeMismatch(String),

    /// Entries within one container disagree in rank.
    RankMismatch {
        /// Index of the first entry whose rank differs.
        entry: usize,
        expected: usize,
        actual: usize,
    },

    /// A dimension index is outside the total rank of a container.
    DimensionOutOfRange { dim: usize, ndim: usize },

    /// Attempted to reduce over a structural dimension.
    InvalidReduction { dim: usize, nesting_depth: usize },

    /// A validity mask does not describe a prefix box for every entry.
    MalformedMask(String),

    /// The operation is not implemented for the data type, or is not known.
    UnsupportedOperation {
        op: String,
        dtype: Option<DataType>,
    },

    /// Operands disagree on data type or device.
    DtypeOrDeviceMismatch(String),

    /// An argument or attribute has an invalid value.
    InvalidValue(String),

    /// The operation was cancelled before all entries were processed.
    Cancelled,

    /// A kernel failed in a way that has no container-level equivalent.
    Kernel {
        /// Index of the entry being processed, or `None` if the kernel was
        /// run on the padded form or on combined per-entry results.
        entry: Option<usize>,
        error: OpError,

        /// Shapes and types of the kernel inputs.
        inputs: Vec<ValueMeta>,
    },
}

impl RaggedError {
    /// Convert a kernel error for entry `entry` into a container error.
    pub(crate) fn from_entry(entry: usize, error: OpError, inputs: &[&Value]) -> RaggedError {
        match error {
            OpError::IncompatibleInputShapes(details) => {
                RaggedError::ShapeMismatch(format!("entry {}: {}", entry, details))
            }
            OpError::InvalidValue(_) | OpError::MissingInputs => RaggedError::Kernel {
                entry: Some(entry),
                error,
                inputs: inputs.iter().map(|v| v.to_meta()).collect(),
            },
            error => error.into(),
        }
    }
}

impl Display for RaggedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch(details) => write!(f, "shape mismatch: {}", details),
            Self::RankMismatch {
                entry,
                expected,
                actual,
            } => write!(
                f,
                "entry {} has {} dims but expected {}",
                entry, actual, expected
            ),
            Self::DimensionOutOfRange { dim, ndim } => write!(
                f,
                "dimension {} is out of range for tensor with {} dims",
                dim, ndim
            ),
            Self::InvalidReduction { dim, nesting_depth } => write!(
                f,
                "cannot reduce structural dimension {} (nesting depth is {})",
                dim, nesting_depth
            ),
            Self::MalformedMask(details) => write!(f, "malformed mask: {}", details),
            Self::UnsupportedOperation { op, dtype } => match dtype {
                Some(dtype) => write!(f, "operation {} is not supported for type {}", op, dtype),
                None => write!(f, "unknown operation {}", op),
            },
            Self::DtypeOrDeviceMismatch(details) => {
                write!(f, "type or device mismatch: {}", details)
            }
            Self::InvalidValue(details) => write!(f, "invalid value: {}", details),
            Self::Cancelled => write!(f, "operation was cancelled"),
            Self::Kernel {
                entry,
                error,
                inputs,
            } => {
                match entry {
                    Some(entry) => write!(f, "kernel failed on entry {}: {}", entry, error)?,
                    None => write!(f, "kernel failed: {}", error)?,
                }
                if inputs.is_empty() {
                    return Ok(());
                }
                write!(f, ". Inputs were (")?;
                for (i, input) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", input)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Error for RaggedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Kernel { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<OpError> for RaggedError {
    fn from(error: OpError) -> RaggedError {
        match error {
            OpError::UnsupportedOperation { op, dtype } => RaggedError::UnsupportedOperation {
                op: op.to_string(),
                dtype: Some(dtype),
            },
            OpError::TypeMismatch { .. } | OpError::UnsupportedDevice(_) => {
                RaggedError::DtypeOrDeviceMismatch(error.to_string())
            }
            OpError::IncompatibleInputShapes(details) => RaggedError::ShapeMismatch(details),
            OpError::InvalidAxis { axis, ndim } => {
                RaggedError::DimensionOutOfRange { dim: axis, ndim }
            }
            OpError::InvalidValue(_) | OpError::MissingInputs => RaggedError::Kernel {
                entry: None,
                error,
                inputs: Vec::new(),
            },
        }
    }
}

impl From<CastError> for RaggedError {
    fn from(error: CastError) -> RaggedError {
        match error {
            CastError::WrongType { .. } => RaggedError::DtypeOrDeviceMismatch(error.to_string()),
            CastError::NotScalar { .. } => RaggedError::ShapeMismatch(error.to_string()),
        }
    }
}
