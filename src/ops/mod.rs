//! Operations on dense tensors, and the capabilities that execute them.
//!
//! The set of operations is closed: every operation that can be applied to
//! the entries of a ragged tensor is a variant of [`Operation`]. Execution is
//! delegated to a [`Kernel`], and dense buffers are created by an
//! [`Allocator`]. [`CpuKernel`] and [`CpuAllocator`] are the reference
//! implementations.

use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};

use crate::value::{DataType, Device, Element, Scalar, Value};

mod binary_elementwise;
mod layout;
mod reduce;
mod unary_elementwise;

pub use binary_elementwise::broadcast_shapes;

/// Elementwise operations with a single input.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UnaryOp {
    Neg,
    Abs,
    Exp,
    Log,
    Sqrt,
    Relu,
    Sigmoid,
    Tanh,
    Sin,
    Cos,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "Neg",
            UnaryOp::Abs => "Abs",
            UnaryOp::Exp => "Exp",
            UnaryOp::Log => "Log",
            UnaryOp::Sqrt => "Sqrt",
            UnaryOp::Relu => "Relu",
            UnaryOp::Sigmoid => "Sigmoid",
            UnaryOp::Tanh => "Tanh",
            UnaryOp::Sin => "Sin",
            UnaryOp::Cos => "Cos",
        }
    }
}

/// Elementwise operations with two inputs, which are broadcast against each
/// other.
///
/// Comparisons produce one where the comparison holds and zero elsewhere, in
/// the data type of the inputs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Max,
    Min,
    Equal,
    NotEqual,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "Add",
            BinaryOp::Sub => "Sub",
            BinaryOp::Mul => "Mul",
            BinaryOp::Div => "Div",
            BinaryOp::Pow => "Pow",
            BinaryOp::Max => "Max",
            BinaryOp::Min => "Min",
            BinaryOp::Equal => "Equal",
            BinaryOp::NotEqual => "NotEqual",
        }
    }
}

/// Operations which combine the elements of a tensor along an axis, or
/// across the whole tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Prod,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "ReduceSum",
            ReduceOp::Mean => "ReduceMean",
            ReduceOp::Prod => "ReduceProd",
            ReduceOp::Max => "ReduceMax",
            ReduceOp::Min => "ReduceMin",
        }
    }
}

/// An operation on one or two dense tensors.
///
/// Axes are relative to the dense tensor the operation is applied to. When an
/// operation is dispatched over a ragged tensor, the dispatcher translates
/// ragged-tensor dimensions into entry axes.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Unary(UnaryOp),
    Binary(BinaryOp),

    /// Reduce along `axis`, or over all elements if `axis` is `None`.
    Reduce {
        op: ReduceOp,
        axis: Option<usize>,
        keep_dims: bool,
    },

    CumSum {
        axis: usize,
    },
    Softmax {
        axis: usize,
    },

    /// Swap two axes.
    Transpose {
        dim0: usize,
        dim1: usize,
    },
    Reshape {
        shape: Vec<usize>,
    },
    Cast(DataType),
}

impl Operation {
    /// Return the name of this operation, in the style of ONNX operator names.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Unary(op) => op.name(),
            Operation::Binary(op) => op.name(),
            Operation::Reduce { op, .. } => op.name(),
            Operation::CumSum { .. } => "CumSum",
            Operation::Softmax { .. } => "Softmax",
            Operation::Transpose { .. } => "Transpose",
            Operation::Reshape { .. } => "Reshape",
            Operation::Cast(_) => "Cast",
        }
    }

    /// Return the number of tensor inputs this operation takes.
    pub fn arity(&self) -> usize {
        match self {
            Operation::Binary(_) => 2,
            _ => 1,
        }
    }

    /// Return true if each output element depends only on the input elements
    /// at the same (broadcast) position.
    pub fn is_elementwise(&self) -> bool {
        matches!(self, Operation::Unary(_) | Operation::Binary(_))
    }

    /// Return true if this operation can be run once over the padded form of
    /// a ragged tensor instead of once per entry.
    ///
    /// Padding elements must not be able to cause an error, which excludes
    /// division (integer division by a zero pad) and `Pow`.
    pub(crate) fn supports_padded(&self) -> bool {
        match self {
            Operation::Unary(_) => true,
            Operation::Binary(op) => matches!(
                op,
                BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::Mul
                    | BinaryOp::Max
                    | BinaryOp::Min
                    | BinaryOp::Equal
                    | BinaryOp::NotEqual
            ),
            _ => false,
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Possible reasons why a kernel may fail on a given input.
#[derive(Clone, Debug, PartialEq)]
pub enum OpError {
    /// The kernel does not implement this operation for the data type.
    UnsupportedOperation { op: &'static str, dtype: DataType },

    /// The inputs of a binary operation have different data types.
    TypeMismatch { expected: DataType, actual: DataType },

    /// The allocator cannot create buffers on the requested device.
    UnsupportedDevice(Device),

    /// Input tensor shapes are not compatible with each other or operator
    /// attributes.
    IncompatibleInputShapes(String),

    /// An axis attribute is out of range for the input.
    InvalidAxis { axis: usize, ndim: usize },

    /// An input has a value that is incorrect.
    InvalidValue(&'static str),

    /// The number of inputs was less than the required number.
    MissingInputs,
}

impl Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::UnsupportedOperation { op, dtype } => {
                write!(f, "operation {} is not supported for type {}", op, dtype)
            }
            OpError::TypeMismatch { expected, actual } => {
                write!(f, "expected input of type {} but got {}", expected, actual)
            }
            OpError::UnsupportedDevice(device) => {
                write!(f, "cannot allocate on device \"{}\"", device)
            }
            OpError::IncompatibleInputShapes(details) => {
                write!(f, "incompatible input shapes: {}", details)
            }
            OpError::InvalidAxis { axis, ndim } => {
                write!(f, "axis {} is out of range for tensor with {} dims", axis, ndim)
            }
            OpError::InvalidValue(details) => {
                write!(f, "input or attribute has invalid value: {}", details)
            }
            OpError::MissingInputs => write!(f, "required inputs were missing"),
        }
    }
}

impl Error for OpError {}

/// Capability which executes [`Operation`]s on dense tensors.
///
/// A kernel is injected into a ragged tensor via its
/// [`Backend`](crate::Backend) and is invoked once per entry, or once on the
/// padded form of the tensor. Kernels are shared across worker threads.
pub trait Kernel: Send + Sync {
    /// Return a name for this kernel, used in log messages.
    fn name(&self) -> &str;

    /// Return true if this kernel implements `op` for inputs of type `dtype`.
    fn supports(&self, op: &Operation, dtype: DataType) -> bool;

    /// Apply `op` to `inputs`.
    ///
    /// `inputs` has [`Operation::arity`] entries. The output is a new tensor;
    /// full reductions produce a tensor with zero dims.
    fn apply(&self, op: &Operation, inputs: &[&Value]) -> Result<Value, OpError>;
}

/// Capability which creates dense buffers.
pub trait Allocator: Send + Sync {
    /// Create a tensor of a given shape and type on `device`, with every
    /// element set to `fill`.
    fn new_dense(
        &self,
        shape: &[usize],
        dtype: DataType,
        device: &Device,
        fill: Scalar,
    ) -> Result<Value, OpError>;
}

/// Arithmetic used by the generic CPU kernels.
///
/// Integer arithmetic wraps on overflow.
pub(crate) trait Number: Element {
    fn zero() -> Self;
    fn one() -> Self;
    fn add_elem(self, other: Self) -> Self;
    fn sub_elem(self, other: Self) -> Self;
    fn mul_elem(self, other: Self) -> Self;

    /// Divide `self` by `other`, or return `None` if the result is undefined.
    fn div_elem(self, other: Self) -> Option<Self>;
    fn max_elem(self, other: Self) -> Self;
    fn min_elem(self, other: Self) -> Self;
}

impl Number for f32 {
    fn zero() -> f32 {
        0.
    }

    fn one() -> f32 {
        1.
    }

    fn add_elem(self, other: f32) -> f32 {
        self + other
    }

    fn sub_elem(self, other: f32) -> f32 {
        self - other
    }

    fn mul_elem(self, other: f32) -> f32 {
        self * other
    }

    fn div_elem(self, other: f32) -> Option<f32> {
        Some(self / other)
    }

    fn max_elem(self, other: f32) -> f32 {
        self.max(other)
    }

    fn min_elem(self, other: f32) -> f32 {
        self.min(other)
    }
}

impl Number for i32 {
    fn zero() -> i32 {
        0
    }

    fn one() -> i32 {
        1
    }

    fn add_elem(self, other: i32) -> i32 {
        self.wrapping_add(other)
    }

    fn sub_elem(self, other: i32) -> i32 {
        self.wrapping_sub(other)
    }

    fn mul_elem(self, other: i32) -> i32 {
        self.wrapping_mul(other)
    }

    fn div_elem(self, other: i32) -> Option<i32> {
        self.checked_div(other)
    }

    fn max_elem(self, other: i32) -> i32 {
        self.max(other)
    }

    fn min_elem(self, other: i32) -> i32 {
        self.min(other)
    }
}

fn check_axis(axis: usize, ndim: usize) -> Result<usize, OpError> {
    if axis < ndim {
        Ok(axis)
    } else {
        Err(OpError::InvalidAxis { axis, ndim })
    }
}

/// Reference kernel which executes operations on the CPU.
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuKernel;

impl CpuKernel {
    pub fn new() -> CpuKernel {
        CpuKernel
    }
}

impl Kernel for CpuKernel {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supports(&self, op: &Operation, dtype: DataType) -> bool {
        match (op, dtype) {
            (_, DataType::Float) => true,
            (Operation::Unary(op), DataType::Int32) => {
                matches!(op, UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Relu)
            }
            (Operation::Binary(op), DataType::Int32) => *op != BinaryOp::Pow,
            (Operation::Reduce { op, .. }, DataType::Int32) => *op != ReduceOp::Mean,
            (Operation::Softmax { .. }, DataType::Int32) => false,
            (
                Operation::CumSum { .. }
                | Operation::Transpose { .. }
                | Operation::Reshape { .. }
                | Operation::Cast(_),
                DataType::Int32,
            ) => true,
        }
    }

    fn apply(&self, op: &Operation, inputs: &[&Value]) -> Result<Value, OpError> {
        if inputs.len() < op.arity() {
            return Err(OpError::MissingInputs);
        }
        let input = inputs[0];
        if !self.supports(op, input.dtype()) {
            return Err(OpError::UnsupportedOperation {
                op: op.name(),
                dtype: input.dtype(),
            });
        }

        match op {
            Operation::Unary(op) => unary_elementwise::unary(*op, input),
            Operation::Binary(op) => binary_elementwise::binary(*op, input, inputs[1]),
            Operation::Reduce {
                op,
                axis,
                keep_dims,
            } => {
                if let Some(axis) = axis {
                    check_axis(*axis, input.ndim())?;
                }
                reduce::reduce(*op, input, *axis, *keep_dims)
            }
            Operation::CumSum { axis } => {
                check_axis(*axis, input.ndim())?;
                reduce::cum_sum(input, *axis)
            }
            Operation::Softmax { axis } => {
                check_axis(*axis, input.ndim())?;
                reduce::softmax(input, *axis)
            }
            Operation::Transpose { dim0, dim1 } => {
                check_axis(*dim0, input.ndim())?;
                check_axis(*dim1, input.ndim())?;
                Ok(layout::transpose(input, *dim0, *dim1))
            }
            Operation::Reshape { shape } => layout::reshape(input, shape),
            Operation::Cast(dtype) => Ok(input.cast(*dtype)),
        }
    }
}

/// Reference allocator which creates buffers in host memory.
#[derive(Copy, Clone, Debug, Default)]
pub struct CpuAllocator;

impl CpuAllocator {
    pub fn new() -> CpuAllocator {
        CpuAllocator
    }
}

impl Allocator for CpuAllocator {
    fn new_dense(
        &self,
        shape: &[usize],
        dtype: DataType,
        device: &Device,
        fill: Scalar,
    ) -> Result<Value, OpError> {
        if !device.is_cpu() {
            return Err(OpError::UnsupportedDevice(device.clone()));
        }
        Ok(Value::full(shape, dtype, fill))
    }
}
