//! Apply dense operations across the entries of ragged tensors.
//!
//! Dimensions passed to the functions in this module refer to the dimensions
//! of the ragged tensor, including its structural dimensions. They are
//! translated to entry axes before a [`Kernel`](crate::ops::Kernel) is
//! invoked.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use rten_tensor::Tensor;

use crate::errors::RaggedError;
use crate::ops::{BinaryOp, OpError, Operation, ReduceOp, UnaryOp};
use crate::ragged::{RaggedOptions, RaggedTensor};
use crate::threading::{thread_pool, ThreadPool};
use crate::value::{DataType, Scalar, Value};

/// An argument to a dispatched operation.
#[derive(Clone, Copy, Debug)]
pub enum Arg<'a> {
    /// A number which is broadcast to every entry.
    Scalar(Scalar),

    /// A dense tensor which is broadcast to every entry.
    Dense(&'a Value),

    /// A ragged tensor whose entries are paired with the entries of other
    /// ragged arguments.
    Ragged(&'a RaggedTensor),
}

impl<'a> Arg<'a> {
    pub fn as_ragged(&self) -> Option<&'a RaggedTensor> {
        match self {
            Arg::Ragged(ragged) => Some(ragged),
            _ => None,
        }
    }
}

impl From<Scalar> for Arg<'_> {
    fn from(value: Scalar) -> Self {
        Arg::Scalar(value)
    }
}

impl From<f32> for Arg<'_> {
    fn from(value: f32) -> Self {
        Arg::Scalar(Scalar::Float(value))
    }
}

impl From<i32> for Arg<'_> {
    fn from(value: i32) -> Self {
        Arg::Scalar(Scalar::Int32(value))
    }
}

impl<'a> From<&'a Value> for Arg<'a> {
    fn from(value: &'a Value) -> Self {
        Arg::Dense(value)
    }
}

impl<'a> From<&'a RaggedTensor> for Arg<'a> {
    fn from(value: &'a RaggedTensor) -> Self {
        Arg::Ragged(value)
    }
}

/// Result of a dispatched operation.
#[derive(Debug, PartialEq)]
pub enum Output {
    Ragged(RaggedTensor),

    /// Result of reducing over every dimension.
    Scalar(Value),
}

impl Output {
    pub fn into_ragged(self) -> Option<RaggedTensor> {
        match self {
            Output::Ragged(ragged) => Some(ragged),
            Output::Scalar(_) => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Output::Scalar(value) => Some(value),
            Output::Ragged(_) => None,
        }
    }
}

/// Selects how elementwise operations are executed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ExecutionStrategy {
    /// Invoke the kernel once per entry.
    PerEntry,

    /// Invoke the kernel once on the padded form of the operands, for
    /// operations where padding elements cannot cause an error. Other
    /// operations run per entry.
    Padded,

    /// Use the padded form only if no dimension is ragged, so that padding
    /// adds no work.
    #[default]
    Auto,
}

/// Flag used to cancel a dispatched operation from another thread.
///
/// Cancellation is checked before each entry is processed. A cancelled
/// operation fails with [`RaggedError::Cancelled`] and its partial results are
/// discarded.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Options that control how an operation is dispatched.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Thread pool used for per-entry work. Defaults to [`thread_pool`].
    pub thread_pool: Option<Arc<ThreadPool>>,

    pub strategy: ExecutionStrategy,

    pub cancel: Option<CancelToken>,
}

impl RunOptions {
    fn pool(&self) -> &ThreadPool {
        self.thread_pool.as_deref().unwrap_or_else(|| thread_pool())
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    fn check_cancelled(&self) -> Result<(), RaggedError> {
        if self.is_cancelled() {
            Err(RaggedError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Return true if `op` should be run on the padded form of `ragged`.
    fn use_padded(&self, op: &Operation, ragged: &RaggedTensor) -> bool {
        op.supports_padded()
            && match self.strategy {
                ExecutionStrategy::PerEntry => false,
                ExecutionStrategy::Padded => true,
                ExecutionStrategy::Auto => !ragged.shape().has_ragged_dims(),
            }
    }
}

/// Apply `op` to `args`, at least one of which must be a ragged tensor.
///
/// Axes in `op` refer to dimensions of the ragged tensor. The shape of a
/// `Reshape` operation applies to each entry. A reduction with no axis
/// reduces over every dimension and produces [`Output::Scalar`]. Other
/// operations produce a ragged tensor with the same grouping as the first
/// ragged argument.
pub fn apply(op: &Operation, args: &[Arg], opts: &RunOptions) -> Result<Output, RaggedError> {
    if args.len() != op.arity() {
        return Err(RaggedError::InvalidValue(format!(
            "{} expects {} arguments but got {}",
            op,
            op.arity(),
            args.len()
        )));
    }
    let first_ragged = || {
        args[0].as_ragged().ok_or_else(|| {
            RaggedError::InvalidValue(format!("input of {} must be a ragged tensor", op))
        })
    };

    match op {
        Operation::Unary(op) => apply_unary(*op, first_ragged()?, opts).map(Output::Ragged),
        Operation::Binary(op) => apply_binary(*op, args[0], args[1], opts).map(Output::Ragged),
        Operation::Reduce {
            op,
            axis,
            keep_dims,
        } => reduce(*op, first_ragged()?, *axis, *keep_dims, None, opts),
        Operation::CumSum { axis } => cumsum(first_ragged()?, *axis, opts).map(Output::Ragged),
        Operation::Softmax { axis } => softmax(first_ragged()?, *axis, opts).map(Output::Ragged),
        Operation::Transpose { dim0, dim1 } => {
            transpose(first_ragged()?, *dim0, *dim1, opts).map(Output::Ragged)
        }
        Operation::Reshape { shape } => {
            let ragged = first_ragged()?;
            map_entries(op, ragged, ragged.dtype(), shape.len(), opts).map(Output::Ragged)
        }
        Operation::Cast(dtype) => cast(first_ragged()?, *dtype, opts).map(Output::Ragged),
    }
}

/// Apply a unary elementwise operation to every entry.
pub fn apply_unary(
    op: UnaryOp,
    ragged: &RaggedTensor,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let op = Operation::Unary(op);
    if opts.use_padded(&op, ragged) {
        opts.check_cancelled()?;
        log_dispatch(&op, ragged, true);
        let padded = ragged.to_padded_in(Scalar::Int32(0), opts.pool())?;
        let output = ragged
            .backend()
            .kernel
            .apply(&op, &[&padded.data])
            .map_err(|err| kernel_error(err, &[&padded.data]))?;
        return unpad(ragged, &output, opts);
    }
    map_entries(&op, ragged, ragged.dtype(), ragged.shape().inner_rank(), opts)
}

/// Apply `op` to every entry in place.
///
/// The container is only updated if every entry succeeds.
pub fn apply_unary_in_place(
    op: UnaryOp,
    ragged: &mut RaggedTensor,
    opts: &RunOptions,
) -> Result<(), RaggedError> {
    *ragged = apply_unary(op, ragged, opts)?;
    Ok(())
}

/// An operand of a binary operation, normalized so that it can supply an
/// input for every entry.
enum Operand<'a> {
    Entries(&'a RaggedTensor),
    Broadcast { value: Cow<'a, Value>, scalar: bool },
}

impl<'a> Operand<'a> {
    /// Normalize `arg` for use with the entries of `ragged`.
    fn new(arg: Arg<'a>, ragged: &RaggedTensor) -> Result<Operand<'a>, RaggedError> {
        match arg {
            Arg::Ragged(other) => {
                check_compatible(ragged, other)?;
                Ok(Operand::Entries(other))
            }
            Arg::Dense(value) => {
                if value.dtype() != ragged.dtype() {
                    return Err(RaggedError::DtypeOrDeviceMismatch(format!(
                        "dense operand has type {} but ragged tensor has type {}",
                        value.dtype(),
                        ragged.dtype()
                    )));
                }
                Ok(Operand::Broadcast {
                    value: Cow::Borrowed(value),
                    scalar: false,
                })
            }
            Arg::Scalar(value) => Ok(Operand::Broadcast {
                value: Cow::Owned(Value::from_scalar(value.cast(ragged.dtype()))),
                scalar: true,
            }),
        }
    }

    fn entry(&self, index: usize) -> &Value {
        match self {
            Operand::Entries(ragged) => &ragged.entries()[index],
            Operand::Broadcast { value, .. } => &**value,
        }
    }

    fn ndim(&self) -> usize {
        match self {
            Operand::Entries(ragged) => ragged.shape().inner_rank(),
            Operand::Broadcast { value, .. } => value.ndim(),
        }
    }

    /// Return true if this operand can be combined with the padded form of
    /// `ragged` without changing the result for valid positions.
    fn can_pad_with(&self, ragged: &RaggedTensor) -> bool {
        match self {
            Operand::Entries(other) => other.shape() == ragged.shape(),
            Operand::Broadcast { scalar, .. } => *scalar,
        }
    }

    fn padded(&self, pool: &ThreadPool) -> Result<Cow<'_, Value>, RaggedError> {
        match self {
            Operand::Entries(ragged) => Ok(Cow::Owned(
                ragged.to_padded_in(Scalar::Int32(0), pool)?.data,
            )),
            Operand::Broadcast { value, .. } => Ok(Cow::Borrowed(&**value)),
        }
    }
}

/// Check that two ragged tensors can be combined entry by entry.
fn check_compatible(a: &RaggedTensor, b: &RaggedTensor) -> Result<(), RaggedError> {
    if a.nesting_depth() != b.nesting_depth() {
        return Err(RaggedError::ShapeMismatch(format!(
            "nesting depths {} and {} differ",
            a.nesting_depth(),
            b.nesting_depth()
        )));
    }
    if a.num_entries() != b.num_entries() {
        return Err(RaggedError::ShapeMismatch(format!(
            "entry counts {} and {} differ",
            a.num_entries(),
            b.num_entries()
        )));
    }
    if !a.structure().same_structure(b.structure()) {
        return Err(RaggedError::ShapeMismatch(
            "operands group their entries differently".into(),
        ));
    }
    if a.shape().inner_rank() != b.shape().inner_rank() {
        return Err(RaggedError::ShapeMismatch(format!(
            "entries have {} and {} dims",
            a.shape().inner_rank(),
            b.shape().inner_rank()
        )));
    }
    if a.dtype() != b.dtype() {
        return Err(RaggedError::DtypeOrDeviceMismatch(format!(
            "types {} and {} differ",
            a.dtype(),
            b.dtype()
        )));
    }
    if a.device() != b.device() {
        return Err(RaggedError::DtypeOrDeviceMismatch(format!(
            "devices {} and {} differ",
            a.device(),
            b.device()
        )));
    }
    Ok(())
}

/// Apply a binary elementwise operation to corresponding entries of `lhs` and
/// `rhs`.
///
/// At least one operand must be a ragged tensor. Dense and scalar operands
/// are broadcast to every entry, and ragged operands must have the same
/// grouping, entry count, inner rank, type and device. Entries are combined
/// using NumPy broadcasting rules, applied independently per entry.
pub fn apply_binary<'a>(
    op: BinaryOp,
    lhs: impl Into<Arg<'a>>,
    rhs: impl Into<Arg<'a>>,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let (lhs, rhs) = (lhs.into(), rhs.into());
    let ragged = lhs.as_ragged().or(rhs.as_ragged()).ok_or_else(|| {
        RaggedError::InvalidValue(format!(
            "one input of {} must be a ragged tensor",
            op.name()
        ))
    })?;
    let lhs = Operand::new(lhs, ragged)?;
    let rhs = Operand::new(rhs, ragged)?;
    let op = Operation::Binary(op);
    let kernel = &ragged.backend().kernel;

    if opts.use_padded(&op, ragged) && lhs.can_pad_with(ragged) && rhs.can_pad_with(ragged) {
        opts.check_cancelled()?;
        log_dispatch(&op, ragged, true);
        let pool = opts.pool();
        let (lhs, rhs) = (lhs.padded(pool)?, rhs.padded(pool)?);
        let inputs = [&*lhs, &*rhs];
        let output = kernel
            .apply(&op, &inputs)
            .map_err(|err| kernel_error(err, &inputs))?;
        return unpad(ragged, &output, opts);
    }

    log_dispatch(&op, ragged, false);
    let outputs = run_entries(ragged.num_entries(), opts, |i| {
        let inputs = [lhs.entry(i), rhs.entry(i)];
        kernel
            .apply(&op, &inputs)
            .map_err(|err| RaggedError::from_entry(i, err, &inputs))
    })?;
    let inner_rank = lhs.ndim().max(rhs.ndim());
    ragged.with_entries(outputs, ragged.dtype(), inner_rank)
}

/// Apply a binary operation in place, with `ragged` as the left operand.
///
/// Fails with [`RaggedError::ShapeMismatch`] if broadcasting would change
/// the shape of `ragged`. The container is only updated if every entry
/// succeeds.
pub fn apply_binary_in_place<'a>(
    op: BinaryOp,
    ragged: &mut RaggedTensor,
    rhs: impl Into<Arg<'a>>,
    opts: &RunOptions,
) -> Result<(), RaggedError> {
    let rhs: Arg<'a> = rhs.into();
    let output = apply_binary(op, &*ragged, rhs, opts)?;
    if output.shape() != ragged.shape() {
        return Err(RaggedError::ShapeMismatch(format!(
            "in-place {} would change the shape of the output",
            op.name()
        )));
    }
    *ragged = output;
    Ok(())
}

/// Reduce a ragged tensor along dimension `dim`, or over all dimensions if
/// `dim` is `None`.
///
/// Structural dimensions cannot be reduced. Reducing a non-structural
/// dimension reduces each entry independently. A full reduction reduces each
/// entry and then combines the results with the same operation. The mean is
/// weighted by the number of elements in each entry. An empty container has a
/// sum of zero, product of one and mean of NaN. Its maximum and minimum are
/// undefined.
///
/// If `dtype` is set, entries are converted to that type first.
pub fn reduce(
    op: ReduceOp,
    ragged: &RaggedTensor,
    dim: Option<usize>,
    keep_dims: bool,
    dtype: Option<DataType>,
    opts: &RunOptions,
) -> Result<Output, RaggedError> {
    let cast_input;
    let ragged = match dtype {
        Some(dtype) if dtype != ragged.dtype() => {
            cast_input = cast(ragged, dtype, opts)?;
            &cast_input
        }
        _ => ragged,
    };

    let Some(dim) = dim else {
        return reduce_all(op, ragged, keep_dims, opts).map(Output::Scalar);
    };
    let axis = reduction_axis(ragged, dim)?;
    let op = Operation::Reduce {
        op,
        axis: Some(axis),
        keep_dims,
    };
    let inner_rank = ragged.shape().inner_rank() - usize::from(!keep_dims);
    map_entries(&op, ragged, ragged.dtype(), inner_rank, opts).map(Output::Ragged)
}

/// Compute the cumulative sum of each entry along dimension `dim`.
pub fn cumsum(
    ragged: &RaggedTensor,
    dim: usize,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let axis = reduction_axis(ragged, dim)?;
    let op = Operation::CumSum { axis };
    map_entries(&op, ragged, ragged.dtype(), ragged.shape().inner_rank(), opts)
}

/// Compute the softmax of each entry along dimension `dim`.
pub fn softmax(
    ragged: &RaggedTensor,
    dim: usize,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let axis = reduction_axis(ragged, dim)?;
    let op = Operation::Softmax { axis };
    map_entries(&op, ragged, ragged.dtype(), ragged.shape().inner_rank(), opts)
}

/// Swap two non-structural dimensions of every entry.
pub fn transpose(
    ragged: &RaggedTensor,
    dim0: usize,
    dim1: usize,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let ndim = ragged.ndim();
    let depth = ragged.nesting_depth();
    for dim in [dim0, dim1] {
        if dim >= ndim {
            return Err(RaggedError::DimensionOutOfRange { dim, ndim });
        }
        if dim < depth {
            return Err(RaggedError::InvalidValue(format!(
                "cannot transpose structural dimension {}",
                dim
            )));
        }
    }
    let op = Operation::Transpose {
        dim0: dim0 - depth,
        dim1: dim1 - depth,
    };
    map_entries(&op, ragged, ragged.dtype(), ragged.shape().inner_rank(), opts)
}

/// Reshape every entry.
///
/// `shape` gives the full shape of the result. Structural dimensions cannot
/// be reshaped, so their sizes must be given as `-1`. The remaining sizes
/// give the shape of each entry, which must have the same number of elements
/// as the entry.
pub fn reshape(
    ragged: &RaggedTensor,
    shape: &[isize],
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let depth = ragged.nesting_depth();
    if shape.len() < depth {
        return Err(RaggedError::ShapeMismatch(format!(
            "shape {:?} has fewer dims than the nesting depth {}",
            shape, depth
        )));
    }
    if let Some(dim) = (0..depth).find(|&d| shape[d] != -1) {
        return Err(RaggedError::InvalidValue(format!(
            "size of structural dimension {} must be -1 but is {}",
            dim, shape[dim]
        )));
    }
    let entry_shape = shape[depth..]
        .iter()
        .map(|&size| {
            usize::try_from(size).map_err(|_| {
                RaggedError::InvalidValue(format!("invalid size {} in shape {:?}", size, shape))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let inner_rank = entry_shape.len();
    let op = Operation::Reshape { shape: entry_shape };
    map_entries(&op, ragged, ragged.dtype(), inner_rank, opts)
}

/// Convert every entry to a given data type.
pub fn cast(
    ragged: &RaggedTensor,
    dtype: DataType,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let op = Operation::Cast(dtype);
    map_entries(&op, ragged, dtype, ragged.shape().inner_rank(), opts)
}

/// Translate dimension `dim` of a ragged tensor into an entry axis for a
/// reduction-like operation.
fn reduction_axis(ragged: &RaggedTensor, dim: usize) -> Result<usize, RaggedError> {
    let ndim = ragged.ndim();
    let depth = ragged.nesting_depth();
    if dim >= ndim {
        return Err(RaggedError::DimensionOutOfRange { dim, ndim });
    }
    if dim < depth {
        return Err(RaggedError::InvalidReduction {
            dim,
            nesting_depth: depth,
        });
    }
    Ok(dim - depth)
}

fn log_dispatch(op: &Operation, ragged: &RaggedTensor, padded: bool) {
    tracing::debug!(
        op = op.name(),
        entries = ragged.num_entries(),
        padded,
        "dispatching operation"
    );
}

/// Convert an error from a kernel that was run on the padded form of a
/// container, or on combined per-entry results.
fn kernel_error(error: OpError, inputs: &[&Value]) -> RaggedError {
    match RaggedError::from(error) {
        RaggedError::Kernel { entry, error, .. } => RaggedError::Kernel {
            entry,
            error,
            inputs: inputs.iter().map(|v| v.to_meta()).collect(),
        },
        error => error,
    }
}

/// Run `f` for each entry index in `0..len` on the thread pool, and collect
/// the results in order.
fn run_entries<F>(len: usize, opts: &RunOptions, f: F) -> Result<Vec<Value>, RaggedError>
where
    F: Fn(usize) -> Result<Value, RaggedError> + Sync,
{
    opts.pool().run(|| {
        (0..len)
            .into_par_iter()
            .map(|i| {
                if opts.is_cancelled() {
                    return Err(RaggedError::Cancelled);
                }
                tracing::trace!(entry = i, "running kernel");
                f(i)
            })
            .collect()
    })
}

/// Apply a single-input operation to every entry.
///
/// `dtype` and `inner_rank` describe the result if the container is empty.
fn map_entries(
    op: &Operation,
    ragged: &RaggedTensor,
    dtype: DataType,
    inner_rank: usize,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    log_dispatch(op, ragged, false);
    let kernel = &ragged.backend().kernel;
    let outputs = run_entries(ragged.num_entries(), opts, |i| {
        let input = &ragged.entries()[i];
        kernel
            .apply(op, &[input])
            .map_err(|err| RaggedError::from_entry(i, err, &[input]))
    })?;
    ragged.with_entries(outputs, dtype, inner_rank)
}

/// Extract the entries of a result computed on the padded form of `ragged`.
fn unpad(
    ragged: &RaggedTensor,
    output: &Value,
    opts: &RunOptions,
) -> Result<RaggedTensor, RaggedError> {
    let options = RaggedOptions {
        dtype: None,
        ..ragged.options()
    };
    RaggedTensor::from_padded_at(
        output,
        &ragged.nested_size(),
        ragged.nesting_depth(),
        &options,
        opts.pool(),
    )
}

/// Reduce over every dimension of a ragged tensor.
fn reduce_all(
    op: ReduceOp,
    ragged: &RaggedTensor,
    keep_dims: bool,
    opts: &RunOptions,
) -> Result<Value, RaggedError> {
    let kernel = &ragged.backend().kernel;
    let dtype = ragged.dtype();

    let total = if op == ReduceOp::Mean {
        let mean = Operation::Reduce {
            op,
            axis: None,
            keep_dims: false,
        };
        if !kernel.supports(&mean, dtype) {
            return Err(RaggedError::UnsupportedOperation {
                op: mean.name().to_string(),
                dtype: Some(dtype),
            });
        }
        // Partial sums are combined in double precision.
        let sum = reduce_entries(ReduceOp::Sum, ragged, opts)?
            .iter()
            .map(|partial| partial.item().map(|sum| sum.to_f32() as f64))
            .sum::<Result<f64, _>>()?;
        let mean = sum / ragged.numel() as f64;
        Value::from_scalar(Scalar::Float(mean as f32))
    } else {
        let partials = reduce_entries(op, ragged, opts)?;
        if partials.is_empty() {
            let identity = match op {
                ReduceOp::Sum => Scalar::Int32(0),
                ReduceOp::Prod => Scalar::Int32(1),
                _ => {
                    return Err(RaggedError::InvalidValue(format!(
                        "cannot compute {} of a ragged tensor with no elements",
                        op.name()
                    )))
                }
            };
            Value::from_scalar(identity.cast(dtype))
        } else {
            let stacked = stack_scalars(&partials, dtype)?;
            let combine = Operation::Reduce {
                op,
                axis: None,
                keep_dims: false,
            };
            kernel
                .apply(&combine, &[&stacked])
                .map_err(|err| kernel_error(err, &[&stacked]))?
        }
    };

    if !keep_dims {
        return Ok(total);
    }
    let reshape = Operation::Reshape {
        shape: vec![1; ragged.ndim()],
    };
    kernel
        .apply(&reshape, &[&total])
        .map_err(|err| kernel_error(err, &[&total]))
}

/// Reduce each entry to a scalar.
///
/// Empty entries are skipped for operations that have no identity.
fn reduce_entries(
    op: ReduceOp,
    ragged: &RaggedTensor,
    opts: &RunOptions,
) -> Result<Vec<Value>, RaggedError> {
    let skip_empty = matches!(op, ReduceOp::Max | ReduceOp::Min);
    let indices: Vec<usize> = (0..ragged.num_entries())
        .filter(|&i| !(skip_empty && ragged.entries()[i].is_empty()))
        .collect();
    let reduce = Operation::Reduce {
        op,
        axis: None,
        keep_dims: false,
    };
    log_dispatch(&reduce, ragged, false);

    let kernel = &ragged.backend().kernel;
    run_entries(indices.len(), opts, |k| {
        let i = indices[k];
        let input = &ragged.entries()[i];
        kernel
            .apply(&reduce, &[input])
            .map_err(|err| RaggedError::from_entry(i, err, &[input]))
    })
}

/// Combine tensors with zero dims into a vector.
fn stack_scalars(values: &[Value], dtype: DataType) -> Result<Value, RaggedError> {
    let scalars = values
        .iter()
        .map(|v| v.item())
        .collect::<Result<Vec<_>, _>>()?;
    let shape = [scalars.len()];
    Ok(match dtype {
        DataType::Float => {
            Tensor::from_data(&shape, scalars.iter().map(|s| s.to_f32()).collect::<Vec<_>>())
                .into()
        }
        DataType::Int32 => {
            Tensor::from_data(&shape, scalars.iter().map(|s| s.to_i32()).collect::<Vec<_>>())
                .into()
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;
    use rten_testing::{expect_approx_eq, TestCases};

    use super::{
        apply, apply_binary, apply_binary_in_place, apply_unary, apply_unary_in_place, cast,
        cumsum, reduce, reshape, softmax, transpose, Arg, CancelToken, ExecutionStrategy, Output,
        RunOptions,
    };
    use crate::errors::RaggedError;
    use crate::nested_node::NestedNode;
    use crate::ops::{
        BinaryOp, CpuAllocator, CpuKernel, Kernel, OpError, Operation, ReduceOp, UnaryOp,
    };
    use crate::ragged::{Backend, RaggedOptions, RaggedTensor};
    use crate::threading::ThreadPool;
    use crate::value::{DataType, Value};

    fn arange(shape: &[usize], start: f32) -> Value {
        let len: usize = shape.iter().product();
        Tensor::from_data(shape, (0..len).map(|i| start + i as f32).collect::<Vec<_>>()).into()
    }

    fn ints(shape: &[usize], data: Vec<i32>) -> Value {
        Tensor::from_data(shape, data).into()
    }

    fn floats(value: &Value) -> Vec<f32> {
        value.as_tensor::<f32>().unwrap().to_vec()
    }

    /// Container with entries of shape (3, 3) and (2, 3).
    fn ragged_3x3_2x3() -> RaggedTensor {
        RaggedTensor::construct(
            &[arange(&[3, 3], 0.), arange(&[2, 3], 10.)],
            &RaggedOptions::default(),
        )
        .unwrap()
    }

    fn with_strategy(strategy: ExecutionStrategy) -> RunOptions {
        RunOptions {
            strategy,
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_unary() {
        let ragged = ragged_3x3_2x3();
        let output = apply_unary(UnaryOp::Neg, &ragged, &RunOptions::default()).unwrap();
        assert_eq!(output.entry_sizes(), ragged.entry_sizes());
        for (actual, input) in output.unbind().zip(ragged.unbind()) {
            let expected: Vec<f32> = floats(input).iter().map(|x| -x).collect();
            assert_eq!(floats(actual), expected);
        }
    }

    #[test]
    fn test_strategies_agree() {
        #[derive(Debug)]
        struct Case {
            strategy: ExecutionStrategy,
            entries: Vec<Vec<usize>>,
        }

        let cases = [
            Case {
                strategy: ExecutionStrategy::PerEntry,
                entries: vec![vec![3, 3], vec![2, 3]],
            },
            Case {
                strategy: ExecutionStrategy::Padded,
                entries: vec![vec![3, 3], vec![2, 3]],
            },
            Case {
                strategy: ExecutionStrategy::Auto,
                entries: vec![vec![3, 3], vec![2, 3]],
            },
            Case {
                strategy: ExecutionStrategy::Auto,
                entries: vec![vec![2, 2], vec![2, 2]],
            },
            Case {
                strategy: ExecutionStrategy::Padded,
                entries: vec![vec![1, 4], vec![3, 2], vec![0, 1]],
            },
        ];

        cases.test_each(|case| {
            let entries: Vec<Value> = case
                .entries
                .iter()
                .enumerate()
                .map(|(i, shape)| arange(shape, i as f32 * 10. - 5.))
                .collect();
            let ragged = RaggedTensor::construct(&entries, &RaggedOptions::default()).unwrap();
            let opts = with_strategy(case.strategy);

            let relu = apply_unary(UnaryOp::Relu, &ragged, &opts).unwrap();
            let expected =
                apply_unary(UnaryOp::Relu, &ragged, &with_strategy(ExecutionStrategy::PerEntry))
                    .unwrap();
            assert_eq!(relu, expected);

            let sum = apply_binary(BinaryOp::Add, &ragged, &relu, &opts).unwrap();
            let scaled = apply_binary(BinaryOp::Mul, &sum, 2.0, &opts).unwrap();
            for ((actual, input), relu) in scaled.unbind().zip(ragged.unbind()).zip(relu.unbind())
            {
                let expected: Vec<f32> = floats(input)
                    .iter()
                    .zip(floats(relu))
                    .map(|(x, r)| (x + r) * 2.)
                    .collect();
                assert_eq!(floats(actual), expected);
            }
        })
    }

    #[test]
    fn test_apply_binary_ragged() {
        let a = ragged_3x3_2x3();
        let b = RaggedTensor::construct(
            &[arange(&[3, 3], 100.), arange(&[2, 3], 200.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let sum = apply_binary(BinaryOp::Add, &a, &b, &RunOptions::default()).unwrap();
        for k in 0..2 {
            let expected: Vec<f32> = floats(a.get(k).unwrap())
                .iter()
                .zip(floats(b.get(k).unwrap()))
                .map(|(x, y)| x + y)
                .collect();
            assert_eq!(floats(sum.get(k).unwrap()), expected);
        }
    }

    #[test]
    fn test_apply_binary_broadcast() {
        let ragged = ragged_3x3_2x3();
        let row: Value = Tensor::from_data(&[3], vec![1., 2., 3.]).into();
        let output = apply_binary(BinaryOp::Mul, &ragged, &row, &RunOptions::default()).unwrap();
        assert_eq!(output.entry_sizes(), [vec![3, 3], vec![2, 3]]);
        assert_eq!(
            floats(output.get(1).unwrap()),
            [10., 22., 36., 13., 28., 45.]
        );

        // Scalars are converted to the type of the container.
        let ragged = RaggedTensor::adopt(
            vec![ints(&[2], vec![1, 2]), ints(&[1], vec![3])],
            &RaggedOptions::default(),
        )
        .unwrap();
        let output = apply_binary(BinaryOp::Sub, 10, &ragged, &RunOptions::default()).unwrap();
        assert_eq!(output.dtype(), DataType::Int32);
        let first: &Tensor<i32> = output.get(0).unwrap().try_into().unwrap();
        assert_eq!(first.to_vec(), [9, 8]);
        let output = apply_binary(BinaryOp::Add, &ragged, 1.5, &RunOptions::default()).unwrap();
        let last: &Tensor<i32> = output.get(1).unwrap().try_into().unwrap();
        assert_eq!(last.to_vec(), [4]);
    }

    #[test]
    fn test_apply_binary_errors() {
        let a = ragged_3x3_2x3();
        let three_entries = RaggedTensor::construct(
            &[arange(&[3, 3], 0.), arange(&[2, 3], 0.), arange(&[1, 3], 0.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let int_entries = RaggedTensor::construct(
            &[arange(&[3, 3], 0.), arange(&[2, 3], 0.)],
            &RaggedOptions {
                dtype: Some(DataType::Int32),
                ..Default::default()
            },
        )
        .unwrap();
        let rank_one = RaggedTensor::construct(
            &[arange(&[3], 0.), arange(&[2], 0.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let nested = RaggedTensor::nested(
            NestedNode::List(vec![
                NestedNode::from_leaves([arange(&[3, 3], 0.)]),
                NestedNode::from_leaves([arange(&[2, 3], 0.)]),
            ]),
            &RaggedOptions::default(),
        )
        .unwrap();
        let mismatched: Value = arange(&[4], 0.);
        let opts = RunOptions::default();

        assert!(matches!(
            apply_binary(BinaryOp::Add, &a, &three_entries, &opts),
            Err(RaggedError::ShapeMismatch(_))
        ));
        assert!(matches!(
            apply_binary(BinaryOp::Add, &a, &rank_one, &opts),
            Err(RaggedError::ShapeMismatch(_))
        ));
        assert!(matches!(
            apply_binary(BinaryOp::Add, &a, &nested, &opts),
            Err(RaggedError::ShapeMismatch(_))
        ));
        assert!(matches!(
            apply_binary(BinaryOp::Add, &a, &int_entries, &opts),
            Err(RaggedError::DtypeOrDeviceMismatch(_))
        ));
        assert!(matches!(
            apply_binary(BinaryOp::Add, &a, &mismatched, &opts),
            Err(RaggedError::ShapeMismatch(_))
        ));
        assert!(matches!(
            apply_binary(BinaryOp::Add, 1.0, 2.0, &opts),
            Err(RaggedError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_kernel_error_reports_entry() {
        let ragged = RaggedTensor::adopt(
            vec![ints(&[2], vec![1, 2]), ints(&[2], vec![1, 0])],
            &RaggedOptions::default(),
        )
        .unwrap();
        let err = apply_binary(BinaryOp::Div, 4, &ragged, &RunOptions::default()).unwrap_err();
        match err {
            RaggedError::Kernel { entry, error, .. } => {
                assert_eq!(entry, Some(1));
                assert_eq!(error, OpError::InvalidValue("division by zero"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_reduce_dim() {
        let ragged = ragged_3x3_2x3();
        let opts = RunOptions::default();

        let sums = reduce(ReduceOp::Sum, &ragged, Some(1), false, None, &opts)
            .unwrap()
            .into_ragged()
            .unwrap();
        assert_eq!(sums.entry_sizes(), [vec![3], vec![3]]);
        assert_eq!(floats(sums.get(0).unwrap()), [9., 12., 15.]);
        assert_eq!(floats(sums.get(1).unwrap()), [23., 25., 27.]);

        let sums = reduce(ReduceOp::Sum, &ragged, Some(2), true, None, &opts)
            .unwrap()
            .into_ragged()
            .unwrap();
        assert_eq!(sums.entry_sizes(), [vec![3, 1], vec![2, 1]]);
        assert_eq!(floats(sums.get(1).unwrap()), [33., 42.]);
    }

    #[test]
    fn test_reduce_dim_errors() {
        let ragged = ragged_3x3_2x3();
        let opts = RunOptions::default();
        assert_eq!(
            reduce(ReduceOp::Sum, &ragged, Some(0), false, None, &opts).err(),
            Some(RaggedError::InvalidReduction {
                dim: 0,
                nesting_depth: 1
            })
        );
        assert_eq!(
            reduce(ReduceOp::Max, &ragged, Some(3), false, None, &opts).err(),
            Some(RaggedError::DimensionOutOfRange { dim: 3, ndim: 3 })
        );
        assert_eq!(
            cumsum(&ragged, 0, &opts).err(),
            Some(RaggedError::InvalidReduction {
                dim: 0,
                nesting_depth: 1
            })
        );
        assert_eq!(
            softmax(&ragged, 0, &opts).err(),
            Some(RaggedError::InvalidReduction {
                dim: 0,
                nesting_depth: 1
            })
        );
    }

    #[test]
    fn test_reduce_all() {
        #[derive(Debug)]
        struct Case {
            op: ReduceOp,
            expected: f32,
        }

        // Entries are [0..9] and [10..16].
        let cases = [
            Case {
                op: ReduceOp::Sum,
                expected: 36. + 75.,
            },
            Case {
                op: ReduceOp::Mean,
                expected: (36. + 75.) / 15.,
            },
            Case {
                op: ReduceOp::Max,
                expected: 15.,
            },
            Case {
                op: ReduceOp::Min,
                expected: 0.,
            },
        ];

        cases.test_each(|case| {
            let ragged = ragged_3x3_2x3();
            let total = reduce(case.op, &ragged, None, false, None, &RunOptions::default())
                .unwrap()
                .into_value()
                .unwrap();
            assert_eq!(total.ndim(), 0);
            expect_approx_eq(&floats(&total), &[case.expected]);
        })
    }

    #[test]
    fn test_reduce_all_keep_dims() {
        let ragged = ragged_3x3_2x3();
        let total = reduce(ReduceOp::Sum, &ragged, None, true, None, &RunOptions::default())
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(total.shape(), &[1, 1, 1]);
    }

    #[test]
    fn test_reduce_all_empty() {
        let opts = RunOptions::default();
        let empty = RaggedTensor::construct(&[], &RaggedOptions::default()).unwrap();

        let sum = reduce(ReduceOp::Sum, &empty, None, false, None, &opts).unwrap();
        assert_eq!(sum, Output::Scalar(Tensor::from_data(&[], vec![0.]).into()));
        let prod = reduce(ReduceOp::Prod, &empty, None, false, None, &opts).unwrap();
        assert_eq!(prod, Output::Scalar(Tensor::from_data(&[], vec![1.]).into()));
        let mean = reduce(ReduceOp::Mean, &empty, None, false, None, &opts)
            .unwrap()
            .into_value()
            .unwrap();
        assert!(floats(&mean)[0].is_nan());
        assert!(matches!(
            reduce(ReduceOp::Max, &empty, None, false, None, &opts),
            Err(RaggedError::InvalidValue(_))
        ));

        // Empty entries are skipped by max, but contribute to the mean.
        let ragged = RaggedTensor::construct(
            &[arange(&[0], 0.), arange(&[2], 3.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let max = reduce(ReduceOp::Max, &ragged, None, false, None, &opts)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(floats(&max), [4.]);
        let mean = reduce(ReduceOp::Mean, &ragged, None, false, None, &opts)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(floats(&mean), [3.5]);
    }

    #[test]
    fn test_reduce_all_mean_precision() {
        // 2^24 + 1 is not representable as an f32, so adding the partial sums
        // one at a time in single precision would lose both ones.
        let ragged = RaggedTensor::construct(
            &[arange(&[1], 16_777_216.), arange(&[1], 1.), arange(&[1], 1.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let mean = reduce(ReduceOp::Mean, &ragged, None, false, None, &RunOptions::default())
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(floats(&mean), [5_592_406.]);
    }

    #[test]
    fn test_reduce_int_mean() {
        let ragged = RaggedTensor::adopt(
            vec![ints(&[2], vec![1, 2]), ints(&[1], vec![6])],
            &RaggedOptions::default(),
        )
        .unwrap();
        let opts = RunOptions::default();
        assert_eq!(
            reduce(ReduceOp::Mean, &ragged, None, false, None, &opts).err(),
            Some(RaggedError::UnsupportedOperation {
                op: "ReduceMean".to_string(),
                dtype: Some(DataType::Int32)
            })
        );
        let mean = reduce(ReduceOp::Mean, &ragged, None, false, Some(DataType::Float), &opts)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(floats(&mean), [3.]);

        let sum = reduce(ReduceOp::Sum, &ragged, None, false, None, &opts)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(sum, ints(&[], vec![9]));
    }

    #[test]
    fn test_cumsum_and_softmax() {
        let ragged = RaggedTensor::construct(
            &[arange(&[1, 3], 1.), arange(&[2, 2], 0.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let opts = RunOptions::default();

        let sums = cumsum(&ragged, 2, &opts).unwrap();
        assert_eq!(floats(sums.get(0).unwrap()), [1., 3., 6.]);
        assert_eq!(floats(sums.get(1).unwrap()), [0., 1., 2., 5.]);

        let probs = softmax(&ragged, 2, &opts).unwrap();
        let row: f32 = floats(probs.get(0).unwrap()).iter().sum();
        expect_approx_eq(&[row], &[1.]);
        expect_approx_eq(
            &floats(probs.get(1).unwrap()),
            &[0.26894142, 0.7310586, 0.26894142, 0.7310586],
        );
    }

    #[test]
    fn test_transpose() {
        let ragged = ragged_3x3_2x3();
        let opts = RunOptions::default();
        let output = transpose(&ragged, 1, 2, &opts).unwrap();
        assert_eq!(output.entry_sizes(), [vec![3, 3], vec![3, 2]]);
        assert_eq!(
            floats(output.get(1).unwrap()),
            [10., 13., 11., 14., 12., 15.]
        );
        assert!(matches!(
            transpose(&ragged, 0, 1, &opts),
            Err(RaggedError::InvalidValue(_))
        ));
        assert_eq!(
            transpose(&ragged, 1, 5, &opts).err(),
            Some(RaggedError::DimensionOutOfRange { dim: 5, ndim: 3 })
        );
    }

    #[test]
    fn test_reshape() {
        let ragged = RaggedTensor::construct(
            &[arange(&[2, 3], 0.), arange(&[3, 2], 0.)],
            &RaggedOptions::default(),
        )
        .unwrap();
        let opts = RunOptions::default();

        let flat = reshape(&ragged, &[-1, 6], &opts).unwrap();
        assert_eq!(flat.entry_sizes(), [vec![6], vec![6]]);
        assert_eq!(flat.sizes(), [Some(2), Some(6)]);

        assert!(matches!(
            reshape(&ragged, &[2, 6], &opts),
            Err(RaggedError::InvalidValue(_))
        ));
        assert!(matches!(
            reshape(&ragged, &[-1, -1], &opts),
            Err(RaggedError::InvalidValue(_))
        ));
        assert!(matches!(
            reshape(&ragged, &[-1, 4], &opts),
            Err(RaggedError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_cast() {
        let ragged = ragged_3x3_2x3();
        let output = cast(&ragged, DataType::Int32, &RunOptions::default()).unwrap();
        assert_eq!(output.dtype(), DataType::Int32);
        assert_eq!(output.entry_sizes(), ragged.entry_sizes());

        let empty = RaggedTensor::construct(&[], &RaggedOptions::default()).unwrap();
        let output = cast(&empty, DataType::Int32, &RunOptions::default()).unwrap();
        assert_eq!(output.dtype(), DataType::Int32);
    }

    #[test]
    fn test_apply_generic() {
        let ragged = ragged_3x3_2x3();
        let opts = RunOptions::default();

        let output = apply(
            &Operation::Reduce {
                op: ReduceOp::Sum,
                axis: None,
                keep_dims: false,
            },
            &[Arg::Ragged(&ragged)],
            &opts,
        )
        .unwrap();
        assert_eq!(output, Output::Scalar(Tensor::from_data(&[], vec![111.]).into()));

        let output = apply(
            &Operation::Binary(BinaryOp::Max),
            &[Arg::from(&ragged), Arg::from(12.)],
            &opts,
        )
        .unwrap()
        .into_ragged()
        .unwrap();
        assert_eq!(floats(output.get(1).unwrap()), [12., 12., 12., 13., 14., 15.]);

        let output = apply(
            &Operation::Reshape { shape: vec![9] },
            &[Arg::Ragged(&ragged)],
            &opts,
        );
        assert!(matches!(output, Err(RaggedError::ShapeMismatch(_))));

        assert!(matches!(
            apply(&Operation::Unary(UnaryOp::Exp), &[], &opts),
            Err(RaggedError::InvalidValue(_))
        ));
        assert!(matches!(
            apply(&Operation::Unary(UnaryOp::Exp), &[Arg::from(1.)], &opts),
            Err(RaggedError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_unsupported_operation() {
        let ragged = RaggedTensor::adopt(vec![ints(&[2], vec![1, 2])], &RaggedOptions::default())
            .unwrap();
        assert_eq!(
            apply_unary(UnaryOp::Exp, &ragged, &RunOptions::default()).err(),
            Some(RaggedError::UnsupportedOperation {
                op: "Exp".to_string(),
                dtype: Some(DataType::Int32)
            })
        );
    }

    #[test]
    fn test_in_place() {
        let mut ragged = ragged_3x3_2x3();
        let opts = RunOptions::default();

        apply_unary_in_place(UnaryOp::Neg, &mut ragged, &opts).unwrap();
        assert_eq!(floats(ragged.get(0).unwrap())[1], -1.);

        apply_binary_in_place(BinaryOp::Add, &mut ragged, 1.0, &opts).unwrap();
        assert_eq!(floats(ragged.get(0).unwrap())[1], 0.);

        // A failed update leaves the container unchanged.
        let before = ragged.clone();
        let column: Value = arange(&[3, 1], 0.);
        let result = apply_binary_in_place(BinaryOp::Add, &mut ragged, &column, &opts);
        assert!(matches!(result, Err(RaggedError::ShapeMismatch(_))));
        assert_eq!(ragged, before);
    }

    #[test]
    fn test_cancel() {
        let ragged = ragged_3x3_2x3();
        let cancel = CancelToken::new();
        cancel.cancel();
        let opts = RunOptions {
            cancel: Some(cancel),
            strategy: ExecutionStrategy::PerEntry,
            ..Default::default()
        };
        assert_eq!(
            apply_unary(UnaryOp::Neg, &ragged, &opts).err(),
            Some(RaggedError::Cancelled)
        );
        assert_eq!(
            reduce(ReduceOp::Sum, &ragged, None, false, None, &opts).err(),
            Some(RaggedError::Cancelled)
        );
    }

    #[test]
    fn test_custom_thread_pool() {
        let ragged = ragged_3x3_2x3();
        let opts = RunOptions {
            thread_pool: Some(Arc::new(ThreadPool::with_num_threads(1))),
            ..Default::default()
        };
        let output = apply_unary(UnaryOp::Abs, &ragged, &opts).unwrap();
        assert_eq!(output, ragged);
    }

    /// Kernel which counts invocations and forwards to the CPU kernel.
    struct CountingKernel {
        calls: AtomicUsize,
        inner: CpuKernel,
    }

    impl Kernel for CountingKernel {
        fn name(&self) -> &str {
            "counting"
        }

        fn supports(&self, op: &Operation, dtype: DataType) -> bool {
            self.inner.supports(op, dtype)
        }

        fn apply(&self, op: &Operation, inputs: &[&Value]) -> Result<Value, OpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.apply(op, inputs)
        }
    }

    #[test]
    fn test_injected_backend() {
        let kernel = Arc::new(CountingKernel {
            calls: AtomicUsize::new(0),
            inner: CpuKernel::new(),
        });
        let backend = Backend::new(kernel.clone(), Arc::new(CpuAllocator::new()));
        let ragged = ragged_3x3_2x3().with_backend(backend);

        let output =
            apply_unary(UnaryOp::Sqrt, &ragged, &with_strategy(ExecutionStrategy::PerEntry))
                .unwrap();
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 2);
        assert_eq!(output.backend().kernel.name(), "counting");

        apply_unary(UnaryOp::Sqrt, &ragged, &with_strategy(ExecutionStrategy::Padded)).unwrap();
        assert_eq!(kernel.calls.load(Ordering::SeqCst), 3);
    }
}
