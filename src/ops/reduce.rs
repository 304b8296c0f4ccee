use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::ops::{Number, OpError, ReduceOp};
use crate::value::{DataType, Value};

/// Trait for reducing a subset of elements from a tensor to a single value.
///
/// This is a trait rather than a closure to support being invoked with
/// dynamically chosen iterator types.
trait Reducer<T> {
    /// Reduce the elements of `iter`, or return `None` if the result is
    /// undefined for an empty sequence.
    fn reduce<I: ExactSizeIterator<Item = T>>(&self, iter: I) -> Option<T>;
}

struct SumReducer;

impl<T: Number> Reducer<T> for SumReducer {
    fn reduce<I: ExactSizeIterator<Item = T>>(&self, iter: I) -> Option<T> {
        Some(iter.fold(T::zero(), |acc, x| acc.add_elem(x)))
    }
}

struct ProdReducer;

impl<T: Number> Reducer<T> for ProdReducer {
    fn reduce<I: ExactSizeIterator<Item = T>>(&self, iter: I) -> Option<T> {
        Some(iter.fold(T::one(), |acc, x| acc.mul_elem(x)))
    }
}

struct MaxReducer;

impl<T: Number> Reducer<T> for MaxReducer {
    fn reduce<I: ExactSizeIterator<Item = T>>(&self, iter: I) -> Option<T> {
        iter.reduce(|acc, x| acc.max_elem(x))
    }
}

struct MinReducer;

impl<T: Number> Reducer<T> for MinReducer {
    fn reduce<I: ExactSizeIterator<Item = T>>(&self, iter: I) -> Option<T> {
        iter.reduce(|acc, x| acc.min_elem(x))
    }
}

struct MeanReducer;

impl Reducer<f32> for MeanReducer {
    fn reduce<I: ExactSizeIterator<Item = f32>>(&self, iter: I) -> Option<f32> {
        // The mean of an empty sequence is NaN.
        let len = iter.len();
        Some(iter.sum::<f32>() / len as f32)
    }
}

fn reduce_with<T: Clone, R: Reducer<T>>(
    input: &Tensor<T>,
    axis: Option<usize>,
    keep_dims: bool,
    reducer: R,
) -> Result<Tensor<T>, OpError> {
    let empty_err = || OpError::InvalidValue("cannot reduce empty tensor");

    let Some(axis) = axis else {
        let reduced = reducer.reduce(input.iter().cloned()).ok_or_else(empty_err)?;
        let shape = if keep_dims {
            vec![1; input.ndim()]
        } else {
            Vec::new()
        };
        return Ok(Tensor::from_data(&shape, vec![reduced]));
    };

    let mut reduced_shape = input.shape().to_vec();
    if keep_dims {
        reduced_shape[axis] = 1;
    } else {
        reduced_shape.remove(axis);
    }

    let reduced_data = if input.size(axis) == 0 {
        // There are no lanes along an empty axis, but every output element
        // is still the reduction of an empty sequence.
        let len: usize = reduced_shape.iter().product();
        if len == 0 {
            Vec::new()
        } else {
            let reduced = reducer.reduce(std::iter::empty()).ok_or_else(empty_err)?;
            vec![reduced; len]
        }
    } else {
        input
            .lanes(axis)
            .map(|lane| reducer.reduce(lane.cloned()).ok_or_else(empty_err))
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(Tensor::from_data(&reduced_shape, reduced_data))
}

fn reduce_number<T: Number>(
    op: ReduceOp,
    input: &Tensor<T>,
    axis: Option<usize>,
    keep_dims: bool,
) -> Result<Tensor<T>, OpError> {
    match op {
        ReduceOp::Sum => reduce_with(input, axis, keep_dims, SumReducer),
        ReduceOp::Prod => reduce_with(input, axis, keep_dims, ProdReducer),
        ReduceOp::Max => reduce_with(input, axis, keep_dims, MaxReducer),
        ReduceOp::Min => reduce_with(input, axis, keep_dims, MinReducer),
        ReduceOp::Mean => Err(OpError::UnsupportedOperation {
            op: op.name(),
            dtype: T::dtype_of(),
        }),
    }
}

/// Reduce `input` along `axis`, or over all elements if `axis` is `None`.
pub fn reduce(
    op: ReduceOp,
    input: &Value,
    axis: Option<usize>,
    keep_dims: bool,
) -> Result<Value, OpError> {
    match input {
        Value::FloatTensor(t) if op == ReduceOp::Mean => {
            reduce_with(t, axis, keep_dims, MeanReducer).map(|t| t.into())
        }
        Value::FloatTensor(t) => reduce_number(op, t, axis, keep_dims).map(|t| t.into()),
        Value::Int32Tensor(t) => reduce_number(op, t, axis, keep_dims).map(|t| t.into()),
    }
}

fn cum_sum_tensor<T: Number>(input: &Tensor<T>, axis: usize) -> Tensor<T> {
    let mut output = input.to_tensor();
    for lane in output.lanes_mut(axis) {
        let mut cum_sum = T::zero();
        for x in lane {
            cum_sum = cum_sum.add_elem(*x);
            *x = cum_sum;
        }
    }
    output
}

/// Compute the cumulative sum of `input` along `axis`.
pub fn cum_sum(input: &Value, axis: usize) -> Result<Value, OpError> {
    Ok(match input {
        Value::FloatTensor(t) => cum_sum_tensor(t, axis).into(),
        Value::Int32Tensor(t) => cum_sum_tensor(t, axis).into(),
    })
}

fn softmax_tensor(input: &Tensor<f32>, axis: usize) -> Tensor<f32> {
    let mut output = input.to_tensor();
    for lane in output.lanes_mut(axis) {
        let mut lane: Vec<&mut f32> = lane.collect();

        // Numerically stable softmax. See
        // https://ogunlao.github.io/2020/04/26/you_dont_really_know_softmax.html.
        let max_val = lane
            .iter()
            .fold(f32::NEG_INFINITY, |max_val, x| max_val.max(**x));
        let mut exp_sum = 0.0;
        for x in lane.iter_mut() {
            **x = (**x - max_val).exp();
            exp_sum += **x;
        }
        for x in lane {
            *x /= exp_sum;
        }
    }
    output
}

/// Compute the softmax of `input` along `axis`.
pub fn softmax(input: &Value, axis: usize) -> Result<Value, OpError> {
    match input {
        Value::FloatTensor(t) => Ok(softmax_tensor(t, axis).into()),
        Value::Int32Tensor(_) => Err(OpError::UnsupportedOperation {
            op: "Softmax",
            dtype: DataType::Int32,
        }),
    }
}
