use std::iter::repeat;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use smallvec::SmallVec;

use crate::ops::{BinaryOp, Number, OpError};
use crate::value::Value;

/// Given the shapes of two inputs to a binary operation, return the shape
/// that will result from broadcasting them following NumPy rules or `None`
/// if the shapes are not compatible.
///
/// Broadcasting works by left-padding the input shapes with 1s so they are
/// the same length, then matching dimensions starting from the right. For
/// each dimension, the values are compatible if they are the same or one of
/// them is 1. The larger of the two values is the size of that dimension in
/// the output shape.
///
/// See https://numpy.org/doc/stable/user/basics.broadcasting.html#general-broadcasting-rules
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<SmallVec<[usize; 4]>> {
    let a_pad = b.len().saturating_sub(a.len());
    let b_pad = a.len().saturating_sub(b.len());

    let a_iter = a.iter().copied().rev().chain(repeat(1).take(a_pad));
    let b_iter = b.iter().copied().rev().chain(repeat(1).take(b_pad));

    let mut result = SmallVec::with_capacity(a.len().max(b.len()));
    for (a, b) in a_iter.zip(b_iter) {
        if a == b {
            result.push(a);
        } else if a == 1 {
            result.push(b);
        } else if b == 1 {
            result.push(a);
        } else {
            return None;
        }
    }
    result.reverse();

    Some(result)
}

/// Apply an elementwise function to two tensors, broadcasting them to a
/// common shape.
///
/// `op` returns `None` if the result for a pair of elements is undefined, in
/// which case the whole operation fails.
fn binary_op<T: Clone, F: Fn(T, T) -> Option<T>>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    op: F,
) -> Result<Tensor<T>, OpError> {
    let out_shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        OpError::IncompatibleInputShapes(format!(
            "cannot broadcast {:?} with {:?}",
            a.shape(),
            b.shape()
        ))
    })?;

    let a = a.broadcast(out_shape.as_slice());
    let b = b.broadcast(out_shape.as_slice());
    let out_data: Option<Vec<T>> = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| op(x.clone(), y.clone()))
        .collect();

    let out_data = out_data.ok_or(OpError::InvalidValue("division by zero"))?;
    Ok(Tensor::from_data(out_shape.as_slice(), out_data))
}

/// Compare elements, producing one where `op` holds and zero elsewhere.
fn compare_op<T: Number, F: Fn(&T, &T) -> bool>(
    a: &Tensor<T>,
    b: &Tensor<T>,
    op: F,
) -> Result<Tensor<T>, OpError> {
    binary_op(a, b, |x, y| Some(if op(&x, &y) { T::one() } else { T::zero() }))
}

fn binary_number<T: Number>(
    op: BinaryOp,
    a: &Tensor<T>,
    b: &Tensor<T>,
) -> Result<Tensor<T>, OpError> {
    match op {
        BinaryOp::Add => binary_op(a, b, |x, y| Some(x.add_elem(y))),
        BinaryOp::Sub => binary_op(a, b, |x, y| Some(x.sub_elem(y))),
        BinaryOp::Mul => binary_op(a, b, |x, y| Some(x.mul_elem(y))),
        BinaryOp::Div => binary_op(a, b, |x, y| x.div_elem(y)),
        BinaryOp::Max => binary_op(a, b, |x, y| Some(x.max_elem(y))),
        BinaryOp::Min => binary_op(a, b, |x, y| Some(x.min_elem(y))),
        BinaryOp::Equal => compare_op(a, b, |x, y| x == y),
        BinaryOp::NotEqual => compare_op(a, b, |x, y| x != y),
        BinaryOp::Pow => Err(OpError::UnsupportedOperation {
            op: op.name(),
            dtype: T::dtype_of(),
        }),
    }
}

pub fn binary(op: BinaryOp, a: &Value, b: &Value) -> Result<Value, OpError> {
    match (a, b) {
        (Value::FloatTensor(a), Value::FloatTensor(b)) => match op {
            BinaryOp::Pow => binary_op(a, b, |x: f32, y: f32| Some(x.powf(y))),
            _ => binary_number(op, a, b),
        }
        .map(|t| t.into()),
        (Value::Int32Tensor(a), Value::Int32Tensor(b)) => {
            binary_number(op, a, b).map(|t| t.into())
        }
        _ => Err(OpError::TypeMismatch {
            expected: a.dtype(),
            actual: b.dtype(),
        }),
    }
}
