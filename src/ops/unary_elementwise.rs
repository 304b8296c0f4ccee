use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::ops::{OpError, UnaryOp};
use crate::value::{DataType, Value};

/// Return the function which applies a float unary op to a single element.
fn float_fn(op: UnaryOp) -> fn(f32) -> f32 {
    match op {
        UnaryOp::Neg => |x: f32| -x,
        UnaryOp::Abs => |x: f32| x.abs(),
        UnaryOp::Exp => |x: f32| x.exp(),
        UnaryOp::Log => |x: f32| x.ln(),
        UnaryOp::Sqrt => |x: f32| x.sqrt(),
        UnaryOp::Relu => |x: f32| x.max(0.),
        UnaryOp::Sigmoid => |x: f32| 1. / (1. + (-x).exp()),
        UnaryOp::Tanh => |x: f32| x.tanh(),
        UnaryOp::Sin => |x: f32| x.sin(),
        UnaryOp::Cos => |x: f32| x.cos(),
    }
}

pub fn unary_int(op: UnaryOp, input: &Tensor<i32>) -> Result<Tensor<i32>, OpError> {
    let f: fn(i32) -> i32 = match op {
        UnaryOp::Neg => |x: i32| x.wrapping_neg(),
        UnaryOp::Abs => |x: i32| x.wrapping_abs(),
        UnaryOp::Relu => |x: i32| x.max(0),
        _ => {
            return Err(OpError::UnsupportedOperation {
                op: op.name(),
                dtype: DataType::Int32,
            })
        }
    };
    Ok(input.map(|x| f(*x)))
}

pub fn unary_float(op: UnaryOp, input: &Tensor<f32>) -> Tensor<f32> {
    let f = float_fn(op);
    input.map(|x| f(*x))
}

pub fn unary(op: UnaryOp, input: &Value) -> Result<Value, OpError> {
    match input {
        Value::FloatTensor(t) => Ok(unary_float(op, t).into()),
        Value::Int32Tensor(t) => unary_int(op, t).map(|t| t.into()),
    }
}
