use rten_tensor::prelude::*;
use rten_tensor::Tensor;
use smallvec::SmallVec;

use crate::ops::OpError;
use crate::value::{map_value, Value};

fn transpose_tensor<T: Clone>(input: &Tensor<T>, dim0: usize, dim1: usize) -> Tensor<T> {
    let mut order: SmallVec<[usize; 4]> = (0..input.ndim()).collect();
    order.swap(dim0, dim1);
    input.permuted(order.as_slice()).to_tensor()
}

/// Swap two dimensions of a tensor, returning a contiguous copy.
///
/// The caller must ensure `dim0` and `dim1` are valid.
pub fn transpose(input: &Value, dim0: usize, dim1: usize) -> Value {
    map_value!(input, t, transpose_tensor(t, dim0, dim1).into())
}

/// Return a copy of `input` with a new shape containing the same number of
/// elements.
pub fn reshape(input: &Value, shape: &[usize]) -> Result<Value, OpError> {
    let len: usize = shape.iter().product();
    if len != input.len() {
        return Err(OpError::IncompatibleInputShapes(format!(
            "cannot reshape {:?} ({} elements) to {:?}",
            input.shape(),
            input.len(),
            shape
        )));
    }
    Ok(map_value!(input, t, t.to_shape(shape).into()))
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::Tensor;

    use super::{reshape, transpose};
    use crate::ops::OpError;
    use crate::value::Value;

    #[test]
    fn test_transpose() {
        let input: Value = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]).into();
        let result: Tensor<i32> = transpose(&input, 0, 1).try_into().unwrap();
        assert_eq!(result.shape(), &[3, 2]);
        assert_eq!(result.to_vec(), [1, 4, 2, 5, 3, 6]);

        // Swapping a dim with itself is a copy.
        let same: Tensor<i32> = transpose(&input, 1, 1).try_into().unwrap();
        assert_eq!(same.shape(), &[2, 3]);
        assert_eq!(same.to_vec(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_transpose_3d() {
        let input: Value = Tensor::from_data(&[2, 1, 2], vec![1., 2., 3., 4.]).into();
        let result: Tensor<f32> = transpose(&input, 0, 2).try_into().unwrap();
        assert_eq!(result.shape(), &[2, 1, 2]);
        assert_eq!(result.to_vec(), [1., 3., 2., 4.]);
    }

    #[test]
    fn test_transpose_non_contiguous() {
        let mut input = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]);
        input.transpose();
        let input: Value = input.into();

        let result: Tensor<i32> = transpose(&input, 0, 1).try_into().unwrap();
        assert_eq!(result.shape(), &[2, 3]);
        assert_eq!(result.to_vec(), [1, 2, 3, 4, 5, 6]);

        let reshaped: Tensor<i32> = reshape(&input, &[6]).unwrap().try_into().unwrap();
        assert_eq!(reshaped.to_vec(), [1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_reshape() {
        let input: Value = Tensor::from_data(&[2, 3], vec![1, 2, 3, 4, 5, 6]).into();
        let result: Tensor<i32> = reshape(&input, &[3, 2]).unwrap().try_into().unwrap();
        assert_eq!(result.shape(), &[3, 2]);
        assert_eq!(result.to_vec(), [1, 2, 3, 4, 5, 6]);

        assert!(matches!(
            reshape(&input, &[4]),
            Err(OpError::IncompatibleInputShapes(_))
        ));
    }
}
