//! Dense values that make up the entries of a ragged tensor.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::fmt::Display;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

/// Enum specifying the data type of a tensor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DataType {
    Int32,
    Float,
}

impl DataType {
    /** Return the size of elements of this type in bytes. */
    pub fn size(self) -> u8 {
        match self {
            DataType::Int32 | DataType::Float => 4,
        }
    }
}

/// Get the [`DataType`] that corresponds to a given type.
pub trait DataTypeOf {
    /// Return the data type that corresponds to the `Self` type.
    fn dtype_of() -> DataType;
}

macro_rules! impl_data_type_of {
    ($type:ty, $dtype:ident) => {
        impl DataTypeOf for $type {
            fn dtype_of() -> DataType {
                DataType::$dtype
            }
        }
    };
}

impl_data_type_of!(f32, Float);
impl_data_type_of!(i32, Int32);

impl Display for DataType {
    /// Format this enum value in the style of the corresponding Rust type (eg.
    /// "i32" for `DataType::Int32`).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DataType::Float => "f32",
                DataType::Int32 => "i32",
            }
        )
    }
}

/// A single number of one of the supported data types.
///
/// Scalars are used as fill values for padding and allocation, and as operands
/// which are broadcast to every entry of a ragged tensor.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    Float(f32),
    Int32(i32),
}

impl Scalar {
    pub fn dtype(&self) -> DataType {
        match self {
            Scalar::Float(_) => DataType::Float,
            Scalar::Int32(_) => DataType::Int32,
        }
    }

    /// Convert this scalar to an `f32`.
    pub fn to_f32(self) -> f32 {
        match self {
            Scalar::Float(x) => x,
            Scalar::Int32(x) => x as f32,
        }
    }

    /// Convert this scalar to an `i32`, truncating floats towards zero.
    pub fn to_i32(self) -> i32 {
        match self {
            Scalar::Float(x) => x as i32,
            Scalar::Int32(x) => x,
        }
    }

    /// Convert this scalar to a given data type.
    pub fn cast(self, dtype: DataType) -> Scalar {
        match dtype {
            DataType::Float => Scalar::Float(self.to_f32()),
            DataType::Int32 => Scalar::Int32(self.to_i32()),
        }
    }
}

impl From<f32> for Scalar {
    fn from(x: f32) -> Scalar {
        Scalar::Float(x)
    }
}

impl From<i32> for Scalar {
    fn from(x: i32) -> Scalar {
        Scalar::Int32(x)
    }
}

impl Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Int32(x) => write!(f, "{}", x),
        }
    }
}

/// Identifier for the device that holds the data of a tensor.
///
/// Devices are opaque to this crate. All entries of a ragged tensor must live
/// on the same device, and operands of an operation must agree on the device.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Device {
    name: Cow<'static, str>,
}

impl Device {
    /// Return the host CPU device.
    pub const fn cpu() -> Device {
        Device {
            name: Cow::Borrowed("cpu"),
        }
    }

    /// Create a device with a given name, such as "cuda:0".
    pub fn new(name: impl Into<String>) -> Device {
        Device {
            name: Cow::Owned(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cpu(&self) -> bool {
        self.name == "cpu"
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Metadata about a tensor.
///
/// This is used in errors which need to describe a tensor but not its content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueMeta {
    pub(crate) dtype: DataType,
    pub(crate) shape: Vec<usize>,
}

impl Display for ValueMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Produces strings such as "f32 [1, 16, 256]"
        write!(f, "{} {:?}", self.dtype, self.shape)
    }
}

/// Errors when casting a [`Value`] to a tensor of a specific type.
#[derive(Debug, Eq, PartialEq)]
pub enum CastError {
    /// The data type of elements does not match.
    WrongType {
        actual: DataType,
        expected: DataType,
    },

    /// The value is not a scalar.
    NotScalar { ndim: usize },
}

impl Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongType { actual, expected } => {
                write!(
                    f,
                    "expected tensor with type {} but has type {}",
                    expected, actual
                )
            }
            Self::NotScalar { ndim } => {
                write!(f, "expected tensor with 0 dims but has {} dims", ndim)
            }
        }
    }
}

impl Error for CastError {}

/// Element types which can be stored in a [`Value`].
///
/// This allows algorithms to be written once, generic over the element type,
/// and then invoked by matching on the [`DataType`] of a value.
pub trait Element:
    DataTypeOf + Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    /// Convert a scalar to this type.
    fn from_scalar(value: Scalar) -> Self;

    /// Wrap a value of this type as a scalar.
    fn to_scalar(self) -> Scalar;

    /// Return the tensor inside `value` if it has this element type.
    fn tensor_of(value: &Value) -> Option<&Tensor<Self>>;

    /// Mutable variant of [`tensor_of`](Element::tensor_of).
    fn tensor_of_mut(value: &mut Value) -> Option<&mut Tensor<Self>>;

    /// Wrap a tensor of this type as a value.
    fn into_value(tensor: Tensor<Self>) -> Value;
}

macro_rules! impl_element {
    ($type:ty, $variant:ident, $scalar:ident, $convert:ident) => {
        impl Element for $type {
            fn from_scalar(value: Scalar) -> Self {
                value.$convert()
            }

            fn to_scalar(self) -> Scalar {
                Scalar::$scalar(self)
            }

            fn tensor_of(value: &Value) -> Option<&Tensor<Self>> {
                match value {
                    Value::$variant(t) => Some(t),
                    _ => None,
                }
            }

            fn tensor_of_mut(value: &mut Value) -> Option<&mut Tensor<Self>> {
                match value {
                    Value::$variant(t) => Some(t),
                    _ => None,
                }
            }

            fn into_value(tensor: Tensor<Self>) -> Value {
                Value::$variant(tensor)
            }
        }
    };
}

impl_element!(f32, FloatTensor, Float, to_f32);
impl_element!(i32, Int32Tensor, Int32, to_i32);

/// An owned dense tensor of one of the supported data types.
///
/// Values are the entries of a [`RaggedTensor`](crate::RaggedTensor) and the
/// inputs and outputs of [`Kernel`](crate::ops::Kernel) operations.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Value {
    FloatTensor(Tensor<f32>),
    Int32Tensor(Tensor<i32>),
}

/// Evaluate an expression with `$t` bound to the typed tensor inside a value.
macro_rules! map_value {
    ($value:expr, $t:ident, $body:expr) => {
        match $value {
            Value::FloatTensor($t) => $body,
            Value::Int32Tensor($t) => $body,
        }
    };
}
pub(crate) use map_value;

impl Value {
    /// Return the data type of elements in this tensor.
    pub fn dtype(&self) -> DataType {
        match self {
            Self::FloatTensor(_) => DataType::Float,
            Self::Int32Tensor(_) => DataType::Int32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        map_value!(self, t, t.shape())
    }

    pub fn ndim(&self) -> usize {
        map_value!(self, t, t.ndim())
    }

    /// Return the number of elements in this tensor.
    pub fn len(&self) -> usize {
        map_value!(self, t, t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a tensor of a given shape and type, filled with `fill`.
    pub fn full(shape: &[usize], dtype: DataType, fill: Scalar) -> Value {
        match dtype {
            DataType::Float => Tensor::full(shape, fill.to_f32()).into(),
            DataType::Int32 => Tensor::full(shape, fill.to_i32()).into(),
        }
    }

    /// Create a tensor with zero dimensions from a scalar.
    pub fn from_scalar(value: Scalar) -> Value {
        match value {
            Scalar::Float(x) => Tensor::from_data(&[], vec![x]).into(),
            Scalar::Int32(x) => Tensor::from_data(&[], vec![x]).into(),
        }
    }

    /// Return the element of a tensor with zero dimensions.
    pub fn item(&self) -> Result<Scalar, CastError> {
        if self.ndim() != 0 {
            return Err(CastError::NotScalar { ndim: self.ndim() });
        }
        let item = match self {
            Value::FloatTensor(t) => t.iter().next().map(|x| Scalar::Float(*x)),
            Value::Int32Tensor(t) => t.iter().next().map(|x| Scalar::Int32(*x)),
        };
        // A tensor with zero dims always has exactly one element.
        item.ok_or(CastError::NotScalar { ndim: 0 })
    }

    /// Return a copy of this tensor converted to a given data type.
    pub fn cast(&self, dtype: DataType) -> Value {
        match (self, dtype) {
            (Value::FloatTensor(_), DataType::Float) | (Value::Int32Tensor(_), DataType::Int32) => {
                self.clone()
            }
            (Value::FloatTensor(t), DataType::Int32) => t.map(|x| *x as i32).into(),
            (Value::Int32Tensor(t), DataType::Float) => t.map(|x| *x as f32).into(),
        }
    }

    /// Return the tensor with element type `T`, or `None` if the type differs.
    pub fn as_tensor<T: Element>(&self) -> Option<&Tensor<T>> {
        T::tensor_of(self)
    }

    /// Extract shape and data type information from this tensor.
    pub fn to_meta(&self) -> ValueMeta {
        ValueMeta {
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
        }
    }
}

/// Declare conversions between `Value` and `Tensor<T>`.
macro_rules! impl_value_conversions {
    ($variant:ident, $element_type:ty) => {
        impl From<Tensor<$element_type>> for Value {
            fn from(t: Tensor<$element_type>) -> Value {
                Value::$variant(t)
            }
        }

        impl TryFrom<Value> for Tensor<$element_type> {
            type Error = CastError;

            fn try_from(o: Value) -> Result<Tensor<$element_type>, Self::Error> {
                let dtype = o.dtype();
                match o {
                    Value::$variant(t) => Ok(t),
                    #[allow(unreachable_patterns)]
                    _ => Err(CastError::WrongType {
                        actual: dtype,
                        expected: <$element_type as DataTypeOf>::dtype_of(),
                    }),
                }
            }
        }

        impl<'a> TryFrom<&'a Value> for &'a Tensor<$element_type> {
            type Error = CastError;

            fn try_from(o: &'a Value) -> Result<&'a Tensor<$element_type>, CastError> {
                <$element_type as Element>::tensor_of(o).ok_or(CastError::WrongType {
                    actual: o.dtype(),
                    expected: <$element_type as DataTypeOf>::dtype_of(),
                })
            }
        }
    };
}

impl_value_conversions!(FloatTensor, f32);
impl_value_conversions!(Int32Tensor, i32);
