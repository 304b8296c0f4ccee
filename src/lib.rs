//! rten-ragged provides ragged tensors: ordered collections of dense tensors
//! whose sizes may differ, which can be used as a single tensor.
//!
//! # Overview
//!
//! A [`RaggedTensor`] holds a list of entries, each of which is a dense
//! [`Value`]. Entries must share a data type, device and number of dims, but
//! may differ in size. Entries can be nested to any depth using
//! [`RaggedTensor::nested`]. The leading dims of a ragged tensor are
//! _structural_ dims which index into the nested lists. The remaining dims are
//! those of the entries. The size of each dim is reported by
//! [`RaggedTensor::shape`], which gives [`Extent::Ragged`] for dims whose
//! size differs between entries.
//!
//! # Operations
//!
//! Operations on dense tensors are applied to ragged tensors using the
//! functions in [`dispatch`]. Elementwise operations can be evaluated either
//! entry by entry or on a padded form of the tensor (see
//! [`ExecutionStrategy`]). Reductions over non-structural dims reduce each
//! entry independently. A reduction over all dims produces a single value.
//!
//! Methods of the entries can also be called by name using a [`Batch`] view.
//!
//! # Padding and masks
//!
//! [`RaggedTensor::to_padded`] converts a ragged tensor into a dense tensor
//! plus a [`ValidityMask`] which records which elements are real data.
//! [`RaggedTensor::from_padded`] and [`RaggedTensor::from_tensor_mask`]
//! convert back.
//!
//! # Backends
//!
//! Entry-level operations are computed by a [`Kernel`](ops::Kernel) and
//! storage is obtained from an [`Allocator`](ops::Allocator). Both are
//! supplied to a ragged tensor via a [`Backend`]. The default backend computes
//! on the CPU.
//!
//! ## Threading
//!
//! Operations on entries run in parallel using a Rayon
//! [ThreadPool](https://docs.rs/rayon/latest/rayon/struct.ThreadPool.html)
//! which is sized to match the number of physical cores. You can access this
//! pool using [`thread_pool`], or supply your own via [`RunOptions`].
//!
//! ## Environment variables
//!
//! - `RTEN_NUM_THREADS` sets the size of the default thread pool.
//! - `RTEN_RAGGED_VERIFY` sets the default [`VerificationLevel`].

mod batch;
mod env;
mod errors;
mod nested_node;
mod padding;
mod ragged;
mod shape;
mod threading;
mod value;

pub mod dispatch;
pub mod ops;

pub use batch::Batch;
pub use dispatch::{Arg, CancelToken, ExecutionStrategy, Output, RunOptions};
pub use errors::RaggedError;
pub use nested_node::NestedNode;
pub use padding::{PaddedForm, ValidityMask};
pub use ragged::{Backend, RaggedOptions, RaggedTensor, Unbind, VerificationLevel};
pub use shape::{Extent, ShapeDescriptor};
pub use threading::{thread_pool, ThreadPool};
pub use value::{CastError, DataType, DataTypeOf, Device, Element, Scalar, Value, ValueMeta};
