//! The ragged tensor container.

use std::fmt;
use std::sync::Arc;

use rten_tensor::prelude::*;
use rten_tensor::Tensor;

use crate::env::env_flag;
use crate::errors::RaggedError;
use crate::nested_node::NestedNode;
use crate::ops::{Allocator, CpuAllocator, CpuKernel, Kernel};
use crate::shape::ShapeDescriptor;
use crate::value::{map_value, DataType, Device, Element, Value};

/// Controls which invariants are checked eagerly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VerificationLevel {
    /// Check the invariants needed to construct a consistent container.
    Basic,

    /// Additionally re-derive and check container invariants after every
    /// operation, and check mask population counts during padding.
    Full,
}

impl VerificationLevel {
    /// Return [`VerificationLevel::Full`] if the `RTEN_RAGGED_VERIFY`
    /// environment flag is set, or [`VerificationLevel::Basic`] otherwise.
    pub fn from_env() -> VerificationLevel {
        if env_flag("RTEN_RAGGED_VERIFY", false) {
            VerificationLevel::Full
        } else {
            VerificationLevel::Basic
        }
    }
}

impl Default for VerificationLevel {
    fn default() -> Self {
        Self::from_env()
    }
}

/// The kernel and allocator used to run operations on a ragged tensor.
#[derive(Clone)]
pub struct Backend {
    pub kernel: Arc<dyn Kernel>,
    pub allocator: Arc<dyn Allocator>,
}

impl Backend {
    pub fn new(kernel: Arc<dyn Kernel>, allocator: Arc<dyn Allocator>) -> Backend {
        Backend { kernel, allocator }
    }

    /// Return a backend which uses [`CpuKernel`] and [`CpuAllocator`].
    pub fn cpu() -> Backend {
        Backend::new(Arc::new(CpuKernel::new()), Arc::new(CpuAllocator::new()))
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("kernel", &self.kernel.name())
            .finish_non_exhaustive()
    }
}

/// Options for constructing a [`RaggedTensor`].
#[derive(Clone, Debug, Default)]
pub struct RaggedOptions {
    /// Data type of the container. If set, entries are converted to this
    /// type. Otherwise all entries must have the same type, and an empty
    /// container has type [`DataType::Float`].
    pub dtype: Option<DataType>,

    /// Device which holds the entries. Defaults to the CPU.
    pub device: Option<Device>,

    /// Flag carried through operations. This crate does not compute
    /// gradients.
    pub requires_grad: bool,

    pub verification: VerificationLevel,
    pub backend: Backend,
}

/// A batch of dense tensors whose shapes may differ, grouped into one or more
/// leading "structural" dimensions.
///
/// The entries of a ragged tensor all have the same data type, device and
/// rank. A tensor with nesting depth 1 is a flat list of entries. Deeper
/// nesting groups entries into lists of lists, described by a
/// [`NestedNode`] tree whose leaves are at depth `nesting_depth`.
///
/// Dimension `d` of a ragged tensor is structural if `d < nesting_depth`.
/// Other dimensions index into the entries at local dimension
/// `d - nesting_depth`.
#[derive(Clone)]
pub struct RaggedTensor {
    entries: Vec<Value>,

    /// Grouping of entries. Leaves are indices into `entries`, in order.
    structure: NestedNode<usize>,
    shape: ShapeDescriptor,
    dtype: DataType,
    device: Device,
    requires_grad: bool,
    verification: VerificationLevel,
    backend: Backend,
}

impl RaggedTensor {
    /// Create a ragged tensor with nesting depth 1 from copies of `entries`.
    pub fn construct(entries: &[Value], options: &RaggedOptions) -> Result<Self, RaggedError> {
        Self::adopt(entries.to_vec(), options)
    }

    /// Create a ragged tensor with nesting depth 1 which takes ownership of
    /// `entries` without copying them.
    ///
    /// Element data of the entries can then be modified in place via
    /// [`get_mut`](RaggedTensor::get_mut).
    pub fn adopt(entries: Vec<Value>, options: &RaggedOptions) -> Result<Self, RaggedError> {
        Self::nested(NestedNode::from_leaves(entries), options)
    }

    /// Create a ragged tensor whose nesting depth is the height of
    /// `entries`.
    ///
    /// Every leaf must be at the same depth.
    pub fn nested(entries: NestedNode<Value>, options: &RaggedOptions) -> Result<Self, RaggedError> {
        let nesting_depth = entries.height();
        let empty_dtype = options.dtype.unwrap_or(DataType::Float);
        Self::build(entries, nesting_depth, options, empty_dtype, 0)
    }

    /// Create a ragged tensor from a grouping tree that is balanced at
    /// `nesting_depth`.
    ///
    /// `empty_dtype` and `empty_inner_rank` are used for containers without
    /// entries, if `options` does not specify a type.
    pub(crate) fn build(
        tree: NestedNode<Value>,
        nesting_depth: usize,
        options: &RaggedOptions,
        empty_dtype: DataType,
        empty_inner_rank: usize,
    ) -> Result<Self, RaggedError> {
        if nesting_depth == 0 {
            return Err(RaggedError::ShapeMismatch(
                "a ragged tensor must have at least one structural dimension".into(),
            ));
        }
        if !tree.is_balanced_at(nesting_depth) {
            return Err(RaggedError::ShapeMismatch(format!(
                "entries must all be at nesting depth {}",
                nesting_depth
            )));
        }

        let mut next_index = 0;
        let structure = tree.map(|_| {
            let index = next_index;
            next_index += 1;
            index
        });
        let mut entries = tree.into_leaves();

        let dtype = match options.dtype {
            Some(dtype) => {
                for entry in entries.iter_mut().filter(|e| e.dtype() != dtype) {
                    *entry = entry.cast(dtype);
                }
                dtype
            }
            None => {
                let dtype = entries.first().map(|e| e.dtype()).unwrap_or(empty_dtype);
                if let Some((index, entry)) = entries
                    .iter()
                    .enumerate()
                    .find(|(_, e)| e.dtype() != dtype)
                {
                    return Err(RaggedError::DtypeOrDeviceMismatch(format!(
                        "entry {} has type {} but entry 0 has type {}",
                        index,
                        entry.dtype(),
                        dtype
                    )));
                }
                dtype
            }
        };

        let shapes = entries.iter().map(|e| e.shape().to_vec()).collect();
        let shape = ShapeDescriptor::new(&structure, nesting_depth, shapes, empty_inner_rank)?;

        let ragged = RaggedTensor {
            entries,
            structure,
            shape,
            dtype,
            device: options.device.clone().unwrap_or_default(),
            requires_grad: options.requires_grad,
            verification: options.verification,
            backend: options.backend.clone(),
        };
        if ragged.verification == VerificationLevel::Full {
            ragged.verify()?;
        }
        Ok(ragged)
    }

    /// Create a container with the same grouping, device and backend as
    /// `self`, but different entries.
    pub(crate) fn with_entries(
        &self,
        entries: Vec<Value>,
        empty_dtype: DataType,
        empty_inner_rank: usize,
    ) -> Result<Self, RaggedError> {
        if entries.len() != self.entries.len() {
            return Err(RaggedError::ShapeMismatch(format!(
                "expected {} entries but got {}",
                self.entries.len(),
                entries.len()
            )));
        }
        let tree = self.structure.with_leaves(entries).ok_or_else(|| {
            RaggedError::ShapeMismatch("entries do not match grouping".to_string())
        })?;
        let options = RaggedOptions {
            dtype: None,
            ..self.options()
        };
        Self::build(
            tree,
            self.nesting_depth(),
            &options,
            empty_dtype,
            empty_inner_rank,
        )
    }

    /// Return the options which reproduce the type, device, flags and
    /// backend of this container.
    pub fn options(&self) -> RaggedOptions {
        RaggedOptions {
            dtype: Some(self.dtype),
            device: Some(self.device.clone()),
            requires_grad: self.requires_grad,
            verification: self.verification,
            backend: self.backend.clone(),
        }
    }

    /// Re-derive the container invariants from the entries and check that
    /// they hold.
    pub fn verify(&self) -> Result<(), RaggedError> {
        let in_order = self.structure.num_leaves() == self.entries.len()
            && self
                .structure
                .leaves()
                .into_iter()
                .enumerate()
                .all(|(i, &index)| i == index);
        if !in_order {
            return Err(RaggedError::InvalidValue(
                "grouping tree does not match entries".into(),
            ));
        }

        if let Some((index, entry)) = self
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.dtype() != self.dtype)
        {
            return Err(RaggedError::DtypeOrDeviceMismatch(format!(
                "entry {} has type {} but container has type {}",
                index,
                entry.dtype(),
                self.dtype
            )));
        }

        let shapes = self.entries.iter().map(|e| e.shape().to_vec()).collect();
        let derived = ShapeDescriptor::new(
            &self.structure,
            self.nesting_depth(),
            shapes,
            self.shape.inner_rank(),
        )?;
        if derived != self.shape {
            return Err(RaggedError::ShapeMismatch(
                "shape descriptor does not match entries".into(),
            ));
        }
        Ok(())
    }

    /// Return the size of the first structural dimension.
    pub fn len(&self) -> usize {
        self.structure.degree()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the number of entries across all groups.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn nesting_depth(&self) -> usize {
        self.shape.nesting_depth()
    }

    /// Return the total rank, including structural dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn verification(&self) -> VerificationLevel {
        self.verification
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Replace the backend used for operations on this container.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Return the total number of elements across all entries.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn shape(&self) -> &ShapeDescriptor {
        &self.shape
    }

    /// Return the size of every dimension, or `None` for ragged dimensions.
    pub fn sizes(&self) -> Vec<Option<usize>> {
        self.shape.sizes()
    }

    /// Return the shape of each entry, in order.
    pub fn entry_sizes(&self) -> Vec<Vec<usize>> {
        self.shape.entry_shapes().to_vec()
    }

    /// Return the shapes of entries, grouped in the same way as the entries.
    pub fn nested_size(&self) -> NestedNode<Vec<usize>> {
        self.structure.map(|&i| self.entries[i].shape().to_vec())
    }

    pub(crate) fn structure(&self) -> &NestedNode<usize> {
        &self.structure
    }

    /// Return the entry at `index`, counting across all groups.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.entries.get(index)
    }

    /// Return the elements of the entry at `index` for modification, or
    /// `None` if the index is out of range or the entry does not have
    /// element type `T`.
    ///
    /// Only element values can be changed, so the shape of the container is
    /// unaffected.
    pub fn get_mut<T: Element>(&mut self, index: usize) -> Option<&mut [T]> {
        self.entries
            .get_mut(index)
            .and_then(T::tensor_of_mut)
            .and_then(|t| t.data_mut())
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    /// Return the elements of every entry for modification.
    ///
    /// This yields nothing if the container does not have element type `T`.
    pub fn entries_mut<T: Element>(&mut self) -> impl Iterator<Item = &mut [T]> + '_ {
        self.entries
            .iter_mut()
            .filter_map(|e| T::tensor_of_mut(e).and_then(|t| t.data_mut()))
    }

    pub fn into_entries(self) -> Vec<Value> {
        self.entries
    }

    /// Return an iterator over the entries, in order.
    ///
    /// The iterator can be cloned to restart iteration.
    pub fn unbind(&self) -> Unbind<'_> {
        Unbind {
            iter: self.entries.iter(),
        }
    }

    /// Split the first structural dimension, returning one container with
    /// nesting depth `nesting_depth - 1` per top-level group.
    pub fn unbind_outer(&self) -> Result<Vec<RaggedTensor>, RaggedError> {
        let depth = self.nesting_depth();
        if depth < 2 {
            return Err(RaggedError::InvalidValue(format!(
                "unbind_outer requires a nesting depth of at least 2 but depth is {}",
                depth
            )));
        }
        let options = self.options();
        self.structure
            .children()
            .iter()
            .map(|group| {
                let tree = group.map(|&i| self.entries[i].clone());
                Self::build(tree, depth - 1, &options, self.dtype, self.shape.inner_rank())
            })
            .collect()
    }

    /// Convert to a dense tensor of shape `(n0, n1, ..., *inner)`.
    ///
    /// Fails with [`RaggedError::ShapeMismatch`] if any dimension is ragged.
    pub fn to_tensor(&self) -> Result<Value, RaggedError> {
        let shape = self
            .sizes()
            .into_iter()
            .enumerate()
            .map(|(dim, size)| {
                size.ok_or_else(|| {
                    RaggedError::ShapeMismatch(format!(
                        "cannot convert to a dense tensor because dimension {} is ragged",
                        dim
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(match self.dtype {
            DataType::Float => stack::<f32>(&self.entries, &shape).into(),
            DataType::Int32 => stack::<i32>(&self.entries, &shape).into(),
        })
    }

    /// Increase the nesting depth to `dim + 1` by splitting entries along
    /// their leading dimensions.
    ///
    /// If `dim` is already a structural dimension, the container is returned
    /// unchanged.
    pub fn to_nested_tensor(&self, dim: usize) -> Result<RaggedTensor, RaggedError> {
        let ndim = self.ndim();
        if dim >= ndim {
            return Err(RaggedError::DimensionOutOfRange { dim, ndim });
        }
        let depth = self.nesting_depth();
        if dim < depth {
            return Ok(self.clone());
        }

        let levels = dim + 1 - depth;
        let tree = self
            .structure
            .map(|&i| &self.entries[i])
            .expand_leaves(|entry| split_leading(entry, levels));
        Self::build(
            tree,
            dim + 1,
            &self.options(),
            self.dtype,
            self.shape.inner_rank() - levels,
        )
    }
}

/// Concatenate the elements of `entries` into a tensor of a given shape.
fn stack<T: Element>(entries: &[Value], shape: &[usize]) -> Tensor<T> {
    let mut data = Vec::with_capacity(shape.iter().product());
    for tensor in entries.iter().filter_map(T::tensor_of) {
        data.extend(tensor.iter().copied());
    }
    Tensor::from_data(shape, data)
}

/// Split a tensor into its slices along the first dimension.
fn unstack<T: Clone>(tensor: &Tensor<T>) -> Vec<Tensor<T>> {
    if tensor.ndim() == 0 {
        return Vec::new();
    }
    tensor.axis_iter(0).map(|slice| slice.to_tensor()).collect()
}

/// Split the leading `levels` dimensions of an entry into nested groups.
fn split_leading(entry: &Value, levels: usize) -> NestedNode<Value> {
    if levels == 0 {
        return NestedNode::Leaf(entry.clone());
    }
    let parts: Vec<Value> = map_value!(entry, t, unstack(t).into_iter().map(Value::from).collect());
    NestedNode::List(
        parts
            .iter()
            .map(|part| split_leading(part, levels - 1))
            .collect(),
    )
}

impl PartialEq for RaggedTensor {
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype
            && self.device == other.device
            && self.shape == other.shape
            && self.entries == other.entries
    }
}

impl fmt::Debug for RaggedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaggedTensor")
            .field("nesting_depth", &self.nesting_depth())
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("sizes", &self.sizes())
            .field("entries", &self.entries)
            .finish()
    }
}

/// Iterator over the entries of a ragged tensor. See
/// [`RaggedTensor::unbind`].
#[derive(Clone)]
pub struct Unbind<'a> {
    iter: std::slice::Iter<'a, Value>,
}

impl<'a> Iterator for Unbind<'a> {
    type Item = &'a Value;

    fn next(&mut self) -> Option<&'a Value> {
        self.iter.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}

impl DoubleEndedIterator for Unbind<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.iter.next_back()
    }
}

impl ExactSizeIterator for Unbind<'_> {}
