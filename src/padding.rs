//! Conversion between ragged tensors and padded dense tensors with masks.

use std::iter::zip;

use rayon::prelude::*;
use rten_tensor::prelude::*;
use rten_tensor::{SliceItem, Tensor, TensorView, TensorViewMut};

use crate::errors::RaggedError;
use crate::nested_node::NestedNode;
use crate::ragged::{RaggedOptions, RaggedTensor, VerificationLevel};
use crate::threading::{thread_pool, ThreadPool};
use crate::value::{map_value, Element, Scalar, Value};

/// Boolean tensor marking which positions of a padded tensor hold entry
/// elements.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidityMask {
    mask: Tensor<bool>,
}

impl ValidityMask {
    pub fn from_tensor(mask: Tensor<bool>) -> ValidityMask {
        ValidityMask { mask }
    }

    /// Create a mask from a shape and its elements in row-major order.
    pub fn from_data(shape: &[usize], data: Vec<bool>) -> ValidityMask {
        ValidityMask {
            mask: Tensor::from_data(shape, data),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.mask.shape()
    }

    pub fn ndim(&self) -> usize {
        self.mask.ndim()
    }

    pub fn as_tensor(&self) -> &Tensor<bool> {
        &self.mask
    }

    pub fn into_tensor(self) -> Tensor<bool> {
        self.mask
    }

    /// Return the elements in row-major order.
    pub fn to_vec(&self) -> Vec<bool> {
        self.mask.to_vec()
    }

    /// Return the number of valid positions.
    pub fn count_valid(&self) -> usize {
        self.mask.iter().filter(|&&valid| valid).count()
    }
}

/// A dense tensor holding the entries of a ragged tensor, plus a mask of
/// valid positions.
#[derive(Clone, Debug, PartialEq)]
pub struct PaddedForm {
    /// Tensor with the shape of the largest extent in every dimension.
    pub data: Value,

    /// Mask with the same shape as `data`.
    pub mask: ValidityMask,
}

impl RaggedTensor {
    /// Convert to a dense tensor whose shape is the maximum extent of every
    /// dimension. Positions not covered by an entry are set to `pad`.
    ///
    /// The padded buffer is created with the container's allocator.
    pub fn to_padded(&self, pad: impl Into<Scalar>) -> Result<PaddedForm, RaggedError> {
        self.to_padded_in(pad.into(), thread_pool())
    }

    pub(crate) fn to_padded_in(
        &self,
        pad: Scalar,
        pool: &ThreadPool,
    ) -> Result<PaddedForm, RaggedError> {
        let padded_shape = self.shape().max_extents();
        let depth = self.nesting_depth();

        let mut data = self.backend().allocator.new_dense(
            &padded_shape,
            self.dtype(),
            self.device(),
            pad.cast(self.dtype()),
        )?;
        if data.dtype() != self.dtype() {
            return Err(RaggedError::DtypeOrDeviceMismatch(format!(
                "allocator returned type {} but {} was requested",
                data.dtype(),
                self.dtype()
            )));
        }
        if data.shape() != padded_shape.as_slice() {
            return Err(RaggedError::ShapeMismatch(format!(
                "allocator returned shape {:?} but {:?} was requested",
                data.shape(),
                padded_shape
            )));
        }

        let slots = slot_entries(self.structure(), &padded_shape[..depth]);
        let row_shape = &padded_shape[depth..];
        let entries = self.entries();
        pool.run(|| map_value!(&mut data, t, fill_rows(t, row_shape, &slots, entries)))?;

        let mask = self.fill_mask(&padded_shape, pool);
        if self.verification() == VerificationLevel::Full && mask.count_valid() != self.numel() {
            return Err(RaggedError::InvalidValue(format!(
                "mask has {} valid positions but container has {} elements",
                mask.count_valid(),
                self.numel()
            )));
        }

        tracing::trace!(shape = ?padded_shape, "padded ragged tensor");
        Ok(PaddedForm { data, mask })
    }

    /// Convert to a padded tensor and a mask which covers dimensions
    /// `[0, mask_dim)` of it.
    ///
    /// `mask_dim` defaults to the rank of the container. It must be at least
    /// the nesting depth, and every dimension from `mask_dim` onwards must be
    /// regular, since the mask cannot describe variation in those
    /// dimensions. Padding positions in the returned tensor are zero.
    pub fn to_tensor_mask(
        &self,
        mask_dim: Option<usize>,
    ) -> Result<(Value, ValidityMask), RaggedError> {
        let mask_dim = self.check_mask_dim(mask_dim)?;
        let padded = self.to_padded(Scalar::Int32(0))?;
        let mask = if mask_dim == self.ndim() {
            padded.mask
        } else {
            self.fill_mask(&padded.data.shape()[..mask_dim], thread_pool())
        };
        Ok((padded.data, mask))
    }

    /// Return the mask of [`to_tensor_mask`](RaggedTensor::to_tensor_mask)
    /// without creating the padded tensor.
    pub fn to_mask(&self, mask_dim: Option<usize>) -> Result<ValidityMask, RaggedError> {
        let mask_dim = self.check_mask_dim(mask_dim)?;
        let max_extents = self.shape().max_extents();
        Ok(self.fill_mask(&max_extents[..mask_dim], thread_pool()))
    }

    fn check_mask_dim(&self, mask_dim: Option<usize>) -> Result<usize, RaggedError> {
        let ndim = self.ndim();
        let mask_dim = mask_dim.unwrap_or(ndim);
        if mask_dim < self.nesting_depth() || mask_dim > ndim {
            return Err(RaggedError::DimensionOutOfRange { dim: mask_dim, ndim });
        }
        let sizes = self.sizes();
        if let Some(dim) = (mask_dim..ndim).find(|&d| sizes[d].is_none()) {
            return Err(RaggedError::ShapeMismatch(format!(
                "dimension {} is ragged, so the mask must cover it",
                dim
            )));
        }
        Ok(mask_dim)
    }

    /// Create a mask of a given shape, which must be a prefix of the padded
    /// shape with at least `nesting_depth` dims.
    fn fill_mask(&self, mask_shape: &[usize], pool: &ThreadPool) -> ValidityMask {
        let depth = self.nesting_depth();
        let slots = slot_entries(self.structure(), &mask_shape[..depth]);
        let row_shape = &mask_shape[depth..];
        let row_len: usize = row_shape.iter().product();
        let mut mask = vec![false; mask_shape.iter().product()];

        if row_len > 0 {
            let entries = self.entries();
            pool.run(|| {
                mask.par_chunks_mut(row_len)
                    .zip(slots.par_iter())
                    .for_each(|(row, slot)| {
                        let Some(index) = *slot else {
                            return;
                        };
                        let entry_shape = &entries[index].shape()[..row_shape.len()];
                        TensorViewMut::from_data(row_shape, row)
                            .slice_mut(leading_corner(entry_shape).as_slice())
                            .fill(true);
                    })
            });
        }

        ValidityMask::from_data(mask_shape, mask)
    }

    /// Create a ragged tensor by extracting entries from a padded tensor.
    ///
    /// `sizes` gives the grouping of entries and the shape of each one. Each
    /// entry is taken from the leading corner of its slot in `data`. The
    /// nesting depth is the height of `sizes`.
    pub fn from_padded(
        data: &Value,
        sizes: &NestedNode<Vec<usize>>,
        options: &RaggedOptions,
    ) -> Result<RaggedTensor, RaggedError> {
        let depth = sizes.height();
        if depth == 0 || !sizes.is_balanced() {
            return Err(RaggedError::ShapeMismatch(
                "entry sizes must all be at the same nesting depth".into(),
            ));
        }
        Self::from_padded_at(data, sizes, depth, options, thread_pool())
    }

    /// Variant of [`from_padded`](RaggedTensor::from_padded) with an explicit
    /// nesting depth, which may exceed the height of `sizes` if it has empty
    /// groups.
    pub(crate) fn from_padded_at(
        data: &Value,
        sizes: &NestedNode<Vec<usize>>,
        depth: usize,
        options: &RaggedOptions,
        pool: &ThreadPool,
    ) -> Result<RaggedTensor, RaggedError> {
        let padded_shape = data.shape();
        if padded_shape.len() < depth {
            return Err(RaggedError::ShapeMismatch(format!(
                "padded tensor has {} dims but nesting depth is {}",
                padded_shape.len(),
                depth
            )));
        }
        let inner_rank = padded_shape.len() - depth;

        for (level, &padded_size) in padded_shape[..depth].iter().enumerate() {
            if let Some(group) = sizes
                .nodes_at(level)
                .into_iter()
                .find(|n| n.degree() > padded_size)
            {
                return Err(RaggedError::ShapeMismatch(format!(
                    "group of size {} exceeds padded size {} in dimension {}",
                    group.degree(),
                    padded_size,
                    level
                )));
            }
        }

        let entry_sizes = sizes.leaves();
        for (entry, size) in entry_sizes.iter().enumerate() {
            if size.len() != inner_rank {
                return Err(RaggedError::RankMismatch {
                    entry,
                    expected: inner_rank,
                    actual: size.len(),
                });
            }
            if let Some(dim) = (0..inner_rank).find(|&d| size[d] > padded_shape[depth + d]) {
                return Err(RaggedError::ShapeMismatch(format!(
                    "entry {} has size {} in dimension {} which exceeds padded size {}",
                    entry,
                    size[dim],
                    depth + dim,
                    padded_shape[depth + dim]
                )));
            }
        }

        let slots = leaf_slots(sizes, &padded_shape[..depth]);
        let row_shape = &padded_shape[depth..];
        let entries =
            pool.run(|| map_value!(data, t, extract_rows(t, row_shape, &slots, &entry_sizes)));

        let tree = sizes.with_leaves(entries).ok_or_else(|| {
            RaggedError::ShapeMismatch("entries do not match grouping".to_string())
        })?;
        RaggedTensor::build(tree, depth, options, data.dtype(), inner_rank)
    }

    /// Create a ragged tensor from a padded tensor and a mask of valid
    /// positions.
    ///
    /// The mask covers a prefix of the dimensions of `tensor`, of length at
    /// least `nesting_depth`. The size of each group is one more than the
    /// index of its last slot with any valid position. The valid positions of
    /// each entry must form a box anchored at the origin of its slot, whose
    /// size gives the entry's extents in the masked dimensions. Dimensions
    /// not covered by the mask are taken at full size.
    pub fn from_tensor_mask(
        tensor: &Value,
        mask: &ValidityMask,
        nesting_depth: usize,
        options: &RaggedOptions,
    ) -> Result<RaggedTensor, RaggedError> {
        if nesting_depth == 0 {
            return Err(RaggedError::ShapeMismatch(
                "a ragged tensor must have at least one structural dimension".into(),
            ));
        }
        let mask_shape = mask.shape();
        if mask_shape.len() < nesting_depth {
            return Err(RaggedError::MalformedMask(format!(
                "mask has {} dims but nesting depth is {}",
                mask_shape.len(),
                nesting_depth
            )));
        }
        if mask_shape.len() > tensor.ndim() || mask_shape != &tensor.shape()[..mask_shape.len()] {
            return Err(RaggedError::MalformedMask(format!(
                "mask shape {:?} is not a prefix of tensor shape {:?}",
                mask_shape,
                tensor.shape()
            )));
        }

        let unmasked = &tensor.shape()[mask_shape.len()..];
        let mut next_entry = 0;
        let sizes = mask_groups(
            mask.as_tensor().view(),
            nesting_depth,
            unmasked,
            &mut next_entry,
        )?;
        Self::from_padded_at(tensor, &sizes, nesting_depth, options, thread_pool())
    }
}

/// Return the row-major slot index of each leaf of `structure` in a padded
/// tensor whose structural dimensions have sizes `slot_shape`.
///
/// Child `c` of a node in slot `b` at level `l` is in slot
/// `b * slot_shape[l] + c`.
fn leaf_slots<T>(structure: &NestedNode<T>, slot_shape: &[usize]) -> Vec<usize> {
    fn visit<T>(
        node: &NestedNode<T>,
        slot_shape: &[usize],
        level: usize,
        base: usize,
        out: &mut Vec<usize>,
    ) {
        match node {
            NestedNode::Leaf(_) => out.push(base),
            NestedNode::List(children) => {
                for (c, child) in children.iter().enumerate() {
                    visit(child, slot_shape, level + 1, base * slot_shape[level] + c, out);
                }
            }
        }
    }
    let mut slots = Vec::new();
    visit(structure, slot_shape, 0, 0, &mut slots);
    slots
}

/// Return the entry which occupies each slot, or `None` for padding slots.
fn slot_entries(structure: &NestedNode<usize>, slot_shape: &[usize]) -> Vec<Option<usize>> {
    let mut slots = vec![None; slot_shape.iter().product()];
    for (entry, slot) in leaf_slots(structure, slot_shape).into_iter().enumerate() {
        slots[slot] = Some(entry);
    }
    slots
}

/// Return slice items which select the leading corner of a slot, with
/// extent `size[d]` in each dim.
fn leading_corner(size: &[usize]) -> Vec<SliceItem> {
    size.iter().map(|&len| (0..len).into()).collect()
}

/// Copy each entry into its slot of a padded tensor.
fn fill_rows<T: Element>(
    padded: &mut Tensor<T>,
    row_shape: &[usize],
    slots: &[Option<usize>],
    entries: &[Value],
) -> Result<(), RaggedError> {
    let row_len: usize = row_shape.iter().product();
    if row_len == 0 {
        return Ok(());
    }
    let buf = padded.data_mut().ok_or_else(|| {
        RaggedError::InvalidValue("allocator returned a non-contiguous tensor".into())
    })?;
    buf.par_chunks_mut(row_len)
        .zip(slots.par_iter())
        .for_each(|(row, slot)| {
            let Some(entry) = slot.and_then(|i| T::tensor_of(&entries[i])) else {
                return;
            };
            if entry.is_empty() {
                return;
            }
            let mut row = TensorViewMut::from_data(row_shape, row);
            row.slice_mut(leading_corner(entry.shape()).as_slice())
                .copy_from(entry);
        });
    Ok(())
}

/// Extract entries of shape `sizes` from their slots of a padded tensor.
fn extract_rows<T: Element>(
    padded: &Tensor<T>,
    row_shape: &[usize],
    slots: &[usize],
    sizes: &[&Vec<usize>],
) -> Vec<Value> {
    let row_len: usize = row_shape.iter().product();
    let data = padded.to_slice();
    slots
        .par_iter()
        .zip(sizes.par_iter())
        .map(|(&slot, size)| {
            let row = &data[slot * row_len..(slot + 1) * row_len];
            let row = TensorView::from_data(row_shape, row);
            T::into_value(row.slice(leading_corner(size).as_slice()).to_tensor())
        })
        .collect()
}

/// Derive the grouping and entry sizes described by a mask, whose first
/// `levels` dims are structural.
fn mask_groups(
    mask: TensorView<bool>,
    levels: usize,
    unmasked: &[usize],
    next_entry: &mut usize,
) -> Result<NestedNode<Vec<usize>>, RaggedError> {
    if levels == 0 {
        let mut size = entry_extents(&mask, *next_entry)?;
        size.extend_from_slice(unmasked);
        *next_entry += 1;
        return Ok(NestedNode::Leaf(size));
    }

    if mask.ndim() == 0 {
        return Err(RaggedError::MalformedMask(
            "mask has fewer dims than the nesting depth".into(),
        ));
    }
    let slots: Vec<TensorView<bool>> = mask.axis_iter(0).collect();
    let group_len = slots
        .iter()
        .rposition(|slot| slot.iter().any(|&valid| valid))
        .map(|i| i + 1)
        .unwrap_or(0);

    slots
        .into_iter()
        .take(group_len)
        .map(|slot| mask_groups(slot, levels - 1, unmasked, next_entry))
        .collect::<Result<Vec<_>, _>>()
        .map(NestedNode::List)
}

/// Return the extents of the valid positions in the mask of one entry.
fn entry_extents(mask: &TensorView<bool>, entry: usize) -> Result<Vec<usize>, RaggedError> {
    let mut extents = vec![0; mask.ndim()];
    let mut count = 0;

    for (index, _) in zip(mask.indices(), mask.iter()).filter(|(_, valid)| **valid) {
        count += 1;
        for (extent, &pos) in zip(extents.iter_mut(), index.iter()) {
            *extent = (*extent).max(pos + 1);
        }
    }

    if count != extents.iter().product::<usize>() {
        return Err(RaggedError::MalformedMask(format!(
            "valid positions of entry {} do not form a box at the start of its slot",
            entry
        )));
    }
    Ok(extents)
}
