//! Per-dimension extents of a ragged tensor.

use crate::errors::RaggedError;
use crate::nested_node::NestedNode;

/// The extent of one dimension of a ragged tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extent {
    /// The dimension has the same size everywhere.
    Regular(usize),

    /// The dimension size varies. For a non-structural dimension this holds
    /// one size per entry. For a structural dimension it holds one size per
    /// group at that level.
    Ragged(Vec<usize>),
}

impl Extent {
    /// Create an extent from a list of sizes, which is regular if the sizes
    /// are all equal.
    ///
    /// An empty list produces `Regular(0)`.
    pub fn from_sizes(sizes: Vec<usize>) -> Extent {
        match sizes.first() {
            None => Extent::Regular(0),
            Some(&first) if sizes.iter().all(|&s| s == first) => Extent::Regular(first),
            Some(_) => Extent::Ragged(sizes),
        }
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, Extent::Regular(_))
    }

    /// Return the largest size of this dimension.
    pub fn max(&self) -> usize {
        match self {
            Extent::Regular(size) => *size,
            Extent::Ragged(sizes) => sizes.iter().copied().max().unwrap_or(0),
        }
    }

    /// Return the size as an `Option`, which is `None` for ragged extents.
    pub fn as_regular(&self) -> Option<usize> {
        match self {
            Extent::Regular(size) => Some(*size),
            Extent::Ragged(_) => None,
        }
    }
}

/// Describes the shape of a ragged tensor.
///
/// The descriptor is derived from the grouping tree and entry shapes of a
/// container and is never edited independently of them. Two descriptors are
/// equal if they have the same nesting depth, inner rank and extents in every
/// dimension, with ragged extents compared per entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeDescriptor {
    nesting_depth: usize,
    inner_rank: usize,

    /// Group sizes for each structural dimension.
    group_extents: Vec<Extent>,

    /// Shape of each entry, in depth-first order.
    entry_shapes: Vec<Vec<usize>>,
}

impl ShapeDescriptor {
    /// Derive a descriptor from a grouping tree, balanced at depth
    /// `nesting_depth`, and the shapes of its leaves.
    ///
    /// `inner_rank` is used when the container has no entries. Otherwise it
    /// is taken from the first entry and every other entry must agree.
    pub(crate) fn new<T>(
        structure: &NestedNode<T>,
        nesting_depth: usize,
        entry_shapes: Vec<Vec<usize>>,
        inner_rank: usize,
    ) -> Result<ShapeDescriptor, RaggedError> {
        debug_assert!(structure.is_balanced_at(nesting_depth));
        let inner_rank = entry_shapes.first().map(|s| s.len()).unwrap_or(inner_rank);

        if let Some((entry, shape)) = entry_shapes
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() != inner_rank)
        {
            return Err(RaggedError::RankMismatch {
                entry,
                expected: inner_rank,
                actual: shape.len(),
            });
        }

        let group_extents = (0..nesting_depth)
            .map(|level| {
                let sizes = structure.nodes_at(level).iter().map(|n| n.degree()).collect();
                Extent::from_sizes(sizes)
            })
            .collect();

        Ok(ShapeDescriptor {
            nesting_depth,
            inner_rank,
            group_extents,
            entry_shapes,
        })
    }

    /// Return the number of leading dimensions which enumerate entries.
    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth
    }

    /// Return the number of dimensions of each entry.
    pub fn inner_rank(&self) -> usize {
        self.inner_rank
    }

    /// Return the total rank, `nesting_depth + inner_rank`.
    pub fn ndim(&self) -> usize {
        self.nesting_depth + self.inner_rank
    }

    pub fn num_entries(&self) -> usize {
        self.entry_shapes.len()
    }

    /// Return the shape of each entry, in order.
    pub fn entry_shapes(&self) -> &[Vec<usize>] {
        &self.entry_shapes
    }

    /// Return the total number of elements across all entries.
    pub fn numel(&self) -> usize {
        self.entry_shapes
            .iter()
            .map(|s| s.iter().product::<usize>())
            .sum()
    }

    /// Return true if `dim` enumerates entries or groups of entries.
    pub fn is_structural(&self, dim: usize) -> bool {
        dim < self.nesting_depth
    }

    /// Return the extent of dimension `dim`.
    pub fn extents(&self, dim: usize) -> Result<Extent, RaggedError> {
        if dim >= self.ndim() {
            return Err(RaggedError::DimensionOutOfRange {
                dim,
                ndim: self.ndim(),
            });
        }
        if self.is_structural(dim) {
            return Ok(self.group_extents[dim].clone());
        }
        let local_dim = dim - self.nesting_depth;
        Ok(Extent::from_sizes(
            self.entry_shapes.iter().map(|s| s[local_dim]).collect(),
        ))
    }

    /// Return the size of every dimension, or `None` for ragged dimensions.
    pub fn sizes(&self) -> Vec<Option<usize>> {
        self.all_extents().map(|e| e.as_regular()).collect()
    }

    /// Return the largest size of every dimension. This is the shape of the
    /// padded form of the container.
    pub fn max_extents(&self) -> Vec<usize> {
        self.all_extents().map(|e| e.max()).collect()
    }

    /// Return true if any dimension, structural or not, is ragged.
    pub fn has_ragged_dims(&self) -> bool {
        self.all_extents().any(|e| !e.is_regular())
    }

    fn all_extents(&self) -> impl Iterator<Item = Extent> + '_ {
        self.group_extents.iter().cloned().chain(
            (0..self.inner_rank).map(|d| {
                Extent::from_sizes(self.entry_shapes.iter().map(|s| s[d]).collect())
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use rten_testing::TestCases;

    use super::{Extent, ShapeDescriptor};
    use crate::errors::RaggedError;
    use crate::nested_node::NestedNode;

    fn descriptor(shapes: &[&[usize]]) -> ShapeDescriptor {
        let structure = NestedNode::from_leaves(0..shapes.len());
        let shapes = shapes.iter().map(|s| s.to_vec()).collect();
        ShapeDescriptor::new(&structure, 1, shapes, 0).unwrap()
    }

    #[test]
    fn test_extent_from_sizes() {
        #[derive(Debug)]
        struct Case {
            sizes: Vec<usize>,
            expected: Extent,
        }

        let cases = [
            Case {
                sizes: vec![],
                expected: Extent::Regular(0),
            },
            Case {
                sizes: vec![3, 3],
                expected: Extent::Regular(3),
            },
            Case {
                sizes: vec![3, 2],
                expected: Extent::Ragged(vec![3, 2]),
            },
        ];

        cases.test_each(|case| {
            assert_eq!(Extent::from_sizes(case.sizes.clone()), case.expected);
        })
    }

    #[test]
    fn test_extents() {
        let desc = descriptor(&[&[3, 3], &[2, 3]]);
        assert_eq!(desc.nesting_depth(), 1);
        assert_eq!(desc.inner_rank(), 2);
        assert_eq!(desc.ndim(), 3);
        assert_eq!(desc.extents(0), Ok(Extent::Regular(2)));
        assert_eq!(desc.extents(1), Ok(Extent::Ragged(vec![3, 2])));
        assert_eq!(desc.extents(2), Ok(Extent::Regular(3)));
        assert_eq!(
            desc.extents(3),
            Err(RaggedError::DimensionOutOfRange { dim: 3, ndim: 3 })
        );
        assert!(desc.is_structural(0));
        assert!(!desc.is_structural(1));
        assert_eq!(desc.sizes(), [Some(2), None, Some(3)]);
        assert_eq!(desc.max_extents(), [2, 3, 3]);
        assert_eq!(desc.numel(), 15);
        assert!(desc.has_ragged_dims());
    }

    #[test]
    fn test_nested_extents() {
        let structure = NestedNode::List(vec![
            NestedNode::from_leaves([0, 1]),
            NestedNode::from_leaves([2]),
        ]);
        let shapes = vec![vec![4], vec![4], vec![4]];
        let desc = ShapeDescriptor::new(&structure, 2, shapes, 0).unwrap();
        assert_eq!(desc.nesting_depth(), 2);
        assert_eq!(desc.extents(0), Ok(Extent::Regular(2)));
        assert_eq!(desc.extents(1), Ok(Extent::Ragged(vec![2, 1])));
        assert_eq!(desc.sizes(), [Some(2), None, Some(4)]);
        assert_eq!(desc.max_extents(), [2, 2, 4]);
    }

    #[test]
    fn test_empty_groups() {
        let structure: NestedNode<usize> = NestedNode::List(vec![]);
        let desc = ShapeDescriptor::new(&structure, 2, vec![], 3).unwrap();
        assert_eq!(desc.ndim(), 5);
        assert_eq!(desc.num_entries(), 0);
        assert_eq!(desc.sizes(), [Some(0), Some(0), Some(0), Some(0), Some(0)]);
    }

    #[test]
    fn test_rank_mismatch() {
        let structure = NestedNode::from_leaves(0..2);
        let result = ShapeDescriptor::new(&structure, 1, vec![vec![2, 2], vec![2]], 0);
        assert_eq!(
            result,
            Err(RaggedError::RankMismatch {
                entry: 1,
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_equality() {
        assert_eq!(descriptor(&[&[3, 3], &[2, 3]]), descriptor(&[&[3, 3], &[2, 3]]));
        assert_ne!(descriptor(&[&[3, 3], &[2, 3]]), descriptor(&[&[2, 3], &[3, 3]]));
        assert_ne!(descriptor(&[&[3, 3]]), descriptor(&[&[3, 3], &[3, 3]]));
    }
}
