//! Trees describing how the entries of a ragged tensor are grouped.

/// A tree whose leaves hold values and whose inner nodes are ordered lists.
///
/// A ragged tensor with nesting depth `k` groups its entries with a tree of
/// height `k`, where every leaf is at depth `k`. Lists may be empty, in which
/// case they describe an empty group.
#[derive(Clone, Debug, PartialEq)]
pub enum NestedNode<T> {
    Leaf(T),
    List(Vec<NestedNode<T>>),
}

impl<T> NestedNode<T> {
    /// Create a list node whose children are all leaves.
    pub fn from_leaves(leaves: impl IntoIterator<Item = T>) -> NestedNode<T> {
        NestedNode::List(leaves.into_iter().map(NestedNode::Leaf).collect())
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NestedNode::Leaf(_))
    }

    /// Return the child nodes, or an empty slice for a leaf.
    pub fn children(&self) -> &[NestedNode<T>] {
        match self {
            NestedNode::Leaf(_) => &[],
            NestedNode::List(children) => children,
        }
    }

    /// Return the number of children of this node.
    pub fn degree(&self) -> usize {
        self.children().len()
    }

    /// Return the length of the longest path from this node to a leaf.
    ///
    /// A leaf has height 0. A list has height one greater than its tallest
    /// child, so an empty list has height 1.
    pub fn height(&self) -> usize {
        match self {
            NestedNode::Leaf(_) => 0,
            NestedNode::List(children) => {
                1 + children.iter().map(|c| c.height()).max().unwrap_or(0)
            }
        }
    }

    /// Return true if every leaf is at the same depth, equal to the height
    /// of the tree.
    pub fn is_balanced(&self) -> bool {
        self.is_balanced_at(self.height())
    }

    /// Return true if every leaf is at depth `depth` and every list is at a
    /// depth less than `depth`.
    ///
    /// A tree without leaves is balanced at any depth not less than its
    /// height.
    pub fn is_balanced_at(&self, depth: usize) -> bool {
        match self {
            NestedNode::Leaf(_) => depth == 0,
            NestedNode::List(children) => {
                depth > 0 && children.iter().all(|c| c.is_balanced_at(depth - 1))
            }
        }
    }

    /// Return the leaf values in depth-first order.
    pub fn leaves(&self) -> Vec<&T> {
        fn collect<'a, T>(node: &'a NestedNode<T>, out: &mut Vec<&'a T>) {
            match node {
                NestedNode::Leaf(value) => out.push(value),
                NestedNode::List(children) => children.iter().for_each(|c| collect(c, out)),
            }
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    /// Consume the tree and return its leaf values in depth-first order.
    pub fn into_leaves(self) -> Vec<T> {
        fn collect<T>(node: NestedNode<T>, out: &mut Vec<T>) {
            match node {
                NestedNode::Leaf(value) => out.push(value),
                NestedNode::List(children) => children.into_iter().for_each(|c| collect(c, out)),
            }
        }
        let mut out = Vec::new();
        collect(self, &mut out);
        out
    }

    pub fn num_leaves(&self) -> usize {
        match self {
            NestedNode::Leaf(_) => 1,
            NestedNode::List(children) => children.iter().map(|c| c.num_leaves()).sum(),
        }
    }

    /// Return the nodes at depth `level`, in order. Level 0 is `self`.
    pub fn nodes_at(&self, level: usize) -> Vec<&NestedNode<T>> {
        let mut nodes = vec![self];
        for _ in 0..level {
            nodes = nodes.into_iter().flat_map(|n| n.children()).collect();
        }
        nodes
    }

    /// Apply `f` to every leaf, preserving the structure.
    pub fn map<U, F: FnMut(&T) -> U>(&self, mut f: F) -> NestedNode<U> {
        fn map_node<T, U, F: FnMut(&T) -> U>(node: &NestedNode<T>, f: &mut F) -> NestedNode<U> {
            match node {
                NestedNode::Leaf(value) => NestedNode::Leaf(f(value)),
                NestedNode::List(children) => {
                    NestedNode::List(children.iter().map(|c| map_node(c, f)).collect())
                }
            }
        }
        map_node(self, &mut f)
    }

    /// Fallible variant of [`map`](NestedNode::map). Stops at the first
    /// error.
    pub fn try_map<U, E, F: FnMut(&T) -> Result<U, E>>(
        &self,
        mut f: F,
    ) -> Result<NestedNode<U>, E> {
        fn map_node<T, U, E, F: FnMut(&T) -> Result<U, E>>(
            node: &NestedNode<T>,
            f: &mut F,
        ) -> Result<NestedNode<U>, E> {
            match node {
                NestedNode::Leaf(value) => f(value).map(NestedNode::Leaf),
                NestedNode::List(children) => children
                    .iter()
                    .map(|c| map_node(c, f))
                    .collect::<Result<Vec<_>, _>>()
                    .map(NestedNode::List),
            }
        }
        map_node(self, &mut f)
    }

    /// Replace every leaf with the subtree returned by `f`.
    pub fn expand_leaves<U, F: FnMut(T) -> NestedNode<U>>(self, mut f: F) -> NestedNode<U> {
        fn expand<T, U, F: FnMut(T) -> NestedNode<U>>(
            node: NestedNode<T>,
            f: &mut F,
        ) -> NestedNode<U> {
            match node {
                NestedNode::Leaf(value) => f(value),
                NestedNode::List(children) => {
                    NestedNode::List(children.into_iter().map(|c| expand(c, f)).collect())
                }
            }
        }
        expand(self, &mut f)
    }

    /// Return a tree with the same structure as `self` whose leaves are taken
    /// in order from `leaves`, or `None` if `leaves` is too short.
    pub fn with_leaves<U>(&self, leaves: impl IntoIterator<Item = U>) -> Option<NestedNode<U>> {
        fn build<T, U>(
            node: &NestedNode<T>,
            leaves: &mut impl Iterator<Item = U>,
        ) -> Option<NestedNode<U>> {
            match node {
                NestedNode::Leaf(_) => leaves.next().map(NestedNode::Leaf),
                NestedNode::List(children) => children
                    .iter()
                    .map(|c| build(c, leaves))
                    .collect::<Option<Vec<_>>>()
                    .map(NestedNode::List),
            }
        }
        build(self, &mut leaves.into_iter())
    }

    /// Return true if `self` and `other` have the same shape, ignoring leaf
    /// values.
    pub fn same_structure<U>(&self, other: &NestedNode<U>) -> bool {
        match (self, other) {
            (NestedNode::Leaf(_), NestedNode::Leaf(_)) => true,
            (NestedNode::List(a), NestedNode::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.same_structure(b))
            }
            _ => false,
        }
    }
}

impl<T> From<Vec<NestedNode<T>>> for NestedNode<T> {
    fn from(children: Vec<NestedNode<T>>) -> NestedNode<T> {
        NestedNode::List(children)
    }
}
