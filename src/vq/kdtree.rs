//! Exact k-d tree over the codewords of a codebook.
//!
//! The tree borrows the codebook, so it cannot outlive a mutation of it: a
//! tree is built, queried for one batch and dropped.
//!
//! References:
//! - Bentley (1975): "Multidimensional binary search trees used for associative searching"
//! - Friedman, Bentley & Finkel (1977): "An algorithm for finding best matches in
//!   logarithmic expected time"

use super::distance::distance_squared;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Codeword stored at this node.
    point: usize,
    /// Splitting dimension.
    axis: usize,
    /// Coordinate of `point` along `axis`.
    split: f64,
    left: Option<usize>,
    right: Option<usize>,
}

/// A k-d tree over flat row-major codewords.
pub struct KdTree<'a> {
    codewords: &'a [f64],
    dim: usize,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl<'a> KdTree<'a> {
    /// Builds a balanced tree, splitting each subtree at the median of its
    /// widest dimension.
    pub fn build(codewords: &'a [f64], n_codes: usize, dim: usize) -> Self {
        debug_assert_eq!(codewords.len(), n_codes * dim);

        let mut tree = Self {
            codewords,
            dim,
            nodes: Vec::with_capacity(n_codes),
            root: None,
        };

        if dim > 0 {
            let mut indices: Vec<usize> = (0..n_codes).collect();
            tree.root = tree.build_recursive(&mut indices);
        }

        tree
    }

    /// Number of codewords in the tree.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the tree holds no codewords.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    fn point(&self, i: usize) -> &[f64] {
        &self.codewords[i * self.dim..(i + 1) * self.dim]
    }

    fn widest_axis(&self, indices: &[usize]) -> usize {
        let mut best_axis = 0;
        let mut best_spread = f64::NEG_INFINITY;

        for axis in 0..self.dim {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for &i in indices {
                let v = self.codewords[i * self.dim + axis];
                lo = lo.min(v);
                hi = hi.max(v);
            }
            let spread = hi - lo;
            if spread > best_spread {
                best_spread = spread;
                best_axis = axis;
            }
        }

        best_axis
    }

    fn build_recursive(&mut self, indices: &mut [usize]) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let axis = self.widest_axis(indices);
        let codewords = self.codewords;
        let dim = self.dim;

        // Index as secondary key keeps the layout independent of sort stability.
        indices.sort_unstable_by(|&a, &b| {
            codewords[a * dim + axis]
                .total_cmp(&codewords[b * dim + axis])
                .then(a.cmp(&b))
        });

        let median = indices.len() / 2;
        let point = indices[median];
        let node_idx = self.nodes.len();
        self.nodes.push(Node {
            point,
            axis,
            split: codewords[point * dim + axis],
            left: None,
            right: None,
        });

        let (left_half, rest) = indices.split_at_mut(median);
        let right_half = &mut rest[1..];

        let left = self.build_recursive(left_half);
        let right = self.build_recursive(right_half);
        self.nodes[node_idx].left = left;
        self.nodes[node_idx].right = right;

        Some(node_idx)
    }

    /// Finds the closest codeword to `query`.
    ///
    /// Returns `(index, squared distance)`. Among equidistant codewords the
    /// lowest index wins, matching the linear scan. The distance is NaN if no
    /// codeword produced a comparable distance.
    pub fn nearest(&self, query: &[f64]) -> (usize, f64) {
        let mut best = (usize::MAX, f64::INFINITY);

        if let Some(root) = self.root {
            self.search(root, query, &mut best);
        }

        if best.0 == usize::MAX {
            (0, f64::NAN)
        } else {
            best
        }
    }

    fn search(&self, node_idx: usize, query: &[f64], best: &mut (usize, f64)) {
        let node = self.nodes[node_idx];

        let dist = distance_squared(self.point(node.point), query);
        match dist.partial_cmp(&best.1) {
            Some(Ordering::Less) => *best = (node.point, dist),
            Some(Ordering::Equal) if node.point < best.0 => *best = (node.point, dist),
            _ => {}
        }

        let diff = query[node.axis] - node.split;
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.search(near, query, best);
        }

        // Inclusive bound so an equidistant lower index on the far side is still found.
        if let Some(far) = far {
            if diff * diff <= best.1 {
                self.search(far, query, best);
            }
        }
    }
}
