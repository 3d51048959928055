//! Nearest-codeword search over a codebook.
//!
//! Small batches use a linear scan; large batches amortize a k-d tree built
//! over the current codewords. The tree is never kept between calls because
//! the codebook changes after every update.

use super::codebook::Codebook;
use super::distance::nearest_linear;
use super::kdtree::KdTree;
use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use log::debug;
use rayon::prelude::*;

/// Batch size above which `SearchMode::Auto` builds a k-d tree.
pub const KDTREE_THRESHOLD: usize = 200;

/// Search strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Linear scan up to `threshold` rows, k-d tree above.
    Auto,
    /// Always scan every codeword.
    BruteForce,
    /// Always build a k-d tree.
    KdTree,
}

/// Closest codeword for each row of a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Index of the closest codeword, per row.
    pub indices: Vec<usize>,
    /// Squared Euclidean distance to that codeword, per row.
    pub sqdist: Vec<f64>,
}

impl Assignment {
    /// Number of assigned rows.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True if no row was assigned.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Exact nearest-codeword search.
#[derive(Debug, Clone, Copy)]
pub struct NearestCodeIndex {
    mode: SearchMode,
    threshold: usize,
}

impl Default for NearestCodeIndex {
    fn default() -> Self {
        Self::new(SearchMode::Auto)
    }
}

impl NearestCodeIndex {
    /// Creates an index using the given strategy.
    pub fn new(mode: SearchMode) -> Self {
        Self {
            mode,
            threshold: KDTREE_THRESHOLD,
        }
    }

    /// Overrides the batch size at which `Auto` switches to the k-d tree.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    fn use_tree(&self, batch_rows: usize) -> bool {
        match self.mode {
            SearchMode::Auto => batch_rows > self.threshold,
            SearchMode::BruteForce => false,
            SearchMode::KdTree => true,
        }
    }

    /// Finds the closest codeword for every row of `batch`.
    ///
    /// Rows whose tree search yields a NaN distance are redone by linear
    /// scan. A NaN that survives the scan means the row itself is corrupt.
    pub fn query(&self, codebook: &Codebook, batch: &Matrix) -> Result<Assignment> {
        if codebook.n_codes() == 0 {
            return Err(ListenerError::EmptyCodebook);
        }
        if batch.cols() != codebook.dim() {
            return Err(ListenerError::DimensionMismatch {
                expected: codebook.dim(),
                found: batch.cols(),
            });
        }
        if batch.is_empty() {
            return Ok(Assignment {
                indices: Vec::new(),
                sqdist: Vec::new(),
            });
        }

        let codewords = codebook.as_slice();
        let n_codes = codebook.n_codes();
        let dim = codebook.dim();

        let mut results: Vec<(usize, f64)> = if self.use_tree(batch.rows()) {
            let tree = KdTree::build(codewords, n_codes, dim);
            batch
                .as_slice()
                .par_chunks_exact(dim)
                .map(|row| tree.nearest(row))
                .collect()
        } else {
            batch
                .iter_rows()
                .map(|row| nearest_linear(codewords, row, n_codes, dim))
                .collect()
        };

        for (i, result) in results.iter_mut().enumerate() {
            if result.1.is_nan() {
                debug!("NaN distance for row {}, falling back to linear scan", i);
                *result = nearest_linear(codewords, batch.row(i), n_codes, dim);
                if result.1.is_nan() {
                    return Err(ListenerError::CorruptData(format!(
                        "NaN distance for pattern {} of {}",
                        i,
                        batch.rows()
                    )));
                }
            }
        }

        let (indices, sqdist): (Vec<usize>, Vec<f64>) = results.into_iter().unzip();
        Ok(Assignment { indices, sqdist })
    }
}
