//! Online vector quantization models.
//!
//! Both variants share one capability, [`Quantizer`]: assign patterns to
//! their closest codeword and nudge those codewords toward the patterns.
//! [`Model`] is the persisted form, selected by [`ModelKind`].

use super::codebook::Codebook;
use super::filter::FilteredVq;
use super::index::NearestCodeIndex;
use crate::config::ModelKind;
use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use serde::{Deserialize, Serialize};

/// Codeword assignment of a batch, with distortions normalized per dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Closest codeword per row.
    pub indices: Vec<usize>,
    /// Squared distance to that codeword divided by the pattern dimension.
    pub distortions: Vec<f64>,
}

impl Prediction {
    /// Mean normalized distortion, or `None` for an empty batch.
    pub fn mean_distortion(&self) -> Option<f64> {
        if self.distortions.is_empty() {
            return None;
        }
        Some(self.distortions.iter().sum::<f64>() / self.distortions.len() as f64)
    }
}

/// A trainable codebook.
pub trait Quantizer {
    /// The current codebook.
    fn codebook(&self) -> &Codebook;

    /// Assigns every row of `batch` to its closest codeword.
    ///
    /// Rows are used as given; all-zero rows are not removed.
    fn predict(&self, batch: &Matrix) -> Result<Prediction>;

    /// Runs one minibatch step.
    ///
    /// All-zero rows are dropped first. Returns the mean normalized
    /// distortion measured before any codeword moved, or `None` when no
    /// row is left, in which case the codebook is untouched.
    fn update(&mut self, batch: &Matrix, lrate: f64) -> Result<Option<f64>>;
}

/// True if the row carries any signal.
#[inline]
pub(crate) fn is_nonzero(row: &[f64]) -> bool {
    row.iter().any(|&v| v != 0.0)
}

/// Rejects learning rates outside `[0, 1]`.
pub(crate) fn check_lrate(lrate: f64) -> Result<()> {
    if (0.0..=1.0).contains(&lrate) {
        Ok(())
    } else {
        Err(ListenerError::Config(format!(
            "learning rate {} outside [0, 1]",
            lrate
        )))
    }
}

/// Rejects batches of the wrong width or containing NaN.
pub(crate) fn check_batch(codebook: &Codebook, batch: &Matrix) -> Result<()> {
    if batch.cols() != codebook.dim() && !batch.is_empty() {
        return Err(ListenerError::DimensionMismatch {
            expected: codebook.dim(),
            found: batch.cols(),
        });
    }
    if batch.has_nan() {
        return Err(ListenerError::CorruptData("NaN in feature batch".to_string()));
    }
    Ok(())
}

/// Plain online VQ: minibatch online k-means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineVq {
    codebook: Codebook,
    #[serde(skip)]
    index: NearestCodeIndex,
}

impl OnlineVq {
    /// Creates a model that owns `codebook`.
    pub fn new(codebook: Codebook) -> Self {
        Self {
            codebook,
            index: NearestCodeIndex::default(),
        }
    }

    /// Replaces the search strategy.
    pub fn with_index(mut self, index: NearestCodeIndex) -> Self {
        self.index = index;
        self
    }

    /// Moves each row's assigned codeword toward it, in row order.
    pub(crate) fn apply_steps<'a, I>(&mut self, steps: I, lrate: f64)
    where
        I: IntoIterator<Item = (usize, &'a [f64])>,
    {
        for (code, row) in steps {
            self.codebook.step_toward(code, row, lrate);
        }
    }
}

impl Quantizer for OnlineVq {
    fn codebook(&self) -> &Codebook {
        &self.codebook
    }

    fn predict(&self, batch: &Matrix) -> Result<Prediction> {
        let assignment = self.index.query(&self.codebook, batch)?;
        let dim = self.codebook.dim() as f64;

        Ok(Prediction {
            indices: assignment.indices,
            distortions: assignment.sqdist.into_iter().map(|d| d / dim).collect(),
        })
    }

    fn update(&mut self, batch: &Matrix, lrate: f64) -> Result<Option<f64>> {
        check_lrate(lrate)?;
        check_batch(&self.codebook, batch)?;

        let patterns = batch.select_rows(is_nonzero);
        if patterns.is_empty() {
            return Ok(None);
        }

        let prediction = self.predict(&patterns)?;
        self.apply_steps(prediction.indices.iter().copied().zip(patterns.iter_rows()), lrate);

        Ok(prediction.mean_distortion())
    }
}

/// A model as stored in a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Model {
    /// Plain online VQ.
    Plain(OnlineVq),
    /// Online VQ with the hard-pattern filter.
    Filtered(FilteredVq),
}

impl Model {
    /// Builds a fresh model of the given kind around `codebook`.
    ///
    /// `seed` only matters for the filtered variant.
    pub fn new(kind: ModelKind, codebook: Codebook, seed: Option<u64>) -> Self {
        match kind {
            ModelKind::Vq => Model::Plain(OnlineVq::new(codebook)),
            ModelKind::VqFilt => Model::Filtered(FilteredVq::new(codebook, seed)),
        }
    }

    /// Which variant this is.
    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Plain(_) => ModelKind::Vq,
            Model::Filtered(_) => ModelKind::VqFilt,
        }
    }

    /// Patterns offered to and kept by the filter, if this model filters.
    pub fn filter_counts(&self) -> Option<(u64, u64)> {
        match self {
            Model::Plain(_) => None,
            Model::Filtered(f) => Some((f.patterns_received(), f.patterns_used())),
        }
    }

    /// Restarts the filter's random draws from `seed`. No-op for plain VQ.
    pub fn reseed(&mut self, seed: u64) {
        if let Model::Filtered(f) = self {
            f.reseed(seed);
        }
    }

    fn inner(&self) -> &dyn Quantizer {
        match self {
            Model::Plain(m) => m,
            Model::Filtered(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Quantizer {
        match self {
            Model::Plain(m) => m,
            Model::Filtered(m) => m,
        }
    }
}

impl Quantizer for Model {
    fn codebook(&self) -> &Codebook {
        self.inner().codebook()
    }

    fn predict(&self, batch: &Matrix) -> Result<Prediction> {
        self.inner().predict(batch)
    }

    fn update(&mut self, batch: &Matrix, lrate: f64) -> Result<Option<f64>> {
        self.inner_mut().update(batch, lrate)
    }
}
