//! Online VQ that prefers hard patterns.
//!
//! Every codeword keeps a short history of the distortions of the patterns
//! it recently absorbed. A new pattern is kept with a probability that grows
//! with its distortion relative to that history, so patterns the codebook
//! already explains well are mostly skipped.

use super::codebook::Codebook;
use super::model::{check_batch, check_lrate, is_nonzero, OnlineVq, Prediction, Quantizer};
use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Number of recent distortions remembered per codeword.
pub const ROLLING_QUEUE_LEN: usize = 200;

fn entropy_rng() -> ChaCha8Rng {
    ChaCha8Rng::from_entropy()
}

/// Online VQ with a per-codeword acceptance filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredVq {
    inner: OnlineVq,
    rolling: Vec<VecDeque<f64>>,
    n_received: u64,
    n_used: u64,
    #[serde(skip, default = "entropy_rng")]
    rng: ChaCha8Rng,
}

impl FilteredVq {
    /// Creates a filtered model around `codebook`.
    pub fn new(codebook: Codebook, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };

        Self {
            rolling: vec![VecDeque::with_capacity(ROLLING_QUEUE_LEN); codebook.n_codes()],
            inner: OnlineVq::new(codebook),
            n_received: 0,
            n_used: 0,
            rng,
        }
    }

    /// Restarts the acceptance draws from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Non-empty patterns offered to `update` so far.
    pub fn patterns_received(&self) -> u64 {
        self.n_received
    }

    /// Patterns that passed the filter and moved a codeword.
    pub fn patterns_used(&self) -> u64 {
        self.n_used
    }

    /// Mean of the remembered distortions of `code`, if any.
    pub fn rolling_average(&self, code: usize) -> Option<f64> {
        let queue = &self.rolling[code];
        if queue.is_empty() {
            return None;
        }
        Some(queue.iter().sum::<f64>() / queue.len() as f64)
    }

    /// Probability of keeping a pattern at distortion `dist` from `code`.
    ///
    /// Zero for an exact match, one while `code` has no history, and
    /// `1 / (1 + exp(avg / dist))` otherwise.
    pub fn accept_prob(&self, dist: f64, code: usize) -> f64 {
        if dist == 0.0 {
            return 0.0;
        }
        match self.rolling_average(code) {
            None => 1.0,
            Some(avg) => 1.0 / (1.0 + (avg / dist).exp()),
        }
    }

    fn remember(&mut self, code: usize, dist: f64) {
        let queue = &mut self.rolling[code];
        queue.push_back(dist);
        if queue.len() > ROLLING_QUEUE_LEN {
            queue.pop_front();
        }
    }

    /// Runs one filtered step with caller-supplied uniform draws.
    ///
    /// `draws` holds one value per row of `batch`; the draws of all-zero
    /// rows are ignored. A pattern is kept iff its acceptance probability
    /// is strictly greater than its draw. Acceptance probabilities are all
    /// computed before any codeword or history changes.
    pub fn update_with_draws(
        &mut self,
        batch: &Matrix,
        lrate: f64,
        draws: &[f64],
    ) -> Result<Option<f64>> {
        check_lrate(lrate)?;
        check_batch(self.inner.codebook(), batch)?;
        if draws.len() != batch.rows() {
            return Err(ListenerError::DimensionMismatch {
                expected: batch.rows(),
                found: draws.len(),
            });
        }

        let draws: Vec<f64> = batch
            .iter_rows()
            .zip(draws)
            .filter(|(row, _)| is_nonzero(row))
            .map(|(_, &d)| d)
            .collect();
        let patterns = batch.select_rows(is_nonzero);
        if patterns.is_empty() {
            return Ok(None);
        }

        let prediction = self.inner.predict(&patterns)?;
        self.n_received += patterns.rows() as u64;

        let keep: Vec<bool> = prediction
            .indices
            .iter()
            .zip(&prediction.distortions)
            .zip(&draws)
            .map(|((&code, &dist), &draw)| self.accept_prob(dist, code) > draw)
            .collect();

        for (i, _) in keep.iter().enumerate().filter(|(_, &k)| k) {
            self.remember(prediction.indices[i], prediction.distortions[i]);
        }
        self.n_used += keep.iter().filter(|&&k| k).count() as u64;

        let steps = prediction
            .indices
            .iter()
            .copied()
            .zip(patterns.iter_rows())
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|(step, _)| step);
        self.inner.apply_steps(steps, lrate);

        Ok(prediction.mean_distortion())
    }
}

impl Quantizer for FilteredVq {
    fn codebook(&self) -> &Codebook {
        self.inner.codebook()
    }

    fn predict(&self, batch: &Matrix) -> Result<Prediction> {
        self.inner.predict(batch)
    }

    fn update(&mut self, batch: &Matrix, lrate: f64) -> Result<Option<f64>> {
        let draws: Vec<f64> = (0..batch.rows()).map(|_| self.rng.gen::<f64>()).collect();
        self.update_with_draws(batch, lrate, &draws)
    }
}
