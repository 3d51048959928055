//! The codebook: a fixed number of codewords of equal dimension.

use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use crate::oracle::{NextBatch, Oracle};
use crate::storage::MatrixFile;
use indicatif::ProgressBar;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the codebook matrix inside a matrix file.
pub const CODEBOOK_KEY: &str = "codebook";

/// Minimum number of non-empty patterns a track needs before it may donate
/// a codeword during random initialization.
pub const MIN_PATTERNS_PER_DRAW: usize = 20;

/// An ordered set of codewords stored as a flat row-major array.
///
/// The number of codewords is fixed at construction; only their values change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Codebook {
    n_codes: usize,
    dim: usize,
    codewords: Vec<f64>,
}

impl Codebook {
    /// Creates a codebook with one codeword per row of `matrix`.
    pub fn new(matrix: Matrix) -> Result<Self> {
        if matrix.rows() == 0 {
            return Err(ListenerError::EmptyCodebook);
        }
        if matrix.cols() == 0 {
            return Err(ListenerError::Config("codewords must have a positive dimension".to_string()));
        }
        if matrix.has_nan() {
            return Err(ListenerError::CorruptData("NaN in codebook".to_string()));
        }

        Ok(Self {
            n_codes: matrix.rows(),
            dim: matrix.cols(),
            codewords: matrix.into_vec(),
        })
    }

    /// Creates a codebook from a list of codewords.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        Self::new(Matrix::from_rows(rows)?)
    }

    /// Number of codewords.
    #[inline]
    pub fn n_codes(&self) -> usize {
        self.n_codes
    }

    /// Dimension of every codeword.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Borrows codeword `index`.
    #[inline]
    pub fn codeword(&self, index: usize) -> &[f64] {
        &self.codewords[index * self.dim..(index + 1) * self.dim]
    }

    /// Flat row-major codewords.
    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.codewords
    }

    /// Copies the codewords into a matrix, one per row.
    pub fn to_matrix(&self) -> Matrix {
        Matrix::from_raw(self.n_codes, self.dim, self.codewords.clone())
    }

    /// Moves codeword `index` toward `target` by a fraction `lrate`.
    ///
    /// Computed as the convex combination `(1 - lrate) * w + lrate * t`, so
    /// `lrate = 0` leaves the codeword untouched and `lrate = 1` copies the
    /// target exactly.
    #[inline]
    pub fn step_toward(&mut self, index: usize, target: &[f64], lrate: f64) {
        debug_assert_eq!(target.len(), self.dim);
        debug_assert!((0.0..=1.0).contains(&lrate));

        let keep = 1.0 - lrate;
        let offset = index * self.dim;
        for (w, &t) in self.codewords[offset..offset + self.dim].iter_mut().zip(target) {
            *w = *w * keep + t * lrate;
        }
    }

    /// Builds a codebook by drawing random patterns from an oracle.
    ///
    /// Each codeword comes from a different track: a track qualifies when it
    /// has at least [`MIN_PATTERNS_PER_DRAW`] patterns with a positive sum,
    /// and one of those is picked uniformly.
    pub fn init_random<O, R>(
        oracle: &mut O,
        n_codes: usize,
        dim: usize,
        rng: &mut R,
        progress: Option<&ProgressBar>,
    ) -> Result<Self>
    where
        O: Oracle + ?Sized,
        R: Rng + ?Sized,
    {
        if n_codes == 0 {
            return Err(ListenerError::EmptyCodebook);
        }

        if let Some(pb) = progress {
            pb.set_length(n_codes as u64);
        }

        let milestones = progress_milestones(n_codes);
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(n_codes);

        while rows.len() < n_codes {
            let batch = match oracle.next_track()? {
                NextBatch::Batch(batch) => batch,
                NextBatch::NoData => continue,
                NextBatch::EndOfStream => {
                    return Err(ListenerError::Oracle(format!(
                        "Data ran out after {} of {} codewords",
                        rows.len(),
                        n_codes
                    )))
                }
            };

            if batch.cols() != dim {
                return Err(ListenerError::DimensionMismatch {
                    expected: dim,
                    found: batch.cols(),
                });
            }

            let valid = batch.select_rows(|row| row.iter().sum::<f64>() > 0.0);
            if valid.rows() < MIN_PATTERNS_PER_DRAW {
                continue;
            }

            let pick = rng.gen_range(0..valid.rows());
            rows.push(valid.row(pick).to_vec());

            if let Some(pb) = progress {
                pb.inc(1);
            }
            if let Some((pct, _)) = milestones.iter().find(|(_, m)| *m == rows.len()) {
                info!("Codebook initialization {}% done ({}/{})", pct, rows.len(), n_codes);
            }
        }

        info!("Initialized {} codewords of dimension {}", n_codes, dim);
        Self::from_rows(&rows)
    }

    /// Writes the codebook as the `codebook` entry of a matrix file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        MatrixFile::write(path, &[(CODEBOOK_KEY, &self.to_matrix())])
    }

    /// Reads the `codebook` entry of a matrix file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(MatrixFile::read(path, CODEBOOK_KEY)?)
    }
}

/// Codeword counts at which 25, 50 and 75 percent are reported.
///
/// Percentages that round to the same count keep only the highest one.
fn progress_milestones(n_codes: usize) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = Vec::with_capacity(3);
    for pct in [25, 50, 75] {
        let count = (n_codes * pct).div_ceil(100);
        match out.last_mut() {
            Some(last) if last.1 == count => last.0 = pct,
            _ => out.push((pct, count)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::MemoryOracle;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    #[test]
    fn test_milestones_never_repeat() {
        assert_eq!(progress_milestones(1), vec![(75, 1)]);
        assert_eq!(progress_milestones(2), vec![(50, 1), (75, 2)]);
        assert_eq!(progress_milestones(100), vec![(25, 25), (50, 50), (75, 75)]);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(
            Codebook::new(Matrix::zeros(0, 4)),
            Err(ListenerError::EmptyCodebook)
        ));
        assert!(Codebook::new(Matrix::zeros(2, 0)).is_err());
    }

    #[test]
    fn test_step_toward_is_convex() {
        let mut cb = Codebook::from_rows(&[vec![0.0, 4.0], vec![1.0, 1.0]]).unwrap();
        cb.step_toward(0, &[2.0, 0.0], 0.25);

        let w = cb.codeword(0);
        assert!((w[0] - 0.5).abs() < 1e-12);
        assert!((w[1] - 3.0).abs() < 1e-12);
        assert_eq!(cb.codeword(1), &[1.0, 1.0]);
    }

    #[test]
    fn test_step_toward_extremes() {
        let target = [0.3, -7.1];
        let mut cb = Codebook::from_rows(&[vec![0.1, 2.2]]).unwrap();

        cb.step_toward(0, &target, 0.0);
        assert_eq!(cb.codeword(0), &[0.1, 2.2]);

        cb.step_toward(0, &target, 1.0);
        assert_eq!(cb.codeword(0), &target);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("codebook.matrix");

        let cb = Codebook::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        cb.save(&path).unwrap();
        assert_eq!(Codebook::load(&path).unwrap(), cb);
    }

    #[test]
    fn test_load_without_codebook_key_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("other.matrix");
        MatrixFile::write(&path, &[("btchroma", &Matrix::zeros(12, 3))]).unwrap();

        assert!(matches!(
            Codebook::load(&path),
            Err(ListenerError::MissingMatrix { .. })
        ));
    }

    #[test]
    fn test_init_random_skips_small_tracks() {
        let full = Matrix::new(25, 3, vec![1.0; 75]).unwrap();
        let small = Matrix::new(5, 3, vec![1.0; 15]).unwrap();
        let empty = Matrix::zeros(30, 3);

        let mut oracle = MemoryOracle::new(vec![small, empty, full.clone()]);
        oracle.push_no_data();
        oracle.push(full);

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let cb = Codebook::init_random(&mut oracle, 2, 3, &mut rng, None).unwrap();

        assert_eq!(cb.n_codes(), 2);
        assert_eq!(cb.codeword(1), &[1.0, 1.0, 1.0]);
        assert_eq!(oracle.remaining(), 0);
    }

    #[test]
    fn test_init_random_runs_out_of_data() {
        let mut oracle = MemoryOracle::new(vec![Matrix::new(25, 2, vec![1.0; 50]).unwrap()]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = Codebook::init_random(&mut oracle, 3, 2, &mut rng, None);
        assert!(matches!(result, Err(ListenerError::Oracle(_))));
    }
}
