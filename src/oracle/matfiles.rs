//! Oracle over a directory tree of beat-chroma matrix files.

use super::patterns::extract_patterns;
use super::{NextBatch, Oracle};
use crate::config::PatternSpec;
use crate::error::{ListenerError, Result};
use crate::matrix::Matrix;
use crate::storage::MatrixFile;
use log::{debug, warn};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File extension of feature files.
pub const FEATURE_EXTENSION: &str = "matrix";

/// Name of the `12 x beats` chromagram inside a feature file.
pub const CHROMA_KEY: &str = "btchroma";

/// Name of the optional bar-start beat indices inside a feature file.
pub const BARS_KEY: &str = "barbts";

/// Serves patterns from `*.matrix` files found under a root directory.
///
/// By default every call picks a file uniformly at random, forever. In
/// one-pass mode files are served in path order and the oracle then reports
/// `EndOfStream`.
pub struct MatFilesOracle {
    files: Vec<PathBuf>,
    spec: PatternSpec,
    rng: ChaCha8Rng,
    one_pass: bool,
    next_file: usize,
    given: u64,
}

impl MatFilesOracle {
    /// Collects every feature file below `root`.
    pub fn new<P: AsRef<Path>>(root: P, spec: PatternSpec, seed: Option<u64>) -> Result<Self> {
        let root = root.as_ref();
        let files = find_feature_files(root);
        if files.is_empty() {
            return Err(ListenerError::Oracle(format!(
                "No .{} files found in {}",
                FEATURE_EXTENSION,
                root.display()
            )));
        }
        debug!("Found {} feature files in {}", files.len(), root.display());

        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };

        Ok(Self {
            files,
            spec,
            rng,
            one_pass: false,
            next_file: 0,
            given: 0,
        })
    }

    /// Switches to a single ordered pass over the files.
    pub fn one_pass(mut self) -> Self {
        self.one_pass = true;
        self
    }

    /// Number of feature files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if there are no feature files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn load(&self, path: &Path) -> Result<Matrix> {
        let entries = MatrixFile::read_all(path)?;

        let chroma = entries
            .iter()
            .find(|(name, _)| name == CHROMA_KEY)
            .map(|(_, m)| m)
            .ok_or_else(|| ListenerError::MissingMatrix {
                name: CHROMA_KEY.to_string(),
                path: path.to_path_buf(),
            })?;

        let bars: Option<Vec<usize>> = entries
            .iter()
            .find(|(name, _)| name == BARS_KEY)
            .map(|(_, m)| m.as_slice().iter().map(|&b| b.max(0.0) as usize).collect());

        extract_patterns(chroma, bars.as_deref(), &self.spec)
    }
}

impl Oracle for MatFilesOracle {
    fn next_track(&mut self) -> Result<NextBatch> {
        let idx = if self.one_pass {
            if self.next_file >= self.files.len() {
                return Ok(NextBatch::EndOfStream);
            }
            self.next_file += 1;
            self.next_file - 1
        } else {
            self.rng.gen_range(0..self.files.len())
        };

        self.given += 1;
        let path = &self.files[idx];
        match self.load(path) {
            Ok(patterns) if !patterns.is_empty() => Ok(NextBatch::Batch(patterns)),
            Ok(_) => Ok(NextBatch::NoData),
            Err(e) => {
                warn!("Skipping {}: {}", path.display(), e);
                Ok(NextBatch::NoData)
            }
        }
    }

    fn tracks_given(&self) -> u64 {
        self.given
    }
}

/// Recursively lists feature files below `root`, sorted by path.
pub fn find_feature_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().map_or(false, |ext| ext == FEATURE_EXTENSION))
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CHROMA_BINS;
    use tempfile::tempdir;

    fn write_song(path: &Path, beats: usize) {
        let mut chroma = Matrix::zeros(CHROMA_BINS, beats);
        for b in 0..beats {
            chroma.set(b % CHROMA_BINS, b, 1.0);
        }
        MatrixFile::write(path, &[(CHROMA_KEY, &chroma)]).unwrap();
    }

    fn spec() -> PatternSpec {
        PatternSpec {
            pattern_size: 2,
            bars: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_files_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(MatFilesOracle::new(dir.path(), spec(), Some(1)).is_err());
    }

    #[test]
    fn test_one_pass_then_end() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_song(&dir.path().join("a.matrix"), 8);
        write_song(&dir.path().join("sub").join("b.matrix"), 4);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut oracle = MatFilesOracle::new(dir.path(), spec(), Some(1)).unwrap().one_pass();
        assert_eq!(oracle.len(), 2);

        match oracle.next_track().unwrap() {
            NextBatch::Batch(m) => {
                assert_eq!(m.rows(), 4);
                assert_eq!(m.cols(), 24);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(oracle.next_track().unwrap(), NextBatch::Batch(_)));
        assert_eq!(oracle.next_track().unwrap(), NextBatch::EndOfStream);
        assert_eq!(oracle.tracks_given(), 2);
    }

    #[test]
    fn test_unreadable_file_is_no_data() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.matrix"), b"garbage").unwrap();

        let mut oracle = MatFilesOracle::new(dir.path(), spec(), Some(3)).unwrap();
        assert_eq!(oracle.next_track().unwrap(), NextBatch::NoData);
    }

    #[test]
    fn test_random_mode_never_ends() {
        let dir = tempdir().unwrap();
        write_song(&dir.path().join("a.matrix"), 4);

        let mut oracle = MatFilesOracle::new(dir.path(), spec(), Some(5)).unwrap();
        for _ in 0..5 {
            assert!(matches!(oracle.next_track().unwrap(), NextBatch::Batch(_)));
        }
    }
}
