//! Run configuration for codebook training.

use crate::error::{ListenerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Number of pitch classes in a chroma vector.
pub const CHROMA_BINS: usize = 12;

/// Where feature batches come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// Directory tree of beat-chroma matrix files.
    MatFiles,
}

impl FromStr for DataSource {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mat" | "matfiles" => Ok(DataSource::MatFiles),
            other => Err(ListenerError::Config(format!("Unknown data source '{}'", other))),
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSource::MatFiles => write!(f, "MAT"),
        }
    }
}

/// Which model variant to train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Plain online VQ.
    Vq,
    /// Online VQ that rejects easy patterns.
    VqFilt,
}

impl FromStr for ModelKind {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vq" => Ok(ModelKind::Vq),
            "vqfilt" => Ok(ModelKind::VqFilt),
            other => Err(ListenerError::Config(format!("Unknown model '{}'", other))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Vq => write!(f, "VQ"),
            ModelKind::VqFilt => write!(f, "VQFILT"),
        }
    }
}

/// How beat-chroma matrices are cut into patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    /// Beats per pattern; a pattern has `12 * pattern_size` values.
    /// Default: 8.
    pub pattern_size: usize,

    /// Bars per pattern, or 0 to cut fixed windows of `pattern_size` beats.
    /// Default: 2.
    pub bars: usize,

    /// Rotate every pattern so its strongest pitch class comes first.
    /// Default: true.
    pub key_invariance: bool,

    /// Rotate the whole song instead of each pattern.
    /// Takes precedence over `key_invariance`.
    /// Default: false.
    pub song_key_invariance: bool,

    /// Clip negative values to zero.
    /// Default: true.
    pub positive: bool,

    /// Resample each pattern to `pattern_size` beats; pad or crop otherwise.
    /// Default: true.
    pub resample: bool,
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            pattern_size: 8,
            bars: 2,
            key_invariance: true,
            song_key_invariance: false,
            positive: true,
            resample: true,
        }
    }
}

impl PatternSpec {
    /// Dimension of one flattened pattern.
    #[inline]
    pub fn dimension(&self) -> usize {
        CHROMA_BINS * self.pattern_size
    }
}

/// Full configuration of a training run, persisted with every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Pattern extraction settings.
    pub patterns: PatternSpec,

    /// Learning rate of the codeword step.
    /// Default: 1e-5.
    pub lrate: f64,

    /// Number of prefetching oracle threads.
    /// Default: 4.
    pub n_threads: usize,

    /// Data source selector.
    pub data_source: DataSource,

    /// Root directory of the data source.
    pub data_dir: PathBuf,

    /// Total iteration budget across the whole checkpoint chain.
    /// Default: None (run until interrupted).
    pub max_iterations: Option<u64>,

    /// Model variant.
    pub model: ModelKind,

    /// Random seed for the oracle and the filter.
    /// Default: None (random).
    pub seed: Option<u64>,

    /// Codebook file a from-scratch run was started from.
    pub codebook: Option<PathBuf>,

    /// Checkpoint directory this run resumed from.
    pub predecessor: Option<PathBuf>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            patterns: PatternSpec::default(),
            lrate: 1e-5,
            n_threads: 4,
            data_source: DataSource::MatFiles,
            data_dir: PathBuf::new(),
            max_iterations: None,
            model: ModelKind::Vq,
            seed: None,
            codebook: None,
            predecessor: None,
        }
    }
}

impl RunParameters {
    /// Checks that the parameters describe a runnable configuration.
    pub fn validate(&self) -> Result<()> {
        if self.patterns.pattern_size == 0 {
            return Err(ListenerError::Config("pattern size must be positive".to_string()));
        }
        if !(self.lrate > 0.0 && self.lrate <= 1.0) {
            return Err(ListenerError::Config(format!(
                "learning rate {} outside (0, 1]",
                self.lrate
            )));
        }
        if self.n_threads == 0 {
            return Err(ListenerError::Config("thread count must be positive".to_string()));
        }
        Ok(())
    }

    /// Parameters to use when resuming from a checkpoint.
    ///
    /// Everything comes from the saved run except the data location, which
    /// may have moved, and the predecessor pointer.
    pub fn resumed_from(saved: RunParameters, data_dir: Option<PathBuf>, predecessor: PathBuf) -> Self {
        Self {
            data_dir: data_dir.unwrap_or(saved.data_dir.clone()),
            predecessor: Some(predecessor),
            ..saved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_parameters() {
        let params = RunParameters::default();
        assert_eq!(params.patterns.pattern_size, 8);
        assert_eq!(params.patterns.dimension(), 96);
        assert_eq!(params.model, ModelKind::Vq);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_lrate() {
        let mut params = RunParameters::default();
        params.lrate = 0.0;
        assert!(params.validate().is_err());
        params.lrate = 1.5;
        assert!(params.validate().is_err());
        params.lrate = 1.0;
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!("VQFILT".parse::<ModelKind>().unwrap(), ModelKind::VqFilt);
        assert_eq!("vq".parse::<ModelKind>().unwrap(), ModelKind::Vq);
        assert_eq!("MAT".parse::<DataSource>().unwrap(), DataSource::MatFiles);
        assert!("EN2".parse::<DataSource>().is_err());
    }

    #[test]
    fn test_resume_keeps_saved_values() {
        let saved = RunParameters {
            lrate: 0.01,
            data_dir: PathBuf::from("/old"),
            model: ModelKind::VqFilt,
            ..Default::default()
        };

        let resumed = RunParameters::resumed_from(saved.clone(), Some(PathBuf::from("/new")), PathBuf::from("/exp/a"));
        assert_eq!(resumed.lrate, 0.01);
        assert_eq!(resumed.model, ModelKind::VqFilt);
        assert_eq!(resumed.data_dir, PathBuf::from("/new"));
        assert_eq!(resumed.predecessor, Some(PathBuf::from("/exp/a")));

        let kept = RunParameters::resumed_from(saved, None, PathBuf::from("/exp/a"));
        assert_eq!(kept.data_dir, PathBuf::from("/old"));
    }
}
