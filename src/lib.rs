//! # Infinite Listener - Online Vector Quantization of Chroma Patterns
//!
//! Trains a codebook of beat-synchronous chroma patterns by online
//! vector quantization over a practically endless stream of songs, and
//! keeps the run resumable across crashes through timestamped checkpoints.
//!
//! ## Overview
//!
//! A codebook holds a fixed number of codewords. Each batch of patterns
//! (all the patterns of one track) is assigned to its closest codewords,
//! and each of those codewords takes a small convex step toward its
//! pattern. The filtered variant skips patterns the codebook already
//! explains well.
//!
//! ## Key Features
//!
//! - **Exact nearest-codeword search**: linear scan for small batches, k-d tree for large ones
//! - **Two models**: plain online VQ and the hard-pattern filter
//! - **Crash-safe checkpoints** forming a resumable chain
//! - **Prefetching oracle** over a directory of feature files
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use infinite_listener::{Codebook, CheckpointStore, Model, ModelKind, RunParameters, Trainer};
//!
//! let params = RunParameters { data_dir: "features/".into(), ..Default::default() };
//! let codebook = Codebook::load("codebook.matrix")?;
//! let model = Model::new(ModelKind::Vq, codebook, None);
//!
//! let mut oracle = infinite_listener::oracle::from_params(&params)?;
//! let mut trainer = Trainer::new(CheckpointStore::new("experiment/"), model, params)?;
//! let termination = trainer.run(&mut oracle);
//! std::process::exit(termination.exit_code());
//! ```
//!
//! ## Architecture
//!
//! - [`vq`] - Codebook, nearest-codeword search and the models
//! - [`oracle`] - Data sources and pattern extraction
//! - [`storage`] - Matrix files and checkpoints
//! - [`training`] - Training loop, schedules and evaluation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod matrix;
pub mod oracle;
pub mod storage;
pub mod training;
pub mod vq;

// Re-export commonly used types
pub use config::{DataSource, ModelKind, PatternSpec, RunParameters, CHROMA_BINS};
pub use error::{ListenerError, Result};
pub use matrix::Matrix;
pub use oracle::{MatFilesOracle, MemoryOracle, NextBatch, Oracle, PrefetchOracle};
pub use storage::{ChainStats, Checkpoint, CheckpointStore, MatrixFile};
pub use training::{evaluate, Evaluation, StatLog, Termination, Trainer, TrainerState};
pub use vq::{Codebook, FilteredVq, Model, NearestCodeIndex, OnlineVq, Prediction, Quantizer, SearchMode};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
