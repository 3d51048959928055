//! Data sources that feed pattern batches to training.
//!
//! The training loop only sees the [`Oracle`] trait: one blocking call that
//! returns the patterns of the next track. How tracks are found, decoded or
//! prefetched is up to the implementation.

mod matfiles;
pub mod patterns;
mod prefetch;

pub use matfiles::MatFilesOracle;
pub use prefetch::PrefetchOracle;

use crate::config::{DataSource, RunParameters};
use crate::error::Result;
use crate::matrix::Matrix;
use std::collections::VecDeque;

/// Outcome of asking an oracle for the next track.
#[derive(Debug, Clone, PartialEq)]
pub enum NextBatch {
    /// Patterns of one track, one per row.
    Batch(Matrix),
    /// The track produced nothing usable; ask again.
    NoData,
    /// The source is exhausted and will not produce more tracks.
    EndOfStream,
}

/// A source of pattern batches.
pub trait Oracle {
    /// Returns the patterns of the next track.
    ///
    /// May block for as long as the source needs; callers get no timeout.
    fn next_track(&mut self) -> Result<NextBatch>;

    /// Number of tracks handed out so far.
    fn tracks_given(&self) -> u64;
}

impl<O: Oracle + ?Sized> Oracle for Box<O> {
    fn next_track(&mut self) -> Result<NextBatch> {
        (**self).next_track()
    }

    fn tracks_given(&self) -> u64 {
        (**self).tracks_given()
    }
}

/// Builds the prefetching oracle a training run reads from.
///
/// Worker `i` gets seed `seed + i` so workers do not serve the same files
/// in lockstep.
pub fn from_params(params: &RunParameters) -> Result<PrefetchOracle> {
    match params.data_source {
        DataSource::MatFiles => {
            let dir = params.data_dir.clone();
            let spec = params.patterns.clone();
            let seed = params.seed;
            PrefetchOracle::spawn(params.n_threads, 2 * params.n_threads, move |worker| {
                MatFilesOracle::new(&dir, spec.clone(), seed.map(|s| s.wrapping_add(worker as u64)))
            })
        }
    }
}

/// Oracle over batches already held in memory, served once in order.
#[derive(Debug, Clone, Default)]
pub struct MemoryOracle {
    batches: VecDeque<Option<Matrix>>,
    given: u64,
}

impl MemoryOracle {
    /// Creates an oracle that yields `batches` then `EndOfStream`.
    pub fn new(batches: Vec<Matrix>) -> Self {
        Self {
            batches: batches.into_iter().map(Some).collect(),
            given: 0,
        }
    }

    /// Appends a track that yields `NoData`.
    pub fn push_no_data(&mut self) {
        self.batches.push_back(None);
    }

    /// Appends a track.
    pub fn push(&mut self, batch: Matrix) {
        self.batches.push_back(Some(batch));
    }

    /// Tracks left to serve.
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl Oracle for MemoryOracle {
    fn next_track(&mut self) -> Result<NextBatch> {
        match self.batches.pop_front() {
            Some(Some(batch)) => {
                self.given += 1;
                Ok(NextBatch::Batch(batch))
            }
            Some(None) => {
                self.given += 1;
                Ok(NextBatch::NoData)
            }
            None => Ok(NextBatch::EndOfStream),
        }
    }

    fn tracks_given(&self) -> u64 {
        self.given
    }
}
