//! On-disk persistence: named-matrix files and training checkpoints.

pub mod checkpoint;
mod matrix_file;

pub use checkpoint::{ChainStats, Checkpoint, CheckpointStore};
pub use matrix_file::MatrixFile;
