//! Error types for the online vector quantization engine.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for listener operations.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A matrix file does not contain the requested named matrix.
    #[error("Matrix '{name}' not found in {path}")]
    MissingMatrix {
        /// Name of the matrix that was requested.
        name: String,
        /// File that was searched.
        path: PathBuf,
    },

    /// Malformed matrix file.
    #[error("Invalid matrix file: {0}")]
    InvalidMatrixFormat(String),

    /// Pattern or codeword dimension does not match the codebook.
    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Dimension of the codebook.
        expected: usize,
        /// Dimension that was supplied.
        found: usize,
    },

    /// NaN in features or distances.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Codebook with no codewords.
    #[error("Empty codebook")]
    EmptyCodebook,

    /// Checkpoint directory is missing one of its files.
    #[error("Incomplete checkpoint: {0}")]
    IncompleteCheckpoint(PathBuf),

    /// A checkpoint that did not start from scratch has no usable predecessor.
    #[error("Broken checkpoint chain: {0}")]
    BrokenChain(String),

    /// Timestamp in a directory or marker name could not be parsed.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Data source failure.
    #[error("Oracle error: {0}")]
    Oracle(String),
}

/// Result type alias for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;

impl From<bincode::Error> for ListenerError {
    fn from(err: bincode::Error) -> Self {
        ListenerError::Serialization(err.to_string())
    }
}
