//! Vector quantization: codebooks, nearest-codeword search and the online
//! training models.

pub mod codebook;
mod distance;
pub mod filter;
pub mod index;
mod kdtree;
pub mod model;

pub use codebook::Codebook;
pub use filter::FilteredVq;
pub use index::{Assignment, NearestCodeIndex, SearchMode};
pub use model::{Model, OnlineVq, Prediction, Quantizer};
