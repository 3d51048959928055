//! Scoring a trained model on held-out data.

use crate::error::Result;
use crate::oracle::{NextBatch, Oracle};
use crate::vq::model::is_nonzero;
use crate::vq::Quantizer;
use indicatif::ProgressBar;

/// Distortion of a model over one pass of a data source.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    /// Tracks that produced at least one non-empty pattern.
    pub tracks: u64,
    /// Non-empty patterns scored.
    pub patterns: u64,
    /// Mean normalized distortion over all patterns.
    pub mean_distortion: Option<f64>,
}

/// Predicts every non-empty pattern until the oracle ends.
///
/// The oracle must end on its own; a random-mode source never does.
pub fn evaluate<Q, O>(model: &Q, oracle: &mut O, progress: Option<&ProgressBar>) -> Result<Evaluation>
where
    Q: Quantizer + ?Sized,
    O: Oracle + ?Sized,
{
    let mut eval = Evaluation::default();
    let mut total = 0.0;

    loop {
        let next = oracle.next_track()?;
        if next == NextBatch::EndOfStream {
            break;
        }
        if let Some(pb) = progress {
            pb.inc(1);
        }
        let batch = match next {
            NextBatch::Batch(batch) => batch,
            _ => continue,
        };

        let patterns = batch.select_rows(is_nonzero);
        if patterns.is_empty() {
            continue;
        }

        let prediction = model.predict(&patterns)?;
        total += prediction.distortions.iter().sum::<f64>();
        eval.patterns += patterns.rows() as u64;
        eval.tracks += 1;
    }

    if eval.patterns > 0 {
        eval.mean_distortion = Some(total / eval.patterns as f64);
    }
    Ok(eval)
}
