//! Per-run counters saved with every checkpoint.

use serde::{Deserialize, Serialize};

/// Counters of one run, from its start to the checkpoint that holds them.
///
/// A resumed run starts again from zero; totals over a resume chain are
/// obtained by walking the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatLog {
    /// Iterations that fed a batch to the model.
    pub n_iterations: u64,
    /// Non-empty patterns consumed by the model.
    pub n_patterns: u64,
    /// True if the run started from a codebook file rather than a checkpoint.
    pub from_scratch: bool,
}

impl StatLog {
    /// Counters for a run started from a codebook file.
    pub fn fresh() -> Self {
        Self {
            from_scratch: true,
            ..Default::default()
        }
    }

    /// Counters for a run resumed from a checkpoint.
    pub fn resumed() -> Self {
        Self::default()
    }

    /// Records one model update.
    pub fn record(&mut self, patterns: usize) {
        self.n_iterations += 1;
        self.n_patterns += patterns as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record() {
        let mut stats = StatLog::fresh();
        stats.record(10);
        stats.record(5);
        assert_eq!(stats.n_iterations, 2);
        assert_eq!(stats.n_patterns, 15);
        assert!(stats.from_scratch);
        assert!(!StatLog::resumed().from_scratch);
    }
}
