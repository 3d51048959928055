//! The training loop.
//!
//! One thread owns the model and alternates between pulling a batch from the
//! oracle, updating the codebook and, when due, writing a checkpoint. The
//! codebook is never touched while a checkpoint is written.

use super::schedule::{should_save, ProgressSchedule};
use super::stats::StatLog;
use crate::config::RunParameters;
use crate::error::{ListenerError, Result};
use crate::oracle::{NextBatch, Oracle};
use crate::storage::checkpoint::{self, Checkpoint, CheckpointStore};
use crate::vq::model::is_nonzero;
use crate::vq::{Model, Quantizer};
use chrono::NaiveDateTime;
use log::{error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Number of recent batch distortions averaged in progress reports.
pub const DISTORTION_WINDOW: usize = 2000;

/// Why training stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The iteration budget was used up.
    BudgetExhausted,
    /// The oracle has no more tracks before the budget was reached.
    DataExhausted,
    /// The operator asked to stop.
    Interrupted,
    /// Something failed; the message is also written to the crash report.
    Error(String),
}

impl Termination {
    /// True if the run did the work it was asked to do.
    pub fn is_success(&self) -> bool {
        matches!(self, Termination::BudgetExhausted)
    }

    /// Process exit code for this outcome. Only a spent budget exits 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::BudgetExhausted => 0,
            Termination::Error(_) => 1,
            Termination::DataExhausted => 2,
            Termination::Interrupted => 130,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::BudgetExhausted => write!(f, "iteration budget exhausted"),
            Termination::DataExhausted => write!(f, "data source exhausted"),
            Termination::Interrupted => write!(f, "interrupted"),
            Termination::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// Lifecycle of a trainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainerState {
    /// Built, not yet running.
    Initializing,
    /// Pulling batches and updating the model.
    Running,
    /// Writing a checkpoint.
    Checkpointing,
    /// Done; no further batches will be taken.
    Terminated(Termination),
}

/// Drives one training run.
pub struct Trainer {
    store: CheckpointStore,
    model: Model,
    params: RunParameters,
    stats: StatLog,
    run_start: NaiveDateTime,
    started: Instant,
    last_save: Option<Instant>,
    last_checkpoint: Option<PathBuf>,
    iteration_offset: u64,
    state: TrainerState,
    interrupt: Arc<AtomicBool>,
    recent: VecDeque<f64>,
    progress: ProgressSchedule,
}

impl Trainer {
    /// Starts a run from scratch around a fresh model.
    pub fn new(store: CheckpointStore, model: Model, params: RunParameters) -> Result<Self> {
        params.validate()?;
        if model.codebook().dim() != params.patterns.dimension() {
            return Err(ListenerError::DimensionMismatch {
                expected: params.patterns.dimension(),
                found: model.codebook().dim(),
            });
        }
        Ok(Self::assemble(store, model, params, StatLog::fresh(), 0))
    }

    /// Resumes from a checkpoint.
    ///
    /// Parameters come from the checkpoint; only the data directory may be
    /// overridden. The global iteration count continues from the chain.
    pub fn resume<P: AsRef<Path>>(
        store: CheckpointStore,
        checkpoint_dir: P,
        data_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let dir = checkpoint_dir.as_ref();
        let saved = Checkpoint::load(dir)?;
        let offset = checkpoint::load_chain_stats(dir)?.iterations;
        let params = RunParameters::resumed_from(saved.params, data_dir, dir.to_path_buf());
        params.validate()?;

        // Each link of a seeded chain draws from its own stream.
        let mut model = saved.model;
        if let Some(seed) = params.seed {
            model.reseed(seed.wrapping_add(offset));
        }

        info!(
            "Resuming from {} at iteration {} ({} model)",
            dir.display(),
            offset,
            model.kind()
        );
        Ok(Self::assemble(store, model, params, StatLog::resumed(), offset))
    }

    fn assemble(
        store: CheckpointStore,
        model: Model,
        params: RunParameters,
        stats: StatLog,
        iteration_offset: u64,
    ) -> Self {
        Self {
            store,
            model,
            params,
            stats,
            run_start: checkpoint::now(),
            started: Instant::now(),
            last_save: None,
            last_checkpoint: None,
            iteration_offset,
            state: TrainerState::Initializing,
            interrupt: Arc::new(AtomicBool::new(false)),
            recent: VecDeque::with_capacity(DISTORTION_WINDOW),
            progress: ProgressSchedule::default(),
        }
    }

    /// Flag that stops the loop before its next batch once set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    /// The model being trained.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Counters of this run.
    pub fn stats(&self) -> &StatLog {
        &self.stats
    }

    /// Parameters of this run.
    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    /// Iterations across the whole checkpoint chain, this run included.
    pub fn global_iterations(&self) -> u64 {
        self.iteration_offset + self.stats.n_iterations
    }

    /// Most recent checkpoint written by this run.
    pub fn last_checkpoint(&self) -> Option<&Path> {
        self.last_checkpoint.as_deref()
    }

    /// Mean of the recent batch distortions.
    pub fn recent_distortion(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        Some(self.recent.iter().sum::<f64>() / self.recent.len() as f64)
    }

    /// Runs until the budget, the data or the operator stops it.
    ///
    /// A final checkpoint is always attempted. After an error it carries a
    /// crash report.
    pub fn run<O: Oracle + ?Sized>(&mut self, oracle: &mut O) -> Termination {
        self.state = TrainerState::Running;

        let mut termination = match self.initial_checkpoint() {
            Ok(()) => self.run_loop(oracle),
            Err(e) => Termination::Error(e.to_string()),
        };

        match &termination {
            Termination::Error(msg) => error!("Training stopped: {}", msg),
            other => info!("Training stopped: {}", other),
        }

        let crash = match &termination {
            Termination::Error(msg) => Some(self.crash_report(msg)),
            _ => None,
        };
        if let Err(e) = self.checkpoint(crash.as_deref()) {
            error!("Final checkpoint failed: {}", e);
            if !matches!(termination, Termination::Error(_)) {
                termination = Termination::Error(format!("final checkpoint failed: {}", e));
            }
        }

        self.state = TrainerState::Terminated(termination.clone());
        termination
    }

    fn initial_checkpoint(&mut self) -> Result<()> {
        if self.stats.from_scratch && self.last_save.is_none() {
            self.checkpoint(None)?;
            self.state = TrainerState::Running;
        }
        Ok(())
    }

    fn run_loop<O: Oracle + ?Sized>(&mut self, oracle: &mut O) -> Termination {
        loop {
            if self.interrupt.load(Ordering::SeqCst) {
                return Termination::Interrupted;
            }
            match self.step(oracle) {
                Ok(None) => {}
                Ok(Some(done)) => return done,
                Err(e) => return Termination::Error(e.to_string()),
            }
        }
    }

    /// Takes one batch. Returns the termination reason when the loop is over.
    fn step<O: Oracle + ?Sized>(&mut self, oracle: &mut O) -> Result<Option<Termination>> {
        if let Some(max) = self.params.max_iterations {
            if self.global_iterations() >= max {
                return Ok(Some(Termination::BudgetExhausted));
            }
        }

        let batch = match oracle.next_track()? {
            NextBatch::Batch(batch) => batch,
            NextBatch::NoData => return Ok(None),
            NextBatch::EndOfStream => return Ok(Some(Termination::DataExhausted)),
        };

        let n_patterns = batch.iter_rows().filter(|row| is_nonzero(row)).count();
        let distortion = match self.model.update(&batch, self.params.lrate)? {
            Some(d) => d,
            None => return Ok(None),
        };
        if !distortion.is_finite() {
            return Err(ListenerError::CorruptData(format!(
                "distortion {} at iteration {}",
                distortion,
                self.global_iterations() + 1
            )));
        }

        self.stats.record(n_patterns);
        if self.recent.len() == DISTORTION_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(distortion);

        if self.progress.due(self.stats.n_iterations) {
            self.report(oracle.tracks_given());
        }

        let since_last = self.last_save.map(|t| t.elapsed());
        if should_save(self.started.elapsed(), since_last) {
            self.checkpoint(None)?;
            self.state = TrainerState::Running;
        }

        Ok(None)
    }

    fn report(&self, tracks: u64) {
        let avg = self.recent_distortion().unwrap_or(f64::NAN);
        info!(
            "Iteration {} ({} patterns, {} tracks): avg distortion {:.6} over last {}",
            self.global_iterations(),
            self.stats.n_patterns,
            tracks,
            avg,
            self.recent.len()
        );
        if let Some((received, used)) = self.model.filter_counts() {
            info!("Filter kept {} of {} patterns", used, received);
        }
    }

    fn crash_report(&self, msg: &str) -> String {
        format!(
            "{}\n\nglobal iteration: {}\nrun iterations: {}\nrun patterns: {}\nstarted: {}\n",
            msg,
            self.global_iterations(),
            self.stats.n_iterations,
            self.stats.n_patterns,
            checkpoint::format_timestamp(&self.run_start)
        )
    }

    fn checkpoint(&mut self, crash: Option<&str>) -> Result<PathBuf> {
        self.state = TrainerState::Checkpointing;
        let path = self
            .store
            .save(&self.model, &self.run_start, &self.stats, &self.params, crash)?;
        self.last_save = Some(Instant::now());
        self.last_checkpoint = Some(path.clone());
        Ok(path)
    }
}

/// Installs a Ctrl-C handler that sets `flag` once and exits on a second press.
pub fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            warn!("Second interrupt, exiting without checkpoint");
            std::process::exit(130);
        }
        warn!("Interrupt received, stopping after the current batch");
    })
    .map_err(|e| ListenerError::Config(format!("cannot install interrupt handler: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelKind, PatternSpec};
    use crate::matrix::Matrix;
    use crate::oracle::{MemoryOracle, PrefetchOracle};
    use crate::vq::Codebook;
    use tempfile::tempdir;

    fn params(max_iterations: Option<u64>) -> RunParameters {
        RunParameters {
            patterns: PatternSpec {
                pattern_size: 1,
                ..Default::default()
            },
            lrate: 0.5,
            max_iterations,
            ..Default::default()
        }
    }

    fn codebook() -> Codebook {
        let mut rows = vec![vec![0.0; 12]; 3];
        rows[1][0] = 10.0;
        rows[2][5] = 10.0;
        Codebook::from_rows(&rows).unwrap()
    }

    fn batch(value: f64) -> Matrix {
        let mut m = Matrix::zeros(2, 12);
        m.set(0, 0, value);
        m
    }

    #[test]
    fn test_budget_exhausted() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::Vq, codebook(), None);
        let mut trainer = Trainer::new(CheckpointStore::new(dir.path()), model, params(Some(3))).unwrap();

        let mut oracle = MemoryOracle::new((0..10).map(|i| batch(1.0 + i as f64)).collect());
        oracle.push_no_data();
        let termination = trainer.run(&mut oracle);

        assert_eq!(termination, Termination::BudgetExhausted);
        assert_eq!(termination.exit_code(), 0);
        assert_eq!(trainer.stats().n_iterations, 3);
        assert_eq!(trainer.stats().n_patterns, 3);
        assert_eq!(trainer.state(), &TrainerState::Terminated(Termination::BudgetExhausted));
        assert_eq!(oracle.remaining(), 8);

        // Initial and final checkpoints.
        let saved = CheckpointStore::new(dir.path()).list().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(trainer.last_checkpoint(), saved.last().map(|p| p.as_path()));
    }

    #[test]
    fn test_empty_batches_do_not_count() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::Vq, codebook(), None);
        let mut trainer = Trainer::new(CheckpointStore::new(dir.path()), model, params(Some(5))).unwrap();

        let mut oracle = MemoryOracle::new(vec![Matrix::zeros(4, 12), batch(2.0)]);
        oracle.push_no_data();
        let termination = trainer.run(&mut oracle);

        assert_eq!(termination, Termination::DataExhausted);
        assert_eq!(termination.exit_code(), 2);
        assert_eq!(trainer.stats().n_iterations, 1);
        assert!(trainer.recent_distortion().unwrap().is_finite());
    }

    #[test]
    fn test_interrupt_stops_before_next_batch() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::VqFilt, codebook(), Some(2));
        let mut trainer = Trainer::new(CheckpointStore::new(dir.path()), model, params(None)).unwrap();
        trainer.interrupt_flag().store(true, Ordering::SeqCst);

        let mut oracle = MemoryOracle::new(vec![batch(1.0)]);
        let termination = trainer.run(&mut oracle);

        assert_eq!(termination, Termination::Interrupted);
        assert_eq!(termination.exit_code(), 130);
        assert_eq!(trainer.stats().n_iterations, 0);
    }

    #[test]
    fn test_error_writes_crash_report() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::Vq, codebook(), None);
        let mut trainer = Trainer::new(CheckpointStore::new(dir.path()), model, params(None)).unwrap();

        let mut bad = batch(1.0);
        bad.set(1, 3, f64::NAN);
        let mut oracle = MemoryOracle::new(vec![batch(1.0), bad]);
        let termination = trainer.run(&mut oracle);

        assert!(matches!(termination, Termination::Error(_)));
        assert_eq!(termination.exit_code(), 1);
        let last = trainer.last_checkpoint().unwrap();
        let report = std::fs::read_to_string(last.join(checkpoint::CRASH_FILE)).unwrap();
        assert!(report.contains("NaN"));
    }

    struct Crashing;

    impl Oracle for Crashing {
        fn next_track(&mut self) -> Result<NextBatch> {
            panic!("feature reader crashed");
        }

        fn tracks_given(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_dead_workers_end_in_error() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::Vq, codebook(), None);
        let mut trainer =
            Trainer::new(CheckpointStore::new(dir.path()), model, params(Some(1_000_000))).unwrap();

        let mut oracle = PrefetchOracle::spawn(2, 4, |_| Ok(Crashing)).unwrap();
        let termination = trainer.run(&mut oracle);

        assert!(matches!(termination, Termination::Error(_)));
        assert_ne!(termination.exit_code(), 0);
        assert_eq!(trainer.stats().n_iterations, 0);
        let last = trainer.last_checkpoint().unwrap();
        assert!(last.join(checkpoint::CRASH_FILE).exists());
    }

    #[test]
    fn test_wrong_codebook_dimension() {
        let dir = tempdir().unwrap();
        let model = Model::new(ModelKind::Vq, Codebook::from_rows(&[vec![1.0, 2.0]]).unwrap(), None);
        assert!(Trainer::new(CheckpointStore::new(dir.path()), model, params(None)).is_err());
    }

    #[test]
    fn test_seeded_filtered_resume_is_reproducible() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("runs"));
        let seeded = RunParameters {
            seed: Some(11),
            ..params(Some(2))
        };
        let model = Model::new(ModelKind::VqFilt, codebook(), seeded.seed);
        let mut first = Trainer::new(store, model, seeded).unwrap();
        let mut oracle = MemoryOracle::new((0..5).map(|i| batch(1.0 + i as f64)).collect());
        assert_eq!(first.run(&mut oracle), Termination::BudgetExhausted);
        let saved = first.last_checkpoint().unwrap().to_path_buf();

        let resume_once = |name: &str| {
            let store = CheckpointStore::new(dir.path().join(name));
            let mut trainer = Trainer::resume(store, &saved, None).unwrap();
            trainer.params.max_iterations = Some(40);
            let mut oracle = MemoryOracle::new((0..38).map(|i| batch(0.5 + i as f64)).collect());
            assert_eq!(trainer.run(&mut oracle), Termination::BudgetExhausted);
            (trainer.model().codebook().clone(), trainer.model().filter_counts())
        };

        assert_eq!(resume_once("a"), resume_once("b"));
    }

    #[test]
    fn test_resume_continues_budget() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let model = Model::new(ModelKind::Vq, codebook(), None);
        let mut first = Trainer::new(store.clone(), model, params(Some(4))).unwrap();
        let mut oracle = MemoryOracle::new((0..2).map(|_| batch(3.0)).collect());
        assert_eq!(first.run(&mut oracle), Termination::DataExhausted);
        let saved = first.last_checkpoint().unwrap().to_path_buf();

        let mut second = Trainer::resume(store, &saved, None).unwrap();
        assert_eq!(second.global_iterations(), 2);
        assert_eq!(second.params().predecessor.as_deref(), Some(saved.as_path()));

        let mut oracle = MemoryOracle::new((0..10).map(|_| batch(3.0)).collect());
        assert_eq!(second.run(&mut oracle), Termination::BudgetExhausted);
        assert_eq!(second.stats().n_iterations, 2);
        assert_eq!(second.global_iterations(), 4);

        let last = second.last_checkpoint().unwrap();
        assert_eq!(checkpoint::load_chain_stats(last).unwrap().iterations, 4);
    }
}
