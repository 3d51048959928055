//! Checkpoint directories of a training experiment.
//!
//! ## Directory Layout
//!
//! ```text
//! <experiment>/
//! └── exp_2010_06_01_AT_14h05m09s/         save time (local)
//!     ├── codebook.matrix                   codebook as a named matrix
//!     ├── model.p                           bincode Model
//!     ├── stats.p                           bincode StatLog
//!     ├── params.p                          bincode RunParameters
//!     ├── crash.txt                         only after an error
//!     └── starttime_2010_06_01_AT_13h00m00s.txt
//! ```
//!
//! The start marker is empty; its name carries the run's start time. It is
//! written last, so a directory without one was interrupted mid-save.
//!
//! Checkpoints form a backward chain: `params.predecessor` points to the
//! checkpoint a run resumed from, up to a run whose `stats.from_scratch` is
//! set.

use crate::config::RunParameters;
use crate::error::{ListenerError, Result};
use crate::training::StatLog;
use crate::vq::{Codebook, Model, OnlineVq, Quantizer};
use chrono::{Local, NaiveDateTime, Timelike};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Timestamp format used in directory and marker names.
pub const TIME_FORMAT: &str = "%Y_%m_%d_AT_%Hh%Mm%Ss";

/// Prefix of checkpoint directory names.
pub const DIR_PREFIX: &str = "exp_";

/// Prefix of the start-time marker file name.
pub const START_PREFIX: &str = "starttime_";

/// Exported codebook.
pub const CODEBOOK_FILE: &str = "codebook.matrix";
/// Serialized model.
pub const MODEL_FILE: &str = "model.p";
/// Serialized run statistics.
pub const STATS_FILE: &str = "stats.p";
/// Serialized run parameters.
pub const PARAMS_FILE: &str = "params.p";
/// Error report of a crashed run.
pub const CRASH_FILE: &str = "crash.txt";

/// Checkpoints closer than this to the chain's first one are never trimmed.
const TRIM_PROTECTED_HOURS: i64 = 2;

/// Formats a time the way directory and marker names carry it.
pub fn format_timestamp(time: &NaiveDateTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Parses a time formatted by [`format_timestamp`].
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| ListenerError::InvalidTimestamp(format!("'{}': {}", s, e)))
}

/// Current local time, truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let t = Local::now().naive_local();
    t.with_nanosecond(0).unwrap_or(t)
}

/// Save time of a checkpoint, parsed from its directory name.
pub fn stop_time(dir: &Path) -> Result<NaiveDateTime> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ListenerError::InvalidTimestamp(dir.display().to_string()))?;
    let stamp = name
        .strip_prefix(DIR_PREFIX)
        .ok_or_else(|| ListenerError::InvalidTimestamp(name.to_string()))?;
    parse_timestamp(stamp)
}

fn start_marker_time(name: &str) -> Option<&str> {
    name.strip_prefix(START_PREFIX)?.strip_suffix(".txt")
}

/// Start time of the run that wrote a checkpoint, parsed from its marker.
pub fn start_time(dir: &Path) -> Result<NaiveDateTime> {
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(stamp) = name.to_str().and_then(start_marker_time) {
            return parse_timestamp(stamp);
        }
    }
    Err(ListenerError::IncompleteCheckpoint(dir.to_path_buf()))
}

/// True if the directory holds the three blobs and a start marker.
pub fn is_complete(dir: &Path) -> bool {
    let blobs = [MODEL_FILE, STATS_FILE, PARAMS_FILE]
        .iter()
        .all(|f| dir.join(f).is_file());
    blobs && start_time(dir).is_ok()
}

fn write_blob<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(writer, value)?;
    Ok(())
}

fn read_blob<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(bincode::deserialize_from(reader)?)
}

/// Reads the statistics of one checkpoint.
pub fn load_stats(dir: &Path) -> Result<StatLog> {
    read_blob(&dir.join(STATS_FILE))
}

/// Reads the parameters of one checkpoint.
pub fn load_params(dir: &Path) -> Result<RunParameters> {
    read_blob(&dir.join(PARAMS_FILE))
}

/// A loaded checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Directory it was read from.
    pub path: PathBuf,
    /// The model, ready to resume training.
    pub model: Model,
    /// Counters of the run that wrote it.
    pub stats: StatLog,
    /// Parameters of the run that wrote it.
    pub params: RunParameters,
    /// Start time of the run that wrote it.
    pub start_time: NaiveDateTime,
}

impl Checkpoint {
    /// Loads a complete checkpoint directory.
    ///
    /// If `model.p` cannot be decoded, a plain VQ model is rebuilt from the
    /// exported codebook.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        if !is_complete(dir) {
            return Err(ListenerError::IncompleteCheckpoint(dir.to_path_buf()));
        }

        let stats = load_stats(dir)?;
        let params = load_params(dir)?;
        let model = match read_blob::<Model>(&dir.join(MODEL_FILE)) {
            Ok(model) => model,
            Err(e) => {
                warn!(
                    "Could not decode {} in {} ({}), rebuilding from {}",
                    MODEL_FILE,
                    dir.display(),
                    e,
                    CODEBOOK_FILE
                );
                let codebook = Codebook::load(dir.join(CODEBOOK_FILE))?;
                Model::Plain(OnlineVq::new(codebook))
            }
        };

        Ok(Self {
            path: dir.to_path_buf(),
            model,
            stats,
            params,
            start_time: start_time(dir)?,
        })
    }
}

/// Checkpoint directories from the chain's root run to `dir`, oldest first.
pub fn traceback<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = dir.as_ref().to_path_buf();

    loop {
        if !seen.insert(current.clone()) {
            return Err(ListenerError::BrokenChain(format!(
                "cycle at {}",
                current.display()
            )));
        }
        if !current.is_dir() {
            return Err(ListenerError::BrokenChain(format!(
                "{} does not exist",
                current.display()
            )));
        }

        let stats = load_stats(&current)?;
        let params = load_params(&current)?;
        chain.push(current.clone());

        if stats.from_scratch {
            break;
        }
        current = params.predecessor.ok_or_else(|| {
            ListenerError::BrokenChain(format!(
                "{} did not start from scratch but has no predecessor",
                current.display()
            ))
        })?;
    }

    chain.reverse();
    Ok(chain)
}

/// Totals over a checkpoint chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainStats {
    /// Model updates across all runs of the chain.
    pub iterations: u64,
    /// Patterns consumed across all runs of the chain.
    pub patterns: u64,
    /// Sum over runs of save time minus start time.
    pub wall_time: Duration,
}

/// Sums statistics and wall time from `dir` back to the root run.
pub fn load_chain_stats<P: AsRef<Path>>(dir: P) -> Result<ChainStats> {
    let mut total = ChainStats::default();

    for link in traceback(dir)? {
        let stats = load_stats(&link)?;
        total.iterations += stats.n_iterations;
        total.patterns += stats.n_patterns;

        let span = stop_time(&link)? - start_time(&link)?;
        total.wall_time += span.to_std().unwrap_or_default();
    }

    Ok(total)
}

/// The directory tree one experiment writes its checkpoints into.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Uses `root` as the experiment directory. Nothing is created yet.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// The experiment directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a save at `time` would create.
    pub fn dir_for(&self, time: &NaiveDateTime) -> PathBuf {
        self.root
            .join(format!("{}{}", DIR_PREFIX, format_timestamp(time)))
    }

    /// Writes a new checkpoint named after the current local time.
    ///
    /// Waits for the next second rather than reuse an existing name.
    pub fn save(
        &self,
        model: &Model,
        run_start: &NaiveDateTime,
        stats: &StatLog,
        params: &RunParameters,
        crash: Option<&str>,
    ) -> Result<PathBuf> {
        loop {
            let time = now();
            if !self.dir_for(&time).exists() {
                return self.save_at(&time, model, run_start, stats, params, crash);
            }
            debug!("Checkpoint name for {} taken, waiting", format_timestamp(&time));
            thread::sleep(Duration::from_millis(250));
        }
    }

    /// Writes a new checkpoint named after `time`.
    ///
    /// Fails if that directory already exists.
    pub fn save_at(
        &self,
        time: &NaiveDateTime,
        model: &Model,
        run_start: &NaiveDateTime,
        stats: &StatLog,
        params: &RunParameters,
        crash: Option<&str>,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let dir = self.dir_for(time);
        fs::create_dir(&dir)?;

        model.codebook().save(dir.join(CODEBOOK_FILE))?;
        write_blob(&dir.join(MODEL_FILE), model)?;
        write_blob(&dir.join(STATS_FILE), stats)?;
        write_blob(&dir.join(PARAMS_FILE), params)?;
        if let Some(report) = crash {
            fs::write(dir.join(CRASH_FILE), report)?;
        }
        let marker = format!("{}{}.txt", START_PREFIX, format_timestamp(run_start));
        File::create(dir.join(marker))?;

        info!("Saved checkpoint {}", dir.display());
        Ok(dir)
    }

    /// Every `exp_*` directory, sorted by name (oldest first).
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        if !self.root.is_dir() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(DIR_PREFIX));
            if is_checkpoint && path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Most recent complete checkpoint.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.into_iter().rev().find(|d| is_complete(d)))
    }

    /// Checkpoint directories missing a blob or the start marker.
    pub fn incomplete(&self) -> Result<Vec<PathBuf>> {
        Ok(self.list()?.into_iter().filter(|d| !is_complete(d)).collect())
    }

    /// Deletes incomplete checkpoint directories and returns them.
    pub fn purge_incomplete(&self) -> Result<Vec<PathBuf>> {
        let broken = self.incomplete()?;
        for dir in &broken {
            warn!("Removing incomplete checkpoint {}", dir.display());
            fs::remove_dir_all(dir)?;
        }
        Ok(broken)
    }

    /// Selects checkpoints of this experiment that can be deleted.
    ///
    /// Never selects a member of the traceback of `latest`, nor anything
    /// saved within two hours of the traceback's first checkpoint. After
    /// that, keeps at most one checkpoint per hour.
    pub fn plan_trim(&self, latest: &Path) -> Result<Vec<PathBuf>> {
        let chain = traceback(latest)?;
        let first = match chain.first() {
            Some(root) => stop_time(root)?,
            None => return Ok(Vec::new()),
        };
        let chain_names: HashSet<_> = chain.iter().filter_map(|p| p.file_name()).collect();

        let mut dated = Vec::new();
        for dir in self.list()? {
            match stop_time(&dir) {
                Ok(t) => dated.push((dir, t)),
                Err(_) => debug!("Ignoring {}", dir.display()),
            }
        }

        Ok(select_for_trim(&dated, first, |d| {
            d.file_name().map_or(false, |n| chain_names.contains(n))
        }))
    }

    /// Deletes the given checkpoint directories.
    pub fn remove(&self, dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            info!("Removing {}", dir.display());
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Walks `dated` in time order and picks directories to delete.
fn select_for_trim<F>(dated: &[(PathBuf, NaiveDateTime)], first: NaiveDateTime, in_chain: F) -> Vec<PathBuf>
where
    F: Fn(&Path) -> bool,
{
    let protected = chrono::Duration::hours(TRIM_PROTECTED_HOURS);
    let spacing = chrono::Duration::hours(1);

    let mut to_delete = Vec::new();
    let mut last_kept = first;

    for (dir, time) in dated {
        if in_chain(dir.as_path()) {
            last_kept = *time;
            continue;
        }
        if *time - first < protected {
            continue;
        }
        if *time - last_kept < spacing {
            to_delete.push(dir.clone());
        } else {
            last_kept = *time;
        }
    }

    to_delete
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::matrix::Matrix;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2010, 6, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn model() -> Model {
        let cb = Codebook::from_rows(&[vec![0.0, 0.0], vec![10.0, 10.0], vec![0.0, 10.0]]).unwrap();
        Model::new(ModelKind::Vq, cb, None)
    }

    fn stats(n: u64, from_scratch: bool) -> StatLog {
        StatLog {
            n_iterations: n,
            n_patterns: n * 10,
            from_scratch,
        }
    }

    fn params(predecessor: Option<PathBuf>) -> RunParameters {
        RunParameters {
            predecessor,
            ..Default::default()
        }
    }

    #[test]
    fn test_timestamp_round_trip() {
        let t = at(14, 5, 9);
        assert_eq!(format_timestamp(&t), "2010_06_01_AT_14h05m09s");
        assert_eq!(parse_timestamp("2010_06_01_AT_14h05m09s").unwrap(), t);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let model = model();
        let params = RunParameters {
            lrate: 0.25,
            ..params(None)
        };

        let path = store
            .save_at(&at(12, 30, 0), &model, &at(12, 0, 0), &stats(7, true), &params, None)
            .unwrap();
        assert!(path.ends_with("exp_2010_06_01_AT_12h30m00s"));
        assert!(is_complete(&path));
        assert!(!path.join(CRASH_FILE).exists());

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.stats, stats(7, true));
        assert_eq!(loaded.params, params);
        assert_eq!(loaded.start_time, at(12, 0, 0));

        let batch = Matrix::from_rows(&[vec![1.0, 1.0], vec![9.0, 8.0], vec![1.0, 9.0]]).unwrap();
        assert_eq!(
            loaded.model.predict(&batch).unwrap(),
            model.predict(&batch).unwrap()
        );
    }

    #[test]
    fn test_filtered_model_survives_save() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let cb = Codebook::from_rows(&[vec![0.0, 0.0], vec![10.0, 10.0]]).unwrap();
        let mut model = Model::new(ModelKind::VqFilt, cb, Some(4));
        let batch = Matrix::from_rows(&[vec![1.0, 2.0], vec![9.0, 8.0], vec![0.0, 0.0]]).unwrap();
        model.update(&batch, 0.5).unwrap();

        let path = store
            .save_at(&at(5, 0, 0), &model, &at(4, 0, 0), &stats(1, true), &params(None), None)
            .unwrap();
        let loaded = Checkpoint::load(&path).unwrap();

        assert_eq!(loaded.model.kind(), ModelKind::VqFilt);
        assert_eq!(loaded.model.filter_counts(), model.filter_counts());
        assert_eq!(loaded.model.filter_counts(), Some((2, 2)));
        assert_eq!(loaded.model.codebook(), model.codebook());
        match (&loaded.model, &model) {
            (Model::Filtered(a), Model::Filtered(b)) => {
                for code in 0..2 {
                    assert_eq!(a.rolling_average(code), b.rolling_average(code));
                    assert!(a.rolling_average(code).is_some());
                }
            }
            _ => panic!("expected filtered models"),
        }
    }

    #[test]
    fn test_same_second_is_refused() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let t = at(1, 0, 0);
        store.save_at(&t, &model(), &t, &stats(0, true), &params(None), None).unwrap();
        assert!(store.save_at(&t, &model(), &t, &stats(0, true), &params(None), None).is_err());
    }

    #[test]
    fn test_crash_report_is_written() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store
            .save_at(&at(3, 0, 0), &model(), &at(2, 0, 0), &stats(1, true), &params(None), Some("boom"))
            .unwrap();
        assert_eq!(fs::read_to_string(path.join(CRASH_FILE)).unwrap(), "boom");
    }

    #[test]
    fn test_incomplete_detection() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let good = store
            .save_at(&at(1, 0, 0), &model(), &at(0, 0, 0), &stats(1, true), &params(None), None)
            .unwrap();

        let broken = store.dir_for(&at(2, 0, 0));
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join(MODEL_FILE), b"partial").unwrap();

        assert!(!is_complete(&broken));
        assert!(matches!(
            Checkpoint::load(&broken),
            Err(ListenerError::IncompleteCheckpoint(_))
        ));
        assert_eq!(store.latest().unwrap(), Some(good));
        assert_eq!(store.incomplete().unwrap(), vec![broken.clone()]);

        store.purge_incomplete().unwrap();
        assert!(!broken.exists());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_model_falls_back_to_codebook() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let model = model();
        let path = store
            .save_at(&at(1, 0, 0), &model, &at(0, 0, 0), &stats(1, true), &params(None), None)
            .unwrap();
        fs::write(path.join(MODEL_FILE), b"\x07").unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded.model.kind(), ModelKind::Vq);
        assert_eq!(loaded.model.codebook(), model.codebook());
    }

    #[test]
    fn test_chain_accumulation() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let m = model();

        let a = store
            .save_at(&at(1, 0, 0), &m, &at(0, 0, 0), &stats(100, true), &params(None), None)
            .unwrap();
        let b = store
            .save_at(&at(3, 0, 0), &m, &at(2, 0, 0), &stats(50, false), &params(Some(a.clone())), None)
            .unwrap();
        let c = store
            .save_at(&at(4, 30, 0), &m, &at(4, 0, 0), &stats(30, false), &params(Some(b.clone())), None)
            .unwrap();

        assert_eq!(traceback(&c).unwrap(), vec![a, b, c.clone()]);

        let total = load_chain_stats(&c).unwrap();
        assert_eq!(total.iterations, 180);
        assert_eq!(total.patterns, 1800);
        assert_eq!(total.wall_time, Duration::from_secs(3600 + 3600 + 1800));
    }

    #[test]
    fn test_missing_predecessor_breaks_chain() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let orphan = store
            .save_at(&at(1, 0, 0), &model(), &at(0, 0, 0), &stats(5, false), &params(None), None)
            .unwrap();
        assert!(matches!(
            load_chain_stats(&orphan),
            Err(ListenerError::BrokenChain(_))
        ));
    }

    #[test]
    fn test_trim_plan() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let m = model();
        let save = |t: NaiveDateTime, s: StatLog, p: RunParameters| {
            store.save_at(&t, &m, &at(0, 0, 0), &s, &p, None).unwrap()
        };

        let root = save(at(0, 1, 0), stats(1, true), params(None));
        // Inside the protected window.
        let early = save(at(1, 0, 0), stats(1, true), params(None));
        // Past the window: keep the first, drop those within the hour after it.
        let kept = save(at(3, 0, 0), stats(1, true), params(None));
        let dropped = save(at(3, 20, 0), stats(1, true), params(None));
        let dropped_too = save(at(3, 50, 0), stats(1, true), params(None));
        let kept_next = save(at(4, 10, 0), stats(1, true), params(None));
        let latest = save(at(4, 20, 0), stats(1, false), params(Some(root.clone())));

        let plan = store.plan_trim(&latest).unwrap();
        assert_eq!(plan, vec![dropped, dropped_too]);
        for survivor in [&root, &early, &kept, &kept_next, &latest] {
            assert!(!plan.contains(survivor));
        }

        store.remove(&plan).unwrap();
        assert_eq!(store.list().unwrap().len(), 5);
    }
}
