//! When to checkpoint and when to report progress.

use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Minimum gap between two checkpoints, given how long the run has lasted.
pub fn save_interval(since_start: Duration) -> Duration {
    if since_start < HOUR {
        10 * MINUTE
    } else if since_start < DAY {
        HOUR
    } else if since_start < WEEK {
        6 * HOUR
    } else {
        DAY
    }
}

/// True if a checkpoint is due.
///
/// `since_last` is the time since this run's previous checkpoint, `None` if
/// it has not saved yet. The first checkpoint after the first minute is
/// always due; after that saves are spaced by [`save_interval`].
pub fn should_save(since_start: Duration, since_last: Option<Duration>) -> bool {
    if since_start < MINUTE {
        return false;
    }
    match since_last {
        None => true,
        Some(last) => {
            let saved_at = since_start.saturating_sub(last);
            saved_at < MINUTE || last >= save_interval(since_start)
        }
    }
}

/// Progress reports on a stretching interval.
///
/// Each report pushes the next one 10% further out, so a long run logs
/// often at first and rarely later.
#[derive(Debug, Clone)]
pub struct ProgressSchedule {
    next: u64,
    interval: f64,
}

impl Default for ProgressSchedule {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressSchedule {
    /// First report after `first` iterations.
    pub fn new(first: u64) -> Self {
        Self {
            next: first.max(1),
            interval: first.max(1) as f64,
        }
    }

    /// True once `iteration` reaches the next report; then moves it on.
    pub fn due(&mut self, iteration: u64) -> bool {
        if iteration < self.next {
            return false;
        }
        self.interval *= 1.1;
        self.next = iteration + self.interval.ceil() as u64;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_minute_save() {
        assert!(!should_save(Duration::from_secs(30), None));
        assert!(should_save(Duration::from_secs(61), None));
        // Saved at start; the one-minute save is still due.
        assert!(should_save(Duration::from_secs(61), Some(Duration::from_secs(61))));
        // Saved at 1m; next one at 11m.
        assert!(!should_save(Duration::from_secs(5 * 60), Some(Duration::from_secs(4 * 60))));
        assert!(should_save(Duration::from_secs(11 * 60), Some(Duration::from_secs(10 * 60))));
    }

    #[test]
    fn test_intervals_grow() {
        assert_eq!(save_interval(Duration::from_secs(30 * 60)), 10 * MINUTE);
        assert_eq!(save_interval(3 * HOUR), HOUR);
        assert_eq!(save_interval(2 * DAY), 6 * HOUR);
        assert_eq!(save_interval(30 * DAY), DAY);

        let t = 5 * HOUR;
        assert!(!should_save(t, Some(30 * MINUTE)));
        assert!(should_save(t, Some(HOUR)));

        let t = 10 * DAY;
        assert!(!should_save(t, Some(12 * HOUR)));
        assert!(should_save(t, Some(DAY)));
    }

    #[test]
    fn test_progress_schedule_stretches() {
        let mut schedule = ProgressSchedule::new(10);
        let reports: Vec<u64> = (1..=200).filter(|&i| schedule.due(i)).collect();

        assert_eq!(reports[0], 10);
        assert_eq!(reports[1], 21);
        let gaps: Vec<u64> = reports.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|g| g[1] >= g[0]));
    }
}
