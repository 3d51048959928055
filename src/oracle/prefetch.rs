//! Multi-threaded prefetching in front of any oracle.

use super::{NextBatch, Oracle};
use crate::error::{ListenerError, Result};
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;

/// Runs one inner oracle per worker thread and hands their batches over a
/// bounded channel.
///
/// `next_track` blocks until some worker has a batch ready. Workers exit once
/// their inner oracle ends or the prefetcher is dropped.
pub struct PrefetchOracle {
    rx: Receiver<Result<NextBatch>>,
    stop: Arc<AtomicBool>,
    n_workers: usize,
    finished: usize,
    given: u64,
}

impl PrefetchOracle {
    /// Spawns `n_threads` workers, each owning the oracle built by
    /// `make(worker_index)`. At most `capacity` batches wait in the channel.
    pub fn spawn<O, F>(n_threads: usize, capacity: usize, make: F) -> Result<Self>
    where
        O: Oracle + Send + 'static,
        F: Fn(usize) -> Result<O>,
    {
        if n_threads == 0 {
            return Err(ListenerError::Config("prefetch needs at least one thread".to_string()));
        }

        let (tx, rx) = sync_channel(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        for worker in 0..n_threads {
            let mut oracle = make(worker)?;
            let tx = tx.clone();
            let stop = Arc::clone(&stop);

            thread::Builder::new()
                .name(format!("oracle-{}", worker))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let next = oracle.next_track();
                        let done = matches!(next, Ok(NextBatch::EndOfStream));
                        if tx.send(next).is_err() || done {
                            break;
                        }
                    }
                    debug!("Oracle worker {} stopped", worker);
                })?;
        }

        Ok(Self {
            rx,
            stop,
            n_workers: n_threads,
            finished: 0,
            given: 0,
        })
    }
}

impl Oracle for PrefetchOracle {
    fn next_track(&mut self) -> Result<NextBatch> {
        loop {
            match self.rx.recv() {
                Ok(Ok(NextBatch::EndOfStream)) => {
                    self.finished += 1;
                    if self.finished >= self.n_workers {
                        return Ok(NextBatch::EndOfStream);
                    }
                }
                Ok(Ok(batch)) => {
                    self.given += 1;
                    return Ok(batch);
                }
                Ok(Err(e)) => return Err(e),
                // Every worker hung up without ending its stream.
                Err(_) => {
                    return Err(ListenerError::Oracle("all oracle workers stopped".to_string()))
                }
            }
        }
    }

    fn tracks_given(&self) -> u64 {
        self.given
    }
}

impl Drop for PrefetchOracle {
    fn drop(&mut self) {
        // Workers blocked on a full channel wake up when the receiver goes away.
        self.stop.store(true, Ordering::Relaxed);
    }
}
