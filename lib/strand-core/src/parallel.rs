//! Data-parallel fan-out.

use std::{io, ops::Range, thread};

use snafu::Snafu;
use tracing::{debug, error};

use crate::goroutine::panic_message;

/// Parallel execution errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ParallelError {
    /// The thread count was zero.
    #[snafu(display("parallel thread count must be at least 1"))]
    InvalidThreadCount,

    /// A worker thread could not be created.
    ///
    /// Workers that were already spawned still ran to completion before this was returned.
    #[snafu(display("failed to spawn parallel worker thread: {}", source))]
    FailedToSpawn {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A worker panicked.
    ///
    /// When several workers panic, the lowest thread ID is reported.
    #[snafu(display("parallel worker {} panicked", thread_id))]
    WorkerPanicked {
        /// ID of the worker that panicked.
        thread_id: usize,
    },
}

/// Runs one function across a fixed number of worker threads.
#[derive(Clone, Copy, Debug)]
pub struct ParallelManager {
    num_threads: usize,
}

impl ParallelManager {
    /// Creates a new `ParallelManager` that fans out across `num_threads` workers.
    ///
    /// # Errors
    ///
    /// If `num_threads` is zero, an error is returned.
    pub fn new(num_threads: usize) -> Result<Self, ParallelError> {
        if num_threads == 0 {
            return Err(ParallelError::InvalidThreadCount);
        }
        Ok(Self { num_threads })
    }

    /// Returns the number of workers.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Runs `f(context, thread_id, num_threads)` once for every `thread_id` in `0..num_threads`, concurrently, and
    /// returns once all of them have finished.
    ///
    /// # Errors
    ///
    /// If a worker thread cannot be spawned, or a worker panics, an error is returned. Either way, every worker that
    /// started has been joined by the time this returns.
    pub fn parallel<C, F>(&self, context: &C, f: F) -> Result<(), ParallelError>
    where
        C: Sync + ?Sized,
        F: Fn(&C, usize, usize) + Sync,
    {
        let num_threads = self.num_threads;
        let f = &f;

        debug!(num_threads, "Starting parallel execution.");
        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(num_threads);
            let mut spawn_error = None;

            for thread_id in 0..num_threads {
                let spawned = thread::Builder::new()
                    .name(format!("strand-par-{}", thread_id))
                    .spawn_scoped(scope, move || f(context, thread_id, num_threads));
                match spawned {
                    Ok(handle) => handles.push((thread_id, handle)),
                    Err(e) => {
                        spawn_error = Some(e);
                        break;
                    }
                }
            }

            // Panicked scoped threads must be joined here, or the scope itself panics on exit.
            let mut panicked = None;
            for (thread_id, handle) in handles {
                if let Err(payload) = handle.join() {
                    error!(thread_id, "Parallel worker panicked: {}", panic_message(payload.as_ref()));
                    panicked.get_or_insert(thread_id);
                }
            }

            if let Some(source) = spawn_error {
                return Err(ParallelError::FailedToSpawn { source });
            }
            match panicked {
                Some(thread_id) => Err(ParallelError::WorkerPanicked { thread_id }),
                None => Ok(()),
            }
        })
    }
}

/// Returns the contiguous slice of `0..len` assigned to `thread_id` when `len` items are split across `num_threads`
/// workers.
///
/// Slices differ in length by at most one, with the longer slices going to the lowest thread IDs. Together the slices
/// cover `0..len` exactly once.
pub fn partition_range(len: usize, thread_id: usize, num_threads: usize) -> Range<usize> {
    if num_threads == 0 || thread_id >= num_threads {
        return len..len;
    }

    let base = len / num_threads;
    let remainder = len % num_threads;
    let start = thread_id * base + thread_id.min(remainder);
    let end = start + base + usize::from(thread_id < remainder);
    start..end
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Mutex,
    };

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(ParallelManager::new(0), Err(ParallelError::InvalidThreadCount)));
    }

    #[test]
    fn every_thread_id_runs_exactly_once() {
        let manager = ParallelManager::new(6).unwrap();
        let seen = Mutex::new(Vec::new());

        manager
            .parallel(&seen, |seen, thread_id, num_threads| {
                assert_eq!(num_threads, 6);
                seen.lock().unwrap().push(thread_id);
            })
            .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn partitioned_sum() {
        let data = (1..=1000u64).collect::<Vec<_>>();
        let total = AtomicU64::new(0);
        let manager = ParallelManager::new(7).unwrap();

        manager
            .parallel(data.as_slice(), |data, thread_id, num_threads| {
                let range = partition_range(data.len(), thread_id, num_threads);
                let partial = data[range].iter().sum::<u64>();
                total.fetch_add(partial, Ordering::Relaxed);
            })
            .unwrap();

        assert_eq!(total.load(Ordering::Relaxed), 500_500);
    }

    #[test]
    fn panicking_worker_is_reported_after_join() {
        let manager = ParallelManager::new(4).unwrap();
        let finished = AtomicUsize::new(0);

        let result = manager.parallel(&finished, |finished, thread_id, _| {
            if thread_id == 2 {
                panic!("partition failed");
            }
            finished.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(result, Err(ParallelError::WorkerPanicked { thread_id: 2 })));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn partitions_cover_range_exactly(len in 0usize..10_000, num_threads in 1usize..64) {
            let mut next = 0;
            for thread_id in 0..num_threads {
                let range = partition_range(len, thread_id, num_threads);
                prop_assert_eq!(range.start, next);
                prop_assert!(range.len() <= len / num_threads + 1);
                next = range.end;
            }
            prop_assert_eq!(next, len);
        }
    }
}
