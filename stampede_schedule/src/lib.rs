//! The stampede job scheduler.
//!
//! Recurring work in stampede -- chiefly the paced re-execution of an
//! attack's virtual users -- is registered here as a job. A job with a zero
//! interval runs back-to-back. A job with a positive interval ticks aligned
//! to wall-clock multiples of that interval: after each firing the next
//! deadline is the next multiple of the interval since the epoch, so drift
//! does not accumulate and ticks stay phase-aligned across jobs that share an
//! interval. Each tick spawns the task as an independent tokio task so a
//! slow run never stalls the ticker.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{
    collections::HashMap,
    future::Future,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use uuid::Uuid;

/// Identifier of a registered job.
pub type JobId = Uuid;

/// Errors produced by [`Scheduler`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The scheduler has been shut down and rejects further changes.
    #[error("scheduler is stopped")]
    Stopped,
    /// No job is registered under the given id.
    #[error("job not found")]
    JobNotFound,
}

/// A registry of recurring jobs.
///
/// Jobs run until removed, or until [`Scheduler::shutdown`] cancels them all.
#[derive(Debug, Default)]
pub struct Scheduler {
    inner: Mutex<Inner>,
    tracker: TaskTracker,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, CancellationToken>,
    stopped: bool,
}

impl Scheduler {
    /// Create a new `Scheduler` ready to accept jobs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` to run every `interval_sec` seconds and start it.
    ///
    /// An interval of zero runs the task back-to-back with no delay,
    /// awaiting each run before starting the next. A positive interval
    /// fires immediately and thereafter on wall-clock multiples of the
    /// interval, spawning each run independently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] after [`Scheduler::shutdown`].
    ///
    /// # Panics
    ///
    /// Panics if the job table lock has been poisoned.
    pub fn new_job<F, Fut>(&self, interval_sec: f64, task: F) -> Result<JobId, Error>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut inner = self.inner.lock().expect("job table lock poisoned");
        if inner.stopped {
            return Err(Error::Stopped);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        inner.jobs.insert(id, cancel.clone());

        self.tracker.spawn(run_job(
            Duration::from_secs_f64(interval_sec.max(0.0)),
            task,
            cancel,
        ));

        Ok(id)
    }

    /// Signal the job with `id` to stop and remove it from the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] after shutdown, [`Error::JobNotFound`] for
    /// an unknown id.
    ///
    /// # Panics
    ///
    /// Panics if the job table lock has been poisoned.
    pub fn remove_job(&self, id: JobId) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("job table lock poisoned");
        if inner.stopped {
            return Err(Error::Stopped);
        }

        match inner.jobs.remove(&id) {
            Some(cancel) => {
                cancel.cancel();
                Ok(())
            }
            None => Err(Error::JobNotFound),
        }
    }

    /// Stop all jobs, reject future registrations and wait for running job
    /// loops to finish. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the job table lock has been poisoned.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().expect("job table lock poisoned");
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            for cancel in inner.jobs.values() {
                cancel.cancel();
            }
            inner.jobs.clear();
        }

        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn run_job<F, Fut>(interval: Duration, task: F, cancel: CancellationToken)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    // Continuous mode: the task is awaited in place, cancellation is
    // observed between runs.
    if interval.is_zero() {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            task().await;
        }
    }

    // Timed mode: the first firing is immediate, subsequent ones land on
    // wall-clock multiples of the interval.
    let mut next = tokio::time::Instant::now();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(next) => {
                tokio::spawn(task());
                next = tokio::time::Instant::now() + aligned_delay(unix_now(), interval);
            }
        }
    }
}

/// Time until the next wall-clock multiple of `interval`, given `now` as a
/// duration since the epoch. `truncate(now, interval) + interval` in timer
/// terms.
fn aligned_delay(now: Duration, interval: Duration) -> Duration {
    let interval_nanos = interval.as_nanos().max(1);
    let now_nanos = now.as_nanos();
    let next = (now_nanos / interval_nanos + 1) * interval_nanos;

    let delta = next - now_nanos;
    debug_assert!(delta <= u128::from(u64::MAX));
    Duration::from_nanos(delta as u64)
}

fn unix_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
