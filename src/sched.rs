//! Task scheduling seam.
//!
//! Dispatch callbacks run synchronously on the engine's read path and must
//! never block it; anything slow is handed to a [`Scheduler`]. The bridge
//! roles also use it for deferred shutdown steps. Depending on this small
//! interface instead of a concrete event loop keeps dispatch testable with
//! a synchronous fake.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Schedules work off the protocol engine's read path.
pub trait Scheduler: Send + Sync + 'static {
    /// Run `job` as soon as possible, off the caller's stack.
    fn schedule(&self, job: Job);

    /// Run `job` after `delay`.
    fn schedule_after(&self, delay: Duration, job: Job);
}

/// Scheduler backed by the tokio runtime. Jobs run on spawned tasks;
/// keep them short.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, job: Job) {
        tokio::spawn(async move {
            job();
        });
    }

    fn schedule_after(&self, delay: Duration, job: Job) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        });
    }
}

/// Synchronous scheduler for tests: jobs queue up until [`run_pending`]
/// drains them on the caller's thread, making ordering deterministic.
///
/// [`run_pending`]: TestScheduler::run_pending
#[derive(Default)]
pub struct TestScheduler {
    jobs: Mutex<Vec<(Duration, Job)>>,
}

impl TestScheduler {
    /// Create an empty test scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every queued job, immediate ones first, then delayed ones in
    /// ascending delay order. Returns how many jobs ran.
    pub fn run_pending(&self) -> usize {
        let mut jobs = {
            let mut guard = self
                .jobs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        jobs.sort_by_key(|(delay, _)| *delay);
        let count = jobs.len();
        for (_, job) in jobs {
            job();
        }
        count
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Scheduler for TestScheduler {
    fn schedule(&self, job: Job) {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((Duration::ZERO, job));
    }

    fn schedule_after(&self, delay: Duration, job: Job) {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((delay, job));
    }
}

/// Shared scheduler handle.
pub type SharedScheduler = Arc<dyn Scheduler>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_test_scheduler_runs_in_delay_order() {
        let sched = TestScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        sched.schedule_after(Duration::from_millis(150), Box::new(move || {
            o.lock().unwrap().push("late");
        }));
        let o = order.clone();
        sched.schedule(Box::new(move || {
            o.lock().unwrap().push("now");
        }));

        assert_eq!(sched.pending(), 2);
        assert_eq!(sched.run_pending(), 2);
        assert_eq!(*order.lock().unwrap(), vec!["now", "late"]);
        assert_eq!(sched.pending(), 0);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_runs_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sched = TokioScheduler;

        let c = counter.clone();
        sched.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let c = counter.clone();
        sched.schedule_after(
            Duration::from_millis(5),
            Box::new(move || {
                c.fetch_add(10, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }
}
