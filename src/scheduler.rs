//! Delayed tasks and time sources.
//!
//! Retry timers and fan-out jobs go through a [`Scheduler`] so that timing
//! can be driven by hand in tests ([`ManualScheduler`]) and by the tokio
//! runtime in production ([`TokioScheduler`]).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Unit of deferred work.
pub type Job = BoxFuture<'static, ()>;

/// Source of wall-clock timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add_delay(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + delay`, saturating at the latest representable instant.
pub(crate) fn add_delay(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(delay)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Runs jobs after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, job: Job);

    /// Run `job` as soon as possible, detached from the caller.
    fn spawn(&self, job: Job) {
        self.schedule(Duration::ZERO, job);
    }
}

/// Spawns every job as its own tokio task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            crate::trace_event!(error, target: "scheduler", "no tokio runtime available, job dropped");
            return;
        };
        handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            job.await;
        });
    }
}

struct TimedJob {
    ready_at: DateTime<Utc>,
    seq: u64,
    delay: Duration,
    job: Job,
}

impl Eq for TimedJob {}

impl PartialEq for TimedJob {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Ord for TimedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the heap pops the earliest job first.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Deterministic scheduler driven by a [`ManualClock`].
///
/// Nothing runs until [`run_due`](Self::run_due) or
/// [`advance`](Self::advance) is awaited; jobs then run one after another on
/// the caller's task, in ready-time order.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    queue: Arc<Mutex<BinaryHeap<TimedJob>>>,
    seq: Arc<AtomicU64>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Requested delays of pending jobs, earliest first.
    pub fn pending_delays(&self) -> Vec<Duration> {
        let queue = self.queue.lock();
        let mut items: Vec<(DateTime<Utc>, u64, Duration)> =
            queue.iter().map(|j| (j.ready_at, j.seq, j.delay)).collect();
        items.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        items.into_iter().map(|(_, _, delay)| delay).collect()
    }

    fn pop_ready(&self, deadline: DateTime<Utc>) -> Option<TimedJob> {
        let mut queue = self.queue.lock();
        match queue.peek() {
            Some(next) if next.ready_at <= deadline => queue.pop(),
            _ => None,
        }
    }

    /// Run every job that is due at the current time, including jobs that
    /// become due while running. Returns how many jobs ran.
    pub async fn run_due(&self) -> usize {
        let mut ran = 0;
        while let Some(timed) = self.pop_ready(self.clock.now()) {
            timed.job.await;
            ran += 1;
        }
        ran
    }

    /// Move the clock forward by `by`, running jobs at their ready times.
    pub async fn advance(&self, by: Duration) -> usize {
        let target = add_delay(self.clock.now(), by);
        let mut ran = 0;
        while let Some(timed) = self.pop_ready(target) {
            if timed.ready_at > self.clock.now() {
                self.clock.set(timed.ready_at);
            }
            timed.job.await;
            ran += 1;
        }
        self.clock.set(target);
        ran + self.run_due().await
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, job: Job) {
        let timed = TimedJob {
            ready_at: add_delay(self.clock.now(), delay),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            delay,
            job,
        };
        self.queue.lock().push(timed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_job(counter: &Arc<AtomicUsize>) -> Job {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn manual_scheduler_runs_only_due_jobs() {
        let scheduler = ManualScheduler::new(ManualClock::default());
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.spawn(counter_job(&counter));
        scheduler.schedule(Duration::from_millis(1_000), counter_job(&counter));
        scheduler.schedule(Duration::from_millis(2_000), counter_job(&counter));
        assert_eq!(
            scheduler.pending_delays(),
            vec![Duration::ZERO, Duration::from_millis(1_000), Duration::from_millis(2_000)]
        );

        assert_eq!(scheduler.run_due().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert_eq!(scheduler.advance(Duration::from_millis(999)).await, 0);
        assert_eq!(scheduler.advance(Duration::from_millis(1)).await, 1);
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(scheduler.advance(Duration::from_secs(5)).await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn manual_scheduler_sets_clock_to_job_time() {
        let clock = ManualClock::default();
        let start = clock.now();
        let scheduler = ManualScheduler::new(clock.clone());
        let seen = Arc::new(Mutex::new(None));

        let seen_in_job = seen.clone();
        let clock_in_job = clock.clone();
        scheduler.schedule(
            Duration::from_millis(1_500),
            Box::pin(async move {
                *seen_in_job.lock() = Some(clock_in_job.now());
            }),
        );

        scheduler.advance(Duration::from_secs(10)).await;
        assert_eq!(*seen.lock(), Some(start + chrono::Duration::milliseconds(1_500)));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(10));
    }

    #[tokio::test]
    async fn tokio_scheduler_runs_after_delay() {
        tokio::time::pause();
        let counter = Arc::new(AtomicUsize::new(0));
        TokioScheduler.schedule(Duration::from_millis(500), counter_job(&counter));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn add_delay_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(add_delay(now, Duration::from_secs(2)), now + chrono::Duration::seconds(2));
        assert_eq!(add_delay(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(
            add_delay(now, Duration::from_millis(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
    }
}
