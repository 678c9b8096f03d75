//! Per-worker busy-fraction accounting.
//!
//! Workers flip between busy and idle around each probe section; the
//! scheduler collapses the accumulated busy time into a fraction of the
//! sample window once per cycle.  The last collected snapshot is what the
//! IPC usage-stats request serves.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct WorkerClock {
    busy_since: Option<Instant>,
    busy_accum: Duration,
}

#[derive(Debug)]
struct TrackerInner {
    clocks: Vec<WorkerClock>,
    window_start: Instant,
    last: Vec<f64>,
}

#[derive(Debug)]
pub(crate) struct UsageTracker {
    inner: Mutex<TrackerInner>,
}

impl UsageTracker {
    pub(crate) fn new(workers: usize) -> Self {
        let clocks = (0..workers)
            .map(|_| WorkerClock {
                busy_since: None,
                busy_accum: Duration::ZERO,
            })
            .collect();
        Self {
            inner: Mutex::new(TrackerInner {
                clocks,
                window_start: Instant::now(),
                last: vec![0.0; workers],
            }),
        }
    }

    pub(crate) fn set_busy(&self, worker: usize) {
        let mut inner = self.lock();
        if let Some(clock) = inner.clocks.get_mut(worker) {
            if clock.busy_since.is_none() {
                clock.busy_since = Some(Instant::now());
            }
        }
    }

    pub(crate) fn set_idle(&self, worker: usize) {
        let mut inner = self.lock();
        if let Some(clock) = inner.clocks.get_mut(worker) {
            if let Some(since) = clock.busy_since.take() {
                clock.busy_accum += since.elapsed();
            }
        }
    }

    /// Folds the current window into per-worker busy fractions and starts a
    /// new window.
    pub(crate) fn collect(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        let window = now.duration_since(inner.window_start).max(Duration::from_millis(1));
        let fractions: Vec<f64> = inner
            .clocks
            .iter_mut()
            .map(|clock| {
                let mut busy = clock.busy_accum;
                if let Some(since) = clock.busy_since.as_mut() {
                    busy += now.duration_since(*since);
                    *since = now;
                }
                clock.busy_accum = Duration::ZERO;
                (busy.as_secs_f64() / window.as_secs_f64()).clamp(0.0, 1.0)
            })
            .collect();
        inner.window_start = now;
        inner.last = fractions;
    }

    /// Busy fractions from the last collected window.
    pub(crate) fn snapshot(&self) -> Vec<f64> {
        self.lock().last.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().expect("usage tracker lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fractions_stay_in_unit_interval() {
        let tracker = UsageTracker::new(2);
        tracker.set_busy(0);
        std::thread::sleep(Duration::from_millis(5));
        tracker.set_idle(0);
        tracker.collect();
        let usage = tracker.snapshot();
        assert_eq!(usage.len(), 2);
        assert!(usage[0] > 0.0 && usage[0] <= 1.0);
        assert_eq!(usage[1], 0.0);
    }

    #[test]
    fn busy_spanning_windows_is_split() {
        let tracker = UsageTracker::new(1);
        tracker.set_busy(0);
        std::thread::sleep(Duration::from_millis(5));
        tracker.collect();
        assert!(tracker.snapshot()[0] > 0.5);
        std::thread::sleep(Duration::from_millis(5));
        tracker.collect();
        assert!(tracker.snapshot()[0] > 0.5);
        tracker.set_idle(0);
    }
}
