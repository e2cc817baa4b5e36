//! Liveness probe run periodically on the monitored loop.
//!
//! Every run proves the loop is alive: it disarms the pending deadline and
//! arms a fresh one. If the loop hangs the probe stops running, the deadline
//! elapses and the hang handler fires instead.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::deadline::DeadlineHandle;
use crate::sampler::LoopThread;

/// Snapshot of the probe's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMetrics {
    /// Number of probe runs.
    pub runs: u64,
    /// Runs that found no deadline to disarm because a hang had just been
    /// handled.
    pub missed_disarms: u64,
    /// Time since the last run, `None` if the probe never ran.
    pub last_run_age: Option<Duration>,
}

/// What the probe has observed about the loop, shared with the hang handler.
#[derive(Debug)]
pub(crate) struct LoopActivity {
    epoch: Instant,
    runs: AtomicU64,
    missed_disarms: AtomicU64,
    last_run_nanos: AtomicU64,
    thread: OnceLock<LoopThread>,
}

impl LoopActivity {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            runs: AtomicU64::new(0),
            missed_disarms: AtomicU64::new(0),
            last_run_nanos: AtomicU64::new(0),
            thread: OnceLock::new(),
        }
    }

    fn record_run(&self) {
        let _thread = self.thread.get_or_init(LoopThread::current);
        let nanos = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_run_nanos.store(nanos, Ordering::Release);
        self.runs.fetch_add(1, Ordering::AcqRel);
    }

    fn record_missed_disarm(&self) -> u64 {
        self.missed_disarms
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }

    /// Thread the probe runs on, known after its first run.
    pub(crate) fn loop_thread(&self) -> Option<&LoopThread> {
        self.thread.get()
    }

    /// Time since the probe last ran.
    pub(crate) fn stalled_for(&self) -> Option<Duration> {
        if self.runs.load(Ordering::Acquire) == 0 {
            return None;
        }
        let last = Duration::from_nanos(self.last_run_nanos.load(Ordering::Acquire));
        Some(self.epoch.elapsed().saturating_sub(last))
    }

    pub(crate) fn metrics(&self) -> ProbeMetrics {
        ProbeMetrics {
            runs: self.runs.load(Ordering::Acquire),
            missed_disarms: self.missed_disarms.load(Ordering::Relaxed),
            last_run_age: self.stalled_for(),
        }
    }
}

/// The periodic task scheduled on the monitored loop.
#[derive(Debug)]
pub(crate) struct LivenessProbe {
    deadline: DeadlineHandle,
    max_delay: Duration,
    activity: Arc<LoopActivity>,
}

impl LivenessProbe {
    pub(crate) fn new(
        deadline: DeadlineHandle,
        max_delay: Duration,
        activity: Arc<LoopActivity>,
    ) -> Self {
        Self {
            deadline,
            max_delay,
            activity,
        }
    }

    /// Disarm the pending deadline and arm a fresh one.
    ///
    /// Never blocks and never fails; a missing deadline is logged only.
    pub(crate) fn run(&self) {
        if !self.deadline.is_enabled() {
            return;
        }
        self.activity.record_run();

        if !self.deadline.disarm() {
            let missed = self.activity.record_missed_disarm();
            tracing::warn!(
                missed_disarms = missed,
                "No deadline pending to disarm; this should only happen right after a hang was handled"
            );
        }
        self.deadline.arm(self.max_delay);
    }
}
