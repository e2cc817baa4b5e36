//! One-shot deadline timer with a single pending slot.
//!
//! The timer owns a dedicated thread that sleeps until the pending deadline
//! elapses and then runs the expiry callback. Because the callback runs on
//! that thread, it is delivered even when the monitored loop is completely
//! blocked.
//!
//! ## State Machine
//!
//! ```text
//!            arm()                 elapse
//!  Idle ────────────► Pending ────────────► Firing
//!   ▲  ◄──────────────   │ ▲                  │
//!   │     disarm()       │ │ arm() (replace)  │ callback may arm()
//!   │                    └─┘                  │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! At most one deadline is pending at any time: arming replaces whatever was
//! pending before.

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{WatchdogError, WatchdogResult};

/// Counters describing the timer's activity since it was spawned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineMetrics {
    /// Number of accepted `arm()` calls.
    pub arms: u64,
    /// Number of deadlines cancelled before they elapsed.
    pub disarms: u64,
    /// Number of deadlines that elapsed and ran the expiry callback.
    pub expiries: u64,
}

#[derive(Debug)]
struct Slot {
    deadline: Option<Instant>,
    enabled: bool,
    /// Thread currently running the expiry callback.
    firing: Option<ThreadId>,
    shutdown: bool,
}

#[derive(Debug)]
struct TimerShared {
    slot: Mutex<Slot>,
    changed: Condvar,
    arms: AtomicU64,
    disarms: AtomicU64,
    expiries: AtomicU64,
}

/// Cloneable handle used to arm and disarm the deadline.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    shared: Arc<TimerShared>,
}

impl DeadlineHandle {
    /// Arm a deadline `delay` from now, replacing any pending one.
    ///
    /// Returns `false` if the timer is suspended or shut down, in which case
    /// nothing is armed.
    pub fn arm(&self, delay: Duration) -> bool {
        let Some(at) = Instant::now().checked_add(delay) else {
            tracing::warn!(?delay, "Deadline delay overflows the clock, not arming");
            return false;
        };

        {
            let mut slot = self.shared.slot.lock();
            if !slot.enabled || slot.shutdown {
                return false;
            }
            slot.deadline = Some(at);
        }

        self.shared.arms.fetch_add(1, Ordering::Relaxed);
        self.shared.changed.notify_all();
        true
    }

    /// Cancel the pending deadline.
    ///
    /// Returns `true` if a deadline was pending. `false` means either nothing
    /// was ever armed or the deadline already elapsed.
    pub fn disarm(&self) -> bool {
        let was_pending = self.shared.slot.lock().deadline.take().is_some();
        if was_pending {
            self.shared.disarms.fetch_add(1, Ordering::Relaxed);
            self.shared.changed.notify_all();
        }
        was_pending
    }

    /// Whether a deadline is currently pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.slot.lock().deadline.is_some()
    }

    /// Time left before the pending deadline elapses.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.shared
            .slot
            .lock()
            .deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whether the expiry callback is running right now.
    #[must_use]
    pub fn is_firing(&self) -> bool {
        self.shared.slot.lock().firing.is_some()
    }

    /// Stop accepting deadlines and cancel the pending one.
    ///
    /// If the expiry callback is running on another thread, this waits for it
    /// to return, so no callback runs after `suspend()` returns. Called from
    /// inside the callback it returns immediately.
    pub fn suspend(&self) {
        let current = thread::current().id();
        let mut slot = self.shared.slot.lock();
        slot.enabled = false;
        if slot.deadline.take().is_some() {
            self.shared.disarms.fetch_add(1, Ordering::Relaxed);
        }
        while slot.firing.is_some_and(|id| id != current) {
            self.shared.changed.wait(&mut slot);
        }
        drop(slot);
        self.shared.changed.notify_all();
    }

    /// Accept deadlines again after `suspend()`.
    pub fn resume(&self) {
        self.shared.slot.lock().enabled = true;
    }

    /// Whether the timer currently accepts deadlines.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let slot = self.shared.slot.lock();
        slot.enabled && !slot.shutdown
    }

    /// Snapshot of the activity counters.
    #[must_use]
    pub fn metrics(&self) -> DeadlineMetrics {
        DeadlineMetrics {
            arms: self.shared.arms.load(Ordering::Relaxed),
            disarms: self.shared.disarms.load(Ordering::Relaxed),
            expiries: self.shared.expiries.load(Ordering::Relaxed),
        }
    }
}

/// Deadline timer backed by a dedicated thread.
///
/// The expiry callback receives the timer's [`DeadlineHandle`] so it can
/// re-arm. It runs without the slot lock held; arming or disarming from other
/// threads never waits on it.
///
/// Dropping the timer shuts the thread down and joins it.
#[derive(Debug)]
pub struct DeadlineTimer {
    handle: DeadlineHandle,
    thread: Option<JoinHandle<()>>,
}

impl DeadlineTimer {
    /// Spawn the deadline thread.
    ///
    /// The timer starts enabled with nothing armed.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be created.
    pub fn spawn<F>(name: impl Into<String>, on_expiry: F) -> WatchdogResult<Self>
    where
        F: FnMut(&DeadlineHandle) + Send + 'static,
    {
        let handle = DeadlineHandle {
            shared: Arc::new(TimerShared {
                slot: Mutex::new(Slot {
                    deadline: None,
                    enabled: true,
                    firing: None,
                    shutdown: false,
                }),
                changed: Condvar::new(),
                arms: AtomicU64::new(0),
                disarms: AtomicU64::new(0),
                expiries: AtomicU64::new(0),
            }),
        };

        let thread_handle = handle.clone();
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn(move || run_timer(&thread_handle, on_expiry))
            .map_err(|e| WatchdogError::timer_spawn_failed(e.to_string()))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle for arming and disarming this timer.
    #[must_use]
    pub fn handle(&self) -> &DeadlineHandle {
        &self.handle
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        {
            let mut slot = self.handle.shared.slot.lock();
            slot.shutdown = true;
            slot.deadline = None;
        }
        self.handle.shared.changed.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("Deadline timer thread panicked");
            }
        }
    }
}

fn run_timer<F>(handle: &DeadlineHandle, mut on_expiry: F)
where
    F: FnMut(&DeadlineHandle),
{
    let shared = &handle.shared;
    tracing::debug!("Deadline timer thread started");

    let mut slot = shared.slot.lock();
    loop {
        if slot.shutdown {
            break;
        }
        match slot.deadline {
            None => shared.changed.wait(&mut slot),
            Some(at) if Instant::now() >= at => {
                slot.deadline = None;
                slot.firing = Some(thread::current().id());
                shared.expiries.fetch_add(1, Ordering::Relaxed);

                MutexGuard::unlocked(&mut slot, || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| on_expiry(handle)));
                    if outcome.is_err() {
                        tracing::error!("Deadline expiry callback panicked");
                    }
                });

                slot.firing = None;
                shared.changed.notify_all();
            }
            Some(at) => {
                let _timed_out = shared.changed.wait_until(&mut slot, at);
            }
        }
    }
    drop(slot);

    tracing::debug!("Deadline timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn counting_timer() -> WatchdogResult<(DeadlineTimer, Arc<AtomicUsize>)> {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = DeadlineTimer::spawn("deadline-test", move |_: &DeadlineHandle| {
            counter.fetch_add(1, Ordering::SeqCst);
        })?;
        Ok((timer, fired))
    }

    #[test]
    fn test_disarm_reports_pending() -> TestResult {
        let (timer, fired) = counting_timer()?;
        let handle = timer.handle();

        assert!(!handle.disarm());
        assert!(handle.arm(Duration::from_secs(10)));
        assert!(handle.is_pending());
        assert!(handle.disarm());
        assert!(!handle.is_pending());
        assert!(!handle.disarm());

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let metrics = handle.metrics();
        assert_eq!(metrics.arms, 1);
        assert_eq!(metrics.disarms, 1);
        assert_eq!(metrics.expiries, 0);
        Ok(())
    }

    #[test]
    fn test_elapsed_deadline_fires_once() -> TestResult {
        let (timer, fired) = counting_timer()?;
        let handle = timer.handle();

        handle.arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(150));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!handle.is_pending());
        assert!(!handle.disarm());
        assert_eq!(handle.metrics().expiries, 1);
        Ok(())
    }

    #[test]
    fn test_rearm_replaces_pending() -> TestResult {
        let (timer, fired) = counting_timer()?;
        let handle = timer.handle();

        handle.arm(Duration::from_millis(30));
        handle.arm(Duration::from_secs(10));
        thread::sleep(Duration::from_millis(120));

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());
        let remaining = handle.remaining().ok_or("expected a pending deadline")?;
        assert!(remaining > Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn test_callback_rearms() -> TestResult {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = DeadlineTimer::spawn("deadline-rearm", move |handle: &DeadlineHandle| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                handle.arm(Duration::from_millis(20));
            }
        })?;

        timer.handle().arm(Duration::from_millis(20));
        thread::sleep(Duration::from_millis(300));

        assert_eq!(fired.load(Ordering::SeqCst), 3);
        let metrics = timer.handle().metrics();
        assert_eq!(metrics.arms, 3);
        assert_eq!(metrics.expiries, 3);
        Ok(())
    }

    #[test]
    fn test_suspend_refuses_arming() -> TestResult {
        let (timer, fired) = counting_timer()?;
        let handle = timer.handle();

        handle.arm(Duration::from_millis(30));
        handle.suspend();
        assert!(!handle.is_pending());
        assert!(!handle.is_enabled());
        assert!(!handle.arm(Duration::from_millis(10)));

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        handle.resume();
        assert!(handle.arm(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_suspend_waits_for_inflight_callback() -> TestResult {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        let timer = DeadlineTimer::spawn("deadline-slow", move |_: &DeadlineHandle| {
            thread::sleep(Duration::from_millis(100));
            flag.store(1, Ordering::SeqCst);
        })?;
        let handle = timer.handle();

        handle.arm(Duration::from_millis(1));
        let start = Instant::now();
        while !handle.is_firing() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(1));
        }
        handle.suspend();

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!handle.is_firing());
        Ok(())
    }

    #[test]
    fn test_panicking_callback_keeps_thread_alive() -> TestResult {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = DeadlineTimer::spawn("deadline-panic", move |_: &DeadlineHandle| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                std::panic::resume_unwind(Box::new("first expiry fails"));
            }
        })?;

        timer.handle().arm(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(80));
        timer.handle().arm(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(80));

        assert_eq!(fired.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn test_drop_joins_thread() -> TestResult {
        let (timer, fired) = counting_timer()?;
        let handle = timer.handle().clone();
        handle.arm(Duration::from_millis(50));
        drop(timer);

        assert!(!handle.is_enabled());
        assert!(!handle.arm(Duration::from_millis(1)));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
