//! Hang watchdog controller.
//!
//! This module provides [`HangWatchdog`], which wires the liveness probe, the
//! deadline timer and the hang handler together and owns their lifecycle.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::config::WatchdogConfig;
use crate::deadline::{DeadlineHandle, DeadlineMetrics, DeadlineTimer};
use crate::error::{WatchdogError, WatchdogResult};
use crate::handler::{HangCallback, HangHandler, HangReport};
use crate::probe::{LivenessProbe, LoopActivity, ProbeMetrics};
use crate::reactor::{Reactor, ScheduledTask};
use crate::sampler::{
    CallsiteGuard, CallsiteSampler, CallsiteTracker, ProcStackSampler, StackSampler,
};
#[cfg(target_os = "linux")]
use crate::signal::SignalStackSampler;
use crate::stats::{HangRegistry, HangStats};

/// Detects when the monitored loop stops running scheduled work.
///
/// A liveness probe scheduled on the loop re-arms a deadline every
/// `cancel_interval`. If the loop hangs for longer than `max_delay`, the
/// deadline elapses on the watchdog's own thread, which records a hang
/// against the location the loop was stuck at and re-arms the deadline.
/// A loop that stays stuck therefore produces one hang per `max_delay`.
///
/// # Thread Safety
///
/// All methods take `&self`. Counters are read through snapshots that are
/// never torn, and the hang handler never takes a lock the loop may hold.
///
/// # Example
///
/// ```rust
/// use reactor_watchdog::prelude::*;
/// use std::time::Duration;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let runtime = tokio::runtime::Builder::new_current_thread()
///     .enable_time()
///     .build()?;
/// let config = WatchdogConfig::new(Duration::from_millis(10), Duration::from_millis(200))?;
/// let watchdog = HangWatchdog::new(config)?;
///
/// watchdog.start(runtime.handle())?;
/// runtime.block_on(async { tokio::time::sleep(Duration::from_millis(50)).await });
/// watchdog.stop();
///
/// assert_eq!(watchdog.stats().hang_count, 0);
/// # Ok(())
/// # }
/// ```
pub struct HangWatchdog {
    config: WatchdogConfig,
    timer: DeadlineTimer,
    probe: Arc<LivenessProbe>,
    activity: Arc<LoopActivity>,
    registry: Arc<HangRegistry>,
    callsites: Arc<CallsiteTracker>,
    callbacks: Arc<RwLock<Vec<HangCallback>>>,
    scheduled: Mutex<Option<Box<dyn ScheduledTask>>>,
}

impl HangWatchdog {
    /// Create a watchdog that samples checkpoints entered with
    /// [`HangWatchdog::checkpoint`], then the user-space stack of the loop
    /// thread (Linux, when `signal_sampling` is set), then its kernel stack
    /// where procfs allows it.
    ///
    /// The deadline thread and hang handler are installed immediately;
    /// nothing is armed until [`HangWatchdog::start`].
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the deadline
    /// thread cannot be spawned.
    pub fn new(config: WatchdogConfig) -> WatchdogResult<Self> {
        Self::build(config, None)
    }

    /// Create a watchdog with a custom stack sampler.
    ///
    /// Checkpoints are still tracked but only reach hang reports if `sampler`
    /// reads them.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the deadline
    /// thread cannot be spawned.
    pub fn with_sampler<S>(config: WatchdogConfig, sampler: S) -> WatchdogResult<Self>
    where
        S: StackSampler + 'static,
    {
        let sampler: Arc<dyn StackSampler> = Arc::new(sampler);
        Self::build(config, Some(sampler))
    }

    fn build(
        config: WatchdogConfig,
        sampler: Option<Arc<dyn StackSampler>>,
    ) -> WatchdogResult<Self> {
        config.validate()?;

        let callsites = Arc::new(CallsiteTracker::new(config.max_stack_depth));
        let sampler = match sampler {
            Some(sampler) => sampler,
            None => default_sampler(&config, &callsites),
        };
        let registry = Arc::new(HangRegistry::new());
        let activity = Arc::new(LoopActivity::new());
        let callbacks = Arc::new(RwLock::new(Vec::new()));

        let handler = HangHandler::new(
            config.max_delay,
            config.max_stack_depth,
            sampler,
            Arc::clone(&registry),
            Arc::clone(&activity),
            Arc::clone(&callbacks),
        );
        let timer = DeadlineTimer::spawn(
            config.timer_thread_name.clone(),
            move |deadline: &DeadlineHandle| handler.on_deadline(deadline),
        )?;
        // Nothing may fire before start().
        timer.handle().suspend();

        let probe = Arc::new(LivenessProbe::new(
            timer.handle().clone(),
            config.max_delay,
            Arc::clone(&activity),
        ));

        Ok(Self {
            config,
            timer,
            probe,
            activity,
            registry,
            callsites,
            callbacks,
            scheduled: Mutex::new(None),
        })
    }

    /// Start monitoring: arm the first deadline and schedule the liveness
    /// probe on `reactor` every `cancel_interval`, first run immediately.
    ///
    /// `reactor` must be a single-threaded loop. A tokio `Handle` is only
    /// accepted for a current-thread runtime with the time driver enabled.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::AlreadyStarted`] if monitoring is running, or
    /// the reactor's error if the probe cannot be scheduled.
    pub fn start<R>(&self, reactor: &R) -> WatchdogResult<()>
    where
        R: Reactor + ?Sized,
    {
        let mut scheduled = self.scheduled.lock();
        if scheduled.is_some() {
            return Err(WatchdogError::AlreadyStarted);
        }

        let deadline = self.timer.handle();
        deadline.resume();
        deadline.arm(self.config.max_delay);

        let probe = Arc::clone(&self.probe);
        match reactor.schedule_repeating(self.config.cancel_interval, Arc::new(move || probe.run()))
        {
            Ok(task) => {
                *scheduled = Some(task);
                tracing::info!(
                    cancel_interval = ?self.config.cancel_interval,
                    max_delay = ?self.config.max_delay,
                    "Reactor watchdog started"
                );
                Ok(())
            }
            Err(e) => {
                deadline.suspend();
                tracing::warn!(error = %e, "Failed to schedule liveness probe");
                Err(e)
            }
        }
    }

    /// Start monitoring the tokio runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns [`WatchdogError::ReactorUnavailable`] outside a tokio runtime
    /// or on a multi-thread runtime, or any error from [`HangWatchdog::start`].
    #[cfg(feature = "tokio")]
    pub fn start_on_current_runtime(&self) -> WatchdogResult<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| WatchdogError::reactor_unavailable(e.to_string()))?;
        self.start(&handle)
    }

    /// Stop monitoring.
    ///
    /// Cancels the probe and disarms the deadline. If a hang is being handled
    /// on the deadline thread, waits for it to finish, so no hang is recorded
    /// after this returns. Calling it again is a no-op.
    pub fn stop(&self) {
        let task = self.scheduled.lock().take();
        let was_running = task.is_some();
        if let Some(task) = task {
            task.cancel();
        }
        self.timer.handle().suspend();

        if was_running {
            tracing::info!(
                hang_count = self.registry.hang_count(),
                "Reactor watchdog stopped"
            );
        }
    }

    /// Whether monitoring is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduled.lock().is_some()
    }

    /// Snapshot of the hang counters.
    #[must_use]
    pub fn stats(&self) -> HangStats {
        self.registry.snapshot()
    }

    /// Write the hang count and per-location counts to `out`.
    ///
    /// # Errors
    ///
    /// Returns any error raised by the underlying writer.
    pub fn print_stats<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        self.stats().print_stats(out)
    }

    /// Mark the caller's location as the scope the loop is executing until the
    /// returned guard is dropped. Hang reports name the innermost open scope.
    ///
    /// Only call this from the monitored loop thread.
    #[track_caller]
    #[must_use = "the scope ends when the guard is dropped"]
    pub fn checkpoint(&self, name: &'static str) -> CallsiteGuard {
        self.callsites.enter(name)
    }

    /// Tracker behind [`HangWatchdog::checkpoint`], for code that does not
    /// hold a reference to the watchdog.
    #[must_use]
    pub fn callsites(&self) -> Arc<CallsiteTracker> {
        Arc::clone(&self.callsites)
    }

    /// Add a callback invoked for every detected hang.
    pub fn add_hang_callback<F>(&self, callback: F)
    where
        F: Fn(&HangReport) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Liveness probe activity.
    #[must_use]
    pub fn probe_metrics(&self) -> ProbeMetrics {
        self.activity.metrics()
    }

    /// Deadline timer activity.
    #[must_use]
    pub fn deadline_metrics(&self) -> DeadlineMetrics {
        self.timer.handle().metrics()
    }

    /// Whether a deadline is currently pending.
    #[must_use]
    pub fn is_deadline_pending(&self) -> bool {
        self.timer.handle().is_pending()
    }

    /// Get the current configuration.
    #[must_use]
    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }
}

impl Drop for HangWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for HangWatchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HangWatchdog")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("hang_count", &self.registry.hang_count())
            .field("callbacks", &self.callbacks.read().len())
            .finish_non_exhaustive()
    }
}

/// Checkpoints first, then the interrupted user stack, then the kernel stack.
fn default_sampler(
    config: &WatchdogConfig,
    callsites: &Arc<CallsiteTracker>,
) -> Arc<dyn StackSampler> {
    let checkpoints = CallsiteSampler::new(Arc::clone(callsites));

    #[cfg(target_os = "linux")]
    if config.signal_sampling {
        match SignalStackSampler::install_default() {
            Ok(signal) => return Arc::new((checkpoints, (signal, ProcStackSampler))),
            Err(e) => {
                tracing::warn!(error = %e, "Signal stack sampling unavailable, using procfs");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _signal_sampling = config.signal_sampling;

    Arc::new((checkpoints, ProcStackSampler))
}
