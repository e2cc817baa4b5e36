//! Scheduling the liveness probe on the monitored loop.
//!
//! The watchdog needs a single primitive from the loop: run a task repeatedly
//! at a fixed cadence, first run immediately. [`Reactor`] captures that
//! contract. With the `tokio` feature, `tokio::runtime::Handle` implements it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::WatchdogResult;

/// Task the loop runs at every tick.
pub type RepeatingTask = Arc<dyn Fn() + Send + Sync>;

/// Handle to a task installed with [`Reactor::schedule_repeating`].
pub trait ScheduledTask: Send + fmt::Debug {
    /// Stop running the task. Runs already in progress may complete.
    fn cancel(self: Box<Self>);
}

/// An event loop that can run a task at a fixed cadence.
pub trait Reactor {
    /// Run `task` every `interval`, starting immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop cannot accept the task.
    fn schedule_repeating(
        &self,
        interval: Duration,
        task: RepeatingTask,
    ) -> WatchdogResult<Box<dyn ScheduledTask>>;
}

#[cfg(feature = "tokio")]
mod tokio_impl {
    use super::{Reactor, RepeatingTask, ScheduledTask};
    use crate::error::{WatchdogError, WatchdogResult};
    use std::panic;
    use std::time::Duration;
    use tokio::runtime::{Handle, RuntimeFlavor};
    use tokio::task::JoinHandle;
    use tokio::time::MissedTickBehavior;

    /// Probe task spawned on a tokio runtime.
    #[derive(Debug)]
    pub struct TokioScheduledTask {
        join: JoinHandle<()>,
    }

    impl ScheduledTask for TokioScheduledTask {
        fn cancel(self: Box<Self>) {
            self.join.abort();
        }
    }

    /// Spawns an interval-driven task. Ticks missed while the loop was stuck
    /// are skipped rather than replayed in a burst.
    ///
    /// Only current-thread runtimes are accepted: on a multi-thread runtime
    /// an idle worker would run the probe while another worker is blocked,
    /// hiding the hang. The runtime must have its time driver enabled.
    impl Reactor for Handle {
        fn schedule_repeating(
            &self,
            interval: Duration,
            task: RepeatingTask,
        ) -> WatchdogResult<Box<dyn ScheduledTask>> {
            let flavor = self.runtime_flavor();
            if flavor != RuntimeFlavor::CurrentThread {
                return Err(WatchdogError::reactor_unavailable(format!(
                    "only current-thread runtimes can be monitored, got {flavor:?}"
                )));
            }

            // Built here rather than inside the task so a runtime without a
            // time driver fails the caller instead of panicking on the loop.
            let mut ticker = {
                let _entered = self.enter();
                panic::catch_unwind(|| tokio::time::interval(interval)).map_err(|_payload| {
                    WatchdogError::reactor_unavailable(
                        "runtime has no time driver; build it with enable_time()",
                    )
                })?
            };
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let join = self.spawn(async move {
                loop {
                    ticker.tick().await;
                    task();
                }
            });
            Ok(Box::new(TokioScheduledTask { join }))
        }
    }
}

#[cfg(feature = "tokio")]
pub use tokio_impl::TokioScheduledTask;

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;
    use crate::error::WatchdogError;
    use std::sync::atomic::{AtomicU64, Ordering};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_tokio_first_tick_is_immediate() -> TestResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let task = runtime.handle().schedule_repeating(
            Duration::from_secs(60),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )?;
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(20)).await });

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        task.cancel();
        Ok(())
    }

    #[test]
    fn test_tokio_cancel_stops_ticks() -> TestResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let task = runtime.handle().schedule_repeating(
            Duration::from_millis(5),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )?;
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(30)).await });
        task.cancel();
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(5)).await });
        let after_cancel = ticks.load(Ordering::SeqCst);
        assert!(after_cancel >= 2);

        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(40)).await });
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
        Ok(())
    }

    #[test]
    fn test_tokio_without_time_driver_is_rejected() -> TestResult {
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let result = runtime.handle().schedule_repeating(
            Duration::from_millis(5),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(matches!(result, Err(WatchdogError::ReactorUnavailable(_))));

        runtime.block_on(async { tokio::task::yield_now().await });
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn test_tokio_multi_thread_is_rejected() -> TestResult {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .build()?;

        let result = runtime
            .handle()
            .schedule_repeating(Duration::from_millis(5), Arc::new(|| {}));
        assert!(matches!(result, Err(WatchdogError::ReactorUnavailable(_))));
        Ok(())
    }
}
