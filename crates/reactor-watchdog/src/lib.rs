//! # reactor-watchdog
//!
//! Hang detection for single-threaded cooperative event loops.
//!
//! A liveness probe scheduled on the monitored loop races a deadline timer.
//! Each probe run disarms the pending deadline and arms a fresh one; when the
//! loop stops running scheduled work the probe stops too, the deadline
//! elapses on the watchdog's own thread, and the hang is recorded together
//! with a stack snapshot of where the loop was stuck.
//!
//! ## Guarantees
//!
//! - **At most one pending deadline**: arming replaces, never stacks
//! - **Monitoring survives hangs**: the handler re-arms after every hang, so a
//!   wedged loop yields one hang per `max_delay`
//! - **No deadlock with the hang**: the handler runs off-loop and never blocks
//!   on a lock the loop may hold
//! - **Consistent stats**: snapshots never observe the hang count without the
//!   matching per-location count
//!
//! ## Architecture
//!
//! - [`config`] - Probe cadence, deadline and capture settings
//! - [`deadline`] - One-shot deadline timer on a dedicated thread
//! - [`sampler`] - Stack capture for the monitored loop thread
//! - `signal` - Signal-driven user-space stack capture (Linux)
//! - [`handler`] - Hang reports and callbacks
//! - [`probe`] - Probe activity metrics
//! - [`reactor`] - Scheduling contract with the monitored loop
//! - [`stats`] - Hang counters and per-location tallies
//! - [`watchdog`] - The controller tying it together
//! - [`error`] - Watchdog-specific error types
//!
//! ## Example
//!
//! ```rust
//! use reactor_watchdog::prelude::*;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_time()
//!     .build()?;
//!
//! let config = WatchdogConfig::builder()
//!     .cancel_interval(Duration::from_millis(10))
//!     .max_delay(Duration::from_millis(50))
//!     .build()?;
//! let watchdog = HangWatchdog::new(config)?;
//! watchdog.start(runtime.handle())?;
//!
//! runtime.block_on(async {
//!     let _scope = watchdog.checkpoint("rebuild_index");
//!     // Blocks the loop: the probe cannot run, the deadline elapses.
//!     std::thread::sleep(Duration::from_millis(120));
//! });
//! watchdog.stop();
//!
//! let stats = watchdog.stats();
//! assert!(stats.hang_count >= 1);
//! # Ok(())
//! # }
//! ```

#![deny(
    unsafe_op_in_unsafe_fn,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::panic,
    missing_docs,
    missing_debug_implementations
)]
#![warn(clippy::pedantic)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod deadline;
pub mod error;
pub mod handler;
pub mod probe;
pub mod reactor;
pub mod sampler;
#[cfg(target_os = "linux")]
pub mod signal;
pub mod stats;
pub mod watchdog;

pub mod prelude;

pub use config::{WatchdogConfig, WatchdogConfigBuilder};
pub use deadline::{DeadlineHandle, DeadlineMetrics, DeadlineTimer};
pub use error::{WatchdogError, WatchdogResult};
pub use handler::{HangCallback, HangReport};
pub use probe::ProbeMetrics;
pub use reactor::{Reactor, RepeatingTask, ScheduledTask};
pub use sampler::{
    CallsiteGuard, CallsiteSampler, CallsiteTracker, LoopThread, ProcStackSampler, StackFrame,
    StackSampler, StackTrace,
};
#[cfg(target_os = "linux")]
pub use signal::SignalStackSampler;
pub use stats::{CodeLocation, HangStats};
pub use watchdog::HangWatchdog;
