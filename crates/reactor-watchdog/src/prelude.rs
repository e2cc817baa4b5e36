//! Prelude for reactor-watchdog.
//!
//! This module re-exports the most commonly used types for convenient importing.
//!
//! # Example
//!
//! ```rust
//! use reactor_watchdog::prelude::*;
//!
//! let watchdog = HangWatchdog::new(WatchdogConfig::default())?;
//! assert_eq!(watchdog.stats().hang_count, 0);
//! # Ok::<(), WatchdogError>(())
//! ```

pub use crate::config::{WatchdogConfig, WatchdogConfigBuilder};
pub use crate::error::{WatchdogError, WatchdogResult};
pub use crate::handler::HangReport;
pub use crate::reactor::Reactor;
pub use crate::sampler::{StackSampler, StackTrace};
pub use crate::stats::{CodeLocation, HangStats};
pub use crate::watchdog::HangWatchdog;
