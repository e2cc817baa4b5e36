//! Watchdog configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{WatchdogError, WatchdogResult};

/// Default cadence of the liveness probe.
pub const DEFAULT_CANCEL_INTERVAL: Duration = Duration::from_millis(100);

/// Default deadline armed after every successful probe run.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(500);

/// Default number of frames kept per captured stack.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 32;

/// Default name of the deadline thread.
pub const DEFAULT_TIMER_THREAD_NAME: &str = "reactor-watchdog";

/// Hang watchdog configuration.
///
/// `max_delay` is the only timeout: it is used both after a probe run and
/// after a hang has been handled. It is never adapted or backed off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// How often the liveness probe runs on the monitored loop.
    pub cancel_interval: Duration,
    /// Deadline armed each time the probe runs or a hang is handled.
    pub max_delay: Duration,
    /// Maximum number of frames captured for a hang report.
    pub max_stack_depth: usize,
    /// Name given to the deadline thread.
    pub timer_thread_name: String,
    /// Interrupt the loop thread with a signal to capture its user-space
    /// stack. Only honoured on Linux.
    #[serde(default = "default_signal_sampling")]
    pub signal_sampling: bool,
}

fn default_signal_sampling() -> bool {
    true
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            cancel_interval: DEFAULT_CANCEL_INTERVAL,
            max_delay: DEFAULT_MAX_DELAY,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            timer_thread_name: DEFAULT_TIMER_THREAD_NAME.to_string(),
            signal_sampling: default_signal_sampling(),
        }
    }
}

impl WatchdogConfig {
    /// Create a validated configuration from the two timing parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if either duration is zero or if the probe would run
    /// less often than the deadline elapses.
    pub fn new(cancel_interval: Duration, max_delay: Duration) -> WatchdogResult<Self> {
        let config = Self {
            cancel_interval,
            max_delay,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> WatchdogResult<()> {
        if self.cancel_interval.is_zero() {
            return Err(WatchdogError::invalid_configuration(
                "cancel_interval must be greater than 0",
            ));
        }
        if self.max_delay.is_zero() {
            return Err(WatchdogError::invalid_configuration(
                "max_delay must be greater than 0",
            ));
        }
        if self.cancel_interval >= self.max_delay {
            return Err(WatchdogError::invalid_configuration(format!(
                "cancel_interval ({:?}) must be less than max_delay ({:?})",
                self.cancel_interval, self.max_delay
            )));
        }
        if self.max_stack_depth == 0 {
            return Err(WatchdogError::invalid_configuration(
                "max_stack_depth must be greater than 0",
            ));
        }
        if self.timer_thread_name.is_empty() {
            return Err(WatchdogError::invalid_configuration(
                "timer_thread_name must not be empty",
            ));
        }
        Ok(())
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> WatchdogConfigBuilder {
        WatchdogConfigBuilder::default()
    }
}

/// Builder for `WatchdogConfig`.
#[derive(Debug, Default)]
pub struct WatchdogConfigBuilder {
    config: WatchdogConfig,
}

impl WatchdogConfigBuilder {
    /// Set the probe cadence.
    #[must_use]
    pub fn cancel_interval(mut self, interval: Duration) -> Self {
        self.config.cancel_interval = interval;
        self
    }

    /// Set the deadline duration.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the maximum captured stack depth.
    #[must_use]
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.config.max_stack_depth = depth;
        self
    }

    /// Set the deadline thread name.
    #[must_use]
    pub fn timer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.timer_thread_name = name.into();
        self
    }

    /// Enable or disable signal-driven stack capture.
    #[must_use]
    pub fn signal_sampling(mut self, enabled: bool) -> Self {
        self.config.signal_sampling = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> WatchdogResult<WatchdogConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchdogConfig::default();
        assert_eq!(config.cancel_interval, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_millis(500));
        assert_eq!(config.max_stack_depth, 32);
        assert!(config.signal_sampling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(WatchdogConfig::new(Duration::ZERO, Duration::from_millis(500)).is_err());
        assert!(WatchdogConfig::new(Duration::from_millis(100), Duration::ZERO).is_err());
        assert!(
            WatchdogConfig::new(Duration::from_millis(500), Duration::from_millis(500)).is_err()
        );
        assert!(
            WatchdogConfig::new(Duration::from_millis(600), Duration::from_millis(500)).is_err()
        );
        assert!(
            WatchdogConfig::new(Duration::from_millis(10), Duration::from_millis(50)).is_ok()
        );
    }

    #[test]
    fn test_config_builder() {
        let result = WatchdogConfig::builder()
            .cancel_interval(Duration::from_millis(20))
            .max_delay(Duration::from_millis(200))
            .max_stack_depth(8)
            .timer_thread_name("loop-watchdog")
            .signal_sampling(false)
            .build();
        assert!(result.is_ok());
        if let Ok(config) = result {
            assert_eq!(config.cancel_interval, Duration::from_millis(20));
            assert_eq!(config.max_delay, Duration::from_millis(200));
            assert_eq!(config.max_stack_depth, 8);
            assert_eq!(config.timer_thread_name, "loop-watchdog");
            assert!(!config.signal_sampling);
        }
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        let result = WatchdogConfig::builder().max_stack_depth(0).build();
        assert!(matches!(
            result,
            Err(WatchdogError::InvalidConfiguration(_))
        ));

        let result = WatchdogConfig::builder().timer_thread_name("").build();
        assert!(result.is_err());
    }
}
