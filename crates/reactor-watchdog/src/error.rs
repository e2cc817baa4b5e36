//! Error types for the hang watchdog.
//!
//! Configuration mistakes are surfaced to the caller. Conditions that only
//! affect diagnostics (a probe with nothing to disarm, a stack that could not
//! be captured) are logged and never become errors.

use thiserror::Error;

/// Errors that can occur while configuring or driving the watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchdogError {
    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `start()` was called while monitoring was already running.
    #[error("Watchdog is already started; call stop() before starting again")]
    AlreadyStarted,

    /// The deadline thread could not be created.
    #[error("Failed to spawn deadline timer thread: {0}")]
    TimerSpawnFailed(String),

    /// No event loop was available to schedule the liveness probe on.
    #[error("Reactor unavailable: {0}")]
    ReactorUnavailable(String),

    /// A stack sampler could not be set up on this platform.
    #[error("Stack sampler unavailable: {0}")]
    SamplerUnavailable(String),
}

impl WatchdogError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    /// Create a timer spawn failure error.
    #[must_use]
    pub fn timer_spawn_failed(reason: impl Into<String>) -> Self {
        Self::TimerSpawnFailed(reason.into())
    }

    /// Create a reactor unavailable error.
    #[must_use]
    pub fn reactor_unavailable(reason: impl Into<String>) -> Self {
        Self::ReactorUnavailable(reason.into())
    }

    /// Create a sampler unavailable error.
    #[must_use]
    pub fn sampler_unavailable(reason: impl Into<String>) -> Self {
        Self::SamplerUnavailable(reason.into())
    }

    /// Whether the error stems from how the watchdog was configured or driven,
    /// as opposed to a platform failure.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::InvalidConfiguration(_) | Self::AlreadyStarted)
    }
}

/// A specialized `Result` type for watchdog operations.
pub type WatchdogResult<T> = std::result::Result<T, WatchdogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WatchdogError::invalid_configuration("cancel_interval must be greater than 0");
        assert!(err.to_string().contains("cancel_interval"));

        let err = WatchdogError::AlreadyStarted;
        assert!(err.to_string().contains("already started"));

        let err = WatchdogError::timer_spawn_failed("out of threads");
        assert!(err.to_string().contains("out of threads"));
    }

    #[test]
    fn test_configuration_classification() {
        assert!(WatchdogError::AlreadyStarted.is_configuration_error());
        assert!(WatchdogError::invalid_configuration("bad").is_configuration_error());
        assert!(!WatchdogError::timer_spawn_failed("x").is_configuration_error());
        assert!(!WatchdogError::reactor_unavailable("x").is_configuration_error());
        assert!(!WatchdogError::sampler_unavailable("x").is_configuration_error());
    }
}
