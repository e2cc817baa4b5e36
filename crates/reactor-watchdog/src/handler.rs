//! Deadline expiry handler.
//!
//! Runs on the deadline thread when the probe failed to disarm in time:
//! captures the loop's stack, reports it, counts the hang against the stuck
//! location and re-arms so monitoring continues while the loop stays wedged.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::deadline::DeadlineHandle;
use crate::probe::LoopActivity;
use crate::sampler::{LoopThread, StackSampler, StackTrace};
use crate::stats::{CodeLocation, HangRegistry};

/// Callback invoked with every hang report.
///
/// Callbacks run on the deadline thread after the deadline has been re-armed.
/// A panicking callback is logged and does not affect the others.
pub type HangCallback = Arc<dyn Fn(&HangReport) + Send + Sync>;

/// Diagnostic record of one detected hang.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HangReport {
    /// 1-based hang number, equal to the hang count after this hang.
    pub sequence: u64,
    /// Where the loop was stuck; the sentinel if nothing was captured.
    pub location: CodeLocation,
    /// Captured stack, if any sampler produced one.
    pub stack: Option<StackTrace>,
    /// Loop thread identity, known once the probe has run.
    pub loop_thread: Option<LoopThread>,
    /// Time since the probe last ran.
    pub stalled_for: Option<Duration>,
}

impl fmt::Display for HangReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hang #{} at {}", self.sequence, self.location)?;
        if let Some(thread) = &self.loop_thread {
            write!(f, " on {thread}")?;
        }
        if let Some(stalled) = self.stalled_for {
            write!(f, " (no probe for {stalled:?})")?;
        }
        writeln!(f)?;
        match &self.stack {
            Some(stack) => write!(f, "{stack}"),
            None => writeln!(f, "  <stack unavailable>"),
        }
    }
}

pub(crate) struct HangHandler {
    max_delay: Duration,
    max_stack_depth: usize,
    sampler: Arc<dyn StackSampler>,
    registry: Arc<HangRegistry>,
    activity: Arc<LoopActivity>,
    callbacks: Arc<RwLock<Vec<HangCallback>>>,
}

impl HangHandler {
    pub(crate) fn new(
        max_delay: Duration,
        max_stack_depth: usize,
        sampler: Arc<dyn StackSampler>,
        registry: Arc<HangRegistry>,
        activity: Arc<LoopActivity>,
        callbacks: Arc<RwLock<Vec<HangCallback>>>,
    ) -> Self {
        Self {
            max_delay,
            max_stack_depth,
            sampler,
            registry,
            activity,
            callbacks,
        }
    }

    /// Handle one elapsed deadline.
    pub(crate) fn on_deadline(&self, deadline: &DeadlineHandle) {
        let report = self.record_hang();

        tracing::error!(
            hang = report.sequence,
            location = %report.location,
            stalled_ms = report
                .stalled_for
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            loop_thread = ?report.loop_thread,
            "Reactor hang detected\n{}",
            report
                .stack
                .as_ref()
                .map_or_else(|| "  <stack unavailable>\n".to_string(), ToString::to_string)
        );

        deadline.arm(self.max_delay);
        self.notify(&report);
    }

    /// Capture and count a hang. Capture failures fall back to the sentinel
    /// location so the hang is always counted.
    fn record_hang(&self) -> HangReport {
        let loop_thread = self.activity.loop_thread().cloned();
        let stack = panic::catch_unwind(AssertUnwindSafe(|| {
            self.sampler
                .capture(loop_thread.as_ref(), self.max_stack_depth)
        }))
        .unwrap_or_else(|_| {
            tracing::warn!("Stack sampler panicked; counting hang at unknown location");
            None
        });

        let location = stack
            .as_ref()
            .map_or_else(CodeLocation::unknown, StackTrace::location);
        let sequence = self.registry.record(location.clone());

        HangReport {
            sequence,
            location,
            stack,
            loop_thread,
            stalled_for: self.activity.stalled_for(),
        }
    }

    fn notify(&self, report: &HangReport) {
        let callbacks = self.callbacks.read();
        for callback in callbacks.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(report)));
            if outcome.is_err() {
                tracing::error!(hang = report.sequence, "Hang callback panicked");
            }
        }
    }
}

impl fmt::Debug for HangHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HangHandler")
            .field("max_delay", &self.max_delay)
            .field("max_stack_depth", &self.max_stack_depth)
            .field("sampler", &self.sampler)
            .field("callbacks", &self.callbacks.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::DeadlineTimer;
    use crate::sampler::{CallsiteSampler, CallsiteTracker, StackFrame};
    use std::sync::atomic::{AtomicU64, Ordering};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[derive(Debug)]
    struct Fixed(Option<StackTrace>);

    impl StackSampler for Fixed {
        fn capture(&self, _: Option<&LoopThread>, _: usize) -> Option<StackTrace> {
            self.0.clone()
        }
    }

    #[derive(Debug)]
    struct Exploding;

    impl StackSampler for Exploding {
        fn capture(&self, _: Option<&LoopThread>, _: usize) -> Option<StackTrace> {
            std::panic::resume_unwind(Box::new("sampler failure"))
        }
    }

    fn handler_with(sampler: Arc<dyn StackSampler>) -> (HangHandler, Arc<HangRegistry>) {
        let registry = Arc::new(HangRegistry::new());
        let handler = HangHandler::new(
            Duration::from_secs(10),
            16,
            sampler,
            Arc::clone(&registry),
            Arc::new(LoopActivity::new()),
            Arc::new(RwLock::new(Vec::new())),
        );
        (handler, registry)
    }

    #[test]
    fn test_hangs_at_same_location_accumulate() -> TestResult {
        let timer = DeadlineTimer::spawn("handler-test", |_: &DeadlineHandle| {})?;
        let stack = StackTrace::new(vec![
            StackFrame::new("crunch", "src/work.rs", 12),
            StackFrame::new("main_loop", "src/main.rs", 3),
        ]);
        let (handler, registry) = handler_with(Arc::new(Fixed(Some(stack))));

        for _ in 0..3 {
            handler.on_deadline(timer.handle());
        }

        let stats = registry.snapshot();
        assert_eq!(stats.hang_count, 3);
        assert_eq!(
            stats.count_for(&CodeLocation::new("crunch", "src/work.rs", 12)),
            3
        );
        assert_eq!(stats.bad_functions.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rearms_exactly_once_per_hang() -> TestResult {
        let timer = DeadlineTimer::spawn("handler-rearm", |_: &DeadlineHandle| {})?;
        let (handler, _registry) = handler_with(Arc::new(Fixed(None)));

        handler.on_deadline(timer.handle());
        assert!(timer.handle().is_pending());
        assert_eq!(timer.handle().metrics().arms, 1);

        handler.on_deadline(timer.handle());
        assert_eq!(timer.handle().metrics().arms, 2);
        Ok(())
    }

    #[test]
    fn test_capture_failure_uses_sentinel() -> TestResult {
        let timer = DeadlineTimer::spawn("handler-sentinel", |_: &DeadlineHandle| {})?;

        let (handler, registry) = handler_with(Arc::new(Fixed(None)));
        handler.on_deadline(timer.handle());
        assert_eq!(registry.snapshot().count_for(&CodeLocation::unknown()), 1);

        let (handler, registry) = handler_with(Arc::new(Exploding));
        handler.on_deadline(timer.handle());
        let stats = registry.snapshot();
        assert_eq!(stats.hang_count, 1);
        assert_eq!(stats.count_for(&CodeLocation::unknown()), 1);
        Ok(())
    }

    #[test]
    fn test_callbacks_receive_report() -> TestResult {
        let timer = DeadlineTimer::spawn("handler-callbacks", |_: &DeadlineHandle| {})?;
        let tracker = Arc::new(CallsiteTracker::new(4));
        let (handler, _registry) =
            handler_with(Arc::new(CallsiteSampler::new(Arc::clone(&tracker))));

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_callback = Arc::clone(&seen);
        handler.callbacks.write().push(Arc::new(|_: &HangReport| {
            std::panic::resume_unwind(Box::new("misbehaving callback"));
        }));
        handler
            .callbacks
            .write()
            .push(Arc::new(move |report: &HangReport| {
                assert_eq!(report.location.function, "decode_frame");
                seen_in_callback.store(report.sequence, Ordering::SeqCst);
            }));

        let _scope = tracker.enter("decode_frame");
        handler.on_deadline(timer.handle());

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(timer.handle().is_pending());
        Ok(())
    }

    #[test]
    fn test_report_display() {
        let report = HangReport {
            sequence: 2,
            location: CodeLocation::new("spin", "src/spin.rs", 9),
            stack: None,
            loop_thread: None,
            stalled_for: None,
        };
        let text = report.to_string();
        assert!(text.starts_with("Hang #2 at spin (src/spin.rs:9)"));
        assert!(text.contains("<stack unavailable>"));
    }
}
