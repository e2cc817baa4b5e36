//! User-space stack capture by signalling the loop thread.
//!
//! The deadline thread sends a signal to the loop thread with `tgkill`. The
//! handler walks the interrupted stack with `backtrace::trace_unsynchronized`
//! and stores the raw instruction pointers in a static buffer of atomics.
//! Symbols are resolved afterwards on the deadline thread, outside signal
//! context.
//!
//! The handler never allocates and never locks. Rounds are serialized by
//! [`CAPTURE_ROUND`], so at most one handler walks a stack at a time.

#![expect(
    unsafe_code,
    reason = "signal installation, delivery and the stack walk are FFI"
)]

use parking_lot::Mutex;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{WatchdogError, WatchdogResult};
use crate::sampler::{LoopThread, StackFrame, StackSampler, StackTrace};

/// Upper bound on frames recorded by the signal handler.
pub const MAX_SIGNAL_FRAMES: usize = 128;

/// Signal used by [`SignalStackSampler::install_default`].
pub const DEFAULT_CAPTURE_SIGNAL: i32 = libc::SIGPROF;

/// How long the deadline thread waits for the loop thread to answer.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(50);

const IDLE: libc::pid_t = 0;

/// Leading frames with these prefixes belong to the capture machinery or to
/// the runtime libraries, not to the code that is stuck.
const MACHINERY_PREFIXES: &[&str] = &[
    "backtrace::",
    "reactor_watchdog::signal::on_capture_signal",
    "std::",
    "core::",
    "alloc::",
    "__",
];

struct CaptureBuffer {
    /// Thread expected to answer the current round, `IDLE` otherwise.
    target: AtomicI32,
    ips: [AtomicUsize; MAX_SIGNAL_FRAMES],
    len: AtomicUsize,
    done: AtomicBool,
}

static CAPTURE: CaptureBuffer = CaptureBuffer {
    target: AtomicI32::new(IDLE),
    ips: [const { AtomicUsize::new(0) }; MAX_SIGNAL_FRAMES],
    len: AtomicUsize::new(0),
    done: AtomicBool::new(false),
};

static CAPTURE_ROUND: Mutex<()> = Mutex::new(());

/// Signal the handler is installed for, if any.
static INSTALLED: Mutex<Option<libc::c_int>> = Mutex::new(None);

extern "C" fn on_capture_signal(_signal: libc::c_int) {
    // SAFETY: gettid has no preconditions.
    let tid = unsafe { libc::gettid() };
    // Claiming the round makes stray or late signals a no-op.
    if CAPTURE
        .target
        .compare_exchange(tid, IDLE, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    // SAFETY: __errno_location has no preconditions.
    let errno = unsafe { libc::__errno_location() };
    // SAFETY: errno points to this thread's errno slot.
    let saved_errno = unsafe { *errno };

    let mut depth = 0usize;
    // SAFETY: CAPTURE_ROUND admits one round at a time and only the claimed
    // target thread gets here, so no other trace runs concurrently. The
    // callback only stores into preallocated atomics.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            let Some(slot) = CAPTURE.ips.get(depth) else {
                return false;
            };
            slot.store(frame.ip().addr(), Ordering::Relaxed);
            depth = depth.saturating_add(1);
            true
        });
    }

    CAPTURE.len.store(depth, Ordering::Relaxed);
    CAPTURE.done.store(true, Ordering::Release);

    // SAFETY: same errno slot as above.
    unsafe { *errno = saved_errno };
}

fn install_handler(signal: libc::c_int) -> WatchdogResult<()> {
    // SAFETY: an all-zero sigaction is a valid "no flags, empty mask" value.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction =
        on_capture_signal as extern "C" fn(libc::c_int) as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;

    // SAFETY: `action` is fully initialized and the handler is async-signal
    // safe for our purposes (no allocation, no locks).
    let rc = unsafe { libc::sigaction(signal, &action, ptr::null_mut()) };
    if rc != 0 {
        return Err(WatchdogError::sampler_unavailable(format!(
            "sigaction({signal}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Captures the loop thread's user-space stack by interrupting it with a
/// signal.
///
/// This names the stuck code without any instrumentation in the loop.
/// The signal's handler is process-wide: installing claims the signal for
/// the whole process, and only one capture signal can be installed.
#[derive(Debug, Clone, Copy)]
pub struct SignalStackSampler {
    signal: libc::c_int,
    reply_timeout: Duration,
}

impl SignalStackSampler {
    /// Install the handler for [`DEFAULT_CAPTURE_SIGNAL`].
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be installed or another capture
    /// signal is already installed.
    pub fn install_default() -> WatchdogResult<Self> {
        Self::install(DEFAULT_CAPTURE_SIGNAL)
    }

    /// Install the capture handler for `signal`. Installing the same signal
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the handler cannot be installed or a different
    /// capture signal is already installed.
    pub fn install(signal: i32) -> WatchdogResult<Self> {
        let mut installed = INSTALLED.lock();
        match *installed {
            Some(current) if current == signal => {}
            Some(current) => {
                return Err(WatchdogError::invalid_configuration(format!(
                    "capture signal {current} is already installed, cannot use {signal}"
                )));
            }
            None => {
                install_handler(signal)?;
                *installed = Some(signal);
                tracing::debug!(signal, "Installed stack capture signal handler");
            }
        }

        Ok(Self {
            signal,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    /// Set how long to wait for the loop thread to answer.
    #[must_use]
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// The signal used to interrupt the loop thread.
    #[must_use]
    pub fn signal(&self) -> i32 {
        self.signal
    }

    fn collect(&self, tid: libc::pid_t) -> Option<Vec<usize>> {
        let _round = CAPTURE_ROUND.lock();
        let pid = libc::pid_t::try_from(std::process::id()).ok()?;

        CAPTURE.len.store(0, Ordering::Relaxed);
        CAPTURE.done.store(false, Ordering::Relaxed);
        CAPTURE.target.store(tid, Ordering::Release);

        // SAFETY: tgkill only delivers a signal whose handler is installed.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, self.signal) };
        if rc != 0 {
            CAPTURE.target.store(IDLE, Ordering::Release);
            tracing::debug!(
                tid,
                error = %std::io::Error::last_os_error(),
                "Could not signal loop thread"
            );
            return None;
        }

        let started = Instant::now();
        while !CAPTURE.done.load(Ordering::Acquire) {
            if started.elapsed() >= self.reply_timeout {
                // Unclaimed rounds stay unclaimed; a claimed one may still
                // finish but its result is dropped.
                let _unclaimed = CAPTURE.target.compare_exchange(
                    tid,
                    IDLE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                tracing::debug!(tid, "Loop thread did not answer the capture signal");
                return None;
            }
            thread::sleep(Duration::from_micros(50));
        }

        let len = CAPTURE.len.load(Ordering::Relaxed);
        Some(
            CAPTURE
                .ips
                .iter()
                .take(len)
                .map(|ip| ip.load(Ordering::Relaxed))
                .collect(),
        )
    }
}

impl StackSampler for SignalStackSampler {
    fn capture(&self, target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace> {
        let tid = libc::pid_t::try_from(target?.os_tid?).ok()?;
        let ips = self.collect(tid)?;
        let trace = resolve_frames(&ips, max_depth);
        (!trace.is_empty()).then_some(trace)
    }
}

/// Resolve instruction pointers, innermost first, dropping the leading
/// signal-delivery and runtime-library frames.
fn resolve_frames(ips: &[usize], max_depth: usize) -> StackTrace {
    let mut frames = Vec::new();
    for &ip in ips {
        backtrace::resolve(ptr::without_provenance_mut::<c_void>(ip), |symbol| {
            frames.push(StackFrame {
                function: symbol
                    .name()
                    .map_or_else(|| format!("{ip:#x}"), |name| format!("{name:#}")),
                file: symbol
                    .filename()
                    .map(|path| path.to_string_lossy().into_owned()),
                line: symbol.lineno(),
            });
        });
    }

    let first_user_frame = frames
        .iter()
        .position(|frame| !is_machinery(frame))
        .unwrap_or(frames.len());
    StackTrace::new(
        frames
            .into_iter()
            .skip(first_user_frame)
            .take(max_depth)
            .collect(),
    )
}

fn is_machinery(frame: &StackFrame) -> bool {
    let name = frame.function.as_str();
    if name.starts_with("0x") {
        return true;
    }
    let name = name.strip_prefix('<').unwrap_or(name);
    if MACHINERY_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return true;
    }
    // C library symbols: no source file and no Rust path.
    frame.file.is_none() && !name.contains("::")
}
