//! Stack capture for hang reports.
//!
//! The hang handler runs on the deadline thread, not on the stuck loop, so it
//! cannot simply walk its own stack. A [`StackSampler`] describes the loop
//! thread from the outside instead:
//!
//! - [`CallsiteSampler`] reads scopes the loop marked with
//!   [`CallsiteTracker::enter`]. Marking is a push onto a preallocated vector;
//!   the sampler only ever uses `try_lock`, so it can never wait on the loop.
//! - [`ProcStackSampler`] reads the loop thread's kernel stack from procfs
//!   (Linux only, usually needs elevated privileges), falling back to `wchan`.
//!   A thread that is running has no useful kernel stack and is skipped.
//! - `SignalStackSampler` (Linux, in the `signal` module) interrupts the loop
//!   thread and walks its user-space stack, so uninstrumented code is named.
//!
//! Samplers compose as tuples: `(CallsiteSampler, ProcStackSampler)` tries
//! the callsites first and the kernel stack second.

use parking_lot::Mutex;
use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crate::stats::CodeLocation;

/// One captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Function or scope name.
    pub function: String,
    /// Source file, if known.
    pub file: Option<String>,
    /// Line number, if known.
    pub line: Option<u32>,
}

impl StackFrame {
    /// Create a frame with full source information.
    #[must_use]
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            file: Some(file.into()),
            line: Some(line),
        }
    }

    /// Create a frame that only has a symbol name.
    #[must_use]
    pub fn symbol(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            file: None,
            line: None,
        }
    }

    /// Aggregation key for this frame.
    #[must_use]
    pub fn location(&self) -> CodeLocation {
        CodeLocation::new(
            self.function.clone(),
            self.file.as_deref().unwrap_or(CodeLocation::UNKNOWN),
            self.line.unwrap_or(0),
        )
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{} at {file}:{line}", self.function),
            (Some(file), None) => write!(f, "{} at {file}", self.function),
            _ => write!(f, "{}", self.function),
        }
    }
}

/// Captured call stack, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    frames: Vec<StackFrame>,
}

impl StackTrace {
    /// Create a trace from frames ordered innermost first.
    #[must_use]
    pub fn new(frames: Vec<StackFrame>) -> Self {
        Self { frames }
    }

    /// All frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// The frame the loop was executing when captured.
    #[must_use]
    pub fn innermost(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Aggregation key of the innermost frame, or the sentinel when empty.
    #[must_use]
    pub fn location(&self) -> CodeLocation {
        self.innermost()
            .map_or_else(CodeLocation::unknown, StackFrame::location)
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the trace has no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return writeln!(f, "  <no frames captured>");
        }
        for (depth, frame) in self.frames.iter().enumerate() {
            writeln!(f, "  #{depth} {frame}")?;
        }
        Ok(())
    }
}

/// Identity of the thread the monitored loop runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopThread {
    /// Thread name, if the thread was named.
    pub name: Option<String>,
    /// Kernel thread id (Linux only).
    pub os_tid: Option<u32>,
}

impl LoopThread {
    /// Describe the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            name: thread::current().name().map(str::to_owned),
            os_tid: current_os_tid(),
        }
    }
}

impl fmt::Display for LoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name.as_deref().unwrap_or("<unnamed>");
        match self.os_tid {
            Some(tid) => write!(f, "{name} (tid {tid})"),
            None => write!(f, "{name}"),
        }
    }
}

/// `/proc/thread-self` links to `/proc/<pid>/task/<tid>`.
fn current_os_tid() -> Option<u32> {
    let link = std::fs::read_link("/proc/thread-self").ok()?;
    link.file_name()?.to_str()?.parse().ok()
}

/// Captures the stack of the monitored loop thread.
///
/// Implementations run on the deadline thread while the loop is presumed
/// stuck. They must not block on anything the loop might hold, and should
/// return `None` rather than fail when nothing can be captured.
pub trait StackSampler: Send + Sync + fmt::Debug {
    /// Capture at most `max_depth` frames of `target`, innermost first.
    ///
    /// `target` is `None` until the liveness probe has run at least once.
    fn capture(&self, target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace>;
}

impl<S: StackSampler + ?Sized> StackSampler for Arc<S> {
    fn capture(&self, target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace> {
        (**self).capture(target, max_depth)
    }
}

impl<A: StackSampler, B: StackSampler> StackSampler for (A, B) {
    fn capture(&self, target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace> {
        self.0
            .capture(target, max_depth)
            .or_else(|| self.1.capture(target, max_depth))
    }
}

#[derive(Debug, Clone, Copy)]
struct Callsite {
    name: &'static str,
    location: &'static Location<'static>,
}

/// Stack of named scopes entered by the monitored loop.
///
/// Intended for a single loop thread: scopes from several threads would
/// interleave in one stack.
#[derive(Debug)]
pub struct CallsiteTracker {
    scopes: Mutex<Vec<Callsite>>,
    max_depth: usize,
    overflowed: AtomicU64,
}

impl CallsiteTracker {
    /// Create a tracker holding at most `max_depth` nested scopes.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            scopes: Mutex::new(Vec::with_capacity(max_depth)),
            max_depth,
            overflowed: AtomicU64::new(0),
        }
    }

    /// Mark the caller's location as the innermost active scope until the
    /// returned guard is dropped.
    ///
    /// Scopes beyond the depth limit are not recorded.
    #[track_caller]
    #[must_use = "the scope ends when the guard is dropped"]
    pub fn enter(self: &Arc<Self>, name: &'static str) -> CallsiteGuard {
        let callsite = Callsite {
            name,
            location: Location::caller(),
        };

        let index = {
            let mut scopes = self.scopes.lock();
            if scopes.len() < self.max_depth {
                scopes.push(callsite);
                scopes.len().checked_sub(1)
            } else {
                None
            }
        };
        if index.is_none() {
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }

        CallsiteGuard {
            tracker: Arc::clone(self),
            index,
        }
    }

    /// Number of scopes currently active.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Number of scopes that were not recorded because the stack was full.
    #[must_use]
    pub fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn snapshot(&self, max_depth: usize) -> Option<StackTrace> {
        let scopes = self.scopes.try_lock()?;
        if scopes.is_empty() {
            return None;
        }
        let frames = scopes
            .iter()
            .rev()
            .take(max_depth)
            .map(|callsite| {
                StackFrame::new(
                    callsite.name,
                    callsite.location.file(),
                    callsite.location.line(),
                )
            })
            .collect();
        Some(StackTrace::new(frames))
    }
}

/// Active scope marker returned by [`CallsiteTracker::enter`].
#[derive(Debug)]
pub struct CallsiteGuard {
    tracker: Arc<CallsiteTracker>,
    index: Option<usize>,
}

impl Drop for CallsiteGuard {
    fn drop(&mut self) {
        if let Some(index) = self.index {
            self.tracker.scopes.lock().truncate(index);
        }
    }
}

/// Samples the scopes recorded in a [`CallsiteTracker`].
#[derive(Debug, Clone)]
pub struct CallsiteSampler {
    tracker: Arc<CallsiteTracker>,
}

impl CallsiteSampler {
    /// Create a sampler over `tracker`.
    #[must_use]
    pub fn new(tracker: Arc<CallsiteTracker>) -> Self {
        Self { tracker }
    }
}

impl StackSampler for CallsiteSampler {
    fn capture(&self, _target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace> {
        self.tracker.snapshot(max_depth)
    }
}

/// Samples the loop thread's kernel stack from `/proc/self/task/<tid>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcStackSampler;

impl ProcStackSampler {
    /// Source unit reported for kernel frames.
    pub const KERNEL_FILE: &'static str = "[kernel]";
}

impl StackSampler for ProcStackSampler {
    fn capture(&self, target: Option<&LoopThread>, max_depth: usize) -> Option<StackTrace> {
        let tid = target?.os_tid?;
        let task = format!("/proc/self/task/{tid}");
        let task = Path::new(&task);

        // A running thread is executing user code; its kernel stack would
        // only show the interrupt return path.
        let stat = std::fs::read_to_string(task.join("stat")).ok()?;
        if parse_task_state(&stat)? == 'R' {
            return None;
        }

        std::fs::read_to_string(task.join("stack"))
            .ok()
            .map(|text| parse_kernel_stack(&text, max_depth))
            .filter(|trace| !trace.is_empty())
            .or_else(|| {
                let wchan = std::fs::read_to_string(task.join("wchan")).ok()?;
                parse_wchan(&wchan)
            })
    }
}

/// Scheduler state from `/proc/<pid>/task/<tid>/stat`. The command name may
/// contain spaces and parentheses, so the state follows the last `)`.
fn parse_task_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Parse `/proc/<pid>/task/<tid>/stack` lines such as
/// `[<0>] do_sys_poll+0x3d0/0x560`.
fn parse_kernel_stack(text: &str, max_depth: usize) -> StackTrace {
    let frames = text
        .lines()
        .filter_map(|line| {
            let symbol = line.split_once("] ").map_or(line, |(_, rest)| rest).trim();
            let name = symbol.split_once('+').map_or(symbol, |(name, _)| name);
            (!name.is_empty()).then(|| StackFrame {
                function: name.to_string(),
                file: Some(ProcStackSampler::KERNEL_FILE.to_string()),
                line: None,
            })
        })
        .take(max_depth)
        .collect();
    StackTrace::new(frames)
}

fn parse_wchan(text: &str) -> Option<StackTrace> {
    let name = text.trim();
    if name.is_empty() || name == "0" {
        return None;
    }
    Some(StackTrace::new(vec![StackFrame {
        function: name.to_string(),
        file: Some(ProcStackSampler::KERNEL_FILE.to_string()),
        line: None,
    }]))
}
