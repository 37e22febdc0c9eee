//! Interfaces of the native allocation tracker that records traces and of the reader that
//! replays them.
//!
//! The tracker is an external collaborator. This package only decides where traces go, when
//! a tracking scope opens and closes, and what is done with the replayed allocation records.

use std::fmt::{self, Debug, Display};
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One frame of a call stack: the function, its source descriptor and the line number.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct StackFrame {
    function: String,
    filename: String,
    lineno: u32,
}

impl StackFrame {
    /// Creates a stack frame.
    #[must_use]
    pub fn new(function: impl Into<String>, filename: impl Into<String>, lineno: u32) -> Self {
        Self {
            function: function.into(),
            filename: filename.into(),
            lineno,
        }
    }

    /// The name of the function executing in this frame.
    #[must_use]
    pub fn function(&self) -> &str {
        &self.function
    }

    /// The source file (or native module) the function belongs to.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The line number within [`filename()`](Self::filename).
    #[must_use]
    pub fn lineno(&self) -> u32 {
        self.lineno
    }
}

impl Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.function, self.filename, self.lineno)
    }
}

/// An ordered call stack, innermost frame first, as handed to leak filters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Stack<'a> {
    frames: &'a [StackFrame],
}

impl<'a> Stack<'a> {
    pub(crate) fn new(frames: &'a [StackFrame]) -> Self {
        Self { frames }
    }

    /// The frames of the stack, innermost first.
    #[must_use]
    pub fn frames(&self) -> &'a [StackFrame] {
        self.frames
    }
}

/// A single allocation (or group of allocations at the same site) replayed from a trace.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct AllocationRecord {
    size: u64,
    thread_id: u64,
    stack_trace: Vec<StackFrame>,

    // Empty if the trace was recorded without native frames.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    hybrid_stack_trace: Vec<StackFrame>,
}

impl AllocationRecord {
    /// Creates a record of `size` bytes allocated by `thread_id` under the given stack.
    #[must_use]
    pub fn new(size: u64, thread_id: u64, stack_trace: Vec<StackFrame>) -> Self {
        Self {
            size,
            thread_id,
            stack_trace,
            hybrid_stack_trace: Vec::new(),
        }
    }

    /// Attaches a stack that interleaves native frames with the regular frames.
    #[must_use]
    pub fn with_hybrid_stack_trace(mut self, hybrid_stack_trace: Vec<StackFrame>) -> Self {
        self.hybrid_stack_trace = hybrid_stack_trace;
        self
    }

    #[cfg(any(test, feature = "test-util"))]
    #[must_use]
    pub(crate) fn with_thread_id(mut self, thread_id: u64) -> Self {
        self.thread_id = thread_id;
        self
    }

    /// Number of bytes attributed to this record.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Identifier of the thread that performed the allocation.
    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// The call stack of the allocation, innermost frame first.
    #[must_use]
    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack_trace
    }

    /// The call stack including native frames.
    ///
    /// Falls back to [`stack_trace()`](Self::stack_trace) if the trace was recorded without
    /// native frames.
    #[must_use]
    pub fn hybrid_stack_trace(&self) -> &[StackFrame] {
        if self.hybrid_stack_trace.is_empty() {
            &self.stack_trace
        } else {
            &self.hybrid_stack_trace
        }
    }

    /// The stack to show to the user, depending on whether native frames were requested.
    #[must_use]
    pub fn stack(&self, native: bool) -> &[StackFrame] {
        if native {
            self.hybrid_stack_trace()
        } else {
            self.stack_trace()
        }
    }
}

/// Summary data the tracker stores alongside the allocation records of a trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TraceMetadata {
    peak_memory: u64,
    total_allocations: u64,
    main_thread_id: u64,
}

impl TraceMetadata {
    /// Creates trace metadata.
    #[must_use]
    pub fn new(peak_memory: u64, total_allocations: u64, main_thread_id: u64) -> Self {
        Self {
            peak_memory,
            total_allocations,
            main_thread_id,
        }
    }

    /// Highest amount of memory in use at any point during the traced run, in bytes.
    #[must_use]
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// Total number of allocations observed during the traced run.
    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    /// Identifier of the thread that invoked the traced test.
    #[must_use]
    pub fn main_thread_id(&self) -> u64 {
        self.main_thread_id
    }
}

/// Which replay of a trace a policy looks at.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum RecordView {
    /// Allocations live at the point of peak memory usage.
    HighWatermark,

    /// Allocations never freed by the end of the run.
    Leaked,
}

/// Flags forwarded to the tracker when a tracking scope is opened.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrackerOptions {
    native_traces: bool,
    trace_allocator_internals: bool,
}

impl TrackerOptions {
    /// Creates tracker options.
    #[must_use]
    pub fn new(native_traces: bool, trace_allocator_internals: bool) -> Self {
        Self {
            native_traces,
            trace_allocator_internals,
        }
    }

    /// Whether native stack frames are captured.
    #[must_use]
    pub fn native_traces(&self) -> bool {
        self.native_traces
    }

    /// Whether allocations made by the allocator's own internal pools are captured.
    #[must_use]
    pub fn trace_allocator_internals(&self) -> bool {
        self.trace_allocator_internals
    }
}

/// The native allocation tracker.
pub trait Tracker: Debug + Send + Sync {
    /// Starts recording every allocation of the process into a trace file at `path`.
    ///
    /// Recording continues until the returned scope is closed or dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace file cannot be created or tracking is already active.
    fn start(&self, path: &Path, options: TrackerOptions) -> io::Result<Box<dyn TrackingScope>>;
}

/// An open recording session of the [`Tracker`].
///
/// Implementations must flush and close the trace when dropped without an explicit
/// [`close()`](Self::close), so that a panicking test still leaves a finalized trace behind.
pub trait TrackingScope: Debug {
    /// Stops recording and finalizes the trace file.
    ///
    /// Once this returns, the trace at the path given to [`Tracker::start()`] is a complete,
    /// independently readable record.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace could not be flushed.
    fn close(&mut self) -> io::Result<()>;
}

/// Opens finished traces for replay.
pub trait TraceReader: Debug + Send + Sync {
    /// Opens the trace at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if no trace exists at `path` (e.g. the test was skipped before any
    /// code ran) or if the file cannot be read.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Trace>>;
}

/// A finished trace, opened for replay.
///
/// Replaying never modifies the trace.
pub trait Trace: Debug {
    /// The run metadata stored in the trace.
    fn metadata(&self) -> TraceMetadata;

    /// Allocations live at the point of peak memory usage.
    ///
    /// If `merge_threads` is set, allocations from all threads are merged into one view.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace cannot be replayed.
    fn high_watermark_records(&self, merge_threads: bool) -> io::Result<Vec<AllocationRecord>>;

    /// Allocations not freed by the end of the run.
    ///
    /// If `merge_threads` is set, allocations from all threads are merged into one view.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace cannot be replayed.
    fn leaked_records(&self, merge_threads: bool) -> io::Result<Vec<AllocationRecord>>;

    /// Replays the given view of the trace.
    ///
    /// If `merge_threads` is set, allocations from all threads are merged into one view.
    /// Otherwise, each record keeps the identifier of the thread that made it.
    ///
    /// # Errors
    ///
    /// Returns an error if the trace cannot be replayed.
    fn records(
        &self,
        view: RecordView,
        merge_threads: bool,
    ) -> io::Result<Vec<AllocationRecord>> {
        match view {
            RecordView::HighWatermark => self.high_watermark_records(merge_threads),
            RecordView::Leaked => self.leaked_records(merge_threads),
        }
    }
}
