//! In-process stand-ins for the native allocation tracker, its trace reader and the host
//! terminal, for testing code that uses this package without a native tracker.
//!
//! Available when the `test-util` Cargo feature is enabled.
//!
//! The [`FakeTracker`] records nothing by itself. Tests report their allocations to it
//! explicitly while a tracking scope is open, and the scope writes them to a JSON trace file
//! when closed. The [`FakeTraceReader`] replays such files.
//!
//! # Example
//!
//! ```
//! use alloc_limits::fake::{FakeTraceReader, FakeTracker};
//! use alloc_limits::{
//!     AllocationRecord, StackFrame, Trace, TraceReader, Tracker, TrackerOptions, TrackingScope,
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("trace.bin");
//! let tracker = FakeTracker::new();
//!
//! let mut scope = tracker.start(&path, TrackerOptions::default()).unwrap();
//! tracker.allocate(AllocationRecord::new(
//!     1024,
//!     FakeTracker::MAIN_THREAD_ID,
//!     vec![StackFrame::new("fill", "src/lib.rs", 7)],
//! ));
//! scope.close().unwrap();
//!
//! let trace = FakeTraceReader::new().open(&path).unwrap();
//! assert_eq!(trace.metadata().peak_memory(), 1024);
//! ```

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::ERR_POISONED_LOCK;
use crate::host::separator_line;
use crate::{
    AllocationRecord, TerminalWriter, Trace, TraceMetadata, TraceReader, Tracker, TrackerOptions,
    TrackingScope,
};

/// The contents of a fake trace file.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct FakeTraceFile {
    metadata: TraceMetadata,
    high_watermark: Vec<AllocationRecord>,
    leaked: Vec<AllocationRecord>,
}

impl FakeTraceFile {
    /// The thread identifier that records carry when replayed with threads merged.
    pub const MERGED_THREAD_ID: u64 = 0;

    /// Creates a trace with the given metadata and no allocation records.
    #[must_use]
    pub fn new(metadata: TraceMetadata) -> Self {
        Self {
            metadata,
            high_watermark: Vec::new(),
            leaked: Vec::new(),
        }
    }

    /// Sets the allocations live at peak memory usage.
    #[must_use]
    pub fn with_high_watermark(mut self, records: Vec<AllocationRecord>) -> Self {
        self.high_watermark = records;
        self
    }

    /// Sets the allocations never freed.
    #[must_use]
    pub fn with_leaked(mut self, records: Vec<AllocationRecord>) -> Self {
        self.leaked = records;
        self
    }

    /// Writes the trace to `path`, replacing any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()
    }
}

impl Trace for FakeTraceFile {
    fn metadata(&self) -> TraceMetadata {
        self.metadata
    }

    fn high_watermark_records(&self, merge_threads: bool) -> io::Result<Vec<AllocationRecord>> {
        Ok(replay(&self.high_watermark, merge_threads))
    }

    fn leaked_records(&self, merge_threads: bool) -> io::Result<Vec<AllocationRecord>> {
        Ok(replay(&self.leaked, merge_threads))
    }
}

fn replay(records: &[AllocationRecord], merge_threads: bool) -> Vec<AllocationRecord> {
    if merge_threads {
        records
            .iter()
            .map(|record| record.clone().with_thread_id(FakeTraceFile::MERGED_THREAD_ID))
            .collect()
    } else {
        records.to_vec()
    }
}

/// Replays trace files written by [`FakeTracker`] or [`FakeTraceFile::write_to()`].
#[derive(Debug, Default)]
pub struct FakeTraceReader {
    _private: (),
}

impl FakeTraceReader {
    /// Creates a reader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TraceReader for FakeTraceReader {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Trace>> {
        let bytes = fs::read(path)?;
        let file: FakeTraceFile = serde_json::from_slice(&bytes)?;
        Ok(Box::new(file))
    }
}

/// A tracker that writes the allocations reported to it into JSON trace files.
///
/// Clones share the same state, so a test can keep a clone to report allocations to while a
/// session owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeTracker {
    state: Arc<Mutex<TrackerState>>,
}

#[derive(Debug, Default)]
struct TrackerState {
    recording: Option<Recording>,
    sessions_started: usize,
    last_options: Option<TrackerOptions>,
    skip_traces: bool,
}

#[derive(Debug)]
struct Recording {
    path: PathBuf,
    high_watermark: Vec<AllocationRecord>,
    leaked: Vec<AllocationRecord>,
}

impl FakeTracker {
    /// The thread identifier reported as the one that ran the test.
    pub const MAIN_THREAD_ID: u64 = 1;

    /// Creates a tracker that writes a trace for every tracking scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker whose scopes never produce a trace file, as happens when a test is
    /// skipped before any of its code runs.
    #[must_use]
    pub fn without_traces() -> Self {
        let tracker = Self::new();
        tracker.state().skip_traces = true;
        tracker
    }

    /// Reports an allocation that is live at peak memory usage and freed afterwards.
    ///
    /// Ignored if no tracking scope is open.
    pub fn allocate(&self, record: AllocationRecord) {
        if let Some(recording) = self.state().recording.as_mut() {
            recording.high_watermark.push(record);
        }
    }

    /// Reports an allocation that is live at peak memory usage and never freed.
    ///
    /// Ignored if no tracking scope is open.
    pub fn leak(&self, record: AllocationRecord) {
        if let Some(recording) = self.state().recording.as_mut() {
            recording.high_watermark.push(record.clone());
            recording.leaked.push(record);
        }
    }

    /// How many tracking scopes have been started.
    #[must_use]
    pub fn sessions_started(&self) -> usize {
        self.state().sessions_started
    }

    /// The options passed to the most recently started scope.
    #[must_use]
    pub fn last_options(&self) -> Option<TrackerOptions> {
        self.state().last_options
    }

    /// Whether a tracking scope is currently open.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state().recording.is_some()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().expect(ERR_POISONED_LOCK)
    }
}

impl Tracker for FakeTracker {
    fn start(&self, path: &Path, options: TrackerOptions) -> io::Result<Box<dyn TrackingScope>> {
        let mut state = self.state();

        if state.recording.is_some() {
            return Err(io::Error::other("tracking is already active"));
        }

        state.recording = Some(Recording {
            path: path.to_path_buf(),
            high_watermark: Vec::new(),
            leaked: Vec::new(),
        });
        state.sessions_started = state.sessions_started.saturating_add(1);
        state.last_options = Some(options);

        Ok(Box::new(FakeTrackingScope {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct FakeTrackingScope {
    state: Arc<Mutex<TrackerState>>,
    closed: bool,
}

impl TrackingScope for FakeTrackingScope {
    fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;

        let mut state = self.state.lock().expect(ERR_POISONED_LOCK);

        let Some(recording) = state.recording.take() else {
            return Ok(());
        };

        if state.skip_traces {
            return Ok(());
        }

        let peak_memory = recording
            .high_watermark
            .iter()
            .fold(0_u64, |sum, record| sum.saturating_add(record.size()));
        let total_allocations = u64::try_from(recording.high_watermark.len()).unwrap_or(u64::MAX);

        FakeTraceFile::new(TraceMetadata::new(
            peak_memory,
            total_allocations,
            FakeTracker::MAIN_THREAD_ID,
        ))
        .with_high_watermark(recording.high_watermark)
        .with_leaked(recording.leaked)
        .write_to(&recording.path)
    }
}

impl Drop for FakeTrackingScope {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "fake tracking scope failed to write trace");
        }
    }
}

/// A terminal that keeps every line written to it.
#[derive(Debug, Default)]
pub struct RecordingTerminal {
    lines: Vec<String>,
}

impl RecordingTerminal {
    /// Creates an empty terminal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line written so far, in order.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether a line equal to `line` was written.
    #[must_use]
    pub fn contains_line(&self, line: &str) -> bool {
        self.lines.iter().any(|l| l == line)
    }

    /// Whether any line contains `text`.
    #[must_use]
    pub fn contains(&self, text: &str) -> bool {
        self.lines.iter().any(|l| l.contains(text))
    }

    /// How many lines start with `prefix`.
    #[must_use]
    pub fn count_lines_starting_with(&self, prefix: &str) -> usize {
        self.lines.iter().filter(|l| l.starts_with(prefix)).count()
    }
}

impl TerminalWriter for RecordingTerminal {
    fn write_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn write_separator(&mut self, sep: char, title: &str) {
        self.lines.push(separator_line(sep, title));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{RecordView, StackFrame};

    fn record(size: u64) -> AllocationRecord {
        AllocationRecord::new(
            size,
            FakeTracker::MAIN_THREAD_ID,
            vec![StackFrame::new("f", "src/lib.rs", 1)],
        )
    }

    #[test]
    fn scope_writes_reported_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        let tracker = FakeTracker::new();

        let mut scope = tracker
            .start(&path, TrackerOptions::new(true, false))
            .unwrap();
        tracker.allocate(record(100));
        tracker.leak(record(50));
        scope.close().unwrap();

        let trace = FakeTraceReader::new().open(&path).unwrap();
        assert_eq!(trace.metadata().peak_memory(), 150);
        assert_eq!(trace.metadata().total_allocations(), 2);
        assert_eq!(trace.high_watermark_records(true).unwrap().len(), 2);
        assert_eq!(trace.leaked_records(false).unwrap(), [record(50)]);
        assert_eq!(tracker.last_options(), Some(TrackerOptions::new(true, false)));
    }

    #[test]
    fn merged_view_hides_thread_identity() {
        let trace = FakeTraceFile::new(TraceMetadata::new(100, 1, FakeTracker::MAIN_THREAD_ID))
            .with_high_watermark(vec![record(100)]);

        let merged = trace.records(RecordView::HighWatermark, true).unwrap();
        let per_thread = trace.records(RecordView::HighWatermark, false).unwrap();

        assert_eq!(merged[0].thread_id(), FakeTraceFile::MERGED_THREAD_ID);
        assert_eq!(merged[0].size(), 100);
        assert_eq!(per_thread, [record(100)]);
    }

    #[test]
    fn allocations_outside_scope_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        let tracker = FakeTracker::new();

        tracker.allocate(record(100));
        let scope = tracker.start(&path, TrackerOptions::default()).unwrap();
        assert!(tracker.is_recording());
        drop(scope);

        assert!(!tracker.is_recording());
        let trace = FakeTraceReader::new().open(&path).unwrap();
        assert_eq!(trace.metadata().peak_memory(), 0);
    }

    #[test]
    fn overlapping_scopes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FakeTracker::new();

        let _scope = tracker
            .start(&dir.path().join("a.bin"), TrackerOptions::default())
            .unwrap();

        tracker
            .start(&dir.path().join("b.bin"), TrackerOptions::default())
            .unwrap_err();
        assert_eq!(tracker.sessions_started(), 1);
    }

    #[test]
    fn tracker_without_traces_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.bin");
        let tracker = FakeTracker::without_traces();

        let mut scope = tracker.start(&path, TrackerOptions::default()).unwrap();
        scope.close().unwrap();

        assert!(!path.exists());
        FakeTraceReader::new().open(&path).unwrap_err();
    }

    #[test]
    fn terminal_records_lines() {
        let mut terminal = RecordingTerminal::new();

        terminal.write_line("hello");
        terminal.write_separator('=', "TITLE");

        assert!(terminal.contains_line("hello"));
        assert!(terminal.contains("TITLE"));
        assert_eq!(terminal.count_lines_starting_with("="), 1);
    }
}
