#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Per-test memory instrumentation for test harnesses.
//!
//! Each instrumented test runs inside a tracking scope of a native allocation tracker, which
//! records every allocation into a trace file. Once the test has passed, the trace is replayed
//! to enforce the memory policy attached to the test, and at the end of the run the tests with
//! the highest peak memory are summarized.
//!
//! # Memory policies
//!
//! A test carries at most one policy marker:
//!
//! * [`LimitMemory`] fails the test if the memory live at its peak reaches the limit. With a
//!   [`BaselineCache`], it can also fail the test if it uses more memory than it did last time.
//! * [`LimitLeaks`] fails the test if any single allocation location leaked at least the limit.
//!
//! Sizes are written as a number followed by a unit, such as `512B`, `1.5MB` or `2 GB`.
//! Units are binary: `1KB` is 1024 bytes.
//!
//! ```
//! use alloc_limits::{
//!     AllocationRecord, EvaluationContext, LimitMemory, PolicyMarker, StackFrame,
//! };
//!
//! let marker = PolicyMarker::from(LimitMemory::new("4KB")?);
//!
//! let records = vec![AllocationRecord::new(
//!     8192,
//!     1,
//!     vec![StackFrame::new("load_fixture", "tests/fixtures.rs", 40)],
//! )];
//!
//! let outcome = marker.evaluate(&records, &mut EvaluationContext::new("tests::load", 1));
//!
//! assert_eq!(
//!     outcome.failure().map(|failure| failure.summary()),
//!     Some("Test was limited to 4.0KiB but allocated 8.0KiB")
//! );
//! # Ok::<(), alloc_limits::Error>(())
//! ```
//!
//! # Integrating with a test harness
//!
//! A harness creates one [`Session`] per test run, configured from a [`Config`], and calls it
//! from its hooks. The session only needs two capabilities from the outside world: a
//! [`Tracker`] that records traces and a [`TraceReader`] that replays them.
//!
//! When tests are spread over several worker processes, every process creates its own session.
//! Sessions of one run find each other through a shared trace root: either the configured
//! output directory or a temporary directory whose location the first session publishes to
//! processes started after it. The session that writes the summary collects the results of
//! all processes from there.
//!
//! # Test support
//!
//! The `test-util` feature exposes the [`fake`] module with in-process fakes of the tracker,
//! the trace reader and the terminal.

mod cache;
mod config;
mod constants;
mod error;
mod function;
mod host;
mod pal;
mod policy;
mod render;
mod results;
mod session;
mod size;
mod storage;
mod summary;
mod trace;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use function::*;
pub use host::*;
pub use policy::*;
pub use results::ResultPointer;
pub use session::*;
pub use size::{format_size, parse_memory_size};
pub use trace::*;
