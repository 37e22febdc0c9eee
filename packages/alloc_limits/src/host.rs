//! The surface through which the host test framework hands tests, reports and its terminal to
//! a [`Session`][1].
//!
//! [1]: crate::Session

use std::fmt;
use std::io::{self, Write};

use crate::{PolicyMarker, TestFunction};

/// A collected test, as seen by the memory instrumentation.
#[derive(Debug)]
pub struct TestItem {
    node_id: String,
    markers: Vec<PolicyMarker>,
    function: TestFunction,
}

impl TestItem {
    /// Creates a test item with the given identity and callable, carrying no policy markers.
    #[must_use]
    pub fn new(node_id: impl Into<String>, function: TestFunction) -> Self {
        Self {
            node_id: node_id.into(),
            markers: Vec::new(),
            function,
        }
    }

    /// Attaches a memory policy marker to the test.
    ///
    /// Only one marker per test is valid. Attaching more is allowed here but fails the test
    /// with a configuration error once it is reported on.
    #[must_use]
    pub fn with_marker(mut self, marker: impl Into<PolicyMarker>) -> Self {
        self.markers.push(marker.into());
        self
    }

    /// The unique identity of the test within the run.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The memory policy markers attached to the test.
    #[must_use]
    pub fn markers(&self) -> &[PolicyMarker] {
        &self.markers
    }

    /// The callable the host framework invokes to run the test.
    ///
    /// While the call phase of an instrumented test is being dispatched, this is the
    /// instrumented replacement of the test's own callable.
    #[must_use]
    pub fn function(&self) -> &TestFunction {
        &self.function
    }

    pub(crate) fn set_function(&mut self, function: TestFunction) {
        self.function = function;
    }
}

/// The phase of a test that a report describes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Phase {
    /// Fixture setup before the test body runs.
    Setup,

    /// The test body itself.
    Call,

    /// Fixture teardown after the test body ran.
    Teardown,
}

/// The outcome recorded in a report.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Outcome {
    /// The phase completed without failure.
    Passed,

    /// The phase failed.
    Failed,

    /// The test was skipped.
    Skipped,
}

/// A titled block of text attached to a report, shown with the test's failure details.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReportSection {
    key: String,
    body: String,
}

impl ReportSection {
    /// Creates a report section.
    #[must_use]
    pub fn new(key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }

    /// The title of the section.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The text of the section.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }
}

/// The host framework's report of one phase of one test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestReport {
    node_id: String,
    phase: Phase,
    outcome: Outcome,
    long_repr: Option<String>,
    sections: Vec<ReportSection>,
}

impl TestReport {
    /// Creates a report without failure details or sections.
    #[must_use]
    pub fn new(node_id: impl Into<String>, phase: Phase, outcome: Outcome) -> Self {
        Self {
            node_id: node_id.into(),
            phase,
            outcome,
            long_repr: None,
            sections: Vec::new(),
        }
    }

    /// Identity of the test the report describes.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The phase the report describes.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The outcome of the phase.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// The failure details shown to the user, if the phase failed.
    #[must_use]
    pub fn long_repr(&self) -> Option<&str> {
        self.long_repr.as_deref()
    }

    /// The sections attached to the report.
    #[must_use]
    pub fn sections(&self) -> &[ReportSection] {
        &self.sections
    }

    /// Turns the report into a failure with the given details and optional section.
    pub(crate) fn fail(&mut self, long_repr: String, section: Option<ReportSection>) {
        self.outcome = Outcome::Failed;
        self.long_repr = Some(long_repr);
        self.sections.extend(section);
    }
}

/// How the host framework categorizes and displays a report in its progress output.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TestStatus {
    category: &'static str,
    letter: char,
    word: &'static str,
}

impl TestStatus {
    /// The status of a test that failed because it violated its memory policy.
    pub const MEMORY_PROBLEMS: Self = Self {
        category: "failed",
        letter: 'M',
        word: "MEMORY PROBLEMS",
    };

    /// The result category the report is counted under.
    #[must_use]
    pub fn category(&self) -> &'static str {
        self.category
    }

    /// The single letter shown in compact progress output.
    #[must_use]
    pub fn letter(&self) -> char {
        self.letter
    }

    /// The word shown in verbose progress output.
    #[must_use]
    pub fn word(&self) -> &'static str {
        self.word
    }
}

/// The host framework's terminal, to which the end-of-session summary is written.
pub trait TerminalWriter: fmt::Debug {
    /// Writes one line of text.
    fn write_line(&mut self, line: &str);

    /// Writes a separator line made of `sep` characters with `title` in the middle.
    fn write_separator(&mut self, sep: char, title: &str);
}

const SEPARATOR_WIDTH: usize = 80;

/// Writes the summary to the standard output of the process.
#[derive(Debug, Default)]
pub struct StdoutTerminal {
    _private: (),
}

impl StdoutTerminal {
    /// Creates a terminal writing to standard output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

// Trivial forwarder to standard output - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl TerminalWriter for StdoutTerminal {
    fn write_line(&mut self, line: &str) {
        // If standard output is gone there is nobody to tell, so the summary is simply lost.
        drop(writeln!(io::stdout().lock(), "{line}"));
    }

    fn write_separator(&mut self, sep: char, title: &str) {
        let line = separator_line(sep, title);
        self.write_line(&line);
    }
}

/// Formats `title` centered in a line of `sep` characters, the way test runners do.
pub(crate) fn separator_line(sep: char, title: &str) -> String {
    let title_len = title.chars().count().saturating_add(2);
    let fill = SEPARATOR_WIDTH.saturating_sub(title_len);

    #[expect(
        clippy::integer_division,
        reason = "an odd fill puts the extra character on the right"
    )]
    let left = fill / 2;
    let right = fill.saturating_sub(left);

    format!(
        "{} {title} {}",
        sep.to_string().repeat(left),
        sep.to_string().repeat(right)
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(TestItem: Send, Sync);
    static_assertions::assert_impl_all!(TestReport: Send, Sync, Clone);

    #[test]
    fn failing_a_report_attaches_details() {
        let mut report = TestReport::new("test_a", Phase::Call, Outcome::Passed);

        report.fail(
            "too much".to_string(),
            Some(ReportSection::new("alloc-limits-max-memory", "details")),
        );

        assert_eq!(report.outcome(), Outcome::Failed);
        assert_eq!(report.long_repr(), Some("too much"));
        assert_eq!(report.sections().len(), 1);
        assert_eq!(report.sections()[0].key(), "alloc-limits-max-memory");
    }

    #[test]
    fn failing_without_section_keeps_sections_unchanged() {
        let mut report = TestReport::new("test_a", Phase::Call, Outcome::Passed);

        report.fail("bad config".to_string(), None);

        assert!(report.sections().is_empty());
    }

    #[test]
    fn memory_problems_status() {
        let status = TestStatus::MEMORY_PROBLEMS;

        assert_eq!(status.category(), "failed");
        assert_eq!(status.letter(), 'M');
        assert_eq!(status.word(), "MEMORY PROBLEMS");
    }

    #[test]
    fn separator_centers_title() {
        let line = separator_line('=', "REPORT");

        assert_eq!(line.chars().count(), SEPARATOR_WIDTH);
        assert!(line.starts_with("==="));
        assert!(line.contains(" REPORT "));
        assert!(line.ends_with("==="));
    }

    #[test]
    fn separator_survives_long_title() {
        let title = "x".repeat(100);

        let line = separator_line('-', &title);

        assert_eq!(line, format!(" {title} "));
    }
}
