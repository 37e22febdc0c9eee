//! Memory policies that tests declare via markers, and their evaluation against replayed
//! allocation records.
//!
//! Every policy is a variant of the closed [`PolicyMarker`] union. Each variant evaluates a
//! list of [`AllocationRecord`]s into a [`PolicyOutcome`] without touching the trace itself.
//! [`PolicyKind::ALL`] enumerates the variants for hosts that need to register them.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZero;
use std::sync::Arc;

use itertools::Itertools;
use tracing::debug;

use crate::cache::BaselineCache;
use crate::constants::SECTION_KEY_PREFIX;
use crate::render::render_allocations;
use crate::size::{bytes_as_f64, format_size};
use crate::{
    AllocationRecord, Error, RecordView, ReportSection, Result, Stack, StackFrame,
    parse_memory_size,
};

/// Leak reports always show at least this many frames per allocation site, however few
/// frames were requested for other reports.
const MIN_LEAK_STACK_FRAMES: NonZero<usize> = NonZero::new(5).expect("5 is not zero");

const MAX_MEMORY_SECTION: &str = "max-memory";
const LEAKED_MEMORY_SECTION: &str = "leaked-memory";

/// Decides whether a leak at the given allocation site is reported.
///
/// Returning `false` suppresses the site entirely: it neither fails the test nor appears
/// in the report.
pub type LeakFilter = Arc<dyn Fn(&Stack<'_>) -> bool + Send + Sync>;

/// The policies a test can declare, in registration order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum PolicyKind {
    /// Fails the test if the memory it uses at peak reaches a limit.
    LimitMemory,

    /// Fails the test if memory leaked at any single allocation site reaches a limit.
    LimitLeaks,
}

impl PolicyKind {
    /// Every policy, for hosts that register the available markers up front.
    pub const ALL: [Self; 2] = [Self::LimitMemory, Self::LimitLeaks];

    /// The marker name under which the policy is declared.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::LimitMemory => "limit_memory",
            Self::LimitLeaks => "limit_leaks",
        }
    }

    /// The marker's argument names, in declaration order.
    #[must_use]
    pub fn arguments(self) -> &'static [&'static str] {
        match self {
            Self::LimitMemory => &["limit", "current_thread_only"],
            Self::LimitLeaks => &["location_limit", "filter_fn", "current_thread_only"],
        }
    }

    /// A one-sentence description of the policy.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::LimitMemory => "Limit memory used by the test",
            Self::LimitLeaks => "Limit memory leaked by the test",
        }
    }

    /// The help line a host shows for the marker, e.g.
    /// `limit_memory(limit, current_thread_only): Limit memory used by the test`.
    #[must_use]
    pub fn description_line(self) -> String {
        format!(
            "{}({}): {}",
            self.name(),
            self.arguments().join(", "),
            self.description()
        )
    }

    /// The replay of the trace the policy evaluates.
    #[must_use]
    pub fn view(self) -> RecordView {
        match self {
            Self::LimitMemory => RecordView::HighWatermark,
            Self::LimitLeaks => RecordView::Leaked,
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A memory policy declared on a test, together with its configuration.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum PolicyMarker {
    /// See [`LimitMemory`].
    LimitMemory(LimitMemory),

    /// See [`LimitLeaks`].
    LimitLeaks(LimitLeaks),
}

impl PolicyMarker {
    /// Which policy the marker declares.
    #[must_use]
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::LimitMemory(_) => PolicyKind::LimitMemory,
            Self::LimitLeaks(_) => PolicyKind::LimitLeaks,
        }
    }

    /// Whether the records to evaluate should be replayed with all threads merged into one view.
    ///
    /// Policies restricted to the current thread need the per-thread view instead.
    #[must_use]
    pub fn merges_threads(&self) -> bool {
        match self {
            Self::LimitMemory(policy) => !policy.is_current_thread_only(),
            Self::LimitLeaks(policy) => !policy.is_current_thread_only(),
        }
    }

    /// Evaluates the policy against records replayed from the [`view()`](PolicyKind::view)
    /// of the test's trace.
    pub fn evaluate(
        &self,
        records: &[AllocationRecord],
        context: &mut EvaluationContext<'_>,
    ) -> PolicyOutcome {
        match self {
            Self::LimitMemory(policy) => policy.evaluate(records, context),
            Self::LimitLeaks(policy) => policy.evaluate(records, context),
        }
    }

    /// Picks the single marker of a test.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the test carries no marker or more than one.
    /// The error does not depend on the order in which markers were attached.
    pub fn select<'m>(test_id: &str, markers: &'m [Self]) -> Result<&'m Self> {
        match markers {
            [marker] => Ok(marker),
            [] => Err(Error::NoPolicyMarker {
                test_id: test_id.to_string(),
            }),
            _ => Err(Error::MultiplePolicyMarkers {
                test_id: test_id.to_string(),
                markers: markers.iter().map(Self::kind).sorted().join(", "),
            }),
        }
    }
}

impl From<LimitMemory> for PolicyMarker {
    fn from(value: LimitMemory) -> Self {
        Self::LimitMemory(value)
    }
}

impl From<LimitLeaks> for PolicyMarker {
    fn from(value: LimitLeaks) -> Self {
        Self::LimitLeaks(value)
    }
}

/// Fails the test if the allocations live at its point of peak memory usage add up to
/// `limit` or more.
///
/// If regression detection is enabled via [`EvaluationOptions::with_fail_on_increase()`] and a
/// baseline is available, the test also fails if it allocated more than in its previous run.
#[derive(Clone, Debug)]
pub struct LimitMemory {
    limit: f64,
    current_thread_only: bool,
}

impl LimitMemory {
    /// Creates the policy from a human-readable limit such as `"5KB"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMemorySize`] if the limit cannot be parsed.
    pub fn new(limit: &str) -> Result<Self> {
        Ok(Self {
            limit: parse_memory_size(limit)?,
            current_thread_only: false,
        })
    }

    /// Only counts allocations made by the thread that ran the test.
    #[must_use]
    pub fn current_thread_only(mut self) -> Self {
        self.current_thread_only = true;
        self
    }

    /// Whether only allocations of the test's own thread are considered.
    #[must_use]
    pub fn is_current_thread_only(&self) -> bool {
        self.current_thread_only
    }

    /// The limit in bytes.
    #[must_use]
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Evaluates the policy against the high-watermark records of a trace.
    pub fn evaluate(
        &self,
        records: &[AllocationRecord],
        context: &mut EvaluationContext<'_>,
    ) -> PolicyOutcome {
        let selected = select_threads(records, self.current_thread_only, context.main_thread_id);

        let total = selected
            .iter()
            .fold(0_u64, |sum, record| sum.saturating_add(record.size()));

        let options = context.options;
        let test_id = context.test_id;

        if let Some(baseline) = context.baseline.as_deref_mut() {
            let previous = baseline.get(test_id);
            baseline.set(test_id, total);

            debug!(test_id, ?previous, total, "updated memory baseline");

            if let Some(previous) = previous.filter(|&p| options.fail_on_increase && total > p) {
                return PolicyOutcome::Fail(PolicyFailure {
                    summary: format!(
                        "Test previously used {} but now uses {}",
                        format_size(bytes_as_f64(previous)),
                        format_size(bytes_as_f64(total))
                    ),
                    section: section(
                        MAX_MEMORY_SECTION,
                        "Test uses more memory than previous run".to_string(),
                    ),
                    allocations: Vec::new(),
                });
            }
        }

        if bytes_as_f64(total) < self.limit {
            return PolicyOutcome::Pass;
        }

        let allocations = rank(
            selected
                .iter()
                .map(|record| {
                    ReportedAllocation::new(
                        record.size(),
                        record.stack(options.native_stacks).to_vec(),
                    )
                })
                .collect(),
        );

        PolicyOutcome::Fail(PolicyFailure {
            summary: format!(
                "Test was limited to {} but allocated {}",
                format_size(self.limit),
                format_size(bytes_as_f64(total))
            ),
            section: section(
                MAX_MEMORY_SECTION,
                format!(
                    "List of allocations:\n{}",
                    render_allocations(&allocations, options.stacks)
                ),
            ),
            allocations,
        })
    }
}

/// Fails the test if the memory left allocated at the end of its run at any single
/// allocation site reaches `location_limit`.
#[derive(Clone)]
pub struct LimitLeaks {
    location_limit: f64,
    filter: Option<LeakFilter>,
    current_thread_only: bool,
}

impl LimitLeaks {
    /// Creates the policy from a human-readable per-site limit such as `"1KB"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMemorySize`] if the limit cannot be parsed.
    pub fn new(location_limit: &str) -> Result<Self> {
        Ok(Self {
            location_limit: parse_memory_size(location_limit)?,
            filter: None,
            current_thread_only: false,
        })
    }

    /// Only reports leaks at allocation sites for which `filter` returns `true`.
    #[must_use]
    pub fn filter(mut self, filter: impl Fn(&Stack<'_>) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Only considers allocations made by the thread that ran the test.
    #[must_use]
    pub fn current_thread_only(mut self) -> Self {
        self.current_thread_only = true;
        self
    }

    /// Whether only allocations of the test's own thread are considered.
    #[must_use]
    pub fn is_current_thread_only(&self) -> bool {
        self.current_thread_only
    }

    /// The per-site limit in bytes.
    #[must_use]
    pub fn location_limit(&self) -> f64 {
        self.location_limit
    }

    /// Evaluates the policy against the leaked records of a trace.
    pub fn evaluate(
        &self,
        records: &[AllocationRecord],
        context: &mut EvaluationContext<'_>,
    ) -> PolicyOutcome {
        let selected = select_threads(records, self.current_thread_only, context.main_thread_id);
        let native = context.options.native_stacks;

        // Sites in order of first appearance, with their accumulated size.
        let mut sites: Vec<(&[StackFrame], u64)> = Vec::new();
        let mut site_index: HashMap<&[StackFrame], usize> = HashMap::new();

        for record in selected {
            let stack = record.stack(native);

            let index = *site_index.entry(stack).or_insert_with(|| {
                sites.push((stack, 0));
                sites.len().saturating_sub(1)
            });

            if let Some((_, total)) = sites.get_mut(index) {
                *total = total.saturating_add(record.size());
            }
        }

        let violations = sites
            .into_iter()
            .filter(|(_, total)| bytes_as_f64(*total) >= self.location_limit)
            .filter(|(stack, _)| {
                self.filter
                    .as_ref()
                    .is_none_or(|filter| filter(&Stack::new(stack)))
            })
            .map(|(stack, total)| ReportedAllocation::new(total, stack.to_vec()))
            .collect::<Vec<_>>();

        if violations.is_empty() {
            return PolicyOutcome::Pass;
        }

        let allocations = rank(violations);
        let max_frames = context.options.stacks.max(MIN_LEAK_STACK_FRAMES);

        PolicyOutcome::Fail(PolicyFailure {
            summary: format!(
                "Test was allowed to leak {} per location but at least one location leaked more",
                format_size(self.location_limit)
            ),
            section: section(
                LEAKED_MEMORY_SECTION,
                format!(
                    "List of leaked allocations:\n{}",
                    render_allocations(&allocations, max_frames)
                ),
            ),
            allocations,
        })
    }
}

impl fmt::Debug for LimitLeaks {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitLeaks")
            .field("location_limit", &self.location_limit)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("current_thread_only", &self.current_thread_only)
            .finish()
    }
}

/// Report settings that apply to every policy evaluation of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EvaluationOptions {
    stacks: NonZero<usize>,
    native_stacks: bool,
    fail_on_increase: bool,
}

impl EvaluationOptions {
    /// Creates the default options: one stack frame per allocation, no native frames and no
    /// regression detection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stacks: NonZero::<usize>::MIN,
            native_stacks: false,
            fail_on_increase: false,
        }
    }

    /// Sets how many stack frames are shown per reported allocation.
    #[must_use]
    pub fn with_stacks(mut self, stacks: NonZero<usize>) -> Self {
        self.stacks = stacks;
        self
    }

    /// Sets whether reported stacks include native frames.
    #[must_use]
    pub fn with_native_stacks(mut self, native_stacks: bool) -> Self {
        self.native_stacks = native_stacks;
        self
    }

    /// Sets whether the memory ceiling also fails tests that allocate more than in their
    /// previous run.
    #[must_use]
    pub fn with_fail_on_increase(mut self, fail_on_increase: bool) -> Self {
        self.fail_on_increase = fail_on_increase;
        self
    }

    /// How many stack frames are shown per reported allocation.
    #[must_use]
    pub fn stacks(&self) -> NonZero<usize> {
        self.stacks
    }

    /// Whether reported stacks include native frames.
    #[must_use]
    pub fn native_stacks(&self) -> bool {
        self.native_stacks
    }

    /// Whether allocating more than in the previous run fails the test.
    #[must_use]
    pub fn fail_on_increase(&self) -> bool {
        self.fail_on_increase
    }
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a policy needs to know about the test it evaluates, besides the records.
#[derive(Debug)]
pub struct EvaluationContext<'a> {
    test_id: &'a str,
    main_thread_id: u64,
    options: EvaluationOptions,
    baseline: Option<&'a mut dyn BaselineCache>,
}

impl<'a> EvaluationContext<'a> {
    /// Creates a context for the test with the given identity, whose body ran on the thread
    /// with the given identifier.
    #[must_use]
    pub fn new(test_id: &'a str, main_thread_id: u64) -> Self {
        Self {
            test_id,
            main_thread_id,
            options: EvaluationOptions::new(),
            baseline: None,
        }
    }

    /// Sets the report settings.
    #[must_use]
    pub fn with_options(mut self, options: EvaluationOptions) -> Self {
        self.options = options;
        self
    }

    /// Provides the baseline cache that the memory ceiling reads and updates.
    #[must_use]
    pub fn with_baseline(mut self, baseline: &'a mut dyn BaselineCache) -> Self {
        self.baseline = Some(baseline);
        self
    }
}

/// The result of evaluating a policy.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PolicyOutcome {
    /// The test complies with the policy.
    Pass,

    /// The test violates the policy.
    Fail(PolicyFailure),
}

impl PolicyOutcome {
    /// Whether the test complies with the policy.
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// The violation details, if the test violates the policy.
    #[must_use]
    pub fn failure(&self) -> Option<&PolicyFailure> {
        match self {
            Self::Pass => None,
            Self::Fail(failure) => Some(failure),
        }
    }
}

/// How a test violated its policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyFailure {
    summary: String,
    section: ReportSection,
    allocations: Vec<ReportedAllocation>,
}

impl PolicyFailure {
    /// A one-line description of the violation.
    #[must_use]
    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// The detailed report to attach to the test's report.
    #[must_use]
    pub fn section(&self) -> &ReportSection {
        &self.section
    }

    /// The offending allocations or allocation sites, largest first.
    ///
    /// Empty if the violation is not about specific allocations (e.g. a regression).
    #[must_use]
    pub fn allocations(&self) -> &[ReportedAllocation] {
        &self.allocations
    }
}

/// An allocation (or allocation site) named in a policy failure.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReportedAllocation {
    size: u64,
    stack: Vec<StackFrame>,
}

impl ReportedAllocation {
    pub(crate) fn new(size: u64, stack: Vec<StackFrame>) -> Self {
        Self { size, stack }
    }

    /// Bytes attributed to the allocation.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The full stack of the allocation, innermost frame first.
    #[must_use]
    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }
}

fn select_threads(
    records: &[AllocationRecord],
    current_thread_only: bool,
    main_thread_id: u64,
) -> Vec<&AllocationRecord> {
    records
        .iter()
        .filter(|record| !current_thread_only || record.thread_id() == main_thread_id)
        .collect()
}

/// Largest first. Equal sizes keep their original order.
fn rank(mut allocations: Vec<ReportedAllocation>) -> Vec<ReportedAllocation> {
    allocations.sort_by_key(|allocation| Reverse(allocation.size));
    allocations
}

fn section(name: &str, body: String) -> ReportSection {
    ReportSection::new(format!("{SECTION_KEY_PREFIX}-{name}"), body)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(PolicyMarker: Send, Sync, Clone);

    const MAIN_THREAD: u64 = 1;
    const OTHER_THREAD: u64 = 2;

    fn frame(function: &str) -> StackFrame {
        StackFrame::new(function, "src/lib.rs", 10)
    }

    fn record(size: u64, thread_id: u64, functions: &[&str]) -> AllocationRecord {
        AllocationRecord::new(
            size,
            thread_id,
            functions.iter().map(|f| frame(f)).collect(),
        )
    }

    fn evaluate(marker: impl Into<PolicyMarker>, records: &[AllocationRecord]) -> PolicyOutcome {
        let marker: PolicyMarker = marker.into();
        marker.evaluate(records, &mut EvaluationContext::new("test_a", MAIN_THREAD))
    }

    #[test]
    fn kinds_are_registered_in_order() {
        let lines = PolicyKind::ALL.map(PolicyKind::description_line);

        assert_eq!(
            lines,
            [
                "limit_memory(limit, current_thread_only): Limit memory used by the test",
                "limit_leaks(location_limit, filter_fn, current_thread_only): Limit memory leaked by the test",
            ]
        );
        assert_eq!(PolicyKind::LimitMemory.view(), RecordView::HighWatermark);
        assert_eq!(PolicyKind::LimitLeaks.view(), RecordView::Leaked);
    }

    #[test]
    fn invalid_limit_is_a_configuration_error() {
        let error = LimitMemory::new("5 XB").unwrap_err();

        assert!(error.is_configuration_error());
        LimitLeaks::new("-1KB").unwrap_err();
    }

    #[test]
    fn ceiling_limit_is_exclusive() {
        let policy = LimitMemory::new("2KB").unwrap();

        assert!(evaluate(policy.clone(), &[record(2047, MAIN_THREAD, &["f"])]).is_pass());

        let outcome = evaluate(policy, &[record(2048, MAIN_THREAD, &["f"])]);
        let failure = outcome.failure().unwrap();

        assert_eq!(
            failure.summary(),
            "Test was limited to 2.0KiB but allocated 2.0KiB"
        );
        assert_eq!(failure.section().key(), "alloc-limits-max-memory");
        assert_eq!(
            failure.section().body(),
            "List of allocations:\n    - 2.0KiB allocated here:\n        f:src/lib.rs:10"
        );
    }

    #[test]
    fn ceiling_sums_all_records_and_ranks_them() {
        let policy = LimitMemory::new("1KB").unwrap();

        let outcome = evaluate(
            policy,
            &[
                record(100, MAIN_THREAD, &["small"]),
                record(1000, MAIN_THREAD, &["big"]),
            ],
        );

        let sizes = outcome
            .failure()
            .unwrap()
            .allocations()
            .iter()
            .map(ReportedAllocation::size)
            .collect::<Vec<_>>();
        assert_eq!(sizes, [1000, 100]);
    }

    #[test]
    fn ceiling_can_ignore_other_threads() {
        let records = [
            record(1024, MAIN_THREAD, &["mine"]),
            record(4096, OTHER_THREAD, &["theirs"]),
        ];

        assert!(!evaluate(LimitMemory::new("2KB").unwrap(), &records).is_pass());
        assert!(
            evaluate(
                LimitMemory::new("2KB").unwrap().current_thread_only(),
                &records
            )
            .is_pass()
        );
    }

    #[test]
    fn ceiling_report_respects_stack_depth() {
        let policy = PolicyMarker::from(LimitMemory::new("1B").unwrap());
        let records = [record(10, MAIN_THREAD, &["a", "b", "c"])];

        let outcome = policy.evaluate(
            &records,
            &mut EvaluationContext::new("test_a", MAIN_THREAD).with_options(
                EvaluationOptions::new().with_stacks(NonZero::new(2).unwrap()),
            ),
        );

        let body = outcome.failure().unwrap().section().body().to_string();
        assert!(body.contains("a:src/lib.rs:10"));
        assert!(body.contains("b:src/lib.rs:10"));
        assert!(!body.contains("c:src/lib.rs:10"));
        assert!(body.ends_with("        ..."));
    }

    #[test]
    fn ceiling_uses_native_stack_when_requested() {
        let policy = PolicyMarker::from(LimitMemory::new("1B").unwrap());
        let records = [record(10, MAIN_THREAD, &["a"])
            .with_hybrid_stack_trace(vec![frame("malloc"), frame("a")])];

        let outcome = policy.evaluate(
            &records,
            &mut EvaluationContext::new("test_a", MAIN_THREAD)
                .with_options(EvaluationOptions::new().with_native_stacks(true)),
        );

        assert_eq!(
            outcome.failure().unwrap().allocations()[0].stack()[0].function(),
            "malloc"
        );
    }

    #[test]
    fn regression_fails_when_usage_increases() {
        let mut baseline = HashMap::from([("test_a".to_string(), 1024_u64)]);
        let policy = LimitMemory::new("1MB").unwrap();

        let outcome = policy.evaluate(
            &[record(10240, MAIN_THREAD, &["f"])],
            &mut EvaluationContext::new("test_a", MAIN_THREAD)
                .with_options(EvaluationOptions::new().with_fail_on_increase(true))
                .with_baseline(&mut baseline),
        );

        let failure = outcome.failure().unwrap();
        assert_eq!(
            failure.summary(),
            "Test previously used 1.0KiB but now uses 10.0KiB"
        );
        assert_eq!(failure.section().key(), "alloc-limits-max-memory");
        assert_eq!(
            failure.section().body(),
            "Test uses more memory than previous run"
        );
        assert_eq!(baseline.get("test_a"), Some(&10240));
    }

    #[test]
    fn baseline_is_updated_without_regression_detection() {
        let mut baseline = HashMap::from([("test_a".to_string(), 1024_u64)]);
        let policy = LimitMemory::new("1MB").unwrap();

        let outcome = policy.evaluate(
            &[record(10240, MAIN_THREAD, &["f"])],
            &mut EvaluationContext::new("test_a", MAIN_THREAD).with_baseline(&mut baseline),
        );

        assert!(outcome.is_pass());
        assert_eq!(baseline.get("test_a"), Some(&10240));
    }

    #[test]
    fn first_run_records_baseline_and_checks_ceiling() {
        let mut baseline = HashMap::new();
        let policy = LimitMemory::new("1KB").unwrap();

        let outcome = policy.evaluate(
            &[record(2048, MAIN_THREAD, &["f"])],
            &mut EvaluationContext::new("test_a", MAIN_THREAD)
                .with_options(EvaluationOptions::new().with_fail_on_increase(true))
                .with_baseline(&mut baseline),
        );

        assert!(
            outcome
                .failure()
                .unwrap()
                .summary()
                .starts_with("Test was limited to")
        );
        assert_eq!(baseline.get("test_a"), Some(&2048));
    }

    #[test]
    fn leak_limit_is_inclusive() {
        let policy = LimitLeaks::new("1KB").unwrap();

        assert!(evaluate(policy.clone(), &[record(1023, MAIN_THREAD, &["f"])]).is_pass());

        let outcome = evaluate(policy, &[record(1024, MAIN_THREAD, &["f"])]);
        let failure = outcome.failure().unwrap();

        assert_eq!(
            failure.summary(),
            "Test was allowed to leak 1.0KiB per location but at least one location leaked more"
        );
        assert_eq!(failure.section().key(), "alloc-limits-leaked-memory");
        assert!(
            failure
                .section()
                .body()
                .starts_with("List of leaked allocations:\n    - 1.0KiB allocated here:")
        );
    }

    #[test]
    fn leaks_are_grouped_by_site() {
        let policy = LimitLeaks::new("1KB").unwrap();

        let outcome = evaluate(
            policy,
            &[
                record(600, MAIN_THREAD, &["leaky", "caller"]),
                record(100, MAIN_THREAD, &["harmless"]),
                record(600, MAIN_THREAD, &["leaky", "caller"]),
            ],
        );

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.allocations().len(), 1);
        assert_eq!(failure.allocations()[0].size(), 1200);
        assert_eq!(failure.allocations()[0].stack()[0].function(), "leaky");
    }

    #[test]
    fn filtered_leaks_are_suppressed() {
        let policy = LimitLeaks::new("1KB")
            .unwrap()
            .filter(|stack| !stack.frames().iter().any(|f| f.function() == "cache_fill"));

        let records = [
            record(4096, MAIN_THREAD, &["cache_fill", "test_a"]),
            record(2048, MAIN_THREAD, &["real_leak", "test_a"]),
        ];

        let outcome = evaluate(policy.clone(), &records);
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.allocations().len(), 1);
        assert_eq!(failure.allocations()[0].size(), 2048);
        assert!(!failure.section().body().contains("cache_fill"));

        assert!(evaluate(policy, &records[..1]).is_pass());
    }

    #[test]
    fn leak_report_shows_at_least_five_frames() {
        let policy = PolicyMarker::from(LimitLeaks::new("1B").unwrap());
        let functions = ["f0", "f1", "f2", "f3", "f4", "f5", "f6"];

        let outcome = policy.evaluate(
            &[record(10, MAIN_THREAD, &functions)],
            &mut EvaluationContext::new("test_a", MAIN_THREAD),
        );

        let body = outcome.failure().unwrap().section().body().to_string();
        assert!(body.contains("f4:src/lib.rs:10"));
        assert!(!body.contains("f5:src/lib.rs:10"));
        assert!(body.ends_with("        ..."));
    }

    #[test]
    fn leaks_can_ignore_other_threads() {
        let records = [record(4096, OTHER_THREAD, &["background"])];

        assert!(!evaluate(LimitLeaks::new("1KB").unwrap(), &records).is_pass());
        assert!(
            evaluate(
                LimitLeaks::new("1KB").unwrap().current_thread_only(),
                &records
            )
            .is_pass()
        );
    }

    #[test]
    fn single_marker_is_selected() {
        let markers = [PolicyMarker::from(LimitMemory::new("1KB").unwrap())];

        let selected = PolicyMarker::select("test_a", &markers).unwrap();

        assert_eq!(selected.kind(), PolicyKind::LimitMemory);
    }

    #[test]
    fn missing_marker_is_an_error() {
        let error = PolicyMarker::select("test_a", &[]).unwrap_err();

        assert!(matches!(error, Error::NoPolicyMarker { .. }));
    }

    #[test]
    fn multiple_markers_fail_regardless_of_order() {
        let memory = PolicyMarker::from(LimitMemory::new("1KB").unwrap());
        let leaks = PolicyMarker::from(LimitLeaks::new("1KB").unwrap());

        let forward = PolicyMarker::select("test_a", &[memory.clone(), leaks.clone()])
            .unwrap_err()
            .to_string();
        let backward = PolicyMarker::select("test_a", &[leaks, memory])
            .unwrap_err()
            .to_string();

        assert_eq!(forward, backward);
        assert_eq!(
            forward,
            "Only one memory-policy marker can be applied to each test (test_a has: limit_memory, limit_leaks)"
        );
    }
}
