//! The session: the context object a host test framework creates once per test run and calls
//! into from its hooks.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::cache::BaselineCache;
use crate::constants::{ERR_POISONED_LOCK, SECTION_KEY_PREFIX};
use crate::function::TestBody;
use crate::pal::EnvironmentFacade;
use crate::results::ResultRegistry;
use crate::storage::TraceStorage;
use crate::summary::write_ranked_results;
use crate::{
    Config, Error, EvaluationContext, Outcome, Phase, PolicyMarker, PolicyOutcome, Result,
    ResultPointer, TerminalWriter, TestFunction, TestItem, TestReport, TestResult, TestStatus,
    TraceReader, Tracker, TrackerOptions,
};

/// Memory instrumentation for one test run.
///
/// The host framework creates a session when the run starts and calls it from its hooks:
///
/// 1. [`run_call()`](Self::run_call) around the call phase of every test.
/// 2. [`make_report()`](Self::make_report) once the report of each phase is known.
/// 3. [`report_status()`](Self::report_status) to categorize reports in progress output.
/// 4. [`write_summary()`](Self::write_summary) at the end of the run.
/// 5. [`finish()`](Self::finish) to tear the session down.
///
/// Everything the session owns (the trace root, the known results, the baseline cache) lives
/// inside the session, so independent sessions can coexist in one process.
///
/// # Example
///
/// ```
/// use alloc_limits::fake::{FakeTraceReader, FakeTracker};
/// use alloc_limits::{
///     AllocationRecord, Config, LimitMemory, Outcome, Phase, Session, StackFrame, TestFunction,
///     TestItem, TestReport,
/// };
///
/// let dir = tempfile::tempdir().unwrap();
/// let tracker = FakeTracker::new();
/// let session = Session::builder(
///     Config::new().with_output_dir(dir.path()),
///     tracker.clone(),
///     FakeTraceReader::new(),
/// )
/// .build()
/// .unwrap();
///
/// let test_tracker = tracker.clone();
/// let mut item = TestItem::new(
///     "tests::fill_buffer",
///     TestFunction::new(move || {
///         test_tracker.allocate(AllocationRecord::new(
///             4096,
///             FakeTracker::MAIN_THREAD_ID,
///             vec![StackFrame::new("fill_buffer", "tests/buffers.rs", 12)],
///         ));
///         Ok(())
///     }),
/// )
/// .with_marker(LimitMemory::new("1KB").unwrap());
///
/// session
///     .run_call(&mut item, |item| item.function().call())
///     .unwrap();
///
/// let mut report = TestReport::new(item.node_id(), Phase::Call, Outcome::Passed);
/// session.make_report(&item, &mut report);
///
/// assert_eq!(report.outcome(), Outcome::Failed);
/// assert_eq!(
///     report.long_repr(),
///     Some("Test was limited to 1.0KiB but allocated 4.0KiB")
/// );
///
/// session.finish().unwrap();
/// ```
pub struct Session {
    config: Config,
    shared: Arc<Shared>,
    baseline: Option<Mutex<Box<dyn BaselineCache>>>,
}

/// The parts of a session that instrumented test functions need while they run.
#[derive(Debug)]
struct Shared {
    storage: Mutex<TraceStorage>,
    registry: Mutex<ResultRegistry>,
    tracker: Arc<dyn Tracker>,
    reader: Arc<dyn TraceReader>,
    tracker_options: TrackerOptions,
}

impl Session {
    /// Starts building a session with the given configuration, tracker and trace reader.
    pub fn builder(
        config: Config,
        tracker: impl Tracker + 'static,
        reader: impl TraceReader + 'static,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            tracker: Arc::new(tracker),
            reader: Arc::new(reader),
            baseline: None,
            environment: EnvironmentFacade::default(),
        }
    }

    /// The configuration of the session.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The directory that holds the traces of this session.
    #[must_use]
    pub fn trace_root(&self) -> PathBuf {
        self.storage().root().to_path_buf()
    }

    /// Whether traces are kept in a durable output directory after the session ends.
    #[must_use]
    pub fn keeps_traces(&self) -> bool {
        self.storage().is_durable()
    }

    /// The directory that holds the shared result records of this run.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.storage().metadata_dir().to_path_buf()
    }

    /// Whether the test is run under memory tracking: every test is if the session is
    /// enabled, otherwise only tests with a policy marker are.
    #[must_use]
    pub fn is_instrumented(&self, item: &TestItem) -> bool {
        self.config.is_enabled() || !item.markers().is_empty()
    }

    /// Dispatches the call phase of a test.
    ///
    /// For an instrumented test, the test's callable is replaced by an instrumented version
    /// for the duration of `dispatch`, which is expected to invoke `item.function()`. The
    /// instrumented version runs the original callable inside a tracking scope and records a
    /// result if the test passes. The original callable is restored when `dispatch` returns
    /// or unwinds, so the same item can be dispatched again (e.g. by a retry extension).
    ///
    /// # Errors
    ///
    /// Returns whatever `dispatch` returns. Instrumentation problems never replace the test's
    /// own outcome; they are logged instead.
    pub fn run_call<F>(&self, item: &mut TestItem, dispatch: F) -> TestResult
    where
        F: FnOnce(&TestItem) -> TestResult,
    {
        if !self.is_instrumented(item) {
            return dispatch(item);
        }

        let original = item.function().original();

        let shared = Arc::clone(&self.shared);
        let test_id = item.node_id().to_string();
        let instrumented = original.instrumented_with(move |test| -> TestBody {
            Arc::new(move || shared.run_tracked(&test_id, &test))
        });

        item.set_function(instrumented);

        let item = scopeguard::guard(item, move |item| item.set_function(original));

        dispatch(&item)
    }

    /// The result recorded for the test with the given identity, if any.
    #[must_use]
    pub fn result(&self, test_id: &str) -> Option<ResultPointer> {
        self.registry().get(test_id).cloned()
    }

    /// Evaluates the memory policy of a test once its call phase has passed, turning the report
    /// into a failure if the policy is violated.
    ///
    /// Reports of other phases, of tests that did not pass, of tests without a policy marker or
    /// of tests without a recorded result are left untouched. A test with more than one policy
    /// marker fails with a configuration error.
    pub fn make_report(&self, item: &TestItem, report: &mut TestReport) {
        if report.phase() != Phase::Call
            || report.outcome() != Outcome::Passed
            || item.markers().is_empty()
        {
            return;
        }

        let marker = match PolicyMarker::select(item.node_id(), item.markers()) {
            Ok(marker) => marker,
            Err(e) => {
                report.fail(e.to_string(), None);
                return;
            }
        };

        let Some(pointer) = self.result(item.node_id()) else {
            debug!(test_id = item.node_id(), "no result recorded, policy not evaluated");
            return;
        };

        match self.evaluate(marker, &pointer) {
            Ok(PolicyOutcome::Pass) => {}
            Ok(PolicyOutcome::Fail(failure)) => {
                report.fail(
                    failure.summary().to_string(),
                    Some(failure.section().clone()),
                );
            }
            Err(e) => {
                warn!(
                    test_id = item.node_id(),
                    error = %e,
                    "cannot evaluate memory policy"
                );
            }
        }
    }

    fn evaluate(&self, marker: &PolicyMarker, pointer: &ResultPointer) -> Result<PolicyOutcome> {
        let trace_path = pointer.trace_path();

        let records = self
            .shared
            .reader
            .open(trace_path)
            .and_then(|trace| trace.records(marker.kind().view(), marker.merges_threads()))
            .map_err(|e| Error::io(format!("cannot replay trace {}", trace_path.display()), e))?;

        let mut baseline = self
            .baseline
            .as_ref()
            .map(|baseline| baseline.lock().expect(ERR_POISONED_LOCK));

        let mut context =
            EvaluationContext::new(pointer.test_id(), pointer.metadata().main_thread_id())
                .with_options(self.config.evaluation_options());

        if let Some(baseline) = baseline.as_mut() {
            context = context.with_baseline(&mut ***baseline);
        }

        Ok(marker.evaluate(&records, &mut context))
    }

    /// How the host shows the report in its progress output, if it differs from the default.
    ///
    /// Failed call-phase reports that carry a memory policy section are shown as
    /// [`TestStatus::MEMORY_PROBLEMS`].
    #[must_use]
    pub fn report_status(&self, report: &TestReport) -> Option<TestStatus> {
        let memory_problem = report.phase() == Phase::Call
            && report.outcome() == Outcome::Failed
            && report
                .sections()
                .iter()
                .any(|section| section.key().contains(SECTION_KEY_PREFIX));

        memory_problem.then_some(TestStatus::MEMORY_PROBLEMS)
    }

    /// Writes the end-of-session summary of the tests with the highest peak memory.
    ///
    /// Only written if the session is enabled and the summary is not hidden. If this process
    /// has not recorded any results itself (because other processes ran the tests), the results
    /// are first loaded from the records that all processes of the run share.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared records cannot be scanned.
    pub fn write_summary(&self, terminal: &mut dyn TerminalWriter) -> Result<()> {
        if !self.config.is_enabled() || self.config.hide_summary() {
            return Ok(());
        }

        terminal.write_line("");
        terminal.write_separator('=', "ALLOC LIMITS REPORT");

        let pointers = {
            let mut registry = self.registry();

            if registry.is_empty() {
                registry.load_from_disk()?;
            }

            registry.pointers().cloned().collect::<Vec<_>>()
        };

        let retained = write_ranked_results(
            terminal,
            pointers,
            self.shared.reader.as_ref(),
            self.config.most_allocations(),
        );

        let storage = self.storage();

        if storage.is_durable() {
            terminal.write_line(&format!(
                "Created {retained} binary dumps at {} with prefix {}",
                storage.root().display(),
                storage.prefix()
            ));
        }

        Ok(())
    }

    /// Tears the session down: persists the baseline cache and, if this session created the
    /// temporary trace root, removes it and withdraws its published location.
    ///
    /// Withdrawing the published location removes an environment variable of the process.
    /// The caller must ensure that no other thread reads or writes the process environment
    /// while this runs, just as for [`SessionBuilder::build()`].
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline cache cannot be persisted or the temporary trace root
    /// cannot be removed.
    pub fn finish(self) -> Result<()> {
        if let Some(baseline) = &self.baseline {
            baseline.lock().expect(ERR_POISONED_LOCK).persist()?;
        }

        self.storage().close()
    }

    fn storage(&self) -> MutexGuard<'_, TraceStorage> {
        self.shared.storage.lock().expect(ERR_POISONED_LOCK)
    }

    fn registry(&self) -> MutexGuard<'_, ResultRegistry> {
        self.shared.registry.lock().expect(ERR_POISONED_LOCK)
    }
}

impl fmt::Debug for Session {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("shared", &self.shared)
            .field("baseline", &self.baseline)
            .finish()
    }
}

impl Shared {
    /// Runs the test inside a tracking scope and records its result if it passes.
    ///
    /// If tracking cannot start, the test runs untracked and yields no result.
    fn run_tracked(&self, test_id: &str, test: &TestFunction) -> TestResult {
        let trace_path = self.storage.lock().expect(ERR_POISONED_LOCK).trace_path(test_id);

        let trace_path = match trace_path {
            Ok(path) => path,
            Err(e) => {
                warn!(test_id, error = %e, "running test without memory tracking");
                return test.call();
            }
        };

        let scope = match self.tracker.start(&trace_path, self.tracker_options) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(test_id, error = %e, "running test without memory tracking");
                return test.call();
            }
        };

        // The trace must be finalized before anyone reads it, also if the test panics.
        let scope = scopeguard::guard(scope, |mut scope| {
            if let Err(e) = scope.close() {
                warn!(test_id, error = %e, "failed to finalize trace");
            }
        });

        let outcome = test.call();
        drop(scope);

        if outcome.is_ok() {
            self.record_result(test_id, trace_path);
        }

        outcome
    }

    fn record_result(&self, test_id: &str, trace_path: PathBuf) {
        let metadata = match self.reader.open(&trace_path) {
            Ok(trace) => trace.metadata(),
            Err(e) => {
                debug!(
                    test_id,
                    error = %e,
                    "no readable trace was produced, test has no result"
                );
                return;
            }
        };

        let pointer = ResultPointer::new(test_id, metadata, trace_path);

        if let Err(e) = self.registry.lock().expect(ERR_POISONED_LOCK).record(pointer) {
            warn!(test_id, error = %e, "result is not visible to other processes");
        }
    }
}

/// Builds a [`Session`].
#[must_use]
pub struct SessionBuilder {
    config: Config,
    tracker: Arc<dyn Tracker>,
    reader: Arc<dyn TraceReader>,
    baseline: Option<Box<dyn BaselineCache>>,
    environment: EnvironmentFacade,
}

impl SessionBuilder {
    /// Enables baseline tracking for the memory ceiling, storing baselines in `cache`.
    pub fn baseline_cache(mut self, cache: impl BaselineCache + 'static) -> Self {
        self.baseline = Some(Box::new(cache));
        self
    }

    #[cfg(test)]
    pub(crate) fn environment(mut self, environment: EnvironmentFacade) -> Self {
        self.environment = environment;
        self
    }

    /// Sets up the trace root and builds the session.
    ///
    /// Without an output directory, this may publish the temporary trace root by setting an
    /// environment variable of the process. Sessions serialize such updates among themselves,
    /// but the caller must ensure that no other thread reads or writes the process environment
    /// (e.g. via [`std::env::var()`] or by spawning a process) while this runs.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the output directory cannot be used, or an I/O error
    /// if the trace root cannot be set up.
    pub fn build(self) -> Result<Session> {
        let storage = TraceStorage::new(
            self.config.output_dir(),
            self.config.bin_prefix(),
            self.environment,
        )?;

        let registry = ResultRegistry::new(storage.metadata_dir().to_path_buf());

        debug!(
            root = %storage.root().display(),
            durable = storage.is_durable(),
            "memory instrumentation session started"
        );

        Ok(Session {
            shared: Arc::new(Shared {
                storage: Mutex::new(storage),
                registry: Mutex::new(registry),
                tracker: self.tracker,
                reader: self.reader,
                tracker_options: self.config.tracker_options(),
            }),
            config: self.config,
            baseline: self.baseline.map(Mutex::new),
        })
    }
}

impl fmt::Debug for SessionBuilder {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("tracker", &self.tracker)
            .field("reader", &self.reader)
            .field("baseline", &self.baseline)
            .finish_non_exhaustive()
    }
}
