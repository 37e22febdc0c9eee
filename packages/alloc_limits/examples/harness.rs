//! A minimal test harness built on `alloc_limits`.
//!
//! The harness runs three tests under the in-process fake tracker: one within its memory limit,
//! one over it and one that leaks. It then prints each outcome and the end-of-session summary.

use alloc_limits::fake::{FakeTraceReader, FakeTracker};
use alloc_limits::{
    AllocationRecord, Config, LimitLeaks, LimitMemory, Outcome, Phase, Session, StackFrame,
    StdoutTerminal, TestFunction, TestItem, TestReport,
};

fn allocating_test(tracker: &FakeTracker, size: u64, leak: bool) -> TestFunction {
    let tracker = tracker.clone();

    TestFunction::new(move || {
        let record = AllocationRecord::new(
            size,
            FakeTracker::MAIN_THREAD_ID,
            vec![
                StackFrame::new("build_index", "src/index.rs", 42),
                StackFrame::new("load_corpus", "src/corpus.rs", 7),
            ],
        );

        if leak {
            tracker.leak(record);
        } else {
            tracker.allocate(record);
        }

        Ok(())
    })
}

fn main() {
    let dir = tempfile::tempdir().expect("temporary directory must be available for the example");

    let config = Config::new()
        .with_enabled(true)
        .with_output_dir(dir.path())
        .with_bin_prefix("example");

    let tracker = FakeTracker::new();
    let session = Session::builder(config, tracker.clone(), FakeTraceReader::new())
        .build()
        .expect("the output directory was just created");

    let mut tests = vec![
        TestItem::new("index::small", allocating_test(&tracker, 512, false))
            .with_marker(LimitMemory::new("1KB").expect("valid size")),
        TestItem::new("index::large", allocating_test(&tracker, 3 * 1024 * 1024, false))
            .with_marker(LimitMemory::new("1MB").expect("valid size")),
        TestItem::new("index::leaky", allocating_test(&tracker, 8 * 1024, true))
            .with_marker(LimitLeaks::new("4KB").expect("valid size")),
    ];

    for item in &mut tests {
        let outcome = match session.run_call(item, |item| item.function().call()) {
            Ok(()) => Outcome::Passed,
            Err(_) => Outcome::Failed,
        };

        let mut report = TestReport::new(item.node_id(), Phase::Call, outcome);
        session.make_report(item, &mut report);

        let status = session
            .report_status(&report)
            .map_or_else(|| format!("{:?}", report.outcome()), |status| status.word().to_string());

        println!("{} ... {status}", item.node_id());

        if let Some(message) = report.long_repr() {
            println!("    {message}");
        }

        for section in report.sections() {
            println!("{}", section.body());
        }
    }

    session
        .write_summary(&mut StdoutTerminal::new())
        .expect("result records are readable");

    session.finish().expect("durable output needs no cleanup");
}
