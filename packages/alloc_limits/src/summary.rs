//! The end-of-session report: tests ranked by peak memory, each with a histogram of its
//! allocation sizes and its biggest allocating functions.

use std::cmp::{Ordering, Reverse};

use itertools::Itertools;
use tracing::warn;

use crate::size::{bytes_as_f64, format_size};
use crate::{AllocationRecord, ResultPointer, TerminalWriter, TraceReader};

/// Upper bound on the number of histogram bins; fewer are used for tests with fewer
/// allocations.
const HISTOGRAM_BINS: usize = 5;

/// How many of the largest allocations are listed per test.
const TOP_ALLOCATIONS: usize = 5;

/// Density glyphs from empty to full.
const BARS: [char; 9] = [' ', '▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Index of the full glyph in [`BARS`].
const FULL_BAR: u64 = 8;

/// Writes a section for each of the `max_tests` tests with the highest peak memory, or for
/// all tests if `max_tests` is zero.
///
/// Results whose trace no longer exists are ignored, as are traces that cannot be replayed
/// or contain no allocations. Returns the number of results whose trace still exists.
pub(crate) fn write_ranked_results(
    terminal: &mut dyn TerminalWriter,
    pointers: Vec<ResultPointer>,
    reader: &dyn TraceReader,
    max_tests: usize,
) -> usize {
    let limit = if max_tests == 0 { usize::MAX } else { max_tests };

    let ranked = pointers
        .into_iter()
        .filter(|pointer| pointer.trace_path().exists())
        .sorted_by(by_peak_memory_descending)
        .collect::<Vec<_>>();

    let retained = ranked.len();

    for pointer in ranked.into_iter().take(limit) {
        let records = match reader
            .open(pointer.trace_path())
            .and_then(|trace| trace.high_watermark_records(true))
        {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    test_id = pointer.test_id(),
                    error = %e,
                    "skipping test whose trace cannot be replayed"
                );
                continue;
            }
        };

        if records.is_empty() {
            continue;
        }

        write_test_section(terminal, &pointer, &records);
    }

    retained
}

fn by_peak_memory_descending(a: &ResultPointer, b: &ResultPointer) -> Ordering {
    b.metadata()
        .peak_memory()
        .cmp(&a.metadata().peak_memory())
        .then_with(|| a.test_id().cmp(b.test_id()))
}

fn write_test_section(
    terminal: &mut dyn TerminalWriter,
    pointer: &ResultPointer,
    records: &[AllocationRecord],
) {
    let metadata = pointer.metadata();
    let sizes = records.iter().map(AllocationRecord::size).collect::<Vec<_>>();

    terminal.write_line(&format!(
        "Allocation results for {}",
        pointer.test_id()
    ));
    terminal.write_line("");
    terminal.write_line(&format!(
        "    Total memory allocated: {}",
        format_size(bytes_as_f64(metadata.peak_memory()))
    ));
    terminal.write_line(&format!(
        "    Total allocations: {}",
        metadata.total_allocations()
    ));
    terminal.write_line(&format!(
        "    Histogram of allocation sizes: |{}|",
        size_histogram(&sizes, sizes.len().min(HISTOGRAM_BINS))
    ));
    terminal.write_line("    Biggest allocating functions:");

    for record in records
        .iter()
        .sorted_by_key(|record| Reverse(record.size()))
        .take(TOP_ALLOCATIONS)
    {
        let Some(call_site) = record.stack_trace().first() else {
            continue;
        };

        terminal.write_line(&format!(
            "        - {call_site} -> {}",
            format_size(bytes_as_f64(record.size()))
        ));
    }

    terminal.write_line("");
}

/// Renders a histogram of allocation sizes, with log-scaled bucket edges, as one density
/// glyph per bin scaled to the busiest bin, separated by spaces.
///
/// Empty sizes are not counted. Returns an empty string if no sizes remain.
pub(crate) fn size_histogram(sizes: &[u64], bins: usize) -> String {
    let logs = sizes
        .iter()
        .filter(|&&size| size > 0)
        .map(|&size| bytes_as_f64(size).ln())
        .collect::<Vec<_>>();

    let Some((low, high)) = min_max(&logs) else {
        return String::new();
    };

    let counts = histogram(&logs, low, high, bins);
    let busiest = counts.iter().copied().max().unwrap_or(0);

    counts
        .iter()
        .map(|&count| bar(count, busiest))
        .join(" ")
}

/// Counts `values` into `bins` equally wide buckets spanning `low..=high`.
///
/// Values at `high` fall into the last bucket.
pub(crate) fn histogram(values: &[f64], low: f64, high: f64, bins: usize) -> Vec<u64> {
    let mut counts = vec![0_u64; bins];

    let Some(last_bin) = bins.checked_sub(1) else {
        return counts;
    };

    #[expect(
        clippy::cast_precision_loss,
        reason = "bin counts are tiny"
    )]
    let width = (high - low) / bins as f64;

    // A collapsed range would divide by zero.
    let step = if width > 0.0 {
        width
    } else if low > 0.0 {
        low
    } else {
        1.0
    };

    for value in values {
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "the offset is non-negative and clamped to the bin range right after"
        )]
        let bin = (((value - low) / step).floor().max(0.0) as usize).min(last_bin);

        if let Some(count) = counts.get_mut(bin) {
            *count = count.saturating_add(1);
        }
    }

    counts
}

fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    let first = *values.first()?;

    Some(
        values
            .iter()
            .fold((first, first), |(low, high), &v| (low.min(v), high.max(v))),
    )
}

fn bar(count: u64, busiest: u64) -> char {
    if busiest == 0 {
        return BARS[0];
    }

    #[expect(
        clippy::integer_division,
        reason = "rounding down to the nearest glyph is intended"
    )]
    let level = count.saturating_mul(FULL_BAR) / busiest;

    usize::try_from(level)
        .ok()
        .and_then(|level| BARS.get(level))
        .copied()
        .unwrap_or(BARS[8])
}
