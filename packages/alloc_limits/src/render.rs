//! Text rendering of offending allocations for failure reports.

use std::fmt::Write;
use std::num::NonZero;

use crate::size::{bytes_as_f64, format_size};
use crate::ReportedAllocation;

/// Renders each allocation as a size line followed by up to `max_frames` stack frames,
/// innermost first. Stacks deeper than `max_frames` end with an ellipsis line.
///
/// Allocations without any stack frames are omitted.
pub(crate) fn render_allocations(
    allocations: &[ReportedAllocation],
    max_frames: NonZero<usize>,
) -> String {
    let mut text = String::new();

    for allocation in allocations.iter().filter(|a| !a.stack().is_empty()) {
        if !text.is_empty() {
            text.push('\n');
        }

        write!(
            text,
            "    - {} allocated here:",
            format_size(bytes_as_f64(allocation.size()))
        )
        .expect("we expect writing to String to be infallible");

        for frame in allocation.stack().iter().take(max_frames.get()) {
            write!(text, "\n        {frame}")
                .expect("we expect writing to String to be infallible");
        }

        if allocation.stack().len() > max_frames.get() {
            text.push_str("\n        ...");
        }
    }

    text
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::StackFrame;

    fn allocation(size: u64, depth: u32) -> ReportedAllocation {
        let stack = (0..depth)
            .map(|n| StackFrame::new(format!("f{n}"), "src/lib.rs", n))
            .collect();

        ReportedAllocation::new(size, stack)
    }

    fn frames(n: usize) -> NonZero<usize> {
        NonZero::new(n).unwrap()
    }

    #[test]
    fn shallow_stack_is_rendered_in_full() {
        let text = render_allocations(&[allocation(1024, 2)], frames(5));

        assert_eq!(
            text,
            "    - 1.0KiB allocated here:\n        f0:src/lib.rs:0\n        f1:src/lib.rs:1"
        );
    }

    #[test]
    fn deep_stack_is_truncated_with_ellipsis() {
        let text = render_allocations(&[allocation(1024, 10)], frames(3));

        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[3], "        f2:src/lib.rs:2");
        assert_eq!(lines[4], "        ...");
    }

    #[test]
    fn exact_depth_has_no_ellipsis() {
        let text = render_allocations(&[allocation(1024, 3)], frames(3));

        assert!(!text.contains("..."));
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn allocations_without_stack_are_skipped() {
        let text = render_allocations(&[allocation(10, 0), allocation(2048, 1)], frames(1));

        assert_eq!(
            text,
            "    - 2.0KiB allocated here:\n        f0:src/lib.rs:0"
        );
    }
}
