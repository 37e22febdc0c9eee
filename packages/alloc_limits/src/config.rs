//! Session configuration, read from the `[alloc_limits]` table of a TOML file and from
//! command-line flags, with flags taking precedence.

use std::num::NonZero;
use std::path::{Path, PathBuf};

use argh::FromArgs;
use serde::Deserialize;

use crate::{Error, EvaluationOptions, Result, TrackerOptions};

/// Name under which the flags are parsed, shown in help output.
const COMMAND_NAME: &str = "alloc_limits";

const DEFAULT_MOST_ALLOCATIONS: usize = 5;

/// Options that control which tests are instrumented, where traces go and what gets reported.
///
/// # Example
///
/// ```
/// use alloc_limits::Config;
///
/// let config = Config::from_toml_str(
///     r#"
///     [alloc_limits]
///     stacks = 3
///     hide_summary = true
///     "#,
/// )
/// .unwrap()
/// .merged_with_cli(&["--enabled", "--stacks", "8"])
/// .unwrap();
///
/// assert!(config.is_enabled());
/// assert!(config.hide_summary());
/// assert_eq!(config.stacks().get(), 8);
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    enabled: bool,
    output_dir: Option<PathBuf>,
    bin_prefix: Option<String>,
    hide_summary: bool,
    most_allocations: usize,
    stacks: NonZero<usize>,
    native: bool,
    trace_allocator_internals: bool,
    fail_on_increase: bool,
}

impl Config {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: false,
            output_dir: None,
            bin_prefix: None,
            hide_summary: false,
            most_allocations: DEFAULT_MOST_ALLOCATIONS,
            stacks: NonZero::<usize>::MIN,
            native: false,
            trace_allocator_internals: false,
            fail_on_increase: false,
        }
    }

    /// Reads the `[alloc_limits]` table of a TOML document. Other tables are ignored and a
    /// missing table yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the document is not valid TOML or the table
    /// contains unknown keys or invalid values.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(toml).map_err(|e| Error::InvalidConfiguration {
            problem: e.to_string(),
        })?;

        Ok(file.alloc_limits)
    }

    /// Parses command-line flags on top of the default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the flags cannot be parsed.
    pub fn from_cli_args(args: &[&str]) -> Result<Self> {
        Self::new().merged_with_cli(args)
    }

    /// Applies command-line flags on top of this configuration. Switches given on the command
    /// line turn options on and values given on the command line replace existing values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the flags cannot be parsed.
    pub fn merged_with_cli(mut self, args: &[&str]) -> Result<Self> {
        let cli = CliArgs::from_args(&[COMMAND_NAME], args).map_err(|early_exit| {
            Error::InvalidConfiguration {
                problem: early_exit.output,
            }
        })?;

        self.enabled |= cli.enabled;
        self.output_dir = cli.output_dir.or(self.output_dir);
        self.bin_prefix = cli.bin_prefix.or(self.bin_prefix);
        self.hide_summary |= cli.hide_summary;
        self.most_allocations = cli.most_allocations.unwrap_or(self.most_allocations);
        self.stacks = cli.stacks.unwrap_or(self.stacks);
        self.native |= cli.native;
        self.trace_allocator_internals |= cli.trace_allocator_internals;
        self.fail_on_increase |= cli.fail_on_increase;

        Ok(self)
    }

    /// Help text describing every command-line flag, for hosts that list their options.
    #[must_use]
    pub fn cli_help() -> String {
        match CliArgs::from_args(&[COMMAND_NAME], &["--help"]) {
            Ok(_) => String::new(),
            Err(early_exit) => early_exit.output,
        }
    }

    /// Sets whether every test is instrumented, not only tests with a policy marker.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the durable directory for traces. Without one, a temporary directory is used.
    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(output_dir.into());
        self
    }

    /// Sets the prefix of durable trace file names. Without one, a random token is used.
    #[must_use]
    pub fn with_bin_prefix(mut self, bin_prefix: impl Into<String>) -> Self {
        self.bin_prefix = Some(bin_prefix.into());
        self
    }

    /// Sets whether the end-of-session summary is suppressed.
    #[must_use]
    pub fn with_hide_summary(mut self, hide_summary: bool) -> Self {
        self.hide_summary = hide_summary;
        self
    }

    /// Sets how many tests the summary shows, zero meaning all.
    #[must_use]
    pub fn with_most_allocations(mut self, most_allocations: usize) -> Self {
        self.most_allocations = most_allocations;
        self
    }

    /// Sets how many stack frames are shown per allocation in failure reports.
    #[must_use]
    pub fn with_stacks(mut self, stacks: NonZero<usize>) -> Self {
        self.stacks = stacks;
        self
    }

    /// Sets whether native stack frames are captured and shown.
    #[must_use]
    pub fn with_native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    /// Sets whether allocations made by the allocator's internal pools are captured.
    #[must_use]
    pub fn with_trace_allocator_internals(mut self, trace_allocator_internals: bool) -> Self {
        self.trace_allocator_internals = trace_allocator_internals;
        self
    }

    /// Sets whether the memory ceiling also fails tests that allocate more than before.
    #[must_use]
    pub fn with_fail_on_increase(mut self, fail_on_increase: bool) -> Self {
        self.fail_on_increase = fail_on_increase;
        self
    }

    /// Whether every test is instrumented, not only tests with a policy marker.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The durable directory for traces, if any.
    #[must_use]
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// The prefix of durable trace file names, if set explicitly.
    #[must_use]
    pub fn bin_prefix(&self) -> Option<&str> {
        self.bin_prefix.as_deref()
    }

    /// Whether the end-of-session summary is suppressed.
    #[must_use]
    pub fn hide_summary(&self) -> bool {
        self.hide_summary
    }

    /// How many tests the summary shows, zero meaning all.
    #[must_use]
    pub fn most_allocations(&self) -> usize {
        self.most_allocations
    }

    /// How many stack frames are shown per allocation in failure reports.
    #[must_use]
    pub fn stacks(&self) -> NonZero<usize> {
        self.stacks
    }

    /// Whether native stack frames are captured and shown.
    #[must_use]
    pub fn native(&self) -> bool {
        self.native
    }

    /// Whether allocations made by the allocator's internal pools are captured.
    #[must_use]
    pub fn trace_allocator_internals(&self) -> bool {
        self.trace_allocator_internals
    }

    /// Whether the memory ceiling also fails tests that allocate more than before.
    #[must_use]
    pub fn fail_on_increase(&self) -> bool {
        self.fail_on_increase
    }

    /// The options forwarded to the tracker for every tracking scope.
    #[must_use]
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions::new(self.native, self.trace_allocator_internals)
    }

    /// The report settings applied to every policy evaluation.
    #[must_use]
    pub fn evaluation_options(&self) -> EvaluationOptions {
        EvaluationOptions::new()
            .with_stacks(self.stacks)
            .with_native_stacks(self.native)
            .with_fail_on_increase(self.fail_on_increase)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    alloc_limits: Config,
}

/// Memory instrumentation and memory limits for tests.
#[derive(Debug, FromArgs)]
struct CliArgs {
    /// instrument every test, not only tests with a memory policy marker
    #[argh(switch)]
    enabled: bool,

    /// directory where traces are kept (a temporary directory is used and removed if not set)
    #[argh(option)]
    output_dir: Option<PathBuf>,

    /// prefix of trace file names in the output directory (a random token if not set)
    #[argh(option)]
    bin_prefix: Option<String>,

    /// do not show the memory summary at the end of the session
    #[argh(switch)]
    hide_summary: bool,

    /// how many tests to show in the summary, 0 for all (default 5)
    #[argh(option)]
    most_allocations: Option<usize>,

    /// how many stack frames to show per allocation in failure reports (default 1)
    #[argh(option)]
    stacks: Option<NonZero<usize>>,

    /// capture native stack frames
    #[argh(switch)]
    native: bool,

    /// capture allocations made by the allocator's internal pools
    #[argh(switch)]
    trace_allocator_internals: bool,

    /// fail tests whose memory usage increased since the previous run
    #[argh(switch)]
    fail_on_increase: bool,
}
