use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when configuring or running memory-instrumented tests.
///
/// Policy violations are not errors. They are the normal [`PolicyOutcome::Fail`][1] result of
/// evaluating a policy. Likewise, a test that produced no trace (e.g. because it was skipped)
/// is not an error, it simply yields no result.
///
/// [1]: crate::PolicyOutcome::Fail
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A memory size string did not match the `<number><unit>` format.
    #[error("invalid memory size format: '{value}': {problem}")]
    InvalidMemorySize {
        /// The string that failed to parse.
        value: String,

        /// A human-readable description of the problem.
        problem: String,
    },

    /// The durable output directory cannot be used for writing traces.
    #[error("{problem}")]
    OutputDirectory {
        /// The absolute path of the rejected directory.
        path: PathBuf,

        /// A human-readable description of the problem, mentioning the path.
        problem: String,
    },

    /// A test carries more than one memory policy marker.
    #[error("Only one memory-policy marker can be applied to each test ({test_id} has: {markers})")]
    MultiplePolicyMarkers {
        /// Identity of the offending test.
        test_id: String,

        /// Names of the markers found on the test, sorted.
        markers: String,
    },

    /// Policy evaluation was requested for a test that carries no memory policy marker.
    #[error("no memory-policy marker is applied to {test_id}")]
    NoPolicyMarker {
        /// Identity of the offending test.
        test_id: String,
    },

    /// A configuration value supplied via command line or configuration file is invalid.
    #[error("invalid configuration: {problem}")]
    InvalidConfiguration {
        /// A human-readable description of the problem.
        problem: String,
    },

    /// A filesystem operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What we were trying to do when the operation failed.
        context: String,

        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A durable result record could not be serialized or deserialized.
    #[error("result record {} is malformed: {source}", path.display())]
    ResultRecord {
        /// Path of the record file.
        path: PathBuf,

        /// The underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The baseline cache file could not be serialized or deserialized.
    #[error("baseline cache {} is malformed: {source}", path.display())]
    BaselineCache {
        /// Path of the cache file.
        path: PathBuf,

        /// The underlying serialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn invalid_memory_size(value: &str, problem: impl Into<String>) -> Self {
        Self::InvalidMemorySize {
            value: value.to_string(),
            problem: problem.into(),
        }
    }

    /// Whether this error is a configuration problem rather than a runtime failure.
    ///
    /// Configuration problems abort policy evaluation for the affected test with a clear
    /// message but never crash the session.
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMemorySize { .. }
                | Self::OutputDirectory { .. }
                | Self::MultiplePolicyMarkers { .. }
                | Self::NoPolicyMarker { .. }
                | Self::InvalidConfiguration { .. }
        )
    }
}

/// A specialized `Result` type for memory instrumentation operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
