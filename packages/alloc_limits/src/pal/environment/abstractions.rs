// Environment trait abstraction for mocking in tests.

use std::ffi::OsString;
use std::fmt::Debug;
use std::path::Path;

/// Abstraction over the process environment as used by alloc_limits.
///
/// This trait is automatically mocked by mockall in test builds, generating `MockEnvironment`.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Environment: Debug + Send + Sync + 'static {
    /// Returns the value of the environment variable, if it is set.
    fn var(&self, name: &str) -> Option<OsString>;

    /// Sets the environment variable to the given path.
    ///
    /// The variable is inherited by every process started afterwards.
    fn set_var(&self, name: &str, value: &Path);

    /// Removes the environment variable.
    fn remove_var(&self, name: &str);
}
