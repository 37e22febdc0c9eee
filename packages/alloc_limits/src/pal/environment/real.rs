// Real environment implementation that delegates to std::env.
//
// This is a trivial forwarder to system APIs and is excluded from coverage and mutation testing.

use std::ffi::OsString;
use std::path::Path;

use crate::pal::Environment;

/// Real environment implementation that uses the variables of the current process.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetEnvironment;

// Trivial forwarder to system APIs - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Environment for BuildTargetEnvironment {
    fn var(&self, name: &str) -> Option<OsString> {
        std::env::var_os(name)
    }

    fn set_var(&self, name: &str, value: &Path) {
        // SAFETY: Only called while holding the lock that serializes environment updates of all
        // sessions in this process. Access from threads that do not take that lock is excluded
        // by the documented precondition of `SessionBuilder::build()`.
        unsafe {
            std::env::set_var(name, value);
        }
    }

    fn remove_var(&self, name: &str) {
        // SAFETY: Only called while holding the lock that serializes environment updates of all
        // sessions in this process. Access from threads that do not take that lock is excluded
        // by the documented precondition of `Session::finish()`.
        unsafe {
            std::env::remove_var(name);
        }
    }
}
