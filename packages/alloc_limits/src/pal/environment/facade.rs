// Facade that dispatches to either the real environment or a mock in tests.
//
// The facade pattern allows the same code to work with both real and mock implementations,
// with the mock variant only available in test builds.

use std::ffi::OsString;
use std::path::Path;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::pal::MockEnvironment;
use crate::pal::{BuildTargetEnvironment, Environment};

/// Facade over environment operations, dispatching to real or mock implementation.
///
/// In production, this always uses `BuildTargetEnvironment`. In tests, it can also wrap a
/// `MockEnvironment` for controlled test scenarios.
#[derive(Clone)]
pub(crate) enum EnvironmentFacade {
    /// Real environment implementation.
    Target(&'static BuildTargetEnvironment),

    /// Mock environment for testing.
    #[cfg(test)]
    Mock(Arc<MockEnvironment>),
}

// Debug implementations have no API contract to test.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl std::fmt::Debug for EnvironmentFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Target(_) => f.debug_struct("EnvironmentFacade::Target").finish(),
            #[cfg(test)]
            Self::Mock(_) => f.debug_struct("EnvironmentFacade::Mock").finish(),
        }
    }
}

/// Static instance of the real environment for production use.
static BUILD_TARGET_ENVIRONMENT: BuildTargetEnvironment = BuildTargetEnvironment;

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl EnvironmentFacade {
    /// Creates a facade using the real environment.
    pub(crate) const fn target() -> Self {
        Self::Target(&BUILD_TARGET_ENVIRONMENT)
    }

    /// Creates a facade wrapping a mock environment (test builds only).
    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockEnvironment) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Environment for EnvironmentFacade {
    fn var(&self, name: &str) -> Option<OsString> {
        match self {
            Self::Target(env) => env.var(name),
            #[cfg(test)]
            Self::Mock(mock) => mock.var(name),
        }
    }

    fn set_var(&self, name: &str, value: &Path) {
        match self {
            Self::Target(env) => env.set_var(name, value),
            #[cfg(test)]
            Self::Mock(mock) => mock.set_var(name, value),
        }
    }

    fn remove_var(&self, name: &str) {
        match self {
            Self::Target(env) => env.remove_var(name),
            #[cfg(test)]
            Self::Mock(mock) => mock.remove_var(name),
        }
    }
}

// Facade types are trivial pass-through layers - not worth testing.
#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg_attr(test, mutants::skip)]
impl Default for EnvironmentFacade {
    fn default() -> Self {
        Self::target()
    }
}
