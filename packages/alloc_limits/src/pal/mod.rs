// Platform abstraction layer for alloc_limits.
//
// This module provides abstractions over process-global state (environment variables) to enable
// mocking in tests, in three layers: abstraction (trait) → facade (enum) → real implementation.

mod environment;

pub(crate) use environment::*;
