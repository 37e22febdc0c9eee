// Environment abstraction for alloc_limits.
//
// Provides a mockable interface over the environment variables through which a session
// publishes its trace root to worker processes.

mod abstractions;
mod facade;
mod real;

pub(crate) use abstractions::*;
pub(crate) use facade::*;
pub(crate) use real::*;
