pub(crate) const ERR_POISONED_LOCK: &str = "encountered poisoned lock - program validity cannot be guaranteed";

/// Environment variable through which the session that owns the temporary trace root
/// publishes its location to worker processes.
pub(crate) const RESULT_PATH_ENV_VAR: &str = "ALLOC_LIMITS_RESULT_PATH";

/// Name of the directory under the trace root that holds durable result records.
pub(crate) const METADATA_DIR_NAME: &str = "metadata";

/// File extension of durable result records.
pub(crate) const METADATA_EXTENSION: &str = "metadata";

/// File extension of binary traces.
pub(crate) const TRACE_EXTENSION: &str = "bin";

/// Prefix shared by every report section key this package attaches to a test report.
pub(crate) const SECTION_KEY_PREFIX: &str = "alloc-limits";
