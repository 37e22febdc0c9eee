//! Result pointers and the registry that makes them visible across processes.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::constants::METADATA_EXTENSION;
use crate::{Error, Result, TraceMetadata};

/// Points from a test identity to the trace recorded for it and the trace's run metadata.
///
/// Created when an instrumented test completes successfully and never mutated afterwards.
/// A rerun of the same test produces a new pointer that supersedes the old one.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ResultPointer {
    test_id: String,
    metadata: TraceMetadata,
    trace_path: PathBuf,
}

impl ResultPointer {
    /// Creates a result pointer.
    #[must_use]
    pub fn new(test_id: impl Into<String>, metadata: TraceMetadata, trace_path: PathBuf) -> Self {
        Self {
            test_id: test_id.into(),
            metadata,
            trace_path,
        }
    }

    /// Identity of the test that produced the trace.
    #[must_use]
    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Run metadata read back from the trace when the test finished.
    #[must_use]
    pub fn metadata(&self) -> TraceMetadata {
        self.metadata
    }

    /// Location of the trace file.
    #[must_use]
    pub fn trace_path(&self) -> &Path {
        &self.trace_path
    }
}

/// The result pointers known to one coordinating process.
///
/// Every pointer recorded here is also written as a small JSON record into a metadata directory
/// shared by all processes of a test run. A process that executed no tests itself (because it
/// only dispatches work to workers) recovers the full set of results by scanning that directory.
#[derive(Debug)]
pub(crate) struct ResultRegistry {
    results: HashMap<String, ResultPointer>,
    metadata_dir: PathBuf,
}

impl ResultRegistry {
    pub(crate) fn new(metadata_dir: PathBuf) -> Self {
        Self {
            results: HashMap::new(),
            metadata_dir,
        }
    }

    /// Remembers the pointer in memory and persists it to the shared metadata directory.
    ///
    /// The pointer is remembered even if persisting it fails, in which case only other
    /// processes miss out on it.
    pub(crate) fn record(&mut self, pointer: ResultPointer) -> Result<()> {
        let persisted = self.persist(&pointer);

        self.results.insert(pointer.test_id.clone(), pointer);
        persisted
    }

    /// Writes the record to a temporary file first and renames it into place, so that a
    /// concurrent scan never observes a partially written record.
    fn persist(&self, pointer: &ResultPointer) -> Result<()> {
        let path = self.record_path(pointer);

        let mut file = NamedTempFile::new_in(&self.metadata_dir).map_err(|e| {
            Error::io(
                format!("cannot create result record in {}", self.metadata_dir.display()),
                e,
            )
        })?;

        serde_json::to_writer(&mut file, pointer).map_err(|e| Error::ResultRecord {
            path: path.clone(),
            source: e,
        })?;

        file.flush()
            .map_err(|e| Error::io(format!("cannot write {}", path.display()), e))?;

        file.persist(&path)
            .map_err(|e| Error::io(format!("cannot finalize {}", path.display()), e.error))?;

        debug!(test_id = pointer.test_id(), path = %path.display(), "recorded result");
        Ok(())
    }

    /// Trace file names are unique per test and process, so records named after them are too.
    fn record_path(&self, pointer: &ResultPointer) -> PathBuf {
        let file_name = pointer
            .trace_path
            .with_extension(METADATA_EXTENSION)
            .file_name()
            .map_or_else(
                || format!("{}.{METADATA_EXTENSION}", pointer.test_id),
                |name| name.to_string_lossy().into_owned(),
            );

        self.metadata_dir.join(file_name)
    }

    pub(crate) fn get(&self, test_id: &str) -> Option<&ResultPointer> {
        self.results.get(test_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub(crate) fn pointers(&self) -> impl Iterator<Item = &ResultPointer> {
        self.results.values()
    }

    /// Loads every record in the shared metadata directory, keyed by the test identity stored
    /// in the record. Returns the number of records loaded.
    ///
    /// Records that cannot be read or parsed are skipped with a warning.
    pub(crate) fn load_from_disk(&mut self) -> Result<usize> {
        let entries = fs::read_dir(&self.metadata_dir).map_err(|e| {
            Error::io(
                format!("cannot scan metadata directory {}", self.metadata_dir.display()),
                e,
            )
        })?;

        let mut paths = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.extension()
                    .is_some_and(|extension| extension == METADATA_EXTENSION)
            })
            .collect::<Vec<_>>();

        // Stable order, so that duplicate records of one test resolve the same way every time.
        paths.sort();

        let mut loaded = 0_usize;

        for path in paths {
            match read_record(&path) {
                Ok(pointer) => {
                    self.results.insert(pointer.test_id.clone(), pointer);
                    loaded = loaded.saturating_add(1);
                }
                Err(e) => warn!(error = %e, "skipping unreadable result record"),
            }
        }

        debug!(loaded, dir = %self.metadata_dir.display(), "loaded result records");
        Ok(loaded)
    }
}

fn read_record(path: &Path) -> Result<ResultPointer> {
    let bytes =
        fs::read(path).map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;

    serde_json::from_slice(&bytes).map_err(|e| Error::ResultRecord {
        path: path.to_path_buf(),
        source: e,
    })
}
