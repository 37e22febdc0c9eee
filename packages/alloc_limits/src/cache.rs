//! Storage for the per-test baselines that regression detection compares against.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::fs;
use std::hash::BuildHasher;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{Error, Result};

/// A key-value store that survives between test runs, holding the total bytes each test
/// allocated the last time it ran.
///
/// The memory ceiling policy reads the previous value of a test, then stores the new value,
/// on every evaluation.
pub trait BaselineCache: Debug + Send {
    /// The total bytes allocated by the test the last time it ran, if known.
    fn get(&self, test_id: &str) -> Option<u64>;

    /// Stores the total bytes allocated by the test in the current run.
    fn set(&mut self, test_id: &str, total_allocated: u64);

    /// Writes pending changes to durable storage.
    ///
    /// Called when the session ends. Caches that are not durable need not do anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the changes cannot be written.
    fn persist(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S> BaselineCache for HashMap<String, u64, S>
where
    S: BuildHasher + Debug + Send,
{
    fn get(&self, test_id: &str) -> Option<u64> {
        HashMap::get(self, test_id).copied()
    }

    fn set(&mut self, test_id: &str, total_allocated: u64) {
        self.insert(test_id.to_string(), total_allocated);
    }
}

/// A [`BaselineCache`] kept in a JSON file, so that baselines survive between test runs.
///
/// Changes are held in memory until [`persist()`](BaselineCache::persist) is called, which
/// replaces the file atomically.
#[derive(Debug)]
pub struct FileBaselineCache {
    path: PathBuf,
    entries: BTreeMap<String, u64>,
    dirty: bool,
}

impl FileBaselineCache {
    /// Opens the cache stored at `path`, starting empty if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or does not contain a valid cache.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::BaselineCache {
                path: path.clone(),
                source: e,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(Error::io(
                    format!("cannot read baseline cache {}", path.display()),
                    e,
                ));
            }
        };

        debug!(path = %path.display(), entries = entries.len(), "opened baseline cache");

        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    /// Location of the cache file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BaselineCache for FileBaselineCache {
    fn get(&self, test_id: &str) -> Option<u64> {
        self.entries.get(test_id).copied()
    }

    fn set(&mut self, test_id: &str, total_allocated: u64) {
        self.entries.insert(test_id.to_string(), total_allocated);
        self.dirty = true;
    }

    fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        fs::create_dir_all(dir)
            .map_err(|e| Error::io(format!("cannot create {}", dir.display()), e))?;

        let mut file = NamedTempFile::new_in(dir)
            .map_err(|e| Error::io(format!("cannot write baseline cache in {}", dir.display()), e))?;

        serde_json::to_writer_pretty(&mut file, &self.entries).map_err(|e| {
            Error::BaselineCache {
                path: self.path.clone(),
                source: e,
            }
        })?;

        file.flush()
            .map_err(|e| Error::io(format!("cannot write {}", self.path.display()), e))?;

        file.persist(&self.path)
            .map_err(|e| Error::io(format!("cannot finalize {}", self.path.display()), e.error))?;

        self.dirty = false;
        debug!(path = %self.path.display(), "persisted baseline cache");
        Ok(())
    }
}
