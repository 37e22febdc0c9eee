//! Where traces and result records live.

use std::fs;
use std::io;
use std::path::{self, Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::constants::{ERR_POISONED_LOCK, METADATA_DIR_NAME, RESULT_PATH_ENV_VAR, TRACE_EXTENSION};
use crate::pal::{Environment, EnvironmentFacade};
use crate::{Error, Result};

/// Owns the root directory of one session's traces and derives a path for each test's trace.
///
/// Two modes exist:
///
/// * Durable: traces go to a user-supplied directory under deterministic names derived from
///   the test identity and a session-wide prefix. A rerun of the same test overwrites its trace.
/// * Temporary: traces go to a temporary directory under random names. The session that creates
///   the directory publishes its location via an environment variable so that worker processes
///   started afterwards use the same root, and removes both the directory and the variable on
///   teardown. Sessions that found the variable already set by a parent process reuse the
///   directory but own nothing. A session that finds a root published by its own process
///   creates a private temporary root instead, because the publishing session may remove its
///   root while the other is still running.
#[derive(Debug)]
pub(crate) struct TraceStorage {
    root: PathBuf,
    metadata_dir: PathBuf,
    prefix: String,
    durable: bool,

    // Only set if this session created the temporary root and must clean it up.
    owned_temp_dir: Option<TempDir>,

    // Whether this session published `owned_temp_dir` via the environment variable.
    published: bool,

    environment: EnvironmentFacade,
}

impl TraceStorage {
    pub(crate) fn new(
        output_dir: Option<&Path>,
        prefix: Option<&str>,
        environment: EnvironmentFacade,
    ) -> Result<Self> {
        let (root, owned_temp_dir, published, durable) = if let Some(output_dir) = output_dir {
            (validate_output_dir(output_dir)?, None, false, true)
        } else {
            let mut published_here = PUBLISHED_ROOTS.lock().expect(ERR_POISONED_LOCK);

            let inherited = environment
                .var(RESULT_PATH_ENV_VAR)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from);

            match inherited {
                Some(root) if !published_here.contains(&root) => {
                    debug!(
                        root = %root.display(),
                        "reusing trace root published by parent process"
                    );
                    (root, None, false, false)
                }
                Some(_) => {
                    let temp_dir = create_temp_root()?;
                    debug!(
                        root = %temp_dir.path().display(),
                        "created private temporary trace root"
                    );
                    (temp_dir.path().to_path_buf(), Some(temp_dir), false, false)
                }
                None => {
                    let temp_dir = create_temp_root()?;

                    environment.set_var(RESULT_PATH_ENV_VAR, temp_dir.path());
                    published_here.push(temp_dir.path().to_path_buf());
                    debug!(root = %temp_dir.path().display(), "published temporary trace root");

                    (temp_dir.path().to_path_buf(), Some(temp_dir), true, false)
                }
            }
        };

        let metadata_dir = root.join(METADATA_DIR_NAME);
        fs::create_dir_all(&metadata_dir).map_err(|e| {
            Error::io(
                format!("cannot create metadata directory {}", metadata_dir.display()),
                e,
            )
        })?;

        Ok(Self {
            root,
            metadata_dir,
            prefix: prefix.map_or_else(random_token, str::to_string),
            durable,
            owned_temp_dir,
            published,
            environment,
        })
    }

    /// Computes the path of a new trace for the test with the given identity.
    ///
    /// In durable mode, any existing trace at that path is deleted first.
    pub(crate) fn trace_path(&self, test_id: &str) -> Result<PathBuf> {
        if !self.durable {
            return Ok(self
                .root
                .join(format!("{}.{TRACE_EXTENSION}", random_token())));
        }

        let path = self.root.join(format!(
            "{}-{}.{TRACE_EXTENSION}",
            self.prefix,
            file_name_for_test(test_id)
        ));

        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed trace of previous run"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::io(
                    format!("cannot remove previous trace {}", path.display()),
                    e,
                ));
            }
        }

        Ok(path)
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub(crate) fn prefix(&self) -> &str {
        &self.prefix
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.durable
    }

    /// Removes the temporary root and withdraws its published location, if this session
    /// created them. Does nothing on subsequent calls.
    pub(crate) fn close(&mut self) -> Result<()> {
        let Some(temp_dir) = self.owned_temp_dir.take() else {
            return Ok(());
        };

        if self.published {
            self.published = false;

            let mut published_here = PUBLISHED_ROOTS.lock().expect(ERR_POISONED_LOCK);
            published_here.retain(|root| root != temp_dir.path());
            self.environment.remove_var(RESULT_PATH_ENV_VAR);
        }

        let root = temp_dir.path().to_path_buf();
        temp_dir.close().map_err(|e| {
            Error::io(
                format!("cannot remove temporary trace directory {}", root.display()),
                e,
            )
        })
    }
}

impl Drop for TraceStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "trace storage cleanup failed");
        }
    }
}

/// Temporary roots published by sessions of this process that have not been closed yet.
///
/// Also serializes the environment updates made by sessions of this process.
static PUBLISHED_ROOTS: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

fn create_temp_root() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("alloc-limits-")
        .tempdir()
        .map_err(|e| Error::io("cannot create temporary trace directory", e))
}

/// Checks that the durable output directory is writable, creating it if missing.
///
/// Returns the absolute path of the directory.
pub(crate) fn validate_output_dir(dir: &Path) -> Result<PathBuf> {
    let folder = path::absolute(dir)
        .map_err(|e| Error::io(format!("cannot resolve {}", dir.display()), e))?;

    if folder.exists() {
        if !folder.is_dir() {
            return Err(output_directory_error(
                &folder,
                format!("{} must be a directory", folder.display()),
            ));
        }
    } else {
        fs::create_dir_all(&folder).map_err(|e| {
            output_directory_error(
                &folder,
                format!("cannot create directory {} due to {e}", folder.display()),
            )
        })?;
    }

    // Mode bits say nothing about ownership or read-only mounts, so we try to create a file.
    if let Err(e) = tempfile::tempfile_in(&folder) {
        debug!(path = %folder.display(), error = %e, "output directory rejected a file");
        return Err(output_directory_error(
            &folder,
            format!("{} is read-only", folder.display()),
        ));
    }

    Ok(folder)
}

fn output_directory_error(folder: &Path, problem: String) -> Error {
    Error::OutputDirectory {
        path: folder.to_path_buf(),
        problem,
    }
}

/// Turns a test identity into something usable as part of a file name.
fn file_name_for_test(test_id: &str) -> String {
    test_id
        .replace("::", "-")
        .replace([path::MAIN_SEPARATOR, '/'], "-")
}

/// A random 128-bit token in hexadecimal.
fn random_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::ffi::OsString;
    use std::sync::Arc;

    use super::*;
    use crate::pal::MockEnvironment;

    fn durable_storage(dir: &Path, prefix: &str) -> TraceStorage {
        TraceStorage::new(Some(dir), Some(prefix), EnvironmentFacade::target()).unwrap()
    }

    #[test]
    fn durable_names_are_derived_from_test_identity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = durable_storage(dir.path(), "run1");

        let path = storage.trace_path("tests/test_a.rs::test_b[1]").unwrap();

        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "run1-tests-test_a.rs-test_b[1].bin"
        );
        assert!(path.starts_with(dir.path()));
        assert!(storage.is_durable());
        assert!(storage.metadata_dir().is_dir());
    }

    #[test]
    fn durable_rerun_deletes_previous_trace() {
        let dir = tempfile::tempdir().unwrap();
        let storage = durable_storage(dir.path(), "run1");

        let first = storage.trace_path("test_a").unwrap();
        fs::write(&first, b"old trace").unwrap();

        let second = storage.trace_path("test_a").unwrap();

        assert_eq!(first, second);
        assert!(!second.exists());
    }

    #[test]
    fn default_prefix_is_random_token() {
        let dir = tempfile::tempdir().unwrap();
        let storage =
            TraceStorage::new(Some(dir.path()), None, EnvironmentFacade::target()).unwrap();

        assert_eq!(storage.prefix().len(), 32);
        assert!(storage.prefix().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn temporary_root_is_published_and_withdrawn_by_owner() {
        let mut env = MockEnvironment::new();
        env.expect_var()
            .withf(|name| name == RESULT_PATH_ENV_VAR)
            .times(1)
            .returning(|_| None);
        env.expect_set_var()
            .withf(|name, _| name == RESULT_PATH_ENV_VAR)
            .times(1)
            .return_const(());
        env.expect_remove_var()
            .withf(|name| name == RESULT_PATH_ENV_VAR)
            .times(1)
            .return_const(());

        let mut storage =
            TraceStorage::new(None, None, EnvironmentFacade::from_mock(env)).unwrap();
        let root = storage.root().to_path_buf();

        assert!(!storage.is_durable());
        assert!(root.is_dir());

        storage.close().unwrap();
        assert!(!root.exists());

        // Second close is a no-op, verified by the times(1) expectations above.
        storage.close().unwrap();
    }

    #[test]
    fn temporary_names_are_unique() {
        let mut env = MockEnvironment::new();
        env.expect_var().returning(|_| None);
        env.expect_set_var().return_const(());
        env.expect_remove_var().return_const(());

        let storage = TraceStorage::new(None, None, EnvironmentFacade::from_mock(env)).unwrap();

        let a = storage.trace_path("test_a").unwrap();
        let b = storage.trace_path("test_a").unwrap();

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(storage.root()));
    }

    #[test]
    fn published_root_is_reused_and_not_owned() {
        let shared = tempfile::tempdir().unwrap();
        let shared_path = OsString::from(shared.path());

        let mut env = MockEnvironment::new();
        env.expect_var().returning(move |_| Some(shared_path.clone()));
        env.expect_set_var().never();
        env.expect_remove_var().never();

        let mut storage =
            TraceStorage::new(None, None, EnvironmentFacade::from_mock(env)).unwrap();

        assert_eq!(storage.root(), shared.path());
        storage.close().unwrap();
        drop(storage);

        // The worker does not own the shared root, so it must survive the worker's teardown.
        assert!(shared.path().join(METADATA_DIR_NAME).is_dir());
    }

    #[test]
    fn root_published_by_same_process_is_not_adopted() {
        let published = Arc::new(Mutex::new(None::<OsString>));

        let mut first_env = MockEnvironment::new();
        first_env.expect_var().returning(|_| None);
        first_env.expect_set_var().times(1).returning({
            let published = Arc::clone(&published);
            move |_, value| *published.lock().unwrap() = Some(value.as_os_str().to_owned())
        });
        first_env.expect_remove_var().times(1).return_const(());

        let mut first =
            TraceStorage::new(None, None, EnvironmentFacade::from_mock(first_env)).unwrap();

        let mut second_env = MockEnvironment::new();
        second_env.expect_var().returning({
            let published = Arc::clone(&published);
            move |_| published.lock().unwrap().clone()
        });
        second_env.expect_set_var().never();
        second_env.expect_remove_var().never();

        let mut second =
            TraceStorage::new(None, None, EnvironmentFacade::from_mock(second_env)).unwrap();

        assert_ne!(first.root(), second.root());

        let second_root = second.root().to_path_buf();
        first.close().unwrap();

        // The first session's teardown leaves the second session's traces alone.
        assert!(second_root.join(METADATA_DIR_NAME).is_dir());

        second.close().unwrap();
        assert!(!second_root.exists());
    }

    #[test]
    fn output_dir_is_created_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        let validated = validate_output_dir(&nested).unwrap();

        assert!(validated.is_dir());
        assert!(validated.is_absolute());
    }

    #[test]
    fn output_dir_must_not_be_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a");
        fs::write(&file, "").unwrap();

        let error = validate_output_dir(&file).unwrap_err();

        assert!(error.to_string().ends_with("must be a directory"));
        assert!(error.is_configuration_error());
    }

    #[test]
    fn output_dir_must_be_writable() {
        let dir = tempfile::tempdir().unwrap();
        let mut permissions = fs::metadata(dir.path()).unwrap().permissions();
        permissions.set_readonly(true);
        fs::set_permissions(dir.path(), permissions.clone()).unwrap();

        // Privileged users can write regardless of the mode bits.
        let writable_anyway = fs::write(dir.path().join("check"), b"").is_ok();
        let result = validate_output_dir(dir.path());

        #[expect(
            clippy::permissions_set_readonly_false,
            reason = "restoring write access so the temporary directory can be removed"
        )]
        permissions.set_readonly(false);
        fs::set_permissions(dir.path(), permissions).unwrap();

        if writable_anyway {
            result.unwrap();
            return;
        }

        let error = result.unwrap_err();
        assert!(error.to_string().ends_with("is read-only"));
        assert!(error.is_configuration_error());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn output_dir_rejecting_files_is_read_only_despite_mode_bits() {
        // sysfs directories carry write bits for their owner but refuse new files, even for root.
        let dir = Path::new("/sys/kernel");
        if !dir.is_dir() {
            return;
        }

        let error = validate_output_dir(dir).unwrap_err();

        assert!(error.is_configuration_error());
        assert_eq!(error.to_string(), "/sys/kernel is read-only");
    }
}
