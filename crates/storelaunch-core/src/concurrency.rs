use crate::CoreError;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// How often a waiting launcher checks the lock again.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// A lock older than this is assumed to belong to a hung run and is taken over.
pub const LOCK_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Serializes launcher runs that share a working directory.
///
/// The lock file is created exclusively, held under an OS file lock for the
/// whole run, and records the owner pid and acquisition time. Dropping the
/// guard deletes the file, unless another run has since taken it over.
#[derive(Debug)]
pub struct ExecutionLock {
    path: PathBuf,
    file: File,
}

impl ExecutionLock {
    pub fn acquire(path: &Path) -> Result<Self, CoreError> {
        Self::acquire_with(path, LOCK_POLL_INTERVAL, LOCK_MAX_AGE)
    }

    pub fn acquire_with(
        path: &Path,
        poll_interval: Duration,
        max_age: Duration,
    ) -> Result<Self, CoreError> {
        let mut announced = false;
        loop {
            match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
                Ok(file) => return Self::claim(path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                // A deleted lock stays pending on Windows until its owner closes it.
                Err(e) if cfg!(windows) && e.kind() == ErrorKind::PermissionDenied => {}
                Err(e) => return Err(lock_error(path, &e)),
            }

            if Self::take_over_abandoned(path)? || Self::take_over_stale(path, max_age)? {
                continue;
            }

            if !announced {
                info!("waiting for another run to release {}", path.display());
                announced = true;
            }
            std::thread::sleep(poll_interval);
        }
    }

    fn claim(path: &Path, mut file: File) -> Result<Self, CoreError> {
        file.lock_exclusive().map_err(|e| lock_error(path, &e))?;
        let stamp = format!("{}\n{}\n", std::process::id(), Utc::now().to_rfc3339());
        file.write_all(stamp.as_bytes())?;
        file.flush()?;
        debug!("acquired {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// A lock file that records an owner but is not held by anyone was left
    /// behind by a run that died. An empty one may be mid-creation.
    ///
    /// The file is removed while still holding the OS lock that proved it
    /// abandoned, and only if the path still names that file.
    fn take_over_abandoned(path: &Path) -> Result<bool, CoreError> {
        let Ok(file) = OpenOptions::new().read(true).write(true).open(path) else {
            return Ok(false);
        };
        if file.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        let mut content = String::new();
        let recorded = (&file).read_to_string(&mut content).is_ok() && !content.trim().is_empty();
        let result = if recorded && same_file(&file, path) {
            warn!("taking over abandoned lock {}", path.display());
            remove_if_present(path).map(|()| true)
        } else {
            Ok(false)
        };
        let _ = file.unlock();
        result
    }

    fn take_over_stale(path: &Path, max_age: Duration) -> Result<bool, CoreError> {
        let Ok(file) = File::open(path) else {
            return Ok(false);
        };
        if !lock_age(&file).is_some_and(|age| age >= max_age) || !same_file(&file, path) {
            return Ok(false);
        }
        warn!(
            "lock {} is older than {}s; forcing takeover",
            path.display(),
            max_age.as_secs()
        );
        remove_if_present(path)?;
        Ok(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        if same_file(&self.file, &self.path) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("failed to remove lock {}: {e}", self.path.display());
            }
        } else {
            warn!(
                "lock {} was taken over by another run; leaving it in place",
                self.path.display()
            );
        }
        let _ = self.file.unlock();
    }
}

/// Whether `path` still names the open `file`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(open), Ok(named)) => open.dev() == named.dev() && open.ino() == named.ino(),
        _ => false,
    }
}

/// Whether `path` still names the open `file`.
///
/// A name cannot be reused while a handle to the file it named is open, even
/// once that file is deleted, so an existing path is the same file.
#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

/// Age of the lock: from its recorded acquisition time when readable, else
/// from the file's modification time.
fn lock_age(file: &File) -> Option<Duration> {
    let mut content = String::new();
    let mut reader = file;
    let recorded = reader
        .read_to_string(&mut content)
        .ok()
        .and_then(|_| content.lines().nth(1))
        .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
        .map(|t| SystemTime::from(t.with_timezone(&Utc)));
    let since = match recorded {
        Some(t) => t,
        None => file.metadata().and_then(|m| m.modified()).ok()?,
    };
    SystemTime::now().duration_since(since).ok()
}

fn remove_if_present(path: &Path) -> Result<(), CoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(lock_error(path, &e)),
    }
}

fn lock_error(path: &Path, e: &std::io::Error) -> CoreError {
    CoreError::Lock {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_records_owner_and_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appxExecution.lock");
        {
            let lock = ExecutionLock::acquire(&path).unwrap();
            assert_eq!(lock.path(), path);
            assert!(path.exists());
            let content = std::fs::read_to_string(&path).unwrap();
            let mut lines = content.lines();
            assert_eq!(lines.next().unwrap(), std::process::id().to_string());
            assert!(DateTime::parse_from_rfc3339(lines.next().unwrap()).is_ok());
        }
        assert!(!path.exists());
    }

    #[test]
    fn abandoned_lock_is_taken_over_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appxExecution.lock");
        std::fs::write(&path, format!("1\n{}\n", Utc::now().to_rfc3339())).unwrap();

        let lock =
            ExecutionLock::acquire_with(&path, Duration::from_secs(3600), LOCK_MAX_AGE).unwrap();
        drop(lock);
        assert!(!path.exists());
    }

    // On Windows the holder's open handle keeps the name pending, so a forced
    // takeover waits for the holder instead.
    #[cfg(unix)]
    #[test]
    fn stale_lock_is_taken_over_after_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appxExecution.lock");
        let holder = ExecutionLock::acquire(&path).unwrap();

        // The holder keeps its OS lock, so only the age rule can free it.
        let taken = std::thread::scope(|scope| {
            scope
                .spawn(|| ExecutionLock::acquire_with(&path, Duration::from_millis(10), Duration::ZERO))
                .join()
                .unwrap()
        })
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap().lines().next().unwrap(),
            std::process::id().to_string()
        );
        drop(taken);
        drop(holder);
    }

    #[cfg(unix)]
    #[test]
    fn old_holder_leaves_taken_over_lock_alone() {
        use std::os::unix::fs::MetadataExt;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appxExecution.lock");
        let holder = ExecutionLock::acquire(&path).unwrap();

        let taken = std::thread::scope(|scope| {
            scope
                .spawn(|| ExecutionLock::acquire_with(&path, Duration::from_millis(10), Duration::ZERO))
                .join()
                .unwrap()
        })
        .unwrap();
        let taken_ino = std::fs::metadata(&path).unwrap().ino();

        drop(holder);
        assert!(path.exists(), "old holder deleted the new holder's lock");
        assert_eq!(std::fs::metadata(&path).unwrap().ino(), taken_ino);

        let acquired = AtomicBool::new(false);
        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                let lock = ExecutionLock::acquire_with(&path, Duration::from_millis(10), LOCK_MAX_AGE);
                acquired.store(true, Ordering::SeqCst);
                lock
            });
            std::thread::sleep(Duration::from_millis(100));
            assert!(!acquired.load(Ordering::SeqCst), "a third run got in while the lock was held");
            drop(taken);
            let lock = waiter.join().unwrap().unwrap();
            assert!(acquired.load(Ordering::SeqCst));
            drop(lock);
        });
        assert!(!path.exists());
    }

    #[test]
    fn waiter_proceeds_once_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appxExecution.lock");
        let holder = ExecutionLock::acquire(&path).unwrap();

        std::thread::scope(|scope| {
            let waiter = scope.spawn(|| {
                ExecutionLock::acquire_with(&path, Duration::from_millis(10), LOCK_MAX_AGE)
            });
            std::thread::sleep(Duration::from_millis(100));
            drop(holder);
            let lock = waiter.join().unwrap().unwrap();
            assert!(lock.path().exists());
        });
    }
}
