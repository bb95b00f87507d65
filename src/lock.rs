use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Decides whether the process holding the lock is still alive
pub type LivenessProbe = fn(pid: u32) -> bool;

/// Cooperative mutual exclusion for scheduler ticks, keyed by a lock file
/// holding the owner's PID.
///
/// A tick that finds the lock held by a live process skips; a lock left
/// behind by a dead process is taken over. The liveness probe is injectable
/// so takeover is testable in isolation.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    probe: LivenessProbe,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            probe: process_alive,
        }
    }

    pub fn with_liveness_probe(path: impl Into<PathBuf>, probe: LivenessProbe) -> Self {
        Self {
            path: path.into(),
            probe,
        }
    }

    /// Try to take the lock. `None` means another live process holds it and
    /// this tick should be skipped; a stale lock is stolen.
    pub fn try_acquire(&self) -> io::Result<Option<FileLockGuard>> {
        // One retry after a steal; a second AlreadyExists means we lost the
        // race to a live competitor
        for _ in 0..2 {
            match self.create_lock_file() {
                Ok(guard) => return Ok(Some(guard)),
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    match self.owner_pid() {
                        Some(pid) if (self.probe)(pid) => {
                            tracing::info!(
                                "Tick lock {} held by live process {}; skipping",
                                self.path.display(),
                                pid
                            );
                            return Ok(None);
                        }
                        owner => {
                            tracing::warn!(
                                "Taking over stale tick lock {} (owner: {:?})",
                                self.path.display(),
                                owner
                            );
                            match fs::remove_file(&self.path) {
                                Ok(()) => {}
                                Err(error) if error.kind() == ErrorKind::NotFound => {}
                                Err(error) => return Err(error),
                            }
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    fn create_lock_file(&self) -> io::Result<FileLockGuard> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;
        Ok(FileLockGuard {
            path: self.path.clone(),
        })
    }

    /// PID recorded in the lock file; `None` (treated as stale) when the
    /// file vanished or holds garbage
    fn owner_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path)
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Releases the lock file when dropped
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            tracing::warn!(
                "Failed to release tick lock {}: {}",
                self.path.display(),
                error
            );
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 performs the permission checks without delivering anything
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness check; never steal
    true
}

#[cfg(test)]
mod tests {
    use claims::{assert_none, assert_some};

    use super::*;

    fn lock_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("courier.lock")
    }

    #[test]
    fn acquire_writes_own_pid_and_release_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(lock_path(&dir));

        let guard = assert_some!(lock.try_acquire().unwrap());
        let recorded = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(std::process::id().to_string(), recorded);

        drop(guard);
        assert!(!lock_path(&dir).exists());
    }

    #[test]
    fn lock_held_by_live_owner_skips_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(&dir), "4242").unwrap();

        let lock = FileLock::with_liveness_probe(lock_path(&dir), |_| true);

        assert_none!(lock.try_acquire().unwrap());
        // The foreign lock file is left alone
        assert!(lock_path(&dir).exists());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(&dir), "4242").unwrap();

        let lock = FileLock::with_liveness_probe(lock_path(&dir), |_| false);

        let guard = assert_some!(lock.try_acquire().unwrap());
        let recorded = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(std::process::id().to_string(), recorded);
        drop(guard);
    }

    #[test]
    fn garbage_lock_file_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(&dir), "not a pid").unwrap();

        let lock = FileLock::with_liveness_probe(lock_path(&dir), |_| true);

        assert_some!(lock.try_acquire().unwrap());
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FileLock::new(lock_path(&dir));

        drop(assert_some!(lock.try_acquire().unwrap()));
        assert_some!(lock.try_acquire().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
