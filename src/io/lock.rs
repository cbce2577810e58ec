//! Exclusive ownership of a map directory.
//!
//! Two layers: a process-wide registry of bound directories, and a `LOCK`
//! file holding the owner's pid for other processes. A lock file whose
//! owner is gone is reclaimed.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{MapperError, Result, StorageError};

pub const LOCK_FILE: &str = "LOCK";

static BOUND: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

/// Held for as long as a session owns its directory. Released on drop.
#[derive(Debug)]
pub struct DirectoryLock {
    directory: PathBuf,
    lock_path: PathBuf,
}

impl DirectoryLock {
    /// Bind `directory`, creating it if needed.
    pub fn acquire(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory).map_err(|e| StorageError::io(directory, e))?;
        let directory = fs::canonicalize(directory).map_err(|e| StorageError::io(directory, e))?;
        let lock_path = directory.join(LOCK_FILE);
        let own_pid = std::process::id();

        let mut bound = BOUND.lock();
        if bound.contains(&directory) {
            return Err(MapperError::OwnershipConflict {
                directory,
                holder_pid: own_pid,
            });
        }

        // One retry after reclaiming a stale lock file.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    write!(file, "{own_pid}")
                        .and_then(|()| file.sync_all())
                        .map_err(|e| StorageError::io(&lock_path, e))?;
                    bound.insert(directory.clone());
                    debug!(directory = %directory.display(), "directory bound");
                    return Ok(Self {
                        directory,
                        lock_path,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_holder(&lock_path);
                    match holder {
                        Some(pid) if pid != own_pid && process_alive(pid) => {
                            return Err(MapperError::OwnershipConflict {
                                directory,
                                holder_pid: pid,
                            });
                        }
                        // Holder gone or unknown. Our own pid without a registry
                        // entry was leaked by an earlier session.
                        _ => {
                            warn!(
                                directory = %directory.display(),
                                holder = ?holder,
                                "reclaiming stale lock"
                            );
                            match fs::remove_file(&lock_path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(StorageError::io(&lock_path, e).into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(StorageError::io(&lock_path, e).into()),
            }
        }

        Err(MapperError::OwnershipConflict {
            holder_pid: read_holder(&lock_path).unwrap_or(0),
            directory,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "failed to remove lock file");
            }
        }
        BOUND.lock().remove(&self.directory);
        debug!(directory = %self.directory.display(), "directory released");
    }
}

fn read_holder(lock_path: &Path) -> Option<u32> {
    fs::read_to_string(lock_path).ok()?.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_bind_in_process_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let _first = DirectoryLock::acquire(dir.path()).unwrap();
        let err = DirectoryLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, MapperError::OwnershipConflict { .. }));
    }

    #[test]
    fn test_drop_releases_directory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let lock = DirectoryLock::acquire(dir.path()).unwrap();
            assert!(lock.directory().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        DirectoryLock::acquire(dir.path()).unwrap();
    }

    #[test]
    fn test_lock_held_by_live_process_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 always exists on Linux.
        fs::write(dir.path().join(LOCK_FILE), "1").unwrap();
        let err = DirectoryLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, MapperError::OwnershipConflict { holder_pid: 1, .. }));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE), "not a pid").unwrap();
        let lock = DirectoryLock::acquire(dir.path()).unwrap();
        let holder = read_holder(&lock.directory().join(LOCK_FILE));
        assert_eq!(holder, Some(std::process::id()));
    }
}
