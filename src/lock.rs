//! Lease lock on a file in the backup root. One mutating operation (backup,
//! restore, deploy) at a time.
//!
//! The lease is an advisory `flock` held on an open descriptor, so the kernel
//! drops it when the owning process exits, however it exits. The file carries
//! the owner's PID for error messages only; it is never deleted, which keeps
//! every process locking the same inode.

use crate::error::ErrorClass;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const LOCK_FILE_NAME: &str = ".printhub-ops.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Another printhub-ops operation is running ({owner}, lock {path})")]
    Held { owner: String, path: PathBuf },

    #[error("Lock file {path} error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LockError::Held { .. } => ErrorClass::State,
            LockError::Io { .. } => ErrorClass::Configuration,
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Held for as long as the value lives.
#[derive(Debug)]
pub struct LeaseLock {
    path: PathBuf,
    file: File,
}

impl LeaseLock {
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(LOCK_FILE_NAME)
    }

    /// Take the lock in `dir`, creating the directory if needed. Never
    /// blocks: a held lock is `LockError::Held`.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = Self::path_in(dir);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        // A retry covers the file being replaced between open and lock.
        for _ in 0..3 {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(io_err)?;

            if !try_lock_exclusive(&file).map_err(io_err)? {
                let owner = match read_owner(&path) {
                    Some(pid) => format!("PID {pid}"),
                    None => "owner starting up".to_string(),
                };
                return Err(LockError::Held { owner, path });
            }

            if !same_file(&file, &path) {
                debug!("{} was replaced while locking, retrying", path.display());
                continue;
            }

            file.set_len(0).map_err(io_err)?;
            file.seek(SeekFrom::Start(0)).map_err(io_err)?;
            write!(file, "{}", std::process::id()).map_err(io_err)?;
            file.flush().map_err(io_err)?;

            debug!("Acquired {}", path.display());
            return Ok(Self { path, file });
        }

        Err(LockError::Held {
            owner: "another process replacing the lock file".to_string(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        // Clear the owner; closing the descriptor releases the lease.
        match self.file.set_len(0) {
            Ok(()) => info!("Released {}", self.path.display()),
            Err(e) => warn!("Could not clear lock {}: {}", self.path.display(), e),
        }
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// `Ok(false)` when another descriptor holds the lock.
#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(e)) => Err(e),
    }
}

/// Whether `path` still names the inode behind `file`.
#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_refused_while_held() {
        let dir = TempDir::new().unwrap();
        let lock = LeaseLock::acquire(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );

        let err = LeaseLock::acquire(dir.path()).unwrap_err();
        assert!(err.to_string().contains(&format!("PID {}", std::process::id())));
        assert_eq!(err.class(), ErrorClass::State);

        drop(lock);
        assert_eq!(
            fs::read_to_string(LeaseLock::path_in(dir.path())).unwrap(),
            ""
        );
        assert!(LeaseLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_leftover_file_without_a_lease_is_taken_over() {
        let dir = TempDir::new().unwrap();
        // A crashed run leaves its PID behind but no lease
        fs::write(LeaseLock::path_in(dir.path()), "999999999").unwrap();
        let lock = LeaseLock::acquire(dir.path()).unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_lease_without_owner_pid_is_still_held() {
        let dir = TempDir::new().unwrap();
        let path = LeaseLock::path_in(dir.path());

        // Another process that has locked the file but not written its PID yet
        let starting = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        assert!(try_lock_exclusive(&starting).unwrap());

        let err = LeaseLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
        assert!(path.exists());

        drop(starting);
        assert!(LeaseLock::acquire(dir.path()).is_ok());
    }
}
