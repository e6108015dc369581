//! Advisory lock guarding a status file
//!
//! Only one backup run may own a status file. The lock is an exclusive
//! `flock` on `<status>.lock`, held for the lifetime of the guard.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Held lock on a status file; released on drop
pub struct StatusLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl StatusLock {
    /// Lock file path for a status file
    pub fn lock_path(status_file: &Path) -> PathBuf {
        let mut name = status_file.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock without waiting
    pub fn acquire(status_file: &Path) -> Result<Self> {
        let path = Self::lock_path(status_file);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(Error::Locked(format!(
                    "{} (held by {})",
                    status_file.display(),
                    holder.trim()
                )));
            }
            Err((_, errno)) => {
                return Err(Error::Io(std::io::Error::from_raw_os_error(errno as i32)));
            }
        };

        let owner = format!(
            "{} pid {}\n",
            hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown-host".to_string()),
            std::process::id()
        );
        locked.set_len(0)?;
        locked.seek(SeekFrom::Start(0))?;
        locked.write_all(owner.as_bytes())?;
        locked.flush()?;

        debug!("Acquired status lock {}", path.display());
        Ok(StatusLock {
            path,
            _file: locked,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for StatusLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails() {
        let dir = TempDir::new().unwrap();
        let status = dir.path().join("status.txt");

        let first = StatusLock::acquire(&status).unwrap();
        assert!(first.path().exists());
        let contents = fs::read_to_string(first.path()).unwrap();
        assert!(contents.contains(&format!("pid {}", std::process::id())));

        assert!(matches!(
            StatusLock::acquire(&status),
            Err(Error::Locked(_))
        ));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let status = dir.path().join("status.txt");

        drop(StatusLock::acquire(&status).unwrap());
        assert!(StatusLock::acquire(&status).is_ok());
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            StatusLock::lock_path(Path::new("/x/status.txt")),
            PathBuf::from("/x/status.txt.lock")
        );
    }
}
