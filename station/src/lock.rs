//! Single-instance lock for a state root
//!
//! The lock is an exclusive advisory lock on `<state_root>/station.lock`, held
//! for the lifetime of [`RunLock`]. The file also records the holder's pid and
//! version so a second instance can say who is running.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info};

use crate::paths::StatePaths;

pub const VERSION: &str = env!("GIT_DESCRIBE");

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "another station is already running on this state root (pid {})",
        .pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
    )]
    AlreadyRunning { pid: Option<u32> },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking
    pub fn acquire(paths: &StatePaths) -> Result<Self, LockError> {
        let path = paths.lock_file();
        debug!(path = %path.display(), "RunLock::acquire: called");
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() || e.kind() == io::ErrorKind::WouldBlock {
                let pid = read_holder_pid(&mut file);
                debug!(?pid, "RunLock::acquire: lock is held");
                return Err(LockError::AlreadyRunning { pid });
            }
            return Err(io_err(e));
        }

        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{}\n{}", std::process::id(), VERSION).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        info!(path = %path.display(), pid = std::process::id(), "Acquired run lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "RunLock: releasing");
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.lines().next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails() {
        let temp = tempdir().unwrap();
        let paths = StatePaths::new(temp.path(), temp.path().join("cache"));

        let first = RunLock::acquire(&paths).unwrap();
        let err = RunLock::acquire(&paths).unwrap_err();
        match err {
            LockError::AlreadyRunning { pid } => assert_eq!(pid, Some(std::process::id())),
            other => panic!("unexpected error: {}", other),
        }

        // The holder is unaffected
        let contents = fs::read_to_string(first.path()).unwrap();
        assert!(contents.starts_with(&std::process::id().to_string()));
        assert!(contents.contains(VERSION));
    }

    #[test]
    fn test_released_on_drop() {
        let temp = tempdir().unwrap();
        let paths = StatePaths::new(temp.path().join("state"), temp.path().join("cache"));

        drop(RunLock::acquire(&paths).unwrap());
        assert!(RunLock::acquire(&paths).is_ok());
    }

    #[test]
    fn test_error_message_names_pid() {
        let err = LockError::AlreadyRunning { pid: Some(42) };
        assert!(err.to_string().contains("pid 42"));
        let err = LockError::AlreadyRunning { pid: None };
        assert!(err.to_string().contains("pid unknown"));
    }
}
