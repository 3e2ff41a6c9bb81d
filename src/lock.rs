//! Cross-process advisory locking.
//!
//! Locks are taken on a sidecar `<db>.lock` file rather than on the data file,
//! because the data file is replaced by rename on every rewrite. Every guard
//! opens its own handle so independent guards never share lock state.

use crate::error::{Error, Result};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    timeout: Option<Duration>,
}

impl FileLock {
    /// Lock file living next to `data_path`. `timeout == None` waits indefinitely.
    pub fn for_data_file(data_path: &Path, timeout: Option<Duration>) -> Self {
        let mut name = data_path.as_os_str().to_owned();
        name.push(".lock");
        Self {
            path: PathBuf::from(name),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shared(&self) -> Result<LockGuard> {
        self.acquire(LockMode::Shared)
    }

    pub fn exclusive(&self) -> Result<LockGuard> {
        self.acquire(LockMode::Exclusive)
    }

    pub fn acquire(&self, mode: LockMode) -> Result<LockGuard> {
        let file = open_lock_file(&self.path)?;
        match self.timeout {
            None => {
                let locked = match mode {
                    LockMode::Shared => FileExt::lock_shared(&file),
                    LockMode::Exclusive => FileExt::lock_exclusive(&file),
                };
                locked.map_err(|err| {
                    Error::lock(format!("{mode:?} lock on {} failed: {err}", self.path.display()))
                })?;
            }
            Some(timeout) => self.poll(&file, mode, timeout)?,
        }
        Ok(LockGuard { file, mode })
    }

    fn poll(&self, file: &File, mode: LockMode, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(file),
            };
            match attempt {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    return Err(Error::lock(format!(
                        "{mode:?} lock on {} failed: {err}",
                        self.path.display()
                    )));
                }
            }

            let waited = start.elapsed();
            if waited >= timeout {
                tracing::warn!(
                    path = %self.path.display(),
                    mode = ?mode,
                    waited_ms = waited.as_millis(),
                    "gave up waiting for record store lock"
                );
                return Err(Error::LockTimeout {
                    path: self.path.display().to_string(),
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            std::thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(waited)));
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    Ok(opts.open(path)?)
}

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    mode: LockMode,
}

impl LockGuard {
    pub const fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
