//! Advisory file lock guarding a cache directory across processes.
//!
//! Acquisition polls `try_lock_*` until a deadline so a stuck peer surfaces as
//! a [`LockError::Timeout`] naming the directory instead of a hang.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use taskstate_core::{HeldLock, LockError, LockMode};
use tracing::{debug, trace};

use super::LockHandle;

/// fs2-backed [`LockHandle`].
///
/// The lock file is created on first acquisition and kept afterwards; only
/// the advisory lock on it is taken and dropped.
#[derive(Debug)]
pub struct FileLockHandle {
    path: PathBuf,
    display_name: String,
    poll_interval: Duration,
    held: Option<(File, HeldLock)>,
}

impl FileLockHandle {
    pub fn new(path: impl Into<PathBuf>, display_name: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            display_name: display_name.into(),
            poll_interval,
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock_file(&self) -> Result<File, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, e: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
    match mode {
        LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        LockMode::Shared => FileExt::try_lock_shared(file),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockHandle for FileLockHandle {
    fn acquire(&mut self, mode: LockMode, timeout: Duration) -> Result<HeldLock, LockError> {
        if let Some((_, held)) = &self.held {
            if held.mode == mode {
                return Ok(held.clone());
            }
            self.release()?;
        }

        let file = self.open_lock_file()?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match try_lock(&file, mode) {
                Ok(()) => {
                    let held = HeldLock::new(&self.path, mode, Utc::now());
                    debug!(
                        lock = %self.path.display(),
                        mode = %mode,
                        attempts,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "acquired lock on {}",
                        self.display_name
                    );
                    self.held = Some((file, held.clone()));
                    return Ok(held);
                }
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout {
                            display_name: self.display_name.clone(),
                            lock_path: self.path.clone(),
                            waited: started.elapsed(),
                        });
                    }
                    trace!(lock = %self.path.display(), attempts, "lock contended, retrying");
                    thread::sleep(self.poll_interval.min(deadline - now));
                }
                Err(e) => return Err(self.io_error(e)),
            }
        }
    }

    fn release(&mut self) -> Result<(), LockError> {
        let Some((file, held)) = self.held.take() else {
            return Ok(());
        };
        FileExt::unlock(&file).map_err(|e| self.io_error(e))?;
        debug!(
            lock = %self.path.display(),
            held_ms = held.held_for(Utc::now()).as_millis() as u64,
            "released lock on {}",
            self.display_name
        );
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }

    fn mode(&self) -> Option<LockMode> {
        self.held.as_ref().map(|(_, held)| held.mode)
    }
}

impl Drop for FileLockHandle {
    fn drop(&mut self) {
        if let Some((file, _)) = self.held.take() {
            let _ = FileExt::unlock(&file);
        }
    }
}
