//! Process-wide working-directory changes.
//!
//! The working directory is shared by every thread in the process, so any
//! temporary `chdir` must hold [`WORKDIR_LOCK`] from the change until the
//! original directory is restored.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use daos_csi_common::error::{CsiError, Result};

/// Serializes every temporary working-directory change in the process.
static WORKDIR_LOCK: Mutex<()> = Mutex::new(());

/// Holds the process in another working directory.
///
/// [`WorkdirGuard::restore`] returns to the captured directory and
/// reports failure; dropping without restoring makes a best-effort
/// attempt and logs the outcome.
#[derive(Debug)]
pub struct WorkdirGuard {
    previous: PathBuf,
    restored: bool,
    _lock: MutexGuard<'static, ()>,
}

impl WorkdirGuard {
    /// Locks the working directory and changes into `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Io`] if the current directory cannot be read or
    /// `dir` cannot be entered. The working directory is unchanged in that
    /// case.
    pub fn enter(dir: &Path) -> Result<Self> {
        let lock = WORKDIR_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = std::env::current_dir().map_err(|e| CsiError::Io {
            path: PathBuf::from("."),
            source: e,
        })?;
        std::env::set_current_dir(dir).map_err(|e| CsiError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        tracing::debug!(dir = %dir.display(), previous = %previous.display(), "changed working directory");
        Ok(Self {
            previous,
            restored: false,
            _lock: lock,
        })
    }

    /// Returns to the original working directory and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`CsiError::Io`] if the original directory cannot be
    /// re-entered.
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        std::env::set_current_dir(&self.previous).map_err(|e| CsiError::Io {
            path: self.previous.clone(),
            source: e,
        })
    }
}

impl Drop for WorkdirGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            tracing::error!(previous = %self.previous.display(), error = %e, "failed to restore working directory");
        }
    }
}

/// Runs `f` with `dir` as the working directory, then restores it.
///
/// An error from `f` takes precedence over a restore failure.
///
/// # Errors
///
/// Returns the error of entering `dir`, of `f`, or of restoring.
pub fn within<T>(dir: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let guard = WorkdirGuard::enter(dir)?;
    let value = f();
    let restored = guard.restore();
    let value = value?;
    restored?;
    Ok(value)
}
