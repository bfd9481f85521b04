//! Per-target-path operation locks.
//!
//! Acquisition never blocks: a caller that loses the race gets `false`
//! (or `None`) immediately and is expected to report `Aborted` so the
//! orchestrator retries later.
//!
//! Keys are normalized as paths, so `/a/b`, `/a/b/` and `/a//b` name the
//! same lock.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Set of target paths with an operation in flight.
#[derive(Debug, Default, Clone)]
pub struct VolumeLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl VolumeLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claims `key`. Returns `false` if it is already held.
    pub fn try_acquire(&self, key: &str) -> bool {
        let acquired = self.table().insert(normalize(key));
        tracing::trace!(key, acquired, "volume lock try-acquire");
        acquired
    }

    /// Releases `key`. Releasing a key that is not held is a no-op.
    pub fn release(&self, key: &str) {
        let _ = self.table().remove(&normalize(key));
        tracing::trace!(key, "volume lock released");
    }

    /// Claims `key` and returns a guard that releases it on drop.
    ///
    /// The guard owns a handle to the table, so it can outlive the borrow
    /// of `self` and be moved into a blocking task.
    pub fn lock(&self, key: &str) -> Option<VolumeLockGuard> {
        self.try_acquire(key).then(|| VolumeLockGuard {
            locks: self.clone(),
            key: normalize(key),
        })
    }

    /// Returns whether `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.table().contains(&normalize(key))
    }

    fn table(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set is consistent after every single insert/remove, so a
        // panic elsewhere cannot leave it half-updated.
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Canonical lock key of a path: separators collapsed, trailing slash and
/// `.` segments dropped.
fn normalize(key: &str) -> String {
    let normalized: PathBuf = Path::new(key).components().collect();
    let normalized = normalized.to_string_lossy();
    if normalized.is_empty() {
        key.to_string()
    } else {
        normalized.into_owned()
    }
}

/// Releases its key when dropped.
#[derive(Debug)]
pub struct VolumeLockGuard {
    locks: VolumeLocks,
    key: String,
}

impl VolumeLockGuard {
    /// The normalized locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("/a"));
        assert!(!locks.try_acquire("/a"));
        locks.release("/a");
        assert!(locks.try_acquire("/a"));
    }

    #[test]
    fn keys_are_independent() {
        let locks = VolumeLocks::new();
        assert!(locks.try_acquire("/a"));
        assert!(locks.try_acquire("/b"));
    }

    #[test]
    fn releasing_absent_key_is_noop() {
        let locks = VolumeLocks::new();
        locks.release("/never");
        locks.release("/never");
        assert!(locks.try_acquire("/never"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = VolumeLocks::new();
        {
            let guard = locks.lock("/a").expect("first lock");
            assert_eq!(guard.key(), "/a");
            assert!(locks.lock("/a").is_none());
            assert!(locks.is_held("/a"));
        }
        assert!(!locks.is_held("/a"));
    }

    #[test]
    fn equivalent_paths_share_a_lock() {
        let locks = VolumeLocks::new();
        let _guard = locks.lock("/pods/p1/v1/mount").expect("first lock");
        assert!(locks.lock("/pods/p1/v1/mount/").is_none());
        assert!(locks.lock("/pods//p1/./v1/mount").is_none());
        assert!(locks.is_held("/pods/p1/v1/mount/"));
        assert!(locks.lock("/pods/p1/v2/mount").is_some());
    }

    #[test]
    fn guard_outlives_table_borrow_across_threads() {
        let locks = VolumeLocks::new();
        let guard = locks.lock("/a").expect("lock");
        std::thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!locks.is_held("/a"));
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let locks = Arc::new(VolumeLocks::new());
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let _ = barrier.wait();
                    locks.try_acquire("/shared")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
