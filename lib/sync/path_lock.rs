//! Per-path mutual exclusion driven by reference counting.
//!
//! [`PathLocks`] hands out one mutex per path. The table tracks how many callers currently hold
//! or wait on each path's mutex and drops the entry when that count reaches zero, so the table
//! only ever contains paths that somebody is actively working on.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use zip_reaper::sync::path_lock::PathLocks;
//!
//! let locks = PathLocks::new();
//! {
//!     let _guard = locks.lock(Path::new("/srv/app.jar"));
//!     assert_eq!(locks.len(), 1);
//! }
//! assert!(locks.is_empty());
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RawMutex, lock_api::ArcMutexGuard};
use rustc_hash::FxHashMap;

struct Slot {
    lock: Arc<Mutex<()>>,
    /// Number of live [`PathGuard`]s for this path, including ones still waiting on `lock`.
    users: usize,
}

/// A reference-counted table of per-path mutexes.
///
/// # Concurrency
///
/// All methods take `&self`. The table itself is guarded by a short-lived `parking_lot::Mutex`
/// that is never held while waiting on a per-path mutex.
#[derive(Default)]
pub struct PathLocks {
    table: Mutex<FxHashMap<PathBuf, Slot>>,
}

impl PathLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the mutex for `path` is acquired.
    ///
    /// The returned guard releases the mutex, and the table entry if it was the last user, when
    /// dropped.
    pub fn lock(&self, path: &Path) -> PathGuard<'_> {
        let lock = {
            let mut table = self.table.lock();
            let slot = table.entry(path.to_path_buf()).or_insert_with(|| Slot {
                lock: Arc::new(Mutex::new(())),
                users: 0,
            });
            slot.users += 1;
            Arc::clone(&slot.lock)
        };

        PathGuard {
            table: self,
            path: path.to_path_buf(),
            guard: Some(lock.lock_arc()),
        }
    }

    fn release(&self, path: &Path) {
        let mut table = self.table.lock();
        let Some(slot) = table.get_mut(path) else {
            return;
        };
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 {
            table.remove(path);
        }
    }

    /// Number of paths currently locked or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Returns `true` if no path is locked or waited on.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }
}

/// Exclusive hold on one path of a [`PathLocks`] table.
pub struct PathGuard<'a> {
    table: &'a PathLocks,
    path: PathBuf,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl PathGuard<'_> {
    /// The path this guard holds.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        // Unlock before touching the table so a waiter can proceed while we shrink it.
        drop(self.guard.take());
        self.table.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn guard_drop_removes_entry() {
        let locks = PathLocks::new();
        let guard = locks.lock(Path::new("/a.zip"));
        assert_eq!(locks.len(), 1, "locked path should be tracked");
        assert_eq!(guard.path(), Path::new("/a.zip"));
        drop(guard);
        assert!(locks.is_empty(), "table should shrink once unused");
    }

    #[test]
    fn distinct_paths_do_not_contend() {
        let locks = PathLocks::new();
        let _a = locks.lock(Path::new("/a.zip"));
        let _b = locks.lock(Path::new("/b.zip"));
        assert_eq!(locks.len(), 2);
    }

    #[test]
    fn same_path_is_serialized() {
        let locks = Arc::new(PathLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = locks.lock(Path::new("/shared.zip"));
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().is_ok(), "worker panicked");
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1, "holders must not overlap");
        assert!(locks.is_empty(), "all guards released");
    }
}
