//! Delayed closing of archives.
//!
//! Opening an archive means reading its central directory, which is expensive enough that
//! closing it the instant its last user is done would waste that work whenever the same archive
//! is wanted again soon. The [`Reaper`] keeps archives open for a short pend window after their
//! last close, and a single scheduler thread fully closes whatever is not reopened in time.
//!
//! Records move between three registries:
//!
//! - the **active** registry holds every record that is `Open` or `Pending`;
//! - the **pending queues** hold the `Pending` ones, ordered by pend time;
//! - the **completed** registry remembers a bounded number of `FullyClosed` records so their
//!   statistics survive reuse.
//!
//! Locks are always taken in the order gate, path lock, record, pending queues. The scheduler
//! pulls ripe entries off the queues first and only then takes each entry's path lock, so it
//! never holds the queue lock while waiting for a path.

mod introspect;
mod pending;
mod record;
mod scheduler;

use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, error, trace};

use crate::archive::ArchiveProvider;
use crate::cache::ordered::{Capacity, OrderedStore, StoreError};
use crate::config::{ConfigError, ReaperConfig};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, Severity};
use crate::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::path_lock::PathLocks;
use crate::sync::{Mutex, lock};

pub use pending::QueueKind;
pub use record::{RecordSnapshot, RecordState, RecordStats};

use pending::{PendingEntry, PendingQueues};
use record::{ArchiveRecord, CloseOutcome};
use scheduler::Gate;

/// Errors surfaced by the reaper.
#[derive(Debug, Error)]
pub enum ReaperError {
    /// The reaper has been shut down.
    #[error("the reaper has been shut down")]
    CacheInactive,

    /// Opening, probing or closing an archive failed.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Archive path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A record was asked to make a transition its state does not allow.
    #[error("illegal {action} of {} in state {state}", .path.display())]
    IllegalTransition {
        /// Archive path.
        path: PathBuf,
        /// State the record was in.
        state: RecordState,
        /// Attempted transition.
        action: &'static str,
    },

    /// A pending queue rejected an insertion.
    #[error("pending queue corrupted: {0}")]
    Store(#[from] StoreError),

    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The scheduler thread could not be started.
    #[error("failed to spawn the reaper scheduler: {0}")]
    Spawn(#[source] io::Error),
}

type SharedRecord<A> = Arc<Mutex<ArchiveRecord<A>>>;

/// Reaper-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    /// Successful opens.
    pub opens: u64,
    /// Successful closes.
    pub closes: u64,
    /// Closes with no matching open.
    pub misuses: u64,
    /// Pending archives pushed out of a full queue.
    pub evictions: u64,
    /// Archives fully closed by the scheduler.
    pub reaped: u64,
    /// Scheduler passes.
    pub passes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicU64,
    closes: AtomicU64,
    misuses: AtomicU64,
    evictions: AtomicU64,
    reaped: AtomicU64,
    passes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReaperStats {
        ReaperStats {
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            misuses: self.misuses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the public [`Reaper`] and its scheduler thread.
pub(crate) struct ReaperInner<P: ArchiveProvider> {
    provider: P,
    sink: Arc<dyn DiagnosticSink>,
    config: ReaperConfig,
    completed_capacity: Capacity,
    started_at: Instant,
    active: AtomicBool,
    gate: Gate,
    path_locks: PathLocks,
    records: scc::HashMap<PathBuf, SharedRecord<P::Archive>>,
    pending: Mutex<PendingQueues>,
    completed: Mutex<OrderedStore<PathBuf, SharedRecord<P::Archive>>>,
    finalized: Mutex<FxHashMap<PathBuf, SharedRecord<P::Archive>>>,
    counters: Counters,
}

impl<P: ArchiveProvider> ReaperInner<P> {
    fn lookup(&self, path: &Path) -> Option<SharedRecord<P::Archive>> {
        self.records.read_sync(path, |_, record| Arc::clone(record))
    }

    /// The active record for `path`, reviving a completed one or creating a fresh one.
    ///
    /// Must be called under `path`'s path lock.
    fn resolve(&self, path: &Path, now: Instant) -> SharedRecord<P::Archive> {
        if let Some(record) = self.lookup(path) {
            return record;
        }

        let revived = lock(&self.completed).remove(&path.to_path_buf());
        let record = match revived {
            Some(record) => {
                trace!(path = %path.display(), "Reviving completed record.");
                record
            }
            None => Arc::new(Mutex::new(ArchiveRecord::new(path.to_path_buf(), now))),
        };
        // The path lock guarantees no concurrent insert for this key.
        let _ = self
            .records
            .insert_sync(path.to_path_buf(), Arc::clone(&record));
        record
    }

    /// Move a fully closed record out of the active registry.
    ///
    /// Must be called under `path`'s path lock.
    fn retire(&self, path: &Path, record: SharedRecord<P::Archive>, now: Instant) {
        self.records.remove_sync(path);

        if !self.active.load(Ordering::Acquire) {
            lock(&record).finalize(now);
            lock(&self.finalized).insert(path.to_path_buf(), record);
            return;
        }
        // A record whose very first open failed has no history worth keeping.
        if lock(&record).open_count() == 0 {
            return;
        }

        // `resolve` takes records out of the completed registry before reusing them, so the
        // key cannot already be present.
        let pushed = lock(&self.completed).push_back_bounded(
            path.to_path_buf(),
            record,
            self.completed_capacity,
        );
        match pushed {
            Ok(Some((forgotten, _))) => {
                trace!(path = %forgotten.display(), "Forgot oldest completed record.");
            }
            Ok(None) => {}
            Err(e) => {
                error!(path = %path.display(), error = %e, "Completed registry corrupted.");
            }
        }
    }

    fn misuse(&self, path: &Path) {
        Counters::bump(&self.counters.misuses);
        self.sink.post(Diagnostic {
            severity: Severity::Debug,
            path: path.to_path_buf(),
            kind: DiagnosticKind::CloseWithoutOpen,
        });
    }

    fn note_pass(&self) {
        Counters::bump(&self.counters.passes);
    }

    fn ripest(&self, now: Instant) -> Option<Duration> {
        lock(&self.pending).ripest(now)
    }

    fn open(&self, path: &Path) -> Result<Arc<P::Archive>, ReaperError> {
        let _read = self.gate.read();
        if !self.active.load(Ordering::Acquire) {
            return Err(ReaperError::CacheInactive);
        }
        let now = Instant::now();
        let _path = self.path_locks.lock(path);
        let shared = self.resolve(path, now);
        let mut record = lock(&shared);

        if record.state() == RecordState::Pending && lock(&self.pending).remove(path).is_none() {
            // An eviction has dequeued this record but not yet closed it. Once reopened the
            // record is no longer `Pending`, so the eviction gives up.
            trace!(path = %path.display(), "Reopening archive with an eviction in flight.");
        }

        match record.open(&self.provider, &*self.sink, now) {
            Ok(archive) => {
                Counters::bump(&self.counters.opens);
                Ok(archive)
            }
            Err(e) => {
                if record.state() == RecordState::FullyClosed {
                    drop(record);
                    self.retire(path, shared, now);
                }
                Err(e)
            }
        }
    }

    fn close(&self, path: &Path) -> Result<(), ReaperError> {
        let _read = self.gate.read();
        let now = Instant::now();

        let evicted = {
            let _path = self.path_locks.lock(path);
            let Some(shared) = self.lookup(path) else {
                self.misuse(path);
                return Ok(());
            };
            let mut record = lock(&shared);
            if record.state() != RecordState::Open {
                drop(record);
                self.misuse(path);
                return Ok(());
            }

            match record.close(now, self.config.slow_pend_min)? {
                CloseOutcome::StillOpen => None,
                CloseOutcome::Pended { queue, generation } => {
                    let insertion = lock(&self.pending).insert(
                        queue,
                        path.to_path_buf(),
                        PendingEntry {
                            pended_at: now,
                            generation,
                        },
                    )?;
                    if insertion.wake {
                        self.gate.wake();
                    }
                    insertion.evicted
                }
            }
        };
        Counters::bump(&self.counters.closes);

        if let Some((evicted, entry)) = evicted {
            Counters::bump(&self.counters.evictions);
            trace!(path = %evicted.display(), "Evicting pending archive from a full queue.");
            self.full_close_if_current(&evicted, entry, now);
        }
        Ok(())
    }

    /// Fully close `path` if it is still the pending record that `entry` was queued for.
    ///
    /// Returns `true` if the archive was closed.
    fn full_close_if_current(&self, path: &Path, entry: PendingEntry, now: Instant) -> bool {
        let result = {
            let _path = self.path_locks.lock(path);
            let Some(shared) = self.lookup(path) else {
                return false;
            };
            let mut record = lock(&shared);
            if record.state() != RecordState::Pending
                || record.pend_generation() != entry.generation
            {
                return false;
            }
            let result = record.full_close(&self.provider, now);
            drop(record);
            self.retire(path, shared, now);
            result
        };

        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "Failed to close archive.");
        }
        true
    }

    /// One scheduler pass over ripe entries. Returns the next delay to arm.
    fn reap(&self, now: Instant) -> Option<Duration> {
        let (ripe, next) = lock(&self.pending).take_ripe(now);
        let mut closed = 0_usize;
        for (path, entry) in ripe {
            if self.full_close_if_current(&path, entry, now) {
                Counters::bump(&self.counters.reaped);
                closed += 1;
            }
        }
        trace!(closed, ?next, "Reap pass finished.");
        next
    }

    /// Final pass: close everything and freeze statistics.
    fn shutdown_pass(&self, now: Instant) {
        self.active.store(false, Ordering::Release);

        let queued = lock(&self.pending).drain_all();
        let mut closed = 0_usize;
        for (path, entry) in queued {
            if self.full_close_if_current(&path, entry, now) {
                closed += 1;
            }
        }

        let mut remaining = Vec::new();
        self.records.iter_sync(|path, _| {
            remaining.push(path.clone());
            true
        });
        for path in remaining {
            let _path = self.path_locks.lock(&path);
            let Some((_, shared)) = self.records.remove_sync(&path) else {
                continue;
            };
            let result = {
                let mut record = lock(&shared);
                let result = record.force_close(&self.provider, now);
                record.finalize(now);
                result
            };
            if let Err(e) = result {
                error!(path = %path.display(), error = %e, "Failed to close archive at shutdown.");
            }
            lock(&self.finalized).insert(path, shared);
            closed += 1;
        }

        let completed: Vec<_> = lock(&self.completed).drain().collect();
        let mut finalized = lock(&self.finalized);
        for (path, record) in completed {
            lock(&record).finalize(now);
            finalized.insert(path, record);
        }
        debug!(closed, records = finalized.len(), "Reaper shut down.");
    }

    fn find(&self, path: &Path) -> Option<SharedRecord<P::Archive>> {
        if let Some(record) = self.lookup(path) {
            return Some(record);
        }
        if let Some(record) = lock(&self.completed).get(&path.to_path_buf()) {
            return Some(Arc::clone(record));
        }
        lock(&self.finalized).get(path).map(Arc::clone)
    }
}

/// Keeps recently closed archives open for reuse and closes them in the background.
///
/// Every [`open`](Self::open) must be balanced by a [`close`](Self::close) of the same path.
/// Dropping the reaper shuts it down.
pub struct Reaper<P: ArchiveProvider> {
    inner: Arc<ReaperInner<P>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P: ArchiveProvider> Reaper<P> {
    /// Validate `config` and start the scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns [`ReaperError::Config`] for an invalid configuration and [`ReaperError::Spawn`]
    /// if the scheduler thread cannot be started.
    pub fn new(
        provider: P,
        config: ReaperConfig,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ReaperError> {
        config.validate().map_err(ConfigError::Invalid)?;

        let inner = Arc::new(ReaperInner {
            provider,
            sink,
            pending: Mutex::new(PendingQueues::new(&config)),
            completed_capacity: NonZeroUsize::new(config.completed_max)
                .map_or(Capacity::Unbounded, Capacity::Bounded),
            config,
            started_at: Instant::now(),
            active: AtomicBool::new(true),
            gate: Gate::default(),
            path_locks: PathLocks::new(),
            records: scc::HashMap::new(),
            completed: Mutex::new(OrderedStore::new()),
            finalized: Mutex::new(FxHashMap::default()),
            counters: Counters::default(),
        });

        let worker = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("zip-reaper".to_owned())
                .spawn(move || scheduler::run(&inner))
                .map_err(ReaperError::Spawn)?
        };

        debug!(config = ?inner.config, "Reaper started.");
        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Open `path`, reusing the archive if it is open or pending.
    ///
    /// If the file's size or modification time changed since the archive was opened, the stale
    /// archive is closed and a fresh one returned.
    ///
    /// # Errors
    ///
    /// Returns [`ReaperError::CacheInactive`] after shutdown and [`ReaperError::Io`] if the
    /// archive cannot be opened or reopened. A failed reopen discards the path's outstanding
    /// opens.
    pub fn open(&self, path: &Path) -> Result<Arc<P::Archive>, ReaperError> {
        self.inner.open(path).inspect_err(|e| {
            if matches!(e, ReaperError::IllegalTransition { .. }) {
                error!(path = %path.display(), error = %e, "Reaper invariant violated.");
            }
        })
    }

    /// Release one open of `path`.
    ///
    /// Closing a path with no outstanding opens is reported as a diagnostic and otherwise
    /// ignored.
    ///
    /// # Errors
    ///
    /// Only internal invariant violations are returned. A failure to close an archive evicted
    /// from a full queue is logged, not returned.
    pub fn close(&self, path: &Path) -> Result<(), ReaperError> {
        self.inner.close(path).inspect_err(|e| {
            error!(path = %path.display(), error = %e, "Reaper invariant violated.");
        })
    }

    /// Stop accepting opens, close every archive and stop the scheduler. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };
        self.inner.gate.request_shutdown();
        if worker.join().is_err() {
            error!("Reaper scheduler panicked.");
        }
    }

    /// Whether opens are still accepted.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// The provider archives are opened with.
    #[must_use]
    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    /// The configuration the reaper runs with.
    #[must_use]
    pub fn config(&self) -> &ReaperConfig {
        &self.inner.config
    }

    /// Current state of `path`, if the reaper knows it.
    #[must_use]
    pub fn state(&self, path: &Path) -> Option<RecordState> {
        self.snapshot(path).map(|snapshot| snapshot.state)
    }

    /// Copy of `path`'s record from the active, completed or finalized registry.
    #[must_use]
    pub fn snapshot(&self, path: &Path) -> Option<RecordSnapshot> {
        self.inner
            .find(path)
            .map(|record| lock(&record).snapshot())
    }

    /// Number of archives in `queue`.
    #[must_use]
    pub fn pending_len(&self, queue: QueueKind) -> usize {
        lock(&self.inner.pending).len(queue)
    }

    /// Number of records that are `Open` or `Pending`.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.inner.records.len()
    }

    /// Reaper-wide counters.
    #[must_use]
    pub fn stats(&self) -> ReaperStats {
        self.inner.counters.snapshot()
    }

    /// Human-readable dump of the reaper and every record it knows.
    #[must_use]
    pub fn introspect(&self) -> String {
        introspect::render(&self.inner)
    }
}

impl<P: ArchiveProvider> Drop for Reaper<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<P: ArchiveProvider> std::fmt::Debug for Reaper<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaper")
            .field("active", &self.is_active())
            .field("records", &self.active_len())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    #[derive(Default)]
    struct Counting {
        opens: StdAtomicU64,
        closes: StdAtomicU64,
    }

    impl ArchiveProvider for Counting {
        type Archive = u64;

        fn open(&self, _path: &Path) -> io::Result<u64> {
            Ok(self.opens.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _path: &Path, _archive: Arc<u64>) -> io::Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stamp(&self, _path: &Path) -> io::Result<crate::archive::FileStamp> {
            Ok(crate::archive::FileStamp {
                len: 0,
                modified: None,
            })
        }
    }

    struct Discard;

    impl DiagnosticSink for Discard {
        fn post(&self, _diagnostic: Diagnostic) {}
    }

    fn reaper() -> Reaper<Counting> {
        Reaper::new(
            Counting::default(),
            ReaperConfig {
                quick_pend_min: Duration::from_secs(60),
                quick_pend_max: Duration::from_secs(61),
                slow_pend_min: Duration::from_secs(120),
                slow_pend_max: Duration::from_secs(121),
                ..ReaperConfig::default()
            },
            Arc::new(Discard),
        )
        .unwrap()
    }

    #[test]
    fn eviction_gives_up_on_reopened_record() {
        let reaper = reaper();
        let b = Path::new("/b.zip");
        reaper.open(b).unwrap();
        reaper.close(b).unwrap();

        // Dequeued as an eviction, but reopened before the eviction closes it.
        let (_, entry) = lock(&reaper.inner.pending).remove(b).unwrap();
        reaper.open(b).unwrap();

        assert!(!reaper.inner.full_close_if_current(b, entry, Instant::now()));
        assert_eq!(reaper.state(b), Some(RecordState::Open));
        assert_eq!(reaper.provider().closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn eviction_gives_up_on_repended_record() {
        let reaper = reaper();
        let b = Path::new("/b.zip");
        reaper.open(b).unwrap();
        reaper.close(b).unwrap();

        let (_, stale) = lock(&reaper.inner.pending).remove(b).unwrap();
        reaper.open(b).unwrap();
        reaper.close(b).unwrap();

        // Pending again, but under a newer generation than the dequeued entry.
        assert!(!reaper.inner.full_close_if_current(b, stale, Instant::now()));
        assert_eq!(reaper.state(b), Some(RecordState::Pending));
        assert_eq!(reaper.pending_len(QueueKind::Quick), 1);

        let (_, current) = lock(&reaper.inner.pending).remove(b).unwrap();
        assert!(reaper.inner.full_close_if_current(b, current, Instant::now()));
        assert_eq!(reaper.state(b), Some(RecordState::FullyClosed));
        assert_eq!(reaper.provider().closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retire_over_duplicate_completed_entry_keeps_registry_intact() {
        let reaper = reaper();
        let a = Path::new("/a.zip");
        reaper.open(a).unwrap();
        reaper.close(a).unwrap();
        let (_, entry) = lock(&reaper.inner.pending).remove(a).unwrap();
        assert!(reaper.inner.full_close_if_current(a, entry, Instant::now()));
        assert_eq!(lock(&reaper.inner.completed).len(), 1);

        // A second record under the same path collides with the completed one.
        let duplicate = Arc::new(Mutex::new(ArchiveRecord::new(a.to_path_buf(), Instant::now())));
        lock(&duplicate).open(&Counting::default(), &Discard, Instant::now()).unwrap();
        reaper.inner.retire(a, duplicate, Instant::now());

        assert_eq!(lock(&reaper.inner.completed).len(), 1);
        assert_eq!(reaper.state(a), Some(RecordState::FullyClosed));
    }
}
