//! Per-archive state machine.
//!
//! ```text
//!                 open                         close (last)
//!  FullyClosed ----------> Open <-----> Open -------------> Pending
//!       ^                   ^   open / close (more remain)     |
//!       |                   |                                  |
//!       |                   +------------ open ----------------+
//!       |                                                      |
//!       +--------------------- full_close ---------------------+
//! ```
//!
//! Every other transition is an internal invariant violation and is rejected with
//! [`ReaperError::IllegalTransition`]. Callers serialize all transitions for one path through the
//! reaper's per-path lock; the record itself does no locking.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::{ArchiveProvider, FileStamp};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, Severity};
use crate::reaper::ReaperError;
use crate::reaper::pending::QueueKind;

/// Lifecycle state of an archive record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// At least one caller holds the archive open.
    Open,
    /// No caller holds the archive, but it is kept open awaiting reuse or expiry.
    Pending,
    /// The OS resource has been released.
    FullyClosed,
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Open => "OPEN",
            Self::Pending => "PENDING",
            Self::FullyClosed => "FULLY_CLOSED",
        })
    }
}

/// Counters and accumulated durations of one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordStats {
    /// Opens that had to open the OS resource.
    pub fresh_opens: u64,
    /// Opens that reused a pending archive.
    pub pend_to_open: u64,
    /// Opens of an archive that was already open.
    pub open_to_open: u64,
    /// Releases of the OS resource.
    pub full_closes: u64,
    /// Reopens forced by a size or modification time change.
    pub reopen_anomalies: u64,
    /// Outstanding opens discarded by a failed reopen or by shutdown.
    pub abandoned_opens: u64,
    /// Total time spent `Open`.
    pub open_time: Duration,
    /// Total time spent `Pending`.
    pub pend_time: Duration,
    /// Total time spent `FullyClosed` between uses.
    pub closed_time: Duration,
}

/// Outcome of a close transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOutcome {
    /// Other opens remain active.
    StillOpen,
    /// The last active open was closed; the record must join `queue`.
    Pended {
        /// Queue chosen by the expire-quickly classification.
        queue: QueueKind,
        /// Pend generation to re-validate against before fully closing.
        generation: u64,
    },
}

/// Point-in-time copy of a record, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    /// Archive path.
    pub path: PathBuf,
    /// Current state.
    pub state: RecordState,
    /// Total opens.
    pub open_count: u64,
    /// Total closes.
    pub close_count: u64,
    /// Whether the OS resource is held.
    pub holds_archive: bool,
    /// Stamp taken at the last (re)open.
    pub stamp: Option<FileStamp>,
    /// Classification chosen at the last pend.
    pub expire_quickly: bool,
    /// Number of times the record has entered `Pending`.
    pub pend_generation: u64,
    /// When the record was created.
    pub created_at: Instant,
    /// Most recent open.
    pub last_open_at: Option<Instant>,
    /// Open before the most recent one.
    pub second_last_open_at: Option<Instant>,
    /// Most recent entry into `Pending`.
    pub last_pend_at: Option<Instant>,
    /// Most recent full close.
    pub last_full_close_at: Option<Instant>,
    /// Set once shutdown finalized the record's statistics.
    pub finalized_at: Option<Instant>,
    /// Counters and durations.
    pub stats: RecordStats,
}

impl RecordSnapshot {
    /// Opens not yet matched by a close.
    #[must_use]
    pub fn active_opens(&self) -> u64 {
        self.open_count - self.close_count
    }
}

/// State and statistics of one archive path.
pub(crate) struct ArchiveRecord<A> {
    path: PathBuf,
    state: RecordState,
    open_count: u64,
    close_count: u64,
    archive: Option<Arc<A>>,
    stamp: Option<FileStamp>,
    expire_quickly: bool,
    pend_generation: u64,

    created_at: Instant,
    /// Start of the interval currently being accounted to `state`.
    state_since: Instant,
    last_open_at: Option<Instant>,
    second_last_open_at: Option<Instant>,
    last_pend_at: Option<Instant>,
    last_full_close_at: Option<Instant>,
    finalized_at: Option<Instant>,

    stats: RecordStats,
}

impl<A: Send + Sync + 'static> ArchiveRecord<A> {
    pub(crate) fn new(path: PathBuf, now: Instant) -> Self {
        Self {
            path,
            state: RecordState::FullyClosed,
            open_count: 0,
            close_count: 0,
            archive: None,
            stamp: None,
            expire_quickly: false,
            pend_generation: 0,
            created_at: now,
            state_since: now,
            last_open_at: None,
            second_last_open_at: None,
            last_pend_at: None,
            last_full_close_at: None,
            finalized_at: None,
            stats: RecordStats::default(),
        }
    }

    pub(crate) fn state(&self) -> RecordState {
        self.state
    }

    pub(crate) fn pend_generation(&self) -> u64 {
        self.pend_generation
    }

    pub(crate) fn open_count(&self) -> u64 {
        self.open_count
    }

    pub(crate) fn active_opens(&self) -> u64 {
        self.open_count - self.close_count
    }

    /// Charge the time since the last transition to the current state.
    fn settle(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.state_since);
        match self.state {
            RecordState::Open => self.stats.open_time += elapsed,
            RecordState::Pending => self.stats.pend_time += elapsed,
            // Time before the first open is not "closed between uses".
            RecordState::FullyClosed if self.open_count > 0 => self.stats.closed_time += elapsed,
            RecordState::FullyClosed => {}
        }
        self.state_since = now;
    }

    fn illegal(&self, action: &'static str) -> ReaperError {
        ReaperError::IllegalTransition {
            path: self.path.clone(),
            state: self.state,
            action,
        }
    }

    fn io_error(&self, source: io::Error) -> ReaperError {
        ReaperError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Open transition from any state. For a `Pending` record the caller must already have
    /// removed it from its pending queue.
    pub(crate) fn open<P>(
        &mut self,
        provider: &P,
        sink: &dyn DiagnosticSink,
        now: Instant,
    ) -> Result<Arc<A>, ReaperError>
    where
        P: ArchiveProvider<Archive = A>,
    {
        match self.state {
            RecordState::FullyClosed => {
                let stamp = provider.stamp(&self.path).map_err(|e| self.io_error(e))?;
                let archive = provider.open(&self.path).map_err(|e| self.io_error(e))?;
                self.settle(now);
                self.archive = Some(Arc::new(archive));
                self.stamp = Some(stamp);
                self.state = RecordState::Open;
                self.stats.fresh_opens += 1;
            }
            RecordState::Pending => {
                self.settle(now);
                self.state = RecordState::Open;
                self.reacquire(provider, sink, now)?;
                self.stats.pend_to_open += 1;
            }
            RecordState::Open => {
                self.settle(now);
                self.reacquire(provider, sink, now)?;
                self.stats.open_to_open += 1;
            }
        }

        self.open_count += 1;
        self.second_last_open_at = self.last_open_at;
        self.last_open_at = Some(now);

        match &self.archive {
            Some(archive) => Ok(Arc::clone(archive)),
            None => Err(self.illegal("open (no archive held)")),
        }
    }

    /// Re-validate the held archive against the file on disk, reopening it if the file changed.
    fn reacquire<P>(
        &mut self,
        provider: &P,
        sink: &dyn DiagnosticSink,
        now: Instant,
    ) -> Result<(), ReaperError>
    where
        P: ArchiveProvider<Archive = A>,
    {
        let current = match provider.stamp(&self.path) {
            Ok(stamp) => stamp,
            Err(e) => return Err(self.abandon(provider, sink, now, e)),
        };
        let Some(previous) = self.stamp else {
            self.stamp = Some(current);
            return Ok(());
        };
        if previous == current {
            return Ok(());
        }

        let active_opens = self.active_opens();
        sink.post(Diagnostic {
            severity: if active_opens > 0 {
                Severity::Warn
            } else {
                Severity::Debug
            },
            path: self.path.clone(),
            kind: DiagnosticKind::ArchiveChanged {
                previous,
                current,
                active_opens,
            },
        });
        self.stats.reopen_anomalies += 1;

        if let Some(stale) = self.archive.take()
            && let Err(e) = provider.close(&self.path, stale)
        {
            return Err(self.abandon(provider, sink, now, e));
        }
        match provider.open(&self.path) {
            Ok(fresh) => {
                self.archive = Some(Arc::new(fresh));
                self.stamp = Some(current);
                Ok(())
            }
            Err(e) => Err(self.abandon(provider, sink, now, e)),
        }
    }

    /// Force the record to `FullyClosed` after a failed reacquire, discarding outstanding opens.
    fn abandon<P>(
        &mut self,
        provider: &P,
        sink: &dyn DiagnosticSink,
        now: Instant,
        source: io::Error,
    ) -> ReaperError
    where
        P: ArchiveProvider<Archive = A>,
    {
        if let Some(archive) = self.archive.take() {
            // The reopen already failed; a second failure here changes nothing for the caller.
            let _ = provider.close(&self.path, archive);
        }
        self.settle(now);
        self.stats.abandoned_opens += self.active_opens();
        self.close_count = self.open_count;
        self.state = RecordState::FullyClosed;
        self.last_full_close_at = Some(now);
        self.stamp = None;

        sink.post(Diagnostic {
            severity: Severity::Warn,
            path: self.path.clone(),
            kind: DiagnosticKind::ReopenFailed {
                error: source.to_string(),
            },
        });
        self.io_error(source)
    }

    /// Whether the next pend should use the quick queue.
    ///
    /// A path opened only once expires quickly. Otherwise the gap between the two most recent
    /// opens decides: reopened within `slow_threshold` means quick.
    fn classify(&self, slow_threshold: Duration) -> bool {
        if self.open_count <= 1 {
            return true;
        }
        match (self.second_last_open_at, self.last_open_at) {
            (Some(prior), Some(last)) => last.saturating_duration_since(prior) < slow_threshold,
            _ => true,
        }
    }

    /// Close transition. Legal only while `Open`.
    pub(crate) fn close(
        &mut self,
        now: Instant,
        slow_threshold: Duration,
    ) -> Result<CloseOutcome, ReaperError> {
        if self.state != RecordState::Open {
            return Err(self.illegal("close"));
        }
        self.close_count += 1;
        if self.active_opens() > 0 {
            return Ok(CloseOutcome::StillOpen);
        }

        self.settle(now);
        self.state = RecordState::Pending;
        self.last_pend_at = Some(now);
        self.pend_generation += 1;
        self.expire_quickly = self.classify(slow_threshold);

        Ok(CloseOutcome::Pended {
            queue: if self.expire_quickly {
                QueueKind::Quick
            } else {
                QueueKind::Slow
            },
            generation: self.pend_generation,
        })
    }

    /// Full close transition. Legal only while `Pending`.
    ///
    /// The record is `FullyClosed` afterwards even if releasing the archive fails.
    pub(crate) fn full_close<P>(&mut self, provider: &P, now: Instant) -> Result<(), ReaperError>
    where
        P: ArchiveProvider<Archive = A>,
    {
        if self.state != RecordState::Pending {
            return Err(self.illegal("full close"));
        }
        self.settle(now);
        self.state = RecordState::FullyClosed;
        self.last_full_close_at = Some(now);
        self.stats.full_closes += 1;

        match self.archive.take() {
            Some(archive) => provider
                .close(&self.path, archive)
                .map_err(|e| self.io_error(e)),
            None => Ok(()),
        }
    }

    /// Shutdown path: close whatever is still held, regardless of outstanding opens.
    pub(crate) fn force_close<P>(&mut self, provider: &P, now: Instant) -> Result<(), ReaperError>
    where
        P: ArchiveProvider<Archive = A>,
    {
        match self.state {
            RecordState::FullyClosed => Ok(()),
            RecordState::Pending => self.full_close(provider, now),
            RecordState::Open => {
                // Behave as if every outstanding open had been closed.
                self.stats.abandoned_opens += self.active_opens();
                self.close_count = self.open_count;
                self.settle(now);
                self.state = RecordState::Pending;
                self.last_pend_at = Some(now);
                self.full_close(provider, now)
            }
        }
    }

    /// Freeze statistics at shutdown.
    pub(crate) fn finalize(&mut self, now: Instant) {
        if self.finalized_at.is_none() {
            self.settle(now);
            self.finalized_at = Some(now);
        }
    }

    pub(crate) fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            path: self.path.clone(),
            state: self.state,
            open_count: self.open_count,
            close_count: self.close_count,
            holds_archive: self.archive.is_some(),
            stamp: self.stamp,
            expire_quickly: self.expire_quickly,
            pend_generation: self.pend_generation,
            created_at: self.created_at,
            last_open_at: self.last_open_at,
            second_last_open_at: self.second_last_open_at,
            last_pend_at: self.last_pend_at,
            last_full_close_at: self.last_full_close_at,
            finalized_at: self.finalized_at,
            stats: self.stats.clone(),
        }
    }
}
