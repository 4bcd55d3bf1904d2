//! The quick and slow pending queues.
//!
//! A pended archive sits in exactly one queue, ordered by the time it was pended. An entry
//! becomes ripe once it has been pending for its queue's `pend_min`, and the scheduler is armed
//! for the moment the ripest queue head matures. Every ripe entry at the head of a queue is
//! reaped in the same pass.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::cache::ordered::{Capacity, OrderedStore, StoreError};
use crate::config::ReaperConfig;

/// Which pending queue an archive joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Archives opened once, or reopened within the slow threshold.
    Quick,
    /// Archives reopened at a slower cadence.
    Slow,
}

/// A queued archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingEntry {
    pub pended_at: Instant,
    /// Pend generation of the record at queue time; a mismatch means the entry is stale.
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    min: Duration,
}

impl Window {
    /// Time until an entry pended at `pended_at` ripens, zero if already ripe.
    fn remaining(self, pended_at: Instant, now: Instant) -> Duration {
        self.min
            .saturating_sub(now.saturating_duration_since(pended_at))
    }
}

/// Result of queueing an archive.
#[derive(Debug)]
pub(crate) struct Insertion {
    /// Entry pushed out by the capacity bound; the caller must fully close it.
    pub evicted: Option<(PathBuf, PendingEntry)>,
    /// Whether the scheduler's current deadline may be too late for the new entry.
    pub wake: bool,
}

/// Both pending queues with their windows. The capacity bound applies to each queue.
#[derive(Debug)]
pub(crate) struct PendingQueues {
    quick: OrderedStore<PathBuf, PendingEntry>,
    slow: OrderedStore<PathBuf, PendingEntry>,
    quick_window: Window,
    slow_window: Window,
    capacity: Capacity,
}

impl PendingQueues {
    pub(crate) fn new(config: &ReaperConfig) -> Self {
        Self {
            quick: OrderedStore::new(),
            slow: OrderedStore::new(),
            quick_window: Window {
                min: config.quick_pend_min,
            },
            slow_window: Window {
                min: config.slow_pend_min,
            },
            capacity: config.pending_capacity(),
        }
    }

    fn queue(&self, kind: QueueKind) -> &OrderedStore<PathBuf, PendingEntry> {
        match kind {
            QueueKind::Quick => &self.quick,
            QueueKind::Slow => &self.slow,
        }
    }

    pub(crate) fn len(&self, kind: QueueKind) -> usize {
        self.queue(kind).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.quick.is_empty() && self.slow.is_empty()
    }

    pub(crate) fn iter(&self, kind: QueueKind) -> impl Iterator<Item = (&PathBuf, &PendingEntry)> {
        self.queue(kind).iter()
    }

    /// Queue `path`, evicting the oldest entry of the same queue if it is full.
    ///
    /// The scheduler must be woken when both queues were empty (it waits indefinitely), or when
    /// this is the first quick entry while slow entries are waiting (its deadline was computed
    /// from the slower window). A later quick entry can never ripen before the one ahead of it,
    /// and a slow entry never ripens before any quick entry, so neither needs a wake.
    pub(crate) fn insert(
        &mut self,
        kind: QueueKind,
        path: PathBuf,
        entry: PendingEntry,
    ) -> Result<Insertion, StoreError> {
        let quick_was_empty = self.quick.is_empty();
        let wake = match kind {
            _ if self.is_empty() => true,
            QueueKind::Quick => quick_was_empty,
            QueueKind::Slow => false,
        };

        let capacity = self.capacity;
        let queue = match kind {
            QueueKind::Quick => &mut self.quick,
            QueueKind::Slow => &mut self.slow,
        };
        let evicted = queue.push_back_bounded(path, entry, capacity)?;
        Ok(Insertion { evicted, wake })
    }

    /// Remove `path` from whichever queue holds it.
    pub(crate) fn remove(&mut self, path: &Path) -> Option<(QueueKind, PendingEntry)> {
        let key = path.to_path_buf();
        if let Some(entry) = self.quick.remove(&key) {
            return Some((QueueKind::Quick, entry));
        }
        self.slow.remove(&key).map(|entry| (QueueKind::Slow, entry))
    }

    /// Time until the ripest entry ripens: zero if something is ripe, `None` if both queues are
    /// empty.
    pub(crate) fn ripest(&self, now: Instant) -> Option<Duration> {
        let quick = self
            .quick
            .first()
            .map(|(_, e)| self.quick_window.remaining(e.pended_at, now));
        let slow = self
            .slow
            .first()
            .map(|(_, e)| self.slow_window.remaining(e.pended_at, now));
        match (quick, slow) {
            (Some(q), Some(s)) => Some(q.min(s)),
            (q, s) => q.or(s),
        }
    }

    /// Remove every ripe entry from the head of both queues.
    ///
    /// Returns the removed entries, quick ones first, and the delay until the next entry of
    /// either queue ripens.
    pub(crate) fn take_ripe(&mut self, now: Instant) -> (Vec<(PathBuf, PendingEntry)>, Option<Duration>) {
        let mut ripe = Vec::new();
        let quick = Self::take_ripe_from(&mut self.quick, self.quick_window, now, &mut ripe);
        let slow = Self::take_ripe_from(&mut self.slow, self.slow_window, now, &mut ripe);
        let next = match (quick, slow) {
            (Some(q), Some(s)) => Some(q.min(s)),
            (q, s) => q.or(s),
        };
        (ripe, next)
    }

    fn take_ripe_from(
        queue: &mut OrderedStore<PathBuf, PendingEntry>,
        window: Window,
        now: Instant,
        ripe: &mut Vec<(PathBuf, PendingEntry)>,
    ) -> Option<Duration> {
        while let Some((_, head)) = queue.first() {
            let remaining = window.remaining(head.pended_at, now);
            if !remaining.is_zero() {
                return Some(remaining);
            }
            ripe.extend(queue.pop_front());
        }
        None
    }

    /// Empty both queues regardless of ripeness.
    pub(crate) fn drain_all(&mut self) -> Vec<(PathBuf, PendingEntry)> {
        self.quick.drain().chain(self.slow.drain()).collect()
    }
}
