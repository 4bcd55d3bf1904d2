//! Plain-text dump of the reaper's state.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::archive::ArchiveProvider;
use crate::reaper::pending::QueueKind;
use crate::reaper::record::RecordSnapshot;
use crate::reaper::{ReaperInner, SharedRecord};
use crate::sync::atomic::Ordering;
use crate::sync::lock;

/// Offset of `at` from the reaper's start, e.g. `+1.250s`.
fn offset(started_at: Instant, at: Option<Instant>) -> String {
    at.map_or_else(
        || "-".to_owned(),
        |at| format!("+{:.3}s", at.saturating_duration_since(started_at).as_secs_f64()),
    )
}

fn ms(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

fn render_record(out: &mut String, started_at: Instant, snap: &RecordSnapshot) {
    let _ = writeln!(out, "Record {}", snap.path.display());
    let _ = writeln!(
        out,
        "  state {}  opens {}  closes {}  active {}  quick {}  generation {}{}",
        snap.state,
        snap.open_count,
        snap.close_count,
        snap.active_opens(),
        snap.expire_quickly,
        snap.pend_generation,
        if snap.finalized_at.is_some() {
            "  finalized"
        } else {
            ""
        },
    );
    let _ = writeln!(
        out,
        "  created {}  last open {}  prior open {}  last pend {}  last full close {}",
        offset(started_at, Some(snap.created_at)),
        offset(started_at, snap.last_open_at),
        offset(started_at, snap.second_last_open_at),
        offset(started_at, snap.last_pend_at),
        offset(started_at, snap.last_full_close_at),
    );
    let stats = &snap.stats;
    let _ = writeln!(
        out,
        "  fresh {}  pend->open {}  open->open {}  full closes {}  anomalies {}  abandoned {}",
        stats.fresh_opens,
        stats.pend_to_open,
        stats.open_to_open,
        stats.full_closes,
        stats.reopen_anomalies,
        stats.abandoned_opens,
    );
    let _ = writeln!(
        out,
        "  time open {}  pending {}  closed {}",
        ms(stats.open_time),
        ms(stats.pend_time),
        ms(stats.closed_time),
    );
}

pub(super) fn render<P: ArchiveProvider>(inner: &ReaperInner<P>) -> String {
    let now = Instant::now();
    let started_at = inner.started_at;
    let config = &inner.config;
    let stats = inner.counters.snapshot();
    let mut out = String::new();

    let _ = writeln!(
        out,
        "Reaper [{}] up {:.3}s",
        if inner.active.load(Ordering::Acquire) {
            "active"
        } else {
            "shut down"
        },
        now.saturating_duration_since(started_at).as_secs_f64(),
    );
    let _ = writeln!(
        out,
        "  config: max-pending {}  quick {}..{}  slow {}..{}  completed-max {}",
        config.max_pending,
        ms(config.quick_pend_min),
        ms(config.quick_pend_max),
        ms(config.slow_pend_min),
        ms(config.slow_pend_max),
        config.completed_max,
    );
    let _ = writeln!(
        out,
        "  scheduler: passes {}  reaped {}  evictions {}  misuses {}  next {}",
        stats.passes,
        stats.reaped,
        stats.evictions,
        stats.misuses,
        inner.gate.deadline().map_or_else(
            || "on wake".to_owned(),
            |deadline| format!("in {}", ms(deadline.saturating_duration_since(now))),
        ),
    );

    // Copy the queues out so no record lock is taken while holding the queue lock.
    let queues: Vec<(QueueKind, Vec<String>)> = {
        let pending = lock(&inner.pending);
        [QueueKind::Quick, QueueKind::Slow]
            .into_iter()
            .map(|kind| {
                let lines = pending
                    .iter(kind)
                    .map(|(path, entry)| {
                        format!(
                            "    {} pended {} generation {}",
                            path.display(),
                            offset(started_at, Some(entry.pended_at)),
                            entry.generation
                        )
                    })
                    .collect();
                (kind, lines)
            })
            .collect()
    };
    for (kind, lines) in &queues {
        let _ = writeln!(out, "  {kind:?} pending ({}):", lines.len());
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
    }

    let mut records: Vec<SharedRecord<P::Archive>> = Vec::new();
    inner.records.iter_sync(|_, record| {
        records.push(Arc::clone(record));
        true
    });
    let active = records.len();
    let completed: Vec<_> = lock(&inner.completed)
        .iter()
        .map(|(_, record)| Arc::clone(record))
        .collect();
    let finalized: Vec<_> = lock(&inner.finalized).values().map(Arc::clone).collect();
    let _ = writeln!(
        out,
        "  records: active {active}  completed {}  finalized {}",
        completed.len(),
        finalized.len(),
    );

    let mut snapshots: Vec<RecordSnapshot> = records
        .iter()
        .chain(&completed)
        .chain(&finalized)
        .map(|record| lock(record).snapshot())
        .collect();
    snapshots.sort_by(|a, b| a.path.cmp(&b.path));
    for snap in &snapshots {
        render_record(&mut out, started_at, snap);
    }
    out
}
