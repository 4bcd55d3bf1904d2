//! Out-of-band diagnostics for the reaper.
//!
//! The reaper notices anomalies (an archive rewritten on disk, a close without an open) while it
//! holds per-path locks. Logging from there risks re-entering whatever locks the installed
//! subscriber takes, so the reaper only ever [`post`](DiagnosticSink::post)s a [`Diagnostic`].
//! [`AsyncDiagnostics`] ships each one to a dedicated thread that does the actual `tracing`
//! emission.

use std::io;
use std::path::PathBuf;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, warn};

use crate::archive::FileStamp;

/// How loudly a diagnostic should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Something a user should look at.
    Warn,
    /// Expected in normal operation; interesting only when debugging.
    Debug,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// The archive's size or modification time changed while the reaper held it open.
    ArchiveChanged {
        /// Stamp recorded at the previous open.
        previous: FileStamp,
        /// Stamp observed now.
        current: FileStamp,
        /// Opens still outstanding when the change was detected.
        active_opens: u64,
    },
    /// A close arrived for a path with no outstanding opens.
    CloseWithoutOpen,
    /// Reopening a changed archive failed; the record was forced fully closed.
    ReopenFailed {
        /// Rendered I/O error.
        error: String,
    },
}

/// One anomaly report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Reporting level.
    pub severity: Severity,
    /// Archive the report is about.
    pub path: PathBuf,
    /// What happened.
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    /// Emit this diagnostic through `tracing` on the current thread.
    pub fn emit(&self) {
        let path = self.path.display();
        match (&self.kind, self.severity) {
            (
                DiagnosticKind::ArchiveChanged {
                    previous,
                    current,
                    active_opens,
                },
                Severity::Warn,
            ) => warn!(
                %path,
                ?previous,
                ?current,
                active_opens,
                "Archive changed on disk while it was in use; reopened it."
            ),
            (
                DiagnosticKind::ArchiveChanged {
                    previous, current, ..
                },
                Severity::Debug,
            ) => debug!(%path, ?previous, ?current, "Archive changed on disk; reopened it."),
            (DiagnosticKind::CloseWithoutOpen, Severity::Warn) => {
                warn!(%path, "Close without a matching open.");
            }
            (DiagnosticKind::CloseWithoutOpen, Severity::Debug) => {
                debug!(%path, "Close without a matching open.");
            }
            (DiagnosticKind::ReopenFailed { error }, Severity::Warn) => {
                warn!(%path, %error, "Failed to reopen changed archive.");
            }
            (DiagnosticKind::ReopenFailed { error }, Severity::Debug) => {
                debug!(%path, %error, "Failed to reopen changed archive.");
            }
        }
    }
}

/// Receives diagnostics from inside the reaper's critical sections.
///
/// Implementations must not block and must not call back into the reaper.
pub trait DiagnosticSink: Send + Sync + 'static {
    /// Accept one diagnostic.
    fn post(&self, diagnostic: Diagnostic);
}

/// A [`DiagnosticSink`] that emits from a dedicated background thread.
#[derive(Debug)]
pub struct AsyncDiagnostics {
    sender: UnboundedSender<Diagnostic>,
    _worker: JoinHandle<()>,
}

impl AsyncDiagnostics {
    /// Spawn the emitter thread.
    ///
    /// The thread exits once this sink is dropped and every queued diagnostic has been emitted.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn() -> io::Result<Self> {
        let (sender, receiver) = unbounded_channel();
        let worker = std::thread::Builder::new()
            .name("zip-reaper-diag".to_owned())
            .spawn(move || Self::work(receiver))?;
        Ok(Self {
            sender,
            _worker: worker,
        })
    }

    fn work(mut receiver: UnboundedReceiver<Diagnostic>) {
        while let Some(diagnostic) = receiver.blocking_recv() {
            diagnostic.emit();
        }
    }
}

impl DiagnosticSink for AsyncDiagnostics {
    fn post(&self, diagnostic: Diagnostic) {
        // The receiver only goes away with the worker thread, which outlives every sender.
        let _ = self.sender.send(diagnostic);
    }
}
