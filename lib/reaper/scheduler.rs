//! The reaper's gate and its single scheduler thread.
//!
//! The gate is a reader/writer monitor. Opens and closes enter it as readers and run
//! concurrently; the scheduler enters it as the sole writer, so that no open or close is mid-way
//! while it reaps. A waiting writer blocks new readers, which keeps a steady stream of opens from
//! starving the scheduler.
//!
//! Between passes the scheduler sleeps on the same monitor until its deadline passes, a reader
//! [`wake`](Gate::wake)s it, or shutdown is requested.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::archive::ArchiveProvider;
use crate::reaper::ReaperInner;
use crate::sync::{Condvar, Mutex, MutexGuard, lock};

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writer: bool,
    writer_waiting: bool,
    wake: bool,
    shutdown: bool,
    /// `None` while the scheduler waits indefinitely.
    deadline: Option<Instant>,
}

/// Reader/writer monitor shared by opens, closes and the scheduler.
#[derive(Debug)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    readers_cv: Condvar,
    scheduler_cv: Condvar,
}

/// Shared access to the reaper. Dropping it leaves the gate.
pub(crate) struct ReadGuard<'a> {
    gate: &'a Gate,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        state.readers -= 1;
        if state.readers == 0 && state.writer_waiting {
            self.gate.scheduler_cv.notify_one();
        }
    }
}

/// Exclusive access for one scheduler pass.
pub(crate) struct WriteTurn<'a> {
    gate: &'a Gate,
    /// Shutdown was requested; this is the final pass.
    pub shutdown: bool,
    next: Option<Duration>,
}

impl WriteTurn<'_> {
    /// Arm the next wait. `None` waits until woken.
    pub(crate) fn rearm(&mut self, next: Option<Duration>) {
        self.next = next;
    }
}

impl Drop for WriteTurn<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.gate.state);
        state.writer = false;
        state.deadline = self.next.map(|delay| Instant::now() + delay);
        self.gate.readers_cv.notify_all();
    }
}

fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard)
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            readers_cv: Condvar::new(),
            scheduler_cv: Condvar::new(),
        }
    }
}

impl Gate {
    /// Enter as a reader, waiting while the scheduler runs or wants to run.
    pub(crate) fn read(&self) -> ReadGuard<'_> {
        let mut state = lock(&self.state);
        while state.writer || state.writer_waiting {
            state = wait(&self.readers_cv, state);
        }
        state.readers += 1;
        ReadGuard { gate: self }
    }

    /// Ask the scheduler to recompute its deadline.
    pub(crate) fn wake(&self) {
        let mut state = lock(&self.state);
        state.wake = true;
        self.scheduler_cv.notify_one();
    }

    /// Ask the scheduler to run its final pass and exit.
    pub(crate) fn request_shutdown(&self) {
        let mut state = lock(&self.state);
        state.shutdown = true;
        self.scheduler_cv.notify_one();
    }

    /// When the scheduler will next run on its own, if it is armed.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        lock(&self.state).deadline
    }

    /// Sleep until the deadline, a wake or shutdown, then wait out the current readers.
    pub(crate) fn write_turn(&self) -> WriteTurn<'_> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown || state.wake {
                break;
            }
            match state.deadline {
                None => state = wait(&self.scheduler_cv, state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    state = match self.scheduler_cv.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }

        state.writer_waiting = true;
        while state.readers > 0 {
            state = wait(&self.scheduler_cv, state);
        }
        state.writer_waiting = false;
        state.writer = true;
        // Every insert that asked for a wake has finished; this pass sees it.
        state.wake = false;
        state.deadline = None;

        WriteTurn {
            gate: self,
            shutdown: state.shutdown,
            next: None,
        }
    }
}

/// Body of the scheduler thread.
pub(crate) fn run<P: ArchiveProvider>(inner: &ReaperInner<P>) {
    debug!("Reaper scheduler started.");
    loop {
        let mut turn = inner.gate.write_turn();
        let now = Instant::now();
        inner.note_pass();

        if turn.shutdown {
            inner.shutdown_pass(now);
            break;
        }

        let next = match inner.ripest(now) {
            None => None,
            Some(remaining) if !remaining.is_zero() => {
                trace!(?remaining, "Nothing ripe yet; re-arming.");
                Some(remaining)
            }
            Some(_) => inner.reap(now),
        };
        turn.rearm(next);
    }
    debug!("Reaper scheduler stopped.");
}

#[cfg(all(test, not(loom)))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn waiting_writer_blocks_new_readers() {
        let gate = Arc::new(Gate::default());
        gate.wake();

        let reader = gate.read();
        let entered = Arc::new(AtomicBool::new(false));

        let writer = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _turn = gate.write_turn();
                entered.store(true, Ordering::SeqCst);
            })
        };

        // Wait until the writer has announced itself.
        while !lock(&gate.state).writer_waiting {
            std::thread::yield_now();
        }
        assert!(!entered.load(Ordering::SeqCst), "writer must wait for the reader");

        drop(reader);
        assert!(writer.join().is_ok());
        assert!(entered.load(Ordering::SeqCst));

        // The turn is over, so readers are admitted again.
        let _reader = gate.read();
    }

    #[test]
    fn deadline_is_armed_after_turn() {
        let gate = Gate::default();
        gate.wake();
        {
            let mut turn = gate.write_turn();
            assert!(!turn.shutdown);
            turn.rearm(Some(Duration::from_secs(60)));
        }
        assert!(gate.deadline().is_some());

        gate.request_shutdown();
        let turn = gate.write_turn();
        assert!(turn.shutdown);
    }
}
