#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rustc_hash::{FxHashMap, FxHashSet};
use zip_reaper::archive::{ArchiveProvider, EntryError, EntryMeta, EntrySource, FileStamp};
use zip_reaper::config::ReaperConfig;
use zip_reaper::diagnostics::{Diagnostic, DiagnosticSink};

/// An archive served from memory.
#[derive(Debug)]
pub struct MockArchive {
    pub path: PathBuf,
    /// Distinguishes successive opens of the same path.
    pub serial: u64,
    entries: FxHashMap<String, Vec<u8>>,
    /// Report entries as one byte longer than their content.
    truncated: bool,
}

impl EntrySource for MockArchive {
    fn entry_meta(&self, name: &str) -> Result<EntryMeta, EntryError> {
        let content = self.entries.get(name).ok_or_else(|| EntryError::NotFound {
            archive: self.path.clone(),
            name: name.to_owned(),
        })?;
        Ok(EntryMeta {
            name: name.to_owned(),
            crc32: content.iter().fold(0_u32, |acc, b| acc.rotate_left(5) ^ u32::from(*b)),
            size: content.len() as u64 + u64::from(self.truncated),
        })
    }

    fn read_entry(&self, meta: &EntryMeta, into: &mut Vec<u8>) -> Result<u64, EntryError> {
        let content = self.entries.get(&meta.name).ok_or_else(|| EntryError::NotFound {
            archive: self.path.clone(),
            name: meta.name.clone(),
        })?;
        into.extend_from_slice(content);
        Ok(content.len() as u64)
    }
}

#[derive(Default)]
struct MockState {
    serial: u64,
    opens: FxHashMap<PathBuf, u64>,
    closes: FxHashMap<PathBuf, u64>,
    stamps: FxHashMap<PathBuf, FileStamp>,
    stamp_calls: FxHashMap<PathBuf, u64>,
    failing: FxHashSet<PathBuf>,
    entries: FxHashMap<PathBuf, FxHashMap<String, Vec<u8>>>,
    truncated: bool,
}

/// An [`ArchiveProvider`] that counts every open and close per path.
///
/// Clones share state, so a test can keep one while the reaper owns another.
#[derive(Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the provider opened `path`.
    pub fn opens(&self, path: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .opens
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    /// Times the provider closed `path`.
    pub fn closes(&self, path: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .closes
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    /// Archives currently held open across all paths.
    pub fn held(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.opens.values().sum::<u64>() - state.closes.values().sum::<u64>()
    }

    /// Simulate rewriting `path` on disk.
    pub fn touch(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let stamp = state.stamps.entry(PathBuf::from(path)).or_insert(FileStamp {
            len: 0,
            modified: None,
        });
        stamp.len += 1;
        stamp.modified = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(stamp.len));
    }

    /// Times `path` was probed for its stamp.
    pub fn stamp_calls(&self, path: &str) -> u64 {
        self.state
            .lock()
            .unwrap()
            .stamp_calls
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    /// Make every open and probe of `path` fail.
    pub fn fail(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(PathBuf::from(path));
    }

    pub fn add_entry(&self, path: &str, name: &str, content: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .entries
            .entry(PathBuf::from(path))
            .or_default()
            .insert(name.to_owned(), content.to_vec());
    }

    /// Make archives opened from now on declare entries longer than their content.
    pub fn truncate_entries(&self) {
        self.state.lock().unwrap().truncated = true;
    }

    fn check(state: &MockState, path: &Path) -> io::Result<()> {
        if state.failing.contains(path) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "mock failure"));
        }
        Ok(())
    }
}

impl ArchiveProvider for MockProvider {
    type Archive = MockArchive;

    fn open(&self, path: &Path) -> io::Result<MockArchive> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, path)?;
        state.serial += 1;
        *state.opens.entry(path.to_path_buf()).or_default() += 1;
        Ok(MockArchive {
            path: path.to_path_buf(),
            serial: state.serial,
            entries: state.entries.get(path).cloned().unwrap_or_default(),
            truncated: state.truncated,
        })
    }

    fn close(&self, path: &Path, _archive: Arc<MockArchive>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.closes.entry(path.to_path_buf()).or_default() += 1;
        Ok(())
    }

    fn stamp(&self, path: &Path) -> io::Result<FileStamp> {
        let mut state = self.state.lock().unwrap();
        *state.stamp_calls.entry(path.to_path_buf()).or_default() += 1;
        Self::check(&state, path)?;
        Ok(state.stamps.get(path).copied().unwrap_or(FileStamp {
            len: 0,
            modified: None,
        }))
    }
}

/// A [`DiagnosticSink`] that keeps everything posted to it.
#[derive(Clone, Default)]
pub struct RecordingSink {
    posted: Arc<Mutex<Vec<Diagnostic>>>,
}

impl RecordingSink {
    pub fn posted(&self) -> Vec<Diagnostic> {
        self.posted.lock().unwrap().clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn post(&self, diagnostic: Diagnostic) {
        self.posted.lock().unwrap().push(diagnostic);
    }
}

/// Short pend windows so scheduler-driven tests finish quickly.
pub fn fast_config() -> ReaperConfig {
    ReaperConfig {
        max_pending: -1,
        quick_pend_min: Duration::from_millis(100),
        quick_pend_max: Duration::from_millis(150),
        slow_pend_min: Duration::from_millis(300),
        slow_pend_max: Duration::from_millis(400),
        ..ReaperConfig::default()
    }
}

/// Long pend windows so nothing is reaped during a test unless the test forces it.
pub fn patient_config() -> ReaperConfig {
    ReaperConfig {
        max_pending: -1,
        quick_pend_min: Duration::from_secs(60),
        quick_pend_max: Duration::from_secs(61),
        slow_pend_min: Duration::from_secs(120),
        slow_pend_max: Duration::from_secs(121),
        ..ReaperConfig::default()
    }
}

/// Poll `condition` every few milliseconds until it holds, or give up after `timeout`.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
