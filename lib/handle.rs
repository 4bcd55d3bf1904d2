//! Handles to archives, keyed by canonical path.
//!
//! A [`HandleCache`] hands out one [`ArchiveHandle`] per canonical archive path. Handles count
//! their own opens and only call into the [`Reaper`] when that count moves between zero and one,
//! so repeated opens through one handle cost a mutex, not a trip through the reaper's gate. Each
//! handle also keeps a small [`EntryCache`] of decompressed entries.
//!
//! With the reaper disabled the handles open and close archives directly through the provider on
//! the same edges.

use std::fmt::Write as _;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::archive::{ArchiveProvider, EntryError, EntryMeta, EntrySource};
use crate::cache::entry::{EntryCache, EntryCacheStats, EntryKey};
use crate::config::{Config, ConfigError, HandleConfig};
use crate::diagnostics::DiagnosticSink;
use crate::reaper::{Reaper, ReaperError};

/// Largest up-front allocation made on the strength of an entry's declared size.
const PREALLOCATE_MAX: usize = 1 << 20;

enum Backend<P: ArchiveProvider> {
    Reaper(Reaper<P>),
    Direct(P),
}

impl<P: ArchiveProvider> Backend<P> {
    /// Modification time of the archive most recently opened for `path`.
    ///
    /// The reaper recorded a stamp with that open; direct mode has to probe the file.
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        match self {
            Self::Reaper(reaper) => reaper
                .snapshot(path)
                .and_then(|snapshot| snapshot.stamp)
                .and_then(|stamp| stamp.modified),
            Self::Direct(provider) => match provider.stamp(path) {
                Ok(stamp) => stamp.modified,
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Failed to stamp archive.");
                    None
                }
            },
        }
    }

    fn open(&self, path: &Path) -> Result<Arc<P::Archive>, ReaperError> {
        match self {
            Self::Reaper(reaper) => reaper.open(path),
            Self::Direct(provider) => {
                provider
                    .open(path)
                    .map(Arc::new)
                    .map_err(|source| ReaperError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
            }
        }
    }

    fn close(&self, path: &Path, archive: Arc<P::Archive>) -> Result<(), ReaperError> {
        match self {
            Self::Reaper(reaper) => {
                drop(archive);
                reaper.close(path)
            }
            Self::Direct(provider) => {
                provider
                    .close(path, archive)
                    .map_err(|source| ReaperError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
            }
        }
    }
}

struct HandleState<A> {
    opens: u64,
    archive: Option<Arc<A>>,
    /// Archive modification time at the last 0→1 open; part of every entry key.
    modified: Option<SystemTime>,
}

/// A reference-counted view of one archive path.
pub struct ArchiveHandle<P: ArchiveProvider> {
    path: PathBuf,
    backend: Arc<Backend<P>>,
    state: Mutex<HandleState<P::Archive>>,
    entries: Mutex<EntryCache>,
}

impl<P: ArchiveProvider> ArchiveHandle<P> {
    fn new(path: PathBuf, backend: Arc<Backend<P>>, config: &HandleConfig) -> Self {
        Self {
            path,
            backend,
            state: Mutex::new(HandleState {
                opens: 0,
                archive: None,
                modified: None,
            }),
            entries: Mutex::new(EntryCache::new(
                config.entry_max,
                config.entry_bytes_max.as_u64(),
                config.entry_limit.as_u64(),
            )),
        }
    }

    /// The canonical path of this handle.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Outstanding opens through this handle.
    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.state.lock().opens
    }

    /// Open the archive, going through the reaper (or the provider) only on the first open.
    ///
    /// # Errors
    ///
    /// Returns the reaper's error if the archive cannot be opened; the handle's count is left
    /// unchanged.
    pub fn open(&self) -> Result<Arc<P::Archive>, ReaperError> {
        let mut state = self.state.lock();
        if let Some(archive) = &state.archive {
            let archive = Arc::clone(archive);
            state.opens += 1;
            return Ok(archive);
        }

        let archive = self.backend.open(&self.path)?;
        state.modified = self.backend.modified(&self.path);
        state.archive = Some(Arc::clone(&archive));
        state.opens = 1;
        trace!(path = %self.path.display(), "Handle opened archive.");
        Ok(archive)
    }

    /// Release one open, handing the archive back on the last one.
    ///
    /// # Errors
    ///
    /// Returns the reaper's error for invariant violations, or the provider's close error in
    /// direct mode.
    pub fn close(&self) -> Result<(), ReaperError> {
        let mut state = self.state.lock();
        if state.opens == 0 {
            debug!(path = %self.path.display(), "Handle closed more often than opened.");
            return Ok(());
        }
        state.opens -= 1;
        if state.opens > 0 {
            return Ok(());
        }
        match state.archive.take() {
            Some(archive) => {
                trace!(path = %self.path.display(), "Handle released archive.");
                self.backend.close(&self.path, archive)
            }
            None => Ok(()),
        }
    }

    /// Modification time of the open archive, which keys its cached entries.
    #[must_use]
    pub fn modified(&self) -> Option<SystemTime> {
        self.state.lock().modified
    }

    /// Entry-cache counters of this handle.
    #[must_use]
    pub fn entry_stats(&self) -> EntryCacheStats {
        self.entries.lock().stats()
    }
}

impl<P> ArchiveHandle<P>
where
    P: ArchiveProvider,
    P::Archive: EntrySource,
{
    /// Stream the entry called `name` out of `archive`.
    ///
    /// # Errors
    ///
    /// Returns [`EntryError::NotFound`] for a missing entry, [`EntryError::ShortRead`] if the
    /// archive yields fewer bytes than it declares, or the underlying read error.
    pub fn entry_stream(&self, archive: &P::Archive, name: &str) -> Result<EntryStream, EntryError> {
        let meta = archive.entry_meta(name)?;
        self.entry_stream_for(archive, &meta)
    }

    /// Stream the entry described by `meta` out of `archive`.
    ///
    /// Small entries are served from and added to the handle's entry cache. Larger ones are read
    /// straight from the archive every time.
    ///
    /// # Errors
    ///
    /// As [`entry_stream`](Self::entry_stream).
    pub fn entry_stream_for(
        &self,
        archive: &P::Archive,
        meta: &EntryMeta,
    ) -> Result<EntryStream, EntryError> {
        if !self.entries.lock().admits(meta.size) {
            return Ok(EntryStream::new(materialize(archive, meta)?, false));
        }

        let key = EntryKey {
            name: meta.name.clone(),
            crc32: meta.crc32,
            modified: self.state.lock().modified,
        };
        if let Some(content) = self.entries.lock().get(&key) {
            return Ok(EntryStream::new(content, true));
        }

        // Read without the cache lock held; a concurrent reader may duplicate the work.
        let content = materialize(archive, meta)?;
        self.entries.lock().insert(key, content.clone());
        Ok(EntryStream::new(content, false))
    }
}

fn materialize<A: EntrySource>(archive: &A, meta: &EntryMeta) -> Result<Bytes, EntryError> {
    let capacity = usize::try_from(meta.size).map_or(PREALLOCATE_MAX, |size| size.min(PREALLOCATE_MAX));
    let mut buf = Vec::with_capacity(capacity);
    let read = archive.read_entry(meta, &mut buf)?;
    if read < meta.size {
        return Err(EntryError::ShortRead {
            name: meta.name.clone(),
            expected: meta.size,
            actual: read,
        });
    }
    Ok(Bytes::from(buf))
}

impl<P: ArchiveProvider> std::fmt::Debug for ArchiveHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveHandle")
            .field("path", &self.path)
            .field("opens", &self.open_count())
            .finish_non_exhaustive()
    }
}

/// Fully materialized entry content.
#[derive(Debug)]
pub struct EntryStream {
    cursor: Cursor<Bytes>,
    cached: bool,
}

impl EntryStream {
    fn new(content: Bytes, cached: bool) -> Self {
        Self {
            cursor: Cursor::new(content),
            cached,
        }
    }

    /// Total length of the entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor.get_ref().len()
    }

    /// Returns `true` for an empty entry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the content came from the entry cache.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// The whole entry, regardless of how much has been read.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.cursor.into_inner()
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

/// Canonical path → [`ArchiveHandle`], bounded with LRU eviction.
///
/// Evicting a handle never closes its archive; callers still holding it close through it as
/// usual.
pub struct HandleCache<P: ArchiveProvider> {
    backend: Arc<Backend<P>>,
    handles: Mutex<LruCache<PathBuf, Arc<ArchiveHandle<P>>>>,
    config: HandleConfig,
}

impl<P: ArchiveProvider> HandleCache<P> {
    /// Validate `config` and build the cache, starting a reaper unless it is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`ReaperError::Config`] listing every invalid setting, or
    /// [`ReaperError::Spawn`] if the reaper thread cannot be started.
    pub fn new(
        provider: P,
        config: &Config,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Result<Self, ReaperError> {
        config.validate().map_err(ConfigError::Invalid)?;

        let backend = if config.reaper.enabled {
            Backend::Reaper(Reaper::new(provider, config.reaper.clone(), sink)?)
        } else {
            debug!("Reaper disabled; archives are closed as soon as they are released.");
            Backend::Direct(provider)
        };

        Ok(Self {
            backend: Arc::new(backend),
            handles: Mutex::new(LruCache::new(config.handles.max_handles)),
            config: config.handles.clone(),
        })
    }

    /// The handle for `path`, canonicalizing it first.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if `path` cannot be canonicalized.
    pub fn handle(&self, path: &Path) -> io::Result<Arc<ArchiveHandle<P>>> {
        let canonical = std::fs::canonicalize(path)?;
        Ok(self.handle_canonical(canonical))
    }

    /// The handle for a path the caller has already canonicalized.
    pub fn handle_canonical(&self, path: PathBuf) -> Arc<ArchiveHandle<P>> {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get(&path) {
            return Arc::clone(handle);
        }
        let handle = Arc::new(ArchiveHandle::new(
            path.clone(),
            Arc::clone(&self.backend),
            &self.config,
        ));
        handles.insert(path, Arc::clone(&handle));
        handle
    }

    /// Number of cached handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns `true` if no handle is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The reaper, unless running in direct mode.
    #[must_use]
    pub fn reaper(&self) -> Option<&Reaper<P>> {
        match &*self.backend {
            Backend::Reaper(reaper) => Some(reaper),
            Backend::Direct(_) => None,
        }
    }

    /// Human-readable dump of the handles followed by the reaper's own dump.
    #[must_use]
    pub fn introspect(&self) -> String {
        let handles: Vec<_> = self
            .handles
            .lock()
            .iter()
            .map(|(_, handle)| Arc::clone(handle))
            .collect();

        let mut out = String::new();
        let _ = writeln!(out, "Handles ({} of {}):", handles.len(), self.config.max_handles);
        for handle in &handles {
            let stats = handle.entry_stats();
            let _ = writeln!(
                out,
                "  {} opens {}  entries {} ({} bytes)  hits {}  misses {}",
                handle.path().display(),
                handle.open_count(),
                stats.entries,
                stats.bytes,
                stats.hits,
                stats.misses,
            );
        }
        match self.reaper() {
            Some(reaper) => out.push_str(&reaper.introspect()),
            None => out.push_str("Reaper disabled.\n"),
        }
        out
    }

    /// Shut down the reaper and drop every cached handle and entry. Idempotent.
    pub fn shutdown(&self) {
        if let Some(reaper) = self.reaper() {
            reaper.shutdown();
        }
        let mut handles = self.handles.lock();
        for (_, handle) in handles.iter() {
            handle.entries.lock().clear();
        }
        handles.clear();
    }
}

impl<P: ArchiveProvider> std::fmt::Debug for HandleCache<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCache")
            .field("handles", &self.len())
            .field("reaper", &self.reaper().is_some())
            .finish_non_exhaustive()
    }
}
