//! The seam between the cache and the code that actually opens archives.
//!
//! The reaper never touches the filesystem itself. It asks an [`ArchiveProvider`] to open and
//! close archives and to [`stamp`](ArchiveProvider::stamp) a path, so that changes made to an
//! archive behind the cache's back can be noticed on reopen. [`ZipProvider`] is the provider used
//! in production; tests substitute in-memory providers.

use std::fs::File;
use std::io::{self, Read as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

/// Size and modification time of an archive file, as observed at (re)open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    /// File length in bytes.
    pub len: u64,
    /// Last modification time, if the platform reports one.
    pub modified: Option<SystemTime>,
}

impl FileStamp {
    /// Probe `path` on disk.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file's metadata cannot be read.
    pub fn probe(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// Central-directory facts about one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// Entry name within the archive.
    pub name: String,
    /// CRC-32 of the uncompressed content.
    pub crc32: u32,
    /// Uncompressed size in bytes.
    pub size: u64,
}

/// Failure to locate or materialize an archive entry.
#[derive(Debug, Error)]
pub enum EntryError {
    /// The archive has no entry with this name.
    #[error("entry {name} not found in {archive}")]
    NotFound {
        /// Archive path.
        archive: PathBuf,
        /// Requested entry name.
        name: String,
    },

    /// Fewer bytes were read than the central directory declared.
    #[error("short read of entry {name}: expected {expected} bytes, read {actual}")]
    ShortRead {
        /// Entry name.
        name: String,
        /// Declared uncompressed size.
        expected: u64,
        /// Bytes actually read.
        actual: u64,
    },

    /// I/O failure while reading the entry.
    #[error("I/O error reading entry: {0}")]
    Io(#[from] io::Error),

    /// The archive structure could not be decoded.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Opens, closes and probes archives on behalf of the reaper.
pub trait ArchiveProvider: Send + Sync + 'static {
    /// The open OS-level resource.
    type Archive: Send + Sync + 'static;

    /// Open `path` as a read-only archive.
    fn open(&self, path: &Path) -> io::Result<Self::Archive>;

    /// Release the reaper's reference to an archive previously returned by
    /// [`open`](Self::open).
    ///
    /// Callers may still hold clones of the `Arc`; the OS resource is released once the last one
    /// is dropped.
    fn close(&self, path: &Path, archive: Arc<Self::Archive>) -> io::Result<()>;

    /// Current size and modification time of `path`.
    fn stamp(&self, path: &Path) -> io::Result<FileStamp>;
}

/// Entry-level access to an open archive.
pub trait EntrySource {
    /// Look up an entry's central-directory facts.
    ///
    /// # Errors
    ///
    /// Returns [`EntryError::NotFound`] if the entry does not exist, or the decoding error.
    fn entry_meta(&self, name: &str) -> Result<EntryMeta, EntryError>;

    /// Decompress `meta`'s content, appending it to `into`. Returns the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the I/O or decoding error encountered while reading.
    fn read_entry(&self, meta: &EntryMeta, into: &mut Vec<u8>) -> Result<u64, EntryError>;
}

/// A zip archive opened from the local filesystem.
pub struct ZipArchiveFile {
    path: PathBuf,
    inner: Mutex<zip::ZipArchive<File>>,
}

impl ZipArchiveFile {
    /// The path this archive was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries in the central directory.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Names of all entries, in central-directory order.
    #[must_use]
    pub fn entry_names(&self) -> Vec<String> {
        self.inner.lock().file_names().map(str::to_owned).collect()
    }

    fn not_found(&self, name: &str) -> EntryError {
        EntryError::NotFound {
            archive: self.path.clone(),
            name: name.to_owned(),
        }
    }
}

impl std::fmt::Debug for ZipArchiveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipArchiveFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EntrySource for ZipArchiveFile {
    fn entry_meta(&self, name: &str) -> Result<EntryMeta, EntryError> {
        let mut archive = self.inner.lock();
        let entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(self.not_found(name)),
            Err(e) => return Err(e.into()),
        };
        Ok(EntryMeta {
            name: entry.name().to_owned(),
            crc32: entry.crc32(),
            size: entry.size(),
        })
    }

    fn read_entry(&self, meta: &EntryMeta, into: &mut Vec<u8>) -> Result<u64, EntryError> {
        let mut archive = self.inner.lock();
        let mut entry = match archive.by_name(&meta.name) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Err(self.not_found(&meta.name)),
            Err(e) => return Err(e.into()),
        };
        let read = entry.read_to_end(into)?;
        Ok(read as u64)
    }
}

/// Opens archives with the `zip` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipProvider;

impl ArchiveProvider for ZipProvider {
    type Archive = ZipArchiveFile;

    fn open(&self, path: &Path) -> io::Result<ZipArchiveFile> {
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(file).map_err(io::Error::other)?;
        trace!(path = %path.display(), entries = archive.len(), "Opened archive.");
        Ok(ZipArchiveFile {
            path: path.to_path_buf(),
            inner: Mutex::new(archive),
        })
    }

    fn close(&self, path: &Path, archive: Arc<ZipArchiveFile>) -> io::Result<()> {
        let outstanding = Arc::strong_count(&archive) - 1;
        drop(archive);
        trace!(path = %path.display(), outstanding, "Closed archive.");
        Ok(())
    }

    fn stamp(&self, path: &Path) -> io::Result<FileStamp> {
        FileStamp::probe(path)
    }
}
