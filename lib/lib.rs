//! zip-reaper shared library.
//!
//! A process-local cache of open zip archives that closes them lazily: an archive released by
//! its last user stays open for a short, adaptive window so that a nearby reopen is free.

/// Opening, closing and probing archives.
pub mod archive;
/// Caching primitives.
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod handle;
pub mod reaper;
pub mod sync;

pub use archive::{ArchiveProvider, ZipProvider};
pub use config::Config;
pub use handle::{ArchiveHandle, EntryStream, HandleCache};
pub use reaper::{Reaper, ReaperError};
