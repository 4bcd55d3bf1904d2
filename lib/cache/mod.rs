/// Bounded cache of small decompressed archive entries.
pub mod entry;
/// Insertion-ordered store shared by the reaper's queues and registries.
pub mod ordered;
