//! Small runtime configuration knobs: a plain struct with a sensible
//! `Default`, no config-file format (this is a library, not a CLI).

/// Per-region tuning. The promotion threshold is a compile-time
/// constant in the source this crate is grounded on (`MAGIC_SIZE`); it
/// is exposed here as a runtime default instead so an embedder with a
/// very different guest code density can override it per region.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub promotion_threshold: usize,
    /// Whether block creation logs a `trace`-level dump of the fresh
    /// block's guest address and size. Off by default — this sits on
    /// the hottest path in the cache.
    pub dump_on_fill: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { promotion_threshold: crate::cache::region::MAGIC_SIZE, dump_on_fill: false }
    }
}
