//! A single-threaded continuous-query execution engine over append-only
//! streams and time-varying relations: a page-based memory manager, two
//! queue disciplines, a family of storage allocators, a linearised-bucket
//! hash index, register-based evaluation VMs, the standard stream/relation
//! operators, and a minimal round-robin scheduler that drives them.

pub mod error;
pub mod tuple;
pub mod memory;
pub mod queues;
pub mod storage;
pub mod index;
pub mod eval;
pub mod synopsis;
pub mod operators;
pub mod scheduler;
pub mod plan;

pub use error::{EngineError, Result};

/// Process-wide knobs (spec §6). `page_size` is carried as a field for
/// documentation purposes only: it is hard-coded to [`tuple::PAGE_SIZE`]
/// everywhere else, since varying it would require recomputing every
/// per-page layout computed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// Total size, in bytes, of the memory manager's single backing region.
    pub memory_bytes: usize,
    /// Page size in bytes. Must equal [`tuple::PAGE_SIZE`].
    pub page_size: usize,
    /// Pages allocated to each `SimpleQueue` at construction.
    pub queue_pages: usize,
    /// Pages allocated to each `SharedQueue` at construction.
    pub shared_queue_pages: usize,
    /// Fraction of non-empty hash index buckets that triggers doubling.
    pub index_load_threshold: f64,
}

impl Config {
    /// Hard invariant of the usage-bitmap encoding (§3): 16 insert bits +
    /// 16 delete bits packed into one `u32`. Widening this requires a wider
    /// usage word, not just a config change.
    pub const MAX_STUBS_PER_STORE: usize = 16;
    /// Hard invariant of `SharedQueue`'s fixed-size per-reader cursor arrays.
    pub const MAX_READERS_PER_SHARED_QUEUE: usize = 10;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_bytes: 64 * 1024 * 1024,
            page_size: tuple::PAGE_SIZE as usize,
            queue_pages: 4,
            shared_queue_pages: 8,
            index_load_threshold: 0.85,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_spec_page_size() {
        let cfg = Config::default();
        assert_eq!(cfg.page_size, tuple::PAGE_SIZE as usize);
        assert_eq!(Config::MAX_STUBS_PER_STORE, 16);
        assert_eq!(Config::MAX_READERS_PER_SHARED_QUEUE, 10);
    }
}
