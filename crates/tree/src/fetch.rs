use std::time::Duration;

use crate::pool::StringPool;
use crate::variant::Variant;

/// A value produced by a [`Fetcher`], carried with the fetcher's own pool.
/// Callers clone the value across into the owning tree's pool; dropping a
/// `Fetched` releases its pooled strings.
pub struct Fetched {
    pub pool: StringPool,
    pub value: Variant,
}

impl Drop for Fetched {
    fn drop(&mut self) {
        let mut v = std::mem::take(&mut self.value);
        v.clear(&mut self.pool);
    }
}

/// Lazily populates a map on lookup misses. Implementations serialize
/// their own external calls (an internal mutex); the tree-level
/// orchestration guarantees no tree lock is held while a fetch runs.
/// Refcount-safe destruction comes from `Arc`.
pub trait Fetcher: Send + Sync {
    /// Value to store under `key`, or `None` on failure.
    fn fetch_one(&self, key: &str) -> Option<Fetched>;

    /// Replacement for the entire map's contents (must be a map), or
    /// `None` on failure.
    fn fetch_all(&self) -> Option<Fetched>;

    /// How long installed results stay fresh; `None` means forever.
    fn ttl(&self) -> Option<Duration> {
        None
    }
}
