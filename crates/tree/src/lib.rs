//! In-memory JSON-shaped value trees with pooled string storage.
//!
//! A [`Tree`] owns a [`StringPool`] and a root [`Variant`] behind a
//! reader/writer lock. Every string a variant carries is interned in the
//! owning tree's pool and addressed by a [`StrRef`] handle; variants are
//! therefore cheap to move within a pool and must be cloned *across* pools
//! when they migrate between trees.
//!
//! Destruction is explicit: a variant does not remember its pool, so owners
//! call [`Variant::clear`] before dropping string-bearing values. The
//! refcount tests in `pool.rs` verify that balanced use leaves the pool
//! empty.

mod compare;
mod fetch;
pub mod json;
mod map;
mod merge;
mod path;
mod pool;
mod tree;
mod variant;

pub use compare::{
    compare, eq, exact, ord, str_compare, CompareMode, CompareResult, FLOAT_EQ_EPSILON,
};
pub use fetch::{Fetched, Fetcher};
pub use map::{Extra, VMap};
pub use merge::{merge_maps, merge_root, MergeFlags};
pub use path::{subtree, subtree_mut};
pub use pool::{CollatedStr, StrRef, StringPool};
pub use tree::{Tree, TreeData};
pub use variant::{Kind, PoolStr, RangeEntry, Variant};

/// Maximum container nesting accepted by the readers in this crate.
pub const MAX_DEPTH: usize = 512;

/// Errors produced by tree operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no such node")]
    NoSuchNode,
    #[error("path must be empty or start with '/'")]
    InvalidPath,
    #[error("array index {0:?} is not a decimal number")]
    BadIndex(String),
    #[error("cannot merge non-map value into a populated tree")]
    MergeTopLevel,
    #[error("json parse error at byte {pos}: {msg}")]
    Json { pos: usize, msg: &'static str },
    #[error("fetch for key {0:?} produced nothing")]
    FetchFailed(String),
}

/// Milliseconds since the unix epoch; the timestamp base for map expiry
/// and cache entries.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
