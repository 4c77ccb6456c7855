use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::merge::{merge_root, MergeFlags};
use crate::path::{subtree, subtree_mut};
use crate::pool::StringPool;
use crate::variant::Variant;
use crate::{now_ms, Error};

/// The lockable interior of a [`Tree`]: the string pool and the root
/// variant. Everything stored under the root borrows from this pool.
#[derive(Default)]
pub struct TreeData {
    pub pool: StringPool,
    pub root: Variant,
}

impl TreeData {
    pub fn subtree(&self, path: &str) -> Result<&Variant, Error> {
        subtree(&self.pool, &self.root, path)
    }

    pub fn subtree_mut(&mut self, path: &str, create: bool) -> Result<&mut Variant, Error> {
        subtree_mut(&mut self.pool, &mut self.root, path, create)
    }

    pub fn merge(
        &mut self,
        spool: &StringPool,
        src: &Variant,
        flags: MergeFlags,
    ) -> Result<(), Error> {
        merge_root(&mut self.pool, &mut self.root, spool, src, flags)
    }

    /// Drop the whole tree content, leaving an empty map root.
    pub fn reset(&mut self) {
        self.root.clear(&mut self.pool);
        self.root = Variant::new_map();
    }
}

/// A value tree: pool + root behind a reader/writer lock. Readers hold the
/// shared lock for the duration of an evaluation and therefore observe one
/// consistent snapshot; writers serialize merges through the exclusive
/// lock.
pub struct Tree {
    data: RwLock<TreeData>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// An empty tree whose root is an empty map.
    pub fn new() -> Self {
        Tree {
            data: RwLock::new(TreeData {
                pool: StringPool::new(),
                root: Variant::new_map(),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TreeData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TreeData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `path`, running the owning map's fetcher for the final
    /// segment if the node is missing or its data went stale.
    ///
    /// The lock dance is shared-read / release / fetch / exclusive-write /
    /// re-check: no tree lock is held while the fetcher performs external
    /// I/O, and the fetcher serializes its own calls internally, so the
    /// re-check under the write lock simply installs whichever result got
    /// there first.
    pub fn get_or_fetch(&self, path: &str) -> Result<(), Error> {
        let (parent, key) = match path.rfind('/') {
            Some(i) => (&path[..i], &path[i + 1..]),
            None => return self.read().subtree(path).map(|_| ()),
        };

        let fetcher = {
            let data = self.read();
            if data.subtree(path).is_ok() {
                let map = data.subtree(parent).ok().and_then(|v| v.map());
                let stale = map
                    .and_then(|m| m.extra())
                    .map(|x| !x.fresh(now_ms()))
                    .unwrap_or(false);
                if !stale {
                    return Ok(());
                }
            }
            let Ok(Variant::Map(m)) = data.subtree(parent) else {
                return Err(Error::NoSuchNode);
            };
            match m.extra().and_then(|x| x.fetcher.clone()) {
                Some(f) => f,
                None => return Err(Error::NoSuchNode),
            }
        };

        // No tree lock held across the external call.
        let fetched = fetcher.fetch_one(key);

        let Some(res) = fetched else {
            tracing::warn!(path, key, "fetcher produced nothing");
            return Err(Error::FetchFailed(key.to_string()));
        };

        let mut guard = self.write();
        let data = &mut *guard;
        let mut value = res.value.clone_across(&res.pool, &mut data.pool);
        let node = match subtree_mut(&mut data.pool, &mut data.root, parent, false) {
            Ok(node) => node,
            Err(e) => {
                value.clear(&mut data.pool);
                return Err(e);
            }
        };
        let Some(m) = node.map_mut() else {
            value.clear(&mut data.pool);
            return Err(Error::NoSuchNode);
        };
        let slot = m.put_key(&mut data.pool, key.as_bytes());
        let mut old = std::mem::replace(slot, value);
        let extra = m.extra_mut();
        extra.valid = true;
        extra.expiry_ts = fetcher
            .ttl()
            .map(|d| now_ms().saturating_add(d.as_millis() as u64))
            .unwrap_or(0);
        old.clear(&mut data.pool);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::{Fetched, Fetcher};
    use crate::json;

    #[test]
    fn tree_starts_as_empty_map() {
        let t = Tree::new();
        let d = t.read();
        assert!(matches!(&d.root, Variant::Map(m) if m.is_empty()));
    }

    #[test]
    fn merge_under_write_lock() {
        let t = Tree::new();
        let mut sp = StringPool::new();
        let mut src = json::parse(&mut sp, br#"{"k": 1}"#).unwrap();
        t.write().merge(&sp, &src, MergeFlags::RECURSIVE).unwrap();
        src.clear(&mut sp);
        let d = t.read();
        assert!(matches!(d.subtree("/k"), Ok(Variant::Uint(1))));
    }

    #[derive(Debug)]
    struct OneShot;

    impl Fetcher for OneShot {
        fn fetch_one(&self, key: &str) -> Option<Fetched> {
            let mut pool = StringPool::new();
            let value = Variant::str(&mut pool, format!("fetched:{key}").as_bytes());
            Some(Fetched { pool, value })
        }

        fn fetch_all(&self) -> Option<Fetched> {
            None
        }
    }

    #[test]
    fn get_or_fetch_installs_missing_keys() {
        let t = Tree::new();
        {
            let mut guard = t.write();
            let data = &mut *guard;
            let node = subtree_mut(&mut data.pool, &mut data.root, "/lazy", true).unwrap();
            let m = node.make_map(&mut data.pool);
            m.extra_mut().fetcher = Some(std::sync::Arc::new(OneShot));
        }
        t.get_or_fetch("/lazy/thing").unwrap();
        let d = t.read();
        let got = d.subtree("/lazy/thing").unwrap();
        assert_eq!(got.as_str(&d.pool), Some(&b"fetched:thing"[..]));
    }

    #[test]
    fn get_or_fetch_without_fetcher_is_no_such_node() {
        let t = Tree::new();
        assert!(matches!(
            t.get_or_fetch("/nope/x"),
            Err(Error::NoSuchNode)
        ));
    }
}
