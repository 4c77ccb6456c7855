use std::sync::Arc;

use fxhash::FxHashMap;

use crate::fetch::Fetcher;
use crate::pool::{StrRef, StringPool};
use crate::variant::Variant;

/// Map storage keyed on string-pool handles. Within one pool, handle
/// equality implies string equality, so the hash table never touches the
/// bytes. The map owns exactly one key reference per entry; iteration
/// order is unspecified.
#[derive(Debug, Default)]
pub struct VMap {
    entries: FxHashMap<StrRef, Variant>,
    extra: Option<Box<Extra>>,
}

/// Lazily-created per-map bookkeeping: an absolute expiry timestamp
/// (milliseconds, 0 = never), a data-valid flag, and an optional fetcher
/// that populates the map on demand. Extras are destroyed with the map and
/// intentionally not carried by clones.
pub struct Extra {
    pub expiry_ts: u64,
    pub valid: bool,
    pub fetcher: Option<Arc<dyn Fetcher>>,
}

impl Default for Extra {
    fn default() -> Self {
        Extra {
            expiry_ts: 0,
            valid: false,
            fetcher: None,
        }
    }
}

impl std::fmt::Debug for Extra {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extra")
            .field("expiry_ts", &self.expiry_ts)
            .field("valid", &self.valid)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "..."))
            .finish()
    }
}

impl Extra {
    /// Whether the data this map holds is usable right now.
    pub fn fresh(&self, now_ms: u64) -> bool {
        self.valid && (self.expiry_ts == 0 || now_ms < self.expiry_ts)
    }
}

impl VMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: StrRef) -> bool {
        self.entries.contains_key(&key)
    }

    /// Plain lookup; never triggers a fetcher (fetch orchestration lives
    /// on `Tree`).
    pub fn get(&self, key: StrRef) -> Option<&Variant> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: StrRef) -> Option<&mut Variant> {
        self.entries.get_mut(&key)
    }

    /// Lookup by content bytes.
    pub fn get_bytes(&self, pool: &StringPool, bytes: &[u8]) -> Option<&Variant> {
        self.get(pool.lookup(bytes)?)
    }

    /// Insert `value` under `key`, taking a new key reference on first
    /// insertion and clearing any replaced value against the pool.
    pub fn put(&mut self, pool: &mut StringPool, key: StrRef, value: Variant) {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                let mut old = std::mem::replace(e.get_mut(), value);
                old.clear(pool);
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                pool.incref(key);
                e.insert(value);
            }
        }
    }

    /// Intern `bytes` as a key and return the (possibly freshly
    /// default-constructed) value slot.
    pub fn put_key<'s>(&'s mut self, pool: &mut StringPool, bytes: &[u8]) -> &'s mut Variant {
        let key = pool.intern(bytes);
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => {
                // The map already owns a reference; give back the one
                // intern just took.
                pool.decref(key);
                e.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(e) => e.insert(Variant::Null),
        }
    }

    /// Insert `Null` if missing and return the slot.
    pub fn get_or_create(&mut self, pool: &mut StringPool, key: StrRef) -> &mut Variant {
        match self.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                pool.incref(key);
                e.insert(Variant::Null)
            }
        }
    }

    /// Remove an entry, releasing both the key reference and the value.
    pub fn remove(&mut self, pool: &mut StringPool, key: StrRef) -> bool {
        match self.entries.remove(&key) {
            Some(mut v) => {
                v.clear(pool);
                pool.decref(key);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StrRef, &Variant)> {
        self.entries.iter().map(|(k, v)| (*k, v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (StrRef, &mut Variant)> {
        self.entries.iter_mut().map(|(k, v)| (*k, v))
    }

    /// Release all entries (key refcounts and values) and the extras.
    pub fn clear(&mut self, pool: &mut StringPool) {
        for (k, mut v) in self.entries.drain() {
            v.clear(pool);
            pool.decref(k);
        }
        self.extra = None;
    }

    pub fn extra(&self) -> Option<&Extra> {
        self.extra.as_deref()
    }

    pub fn extra_mut(&mut self) -> &mut Extra {
        self.extra.get_or_insert_with(Box::default)
    }

    pub(crate) fn clone_in(&self, pool: &mut StringPool) -> VMap {
        let mut entries = FxHashMap::default();
        entries.reserve(self.entries.len());
        for (k, v) in self.entries.iter() {
            pool.incref(*k);
            entries.insert(*k, v.clone_in(pool));
        }
        VMap {
            entries,
            extra: None,
        }
    }

    pub(crate) fn clone_across(&self, src: &StringPool, dst: &mut StringPool) -> VMap {
        let mut out = VMap::new();
        out.entries.reserve(self.entries.len());
        for (k, v) in self.entries.iter() {
            let bytes = src.get(*k).unwrap_or(b"");
            let nk = dst.intern(bytes);
            let nv = v.clone_across(src, dst);
            match out.entries.entry(nk) {
                std::collections::hash_map::Entry::Occupied(_) => {
                    // Cannot happen: keys are unique per source map.
                    dst.decref(nk);
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(nv);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_key_owns_one_reference() {
        let mut pool = StringPool::new();
        let mut m = VMap::new();
        *m.put_key(&mut pool, b"k") = Variant::Int(1);
        *m.put_key(&mut pool, b"k") = Variant::Int(2);
        let h = pool.lookup(b"k").unwrap();
        assert_eq!(pool.refcount(h), 1);
        assert_eq!(m.get(h).unwrap().as_int(), Some(2));
        m.clear(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn put_clears_replaced_values() {
        let mut pool = StringPool::new();
        let mut m = VMap::new();
        let k = pool.intern(b"key");
        let old = Variant::str(&mut pool, b"old");
        m.put(&mut pool, k, old);
        m.put(&mut pool, k, Variant::Int(1));
        assert!(pool.lookup(b"old").is_none());
        m.clear(&mut pool);
        pool.decref(k);
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_releases_key_and_value() {
        let mut pool = StringPool::new();
        let mut m = VMap::new();
        *m.put_key(&mut pool, b"gone") = Variant::str(&mut pool, b"v");
        let h = pool.lookup(b"gone").unwrap();
        assert!(m.remove(&mut pool, h));
        assert!(pool.is_empty());
        assert!(m.is_empty());
    }

    #[test]
    fn extras_survive_mutation_but_not_clone() {
        let mut pool = StringPool::new();
        let mut m = VMap::new();
        m.extra_mut().expiry_ts = 42;
        *m.put_key(&mut pool, b"a") = Variant::Null;
        assert_eq!(m.extra().unwrap().expiry_ts, 42);
        let c = m.clone_in(&mut pool);
        assert!(c.extra().is_none());
        let mut c = c;
        c.clear(&mut pool);
        m.clear(&mut pool);
        assert!(pool.is_empty());
    }
}
