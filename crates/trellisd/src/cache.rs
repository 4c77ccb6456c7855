//! Reply cache: a fixed `rows × cols` grid of slots keyed by request
//! fingerprints. Buckets are chosen by hash, probed linearly, and evicted
//! by overwriting a random column — under load that is indistinguishable
//! from LRU at a fraction of the bookkeeping. Values are refcounted so a
//! reader keeps its reply alive after the slot is overwritten; entries
//! carry an absolute expiry and stale hits are ignored.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;

/// Output serialization chosen by the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Json,
    Bj,
}

/// Everything that can change a generated response; the cache key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    /// URI path plus query suffix.
    pub query: String,
    pub method: String,
    pub format: Format,
    pub pretty: bool,
    /// Negotiated content encoding (identity until a compressing layer
    /// sits in front).
    pub compression: String,
    pub authorization: String,
}

impl Request {
    pub fn fingerprint(&self) -> u32 {
        fxhash::hash32(self)
    }
}

/// A cached, fully serialized response body.
#[derive(Debug)]
pub struct StoredReply {
    /// Absolute expiry in unix milliseconds; 0 = no expiry.
    pub expiry_ms: u64,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl StoredReply {
    fn fresh(&self, now_ms: u64) -> bool {
        self.expiry_ms == 0 || now_ms < self.expiry_ms
    }
}

struct Slot {
    hash: u32,
    key: Option<Request>,
    val: Option<Arc<StoredReply>>,
}

/// 16-bit-flavored xorshift; cheap enough to sit under the write lock.
struct XorShift(u32);

impl XorShift {
    fn next(&mut self) -> u32 {
        let mut s = self.0;
        s ^= s << 1;
        s ^= s >> 1;
        s ^= s << 14;
        self.0 = s;
        s
    }
}

pub struct CacheTable {
    cols: usize,
    mask: u32,
    rng: Mutex<XorShift>,
    slots: RwLock<Vec<Slot>>,
}

impl CacheTable {
    /// `rows` and `cols` are rounded up to powers of two; zero for either
    /// disables the cache.
    pub fn new(rows: u32, cols: u32) -> CacheTable {
        if rows == 0 || cols == 0 {
            return CacheTable {
                cols: 0,
                mask: 0,
                rng: Mutex::new(XorShift(1)),
                slots: RwLock::new(Vec::new()),
            };
        }
        let rows = rows.next_power_of_two() as usize;
        let cols = cols.next_power_of_two() as usize;
        let mut slots = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            slots.push(Slot {
                hash: 0,
                key: None,
                val: None,
            });
        }
        let seed = crate::rng::random_u32();
        CacheTable {
            cols,
            mask: rows as u32 - 1,
            rng: Mutex::new(XorShift(seed | 1)),
            slots: RwLock::new(slots),
        }
    }

    pub fn enabled(&self) -> bool {
        self.cols != 0
    }

    pub fn get(&self, key: &Request, now_ms: u64) -> Option<Arc<StoredReply>> {
        if !self.enabled() {
            return None;
        }
        let hash = key.fingerprint();
        let begin = (hash & self.mask) as usize * self.cols;
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        for slot in &slots[begin..begin + self.cols] {
            if slot.hash == hash && slot.key.as_ref() == Some(key) {
                let val = slot.val.clone()?;
                return val.fresh(now_ms).then_some(val);
            }
        }
        None
    }

    pub fn put(&self, key: Request, val: Arc<StoredReply>) {
        if !self.enabled() {
            return;
        }
        let hash = key.fingerprint();
        let begin = (hash & self.mask) as usize * self.cols;
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let idx = (begin..begin + self.cols)
            .find(|&i| slots[i].hash == hash && slots[i].key.as_ref() == Some(&key))
            .unwrap_or_else(|| {
                let col = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next()
                    as usize
                    & (self.cols - 1);
                begin + col
            });
        slots[idx] = Slot {
            hash,
            key: Some(key),
            val: Some(val),
        };
    }

    /// Drop everything; wired to the tree-rebuilt event.
    pub fn clear(&self) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        for s in slots.iter_mut() {
            s.hash = 0;
            s.key = None;
            s.val = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn req(q: &str) -> Request {
        Request {
            query: q.to_string(),
            method: "GET".to_string(),
            format: Format::Json,
            pretty: false,
            compression: String::new(),
            authorization: String::new(),
        }
    }

    fn reply(expiry_ms: u64) -> Arc<StoredReply> {
        Arc::new(StoredReply {
            expiry_ms,
            content_type: "application/json",
            body: Bytes::from_static(b"{}"),
        })
    }

    #[test]
    fn put_get_roundtrip() {
        let c = CacheTable::new(16, 4);
        c.put(req("/view/a"), reply(0));
        assert!(c.get(&req("/view/a"), 1).is_some());
        assert!(c.get(&req("/view/b"), 1).is_none());
    }

    #[test]
    fn fingerprint_covers_all_fields() {
        let base = req("/v");
        for other in [
            Request {
                pretty: true,
                ..base.clone()
            },
            Request {
                format: Format::Bj,
                ..base.clone()
            },
            Request {
                method: "POST".into(),
                ..base.clone()
            },
            Request {
                authorization: "Bearer x".into(),
                ..base.clone()
            },
            Request {
                compression: "deflate".into(),
                ..base.clone()
            },
        ] {
            assert_ne!(base, other);
            let c = CacheTable::new(8, 2);
            c.put(base.clone(), reply(0));
            assert!(c.get(&other, 1).is_none(), "{other:?} collided");
        }
    }

    #[test]
    fn expired_entries_are_ignored() {
        let c = CacheTable::new(8, 2);
        c.put(req("/v"), reply(100));
        assert!(c.get(&req("/v"), 99).is_some());
        assert!(c.get(&req("/v"), 100).is_none());
    }

    #[test]
    fn eviction_keeps_the_grid_bounded() {
        let c = CacheTable::new(2, 2);
        for i in 0..256 {
            c.put(req(&format!("/v/{i}")), reply(0));
        }
        // Whatever survived must still be retrievable and well-formed.
        let survivors = (0..256)
            .filter(|i| c.get(&req(&format!("/v/{i}")), 1).is_some())
            .count();
        assert!(survivors <= 8);
    }

    #[test]
    fn disabled_cache_is_inert() {
        let c = CacheTable::new(0, 4);
        assert!(!c.enabled());
        c.put(req("/v"), reply(0));
        assert!(c.get(&req("/v"), 1).is_none());
    }

    #[test]
    fn clear_empties_all_slots() {
        let c = CacheTable::new(8, 2);
        c.put(req("/a"), reply(0));
        c.put(req("/b"), reply(0));
        c.clear();
        assert!(c.get(&req("/a"), 1).is_none());
        assert!(c.get(&req("/b"), 1).is_none());
    }
}
