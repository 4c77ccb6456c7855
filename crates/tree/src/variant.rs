use crate::map::VMap;
use crate::pool::{StrRef, StringPool};

/// Cached handle + byte length of a pooled string. The pool remains
/// authoritative for the content; the length is recorded here for O(1)
/// access without a pool round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStr {
    pub handle: StrRef,
    pub len: u32,
}

/// One inclusive `[first, last]` index range; a [`Variant::Range`] holds an
/// ordered sequence of these. Used only as a query-selector literal and
/// never serialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RangeEntry {
    pub first: u64,
    pub last: u64,
}

impl RangeEntry {
    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }
}

/// Discriminant of a [`Variant`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Null,
    Bool,
    Int,
    Uint,
    Float,
    Str,
    Array,
    Map,
    Range,
    Ptr,
}

/// A tagged JSON-extended value.
///
/// Strings live in a [`StringPool`]; containers own their children. A
/// variant does not remember which pool it belongs to, so the owner must
/// call [`Variant::clear`] with the right pool before dropping a
/// string-bearing value — dropping without clearing leaks refcounts (the
/// bytes themselves are reclaimed when the pool drops).
///
/// `Ptr` is an opaque runtime-only payload (the view layer stores compiled
/// entry-point indices in it); it never survives serialization or a merge.
#[derive(Debug, Default)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(PoolStr),
    Array(Vec<Variant>),
    Map(Box<VMap>),
    Range(Box<[RangeEntry]>),
    Ptr(u64),
}

impl Variant {
    /// Intern `bytes` and build a string variant holding one reference.
    pub fn str(pool: &mut StringPool, bytes: &[u8]) -> Variant {
        let handle = pool.intern(bytes);
        Variant::Str(PoolStr {
            handle,
            len: bytes.len() as u32,
        })
    }

    /// Build a string variant from a handle the caller already owns a
    /// reference to. Takes over that reference.
    pub fn str_ref(pool: &StringPool, handle: StrRef) -> Variant {
        let len = pool.get(handle).map(|b| b.len()).unwrap_or(0) as u32;
        Variant::Str(PoolStr { handle, len })
    }

    pub fn new_map() -> Variant {
        Variant::Map(Box::default())
    }

    pub fn kind(&self) -> Kind {
        match self {
            Variant::Null => Kind::Null,
            Variant::Bool(_) => Kind::Bool,
            Variant::Int(_) => Kind::Int,
            Variant::Uint(_) => Kind::Uint,
            Variant::Float(_) => Kind::Float,
            Variant::Str(_) => Kind::Str,
            Variant::Array(_) => Kind::Array,
            Variant::Map(_) => Kind::Map,
            Variant::Range(_) => Kind::Range,
            Variant::Ptr(_) => Kind::Ptr,
        }
    }

    pub fn type_str(&self) -> &'static str {
        match self.kind() {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Uint => "uint",
            Kind::Float => "float",
            Kind::Str => "string",
            Kind::Array => "array",
            Kind::Map => "map",
            Kind::Range => "range",
            Kind::Ptr => "ptr",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Variant::Array(_) | Variant::Map(_))
    }

    pub fn is_atom(&self) -> bool {
        !self.is_container()
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Variant::Int(_) | Variant::Uint(_) | Variant::Float(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Variant::Uint(u) => Some(*u),
            Variant::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            Variant::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Numeric value widened to f64; `None` for non-numeric kinds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Int(i) => Some(*i as f64),
            Variant::Uint(u) => Some(*u as f64),
            Variant::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str<'p>(&self, pool: &'p StringPool) -> Option<&'p [u8]> {
        match self {
            Variant::Str(ps) => pool.get(ps.handle),
            _ => None,
        }
    }

    pub fn array(&self) -> Option<&[Variant]> {
        match self {
            Variant::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn array_mut(&mut self) -> Option<&mut Vec<Variant>> {
        match self {
            Variant::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn map(&self) -> Option<&VMap> {
        match self {
            Variant::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self) -> Option<&mut VMap> {
        match self {
            Variant::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn range(&self) -> Option<&[RangeEntry]> {
        match self {
            Variant::Range(r) => Some(r),
            _ => None,
        }
    }

    /// Element count of a container, string byte length for strings,
    /// zero otherwise.
    pub fn size(&self) -> usize {
        match self {
            Variant::Array(a) => a.len(),
            Variant::Map(m) => m.len(),
            Variant::Str(ps) => ps.len as usize,
            Variant::Range(r) => r.len(),
            _ => 0,
        }
    }

    /// Release pooled resources and reset to `Null`. Must be called with
    /// the pool the variant's strings were interned in.
    pub fn clear(&mut self, pool: &mut StringPool) {
        match std::mem::take(self) {
            Variant::Str(ps) => pool.decref(ps.handle),
            Variant::Array(mut a) => {
                for v in a.iter_mut() {
                    v.clear(pool);
                }
            }
            Variant::Map(mut m) => m.clear(pool),
            _ => {}
        }
    }

    // Mutators transmute in place, releasing previous pool resources first.

    pub fn set_bool(&mut self, pool: &mut StringPool, b: bool) {
        self.clear(pool);
        *self = Variant::Bool(b);
    }

    pub fn set_int(&mut self, pool: &mut StringPool, i: i64) {
        self.clear(pool);
        *self = Variant::Int(i);
    }

    pub fn set_uint(&mut self, pool: &mut StringPool, u: u64) {
        self.clear(pool);
        *self = Variant::Uint(u);
    }

    pub fn set_float(&mut self, pool: &mut StringPool, f: f64) {
        self.clear(pool);
        *self = Variant::Float(f);
    }

    pub fn set_str(&mut self, pool: &mut StringPool, bytes: &[u8]) {
        self.clear(pool);
        *self = Variant::str(pool, bytes);
    }

    pub fn set_ptr(&mut self, pool: &mut StringPool, p: u64) {
        self.clear(pool);
        *self = Variant::Ptr(p);
    }

    pub fn set_range(&mut self, pool: &mut StringPool, ranges: &[RangeEntry]) {
        self.clear(pool);
        *self = Variant::Range(ranges.into());
    }

    pub fn make_array(&mut self, pool: &mut StringPool, prealloc: usize) -> &mut Vec<Variant> {
        self.clear(pool);
        *self = Variant::Array(Vec::with_capacity(prealloc));
        match self {
            Variant::Array(a) => a,
            _ => unreachable!(),
        }
    }

    pub fn make_map(&mut self, pool: &mut StringPool) -> &mut VMap {
        self.clear(pool);
        *self = Variant::new_map();
        match self {
            Variant::Map(m) => m,
            _ => unreachable!(),
        }
    }

    /// Clone within the same pool; string refcounts are incremented,
    /// containers are deep-copied. Map extras are not cloned.
    pub fn clone_in(&self, pool: &mut StringPool) -> Variant {
        match self {
            Variant::Null => Variant::Null,
            Variant::Bool(b) => Variant::Bool(*b),
            Variant::Int(i) => Variant::Int(*i),
            Variant::Uint(u) => Variant::Uint(*u),
            Variant::Float(f) => Variant::Float(*f),
            Variant::Str(ps) => {
                pool.incref(ps.handle);
                Variant::Str(*ps)
            }
            Variant::Array(a) => Variant::Array(a.iter().map(|v| v.clone_in(pool)).collect()),
            Variant::Map(m) => Variant::Map(Box::new(m.clone_in(pool))),
            Variant::Range(r) => Variant::Range(r.clone()),
            Variant::Ptr(p) => Variant::Ptr(*p),
        }
    }

    /// Clone into a different pool; strings are re-interned in `dst`.
    pub fn clone_across(&self, src: &StringPool, dst: &mut StringPool) -> Variant {
        match self {
            Variant::Null => Variant::Null,
            Variant::Bool(b) => Variant::Bool(*b),
            Variant::Int(i) => Variant::Int(*i),
            Variant::Uint(u) => Variant::Uint(*u),
            Variant::Float(f) => Variant::Float(*f),
            Variant::Str(ps) => {
                let bytes = src.get(ps.handle).unwrap_or(b"");
                Variant::str(dst, bytes)
            }
            Variant::Array(a) => {
                Variant::Array(a.iter().map(|v| v.clone_across(src, dst)).collect())
            }
            Variant::Map(m) => Variant::Map(Box::new(m.clone_across(src, dst))),
            Variant::Range(r) => Variant::Range(r.clone()),
            Variant::Ptr(p) => Variant::Ptr(*p),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clear_balances_refcounts() {
        let mut pool = StringPool::new();
        let mut v = Variant::Null;
        let arr = v.make_array(&mut pool, 2);
        arr.push(Variant::str(&mut pool, b"a"));
        arr.push(Variant::str(&mut pool, b"a"));
        let h = pool.lookup(b"a").unwrap();
        assert_eq!(pool.refcount(h), 2);
        v.clear(&mut pool);
        assert!(pool.is_empty());
        assert!(v.is_null());
    }

    #[test]
    fn mutators_release_previous_content() {
        let mut pool = StringPool::new();
        let mut v = Variant::str(&mut pool, b"old");
        v.set_int(&mut pool, 7);
        assert!(pool.is_empty());
        assert_eq!(v.as_int(), Some(7));
        v.set_str(&mut pool, b"new");
        v.set_bool(&mut pool, true);
        assert!(pool.is_empty());
        v.clear(&mut pool);
    }

    #[test]
    fn clone_in_bumps_refcounts() {
        let mut pool = StringPool::new();
        let mut v = Variant::str(&mut pool, b"shared");
        let h = pool.lookup(b"shared").unwrap();
        let mut c = v.clone_in(&mut pool);
        assert_eq!(pool.refcount(h), 2);
        v.clear(&mut pool);
        assert_eq!(pool.refcount(h), 1);
        c.clear(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn clone_across_reinterns() {
        let mut a = StringPool::new();
        let mut b = StringPool::new();
        let mut v = Variant::Null;
        let m = v.make_map(&mut a);
        *m.put_key(&mut a, b"k") = Variant::str(&mut a, b"val");
        let mut c = v.clone_across(&a, &mut b);
        v.clear(&mut a);
        assert!(a.is_empty());
        let bk = b.lookup(b"k").unwrap();
        let got = c.map().unwrap().get(bk).unwrap();
        assert_eq!(got.as_str(&b), Some(&b"val"[..]));
        c.clear(&mut b);
        assert!(b.is_empty());
    }
}
