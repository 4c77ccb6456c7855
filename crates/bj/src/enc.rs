use std::io::Write;

use fxhash::FxHashMap;

use tree::{StrRef, StringPool, Variant};

use crate::MAGIC;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{0} values cannot be serialized")]
    Unencodable(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const OP_INT_POS: u8 = 1;
const OP_INT_NEG: u8 = 2;
const OP_STRING: u8 = 3;
const OP_ARRAY: u8 = 4;
const OP_MAP: u8 = 5;
const OP_COPY_CONST: u8 = 6;

struct Enc<'p, W> {
    out: W,
    pool: &'p StringPool,
    ref2idx: FxHashMap<StrRef, u64>,
    written: usize,
}

/// Encode `v` to `out`, preceded by the magic and a constants table built
/// from the pool's shared strings (refcount ≥ 2, most referenced first,
/// ties by content). Returns the number of bytes written.
pub fn encode<W: Write>(out: W, pool: &StringPool, v: &Variant) -> Result<usize, EncodeError> {
    let mut enc = Enc {
        out,
        pool,
        ref2idx: FxHashMap::default(),
        written: 0,
    };
    enc.put_bytes(&MAGIC)?;
    enc.pool_and_emit_strings()?;
    enc.value(v)?;
    enc.out.flush()?;
    Ok(enc.written)
}

impl<W: Write> Enc<'_, W> {
    fn put_bytes(&mut self, b: &[u8]) -> Result<(), EncodeError> {
        self.out.write_all(b)?;
        self.written += b.len();
        Ok(())
    }

    fn put(&mut self, b: u8) -> Result<(), EncodeError> {
        self.put_bytes(&[b])
    }

    /// Plain ULEB128.
    fn put_size(&mut self, mut x: u64) -> Result<(), EncodeError> {
        let mut buf = [0u8; 10];
        let mut n = 0;
        while x > 0x7f {
            buf[n] = 0x80 | (x & 0x7f) as u8;
            x >>= 7;
            n += 1;
        }
        buf[n] = x as u8;
        self.put_bytes(&buf[..n + 1])
    }

    /// Lead byte with the value packed into the low 5 bits when it fits,
    /// else `31` plus a ULEB128 remainder.
    fn put_op_and_size(&mut self, op: u8, size: u64) -> Result<(), EncodeError> {
        if size < 31 {
            self.put((op << 5) | size as u8)
        } else {
            self.put((op << 5) | 31)?;
            self.put_size(size - 31)
        }
    }

    fn put_str_raw(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.put_op_and_size(OP_STRING, bytes.len() as u64)?;
        self.put_bytes(bytes)
    }

    /// A string by handle: a constants-table reference where one exists,
    /// the raw bytes otherwise.
    fn put_str(&mut self, h: StrRef) -> Result<(), EncodeError> {
        if let Some(&idx) = self.ref2idx.get(&h) {
            self.put_op_and_size(OP_COPY_CONST, idx)
        } else {
            self.put_str_raw(self.pool.get(h).unwrap_or(b""))
        }
    }

    /// Collate the pool and emit a define-constants preamble holding every
    /// string referenced at least twice, most common first so the hottest
    /// strings get one-byte indices.
    fn pool_and_emit_strings(&mut self) -> Result<(), EncodeError> {
        let mut coll: Vec<_> = self
            .pool
            .collate()
            .into_iter()
            .filter(|c| c.refs >= 2)
            .collect();
        if coll.is_empty() {
            return Ok(());
        }
        coll.sort_by(|a, b| b.refs.cmp(&a.refs).then_with(|| a.bytes.cmp(b.bytes)));

        self.put(0b01000)?;
        self.put_size(0)?;
        self.put_size(coll.len() as u64)?;
        for (i, c) in coll.iter().enumerate() {
            self.ref2idx.insert(c.handle, i as u64);
            self.put_str_raw(c.bytes)?;
        }
        Ok(())
    }

    fn value(&mut self, v: &Variant) -> Result<(), EncodeError> {
        match v {
            Variant::Null => self.put(0),
            Variant::Bool(b) => self.put(0b00010 | *b as u8),
            Variant::Int(i) => {
                if *i < 0 {
                    self.put_op_and_size(OP_INT_NEG, i.unsigned_abs())
                } else {
                    self.put_op_and_size(OP_INT_POS, *i as u64)
                }
            }
            Variant::Uint(u) => self.put_op_and_size(OP_INT_POS, *u),
            Variant::Float(f) => self.float(*f),
            Variant::Str(ps) => self.put_str(ps.handle),
            Variant::Array(a) => {
                self.put_op_and_size(OP_ARRAY, a.len() as u64)?;
                for e in a.iter() {
                    self.value(e)?;
                }
                Ok(())
            }
            Variant::Map(m) => {
                self.put_op_and_size(OP_MAP, m.len() as u64)?;
                for (k, e) in m.iter() {
                    self.put_str(k)?;
                    self.value(e)?;
                }
                Ok(())
            }
            Variant::Range(_) => Err(EncodeError::Unencodable("range")),
            Variant::Ptr(_) => Err(EncodeError::Unencodable("opaque pointer")),
        }
    }

    fn float(&mut self, f: f64) -> Result<(), EncodeError> {
        // Integral values of modest magnitude pack tighter as integers.
        if f.trunc() == f && f.abs() < 0x7fff_ffff as f64 {
            if f.is_sign_negative() && f != 0.0 {
                self.put(0b00111)?;
                return self.put_size((-f) as u64);
            }
            self.put(0b00110)?;
            return self.put_size(f as u64);
        }
        let narrow = f as f32;
        if f == narrow as f64 {
            self.put(0b00100)?;
            self.put_bytes(&narrow.to_le_bytes())
        } else {
            self.put(0b00101)?;
            self.put_bytes(&f.to_le_bytes())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{decode, Limits};

    fn roundtrip(pool: &mut StringPool, v: &Variant) -> (StringPool, Variant) {
        let mut buf = Vec::new();
        encode(&mut buf, pool, v).unwrap();
        assert!(crate::is_bj(&buf));
        let mut dpool = StringPool::new();
        let out = decode(&mut dpool, &buf[..], &Limits::default()).unwrap();
        (dpool, out)
    }

    #[test]
    fn small_ints_are_one_byte() {
        let mut buf = Vec::new();
        let pool = StringPool::new();
        encode(&mut buf, &pool, &Variant::Uint(7)).unwrap();
        assert_eq!(buf.len(), MAGIC.len() + 1);
        assert_eq!(buf[4], (OP_INT_POS << 5) | 7);
    }

    #[test]
    fn integral_floats_pack_as_ints() {
        let pool = StringPool::new();
        let mut buf = Vec::new();
        encode(&mut buf, &pool, &Variant::Float(1000.0)).unwrap();
        assert_eq!(&buf[4..], &[0b00110, 0xe8, 0x07]);
        let mut dpool = StringPool::new();
        let v = decode(&mut dpool, &buf[..], &Limits::default()).unwrap();
        assert!(matches!(v, Variant::Float(f) if f == 1000.0));
    }

    #[test]
    fn i64_min_round_trips() {
        let mut pool = StringPool::new();
        let (_, v) = roundtrip(&mut pool, &Variant::Int(i64::MIN));
        assert!(matches!(v, Variant::Int(i) if i == i64::MIN));
    }

    #[test]
    fn shared_strings_use_the_constants_table() {
        let mut pool = StringPool::new();
        let mut v = tree::json::parse(&mut pool, br#"{"a":"xx","b":"xx","c":"yy"}"#).unwrap();

        let mut buf = Vec::new();
        encode(&mut buf, &pool, &v).unwrap();

        // "xx" is referenced twice and must appear exactly once, inside
        // the constants preamble.
        let hits = buf.windows(2).filter(|w| w == b"xx").count();
        assert_eq!(hits, 1);

        let mut dpool = StringPool::new();
        let out = decode(&mut dpool, &buf[..], &Limits::default()).unwrap();
        assert!(tree::exact(&pool, &v, &dpool, &out));
        v.clear(&mut pool);
    }
}
