use std::io::Read;

use tree::{StringPool, Variant};

use crate::Limits;

/// Decode failure. The offset is the absolute byte position the reader had
/// reached; nothing partial escapes — the would-be destination is left
/// untouched by the caller contract (decode returns a value or an error).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated stream at byte {0}")]
    Truncated(u64),
    #[error("reserved or unknown opcode bits at byte {0}")]
    BadOpcode(u64),
    #[error("integer overflow at byte {0}")]
    Overflow(u64),
    #[error("size limit exceeded at byte {0}")]
    TooLarge(u64),
    #[error("constants table misuse at byte {0}")]
    BadConstant(u64),
    #[error("map key is not a string at byte {0}")]
    KeyNotString(u64),
    #[error("nesting deeper than the configured limit at byte {0}")]
    TooDeep(u64),
    #[error("negative integer out of range at byte {0}")]
    BadNegative(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Small buffered reader tracking its absolute offset.
struct ByteReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    len: usize,
    offset: u64,
}

impl<R: Read> ByteReader<R> {
    fn new(inner: R) -> Self {
        ByteReader {
            inner,
            buf: vec![0; 8192],
            pos: 0,
            len: 0,
            offset: 0,
        }
    }

    fn fill(&mut self) -> Result<bool, DecodeError> {
        if self.pos < self.len {
            return Ok(true);
        }
        self.pos = 0;
        self.len = 0;
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.len = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn take(&mut self) -> Result<u8, DecodeError> {
        if !self.fill()? {
            return Err(DecodeError::Truncated(self.offset));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        self.offset += 1;
        Ok(b)
    }

    fn read_n(&mut self, n: usize, out: &mut Vec<u8>) -> Result<(), DecodeError> {
        out.clear();
        out.reserve(n.min(1 << 20));
        while out.len() < n {
            if !self.fill()? {
                return Err(DecodeError::Truncated(self.offset));
            }
            let avail = (self.len - self.pos).min(n - out.len());
            out.extend_from_slice(&self.buf[self.pos..self.pos + avail]);
            self.pos += avail;
            self.offset += avail as u64;
        }
        Ok(())
    }
}

enum Frame {
    Arr {
        items: Vec<Variant>,
        size: u64,
    },
    Map {
        map: tree::VMap,
        pending_key: Option<tree::StrRef>,
        slots: u64,
    },
    Ctab {
        next: u64,
        end: u64,
    },
}

struct Decoder<'p, R> {
    rd: ByteReader<R>,
    pool: &'p mut StringPool,
    limits: Limits,
    /// Values still owed by the stream; containers add their element
    /// counts, every produced value subtracts one.
    remain: u64,
    frames: Vec<Frame>,
    consts: Vec<Variant>,
    out: Option<Variant>,
    scratch: Vec<u8>,
}

/// Decode one BJ value from `input` into `pool`.
pub fn decode<R: Read>(
    pool: &mut StringPool,
    input: R,
    limits: &Limits,
) -> Result<Variant, DecodeError> {
    let mut dec = Decoder {
        rd: ByteReader::new(input),
        pool,
        limits: *limits,
        remain: 1,
        frames: Vec::new(),
        consts: Vec::new(),
        out: None,
        scratch: Vec::new(),
    };
    let res = dec.run();
    let value = match res {
        Ok(()) => dec.out.take(),
        Err(e) => {
            dec.release();
            return Err(e);
        }
    };
    let at = dec.rd.offset;
    dec.release();
    value.ok_or(DecodeError::Truncated(at))
}

impl<R: Read> Decoder<'_, R> {
    /// Release everything still owned on the failure path so the pool's
    /// refcounts stay balanced.
    fn release(&mut self) {
        for f in self.frames.drain(..).rev() {
            match f {
                Frame::Arr { mut items, .. } => {
                    for v in items.iter_mut() {
                        v.clear(self.pool);
                    }
                }
                Frame::Map {
                    mut map,
                    pending_key,
                    ..
                } => {
                    map.clear(self.pool);
                    if let Some(k) = pending_key {
                        self.pool.decref(k);
                    }
                }
                Frame::Ctab { .. } => {}
            }
        }
        for c in self.consts.iter_mut() {
            c.clear(self.pool);
        }
        self.consts.clear();
        if let Some(mut v) = self.out.take() {
            v.clear(self.pool);
        }
    }

    fn run(&mut self) -> Result<(), DecodeError> {
        while self.remain > 0 {
            if self.read_token()? {
                self.remain -= 1;
            }
        }
        Ok(())
    }

    fn expect(&mut self, n: u64) -> Result<(), DecodeError> {
        let at = self.rd.offset;
        self.remain = self
            .remain
            .checked_add(n)
            .ok_or(DecodeError::Overflow(at))?;
        if self.remain > self.limits.max_size {
            return Err(DecodeError::TooLarge(at));
        }
        Ok(())
    }

    /// Read one token. Returns whether it produced a value (a
    /// define-constants block does not).
    fn read_token(&mut self) -> Result<bool, DecodeError> {
        let at = self.rd.offset;
        let lead = self.rd.take()?;
        let op = lead >> 5;
        let low = lead & 0b11111;

        if op == 0 {
            if lead == 0 {
                self.emit(Variant::Null)?;
                return Ok(true);
            }
            if lead & 0b11110 == 0b00010 {
                self.emit(Variant::Bool(lead & 1 != 0))?;
                return Ok(true);
            }
            if lead & 0b11100 == 0b00100 {
                let f = match lead & 0b11 {
                    0 => f32::from_le_bytes(self.read_array::<4>()?) as f64,
                    1 => f64::from_le_bytes(self.read_array::<8>()?),
                    2 => self.read_uleb(0)? as f64,
                    _ => -(self.read_uleb(0)? as f64),
                };
                self.emit(Variant::Float(f))?;
                return Ok(true);
            }
            if lead == 0b01000 {
                self.define_constants()?;
                return Ok(false);
            }
            return Err(DecodeError::BadOpcode(at));
        }

        let n = self.read_num5(low)?;
        match op {
            1 => self.emit(Variant::Uint(n))?,
            2 => self.emit(Variant::Int(negate(n).ok_or(DecodeError::BadNegative(at))?))?,
            3 => {
                if n > self.limits.max_size {
                    return Err(DecodeError::TooLarge(at));
                }
                let n = n as usize;
                let mut scratch = std::mem::take(&mut self.scratch);
                let res = self.rd.read_n(n, &mut scratch);
                self.scratch = scratch;
                res?;
                let v = Variant::str(self.pool, &self.scratch);
                self.emit(v)?;
            }
            4 => {
                if n == 0 {
                    self.emit(Variant::Array(Vec::new()))?;
                } else {
                    self.expect(n)?;
                    self.push_frame(Frame::Arr {
                        items: Vec::with_capacity(n.min(4096) as usize),
                        size: n,
                    })?;
                    // The array itself resolves when its last element
                    // arrives; it still consumes one slot from `remain`
                    // like any other value token.
                }
            }
            5 => {
                if n == 0 {
                    self.emit(Variant::new_map())?;
                } else {
                    let slots = n.checked_mul(2).ok_or(DecodeError::Overflow(at))?;
                    self.expect(slots)?;
                    self.push_frame(Frame::Map {
                        map: tree::VMap::new(),
                        pending_key: None,
                        slots,
                    })?;
                }
            }
            6 => {
                if n >= self.consts.len() as u64 {
                    return Err(DecodeError::BadConstant(at));
                }
                let c = self.consts[n as usize].clone_in(self.pool);
                self.emit(c)?;
            }
            _ => return Err(DecodeError::BadOpcode(at)),
        }
        Ok(true)
    }

    fn push_frame(&mut self, f: Frame) -> Result<(), DecodeError> {
        if self.frames.len() >= self.limits.max_depth {
            // The frame's contents were not built yet; nothing to release
            // beyond the frame value itself.
            match f {
                Frame::Map { mut map, .. } => map.clear(self.pool),
                _ => {}
            }
            return Err(DecodeError::TooDeep(self.rd.offset));
        }
        self.frames.push(f);
        Ok(())
    }

    fn define_constants(&mut self) -> Result<(), DecodeError> {
        let at = self.rd.offset;
        let start = self.read_uleb(0)?;
        let count = self.read_uleb(0)?;
        if count == 0 {
            return Ok(());
        }
        let end = start
            .checked_add(count)
            .ok_or(DecodeError::Overflow(at))?;
        if end > self.limits.max_constants {
            return Err(DecodeError::TooLarge(at));
        }
        // Overwriting previously defined slots is allowed; they are
        // cleared in place as new definitions arrive.
        if self.consts.len() < end as usize {
            self.consts.resize_with(end as usize, || Variant::Null);
        }
        self.expect(count)?;
        self.push_frame(Frame::Ctab { next: start, end })
    }

    /// Route a finished value into the innermost frame, closing filled
    /// frames along the way.
    fn emit(&mut self, v: Variant) -> Result<(), DecodeError> {
        let mut v = v;
        loop {
            match self.frames.last_mut() {
                None => {
                    if let Some(mut prev) = self.out.replace(v) {
                        // Cannot happen while `remain` accounting holds.
                        prev.clear(self.pool);
                    }
                    return Ok(());
                }
                Some(Frame::Arr { items, size }) => {
                    items.push(v);
                    if items.len() as u64 == *size {
                        let Some(Frame::Arr { items, .. }) = self.frames.pop() else {
                            unreachable!("frame kind changed underneath us");
                        };
                        v = Variant::Array(items);
                        continue;
                    }
                    return Ok(());
                }
                Some(Frame::Map {
                    map,
                    pending_key,
                    slots,
                }) => {
                    *slots -= 1;
                    match pending_key.take() {
                        None => match v {
                            Variant::Str(ps) => {
                                *pending_key = Some(ps.handle);
                            }
                            mut other => {
                                let at = self.rd.offset;
                                // Put the slot back so release() stays
                                // consistent, then fail.
                                *slots += 1;
                                other.clear(self.pool);
                                return Err(DecodeError::KeyNotString(at));
                            }
                        },
                        Some(k) => {
                            map.put(self.pool, k, v);
                            // put() takes its own key reference on fresh
                            // inserts; drop the one the string token gave
                            // us either way.
                            self.pool.decref(k);
                        }
                    }
                    if *slots == 0 {
                        let Some(Frame::Map { map, .. }) = self.frames.pop() else {
                            unreachable!("frame kind changed underneath us");
                        };
                        v = Variant::Map(Box::new(map));
                        continue;
                    }
                    return Ok(());
                }
                Some(Frame::Ctab { next, end }) => {
                    let idx = *next as usize;
                    *next += 1;
                    let finished = *next == *end;
                    self.consts[idx].clear(self.pool);
                    self.consts[idx] = v;
                    if finished {
                        self.frames.pop();
                    }
                    return Ok(());
                }
            }
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        for b in out.iter_mut() {
            *b = self.rd.take()?;
        }
        Ok(out)
    }

    /// Low-5-bit small value: below 31 it is the value; 31 means a ULEB128
    /// continuation is added on top.
    fn read_num5(&mut self, low: u8) -> Result<u64, DecodeError> {
        if low < 0b11111 {
            Ok(low as u64)
        } else {
            self.read_uleb(low as u64)
        }
    }

    /// ULEB128 added onto `base`. Rejects encodings wider than 64 bits and
    /// any addition that overflows.
    fn read_uleb(&mut self, base: u64) -> Result<u64, DecodeError> {
        let mut acc = base;
        let mut shift = 0u32;
        loop {
            let at = self.rd.offset;
            let c = self.rd.take()?;
            let chunk = (c & 0x7f) as u64;
            if shift >= 64 || (shift > 0 && chunk << shift >> shift != chunk) {
                return Err(DecodeError::Overflow(at));
            }
            acc = acc
                .checked_add(chunk << shift)
                .ok_or(DecodeError::Overflow(at))?;
            if c & 0x80 == 0 {
                return Ok(acc);
            }
            shift += 7;
        }
    }
}

/// `-n` as i64, tolerating `-0` and rejecting magnitudes beyond
/// `i64::MIN`.
fn negate(n: u64) -> Option<i64> {
    if n == 0 {
        Some(0)
    } else if n <= i64::MAX as u64 {
        Some(-(n as i64))
    } else if n == i64::MAX as u64 + 1 {
        Some(i64::MIN)
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dec(bytes: &[u8]) -> Result<(StringPool, Variant), DecodeError> {
        let mut pool = StringPool::new();
        let v = decode(&mut pool, bytes, &Limits::default())?;
        Ok((pool, v))
    }

    #[test]
    fn scalars() {
        assert!(dec(&[0x00]).unwrap().1.is_null());
        assert!(matches!(dec(&[0x02]).unwrap().1, Variant::Bool(false)));
        assert!(matches!(dec(&[0x03]).unwrap().1, Variant::Bool(true)));
        assert!(matches!(dec(&[0x25]).unwrap().1, Variant::Uint(5)));
        // 31 + uleb(1) = 32
        assert!(matches!(dec(&[0x3f, 0x01]).unwrap().1, Variant::Uint(32)));
        assert!(matches!(dec(&[0x45]).unwrap().1, Variant::Int(-5)));
        // Negative zero decodes as plain zero.
        assert!(matches!(dec(&[0x40]).unwrap().1, Variant::Int(0)));
    }

    #[test]
    fn floats() {
        // Positive int-as-float: lead 0b00110, uleb 7.
        let (_, v) = dec(&[0x06, 0x07]).unwrap();
        assert!(matches!(v, Variant::Float(f) if f == 7.0));
        let (_, v) = dec(&[0x07, 0x07]).unwrap();
        assert!(matches!(v, Variant::Float(f) if f == -7.0));
        // f32 LE.
        let mut b = vec![0x04];
        b.extend_from_slice(&1.5f32.to_le_bytes());
        assert!(matches!(dec(&b).unwrap().1, Variant::Float(f) if f == 1.5));
        // f64 LE.
        let mut b = vec![0x05];
        b.extend_from_slice(&(-2.25f64).to_le_bytes());
        assert!(matches!(dec(&b).unwrap().1, Variant::Float(f) if f == -2.25));
    }

    #[test]
    fn strings_arrays_maps() {
        // "hi" = STRING(3<<5) | len 2, then bytes.
        let (pool, v) = dec(&[0x62, b'h', b'i']).unwrap();
        assert_eq!(v.as_str(&pool), Some(&b"hi"[..]));

        // [1, "a"]
        let (pool, v) = dec(&[0x82, 0x21, 0x61, b'a']).unwrap();
        let a = v.array().unwrap();
        assert!(matches!(a[0], Variant::Uint(1)));
        assert_eq!(a[1].as_str(&pool), Some(&b"a"[..]));

        // {"k": 7}
        let (pool, v) = dec(&[0xa1, 0x61, b'k', 0x27]).unwrap();
        let m = v.map().unwrap();
        let k = pool.lookup(b"k").unwrap();
        assert!(matches!(m.get(k), Some(Variant::Uint(7))));
    }

    #[test]
    fn empty_containers() {
        assert!(matches!(dec(&[0x80]).unwrap().1, Variant::Array(a) if a.is_empty()));
        assert!(matches!(dec(&[0xa0]).unwrap().1, Variant::Map(m) if m.is_empty()));
    }

    #[test]
    fn constants_round_trip() {
        // define 1 constant "xx" at 0, then a 2-array of two copies.
        let bytes = [
            0x08, 0x00, 0x01, 0x62, b'x', b'x', // def consts [0,1): "xx"
            0x82, 0xc0, 0xc0, // array [COPY 0, COPY 0]
        ];
        let (pool, v) = dec(&bytes).unwrap();
        let a = v.array().unwrap();
        assert_eq!(a[0].as_str(&pool), Some(&b"xx"[..]));
        assert_eq!(a[1].as_str(&pool), Some(&b"xx"[..]));
    }

    #[test]
    fn constants_misuse_fails() {
        // COPY of an undefined index.
        assert!(matches!(
            dec(&[0xc1]),
            Err(DecodeError::BadConstant(_))
        ));
    }

    #[test]
    fn map_key_must_be_string() {
        // MAP with 1 pair whose key is an int.
        assert!(matches!(
            dec(&[0xa1, 0x21, 0x21]),
            Err(DecodeError::KeyNotString(_))
        ));
    }

    #[test]
    fn truncation_fails_cleanly() {
        // Map of 2 pairs, cut mid-way.
        let bytes = [0xa2, 0x61, b'k', 0x27];
        assert!(matches!(dec(&bytes), Err(DecodeError::Truncated(_))));
        // Pool stayed balanced even though a key was interned.
        let mut pool = StringPool::new();
        let _ = decode(&mut pool, &bytes[..], &Limits::default());
        assert!(pool.is_empty());
    }

    #[test]
    fn uleb_rejects_oversized() {
        // 11 continuation bytes exceed a u64.
        let mut b = vec![0x3f];
        b.extend_from_slice(&[0xff; 10]);
        b.push(0x01);
        assert!(matches!(dec(&b), Err(DecodeError::Overflow(_))));
    }

    #[test]
    fn reserved_value_bits_fail() {
        for lead in [0x01u8, 0x09, 0x0a, 0x10, 0x1f] {
            assert!(
                matches!(dec(&[lead]), Err(DecodeError::BadOpcode(_))),
                "lead {lead:#x}"
            );
        }
    }

    #[test]
    fn depth_limit_holds() {
        // Deeply nested single-element arrays.
        let n = 2000usize;
        let mut b = vec![0x81u8; n];
        b.push(0x00);
        let mut pool = StringPool::new();
        let limits = Limits::default();
        assert!(matches!(
            decode(&mut pool, &b[..], &limits),
            Err(DecodeError::TooDeep(_))
        ));
        assert!(pool.is_empty());
    }
}
