//! JSON interop: a lenient reader and a strict writer.
//!
//! Ingress is middleware-grade lenient: `//` and `/* */` comments,
//! `NaN`/`Infinity` literals, trailing commas, single-quoted strings and
//! `\'` escapes are all accepted, because upstream producers emit all of
//! them. Output is strict JSON (non-finite floats degrade to `null`).
//!
//! The reader is iterative with an explicit frame stack, like the BJ
//! decoder: input nesting depth is bounded by [`crate::MAX_DEPTH`], not by
//! the thread's stack.

use serde::ser::{SerializeMap, SerializeSeq, Serializer};

use crate::map::VMap;
use crate::pool::StringPool;
use crate::variant::Variant;
use crate::{Error, MAX_DEPTH};

/// Parse lenient JSON into a variant backed by `pool`.
pub fn parse(pool: &mut StringPool, bytes: &[u8]) -> Result<Variant, Error> {
    let mut p = Parser {
        b: bytes,
        pos: 0,
        pool,
    };
    p.parse_document()
}

/// Serialize to a writer as strict JSON.
pub fn write<W: std::io::Write>(
    out: W,
    pool: &StringPool,
    v: &Variant,
    pretty: bool,
) -> std::io::Result<()> {
    let r = JsonRef { pool, v };
    let res = if pretty {
        serde_json::to_writer_pretty(out, &r)
    } else {
        serde_json::to_writer(out, &r)
    };
    res.map_err(std::io::Error::from)
}

pub fn to_string(pool: &StringPool, v: &Variant, pretty: bool) -> String {
    let mut buf = Vec::new();
    // Serialization into a Vec cannot fail for well-formed variants.
    if write(&mut buf, pool, v, pretty).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// A `(pool, variant)` pair that implements `serde::Serialize`, so the
/// whole serde_json machinery (compact and pretty writers) works over
/// pooled variants.
pub struct JsonRef<'a> {
    pub pool: &'a StringPool,
    pub v: &'a Variant,
}

impl serde::Serialize for JsonRef<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.v {
            Variant::Null => s.serialize_unit(),
            Variant::Bool(b) => s.serialize_bool(*b),
            Variant::Int(i) => s.serialize_i64(*i),
            Variant::Uint(u) => s.serialize_u64(*u),
            Variant::Float(f) if f.is_finite() => s.serialize_f64(*f),
            // Strict output has no NaN/Inf spelling.
            Variant::Float(_) => s.serialize_unit(),
            Variant::Str(ps) => {
                let bytes = self.pool.get(ps.handle).unwrap_or(b"");
                s.serialize_str(&String::from_utf8_lossy(bytes))
            }
            Variant::Array(a) => {
                let mut seq = s.serialize_seq(Some(a.len()))?;
                for v in a.iter() {
                    seq.serialize_element(&JsonRef { pool: self.pool, v })?;
                }
                seq.end()
            }
            Variant::Map(m) => {
                let mut map = s.serialize_map(Some(m.len()))?;
                for (k, v) in m.iter() {
                    let kb = self.pool.get(k).unwrap_or(b"");
                    map.serialize_entry(
                        &String::from_utf8_lossy(kb),
                        &JsonRef { pool: self.pool, v },
                    )?;
                }
                map.end()
            }
            // Runtime-only kinds; rendered for debugging, never stored in
            // data trees.
            Variant::Range(r) => {
                let mut seq = s.serialize_seq(Some(r.len()))?;
                for e in r.iter() {
                    seq.serialize_element(&[e.first, e.last])?;
                }
                seq.end()
            }
            Variant::Ptr(_) => s.serialize_unit(),
        }
    }
}

enum Frame {
    Arr(Vec<Variant>),
    Obj { map: VMap, key: Option<Vec<u8>> },
}

struct Parser<'b, 'p> {
    b: &'b [u8],
    pos: usize,
    pool: &'p mut StringPool,
}

impl Parser<'_, '_> {
    fn err<T>(&self, msg: &'static str) -> Result<T, Error> {
        Err(Error::Json { pos: self.pos, msg })
    }

    fn peek(&self) -> Option<u8> {
        self.b.get(self.pos).copied()
    }

    fn take(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, w: &[u8]) -> bool {
        if self.b[self.pos..].starts_with(w) {
            self.pos += w.len();
            true
        } else {
            false
        }
    }

    /// Skip whitespace and comments.
    fn trivia(&mut self) -> Result<(), Error> {
        loop {
            match self.peek() {
                Some(b' ' | b'\t' | b'\r' | b'\n') => {
                    self.pos += 1;
                }
                Some(b'/') => match self.b.get(self.pos + 1) {
                    Some(b'/') => {
                        self.pos += 2;
                        while let Some(c) = self.peek() {
                            self.pos += 1;
                            if c == b'\n' {
                                break;
                            }
                        }
                    }
                    Some(b'*') => {
                        self.pos += 2;
                        loop {
                            match self.take() {
                                Some(b'*') if self.peek() == Some(b'/') => {
                                    self.pos += 1;
                                    break;
                                }
                                Some(_) => {}
                                None => return self.err("unterminated block comment"),
                            }
                        }
                    }
                    _ => return Ok(()),
                },
                _ => return Ok(()),
            }
        }
    }

    fn fail_stack(&mut self, stack: &mut Vec<Frame>, mut pending: Option<Variant>) {
        if let Some(v) = pending.as_mut() {
            v.clear(self.pool);
        }
        while let Some(f) = stack.pop() {
            match f {
                Frame::Arr(mut a) => {
                    for v in a.iter_mut() {
                        v.clear(self.pool);
                    }
                }
                Frame::Obj { mut map, .. } => map.clear(self.pool),
            }
        }
    }

    fn parse_document(&mut self) -> Result<Variant, Error> {
        let mut stack: Vec<Frame> = Vec::new();
        let res = self.parse_value(&mut stack);
        match res {
            Ok(mut v) => {
                if let Err(e) = self.trivia() {
                    v.clear(self.pool);
                    return Err(e);
                }
                if self.pos != self.b.len() {
                    v.clear(self.pool);
                    return self.err("trailing garbage after document");
                }
                Ok(v)
            }
            Err(e) => {
                self.fail_stack(&mut stack, None);
                Err(e)
            }
        }
    }

    /// Parse one complete value, driving the container stack iteratively.
    fn parse_value(&mut self, stack: &mut Vec<Frame>) -> Result<Variant, Error> {
        'value: loop {
            self.trivia()?;
            if stack.len() > MAX_DEPTH {
                return self.err("nesting too deep");
            }
            let Some(c) = self.peek() else {
                return self.err("unexpected end of input");
            };
            let mut done: Variant = match c {
                b'[' => {
                    self.pos += 1;
                    self.trivia()?;
                    if self.eat(b']') {
                        Variant::Array(Vec::new())
                    } else {
                        stack.push(Frame::Arr(Vec::new()));
                        continue 'value;
                    }
                }
                b'{' => {
                    self.pos += 1;
                    self.trivia()?;
                    if self.eat(b'}') {
                        Variant::new_map()
                    } else {
                        let key = self.parse_key()?;
                        stack.push(Frame::Obj {
                            map: VMap::new(),
                            key: Some(key),
                        });
                        continue 'value;
                    }
                }
                b'"' | b'\'' => {
                    let s = self.parse_string()?;
                    Variant::str(self.pool, &s)
                }
                b't' => {
                    if self.eat_word(b"true") {
                        Variant::Bool(true)
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'f' => {
                    if self.eat_word(b"false") {
                        Variant::Bool(false)
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'n' => {
                    if self.eat_word(b"null") {
                        Variant::Null
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'N' => {
                    if self.eat_word(b"NaN") {
                        Variant::Float(f64::NAN)
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'I' => {
                    if self.eat_word(b"Infinity") || self.eat_word(b"Inf") {
                        Variant::Float(f64::INFINITY)
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'-' if matches!(self.b.get(self.pos + 1), Some(b'I')) => {
                    self.pos += 1;
                    if self.eat_word(b"Infinity") || self.eat_word(b"Inf") {
                        Variant::Float(f64::NEG_INFINITY)
                    } else {
                        return self.err("bad literal");
                    }
                }
                b'-' | b'.' | b'0'..=b'9' => self.parse_number()?,
                _ => return self.err("unexpected character"),
            };

            // Attach the finished value to the enclosing frames, closing
            // as many as the input closes.
            'attach: loop {
                match stack.last_mut() {
                    None => return Ok(done),
                    Some(Frame::Arr(items)) => {
                        items.push(done);
                        self.trivia()?;
                        if self.eat(b',') {
                            self.trivia()?;
                            if self.eat(b']') {
                                // Trailing comma.
                                done = self.close_frame(stack);
                                continue 'attach;
                            }
                            continue 'value;
                        }
                        if self.eat(b']') {
                            done = self.close_frame(stack);
                            continue 'attach;
                        }
                        return self.err("expected ',' or ']' in array");
                    }
                    Some(Frame::Obj { map, key }) => {
                        let Some(k) = key.take() else {
                            done.clear(self.pool);
                            return self.err("object state lost its key");
                        };
                        let slot = map.put_key(self.pool, &k);
                        let mut old = std::mem::replace(slot, done);
                        old.clear(self.pool);
                        self.trivia()?;
                        let more = if self.eat(b',') {
                            self.trivia()?;
                            !self.eat(b'}')
                        } else if self.eat(b'}') {
                            false
                        } else {
                            return self.err("expected ',' or '}' in object");
                        };
                        if !more {
                            done = self.close_frame(stack);
                            continue 'attach;
                        }
                        let k = self.parse_key()?;
                        match stack.last_mut() {
                            Some(Frame::Obj { key, .. }) => *key = Some(k),
                            _ => return self.err("object state lost"),
                        }
                        continue 'value;
                    }
                }
            }
        }
    }

    fn close_frame(&mut self, stack: &mut Vec<Frame>) -> Variant {
        match stack.pop() {
            Some(Frame::Arr(items)) => Variant::Array(items),
            Some(Frame::Obj { map, .. }) => Variant::Map(Box::new(map)),
            None => Variant::Null,
        }
    }

    fn parse_key(&mut self) -> Result<Vec<u8>, Error> {
        self.trivia()?;
        let key = self.parse_string()?;
        self.trivia()?;
        if !self.eat(b':') {
            return self.err("expected ':' after object key");
        }
        Ok(key)
    }

    fn parse_string(&mut self) -> Result<Vec<u8>, Error> {
        let quote = match self.take() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return self.err("expected string"),
        };
        let mut out = Vec::new();
        loop {
            let Some(c) = self.take() else {
                return self.err("unterminated string");
            };
            match c {
                _ if c == quote => return Ok(out),
                b'\\' => {
                    let Some(esc) = self.take() else {
                        return self.err("unterminated escape");
                    };
                    match esc {
                        b'"' => out.push(b'"'),
                        b'\'' => out.push(b'\''),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'u' => {
                            let cp = self.parse_unicode_escape()?;
                            let mut buf = [0u8; 4];
                            out.extend_from_slice(cp.encode_utf8(&mut buf).as_bytes());
                        }
                        _ => return self.err("bad escape"),
                    }
                }
                _ => out.push(c),
            }
        }
    }

    fn hex4(&mut self) -> Result<u32, Error> {
        let mut v = 0u32;
        for _ in 0..4 {
            let Some(c) = self.take() else {
                return self.err("truncated \\u escape");
            };
            let d = match c {
                b'0'..=b'9' => (c - b'0') as u32,
                b'a'..=b'f' => (c - b'a' + 10) as u32,
                b'A'..=b'F' => (c - b'A' + 10) as u32,
                _ => return self.err("bad \\u escape"),
            };
            v = (v << 4) | d;
        }
        Ok(v)
    }

    fn parse_unicode_escape(&mut self) -> Result<char, Error> {
        let hi = self.hex4()?;
        let cp = if (0xd800..0xdc00).contains(&hi) {
            if !(self.eat(b'\\') && self.eat(b'u')) {
                return self.err("unpaired surrogate");
            }
            let lo = self.hex4()?;
            if !(0xdc00..0xe000).contains(&lo) {
                return self.err("bad low surrogate");
            }
            0x10000 + ((hi - 0xd800) << 10) + (lo - 0xdc00)
        } else if (0xdc00..0xe000).contains(&hi) {
            return self.err("unpaired surrogate");
        } else {
            hi
        };
        char::from_u32(cp).ok_or(Error::Json {
            pos: self.pos,
            msg: "invalid code point",
        })
    }

    fn parse_number(&mut self) -> Result<Variant, Error> {
        let start = self.pos;
        let neg = self.eat(b'-');
        let mut digits = 0usize;
        let mut fraction = false;
        let mut exponent = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {
                    digits += 1;
                    self.pos += 1;
                }
                b'.' if !fraction && !exponent => {
                    fraction = true;
                    self.pos += 1;
                }
                b'e' | b'E' if !exponent && digits > 0 => {
                    exponent = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        if digits == 0 {
            return self.err("malformed number");
        }
        let text = std::str::from_utf8(&self.b[start..self.pos])
            .map_err(|_| Error::Json {
                pos: start,
                msg: "malformed number",
            })?;
        if !fraction && !exponent {
            if neg {
                if let Ok(i) = text.parse::<i64>() {
                    return Ok(Variant::Int(i));
                }
            } else if let Ok(u) = text.parse::<u64>() {
                return Ok(Variant::Uint(u));
            }
            // Integer overflow falls through to float precision.
        }
        match text.parse::<f64>() {
            Ok(f) => Ok(Variant::Float(f)),
            Err(_) => self.err("malformed number"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(input: &str) -> String {
        let mut pool = StringPool::new();
        let mut v = parse(&mut pool, input.as_bytes()).expect("parses");
        let out = to_string(&pool, &v, false);
        v.clear(&mut pool);
        assert!(pool.is_empty(), "pool leaked strings");
        out
    }

    #[test]
    fn strict_documents_round_trip() {
        assert_eq!(roundtrip(r#"{"a":[1,-2,3.5],"b":"x"}"#), r#"{"a":[1,-2,3.5],"b":"x"}"#);
        assert_eq!(roundtrip("[]"), "[]");
        assert_eq!(roundtrip("{}"), "{}");
        assert_eq!(roundtrip("null"), "null");
        assert_eq!(roundtrip(r#""""#), r#""""#);
        assert_eq!(roundtrip("18446744073709551615"), "18446744073709551615");
        assert_eq!(roundtrip("-9223372036854775808"), "-9223372036854775808");
    }

    #[test]
    fn lenient_extras_are_accepted() {
        assert_eq!(
            roundtrip("{\"a\": 1, // comment\n \"b\": [2,], /* block */ }"),
            r#"{"a":1,"b":[2]}"#
        );
        assert_eq!(roundtrip(r#"{'single': 'it\'s'}"#), r#"{"single":"it's"}"#);
        // NaN and infinities parse; strict output degrades them to null.
        assert_eq!(roundtrip("[NaN, Infinity, -Infinity]"), "[null,null,null]");
    }

    #[test]
    fn escapes_and_surrogates() {
        assert_eq!(
            roundtrip(r#""a\u0041\n\t\u00e9\ud83d\ude00""#),
            "\"aA\\n\\t\u{e9}\u{1f600}\""
        );
    }

    #[test]
    fn duplicate_keys_last_wins_without_leaks() {
        assert_eq!(roundtrip(r#"{"k":"first","k":"second"}"#), r#"{"k":"second"}"#);
    }

    #[test]
    fn parse_failures_do_not_leak() {
        let mut pool = StringPool::new();
        for bad in [
            "{",
            "[1, 2",
            r#"{"a": }"#,
            r#"{"a" 1}"#,
            "tru",
            "\"unterminated",
            "[1 2]",
            "{\"a\":1} trailing",
            "/* unterminated",
            "\"\\ud800x\"",
            "01e",
        ] {
            assert!(
                parse(&mut pool, bad.as_bytes()).is_err(),
                "expected failure: {bad}"
            );
            assert!(pool.is_empty(), "leak after: {bad}");
        }
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let depth = MAX_DEPTH + 8;
        let mut s = String::new();
        for _ in 0..depth {
            s.push('[');
        }
        for _ in 0..depth {
            s.push(']');
        }
        let mut pool = StringPool::new();
        assert!(parse(&mut pool, s.as_bytes()).is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn number_kinds() {
        let mut pool = StringPool::new();
        assert!(matches!(
            parse(&mut pool, b"42").unwrap(),
            Variant::Uint(42)
        ));
        assert!(matches!(
            parse(&mut pool, b"-42").unwrap(),
            Variant::Int(-42)
        ));
        assert!(matches!(
            parse(&mut pool, b"4.5").unwrap(),
            Variant::Float(_)
        ));
        assert!(matches!(
            parse(&mut pool, b"1e3").unwrap(),
            Variant::Float(_)
        ));
        // u64 overflow widens to float rather than failing.
        assert!(matches!(
            parse(&mut pool, b"99999999999999999999999").unwrap(),
            Variant::Float(_)
        ));
    }

    #[test]
    fn pretty_output_is_indented() {
        let mut pool = StringPool::new();
        let mut v = parse(&mut pool, br#"{"a":1}"#).unwrap();
        let s = to_string(&pool, &v, true);
        assert!(s.contains('\n'));
        assert!(s.contains("  \"a\": 1"));
        v.clear(&mut pool);
    }
}
