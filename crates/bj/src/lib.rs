//! BJ: a compact, self-describing binary JSON encoding.
//!
//! Every token starts with one lead byte: the high 3 bits select an opcode,
//! the low 5 bits hold a small size/value, or `31` to signal that a ULEB128
//! continuation follows (the decoded value is then `31 + uleb`).
//!
//! | op | meaning |
//! |----|---------|
//! | 0  | special values — the low 5 bits dispatch further (null, bool, floats, define-constants) |
//! | 1  | unsigned integer |
//! | 2  | negated integer |
//! | 3  | string; length then raw bytes |
//! | 4  | array; element count then that many values |
//! | 5  | map; pair count then alternating string-key / value |
//! | 6  | copy a constants-table entry |
//!
//! Within op 0: `00000` null, `0001b` bool, `001xx` float (`00` f32 LE,
//! `01` f64 LE, `10`/`11` ±integer widened to float), `01000` defines
//! constants-table slots `[start, start+count)`. All other bit patterns are
//! rejected.
//!
//! Streams begin with [`MAGIC`]: a define-constants block of zero entries
//! using a redundant two-byte ULEB zero, which a decoder skips silently and
//! which cannot begin a JSON document — that is the whole format
//! autodetection story.
//!
//! The decoder handles untrusted input: it is iterative (no recursion on
//! input nesting), all arithmetic is checked, and [`Limits`] bound element
//! counts, constants and depth.

mod dec;
mod enc;

pub use dec::{decode, DecodeError};
pub use enc::{encode, EncodeError};

/// Four-byte stream prefix for format autodetection. Decodes as "define
/// zero constants starting at index zero".
pub const MAGIC: [u8; 4] = [0x08, 0x80, 0x00, 0x00];

/// Does this byte prefix identify a BJ stream?
pub fn is_bj(prefix: &[u8]) -> bool {
    prefix.len() >= 4 && prefix[..4] == MAGIC
}

/// Decoder resource bounds.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Upper bound on outstanding elements and on any single string, in
    /// elements/bytes.
    pub max_size: u64,
    /// Upper bound on constants-table slots.
    pub max_constants: u64,
    /// Upper bound on container nesting.
    pub max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_size: 1 << 30,
            max_constants: 256 * 1024 * 1024,
            max_depth: tree::MAX_DEPTH,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magic_is_a_valid_empty_constants_block() {
        let mut pool = tree::StringPool::new();
        // A stream that is only the magic plus a null decodes to null.
        let mut bytes = MAGIC.to_vec();
        bytes.push(0x00);
        let v = decode(&mut pool, &bytes[..], &Limits::default()).unwrap();
        assert!(v.is_null());
    }

    #[test]
    fn autodetection_against_json() {
        assert!(is_bj(&MAGIC));
        assert!(!is_bj(b"{\"a\": 1}"));
        assert!(!is_bj(b"[1,2,3]"));
        assert!(!is_bj(&MAGIC[..3]));
        // A BJ stream of any payload still leads with the magic.
        let pool = tree::StringPool::new();
        let mut out = Vec::new();
        encode(&mut out, &pool, &tree::Variant::Uint(7)).unwrap();
        assert!(is_bj(&out));
    }
}
