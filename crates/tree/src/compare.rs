use std::cmp::Ordering;

use crate::pool::StringPool;
use crate::variant::Variant;

/// Absolute tolerance used by [`eq`] whenever a float participates in a
/// numeric comparison. This deliberately loose value matches the system
/// this design derives from; [`exact`] ignores it and compares bit
/// patterns.
pub const FLOAT_EQ_EPSILON: f64 = 1e-3;

/// Comparison operator selected by a query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareMode {
    Eq,
    Lt,
    Gt,
    Contains,
    StartsWith,
    EndsWith,
}

/// Three-valued comparison outcome. `Na` means the operands cannot be
/// compared under the requested mode (e.g. ordering a string against a
/// map) and filters skip the entry rather than treating it as false.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    False,
    True,
    Na,
}

impl CompareResult {
    pub fn invert(self) -> CompareResult {
        match self {
            CompareResult::False => CompareResult::True,
            CompareResult::True => CompareResult::False,
            CompareResult::Na => CompareResult::Na,
        }
    }

    fn from_bool(b: bool) -> CompareResult {
        if b {
            CompareResult::True
        } else {
            CompareResult::False
        }
    }
}

/// Mathematical ordering of two numeric variants; `None` unless both are
/// Int/Uint/Float. Integer pairs compare exactly; pairs involving a float
/// compare as f64.
pub fn ord(a: &Variant, b: &Variant) -> Option<Ordering> {
    use Variant::*;
    Some(match (a, b) {
        (Int(x), Int(y)) => x.cmp(y),
        (Uint(x), Uint(y)) => x.cmp(y),
        (Int(x), Uint(y)) => {
            if *x < 0 {
                Ordering::Less
            } else {
                (*x as u64).cmp(y)
            }
        }
        (Uint(x), Int(y)) => {
            if *y < 0 {
                Ordering::Greater
            } else {
                x.cmp(&(*y as u64))
            }
        }
        (Float(x), Float(y)) => x.partial_cmp(y)?,
        (Float(x), Int(y)) => x.partial_cmp(&(*y as f64))?,
        (Float(x), Uint(y)) => x.partial_cmp(&(*y as f64))?,
        (Int(x), Float(y)) => (*x as f64).partial_cmp(y)?,
        (Uint(x), Float(y)) => (*x as f64).partial_cmp(y)?,
        _ => return None,
    })
}

fn numeric_eq(a: &Variant, b: &Variant) -> Option<bool> {
    use Variant::*;
    match (a, b) {
        (Float(_), _) | (_, Float(_)) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            Some((x - y).abs() < FLOAT_EQ_EPSILON)
        }
        _ => Some(ord(a, b)? == Ordering::Equal),
    }
}

/// Structural equality across pools with numeric cross-kind tolerance:
/// Int/Uint/Float compare by mathematical value, and any comparison
/// involving a float uses [`FLOAT_EQ_EPSILON`].
pub fn eq(apool: &StringPool, a: &Variant, bpool: &StringPool, b: &Variant) -> bool {
    use Variant::*;
    match (a, b) {
        (Null, Null) => true,
        (Bool(x), Bool(y)) => x == y,
        (Int(_) | Uint(_) | Float(_), Int(_) | Uint(_) | Float(_)) => {
            numeric_eq(a, b).unwrap_or(false)
        }
        (Str(x), Str(y)) => {
            if std::ptr::eq(apool, bpool) {
                x.handle == y.handle
            } else {
                x.len == y.len && apool.get(x.handle) == bpool.get(y.handle)
            }
        }
        (Array(x), Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(l, r)| eq(apool, l, bpool, r))
        }
        (Map(x), Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    let kb = apool.get(k).unwrap_or(b"");
                    match y.get_bytes(bpool, kb) {
                        Some(ov) => eq(apool, v, bpool, ov),
                        None => false,
                    }
                })
        }
        (Range(x), Range(y)) => x == y,
        (Ptr(x), Ptr(y)) => x == y,
        _ => false,
    }
}

/// Exact comparison: same kind, bitwise numeric equality, deep for
/// containers. This is the relation cache keys and codec round-trip tests
/// use.
pub fn exact(apool: &StringPool, a: &Variant, bpool: &StringPool, b: &Variant) -> bool {
    use Variant::*;
    match (a, b) {
        (Null, Null) => true,
        (Bool(x), Bool(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Uint(x), Uint(y)) => x == y,
        (Float(x), Float(y)) => x.to_bits() == y.to_bits(),
        (Str(x), Str(y)) => {
            if std::ptr::eq(apool, bpool) {
                x.handle == y.handle
            } else {
                apool.get(x.handle) == bpool.get(y.handle)
            }
        }
        (Array(x), Array(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(l, r)| exact(apool, l, bpool, r))
        }
        (Map(x), Map(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| {
                    let kb = apool.get(k).unwrap_or(b"");
                    match y.get_bytes(bpool, kb) {
                        Some(ov) => exact(apool, v, bpool, ov),
                        None => false,
                    }
                })
        }
        (Range(x), Range(y)) => x == y,
        (Ptr(x), Ptr(y)) => x == y,
        _ => false,
    }
}

/// Substring predicates on pooled bytes; `Na` unless both sides are
/// strings.
pub fn str_compare(
    mode: CompareMode,
    apool: &StringPool,
    a: &Variant,
    bpool: &StringPool,
    b: &Variant,
) -> CompareResult {
    let (Some(pa), Some(pb)) = (a.as_str(apool), b.as_str(bpool)) else {
        return CompareResult::Na;
    };
    if pa.len() < pb.len() {
        return CompareResult::False;
    }
    CompareResult::from_bool(match mode {
        CompareMode::StartsWith => pa.starts_with(pb),
        CompareMode::EndsWith => pa.ends_with(pb),
        CompareMode::Contains => pb.is_empty() || pa.windows(pb.len()).any(|w| w == pb),
        _ => return CompareResult::Na,
    })
}

/// Evaluate `a <mode> b` across pools.
pub fn compare(
    mode: CompareMode,
    apool: &StringPool,
    a: &Variant,
    bpool: &StringPool,
    b: &Variant,
) -> CompareResult {
    match mode {
        CompareMode::Eq => CompareResult::from_bool(eq(apool, a, bpool, b)),
        CompareMode::Lt => match ord(a, b) {
            Some(o) => CompareResult::from_bool(o == Ordering::Less),
            None => CompareResult::Na,
        },
        CompareMode::Gt => match ord(a, b) {
            Some(o) => CompareResult::from_bool(o == Ordering::Greater),
            None => CompareResult::Na,
        },
        CompareMode::Contains | CompareMode::StartsWith | CompareMode::EndsWith => {
            str_compare(mode, apool, a, bpool, b)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::variant::PoolStr;

    fn pools() -> (StringPool, StringPool) {
        (StringPool::new(), StringPool::new())
    }

    #[test]
    fn numeric_eq_crosses_kinds() {
        let (a, b) = pools();
        assert!(eq(&a, &Variant::Int(5), &b, &Variant::Uint(5)));
        assert!(eq(&a, &Variant::Uint(5), &b, &Variant::Float(5.0)));
        assert!(eq(&a, &Variant::Float(5.0004), &b, &Variant::Float(5.0)));
        assert!(!eq(&a, &Variant::Float(5.002), &b, &Variant::Float(5.0)));
        assert!(!eq(&a, &Variant::Int(-1), &b, &Variant::Uint(u64::MAX)));
    }

    #[test]
    fn eq_is_reflexive_and_symmetric() {
        let (mut a, mut b) = pools();
        let va = Variant::str(&mut a, b"s");
        let vb = Variant::str(&mut b, b"s");
        assert!(eq(&a, &va, &a, &va));
        assert!(eq(&a, &va, &b, &vb));
        assert!(eq(&b, &vb, &a, &va));
        let mut va = va;
        let mut vb = vb;
        va.clear(&mut a);
        vb.clear(&mut b);
    }

    #[test]
    fn ordering_is_numeric_only() {
        let (mut a, b) = pools();
        assert_eq!(ord(&Variant::Int(1), &Variant::Uint(2)), Some(Ordering::Less));
        assert_eq!(
            ord(&Variant::Uint(3), &Variant::Float(2.5)),
            Some(Ordering::Greater)
        );
        let s = Variant::str(&mut a, b"1");
        assert_eq!(ord(&s, &Variant::Int(1)), None);
        assert_eq!(
            compare(CompareMode::Lt, &a, &s, &b, &Variant::Int(1)),
            CompareResult::Na
        );
        let mut s = s;
        s.clear(&mut a);
    }

    #[test]
    fn string_predicates() {
        let (mut a, mut b) = pools();
        let hay = Variant::str(&mut a, b"hello world");
        let needle = Variant::str(&mut b, b"lo wo");
        assert_eq!(
            compare(CompareMode::Contains, &a, &hay, &b, &needle),
            CompareResult::True
        );
        let pre = Variant::str(&mut b, b"hell");
        assert_eq!(
            compare(CompareMode::StartsWith, &a, &hay, &b, &pre),
            CompareResult::True
        );
        let suf = Variant::str(&mut b, b"world");
        assert_eq!(
            compare(CompareMode::EndsWith, &a, &hay, &b, &suf),
            CompareResult::True
        );
        assert_eq!(
            compare(CompareMode::Contains, &a, &hay, &b, &Variant::Int(1)),
            CompareResult::Na
        );
        for mut v in [hay] {
            v.clear(&mut a);
        }
        for mut v in [needle, pre, suf] {
            v.clear(&mut b);
        }
    }

    #[test]
    fn exact_distinguishes_kinds_and_bits() {
        let (a, b) = pools();
        assert!(!exact(&a, &Variant::Int(5), &b, &Variant::Uint(5)));
        assert!(exact(&a, &Variant::Float(1.5), &b, &Variant::Float(1.5)));
        assert!(!exact(&a, &Variant::Float(1.5), &b, &Variant::Float(1.5 + 1e-9)));
        assert!(eq(&a, &Variant::Int(5), &b, &Variant::Uint(5)));
    }

    #[test]
    fn dead_string_handles_never_equal() {
        let (a, b) = pools();
        // A dangling handle resolves to no bytes and must not compare
        // equal to a live empty string by accident of defaults.
        let dead = Variant::Str(PoolStr {
            handle: crate::StrRef::NONE,
            len: 0,
        });
        let mut b = b;
        let live = Variant::str(&mut b, b"");
        assert!(!eq(&a, &dead, &b, &live));
        let mut live = live;
        live.clear(&mut b);
    }
}
