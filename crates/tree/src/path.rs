use crate::pool::StringPool;
use crate::variant::Variant;
use crate::Error;

/// Split a pointer path into unescaped segments. `""` addresses the root;
/// anything else must start with `/`. `~1` encodes `/`, `~0` encodes `~`.
fn segments(path: &str) -> Result<impl Iterator<Item = String> + '_, Error> {
    if path.is_empty() {
        // An iterator with no segments.
        return Ok(PathIter { rest: None });
    }
    let Some(rest) = path.strip_prefix('/') else {
        return Err(Error::InvalidPath);
    };
    Ok(PathIter { rest: Some(rest) })
}

struct PathIter<'a> {
    rest: Option<&'a str>,
}

impl Iterator for PathIter<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = self.rest?;
        let (seg, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };
        self.rest = tail;
        Some(seg.replace("~1", "/").replace("~0", "~"))
    }
}

/// Strict decimal index: all digits, no sign, no leading junk.
fn parse_index(seg: &str) -> Result<usize, Error> {
    if seg.is_empty() || !seg.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::BadIndex(seg.to_string()));
    }
    seg.parse::<usize>()
        .map_err(|_| Error::BadIndex(seg.to_string()))
}

/// Resolve `path` against `root` without modifying anything. Fetchers are
/// never triggered here; `Tree::get_or_fetch` layers that on top.
pub fn subtree<'v>(
    pool: &StringPool,
    root: &'v Variant,
    path: &str,
) -> Result<&'v Variant, Error> {
    let mut cur = root;
    for seg in segments(path)? {
        cur = match cur {
            Variant::Map(m) => pool
                .lookup(seg.as_bytes())
                .and_then(|h| m.get(h))
                .ok_or(Error::NoSuchNode)?,
            Variant::Array(a) => {
                let idx = parse_index(&seg)?;
                a.get(idx).ok_or(Error::NoSuchNode)?
            }
            _ => return Err(Error::NoSuchNode),
        };
    }
    Ok(cur)
}

/// Resolve `path` for mutation. With `create`, missing map keys are
/// inserted (as Null), arrays are extended with Nulls to reach a numeric
/// index, and non-container intermediates are coerced to maps. A
/// non-numeric segment against an array fails even with `create`.
pub fn subtree_mut<'v>(
    pool: &mut StringPool,
    root: &'v mut Variant,
    path: &str,
    create: bool,
) -> Result<&'v mut Variant, Error> {
    let mut cur = root;
    for seg in segments(path)? {
        if create && !cur.is_container() {
            cur.make_map(pool);
        }
        cur = match cur {
            Variant::Map(m) => {
                if create {
                    m.put_key(pool, seg.as_bytes())
                } else {
                    pool.lookup(seg.as_bytes())
                        .and_then(|h| m.get_mut(h))
                        .ok_or(Error::NoSuchNode)?
                }
            }
            Variant::Array(a) => {
                let idx = parse_index(&seg)?;
                if create && idx >= a.len() {
                    a.resize_with(idx + 1, || Variant::Null);
                }
                a.get_mut(idx).ok_or(Error::NoSuchNode)?
            }
            _ => return Err(Error::NoSuchNode),
        };
    }
    Ok(cur)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::json;

    fn fixture(pool: &mut StringPool) -> Variant {
        json::parse(
            pool,
            br#"{"a": {"b": [10, 20, {"c": true}]}, "": 5, "x~y": 1, "s/t": 2}"#,
        )
        .unwrap()
    }

    #[test]
    fn reads_follow_maps_and_arrays() {
        let mut pool = StringPool::new();
        let root = fixture(&mut pool);
        assert!(matches!(
            subtree(&pool, &root, "/a/b/1"),
            Ok(Variant::Uint(20))
        ));
        assert!(matches!(
            subtree(&pool, &root, "/a/b/2/c"),
            Ok(Variant::Bool(true))
        ));
        // Empty path is the root; empty segment is the empty key.
        assert!(matches!(subtree(&pool, &root, ""), Ok(Variant::Map(_))));
        assert!(matches!(subtree(&pool, &root, "/"), Ok(Variant::Uint(5))));
        // Escapes.
        assert!(matches!(
            subtree(&pool, &root, "/x~0y"),
            Ok(Variant::Uint(1))
        ));
        assert!(matches!(
            subtree(&pool, &root, "/s~1t"),
            Ok(Variant::Uint(2))
        ));
        let mut root = root;
        root.clear(&mut pool);
    }

    #[test]
    fn read_failures() {
        let mut pool = StringPool::new();
        let root = fixture(&mut pool);
        assert!(matches!(
            subtree(&pool, &root, "/missing"),
            Err(Error::NoSuchNode)
        ));
        assert!(matches!(
            subtree(&pool, &root, "/a/b/7"),
            Err(Error::NoSuchNode)
        ));
        assert!(matches!(
            subtree(&pool, &root, "/a/b/nope"),
            Err(Error::BadIndex(_))
        ));
        assert!(matches!(
            subtree(&pool, &root, "/a/b/1/deeper"),
            Err(Error::NoSuchNode)
        ));
        assert!(matches!(
            subtree(&pool, &root, "no-slash"),
            Err(Error::InvalidPath)
        ));
        let mut root = root;
        root.clear(&mut pool);
    }

    #[test]
    fn create_builds_intermediate_maps() {
        let mut pool = StringPool::new();
        let mut root = Variant::Null;
        *subtree_mut(&mut pool, &mut root, "/a/b/c", true).unwrap() = Variant::Int(1);
        assert!(matches!(
            subtree(&pool, &root, "/a/b/c"),
            Ok(Variant::Int(1))
        ));
        // Scalars on the way are coerced to maps.
        *subtree_mut(&mut pool, &mut root, "/a/b/c/d", true).unwrap() = Variant::Int(2);
        assert!(matches!(
            subtree(&pool, &root, "/a/b/c/d"),
            Ok(Variant::Int(2))
        ));
        root.clear(&mut pool);
        assert!(pool.is_empty());
    }

    #[test]
    fn create_extends_arrays_but_rejects_bad_indices() {
        let mut pool = StringPool::new();
        let mut root = fixture(&mut pool);
        *subtree_mut(&mut pool, &mut root, "/a/b/4", true).unwrap() = Variant::Int(9);
        {
            let arr = subtree(&pool, &root, "/a/b").unwrap().array().unwrap();
            assert_eq!(arr.len(), 5);
            assert!(arr[3].is_null());
        }
        assert!(matches!(
            subtree_mut(&mut pool, &mut root, "/a/b/key", true),
            Err(Error::BadIndex(_))
        ));
        root.clear(&mut pool);
    }
}
