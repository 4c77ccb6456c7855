use crate::map::VMap;
use crate::pool::StringPool;
use crate::variant::Variant;
use crate::Error;

/// Merge behavior flags. The zero value is a flat merge: every source key
/// overwrites the destination key with a clone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeFlags {
    /// Recurse where both sides hold maps instead of overwriting.
    pub recursive: bool,
    /// Append cloned elements where both sides hold arrays.
    pub append_arrays: bool,
    /// Keep existing destination values.
    pub no_overwrite: bool,
}

impl MergeFlags {
    pub const FLAT: MergeFlags = MergeFlags {
        recursive: false,
        append_arrays: false,
        no_overwrite: false,
    };
    pub const RECURSIVE: MergeFlags = MergeFlags {
        recursive: true,
        ..Self::FLAT
    };

    pub fn with_append_arrays(mut self) -> Self {
        self.append_arrays = true;
        self
    }

    pub fn with_no_overwrite(mut self) -> Self {
        self.no_overwrite = true;
        self
    }
}

/// Merge `src` into a tree root. A map source merges into the (possibly
/// coerced-to-map) destination; a non-map source may only replace a Null
/// root — against a populated tree it fails without touching anything.
/// Not atomic across subtrees; callers hold the tree's write lock.
pub fn merge_root(
    dpool: &mut StringPool,
    dst: &mut Variant,
    spool: &StringPool,
    src: &Variant,
    flags: MergeFlags,
) -> Result<(), Error> {
    match src {
        Variant::Map(sm) => {
            let dm = match dst {
                Variant::Map(dm) => &mut **dm,
                other => other.make_map(dpool),
            };
            merge_maps(dpool, dm, spool, sm, flags);
            Ok(())
        }
        _ if dst.is_null() => {
            *dst = src.clone_across(spool, dpool);
            Ok(())
        }
        _ => Err(Error::MergeTopLevel),
    }
}

/// Merge the entries of `src` into `dst` according to `flags`.
pub fn merge_maps(
    dpool: &mut StringPool,
    dst: &mut VMap,
    spool: &StringPool,
    src: &VMap,
    flags: MergeFlags,
) {
    for (k, v) in src.iter() {
        let Some(kb) = spool.get(k) else {
            debug_assert!(false, "source map key resolves to no bytes");
            continue;
        };
        let existed = dst.get_bytes(dpool, kb).is_some();
        let slot = dst.put_key(dpool, kb);
        match (slot, v) {
            (Variant::Map(dm), Variant::Map(sm)) if flags.recursive => {
                merge_maps(dpool, dm, spool, sm, flags);
            }
            (Variant::Array(da), Variant::Array(sa)) if flags.append_arrays && existed => {
                for e in sa.iter() {
                    da.push(e.clone_across(spool, dpool));
                }
            }
            (slot, v) => {
                if existed && flags.no_overwrite {
                    continue;
                }
                let mut old = std::mem::replace(slot, v.clone_across(spool, dpool));
                old.clear(dpool);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::json;

    fn load(pool: &mut StringPool, s: &str) -> Variant {
        json::parse(pool, s.as_bytes()).expect("test json parses")
    }

    fn dump(pool: &StringPool, v: &Variant) -> serde_json::Value {
        serde_json::from_str(&json::to_string(pool, v, false)).expect("writer emits valid json")
    }

    #[test]
    fn flat_merge_overwrites_source_keys() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"a":1,"b":{"x":1}}"#);
        let s = load(&mut sp, r#"{"b":2,"c":3}"#);
        merge_root(&mut dp, &mut d, &sp, &s, MergeFlags::FLAT).unwrap();
        assert_eq!(
            dump(&dp, &d),
            serde_json::json!({"a":1, "b":2, "c":3})
        );
        let mut s = s;
        s.clear(&mut sp);
        d.clear(&mut dp);
        assert!(dp.is_empty());
    }

    #[test]
    fn empty_source_is_identity() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"a":1}"#);
        let s = load(&mut sp, r#"{}"#);
        merge_root(&mut dp, &mut d, &sp, &s, MergeFlags::FLAT).unwrap();
        assert_eq!(dump(&dp, &d), serde_json::json!({"a":1}));
        d.clear(&mut dp);
    }

    #[test]
    fn recursive_merge_agrees_with_flat_at_leaves() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"m":{"keep":1,"hit":2},"x":0}"#);
        let s = load(&mut sp, r#"{"m":{"hit":9,"new":3}}"#);
        merge_root(&mut dp, &mut d, &sp, &s, MergeFlags::RECURSIVE).unwrap();
        assert_eq!(
            dump(&dp, &d),
            serde_json::json!({"m":{"keep":1,"hit":9,"new":3},"x":0})
        );
        d.clear(&mut dp);
    }

    #[test]
    fn no_overwrite_preserves_existing() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"a":1}"#);
        let s = load(&mut sp, r#"{"a":9,"b":2}"#);
        merge_root(
            &mut dp,
            &mut d,
            &sp,
            &s,
            MergeFlags::FLAT.with_no_overwrite(),
        )
        .unwrap();
        assert_eq!(dump(&dp, &d), serde_json::json!({"a":1,"b":2}));
        d.clear(&mut dp);
    }

    #[test]
    fn append_arrays_extends() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"a":[1,2]}"#);
        let s = load(&mut sp, r#"{"a":[3]}"#);
        merge_root(
            &mut dp,
            &mut d,
            &sp,
            &s,
            MergeFlags::RECURSIVE.with_append_arrays(),
        )
        .unwrap();
        assert_eq!(dump(&dp, &d), serde_json::json!({"a":[1,2,3]}));
        d.clear(&mut dp);
    }

    #[test]
    fn non_map_into_populated_tree_fails_unchanged() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = load(&mut dp, r#"{"a":1}"#);
        let s = load(&mut sp, r#"[1,2,3]"#);
        let err = merge_root(&mut dp, &mut d, &sp, &s, MergeFlags::FLAT);
        assert!(matches!(err, Err(Error::MergeTopLevel)));
        assert_eq!(dump(&dp, &d), serde_json::json!({"a":1}));
        d.clear(&mut dp);
    }

    #[test]
    fn non_map_replaces_null_root() {
        let mut dp = StringPool::new();
        let mut sp = StringPool::new();
        let mut d = Variant::Null;
        let s = load(&mut sp, r#"[1,2]"#);
        merge_root(&mut dp, &mut d, &sp, &s, MergeFlags::FLAT).unwrap();
        assert_eq!(dump(&dp, &d), serde_json::json!([1, 2]));
        d.clear(&mut dp);
    }
}
