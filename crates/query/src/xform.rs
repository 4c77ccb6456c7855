//! Built-in transform functions. Each consumes its parameter frames and
//! produces one result frame; when invoked as `expr | func`, the piped
//! value is the first parameter. Entries a transform cannot apply to are
//! dropped (`unpack`, `map`) or become null (`toint`), never an error.

use tree::{StrRef, VMap, Variant};

use crate::vm::{Entry, Frame, PoolTag, Vm, VmError};

static NULL_VALUE: Variant = Variant::Null;

pub(crate) fn call<'a>(
    vm: &mut Vm<'a>,
    name: &str,
    args: Vec<Frame<'a>>,
) -> Result<Frame<'a>, VmError> {
    let Some(first) = args.into_iter().next() else {
        return Err(VmError::NotEnoughParams);
    };
    // All builtins take one parameter; extras are accepted and ignored,
    // matching call-by-name dispatch where arity is the callee's problem.
    match name {
        "unpack" => Ok(unpack(vm, first)),
        "toint" => Ok(toint(vm, first)),
        "compact" => Ok(compact(first)),
        "array" => Ok(as_array(vm, first)),
        "map" => Ok(as_map(vm, first)),
        "keys" => Ok(keys(vm, first)),
        _ => Err(VmError::UnknownFunction(name.to_string())),
    }
}

/// Flatten one container level; non-containers are dropped.
fn unpack<'a>(vm: &mut Vm<'a>, arg: Frame<'a>) -> Frame<'a> {
    let mut entries = Vec::new();
    for e in &arg.entries {
        match e.v {
            Variant::Array(a) => {
                for el in a.iter() {
                    entries.push(Entry {
                        v: el,
                        src: e.src,
                        key: StrRef::NONE,
                    });
                }
            }
            Variant::Map(m) => {
                for (k, el) in m.iter() {
                    let key = vm.translate_key(k, e.src);
                    entries.push(Entry {
                        v: el,
                        src: e.src,
                        key,
                    });
                }
            }
            _ => {}
        }
    }
    Frame { entries }
}

/// Integers pass through; strings parse or become null; everything else
/// becomes null.
fn toint<'a>(vm: &mut Vm<'a>, arg: Frame<'a>) -> Frame<'a> {
    let mut entries = Vec::with_capacity(arg.entries.len());
    for e in &arg.entries {
        match e.v {
            Variant::Int(_) | Variant::Uint(_) => entries.push(*e),
            Variant::Str(ps) => {
                let parsed = vm
                    .pool_of(e.src)
                    .get_str(ps.handle)
                    .and_then(|s| s.parse::<i64>().ok());
                match parsed {
                    Some(i) => entries.push(vm.alloc_entry(Variant::Int(i), e.key)),
                    None => entries.push(Entry {
                        v: &NULL_VALUE,
                        src: PoolTag::Vm,
                        key: e.key,
                    }),
                }
            }
            _ => entries.push(Entry {
                v: &NULL_VALUE,
                src: PoolTag::Vm,
                key: e.key,
            }),
        }
    }
    Frame { entries }
}

/// Drop null entries.
fn compact(mut arg: Frame<'_>) -> Frame<'_> {
    arg.entries.retain(|e| !e.v.is_null());
    arg
}

/// Repack all entries as a single array value; keys are lost.
fn as_array<'a>(vm: &mut Vm<'a>, arg: Frame<'a>) -> Frame<'a> {
    let items: Vec<Variant> = arg
        .entries
        .iter()
        .map(|e| vm.clone_entry_value(e.v, e.src))
        .collect();
    let entry = vm.alloc_entry(Variant::Array(items), StrRef::NONE);
    Frame {
        entries: vec![entry],
    }
}

/// Repack entries as a single map keyed by their recorded keys; entries
/// that never had a key are dropped.
fn as_map<'a>(vm: &mut Vm<'a>, arg: Frame<'a>) -> Frame<'a> {
    let mut m = VMap::new();
    for e in &arg.entries {
        if e.key.is_none() {
            continue;
        }
        let kb = match vm.pool_of(PoolTag::Vm).get(e.key) {
            Some(b) => b.to_vec(),
            None => continue,
        };
        let val = vm.clone_entry_value(e.v, e.src);
        vm.map_put(&mut m, &kb, val);
    }
    let entry = vm.alloc_entry(Variant::Map(Box::new(m)), StrRef::NONE);
    Frame {
        entries: vec![entry],
    }
}

/// Emit each entry's key as a string value.
fn keys<'a>(vm: &mut Vm<'a>, arg: Frame<'a>) -> Frame<'a> {
    let mut entries = Vec::new();
    for e in &arg.entries {
        if e.key.is_none() {
            continue;
        }
        let Some(kb) = vm.pool_of(PoolTag::Vm).get(e.key) else {
            continue;
        };
        let kb = kb.to_vec();
        let key = e.key;
        let v = Variant::str(vm.pool_mut(), &kb);
        entries.push(vm.alloc_entry(v, key));
    }
    Frame { entries }
}
