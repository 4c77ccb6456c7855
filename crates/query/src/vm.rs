use bumpalo::Bump;
use fxhash::FxHashMap;

use tree::{compare, CompareMode, CompareResult, StrRef, StringPool, VMap, Variant};

use crate::exec::{Cmd, EntryPoint, Executable, KeySelOp, Sel, SelSrc};

static NULL_VALUE: Variant = Variant::Null;

/// Execution failure; rendered as a short message the HTTP layer turns
/// into a 500.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("not enough parameters for function call")]
    NotEnoughParams,
    #[error("number of elements in concat mismatched")]
    ConcatMismatch,
    #[error("variable {0:?} does not exist")]
    UnknownVariable(String),
    #[error("variable {0:?} references itself")]
    SelfReference(String),
    #[error("dynamic selection is not supported")]
    Unsupported,
    #[error("invalid entry point")]
    BadEntryPoint,
    #[error("bytecode references a literal that does not exist")]
    BadLiteral,
    #[error("stack underflow")]
    StackUnderflow,
    #[error("entry point left the stack unbalanced")]
    Unbalanced,
}

/// Which pool an entry's strings resolve against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolTag {
    Tree,
    Vm,
}

/// One value on a VM stack frame: a borrowed variant, the pool its
/// strings live in, and the map key it was found under (interned in the
/// VM pool; `NONE` when keyless).
#[derive(Clone, Copy)]
pub struct Entry<'a> {
    pub v: &'a Variant,
    pub src: PoolTag,
    pub key: StrRef,
}

/// One level of the VM stack.
#[derive(Clone, Default)]
pub struct Frame<'a> {
    pub entries: Vec<Entry<'a>>,
}

enum EvalState<'a> {
    Unevaluated(usize),
    /// Currently being evaluated; reading it again is a self-reference.
    Busy,
    Done(Frame<'a>),
}

/// The stack machine. Owns its own string pool; values produced by
/// transforms are allocated into a request-scoped arena, so every stack
/// entry is a plain reference that stays valid for the whole run — there
/// is no pointer fix-up when frames grow. A VM is single-threaded; many
/// VMs may run concurrently against the same tree under its shared read
/// lock.
pub struct Vm<'a> {
    pub(crate) pool: StringPool,
    pub(crate) arena: &'a Bump,
    pub(crate) tree_pool: &'a StringPool,
    pub(crate) literals: Vec<&'a Variant>,
    cmds: Vec<Cmd>,
    evals: FxHashMap<String, EvalState<'a>>,
    stack: Vec<Frame<'a>>,
}

impl<'a> Vm<'a> {
    /// Build a VM from an executable: bytecode and literals are
    /// deep-copied so the VM is independent of the executable's lifetime.
    pub fn new(
        exe: &Executable,
        entry_points: &[EntryPoint],
        arena: &'a Bump,
        tree_pool: &'a StringPool,
    ) -> Vm<'a> {
        let mut pool = StringPool::new();
        let literals = exe
            .literals
            .iter()
            .map(|v| &*arena.alloc(v.clone_across(&exe.pool, &mut pool)))
            .collect();
        let evals = entry_points
            .iter()
            .map(|ep| (ep.name.clone(), EvalState::Unevaluated(ep.idx)))
            .collect();
        Vm {
            pool,
            arena,
            tree_pool,
            literals,
            cmds: exe.cmds.clone(),
            evals,
            stack: Vec::new(),
        }
    }

    /// Install a precomputed variable, replacing any entry point or
    /// previously stored frame of the same name.
    pub fn set_var(&mut self, name: &str, src_pool: &StringPool, value: &Variant) {
        let v: &'a Variant = &*self.arena.alloc(value.clone_across(src_pool, &mut self.pool));
        self.evals.insert(
            name.to_string(),
            EvalState::Done(Frame {
                entries: vec![Entry {
                    v,
                    src: PoolTag::Vm,
                    key: StrRef::NONE,
                }],
            }),
        );
    }

    /// Run from `start` against `root`. The stack is reset; memoized
    /// variable frames survive across runs within one VM.
    pub fn run(&mut self, root: &'a Variant, start: usize) -> Result<(), VmError> {
        self.stack.clear();
        self.stack.push(Frame {
            entries: vec![Entry {
                v: root,
                src: PoolTag::Tree,
                key: StrRef::NONE,
            }],
        });
        self.exec(start)
    }

    /// The top frame's entries, valid until the next run.
    pub fn results(&self) -> &[Entry<'a>] {
        self.stack
            .last()
            .map(|f| f.entries.as_slice())
            .unwrap_or(&[])
    }

    pub fn pool_of(&self, tag: PoolTag) -> &StringPool {
        match tag {
            PoolTag::Tree => self.tree_pool,
            PoolTag::Vm => &self.pool,
        }
    }

    pub fn key_str(&self, e: &Entry<'a>) -> Option<&str> {
        self.pool.get_str(e.key)
    }

    pub fn clone_entry_into(&self, e: Entry<'a>, dst: &mut StringPool) -> Variant {
        e.v.clone_across(self.pool_of(e.src), dst)
    }

    /// Consolidate the results: none → Null, one → the value, many → an
    /// array in produced order.
    pub fn export_into(&self, dst: &mut StringPool) -> Variant {
        let rs = self.results();
        match rs.len() {
            0 => Variant::Null,
            1 => self.clone_entry_into(rs[0], dst),
            _ => Variant::Array(rs.iter().map(|e| self.clone_entry_into(*e, dst)).collect()),
        }
    }

    fn exec(&mut self, start: usize) -> Result<(), VmError> {
        if start >= self.cmds.len() {
            return Err(VmError::BadEntryPoint);
        }
        let mut ip = start;
        loop {
            let cmd = self.cmds.get(ip).ok_or(VmError::BadEntryPoint)?.clone();
            ip += 1;
            match cmd {
                Cmd::Done => return Ok(()),
                Cmd::Lookup { key } => self.op_lookup(key)?,
                Cmd::GetVar { name } => self.op_getvar(name)?,
                Cmd::Literal { lit } => {
                    let v = self.lit(lit)?;
                    self.stack.push(Frame {
                        entries: vec![Entry {
                            v,
                            src: PoolTag::Vm,
                            key: StrRef::NONE,
                        }],
                    });
                }
                Cmd::Dup { depth } => {
                    let idx = self
                        .stack
                        .len()
                        .checked_sub(depth as usize + 1)
                        .ok_or(VmError::StackUnderflow)?;
                    let entries = self.stack[idx].entries.clone();
                    self.stack.push(Frame { entries });
                }
                Cmd::PushRoot => {
                    let entries = self
                        .stack
                        .first()
                        .ok_or(VmError::StackUnderflow)?
                        .entries
                        .clone();
                    self.stack.push(Frame { entries });
                }
                Cmd::Pop => {
                    self.stack.pop().ok_or(VmError::StackUnderflow)?;
                }
                Cmd::CheckKey {
                    op,
                    invert,
                    key,
                    value,
                    sel,
                } => {
                    let v = self.lit(value)?;
                    let values = [Entry {
                        v,
                        src: PoolTag::Vm,
                        key: StrRef::NONE,
                    }];
                    self.op_filter(op, invert, key, sel, &values)?;
                }
                Cmd::FilterKey {
                    op,
                    invert,
                    key,
                    sel,
                } => {
                    let values = self.stack.pop().ok_or(VmError::StackUnderflow)?;
                    self.op_filter(op, invert, key, sel, &values.entries)?;
                }
                Cmd::KeySel { op, map } => self.op_keysel(op, map)?,
                Cmd::SelectLit { range } => self.op_select(range)?,
                Cmd::SelectV => return Err(VmError::Unsupported),
                Cmd::Concat { parts } => self.op_concat(parts)?,
                Cmd::CallFn { argc, name } => self.op_callfn(argc, name)?,
            }
        }
    }

    fn lit(&self, idx: u32) -> Result<&'a Variant, VmError> {
        self.literals
            .get(idx as usize)
            .copied()
            .ok_or(VmError::BadLiteral)
    }

    fn lit_owned_bytes(&self, idx: u32) -> Result<Vec<u8>, VmError> {
        let v = self.lit(idx)?;
        Ok(v.as_str(&self.pool).unwrap_or(b"").to_vec())
    }

    fn take_top_entries(&mut self) -> Result<Vec<Entry<'a>>, VmError> {
        self.stack
            .last_mut()
            .map(|f| std::mem::take(&mut f.entries))
            .ok_or(VmError::StackUnderflow)
    }

    fn put_top_entries(&mut self, entries: Vec<Entry<'a>>) {
        if let Some(f) = self.stack.last_mut() {
            f.entries = entries;
        }
    }

    /// Bring a key handle from an entry's pool into the VM pool.
    pub(crate) fn translate_key(&mut self, k: StrRef, src: PoolTag) -> StrRef {
        match src {
            PoolTag::Vm => k,
            PoolTag::Tree => {
                let Some(bytes) = self.tree_pool.get(k) else {
                    return StrRef::NONE;
                };
                self.pool.intern(bytes)
            }
        }
    }

    pub(crate) fn clone_entry_value(&mut self, v: &Variant, src: PoolTag) -> Variant {
        match src {
            PoolTag::Tree => v.clone_across(self.tree_pool, &mut self.pool),
            PoolTag::Vm => v.clone_in(&mut self.pool),
        }
    }

    pub(crate) fn alloc_entry(&mut self, v: Variant, key: StrRef) -> Entry<'a> {
        Entry {
            v: &*self.arena.alloc(v),
            src: PoolTag::Vm,
            key,
        }
    }

    pub(crate) fn pool_mut(&mut self) -> &mut StringPool {
        &mut self.pool
    }

    /// Insert into a map being built in the VM pool, releasing any value
    /// replaced under the same key.
    pub(crate) fn map_put(&mut self, m: &mut VMap, key: &[u8], val: Variant) {
        let slot = m.put_key(&mut self.pool, key);
        let mut prev = std::mem::replace(slot, val);
        prev.clear(&mut self.pool);
    }

    // --- opcodes ---

    /// Replace each entry on top with its subkey where present, dropping
    /// the rest.
    fn op_lookup(&mut self, key: u32) -> Result<(), VmError> {
        let kb = self.lit_owned_bytes(key)?;
        let mut entries = self.take_top_entries()?;
        let tree_pool = self.tree_pool;
        let vm_pool = &self.pool;
        entries.retain_mut(|e| {
            let pool = match e.src {
                PoolTag::Tree => tree_pool,
                PoolTag::Vm => vm_pool,
            };
            if let Variant::Map(m) = e.v {
                if let Some(sub) = m.get_bytes(pool, &kb) {
                    e.v = sub;
                    return true;
                }
            }
            false
        });
        self.put_top_entries(entries);
        Ok(())
    }

    fn op_getvar(&mut self, name_idx: u32) -> Result<(), VmError> {
        let name = String::from_utf8_lossy(&self.lit_owned_bytes(name_idx)?).into_owned();
        let entries = self.get_var(&name)?;
        self.stack.push(Frame { entries });
        Ok(())
    }

    /// Look a variable up, evaluating and memoizing its entry point on
    /// first use. While a variable evaluates it is marked busy, so a
    /// transitive self-reference errors out instead of looping.
    fn get_var(&mut self, name: &str) -> Result<Vec<Entry<'a>>, VmError> {
        match self.evals.get(name) {
            None => Err(VmError::UnknownVariable(name.to_string())),
            Some(EvalState::Done(f)) => Ok(f.entries.clone()),
            Some(EvalState::Busy) => Err(VmError::SelfReference(name.to_string())),
            Some(EvalState::Unevaluated(ip)) => {
                let ip = *ip;
                self.evals.insert(name.to_string(), EvalState::Busy);
                let depth = self.stack.len();
                match self.exec(ip) {
                    Ok(()) if self.stack.len() == depth + 1 => {
                        let frame = self.stack.pop().unwrap_or_default();
                        let entries = frame.entries.clone();
                        self.evals.insert(name.to_string(), EvalState::Done(frame));
                        Ok(entries)
                    }
                    Ok(()) => {
                        self.stack.truncate(depth);
                        Err(VmError::Unbalanced)
                    }
                    Err(e) => {
                        self.stack.truncate(depth);
                        Err(e)
                    }
                }
            }
        }
    }

    fn filter_match(
        &self,
        cand: &Variant,
        src: PoolTag,
        kb: &[u8],
        op: CompareMode,
        invert: bool,
        values: &[Entry<'a>],
    ) -> bool {
        let Variant::Map(m) = cand else {
            return false;
        };
        let cpool = self.pool_of(src);
        // A missing key filters like an explicit null, so `[k != null]`
        // selects entries that have k at all.
        let sub = m.get_bytes(cpool, kb).unwrap_or(&NULL_VALUE);
        for val in values {
            let vpool = self.pool_of(val.src);
            match compare(op, cpool, sub, vpool, val.v) {
                CompareResult::Na => continue,
                r => {
                    if (r == CompareResult::True) != invert {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn op_filter(
        &mut self,
        op: CompareMode,
        invert: bool,
        key_idx: u32,
        sel: Sel,
        values: &[Entry<'a>],
    ) -> Result<(), VmError> {
        let kb = self.lit_owned_bytes(key_idx)?;
        let old = self.take_top_entries()?;
        let mut out: Vec<Entry<'a>> = Vec::new();

        match sel.src {
            SelSrc::Object => {
                for e in &old {
                    let before = out.len();
                    match e.v {
                        Variant::Array(a) => {
                            for cand in a.iter() {
                                if self.filter_match(cand, e.src, &kb, op, invert, values) {
                                    out.push(Entry {
                                        v: cand,
                                        src: e.src,
                                        key: StrRef::NONE,
                                    });
                                }
                            }
                        }
                        Variant::Map(m) => {
                            for (k, cand) in m.iter() {
                                if self.filter_match(cand, e.src, &kb, op, invert, values) {
                                    let key = self.translate_key(k, e.src);
                                    out.push(Entry {
                                        v: cand,
                                        src: e.src,
                                        key,
                                    });
                                }
                            }
                        }
                        _ => {}
                    }
                    if sel.repack {
                        let packed = self.repack(&out[before..], e.v);
                        let entry = self.alloc_entry(packed, e.key);
                        out.truncate(before);
                        out.push(entry);
                    }
                }
            }
            SelSrc::Stack => {
                for e in &old {
                    if self.filter_match(e.v, e.src, &kb, op, invert, values) {
                        out.push(*e);
                    }
                }
            }
        }

        self.put_top_entries(out);
        Ok(())
    }

    /// Fold filtered elements back into a container of the source's kind.
    fn repack(&mut self, kept: &[Entry<'a>], like: &Variant) -> Variant {
        if matches!(like, Variant::Map(_)) {
            let mut m = VMap::new();
            for e in kept {
                let kb = self.pool.get(e.key).unwrap_or(b"").to_vec();
                let val = self.clone_entry_value(e.v, e.src);
                let slot = m.put_key(&mut self.pool, &kb);
                let mut old = std::mem::replace(slot, val);
                old.clear(&mut self.pool);
            }
            Variant::Map(Box::new(m))
        } else {
            Variant::Array(
                kept.iter()
                    .map(|e| self.clone_entry_value(e.v, e.src))
                    .collect(),
            )
        }
    }

    fn op_keysel(&mut self, op: KeySelOp, map_idx: u32) -> Result<(), VmError> {
        let lit = self.lit(map_idx)?;
        let Variant::Map(lm) = lit else {
            return Err(VmError::BadLiteral);
        };
        let old = self.take_top_entries()?;
        let mut out: Vec<Entry<'a>> = Vec::new();

        for e in &old {
            match op {
                KeySelOp::Keep => {
                    let Variant::Map(srcm) = e.v else { continue };
                    let mut m = VMap::new();
                    for (new_key, old_name) in lm.iter() {
                        let old_b = match old_name.as_str(&self.pool) {
                            Some(b) => b.to_vec(),
                            None => continue,
                        };
                        let Some(x) = srcm.get_bytes(self.pool_of(e.src), &old_b) else {
                            continue;
                        };
                        let val = self.clone_entry_value(x, e.src);
                        let nk = self.pool.get(new_key).unwrap_or(b"").to_vec();
                        let slot = m.put_key(&mut self.pool, &nk);
                        let mut prev = std::mem::replace(slot, val);
                        prev.clear(&mut self.pool);
                    }
                    let entry = self.alloc_entry(Variant::Map(Box::new(m)), e.key);
                    out.push(entry);
                }
                KeySelOp::Drop => {
                    let Variant::Map(srcm) = e.v else { continue };
                    let kept: Vec<(Vec<u8>, &'a Variant)> = {
                        let epool = self.pool_of(e.src);
                        srcm.iter()
                            .filter_map(|(k, v)| {
                                let kb = epool.get(k)?;
                                lm.get_bytes(&self.pool, kb)
                                    .is_none()
                                    .then(|| (kb.to_vec(), v))
                            })
                            .collect()
                    };
                    let mut m = VMap::new();
                    for (kb, v) in kept {
                        let val = self.clone_entry_value(v, e.src);
                        let slot = m.put_key(&mut self.pool, &kb);
                        let mut prev = std::mem::replace(slot, val);
                        prev.clear(&mut self.pool);
                    }
                    let entry = self.alloc_entry(Variant::Map(Box::new(m)), e.key);
                    out.push(entry);
                }
                KeySelOp::Key => {
                    let elements: Vec<&'a Variant> = match e.v {
                        Variant::Map(srcm) => srcm.iter().map(|(_, v)| v).collect(),
                        Variant::Array(a) => a.iter().collect(),
                        _ => continue,
                    };
                    let mut m = VMap::new();
                    for el in elements {
                        for (_, keyname) in lm.iter() {
                            let kb = match keyname.as_str(&self.pool) {
                                Some(b) => b.to_vec(),
                                None => continue,
                            };
                            let Some(sub) = el
                                .map()
                                .and_then(|em| em.get_bytes(self.pool_of(e.src), &kb))
                            else {
                                continue;
                            };
                            let Some(new_key) = sub.as_str(self.pool_of(e.src)) else {
                                continue;
                            };
                            let new_key = new_key.to_vec();
                            let val = self.clone_entry_value(el, e.src);
                            let slot = m.put_key(&mut self.pool, &new_key);
                            let mut prev = std::mem::replace(slot, val);
                            prev.clear(&mut self.pool);
                        }
                    }
                    let entry = self.alloc_entry(Variant::Map(Box::new(m)), e.key);
                    out.push(entry);
                }
            }
        }

        self.put_top_entries(out);
        Ok(())
    }

    /// Array selection by range literal; non-array entries are dropped.
    fn op_select(&mut self, range_idx: u32) -> Result<(), VmError> {
        let lit = self.lit(range_idx)?;
        let Variant::Range(ranges) = lit else {
            return Err(VmError::BadLiteral);
        };
        let old = self.take_top_entries()?;
        let mut out = Vec::new();
        for e in &old {
            let Variant::Array(a) = e.v else { continue };
            let mut items = Vec::new();
            if !a.is_empty() {
                let max = a.len() as u64 - 1;
                for r in ranges.iter() {
                    if r.is_empty() || r.first > max {
                        continue;
                    }
                    let last = r.last.min(max);
                    for i in r.first..=last {
                        items.push(self.clone_entry_value(&a[i as usize], e.src));
                    }
                }
            }
            let entry = self.alloc_entry(Variant::Array(items), e.key);
            out.push(entry);
        }
        self.put_top_entries(out);
        Ok(())
    }

    fn op_concat(&mut self, parts: u32) -> Result<(), VmError> {
        let parts = parts as usize;
        if parts == 0 || self.stack.len() < parts {
            return Err(VmError::StackUnderflow);
        }
        let frames = self.stack.split_off(self.stack.len() - parts);

        let mut target = 0usize;
        let mut any_empty = false;
        for f in &frames {
            let n = f.entries.len();
            if n == 0 {
                any_empty = true;
            }
            target = target.max(n);
        }
        // Concatenating with an empty set yields an empty set.
        if any_empty {
            self.stack.push(Frame::default());
            return Ok(());
        }
        for f in &frames {
            let n = f.entries.len();
            if n != 1 && n != target {
                return Err(VmError::ConcatMismatch);
            }
        }

        let mut entries = Vec::with_capacity(target);
        for k in 0..target {
            let mut text = Vec::new();
            let mut key = StrRef::NONE;
            for f in &frames {
                let e = f.entries[k.min(f.entries.len() - 1)];
                text.extend_from_slice(self.stringify(e).as_bytes());
                if key.is_none() {
                    key = e.key;
                }
            }
            let v = Variant::str(&mut self.pool, &text);
            let entry = self.alloc_entry(v, key);
            entries.push(entry);
        }
        self.stack.push(Frame { entries });
        Ok(())
    }

    fn stringify(&self, e: Entry<'a>) -> String {
        let pool = self.pool_of(e.src);
        match e.v {
            Variant::Null => "null".to_string(),
            Variant::Bool(true) => "true".to_string(),
            Variant::Bool(false) => "false".to_string(),
            Variant::Int(i) => i.to_string(),
            Variant::Uint(u) => u.to_string(),
            Variant::Float(f) => f.to_string(),
            Variant::Str(ps) => {
                String::from_utf8_lossy(pool.get(ps.handle).unwrap_or(b"")).into_owned()
            }
            v @ (Variant::Array(_) | Variant::Map(_)) => tree::json::to_string(pool, v, false),
            Variant::Range(_) | Variant::Ptr(_) => String::new(),
        }
    }

    fn op_callfn(&mut self, argc: u32, name_idx: u32) -> Result<(), VmError> {
        let name = String::from_utf8_lossy(&self.lit_owned_bytes(name_idx)?).into_owned();
        let argc = argc as usize;
        if argc == 0 || self.stack.len() < argc {
            return Err(VmError::StackUnderflow);
        }
        let args = self.stack.split_off(self.stack.len() - argc);
        let frame = crate::xform::call(self, &name, args)?;
        self.stack.push(frame);
        Ok(())
    }
}
