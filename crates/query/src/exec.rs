use tree::{CompareMode, StringPool, Variant};

pub type LitIdx = u32;

/// Where a filtering opcode finds its candidates: the elements inside each
/// value on top of the stack, or the stack entries themselves (after a
/// previous selector already unpacked them).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelSrc {
    Object,
    Stack,
}

/// Source/destination selection for filter opcodes. `repack` folds the
/// surviving elements back into a container of the original kind instead
/// of leaving them unpacked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sel {
    pub src: SelSrc,
    pub repack: bool,
}

impl Sel {
    pub const OBJECT: Sel = Sel {
        src: SelSrc::Object,
        repack: false,
    };
    pub const STACK: Sel = Sel {
        src: SelSrc::Stack,
        repack: false,
    };
}

/// Keyset transforms: keep listed keys (optionally renaming), drop listed
/// keys, or re-key elements by one of their subvalues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySelOp {
    Keep,
    Drop,
    Key,
}

/// One VM instruction. Literal operands index the executable's literal
/// table.
#[derive(Clone, Debug)]
pub enum Cmd {
    /// Replace each value on top with its subkey, dropping values that
    /// have none.
    Lookup { key: LitIdx },
    /// Push a copy of a named variable's entries, evaluating its entry
    /// point on first use.
    GetVar { name: LitIdx },
    /// Pop the value frame; keep top entries whose `key` relates to any
    /// popped value.
    FilterKey {
        op: CompareMode,
        invert: bool,
        key: LitIdx,
        sel: Sel,
    },
    /// Push a frame holding one literal.
    Literal { lit: LitIdx },
    /// Copy the entries of the frame `depth` below the top as a new frame.
    Dup { depth: u32 },
    /// FilterKey against a single literal; the fast path a comparison with
    /// a constant compiles to.
    CheckKey {
        op: CompareMode,
        invert: bool,
        key: LitIdx,
        value: LitIdx,
        sel: Sel,
    },
    /// Keyset transform driven by a map literal.
    KeySel { op: KeySelOp, map: LitIdx },
    /// Array selection by a range literal.
    SelectLit { range: LitIdx },
    /// Array selection by dynamic key. Reserved; never emitted by the
    /// parser and rejected by the VM.
    SelectV,
    /// Pop `parts` frames and push their entry-wise string concatenation.
    Concat { parts: u32 },
    /// Push a copy of the initial input frame.
    PushRoot,
    /// Pop `argc` frames, call the named built-in, push its result.
    CallFn { argc: u32, name: LitIdx },
    /// Drop the top frame.
    Pop,
    /// Halt.
    Done,
}

/// A named start instruction of a view.
#[derive(Clone, Debug)]
pub struct EntryPoint {
    pub name: String,
    pub idx: usize,
}

/// Compiled bytecode plus its literal table. Literals live in the
/// executable's own pool; a VM deep-copies both at init so it outlives
/// neither.
pub struct Executable {
    pub pool: StringPool,
    pub cmds: Vec<Cmd>,
    pub literals: Vec<Variant>,
}

impl Default for Executable {
    fn default() -> Self {
        Self::new()
    }
}

impl Executable {
    pub fn new() -> Self {
        Executable {
            pool: StringPool::new(),
            cmds: Vec::new(),
            literals: Vec::new(),
        }
    }

    pub(crate) fn add_literal(&mut self, lit: Variant) -> LitIdx {
        let idx = self.literals.len() as LitIdx;
        self.literals.push(lit);
        idx
    }

    /// Human-readable listing for the debug endpoints.
    pub fn disasm(&self) -> Vec<String> {
        let lit = |idx: &LitIdx| -> String {
            match self.literals.get(*idx as usize) {
                Some(v) => tree::json::to_string(&self.pool, v, false),
                None => format!("<bad literal {idx}>"),
            }
        };
        let mut out = Vec::with_capacity(self.cmds.len() + self.literals.len() + 1);
        for (i, c) in self.cmds.iter().enumerate() {
            let body = match c {
                Cmd::Lookup { key } => format!("LOOKUP {}", lit(key)),
                Cmd::GetVar { name } => format!("GETVAR {}", lit(name)),
                Cmd::FilterKey {
                    op,
                    invert,
                    key,
                    sel,
                } => format!(
                    "FILTERKEY {}{:?} (key: {}) {:?}",
                    if *invert { "NOT " } else { "" },
                    op,
                    lit(key),
                    sel.src
                ),
                Cmd::Literal { lit: l } => format!("LITERAL {}", lit(l)),
                Cmd::Dup { depth } => format!("DUP {depth}"),
                Cmd::CheckKey {
                    op,
                    invert,
                    key,
                    value,
                    sel,
                } => format!(
                    "CHECKKEY [ {} {}{:?} {} ] {:?}",
                    lit(key),
                    if *invert { "NOT " } else { "" },
                    op,
                    lit(value),
                    sel.src
                ),
                Cmd::KeySel { op, map } => format!("KEYSEL {op:?} {}", lit(map)),
                Cmd::SelectLit { range } => format!("SELECTLIT {}", lit(range)),
                Cmd::SelectV => "SELECTV".to_string(),
                Cmd::Concat { parts } => format!("CONCAT {parts}"),
                Cmd::PushRoot => "PUSHROOT".to_string(),
                Cmd::CallFn { argc, name } => {
                    format!("CALLFN {} (params: {argc})", lit(name))
                }
                Cmd::Pop => "POP".to_string(),
                Cmd::Done => "DONE".to_string(),
            };
            out.push(format!("[{i:4}] {body}"));
        }
        out.push(format!("--- literals[{}] ---", self.literals.len()));
        for (i, v) in self.literals.iter().enumerate() {
            out.push(format!(
                " [{i}] = {}",
                tree::json::to_string(&self.pool, v, false)
            ));
        }
        out
    }
}

impl Drop for Executable {
    fn drop(&mut self) {
        let mut lits = std::mem::take(&mut self.literals);
        for v in lits.iter_mut() {
            v.clear(&mut self.pool);
        }
    }
}
