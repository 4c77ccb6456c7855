//! Recursive-descent compiler for the query language.
//!
//! The grammar (`;` is the escape character — JSON already owns `\`):
//!
//! ```text
//! unquoted-text = (literal-text? evalroot)... literal-text?
//! evalroot      = "$"<ident> | "$"<ident>"(" args ")" | "${" expr "}"
//! expr          = eval modlist
//! eval          = literal | fncall | varref | "." | "~" | rooted-mods
//! varref        = "$"<ident>
//! fncall        = <ident>"(" expr ("," expr)* ")"
//! modlist       = mod*
//! mod           = selector | transform | lookup
//! selector      = "[" selection "]"
//! selection     = keycmp | keysel | range | "*"
//! keycmp        = <idstr> binop (literal | expr)
//! keysel        = ("keep"|"drop"|"key") <idstr>("="<idstr>)? ...
//! range         = entry ("," entry)*   entry = n | n":"m | ":"m | n":"
//! transform     = "|" <ident> | "|" fncall
//! lookup        = "/" <idstr>
//! ```
//!
//! A whole input that starts with `/` or `[` is a rooted query (an
//! implicit push of the input root); inside `${...}` a bare identifier in
//! eval position reads a variable and bare identifiers after the eval are
//! transform applications. Dynamic selection by expression is not
//! supported and fails to parse.
//!
//! Failed attempts roll back both emitted commands and literals (literals
//! are cleared against the executable's pool), and the error carries the
//! furthest byte reached.

use tree::{CompareMode, RangeEntry, Variant};

use crate::exec::{Cmd, Executable, KeySelOp, LitIdx, Sel};

/// Compile failure with the furthest position reached and a rendered
/// caret diagnostic.
#[derive(Debug, thiserror::Error)]
#[error("query parse error at byte {pos}:\n{rendered}")]
pub struct ParseError {
    pub pos: usize,
    pub rendered: String,
}

/// Compile `src` into `exe`, returning the entry instruction index.
/// Instruction 0 is always a `DONE` sentinel, so 0 never names a valid
/// entry point.
pub fn parse(exe: &mut Executable, src: &str) -> Result<usize, ParseError> {
    if exe.cmds.is_empty() {
        exe.cmds.push(Cmd::Done);
    }
    let start = exe.cmds.len();

    let mut p = Parser {
        exe,
        src: src.as_bytes(),
        pos: 0,
        max_pos: 0,
        notes: Vec::new(),
    };

    let ok = p.attempt(Parser::parse_rooted_query)
        || p.attempt(|p| p.parse_unquoted_text() && p.at_end());

    if ok {
        p.exe.cmds.push(Cmd::Done);
        Ok(start)
    } else {
        let pos = p.max_pos.min(src.len());
        let mut rendered = String::with_capacity(src.len() + pos + 32);
        rendered.push_str(src);
        rendered.push('\n');
        rendered.extend(std::iter::repeat(' ').take(pos));
        rendered.push_str("^-- parse error here");
        for n in &p.notes {
            rendered.push('\n');
            rendered.push_str(n);
        }
        Err(ParseError { pos, rendered })
    }
}

/// Literal scanned from the source, converted to a pooled variant only
/// when it is actually emitted.
enum LitVal {
    Null,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
}

#[derive(Default)]
struct ModCtx {
    /// Whether the preceding modifier left individual elements (rather
    /// than containers) on top; decides the `Sel` source of filters.
    unpacked: bool,
}

struct Snapshot {
    pos: usize,
    cmds: usize,
    lits: usize,
}

struct Parser<'e, 's> {
    exe: &'e mut Executable,
    src: &'s [u8],
    pos: usize,
    max_pos: usize,
    notes: Vec<String>,
}

impl Parser<'_, '_> {
    // --- machinery ---

    fn snap(&self) -> Snapshot {
        Snapshot {
            pos: self.pos,
            cmds: self.exe.cmds.len(),
            lits: self.exe.literals.len(),
        }
    }

    fn rewind(&mut self, s: Snapshot) {
        self.max_pos = self.max_pos.max(self.pos);
        self.pos = s.pos;
        self.exe.cmds.truncate(s.cmds);
        while self.exe.literals.len() > s.lits {
            if let Some(mut v) = self.exe.literals.pop() {
                v.clear(&mut self.exe.pool);
            }
        }
    }

    fn attempt(&mut self, f: impl FnOnce(&mut Self) -> bool) -> bool {
        let s = self.snap();
        if f(self) {
            true
        } else {
            self.rewind(s);
            false
        }
    }

    fn attempt_opt<T>(&mut self, f: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        let s = self.snap();
        match f(self) {
            Some(t) => Some(t),
            None => {
                self.rewind(s);
                None
            }
        }
    }

    fn emit(&mut self, c: Cmd) {
        self.exe.cmds.push(c);
    }

    fn add_lit_str(&mut self, bytes: &[u8]) -> LitIdx {
        let v = Variant::str(&mut self.exe.pool, bytes);
        self.exe.add_literal(v)
    }

    fn add_lit(&mut self, lv: LitVal) -> LitIdx {
        let v = match lv {
            LitVal::Null => Variant::Null,
            LitVal::Bool(b) => Variant::Bool(b),
            LitVal::Uint(u) => Variant::Uint(u),
            LitVal::Int(i) => Variant::Int(i),
            LitVal::Float(f) => Variant::Float(f),
            LitVal::Str(s) => Variant::str(&mut self.exe.pool, &s),
        };
        self.exe.add_literal(v)
    }

    // --- low-level scanning ---

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
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
        if self.src[self.pos..].starts_with(w) {
            self.pos += w.len();
            true
        } else {
            false
        }
    }

    fn skip_space(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_space_req(&mut self) -> bool {
        let before = self.pos;
        self.skip_space();
        self.pos != before
    }

    /// Text until an unescaped stop byte or end of input. `;` drops
    /// itself and strips the next byte of special meaning (`;;` emits
    /// one `;`). Returns the text and whether a stop byte terminated it
    /// (the stop byte is not consumed).
    fn take_text_until(&mut self, stops: &[u8]) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut esc = false;
        while let Some(c) = self.peek() {
            if esc {
                out.push(c);
                esc = false;
                self.pos += 1;
                continue;
            }
            if stops.contains(&c) {
                return (out, true);
            }
            if c == b';' {
                esc = true;
            } else {
                out.push(c);
            }
            self.pos += 1;
        }
        (out, false)
    }

    fn parse_ident(&mut self) -> Option<Vec<u8>> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }
        (self.pos != start).then(|| self.src[start..self.pos].to_vec())
    }

    fn parse_str_literal(&mut self) -> Option<Vec<u8>> {
        self.attempt_opt(|p| {
            let quote = match p.peek() {
                Some(q @ (b'\'' | b'"')) => q,
                _ => return None,
            };
            p.pos += 1;
            let (text, terminated) = p.take_text_until(&[quote]);
            if !terminated {
                return None;
            }
            p.pos += 1;
            Some(text)
        })
    }

    fn parse_ident_or_str(&mut self) -> Option<Vec<u8>> {
        self.parse_ident().or_else(|| self.parse_str_literal())
    }

    fn parse_decimal(&mut self) -> Option<u64> {
        let start = self.pos;
        let mut v: u64 = 0;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            v = v.checked_mul(10)?.checked_add((c - b'0') as u64)?;
            self.pos += 1;
        }
        (self.pos != start).then_some(v)
    }

    fn parse_num(&mut self) -> Option<LitVal> {
        self.attempt_opt(|p| {
            let neg = p.eat(b'-');
            let int = p.parse_decimal();
            // Fractional part; a bare trailing '.' is put back.
            let frac = if p.eat(b'.') {
                let fstart = p.pos;
                match p.parse_decimal() {
                    Some(m) => {
                        let digits = (p.pos - fstart) as u32;
                        Some(m as f64 / 10f64.powi(digits as i32))
                    }
                    None => {
                        p.pos -= 1;
                        None
                    }
                }
            } else {
                None
            };
            match (int, frac) {
                (None, None) => None,
                (Some(i), None) => {
                    if !neg {
                        Some(LitVal::Uint(i))
                    } else if i <= i64::MAX as u64 + 1 {
                        Some(LitVal::Int((i as i128).wrapping_neg() as i64))
                    } else {
                        None
                    }
                }
                (i, Some(f)) => {
                    let v = i.unwrap_or(0) as f64 + f;
                    Some(LitVal::Float(if neg { -v } else { v }))
                }
            }
        })
    }

    fn parse_literal(&mut self) -> Option<LitVal> {
        if let Some(s) = self.parse_str_literal() {
            return Some(LitVal::Str(s));
        }
        if let Some(n) = self.parse_num() {
            return Some(n);
        }
        if self.eat_word(b"true") {
            return Some(LitVal::Bool(true));
        }
        if self.eat_word(b"false") {
            return Some(LitVal::Bool(false));
        }
        if self.eat_word(b"null") {
            return Some(LitVal::Null);
        }
        None
    }

    // --- top level ---

    /// A whole input that is one query rooted at the input tree:
    /// `/rooms[open=true]/id`.
    fn parse_rooted_query(&mut self) -> bool {
        let mut ctx = ModCtx::default();
        self.skip_space();
        if !self.parse_implicit_root(&mut ctx, false) {
            return false;
        }
        self.parse_modlist(&mut ctx, false);
        self.skip_space();
        self.at_end()
    }

    fn parse_unquoted_text(&mut self) -> bool {
        self.attempt(|p| {
            let mut parts: u32 = 0;
            loop {
                let (text, hit) = p.take_text_until(b"$");
                if !text.is_empty() {
                    let lit = p.add_lit_str(&text);
                    p.emit(Cmd::Literal { lit });
                    parts += 1;
                }
                if !hit {
                    break;
                }
                if !p.parse_eval_root() {
                    return false;
                }
                parts += 1;
            }
            if parts == 0 {
                return false;
            }
            if parts > 1 {
                p.emit(Cmd::Concat { parts });
            }
            true
        })
    }

    /// `$var`, `$func(...)` or `${ expr }`.
    fn parse_eval_root(&mut self) -> bool {
        self.attempt(|p| {
            if !p.eat(b'$') {
                return false;
            }
            if p.parse_fncall(0, false).is_some() {
                return true;
            }
            let braced = |p: &mut Self| {
                if !p.eat(b'{') {
                    return false;
                }
                p.skip_space();
                p.parse_expr(true) && p.eat(b'}')
            };
            if p.attempt(braced) {
                return true;
            }
            if let Some(id) = p.parse_ident_or_str() {
                if p.peek() == Some(b'(') {
                    p.notes.push(
                        "'(' after a variable reference in text mode; this usually means a \
                         $func(...) parameter list failed to parse"
                            .to_string(),
                    );
                    return false;
                }
                let name = p.add_lit_str(&id);
                p.emit(Cmd::GetVar { name });
                return true;
            }
            false
        })
    }

    // --- expressions ---

    fn parse_expr(&mut self, braced: bool) -> bool {
        let mut ctx = ModCtx::default();
        if !self.parse_eval(&mut ctx, braced) {
            return false;
        }
        self.parse_modlist(&mut ctx, braced)
    }

    fn parse_eval(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        if self.eat(b'.') {
            self.skip_space();
            self.emit(Cmd::Dup { depth: 0 });
            return true;
        }
        if self.eat(b'~') {
            self.skip_space();
            self.emit(Cmd::PushRoot);
            return true;
        }
        if self.parse_and_emit_literal() {
            return true;
        }
        if self.parse_fncall(0, braced).is_some() {
            return true;
        }
        if self.attempt(|p| p.eat(b'$') && p.parse_and_emit_varref()) {
            return true;
        }
        if self.parse_implicit_root(ctx, braced) {
            return true;
        }
        if braced {
            // Inside braces a bare identifier reads a variable.
            if let Some(id) = self.parse_ident() {
                let name = self.add_lit_str(&id);
                self.emit(Cmd::GetVar { name });
                return true;
            }
        }
        false
    }

    /// A leading lookup or selector binds to an implicitly pushed input
    /// root.
    fn parse_implicit_root(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        if !matches!(self.peek(), Some(b'/' | b'[')) {
            return false;
        }
        let s = self.snap();
        self.emit(Cmd::PushRoot);
        let mut inner = ModCtx::default();
        let ok = self.parse_mod(&mut inner, braced);
        if ok {
            ctx.unpacked = inner.unpacked;
            true
        } else {
            self.rewind(s);
            false
        }
    }

    fn parse_and_emit_varref(&mut self) -> bool {
        let Some(id) = self.parse_ident_or_str() else {
            return false;
        };
        let name = self.add_lit_str(&id);
        self.emit(Cmd::GetVar { name });
        true
    }

    fn parse_and_emit_literal(&mut self) -> bool {
        self.attempt(|p| {
            let Some(lit) = p.parse_literal() else {
                return false;
            };
            match lit {
                // A string literal is template text of its own.
                LitVal::Str(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => p.parse_subexpr(&text),
                    Err(_) => false,
                },
                other => {
                    let idx = p.add_lit(other);
                    p.emit(Cmd::Literal { lit: idx });
                    true
                }
            }
        })
    }

    /// Compile the contents of a string literal as unquoted text against
    /// the same executable.
    fn parse_subexpr(&mut self, text: &str) -> bool {
        let mut sub = Parser {
            exe: &mut *self.exe,
            src: text.as_bytes(),
            pos: 0,
            max_pos: 0,
            notes: Vec::new(),
        };
        let ok = sub.parse_unquoted_text() && sub.at_end();
        let notes = std::mem::take(&mut sub.notes);
        self.notes.extend(notes);
        ok
    }

    fn parse_fncall(&mut self, extra_args: u32, braced: bool) -> Option<String> {
        self.attempt_opt(|p| {
            let id = p.parse_ident()?;
            p.skip_space();
            if !p.eat(b'(') {
                return None;
            }
            let n = p.parse_expr_list(braced);
            if n == 0 {
                return None;
            }
            p.skip_space();
            if !p.eat(b')') {
                return None;
            }
            let name = String::from_utf8_lossy(&id).into_owned();
            let lit = p.add_lit_str(&id);
            p.emit(Cmd::CallFn {
                argc: n + extra_args,
                name: lit,
            });
            Some(name)
        })
    }

    fn parse_expr_list(&mut self, braced: bool) -> u32 {
        let s = self.snap();
        self.skip_space();
        if !self.parse_expr(braced) {
            self.rewind(s);
            return 0;
        }
        let mut n = 1;
        loop {
            let s2 = self.snap();
            self.skip_space();
            if self.eat(b',') {
                self.skip_space();
                if self.parse_expr(braced) {
                    n += 1;
                    continue;
                }
                // A comma not followed by an expression sinks the whole
                // list.
                self.rewind(s2);
                return 0;
            }
            self.rewind(s2);
            return n;
        }
    }

    // --- modifiers ---

    fn parse_modlist(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        loop {
            self.skip_space();
            if !self.parse_mod(ctx, braced) {
                break;
            }
        }
        self.skip_space();
        true
    }

    fn parse_mod(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        if self.parse_selector(ctx, braced) {
            return true;
        }
        if self.parse_transform(ctx, braced) {
            return true;
        }
        if self.parse_lookup(ctx) {
            return true;
        }
        if braced && self.parse_bare_transform(ctx) {
            return true;
        }
        false
    }

    fn parse_lookup(&mut self, ctx: &mut ModCtx) -> bool {
        self.attempt(|p| {
            if !p.eat(b'/') {
                return false;
            }
            p.skip_space();
            let Some(id) = p.parse_ident_or_str() else {
                return false;
            };
            let key = p.add_lit_str(&id);
            p.emit(Cmd::Lookup { key });
            ctx.unpacked = false;
            true
        })
    }

    /// `| name` or `| func(args...)`; the piped value becomes the first
    /// argument.
    fn parse_transform(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        self.attempt(|p| {
            if !p.eat(b'|') {
                return false;
            }
            p.skip_space();
            let name = if let Some(n) = p.parse_fncall(1, braced) {
                n
            } else if let Some(id) = p.parse_ident_or_str() {
                let n = String::from_utf8_lossy(&id).into_owned();
                let lit = p.add_lit_str(&id);
                p.emit(Cmd::CallFn { argc: 1, name: lit });
                n
            } else {
                return false;
            };
            ctx.unpacked = name == "unpack";
            true
        })
    }

    /// Inside braces, a bare identifier after the eval is a transform:
    /// `${P compact array}`.
    fn parse_bare_transform(&mut self, ctx: &mut ModCtx) -> bool {
        self.attempt(|p| {
            let Some(id) = p.parse_ident() else {
                return false;
            };
            let name = p.add_lit_str(&id);
            p.emit(Cmd::CallFn { argc: 1, name });
            ctx.unpacked = id == b"unpack";
            true
        })
    }

    fn parse_selector(&mut self, ctx: &mut ModCtx, braced: bool) -> bool {
        self.attempt(|p| {
            if !p.eat(b'[') {
                return false;
            }
            let Some(unpacked_after) = p.parse_selection(ctx, braced) else {
                return false;
            };
            if !p.eat(b']') {
                return false;
            }
            ctx.unpacked = unpacked_after;
            true
        })
    }

    /// The inside of `[...]`. Returns whether the result is unpacked
    /// elements. Dynamic selection by expression is unsupported.
    fn parse_selection(&mut self, ctx: &mut ModCtx, braced: bool) -> Option<bool> {
        self.skip_space();
        if self.parse_keycmp(ctx, braced) {
            self.skip_space();
            return Some(true);
        }
        if self.parse_keysel() {
            self.skip_space();
            return Some(false);
        }
        if let Some(rs) = self.parse_range() {
            let mut v = Variant::Null;
            v.set_range(&mut self.exe.pool, &rs);
            let range = self.exe.add_literal(v);
            self.emit(Cmd::SelectLit { range });
            self.skip_space();
            return Some(false);
        }
        if self.eat(b'*') {
            let name = self.add_lit_str(b"unpack");
            self.emit(Cmd::CallFn { argc: 1, name });
            self.skip_space();
            return Some(true);
        }
        None
    }

    fn parse_keycmp(&mut self, ctx: &ModCtx, braced: bool) -> bool {
        self.attempt(|p| {
            let Some(id) = p.parse_ident_or_str() else {
                return false;
            };
            p.skip_space();
            let Some((op, invert)) = p.parse_binop() else {
                return false;
            };
            p.skip_space();
            let sel = if ctx.unpacked { Sel::STACK } else { Sel::OBJECT };
            if let Some(lv) = p.attempt_opt(Parser::parse_literal) {
                let key = p.add_lit_str(&id);
                let value = p.add_lit(lv);
                p.emit(Cmd::CheckKey {
                    op,
                    invert,
                    key,
                    value,
                    sel,
                });
                return true;
            }
            if p.parse_expr(braced) {
                let key = p.add_lit_str(&id);
                p.emit(Cmd::FilterKey {
                    op,
                    invert,
                    key,
                    sel,
                });
                return true;
            }
            false
        })
    }

    fn parse_binop(&mut self) -> Option<(CompareMode, bool)> {
        use CompareMode::*;
        // Longer operators first so `<=` is not read as `<`.
        const OPS: &[(&[u8], CompareMode, bool)] = &[
            (b"==", Eq, false),
            (b"<>", Eq, true),
            (b"!=", Eq, true),
            (b">=", Lt, true),
            (b"<=", Gt, true),
            (b"??", Contains, false),
            (b"?<", StartsWith, false),
            (b"?>", EndsWith, false),
            (b"=", Eq, false),
            (b"<", Lt, false),
            (b">", Gt, false),
        ];
        self.attempt_opt(|p| {
            let neg = p.eat(b'!');
            for (text, mode, inv) in OPS {
                if p.eat_word(text) {
                    return Some((*mode, *inv != neg));
                }
            }
            None
        })
    }

    /// `keep a=b c`, `drop a b`, `key name`.
    fn parse_keysel(&mut self) -> bool {
        self.attempt(|p| {
            let op = if p.eat_word(b"keep") {
                KeySelOp::Keep
            } else if p.eat_word(b"drop") {
                KeySelOp::Drop
            } else if p.eat_word(b"key") {
                KeySelOp::Key
            } else {
                return false;
            };
            if !p.skip_space_req() {
                return false;
            }
            let mut map = tree::VMap::new();
            let mut n = 0usize;
            loop {
                let s = p.snap();
                let Some(k) = p.parse_ident_or_str() else {
                    break;
                };
                let mut val = k.clone();
                if op == KeySelOp::Keep {
                    let s2 = p.snap();
                    p.skip_space();
                    if p.eat(b'=') {
                        p.skip_space();
                        match p.parse_ident_or_str() {
                            Some(v) => val = v,
                            None => {
                                p.rewind(s);
                                break;
                            }
                        }
                    } else {
                        p.rewind(s2);
                    }
                }
                p.skip_space();
                let value = Variant::str(&mut p.exe.pool, &val);
                let slot = map.put_key(&mut p.exe.pool, &k);
                let mut old = std::mem::replace(slot, value);
                old.clear(&mut p.exe.pool);
                n += 1;
            }
            if n == 0 {
                map.clear(&mut p.exe.pool);
                return false;
            }
            let lit = p.exe.add_literal(Variant::Map(Box::new(map)));
            p.emit(Cmd::KeySel { op, map: lit });
            true
        })
    }

    /// `:5`, `1:`, `2:5`, `7` — stored as inclusive `[first, last]`
    /// pairs; `a:b` keeps its half-open surface feel by storing
    /// `[a, b-1]`.
    fn parse_range(&mut self) -> Option<Vec<RangeEntry>> {
        self.attempt_opt(|p| {
            let mut rs = Vec::new();
            loop {
                p.skip_space();
                let Some(r) = p.parse_range_entry() else {
                    break;
                };
                rs.push(r);
                p.skip_space();
                // The last comma is optional.
                p.eat(b',');
            }
            (!rs.is_empty()).then_some(rs)
        })
    }

    fn parse_range_entry(&mut self) -> Option<RangeEntry> {
        self.attempt_opt(|p| {
            let mut any = false;
            let first = match p.parse_decimal() {
                Some(x) => {
                    any = true;
                    x
                }
                None => 0,
            };
            p.skip_space();
            if p.eat(b':') {
                p.skip_space();
                let end = match p.parse_decimal() {
                    Some(x) => {
                        any = true;
                        x
                    }
                    None => u64::MAX,
                };
                if !any {
                    return None;
                }
                let last = match end {
                    u64::MAX => u64::MAX,
                    // An empty half-open range selects nothing.
                    0 => return Some(RangeEntry { first: 1, last: 0 }),
                    e => e - 1,
                };
                Some(RangeEntry { first, last })
            } else if any {
                Some(RangeEntry { first, last: first })
            } else {
                None
            }
        })
    }
}
