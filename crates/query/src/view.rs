use bumpalo::Bump;

use tree::{StringPool, Variant};

use crate::exec::{EntryPoint, Executable};
use crate::parser::{parse, ParseError};
use crate::vm::{Vm, VmError};

#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    #[error("view key {context:?} failed to compile: {err}")]
    Compile { context: String, err: ParseError },
    #[error("view key {0:?} is not a string value")]
    KeyNotString(String),
    #[error("view definition has no 'result' key")]
    NoResult,
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// A named view: one executable, its entry points, and a result template.
///
/// The template is the user's `result` value with every string compiled
/// into an entry point and replaced in place by an opaque pointer holding
/// the entry instruction index. Producing a response clones the template
/// into the request's pool and swaps each pointer for the evaluation
/// result.
pub struct View {
    exe: Executable,
    entry_points: Vec<EntryPoint>,
    template: Variant,
}

impl Drop for View {
    fn drop(&mut self) {
        let mut t = std::mem::take(&mut self.template);
        t.clear(&mut self.exe.pool);
    }
}

impl View {
    /// Load a view definition: a map whose `result` key is the template
    /// and whose other keys are named sub-expressions, or any non-map
    /// value used as the template directly.
    pub fn load(def_pool: &StringPool, def: &Variant) -> Result<View, ViewError> {
        let mut exe = Executable::new();
        let mut entry_points = Vec::new();

        let template_src = match def {
            Variant::Map(m) => {
                let mut result = None;
                for (k, v) in m.iter() {
                    let key = def_pool.get_str(k).unwrap_or_default().to_string();
                    if key == "result" {
                        result = Some(v);
                        continue;
                    }
                    let Some(code) = v.as_str(def_pool) else {
                        return Err(ViewError::KeyNotString(key));
                    };
                    let code = String::from_utf8_lossy(code).into_owned();
                    let idx = parse(&mut exe, &code).map_err(|err| ViewError::Compile {
                        context: key.clone(),
                        err,
                    })?;
                    tracing::debug!(key = %key, idx, "compiled view entry point");
                    entry_points.push(EntryPoint { name: key, idx });
                }
                result.ok_or(ViewError::NoResult)?
            }
            other => other,
        };

        let mut template = template_src.clone_across(def_pool, &mut exe.pool);
        let mut count = 0usize;
        if let Err(e) = compile_template(&mut template, &mut exe, &mut count) {
            template.clear(&mut exe.pool);
            return Err(e);
        }
        if count == 0 {
            tracing::warn!(
                "view template contains no compilable strings; it will return constant data"
            );
        }

        Ok(View {
            exe,
            entry_points,
            template,
        })
    }

    pub fn entry_points(&self) -> &[EntryPoint] {
        &self.entry_points
    }

    pub fn executable(&self) -> &Executable {
        &self.exe
    }

    /// Evaluate the view against a tree snapshot. `vars` is an optional
    /// map of precomputed variables (request parameters); the reified
    /// template is returned in `dst_pool`.
    pub fn produce(
        &self,
        tree_pool: &StringPool,
        root: &Variant,
        vars_pool: &StringPool,
        vars: Option<&Variant>,
        dst_pool: &mut StringPool,
    ) -> Result<Variant, ViewError> {
        let arena = Bump::new();
        let mut vm = Vm::new(&self.exe, &self.entry_points, &arena, tree_pool);

        match vars {
            Some(Variant::Map(m)) => {
                for (k, v) in m.iter() {
                    let Some(name) = vars_pool.get_str(k) else {
                        continue;
                    };
                    let name = name.to_string();
                    vm.set_var(&name, vars_pool, v);
                }
            }
            Some(v) if !v.is_null() => {
                tracing::error!("view variables are not a map; ignoring them");
            }
            _ => {}
        }

        let mut out = self.template.clone_across(&self.exe.pool, dst_pool);
        if let Err(e) = reify(&mut vm, root, &mut out, dst_pool) {
            out.clear(dst_pool);
            return Err(e.into());
        }
        Ok(out)
    }
}

/// Walk the cloned template and replace every opaque pointer with the
/// outcome of running its entry point: none → null, one → the value,
/// many → an array.
fn reify<'a>(
    vm: &mut Vm<'a>,
    root: &'a Variant,
    v: &mut Variant,
    dst_pool: &mut StringPool,
) -> Result<(), VmError> {
    match v {
        Variant::Ptr(idx) => {
            let start = *idx as usize;
            vm.run(root, start)?;
            *v = vm.export_into(dst_pool);
        }
        Variant::Array(a) => {
            for e in a.iter_mut() {
                reify(vm, root, e, dst_pool)?;
            }
        }
        Variant::Map(m) => {
            for (_, e) in m.iter_mut() {
                reify(vm, root, e, dst_pool)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Compile every string value of the template into an entry point,
/// replacing it with an opaque pointer carrying the entry index.
fn compile_template(
    v: &mut Variant,
    exe: &mut Executable,
    count: &mut usize,
) -> Result<(), ViewError> {
    match v {
        Variant::Str(ps) => {
            let ps = *ps;
            let code = exe
                .pool
                .get(ps.handle)
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let idx = parse(exe, &code).map_err(|err| ViewError::Compile {
                context: code.clone(),
                err,
            })?;
            v.set_ptr(&mut exe.pool, idx as u64);
            *count += 1;
        }
        Variant::Array(a) => {
            for e in a.iter_mut() {
                compile_template(e, exe, count)?;
            }
        }
        Variant::Map(m) => {
            for (_, e) in m.iter_mut() {
                compile_template(e, exe, count)?;
            }
        }
        _ => {}
    }
    Ok(())
}
