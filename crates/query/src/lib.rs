//! The view engine: a small query language compiled to bytecode and run by
//! a stack machine over borrowed tree values.
//!
//! A *view* is a result template plus named entry points; each entry point
//! is a compiled expression such as `/rooms[open=true]/id` or
//! `${P compact array}`. At request time a [`Vm`] evaluates entry points
//! against a read-locked tree snapshot and the template is reified into a
//! plain value in the caller's pool.

mod exec;
mod parser;
mod view;
mod vm;
mod xform;

pub use exec::{Cmd, EntryPoint, Executable, KeySelOp, Sel, SelSrc};
pub use parser::{parse, ParseError};
pub use view::{View, ViewError};
pub use vm::{Entry, Frame, PoolTag, Vm, VmError};

// Produced values live in a request-scoped arena; re-export the concrete
// allocator so callers need not import it themselves.
pub use bumpalo::Bump;
