//! # lys-eval — the tree-walking evaluator
//!
//! The recursive expression interpreter over the shared heap
//! representation:
//!
//! - [`machine`]: the [`Machine`] bundling the heap, the pending-error
//!   ring, the executable-page registry and the session flags.
//! - [`scope`]: lexical scopes as cons chains of `(symbol . value)`
//!   bindings lists.
//! - [`eval`]: the evaluator loop with its tail-call trampoline — `if`
//!   branches, the last form of `progn`, macro expansions and lambda
//!   bodies run without growing the host stack — plus the native-code
//!   dispatcher for `Compiled` lambdas.
//! - [`primitives`]: the closed builtin set with compact argument-count
//!   check macros.
//! - [`error`]: Lisp-level errors and the 16-slot ring the REPL drains.
//!
//! Anything the JIT cannot handle falls back here; the evaluator is the
//! authoritative executor for the whole language.

pub mod error;
pub mod eval;
pub mod machine;
pub mod primitives;
pub mod scope;

pub use error::{ErrorRing, LispError};
pub use eval::{eval, primitive_to_raw, Continuation, NativeEntry, Primitive};
pub use machine::Machine;
pub use primitives::{define_builtin, eval_source, load_file};
