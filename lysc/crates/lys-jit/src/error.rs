//! Compilation errors.
//!
//! Every failure here is non-fatal: the batch driver rolls the affected
//! functions back to their prior state, records one Lisp-level error, and
//! the REPL continues.

use lys_heap::HeapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unresolved symbol '{name}'")]
    Unresolved { name: String },

    #[error("'{name}' does not name a function")]
    NotAFunction { name: String },

    #[error("unsupported construct for compilation: {what}")]
    Unsupported { what: String },

    #[error("wrong argument count for '{what}' in a compiled body")]
    BadArity { what: String },

    #[error("compilation is only supported on x86-64 unix targets")]
    UnsupportedArch,

    #[error(transparent)]
    Heap(#[from] HeapError),
}

pub type Result<T> = std::result::Result<T, CompileError>;
