//! Compilability check.
//!
//! A resolved body is compilable iff every sub-expression is one of:
//!
//! - a number,
//! - the constants `nil` / `t`,
//! - a reference to a formal parameter,
//! - a self-call,
//! - a call to another already-`Compiled` function,
//! - a call to an allow-listed primitive: `+ - < eq car cdr if progn
//!   write-char`.
//!
//! Anything else rejects with a diagnostic and the function stays on the
//! interpreted path. Macros are deliberately unreachable from compiled
//! code: a macro value in head position fails here.

use lys_eval::{primitive_to_raw, primitives, Machine};
use lys_heap::value::{Value, NIL, TRUE};
use lys_heap::CompileState;
use lys_read::print_value;

use crate::error::{CompileError, Result};
use crate::resolve::is_formal;

/// The allow-listed primitives, identified by their stored function words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimKind {
    Add,
    Sub,
    Less,
    Eq,
    Car,
    Cdr,
    If,
    Progn,
    WriteChar,
}

/// Classify a builtin's raw function word against the allow-list.
pub fn classify_builtin(raw: usize) -> Option<PrimKind> {
    if raw == primitive_to_raw(primitives::prim_add) {
        Some(PrimKind::Add)
    } else if raw == primitive_to_raw(primitives::prim_sub) {
        Some(PrimKind::Sub)
    } else if raw == primitive_to_raw(primitives::prim_less) {
        Some(PrimKind::Less)
    } else if raw == primitive_to_raw(primitives::prim_eq) {
        Some(PrimKind::Eq)
    } else if raw == primitive_to_raw(primitives::prim_car) {
        Some(PrimKind::Car)
    } else if raw == primitive_to_raw(primitives::prim_cdr) {
        Some(PrimKind::Cdr)
    } else if raw == primitive_to_raw(primitives::prim_if) {
        Some(PrimKind::If)
    } else if raw == primitive_to_raw(primitives::prim_progn) {
        Some(PrimKind::Progn)
    } else if raw == primitive_to_raw(primitives::prim_write_char) {
        Some(PrimKind::WriteChar)
    } else {
        None
    }
}

impl PrimKind {
    /// Argument count constraint: `(min, max)` with `None` for unbounded.
    fn arity(self) -> (usize, Option<usize>) {
        match self {
            PrimKind::Add | PrimKind::Sub => (1, None),
            PrimKind::Less | PrimKind::Eq => (2, Some(2)),
            PrimKind::Car | PrimKind::Cdr | PrimKind::WriteChar => (1, Some(1)),
            PrimKind::If => (3, Some(3)),
            PrimKind::Progn => (0, None),
        }
    }

    fn name(self) -> &'static str {
        match self {
            PrimKind::Add => "+",
            PrimKind::Sub => "-",
            PrimKind::Less => "<",
            PrimKind::Eq => "eq",
            PrimKind::Car => "car",
            PrimKind::Cdr => "cdr",
            PrimKind::If => "if",
            PrimKind::Progn => "progn",
            PrimKind::WriteChar => "write-char",
        }
    }
}

/// Verify that the resolved body of `func` is compilable.
pub fn check(m: &Machine, func: Value, expr: Value) -> Result<()> {
    if expr.is_number() || expr == NIL || expr == TRUE {
        return Ok(());
    }
    if expr.is_symbol() {
        if is_formal(m, func, expr) {
            return Ok(());
        }
        return Err(CompileError::Unsupported {
            what: format!("free symbol '{}'", m.heap.symbol_name(expr)),
        });
    }
    if expr.is_cons() {
        return check_call(m, func, expr);
    }
    Err(CompileError::Unsupported {
        what: print_value(&m.heap, expr),
    })
}

fn check_call(m: &Machine, func: Value, expr: Value) -> Result<()> {
    let head = m.heap.car(expr);
    let args = m.heap.cdr(expr);
    let argc = m.heap.list_len(args).ok_or_else(|| CompileError::Unsupported {
        what: "improper argument list".to_string(),
    })?;

    if head == func {
        // Self-call: the argument count is fixed at compile time.
        let nparams = m.heap.list_len(m.heap.func_params(func)).unwrap_or(0);
        if argc != nparams {
            return Err(CompileError::BadArity {
                what: "recursive call".to_string(),
            });
        }
    } else if head.is_lambda() && m.heap.func_state(head) == CompileState::Compiled {
        let nparams = m.heap.list_len(m.heap.func_params(head)).unwrap_or(0);
        if argc != nparams {
            return Err(CompileError::BadArity {
                what: "call to compiled function".to_string(),
            });
        }
    } else if head.is_builtin() {
        let kind = classify_builtin(m.heap.builtin_fn(head)).ok_or_else(|| {
            CompileError::Unsupported {
                what: "primitive outside the compilable set".to_string(),
            }
        })?;
        let (min, max) = kind.arity();
        if argc < min || max.is_some_and(|mx| argc > mx) {
            return Err(CompileError::BadArity {
                what: kind.name().to_string(),
            });
        }
    } else {
        return Err(CompileError::Unsupported {
            what: print_value(&m.heap, head),
        });
    }

    let mut rest = args;
    while rest.is_cons() {
        check(m, func, m.heap.car(rest))?;
        rest = m.heap.cdr(rest);
    }
    Ok(())
}
