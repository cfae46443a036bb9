//! Symbol resolution (the `freeze` pass).
//!
//! Rewrites a function body so that every symbol is replaced by the value
//! it currently resolves to, with two exceptions: symbols naming a formal
//! parameter stay as symbols, and the function's own name becomes a direct
//! self-reference (the lambda value itself), which the later passes use
//! for recursion detection.
//!
//! Resolution builds a fresh copy of the body and installs it only on
//! success, so a failure partway through leaves the original body intact
//! and batch rollback is a plain state restore. An undefined symbol fails
//! the pass. On success the function moves to the `SymbolsResolved` state:
//! the tree walker runs such bodies unchanged (values evaluate to
//! themselves), just without any further lookups.

use lys_eval::{scope, Machine};
use lys_heap::value::{Value, NIL, UNDEFINED};
use lys_heap::{gc_frame, CompileState};

use crate::error::{CompileError, Result};

/// True when `sym` names a formal parameter of `func`.
pub(crate) fn is_formal(m: &Machine, func: Value, sym: Value) -> bool {
    let mut params = m.heap.func_params(func);
    while params.is_cons() {
        if m.heap.car(params) == sym {
            return true;
        }
        params = m.heap.cdr(params);
    }
    false
}

/// Zero-based index of a formal parameter.
pub(crate) fn formal_index(m: &Machine, func: Value, sym: Value) -> Option<usize> {
    let mut params = m.heap.func_params(func);
    let mut i = 0;
    while params.is_cons() {
        if m.heap.car(params) == sym {
            return Some(i);
        }
        i += 1;
        params = m.heap.cdr(params);
    }
    None
}

/// Resolve the body of `func` (bound as `name`), transitioning it from
/// `NotCompiled` to `SymbolsResolved`. Already-resolved and compiled
/// functions pass through untouched.
pub fn freeze_function(m: &mut Machine, func: Value, name: Value) -> Result<()> {
    if m.heap.func_state(func) != CompileState::NotCompiled {
        return Ok(());
    }
    let mut func = func;
    let mut name = name;
    let mut resolved = NIL;
    gc_frame!(m.heap, [func, name, resolved]);

    resolved = resolve_expr(m, func, name, m.heap.func_body(func))?;
    m.heap.set_func_body(func, resolved);
    m.heap.set_func_state(func, CompileState::SymbolsResolved);
    Ok(())
}

fn resolve_expr(m: &mut Machine, func: Value, name: Value, expr: Value) -> Result<Value> {
    if expr.is_symbol() {
        if is_formal(m, func, expr) {
            return Ok(expr);
        }
        if expr == name {
            return Ok(func);
        }
        let env = {
            let captured = m.heap.func_env(func);
            if captured.is_nil() {
                m.heap.globals()
            } else {
                captured
            }
        };
        let v = scope::lookup(&m.heap, env, expr);
        if v == UNDEFINED {
            return Err(CompileError::Unresolved {
                name: m.heap.symbol_name(expr).to_string(),
            });
        }
        return Ok(v);
    }

    if expr.is_cons() {
        // Copy the spine; every level roots its own locals because the
        // recursion below allocates.
        let mut func = func;
        let mut name = name;
        let mut expr = expr;
        let mut car_r = NIL;
        let mut cdr_r = NIL;
        gc_frame!(m.heap, [func, name, expr, car_r, cdr_r]);

        car_r = resolve_expr(m, func, name, m.heap.car(expr))?;
        cdr_r = resolve_expr(m, func, name, m.heap.cdr(expr))?;
        return Ok(m.heap.alloc_cons(car_r, cdr_r));
    }

    // Numbers, constants, and already-literal values.
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lys_eval::eval;
    use lys_heap::HeapConfig;

    fn machine() -> Machine {
        Machine::new(HeapConfig {
            heap_size: 256 * 1024,
            ..Default::default()
        })
        .unwrap()
    }

    fn run(m: &mut Machine, src: &str) -> Value {
        let mut reader = lys_read::Reader::new(src, &m.heap);
        let mut out = NIL;
        while let Some(form) = reader.read(&mut m.heap).unwrap() {
            let globals = m.heap.globals();
            out = eval(m, globals, form);
        }
        out
    }

    fn lookup_fn(m: &Machine, name: &str) -> Value {
        let mut syms = m.heap.symbols();
        while syms.is_cons() {
            let s = m.heap.car(syms);
            if m.heap.symbol_name(s) == name {
                return scope::lookup(&m.heap, m.heap.globals(), s);
            }
            syms = m.heap.cdr(syms);
        }
        panic!("symbol {name} not interned");
    }

    #[test]
    fn test_freeze_resolves_globals() {
        let mut m = machine();
        run(&mut m, "(defun add1 (x) (+ x 1))");
        let f = lookup_fn(&m, "add1");
        let name = m.heap.intern("add1").unwrap();

        freeze_function(&mut m, f, name).unwrap();
        // Re-fetch: resolution allocates and may have moved the lambda.
        let f = lookup_fn(&m, "add1");
        assert_eq!(m.heap.func_state(f), CompileState::SymbolsResolved);

        // Body head is now the `+` builtin value, not a symbol.
        let body = m.heap.func_body(f);
        assert!(m.heap.car(body).is_builtin());
        // The parameter reference is still a symbol.
        let x = m.heap.car(m.heap.cdr(body));
        assert!(x.is_symbol());
        assert_eq!(m.heap.symbol_name(x), "x");
    }

    #[test]
    fn test_freeze_rewrites_self_reference() {
        let mut m = machine();
        run(&mut m, "(defun f (x) (if (eq x 0) 0 (f (- x 1))))");
        let f = lookup_fn(&m, "f");
        let name = m.heap.intern("f").unwrap();

        freeze_function(&mut m, f, name).unwrap();
        let f = lookup_fn(&m, "f");
        // (if (eq x 0) 0 (f …)) with the else branch's head now the lambda
        // itself.
        let body = m.heap.func_body(f);
        let else_branch = m.heap.car(m.heap.cdr(m.heap.cdr(m.heap.cdr(body))));
        assert_eq!(m.heap.car(else_branch), f);
    }

    #[test]
    fn test_freeze_fails_on_undefined() {
        let mut m = machine();
        run(&mut m, "(defun broken (x) (nonexistent x))");
        let f = lookup_fn(&m, "broken");
        let name = m.heap.intern("broken").unwrap();
        let body_before = m.heap.func_body(f);

        let err = freeze_function(&mut m, f, name).unwrap_err();
        assert!(matches!(err, CompileError::Unresolved { .. }));
        // The original body is untouched and the state did not move.
        assert_eq!(m.heap.func_state(f), CompileState::NotCompiled);
        assert_eq!(m.heap.func_body(f), body_before);
    }

    #[test]
    fn test_frozen_function_still_interpretable() {
        let mut m = machine();
        run(&mut m, "(defun double (x) (+ x x))");
        let f = lookup_fn(&m, "double");
        let name = m.heap.intern("double").unwrap();
        freeze_function(&mut m, f, name).unwrap();

        assert_eq!(run(&mut m, "(double 21)").as_number(), 42);
    }
}
