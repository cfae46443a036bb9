//! The built-in primitives.
//!
//! The set is closed: arithmetic `+ -`, ordering `<`, identity `eq`, list
//! operations `cons car cdr list`, control `if progn quote eval apply`,
//! binding `define defvar defun lambda`, macro support `defmacro
//! macroexpand`, I/O `print write-char rand sleep load exit`, and (in
//! debug builds) `debug`. The JIT crate installs `freeze` and `compile`
//! through [`define_builtin`].
//!
//! Every primitive receives `(machine, scope, raw-argument-forms)` and
//! decides itself which arguments to evaluate. Arity and argument types
//! are enforced with the compact check macros below; a failed check
//! records an error and the primitive yields `nil`.

use std::io::Write;

use lys_heap::value::{Value, NIL, TRUE};
use lys_heap::{gc_frame, HeapError, HeapTag};
use lys_read::{write_value, Reader};

use crate::error::LispError;
use crate::eval::{
    apply_callee, eval, expand_macro, primitive_to_raw, Continuation, Primitive,
};
use crate::machine::Machine;
use crate::scope;

/// Check an exact argument count; on mismatch record and yield `nil`.
macro_rules! args_exact {
    ($m:expr, $name:literal, $args:expr, $n:expr) => {{
        let got = $m.heap.list_len($args).unwrap_or(0);
        if got != $n {
            $m.record_error(LispError::Arity {
                name: $name.to_string(),
                expected: $n.to_string(),
                got,
            });
            return Continuation::Done(NIL);
        }
    }};
}

/// Check a minimum argument count.
macro_rules! args_min {
    ($m:expr, $name:literal, $args:expr, $n:expr) => {{
        let got = $m.heap.list_len($args).unwrap_or(0);
        if got < $n {
            $m.record_error(LispError::Arity {
                name: $name.to_string(),
                expected: format!("at least {}", $n),
                got,
            });
            return Continuation::Done(NIL);
        }
    }};
}

/// Check that an evaluated value is a number.
macro_rules! want_number {
    ($m:expr, $name:literal, $v:expr) => {
        if !$v.is_number() {
            $m.record_error(LispError::Type {
                name: $name,
                expected: "a number",
            });
            return Continuation::Done(NIL);
        }
    };
}

// === Arithmetic and comparison ===

/// `(+ x …)` — integer sum. Wraps at 62 bits.
pub fn prim_add(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_min!(m, "+", args, 1);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let mut acc: i64 = 0;
    while rest.is_cons() {
        let v = eval(m, scope, m.heap.car(rest));
        want_number!(m, "+", v);
        acc = acc.wrapping_add(v.as_number());
        rest = m.heap.cdr(rest);
    }
    Continuation::Done(Value::number(acc))
}

/// `(- x)` negates; `(- x y …)` folds subtraction left.
pub fn prim_sub(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_min!(m, "-", args, 1);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let first = eval(m, scope, m.heap.car(rest));
    want_number!(m, "-", first);
    rest = m.heap.cdr(rest);

    if !rest.is_cons() {
        return Continuation::Done(Value::number(first.as_number().wrapping_neg()));
    }

    let mut acc = first.as_number();
    while rest.is_cons() {
        let v = eval(m, scope, m.heap.car(rest));
        want_number!(m, "-", v);
        acc = acc.wrapping_sub(v.as_number());
        rest = m.heap.cdr(rest);
    }
    Continuation::Done(Value::number(acc))
}

/// `(< a b)` — `t` iff `a < b`.
pub fn prim_less(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "<", args, 2);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let a = eval(m, scope, m.heap.car(rest));
    want_number!(m, "<", a);
    let b = eval(m, scope, m.heap.car(m.heap.cdr(rest)));
    want_number!(m, "<", b);
    Continuation::Done(if a.as_number() < b.as_number() { TRUE } else { NIL })
}

/// `(eq a b)` — word identity: numeric equality on numbers, name equality
/// on symbols (they are interned), pointer identity on everything else.
pub fn prim_eq(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "eq", args, 2);
    let mut scope = scope;
    let mut rest = args;
    let mut a = NIL;
    gc_frame!(m.heap, [scope, rest, a]);

    a = eval(m, scope, m.heap.car(rest));
    let b = eval(m, scope, m.heap.car(m.heap.cdr(rest)));
    Continuation::Done(if a == b { TRUE } else { NIL })
}

// === List operations ===

/// `(cons a b)` — allocate a pair.
pub fn prim_cons(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "cons", args, 2);
    let mut scope = scope;
    let mut rest = args;
    let mut a = NIL;
    gc_frame!(m.heap, [scope, rest, a]);

    a = eval(m, scope, m.heap.car(rest));
    let b = eval(m, scope, m.heap.car(m.heap.cdr(rest)));
    Continuation::Done(m.heap.alloc_cons(a, b))
}

/// `(car p)` — first pair field.
pub fn prim_car(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "car", args, 1);
    let v = eval(m, scope, m.heap.car(args));
    if !v.is_cons() {
        m.record_error(LispError::Type {
            name: "car",
            expected: "a pair",
        });
        return Continuation::Done(NIL);
    }
    Continuation::Done(m.heap.car(v))
}

/// `(cdr p)` — second pair field.
pub fn prim_cdr(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "cdr", args, 1);
    let v = eval(m, scope, m.heap.car(args));
    if !v.is_cons() {
        m.record_error(LispError::Type {
            name: "cdr",
            expected: "a pair",
        });
        return Continuation::Done(NIL);
    }
    Continuation::Done(m.heap.cdr(v))
}

/// `(list …)` — evaluate the arguments left to right and collect them.
pub fn prim_list(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    Continuation::Done(eval_args(m, scope, args))
}

/// Evaluate an argument list left to right into a fresh value list.
pub(crate) fn eval_args(m: &mut Machine, scope: Value, args: Value) -> Value {
    let mut scope = scope;
    let mut rest = args;
    let mut head = NIL;
    let mut tail = NIL;
    gc_frame!(m.heap, [scope, rest, head, tail]);

    while rest.is_cons() {
        let v = eval(m, scope, m.heap.car(rest));
        let cell = m.heap.alloc_cons(v, NIL);
        if head.is_nil() {
            head = cell;
        } else {
            m.heap.set_cdr(tail, cell);
        }
        tail = cell;
        rest = m.heap.cdr(rest);
    }
    head
}

// === Control ===

/// `(if c t e)` — evaluate the condition, then tail-dispatch into the
/// taken branch so the branch runs in tail position.
pub fn prim_if(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "if", args, 3);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let cond = eval(m, scope, m.heap.car(rest));
    let branch = if cond.truthy() {
        m.heap.car(m.heap.cdr(rest))
    } else {
        m.heap.car(m.heap.cdr(m.heap.cdr(rest)))
    };
    Continuation::Tail {
        expr: branch,
        scope,
    }
}

/// `(progn …)` — evaluate in order; only the last form is in tail
/// position. `(progn)` is `nil`.
pub fn prim_progn(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    if !rest.is_cons() {
        return Continuation::Done(NIL);
    }
    while m.heap.cdr(rest).is_cons() {
        eval(m, scope, m.heap.car(rest));
        rest = m.heap.cdr(rest);
    }
    Continuation::Tail {
        expr: m.heap.car(rest),
        scope,
    }
}

/// `(quote x)` — return the form unevaluated.
pub fn prim_quote(m: &mut Machine, _scope: Value, args: Value) -> Continuation {
    args_exact!(m, "quote", args, 1);
    Continuation::Done(m.heap.car(args))
}

/// `(eval x)` — evaluate the argument, then tail-evaluate the result.
pub fn prim_eval(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "eval", args, 1);
    let mut scope = scope;
    gc_frame!(m.heap, [scope]);
    let v = eval(m, scope, m.heap.car(args));
    Continuation::Tail {
        expr: v,
        scope,
    }
}

/// `(apply f args)` — evaluate both, then call `f` on the value list
/// without re-evaluating the individual elements.
pub fn prim_apply(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "apply", args, 2);
    let mut scope = scope;
    let mut rest = args;
    let mut f = NIL;
    gc_frame!(m.heap, [scope, rest, f]);

    f = eval(m, scope, m.heap.car(rest));
    let vals = eval(m, scope, m.heap.car(m.heap.cdr(rest)));
    apply_callee(m, f, vals, scope, true)
}

// === Binding ===

/// `(lambda params body)` — create a closure over the current scope.
pub fn prim_lambda(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "lambda", args, 2);
    let params = m.heap.car(args);
    let body = m.heap.car(m.heap.cdr(args));
    Continuation::Done(m.heap.alloc_function(HeapTag::Lambda, params, body, scope))
}

/// `(define name v)` / `(defvar name v)` — bind in the current scope.
pub fn prim_define(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "define", args, 2);
    let mut scope = scope;
    let mut rest = args;
    let mut val = NIL;
    gc_frame!(m.heap, [scope, rest, val]);

    if !m.heap.car(rest).is_symbol() {
        m.record_error(LispError::Type {
            name: "define",
            expected: "a symbol to bind",
        });
        return Continuation::Done(NIL);
    }
    val = eval(m, scope, m.heap.car(m.heap.cdr(rest)));
    let sym = m.heap.car(rest);
    scope::bind(&mut m.heap, scope, sym, val);
    Continuation::Done(val)
}

/// `(defun name params body)` — define a named lambda.
pub fn prim_defun(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "defun", args, 3);
    define_function(m, scope, args, HeapTag::Lambda, "defun")
}

/// `(defmacro name params body)` — define a macro.
pub fn prim_defmacro(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "defmacro", args, 3);
    define_function(m, scope, args, HeapTag::Macro, "defmacro")
}

fn define_function(
    m: &mut Machine,
    scope: Value,
    args: Value,
    tag: HeapTag,
    name: &'static str,
) -> Continuation {
    let mut scope = scope;
    let mut rest = args;
    let mut f = NIL;
    gc_frame!(m.heap, [scope, rest, f]);

    if !m.heap.car(rest).is_symbol() {
        m.record_error(LispError::Type {
            name,
            expected: "a symbol to bind",
        });
        return Continuation::Done(NIL);
    }
    let params = m.heap.car(m.heap.cdr(rest));
    let body = m.heap.car(m.heap.cdr(m.heap.cdr(rest)));
    f = m.heap.alloc_function(tag, params, body, scope);
    let sym = m.heap.car(rest);
    scope::bind(&mut m.heap, scope, sym, f);
    Continuation::Done(f)
}

/// `(macroexpand m arg)` — expand once without evaluating the result.
pub fn prim_macroexpand(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_min!(m, "macroexpand", args, 2);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let mac = eval(m, scope, m.heap.car(rest));
    if !mac.is_macro() {
        m.record_error(LispError::Type {
            name: "macroexpand",
            expected: "a macro",
        });
        return Continuation::Done(NIL);
    }
    match expand_macro(m, mac, m.heap.cdr(rest), scope) {
        Some(expansion) => Continuation::Done(expansion),
        None => Continuation::Done(NIL),
    }
}

// === I/O and session control ===

/// `(print x …)` — print the arguments space separated, then a newline.
pub fn prim_print(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    let mut out = String::new();
    let mut first = true;
    while rest.is_cons() {
        let v = eval(m, scope, m.heap.car(rest));
        if !first {
            out.push(' ');
        }
        write_value(&m.heap, v, &mut out);
        first = false;
        rest = m.heap.cdr(rest);
    }
    out.push('\n');
    let _ = std::io::stdout().write_all(out.as_bytes());
    Continuation::Done(NIL)
}

/// `(write-char x …)` — write each argument as one raw byte.
pub fn prim_write_char(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_min!(m, "write-char", args, 1);
    let mut scope = scope;
    let mut rest = args;
    gc_frame!(m.heap, [scope, rest]);

    while rest.is_cons() {
        let v = eval(m, scope, m.heap.car(rest));
        want_number!(m, "write-char", v);
        let byte = (v.as_number() & 0xff) as u8;
        let _ = std::io::stdout().write_all(&[byte]);
        rest = m.heap.cdr(rest);
    }
    Continuation::Done(NIL)
}

/// `(rand)` — a non-negative random number.
pub fn prim_rand(m: &mut Machine, _scope: Value, args: Value) -> Continuation {
    args_exact!(m, "rand", args, 0);
    Continuation::Done(Value::number(m.rand()))
}

/// `(sleep ms)` — block for the given number of milliseconds.
pub fn prim_sleep(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "sleep", args, 1);
    let v = eval(m, scope, m.heap.car(args));
    want_number!(m, "sleep", v);
    let ms = v.as_number().max(0) as u64;
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Continuation::Done(NIL)
}

/// `(load "file")` — read and evaluate a file in the global scope. The
/// argument may be a bare symbol, a `"…"` spelling, or any form that
/// evaluates to a symbol.
pub fn prim_load(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "load", args, 1);
    let raw = m.heap.car(args);
    let path_sym = if raw.is_symbol() {
        raw
    } else {
        let v = eval(m, scope, raw);
        if !v.is_symbol() {
            m.record_error(LispError::Type {
                name: "load",
                expected: "a symbol naming a file",
            });
            return Continuation::Done(NIL);
        }
        v
    };
    let path = m.heap.symbol_name(path_sym).to_string();
    Continuation::Done(load_file(m, &path))
}

/// Read and evaluate every form of `path` against the global scope.
/// Returns `t` when the file was read, `nil` when it could not be opened.
/// Evaluation errors land in the ring as usual.
pub fn load_file(m: &mut Machine, path: &str) -> Value {
    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            m.record_error(LispError::Io {
                path: path.to_string(),
                reason: e.to_string(),
            });
            return NIL;
        }
    };
    eval_source(m, &source);
    TRUE
}

/// Evaluate every form in `source` against the global scope. Used by
/// `load` and by the driver for script files and the embedded prelude.
pub fn eval_source(m: &mut Machine, source: &str) {
    let mut reader = Reader::new(source, &m.heap);
    loop {
        match reader.read(&mut m.heap) {
            Ok(Some(form)) => {
                let globals = m.heap.globals();
                eval(m, globals, form);
            }
            Ok(None) => return,
            Err(e) => {
                m.record_error(LispError::Read(e.to_string()));
                return;
            }
        }
    }
}

/// `(exit)` — request REPL shutdown after the current form.
pub fn prim_exit(m: &mut Machine, _scope: Value, args: Value) -> Continuation {
    args_exact!(m, "exit", args, 0);
    m.shutdown = true;
    Continuation::Done(NIL)
}

/// `(debug flag)` — debug-build toggle for evaluator tracing.
#[cfg(debug_assertions)]
pub fn prim_debug(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    args_exact!(m, "debug", args, 1);
    let v = eval(m, scope, m.heap.car(args));
    m.debug = v.truthy();
    Continuation::Done(if m.debug { TRUE } else { NIL })
}

// === Installation ===

/// Bind `name` to a builtin wrapping `f` in the global environment.
pub fn define_builtin(m: &mut Machine, name: &str, f: Primitive) -> Result<(), HeapError> {
    let mut sym = m.heap.intern(name)?;
    gc_frame!(m.heap, [sym]);
    let builtin = m.heap.alloc_builtin(primitive_to_raw(f));
    let globals = m.heap.globals();
    scope::bind(&mut m.heap, globals, sym, builtin);
    Ok(())
}

/// Install the closed core primitive set.
pub fn install(m: &mut Machine) -> Result<(), HeapError> {
    let mut table: Vec<(&str, Primitive)> = vec![
        ("+", prim_add),
        ("-", prim_sub),
        ("<", prim_less),
        ("eq", prim_eq),
        ("cons", prim_cons),
        ("car", prim_car),
        ("cdr", prim_cdr),
        ("list", prim_list),
        ("if", prim_if),
        ("progn", prim_progn),
        ("quote", prim_quote),
        ("eval", prim_eval),
        ("apply", prim_apply),
        ("lambda", prim_lambda),
        ("define", prim_define),
        ("defvar", prim_define),
        ("defun", prim_defun),
        ("defmacro", prim_defmacro),
        ("macroexpand", prim_macroexpand),
        ("print", prim_print),
        ("write-char", prim_write_char),
        ("rand", prim_rand),
        ("sleep", prim_sleep),
        ("load", prim_load),
        ("exit", prim_exit),
    ];
    #[cfg(debug_assertions)]
    table.push(("debug", prim_debug));

    for (name, f) in table {
        define_builtin(m, name, f)?;
    }
    Ok(())
}
