//! The evaluator.
//!
//! One entry point, [`eval`], reduces an expression against a scope:
//!
//! - numbers, builtins, lambdas, macros and constants evaluate to
//!   themselves;
//! - a symbol evaluates to its innermost binding, recording an
//!   undefined-symbol error (and yielding `nil`) on a miss;
//! - a cons cell evaluates its head and applies the callee to the raw
//!   argument forms.
//!
//! ## Tail calls
//!
//! Primitives return a [`Continuation`]: either a finished value or a
//! `(expr, scope)` pair to evaluate next. The evaluator consumes `Tail`
//! continuations in its own loop, so `if` branches, the final form of
//! `progn`, macro expansions, `eval`, and lambda bodies all run without
//! growing the host stack. Self-recursive functions in tail position
//! iterate indefinitely in constant stack.
//!
//! ## Rooting
//!
//! Every local that survives a possible allocation is registered in a
//! frame descriptor (`gc_frame!`); see `lys-heap`. The argument-binding
//! loop leans on the allocation entry points parking their own arguments,
//! so only values carried across iterations need explicit slots.

use lys_heap::value::{Value, NIL, UNDEFINED};
use lys_heap::{gc_frame, CompileState, HeapTag};
use lys_read::print_value;

use crate::error::LispError;
use crate::machine::Machine;
use crate::scope;

/// What a primitive hands back to the evaluator loop.
pub enum Continuation {
    /// A finished value.
    Done(Value),
    /// Continue by evaluating `expr` in `scope` without growing the host
    /// stack.
    Tail { expr: Value, scope: Value },
}

/// Host signature of every primitive: machine, scope, raw argument forms.
pub type Primitive = fn(&mut Machine, Value, Value) -> Continuation;

/// Entry signature of JIT-compiled code: a pointer to the evaluated
/// argument vector in, a tagged value word out.
pub type NativeEntry = unsafe extern "C" fn(*mut u64) -> u64;

#[inline]
pub(crate) fn primitive_from_raw(raw: usize) -> Primitive {
    // Builtins store the primitive as an opaque word in the heap; this is
    // the single point where the word turns back into a callable.
    unsafe { std::mem::transmute::<usize, Primitive>(raw) }
}

/// The word a builtin object stores for `f`.
#[inline]
pub fn primitive_to_raw(f: Primitive) -> usize {
    f as usize
}

/// Evaluate `expr` in `scope`.
pub fn eval(m: &mut Machine, scope: Value, expr: Value) -> Value {
    let mut scope = scope;
    let mut expr = expr;
    gc_frame!(m.heap, [scope, expr]);

    loop {
        if expr.is_symbol() {
            let v = scope::lookup(&m.heap, scope, expr);
            if v == UNDEFINED {
                let name = m.heap.symbol_name(expr).to_string();
                m.record_error(LispError::UndefinedSymbol { name });
                return NIL;
            }
            return v;
        }
        if !expr.is_cons() {
            // Numbers, builtins, lambdas, macros, constants.
            return expr;
        }
        match apply(m, scope, expr) {
            Continuation::Done(v) => return v,
            Continuation::Tail { expr: e, scope: s } => {
                expr = e;
                scope = s;
            }
        }
    }
}

/// Apply the form `expr` (a cons cell) in `scope`.
fn apply(m: &mut Machine, scope_in: Value, expr_in: Value) -> Continuation {
    let mut scope = scope_in;
    let mut args = m.heap.cdr(expr_in);
    let mut callee = NIL;
    gc_frame!(m.heap, [scope, args, callee]);

    callee = eval(m, scope, m.heap.car(expr_in));
    if m.debug {
        log::trace!("apply {}", print_value(&m.heap, callee));
    }
    apply_callee(m, callee, args, scope, false)
}

/// Dispatch a callee over argument forms. With `pre_evaluated` the forms
/// are already values (the `apply` primitive), so lambda binding skips the
/// per-argument evaluation.
pub(crate) fn apply_callee(
    m: &mut Machine,
    callee: Value,
    args: Value,
    scope: Value,
    pre_evaluated: bool,
) -> Continuation {
    match callee.heap_tag() {
        Some(HeapTag::Builtin) => {
            let f = primitive_from_raw(m.heap.builtin_fn(callee));
            f(m, scope, args)
        }
        Some(HeapTag::Lambda) => apply_lambda(m, callee, args, scope, pre_evaluated),
        Some(HeapTag::Macro) => apply_macro(m, callee, args, scope),
        _ => {
            let what = print_value(&m.heap, callee);
            m.record_error(LispError::NotAFunction { what });
            Continuation::Done(NIL)
        }
    }
}

fn apply_lambda(
    m: &mut Machine,
    callee: Value,
    args: Value,
    scope: Value,
    pre_evaluated: bool,
) -> Continuation {
    let mut callee = callee;
    gc_frame!(m.heap, [callee]);

    let Some(fresh) = bind_args(m, callee, args, scope, !pre_evaluated) else {
        return Continuation::Done(NIL);
    };

    if m.heap.func_state(callee) == CompileState::Compiled {
        return Continuation::Done(dispatch_native(m, callee, fresh));
    }
    Continuation::Tail {
        expr: m.heap.func_body(callee),
        scope: fresh,
    }
}

/// Macro application: bind the raw argument forms, evaluate the macro body
/// to obtain the expansion, then tail-evaluate the expansion in the
/// original scope.
fn apply_macro(m: &mut Machine, callee: Value, args: Value, scope: Value) -> Continuation {
    let mut scope = scope;
    gc_frame!(m.heap, [scope]);

    match expand_macro(m, callee, args, scope) {
        Some(expansion) => Continuation::Tail {
            expr: expansion,
            scope,
        },
        None => Continuation::Done(NIL),
    }
}

/// Produce a macro's expansion without evaluating it. Shared by macro
/// application and the `macroexpand` primitive.
pub(crate) fn expand_macro(
    m: &mut Machine,
    callee: Value,
    raw_args: Value,
    scope: Value,
) -> Option<Value> {
    let mut callee = callee;
    gc_frame!(m.heap, [callee]);

    let fresh = bind_args(m, callee, raw_args, scope, false)?;
    Some(eval(m, fresh, m.heap.func_body(callee)))
}

/// Build the fresh scope for a function application: a new bindings list
/// over the captured environment (or the caller's scope when the function
/// captured none), with each formal bound to its actual. With `evaluate`,
/// actuals are evaluated left to right against the caller's scope first.
///
/// Returns `None` after recording an arity error.
pub(crate) fn bind_args(
    m: &mut Machine,
    callee: Value,
    args: Value,
    caller_scope: Value,
    evaluate: bool,
) -> Option<Value> {
    let mut callee = callee;
    let mut caller_scope = caller_scope;
    let mut actuals = args;
    let mut formals = m.heap.func_params(callee);
    let mut fresh = NIL;
    gc_frame!(m.heap, [callee, caller_scope, actuals, formals, fresh]);

    let nparams = m.heap.list_len(formals).unwrap_or(0);
    let nargs = m.heap.list_len(actuals).unwrap_or(0);
    if nparams != nargs {
        m.record_error(LispError::Arity {
            name: print_value(&m.heap, callee),
            expected: nparams.to_string(),
            got: nargs,
        });
        return None;
    }

    let base = {
        let captured = m.heap.func_env(callee);
        if captured.is_nil() {
            caller_scope
        } else {
            captured
        }
    };
    fresh = scope::push(&mut m.heap, base);

    while formals.is_cons() {
        let actual = m.heap.car(actuals);
        let val = if evaluate {
            eval(m, caller_scope, actual)
        } else {
            actual
        };
        // `bind` parks the symbol and value while it allocates the pair.
        let formal = m.heap.car(formals);
        scope::bind(&mut m.heap, fresh, formal, val);
        formals = m.heap.cdr(formals);
        actuals = m.heap.cdr(actuals);
    }

    Some(fresh)
}

/// Enter native code for a `Compiled` lambda.
///
/// The freshly built bindings list holds the evaluated arguments in
/// reverse declaration order; they are copied into a contiguous vector and
/// the emitted function reads formal *i* at offset `i * 8` from the vector
/// pointer. Emitted code never allocates, so nothing here can move between
/// the copy and the return.
fn dispatch_native(m: &mut Machine, callee: Value, fresh: Value) -> Value {
    let argc = m.heap.list_len(m.heap.func_params(callee)).unwrap_or(0);
    let mut argv: Vec<u64> = vec![NIL.raw(); argc];

    let mut binding = m.heap.car(fresh);
    for i in (0..argc).rev() {
        let pair = m.heap.car(binding);
        argv[i] = m.heap.cdr(pair).raw();
        binding = m.heap.cdr(binding);
    }

    let entry = m.heap.func_body_raw(callee);
    let f: NativeEntry = unsafe { std::mem::transmute(entry) };
    let ret = unsafe { f(argv.as_mut_ptr()) };
    Value::from_raw(ret)
}
