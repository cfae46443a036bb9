//! # lys-jit — the native-code compiler
//!
//! Replaces the bodies of selected lambdas with x86-64 machine code that
//! runs faster than the tree walker. The compiler operates per top-level
//! invocation of `compile` (or `freeze`, which stops after resolution),
//! each taking a list of function names. Pipeline per function:
//!
//! 1. **Symbol resolution** ([`resolve`]) — rewrite the body so symbols
//!    become the values they resolve to; formals and the self-name are
//!    exempt. `compiled` moves to `SymbolsResolved`.
//! 2. **Validity check** ([`check`]) — accept only numbers, `nil`/`t`,
//!    parameter references, self-calls, calls to compiled functions, and
//!    the allow-listed primitives.
//! 3. **Lowering** ([`bite`]) — build the bite expression tree.
//! 4. **Constant folding** — collapse literal `+`/`-` chains.
//! 5. **Register counting** — Sethi–Ullman over four temps.
//! 6. **Emission** ([`emit`], [`x86_64`]) — raw bytes into a writable
//!    anonymous mapping.
//! 7. **Protection flip** — the page goes read-execute, its entry address
//!    lands in the lambda's body slot, and `compiled` becomes `Compiled`.
//!
//! Any failure rolls every function of the batch back to its prior state
//! and records one error; the session continues on the interpreted path.
//! Code pages are owned by the machine's [`lys_heap::ExecRegistry`] and
//! are only released at shutdown.

pub mod bite;
pub mod check;
pub mod emit;
pub mod error;
pub mod resolve;
pub mod runtime;
pub mod x86_64;

use lys_eval::{define_builtin, scope, Continuation, LispError, Machine};
use lys_heap::value::{Value, NIL, TRUE};
use lys_heap::{gc_frame, CompileState, HeapError};
use lys_read::print_value;

pub use error::CompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Freeze,
    Compile,
}

/// Install the `freeze` and `compile` primitives into the machine's
/// global environment.
pub fn install(m: &mut Machine) -> Result<(), HeapError> {
    define_builtin(m, "freeze", prim_freeze)?;
    define_builtin(m, "compile", prim_compile)
}

/// `(freeze f …)` — resolve the bodies of the named functions.
pub fn prim_freeze(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    batch(m, scope, args, Stage::Freeze)
}

/// `(compile f …)` — resolve, check, and compile the named functions.
pub fn prim_compile(m: &mut Machine, scope: Value, args: Value) -> Continuation {
    batch(m, scope, args, Stage::Compile)
}

/// Process one `freeze`/`compile` batch with all-or-nothing semantics:
/// on any failure, every function touched in this batch is restored to
/// its pre-batch body and state.
fn batch(m: &mut Machine, scope: Value, args: Value, stage: Stage) -> Continuation {
    let got = m.heap.list_len(args).unwrap_or(0);
    if got < 1 {
        m.record_error(LispError::Arity {
            name: match stage {
                Stage::Freeze => "freeze".to_string(),
                Stage::Compile => "compile".to_string(),
            },
            expected: "at least 1".to_string(),
            got,
        });
        return Continuation::Done(NIL);
    }

    let mut scope = scope;
    let mut rest = args;
    // Snapshot list of (function . prior-body) pairs, newest first; the
    // prior compile states ride in a parallel host vector.
    let mut snaps = NIL;
    gc_frame!(m.heap, [scope, rest, snaps]);
    let mut states: Vec<CompileState> = Vec::new();

    let mut failure: Option<CompileError> = None;
    'batch: while rest.is_cons() {
        let name = m.heap.car(rest);
        if !name.is_symbol() {
            failure = Some(CompileError::NotAFunction {
                name: print_value(&m.heap, name),
            });
            break 'batch;
        }
        let func = scope::lookup(&m.heap, scope, name);
        if !func.is_lambda() {
            failure = Some(CompileError::NotAFunction {
                name: m.heap.symbol_name(name).to_string(),
            });
            break 'batch;
        }

        // Already-compiled functions pass through untouched.
        if m.heap.func_state(func) != CompileState::Compiled {
            let mut func = func;
            let mut name = name;
            gc_frame!(m.heap, [func, name]);

            let prior = m.heap.func_state(func);
            let pair = m.heap.alloc_cons(func, m.heap.func_body(func));
            snaps = m.heap.alloc_cons(pair, snaps);
            states.push(prior);

            if let Err(e) = resolve::freeze_function(m, func, name) {
                failure = Some(e);
                break 'batch;
            }
            if stage == Stage::Compile {
                if let Err(e) = compile_function(m, func) {
                    failure = Some(e);
                    break 'batch;
                }
            }
        }
        rest = m.heap.cdr(rest);
    }

    if let Some(e) = failure {
        // Roll back newest-first; `states` pops in the same order.
        let mut cursor = snaps;
        while cursor.is_cons() {
            let pair = m.heap.car(cursor);
            let func = m.heap.car(pair);
            let body = m.heap.cdr(pair);
            let state = states.pop().expect("snapshot state for each pair");
            m.heap.set_func_body(func, body);
            m.heap.set_func_state(func, state);
            cursor = m.heap.cdr(cursor);
        }
        m.record_error(LispError::Compile(e.to_string()));
        return Continuation::Done(NIL);
    }

    Continuation::Done(TRUE)
}

/// Check, lower, and emit one resolved function, then flip its page to
/// read-execute and store the entry address in the body slot.
#[cfg(all(target_arch = "x86_64", unix))]
fn compile_function(m: &mut Machine, func: Value) -> Result<(), CompileError> {
    let body = m.heap.func_body(func);
    check::check(m, func, body)?;

    let mut tree = bite::lower(m, func)?;
    bite::fold(&mut tree);
    bite::count_regs(&mut tree, true);

    let map = m.exec.alloc_writable(emit::size_bound(&tree))?;
    let (map, len) = emit::emit_function(map, &tree, runtime::rt_write_char as usize)?;
    let entry = m.exec.commit(map, len)?;

    m.heap.set_func_body_raw(func, entry);
    m.heap.set_func_state(func, CompileState::Compiled);
    log::debug!("[jit] emitted {len} bytes at {entry:#x}");
    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn compile_function(_m: &mut Machine, _func: Value) -> Result<(), CompileError> {
    Err(CompileError::UnsupportedArch)
}
