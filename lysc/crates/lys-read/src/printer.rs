//! Value printer.
//!
//! Renders values back into surface syntax where one exists. Opaque kinds
//! (builtins, functions) print as `#<…>` markers that the reader does not
//! accept; improper lists print with a dotted tail.

use lys_heap::{CompileState, Heap, HeapTag, Value, NIL, TRUE, UNDEFINED};
use std::fmt::Write;

/// Render `v` into a fresh string.
pub fn print_value(heap: &Heap, v: Value) -> String {
    let mut out = String::new();
    write_value(heap, v, &mut out);
    out
}

/// Append the rendering of `v` to `out`.
pub fn write_value(heap: &Heap, v: Value, out: &mut String) {
    if v.is_number() {
        let _ = write!(out, "{}", v.as_number());
        return;
    }
    if v == NIL {
        out.push_str("nil");
        return;
    }
    if v == TRUE {
        out.push('t');
        return;
    }
    if v == UNDEFINED {
        out.push_str("#<undefined>");
        return;
    }
    match v.heap_tag() {
        Some(HeapTag::Symbol) => out.push_str(heap.symbol_name(v)),
        Some(HeapTag::Builtin) => out.push_str("#<builtin>"),
        Some(HeapTag::Lambda) => {
            if heap.func_state(v) == CompileState::Compiled {
                out.push_str("#<compiled-lambda>");
            } else {
                out.push_str("#<lambda>");
            }
        }
        Some(HeapTag::Macro) => out.push_str("#<macro>"),
        Some(HeapTag::Cons) => write_list(heap, v, out),
        None => {
            let _ = write!(out, "#<const:{:#x}>", v.raw());
        }
    }
}

fn write_list(heap: &Heap, v: Value, out: &mut String) {
    out.push('(');
    let mut cursor = v;
    let mut first = true;
    while cursor.is_cons() {
        if !first {
            out.push(' ');
        }
        write_value(heap, heap.car(cursor), out);
        first = false;
        cursor = heap.cdr(cursor);
    }
    if !cursor.is_nil() {
        out.push_str(" . ");
        write_value(heap, cursor, out);
    }
    out.push(')');
}
