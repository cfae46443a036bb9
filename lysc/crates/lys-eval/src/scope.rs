//! Lexical scopes.
//!
//! A scope is a cons chain of *bindings lists*; each bindings list is a
//! cons chain of `(symbol . value)` pairs representing one lexical layer.
//! The global environment is the outermost scope. Function invocation
//! pushes a fresh, empty bindings list onto the captured (or calling)
//! scope, and binding prepends a pair onto the innermost layer, so the most
//! recent binding of a name shadows older ones.

use lys_heap::value::{Value, NIL, UNDEFINED};
use lys_heap::{gc_frame, Heap};

/// Look `sym` up through every layer, innermost first. Returns the bound
/// value, or [`UNDEFINED`] when no layer binds the symbol. Symbols are
/// interned, so comparison is word identity.
pub fn lookup(heap: &Heap, scope: Value, sym: Value) -> Value {
    debug_assert!(sym.is_symbol());
    let mut layer = scope;
    while layer.is_cons() {
        let mut binding = heap.car(layer);
        while binding.is_cons() {
            let pair = heap.car(binding);
            if heap.car(pair) == sym {
                return heap.cdr(pair);
            }
            binding = heap.cdr(binding);
        }
        layer = heap.cdr(layer);
    }
    UNDEFINED
}

/// Push a fresh, empty bindings list over `parent`.
pub fn push(heap: &mut Heap, parent: Value) -> Value {
    heap.alloc_cons(NIL, parent)
}

/// Bind `sym` to `val` in the innermost layer of `scope`.
pub fn bind(heap: &mut Heap, scope: Value, sym: Value, val: Value) {
    debug_assert!(scope.is_cons());
    debug_assert!(sym.is_symbol());
    let mut scope = scope;
    gc_frame!(heap, [scope]);
    let pair = heap.alloc_cons(sym, val);
    let layer = heap.alloc_cons(pair, heap.car(scope));
    heap.set_car(scope, layer);
}
