//! # lys-heap — heap, object model, and garbage collector
//!
//! This crate owns the single heap representation shared by the evaluator
//! and the JIT compiler:
//!
//! - **Tagged values** ([`value`]): every Lisp value is one machine word
//!   whose low three bits identify its kind; numbers carry 62 bits of
//!   signed payload, heap pointers carry a word-aligned address.
//! - **Objects** ([`object`]): a one-word header that is either the live
//!   type tag or, after a copy, the forwarding pointer; fixed payloads for
//!   cons/builtin/lambda/macro and a variable-length inline name for
//!   symbols.
//! - **Arena** ([`arena`]): one anonymous mapping split into two
//!   semi-spaces with bump allocation in the active half.
//! - **Collector** ([`gc`]): stop-the-world Cheney evacuation with a
//!   precise root set and a doubling growth policy driven by an occupancy
//!   threshold.
//! - **Roots** ([`roots`]): a chain of stack-resident frame descriptors,
//!   each registering up to seven `(slot, count)` entries, pushed and
//!   popped by RAII guards (see the [`gc_frame!`] macro).
//! - **Executable pages** ([`exec`]): JIT output pages, a resource class
//!   distinct from GC memory, freed only at shutdown.
//!
//! ## Discipline
//!
//! Any `Value` held in a host local across a possible allocation must be
//! registered in the current frame descriptor; the collector relocates
//! objects, and an unregistered local keeps pointing at the old semi-space.
//! Allocation entry points park their own arguments in scratch root
//! registers, so single calls are safe without ceremony:
//!
//! ```
//! use lys_heap::{gc_frame, Heap, Value, NIL};
//!
//! let mut heap = Heap::with_defaults()?;
//! let mut list = heap.alloc_cons(Value::number(1), NIL);
//! gc_frame!(heap, [list]);
//! // `list` stays valid across this allocation even if it collects.
//! let more = heap.alloc_cons(Value::number(2), list);
//! # let _ = more;
//! # Ok::<(), lys_heap::HeapError>(())
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod exec;
pub mod gc;
pub mod heap;
pub mod object;
pub mod roots;
pub mod value;

pub use config::HeapConfig;
pub use error::{HeapError, Result};
pub use exec::ExecRegistry;
pub use heap::Heap;
pub use object::{CompileState, Header, NATIVE_CAR_DISP, NATIVE_CDR_DISP};
pub use roots::{Frame, FrameGuard};
pub use value::{HeapTag, Value, NIL, TRUE, UNDEFINED, WORD};
