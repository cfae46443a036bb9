//! The heap: allocation entry points, typed object access, interning.
//!
//! ## Allocation
//!
//! All Lisp data lives in a single semi-space arena ([`crate::arena`]).
//! Every `alloc_*` method first parks its value arguments in the heap's
//! scratch root registers, then bump-allocates, then writes the fields back
//! out of the (possibly rewritten) registers. A collection triggered by the
//! allocation therefore cannot invalidate the arguments, and callers only
//! have to root values they hold *across* calls.
//!
//! ## Roots
//!
//! The collector's precise root set is:
//!
//! 1. the global environment ([`Heap::globals`]),
//! 2. the interned symbol chain ([`Heap::symbols`]),
//! 3. the scratch registers,
//! 4. every slot registered in the frame descriptor chain
//!    ([`crate::roots`]).
//!
//! ## Interning
//!
//! The symbol table is itself a cons chain of symbols. Interning walks the
//! chain comparing names; two symbols with the same name are always the
//! same heap object, so `eq` on symbols is pointer identity.

use crate::arena::SemiSpaces;
use crate::config::HeapConfig;
use crate::error::{HeapError, Result};
use crate::object::{self, layout, CompileState, Header};
use crate::roots::{Frame, FrameGuard};
use crate::value::{HeapTag, Value, NIL, WORD};

/// Number of scratch root registers used by heap-internal multi-step
/// allocations (and borrowed by allocation argument parking).
pub(crate) const SCRATCH_SLOTS: usize = 4;

/// The Lisp heap.
pub struct Heap {
    pub(crate) spaces: SemiSpaces,
    config: HeapConfig,

    /// The global environment: a scope chain with one bindings list.
    pub(crate) globals: Value,

    /// The interned symbol chain (`AllSymbols`).
    pub(crate) symbols: Value,

    /// Scratch root registers for values that must survive one allocation.
    pub(crate) scratch: [Value; SCRATCH_SLOTS],

    /// Head of the frame descriptor chain.
    pub(crate) frame_head: *mut Frame,

    /// Set when the last collection left occupancy above the threshold; the
    /// next collection grows instead of swapping.
    pub(crate) grow_next: bool,

    pub(crate) cycles: u64,
    pub(crate) total_freed: u64,

    /// When set, every allocation collects first. Shakes out missing root
    /// registrations; used by tests.
    stress: bool,
}

impl Heap {
    /// Create a heap and bootstrap the (empty) global environment.
    pub fn new(config: HeapConfig) -> Result<Heap> {
        config.validate()?;
        let spaces = SemiSpaces::new(config.heap_size)?;
        let mut heap = Heap {
            spaces,
            config,
            globals: NIL,
            symbols: NIL,
            scratch: [NIL; SCRATCH_SLOTS],
            frame_head: std::ptr::null_mut(),
            grow_next: false,
            cycles: 0,
            total_freed: 0,
            stress: false,
        };
        // The outermost scope: one empty bindings list.
        heap.globals = heap.alloc_cons(NIL, NIL);
        Ok(heap)
    }

    /// Create a heap with the default configuration.
    pub fn with_defaults() -> Result<Heap> {
        Heap::new(HeapConfig::default())
    }

    #[inline]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// The global environment scope.
    #[inline]
    pub fn globals(&self) -> Value {
        self.globals
    }

    /// The interned symbol chain.
    #[inline]
    pub fn symbols(&self) -> Value {
        self.symbols
    }

    // === Allocation ===

    /// Bump-allocate `size` aligned bytes, collecting (and growing) as
    /// needed. Memory exhaustion after a grow attempt is fatal.
    pub(crate) fn alloc_raw(&mut self, size: usize) -> usize {
        debug_assert_eq!(size % WORD, 0);
        if self.stress {
            self.collect_for(size);
        }
        if let Some(addr) = self.spaces.alloc(size) {
            return addr;
        }
        self.collect_for(size);
        match self.spaces.alloc(size) {
            Some(addr) => addr,
            None => self.oom_abort(size),
        }
    }

    pub(crate) fn oom_abort(&self, requested: usize) -> ! {
        log::error!(
            "heap exhausted: {} bytes requested, {} free after collection (arena {} bytes)",
            requested,
            self.spaces.remaining(),
            self.spaces.total()
        );
        std::process::abort();
    }

    /// Allocate a cons cell.
    pub fn alloc_cons(&mut self, car: Value, cdr: Value) -> Value {
        self.scratch[0] = car;
        self.scratch[1] = cdr;
        let addr = self.alloc_raw(layout::CONS_SIZE);
        unsafe {
            object::write_word(addr, Header::Live(HeapTag::Cons).encode());
            object::write_word(addr + layout::CONS_CAR, self.scratch[0].raw());
            object::write_word(addr + layout::CONS_CDR, self.scratch[1].raw());
        }
        self.scratch[0] = NIL;
        self.scratch[1] = NIL;
        Value::pointer(addr, HeapTag::Cons)
    }

    /// Allocate a builtin holding a raw primitive function pointer.
    ///
    /// The pointer is opaque to the heap; the evaluator owns its meaning.
    pub fn alloc_builtin(&mut self, raw_fn: usize) -> Value {
        let addr = self.alloc_raw(layout::BUILTIN_SIZE);
        unsafe {
            object::write_word(addr, Header::Live(HeapTag::Builtin).encode());
            object::write_word(addr + layout::BUILTIN_FN, raw_fn as u64);
        }
        Value::pointer(addr, HeapTag::Builtin)
    }

    /// Allocate a lambda or macro in the `NotCompiled` state.
    pub fn alloc_function(
        &mut self,
        tag: HeapTag,
        params: Value,
        body: Value,
        env: Value,
    ) -> Value {
        debug_assert!(matches!(tag, HeapTag::Lambda | HeapTag::Macro));
        self.scratch[0] = params;
        self.scratch[1] = body;
        self.scratch[2] = env;
        let addr = self.alloc_raw(layout::FUNC_SIZE);
        unsafe {
            object::write_word(addr, Header::Live(tag).encode());
            object::write_word(addr + layout::FUNC_PARAMS, self.scratch[0].raw());
            object::write_word(addr + layout::FUNC_BODY, self.scratch[1].raw());
            object::write_word(addr + layout::FUNC_ENV, self.scratch[2].raw());
            object::write_word(addr + layout::FUNC_STATE, CompileState::NotCompiled as u64);
        }
        self.scratch[0] = NIL;
        self.scratch[1] = NIL;
        self.scratch[2] = NIL;
        Value::pointer(addr, tag)
    }

    fn alloc_symbol(&mut self, name: &str) -> Result<Value> {
        let len = name.len();
        if len > self.config.max_symbol_len {
            return Err(HeapError::SymbolTooLong {
                len,
                max: self.config.max_symbol_len,
            });
        }
        let size = object::symbol_size(len);
        let addr = self.alloc_raw(size);
        unsafe {
            object::write_word(addr, Header::Live(HeapTag::Symbol).encode());
            object::write_word(addr + layout::SYM_LEN, len as u64);
            let name_dst = (addr + layout::SYM_NAME) as *mut u8;
            std::ptr::copy_nonoverlapping(name.as_ptr(), name_dst, len);
            // NUL terminator plus zero padding out to the word boundary.
            let pad = object::align_up(len + 1, WORD) - len;
            std::ptr::write_bytes(name_dst.add(len), 0, pad);
        }
        Ok(Value::pointer(addr, HeapTag::Symbol))
    }

    /// Intern `name`: return the existing symbol with that name, or
    /// allocate one and push it onto the symbol chain.
    pub fn intern(&mut self, name: &str) -> Result<Value> {
        let mut link = self.symbols;
        while !link.is_nil() {
            let sym = self.car(link);
            if self.symbol_name(sym) == name {
                return Ok(sym);
            }
            link = self.cdr(link);
        }

        let sym = self.alloc_symbol(name)?;
        // alloc_cons parks its arguments in scratch, so `sym` survives a
        // collection triggered by the chain link allocation.
        let cell = self.alloc_cons(sym, self.symbols);
        self.symbols = cell;
        Ok(self.car(cell))
    }

    // === Typed object access ===

    #[inline]
    pub fn car(&self, v: Value) -> Value {
        debug_assert!(v.is_cons());
        unsafe { Value::from_raw(object::read_word(v.addr() + layout::CONS_CAR)) }
    }

    #[inline]
    pub fn cdr(&self, v: Value) -> Value {
        debug_assert!(v.is_cons());
        unsafe { Value::from_raw(object::read_word(v.addr() + layout::CONS_CDR)) }
    }

    #[inline]
    pub fn set_car(&mut self, v: Value, new: Value) {
        debug_assert!(v.is_cons());
        unsafe { object::write_word(v.addr() + layout::CONS_CAR, new.raw()) }
    }

    #[inline]
    pub fn set_cdr(&mut self, v: Value, new: Value) {
        debug_assert!(v.is_cons());
        unsafe { object::write_word(v.addr() + layout::CONS_CDR, new.raw()) }
    }

    /// The name of a symbol. The borrow is tied to `&self`, so it cannot
    /// outlive a mutation (and in particular cannot survive a collection).
    #[inline]
    pub fn symbol_name(&self, v: Value) -> &str {
        debug_assert!(v.is_symbol());
        unsafe {
            let addr = v.addr();
            let len = object::read_word(addr + layout::SYM_LEN) as usize;
            let bytes = std::slice::from_raw_parts((addr + layout::SYM_NAME) as *const u8, len);
            std::str::from_utf8_unchecked(bytes)
        }
    }

    /// The raw primitive pointer stored in a builtin.
    #[inline]
    pub fn builtin_fn(&self, v: Value) -> usize {
        debug_assert!(v.is_builtin());
        unsafe { object::read_word(v.addr() + layout::BUILTIN_FN) as usize }
    }

    #[inline]
    pub fn func_params(&self, v: Value) -> Value {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { Value::from_raw(object::read_word(v.addr() + layout::FUNC_PARAMS)) }
    }

    /// The function body as a value. Only meaningful while the function is
    /// not in the `Compiled` state.
    #[inline]
    pub fn func_body(&self, v: Value) -> Value {
        debug_assert!(self.func_state(v) != CompileState::Compiled);
        unsafe { Value::from_raw(object::read_word(v.addr() + layout::FUNC_BODY)) }
    }

    /// The native entry address stored in a `Compiled` function's body slot.
    #[inline]
    pub fn func_body_raw(&self, v: Value) -> usize {
        debug_assert!(self.func_state(v) == CompileState::Compiled);
        unsafe { object::read_word(v.addr() + layout::FUNC_BODY) as usize }
    }

    #[inline]
    pub fn func_env(&self, v: Value) -> Value {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { Value::from_raw(object::read_word(v.addr() + layout::FUNC_ENV)) }
    }

    #[inline]
    pub fn func_state(&self, v: Value) -> CompileState {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { CompileState::from_word(object::read_word(v.addr() + layout::FUNC_STATE)) }
    }

    #[inline]
    pub fn set_func_body(&mut self, v: Value, body: Value) {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { object::write_word(v.addr() + layout::FUNC_BODY, body.raw()) }
    }

    /// Store a native code address in the body slot. The caller must also
    /// move the function to the `Compiled` state, or the collector would
    /// trace the address as a value.
    #[inline]
    pub fn set_func_body_raw(&mut self, v: Value, entry: usize) {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { object::write_word(v.addr() + layout::FUNC_BODY, entry as u64) }
    }

    #[inline]
    pub fn set_func_state(&mut self, v: Value, state: CompileState) {
        debug_assert!(v.is_lambda() || v.is_macro());
        unsafe { object::write_word(v.addr() + layout::FUNC_STATE, state as u64) }
    }

    /// Length of a proper list, or `None` for improper lists.
    pub fn list_len(&self, mut v: Value) -> Option<usize> {
        let mut n = 0;
        while v.is_cons() {
            n += 1;
            v = self.cdr(v);
        }
        if v.is_nil() {
            Some(n)
        } else {
            None
        }
    }

    // === Root frames ===

    /// Link a frame descriptor into the root chain.
    ///
    /// # Safety
    ///
    /// `frame` and every slot it registers must outlive the returned guard,
    /// and guards must drop in LIFO order. The [`gc_frame!`] macro upholds
    /// both by construction.
    pub unsafe fn push_frame(&mut self, frame: *mut Frame) -> FrameGuard {
        (*frame).set_prev(self.frame_head);
        self.frame_head = frame;
        FrameGuard::new(self as *mut Heap)
    }

    pub(crate) fn pop_frame(&mut self) {
        debug_assert!(!self.frame_head.is_null(), "root frame underflow");
        unsafe {
            self.frame_head = (*self.frame_head).prev();
        }
    }

    // === Statistics ===

    /// Bytes currently allocated in the active semi-space.
    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.spaces.used()
    }

    /// Capacity of one semi-space.
    #[inline]
    pub fn semi_space_bytes(&self) -> usize {
        self.spaces.half()
    }

    /// Completed collection cycles.
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Total bytes reclaimed over all cycles.
    #[inline]
    pub fn total_freed(&self) -> u64 {
        self.total_freed
    }

    /// Current occupancy of the active semi-space in percent.
    #[inline]
    pub fn occupancy_percent(&self) -> usize {
        self.spaces.used() * 100 / self.spaces.half()
    }

    /// Toggle collect-before-every-allocation stress mode.
    pub fn set_stress(&mut self, on: bool) {
        self.stress = on;
    }
}
