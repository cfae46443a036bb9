//! Cheney copying collection.
//!
//! Stop-the-world, non-generational, two-finger copying collector. A cycle
//! either *swaps* (evacuates the live set into the reserved semi-space) or
//! *grows* (evacuates into the first semi-space of a fresh arena twice the
//! total size, then releases the old arena). Growth is armed whenever the
//! previous cycle left occupancy above the configured threshold.
//!
//! Protocol:
//!
//! 1. Pick the destination and reset its bump pointer.
//! 2. Replace every root with `evacuate(root)`.
//! 3. Walk the destination from the start with a scan pointer, replacing
//!    each heap-typed field with its evacuated value.
//! 4. Stop when the scan pointer catches the bump pointer.
//!
//! `evacuate` copies an object on first contact and leaves the forwarding
//! pointer in the old header, so any number of aliases coalesce onto one
//! copy and the whole cycle is linear in the live set.
//!
//! A `Compiled` function's body slot holds a raw code address and is never
//! traced; its code page is owned by the [`crate::exec`] registry, outside
//! GC-managed memory.

use crate::arena::SemiSpaces;
use crate::heap::Heap;
use crate::object::{self, layout, CompileState, Header};
use crate::value::{HeapTag, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Swap,
    Grow,
}

/// Destination-side state of one collection cycle.
struct Cheney {
    dst_base: usize,
    dst_len: usize,
    dst_cap: usize,
}

impl Cheney {
    /// Evacuate one value. Numbers and constants pass through; a live heap
    /// object is copied and forwarded; an already-forwarded object resolves
    /// to its copy. The returned word carries the original tag.
    fn evacuate(&mut self, v: Value) -> Value {
        let Some(tag) = v.heap_tag() else {
            return v;
        };
        let addr = v.addr();
        unsafe {
            match Header::decode(object::read_word(addr)) {
                Header::Forwarded(new) => {
                    debug_assert_eq!(new.heap_tag(), Some(tag));
                    new
                }
                Header::Live(live_tag) => {
                    debug_assert_eq!(live_tag, tag, "pointer tag disagrees with header");
                    let size = object::object_size(addr);
                    assert!(
                        self.dst_len + size <= self.dst_cap,
                        "collector destination overflow"
                    );
                    let new_addr = self.dst_base + self.dst_len;
                    std::ptr::copy_nonoverlapping(addr as *const u8, new_addr as *mut u8, size);
                    self.dst_len += size;
                    let new = Value::pointer(new_addr, tag);
                    object::write_word(addr, new.raw());
                    new
                }
            }
        }
    }

    #[inline]
    fn evacuate_field(&mut self, obj: usize, offset: usize) {
        unsafe {
            let v = Value::from_raw(object::read_word(obj + offset));
            let new = self.evacuate(v);
            object::write_word(obj + offset, new.raw());
        }
    }
}

impl Heap {
    /// Collect so that an allocation of `needed` bytes can succeed. Runs a
    /// swap cycle (or the armed grow cycle); if the request still does not
    /// fit, grows once more. The caller aborts if even that fails.
    pub(crate) fn collect_for(&mut self, needed: usize) {
        if self.grow_next {
            self.collect(Mode::Grow);
        } else {
            self.collect(Mode::Swap);
            if self.spaces.remaining() < needed {
                self.collect(Mode::Grow);
            }
        }
    }

    /// Force a collection cycle now. Primarily for tests and the GC-stress
    /// mode; semantics must be identical to an allocation-triggered cycle.
    pub fn collect_now(&mut self) {
        self.collect_for(0);
    }

    fn collect(&mut self, mode: Mode) {
        let used_before = self.spaces.used();

        let mut new_spaces = None;
        let (dst_base, dst_cap) = match mode {
            Mode::Swap => (self.spaces.reserved_base(), self.spaces.half()),
            Mode::Grow => {
                let total = self.spaces.total() * 2;
                log::debug!("[gc] growing arena to {total} bytes");
                match SemiSpaces::new(total) {
                    Ok(spaces) => {
                        let base = spaces.active_base();
                        let cap = spaces.half();
                        new_spaces = Some(spaces);
                        (base, cap)
                    }
                    Err(e) => {
                        log::error!("[gc] cannot grow arena to {total} bytes: {e}");
                        std::process::abort();
                    }
                }
            }
        };

        let mut gc = Cheney {
            dst_base,
            dst_len: 0,
            dst_cap,
        };

        // Roots: global environment, symbol chain, scratch registers, and
        // every slot in the frame descriptor chain.
        self.globals = gc.evacuate(self.globals);
        self.symbols = gc.evacuate(self.symbols);
        for slot in self.scratch.iter_mut() {
            *slot = gc.evacuate(*slot);
        }
        let mut frame = self.frame_head;
        while !frame.is_null() {
            unsafe {
                (*frame).visit_slots(&mut |v| gc.evacuate(v));
                frame = (*frame).prev();
            }
        }

        // Scan: the destination prefix is a dense sequence of live objects.
        let mut scan = 0;
        while scan < gc.dst_len {
            let addr = gc.dst_base + scan;
            let size = unsafe { object::object_size(addr) };
            let header = unsafe { Header::decode(object::read_word(addr)) };
            match header {
                Header::Live(HeapTag::Cons) => {
                    gc.evacuate_field(addr, layout::CONS_CAR);
                    gc.evacuate_field(addr, layout::CONS_CDR);
                }
                Header::Live(HeapTag::Lambda) | Header::Live(HeapTag::Macro) => {
                    gc.evacuate_field(addr, layout::FUNC_PARAMS);
                    gc.evacuate_field(addr, layout::FUNC_ENV);
                    let state = unsafe {
                        CompileState::from_word(object::read_word(addr + layout::FUNC_STATE))
                    };
                    if state != CompileState::Compiled {
                        gc.evacuate_field(addr, layout::FUNC_BODY);
                    }
                }
                Header::Live(HeapTag::Symbol) | Header::Live(HeapTag::Builtin) => {}
                Header::Forwarded(_) => unreachable!("forwarded object in destination space"),
            }
            scan += size;
        }

        // Install the destination as the active semi-space.
        let live = gc.dst_len;
        match new_spaces {
            Some(spaces) => {
                self.spaces = spaces;
                self.spaces.set_used(live);
            }
            None => self.spaces.flip(live),
        }

        let freed = used_before.saturating_sub(live);
        self.cycles += 1;
        self.total_freed += freed as u64;

        let occupancy = live * 100 / self.spaces.half();
        self.grow_next = occupancy > self.config().grow_threshold as usize;

        let grown = if mode == Mode::Grow { " (grown)" } else { "" };
        if self.config().verbose_gc {
            log::info!(
                "[gc] cycle {}: {} bytes freed, {} bytes used, {}% of semi-space{}",
                self.cycles,
                freed,
                live,
                occupancy,
                grown
            );
        } else {
            log::debug!(
                "[gc] cycle {}: {} bytes freed, {} bytes used, {}% of semi-space{}",
                self.cycles,
                freed,
                live,
                occupancy,
                grown
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::value::{NIL, TRUE};
    use crate::{gc_frame, Heap};

    fn small_heap() -> Heap {
        Heap::new(HeapConfig {
            heap_size: 32 * 1024,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_collect_empty_heap() {
        let mut heap = small_heap();
        heap.collect_now();
        heap.collect_now();
        assert_eq!(heap.cycles(), 2);
    }

    #[test]
    fn test_rooted_cons_survives() {
        let mut heap = small_heap();
        let mut pair = heap.alloc_cons(Value::number(7), TRUE);
        gc_frame!(heap, [pair]);

        let before = pair;
        heap.collect_now();
        // The local was rewritten to the new location but reads the same.
        assert_ne!(pair.raw(), before.raw());
        assert!(pair.is_cons());
        assert_eq!(heap.car(pair).as_number(), 7);
        assert_eq!(heap.cdr(pair), TRUE);
    }

    #[test]
    fn test_garbage_is_reclaimed() {
        let mut heap = small_heap();
        for _ in 0..100 {
            heap.alloc_cons(NIL, NIL);
        }
        let used = heap.used_bytes();
        heap.collect_now();
        assert!(heap.used_bytes() < used);
    }

    #[test]
    fn test_aliases_coalesce() {
        let mut heap = small_heap();
        let mut a = heap.alloc_cons(Value::number(1), NIL);
        let mut b = a;
        gc_frame!(heap, [a, b]);

        heap.collect_now();
        assert_eq!(a, b, "two roots to one object must forward identically");
    }

    #[test]
    fn test_shared_structure_preserved() {
        let mut heap = small_heap();
        let mut shared = heap.alloc_cons(Value::number(9), NIL);
        gc_frame!(heap, [shared]);
        let mut left = heap.alloc_cons(shared, NIL);
        gc_frame!(heap, [left]);
        let mut right = heap.alloc_cons(shared, NIL);
        gc_frame!(heap, [right]);

        heap.collect_now();
        assert_eq!(heap.car(left), heap.car(right));
        assert_eq!(heap.car(left), shared);
    }

    #[test]
    fn test_tags_survive_collection() {
        let mut heap = small_heap();
        let mut sym = heap.intern("stay").unwrap();
        let mut pair = heap.alloc_cons(NIL, NIL);
        let mut f = heap.alloc_function(HeapTag::Lambda, NIL, Value::number(1), NIL);
        gc_frame!(heap, [sym, pair, f]);

        heap.collect_now();
        assert_eq!(sym.heap_tag(), Some(HeapTag::Symbol));
        assert_eq!(pair.heap_tag(), Some(HeapTag::Cons));
        assert_eq!(f.heap_tag(), Some(HeapTag::Lambda));
    }

    #[test]
    fn test_interning_survives_collection() {
        let mut heap = small_heap();
        let mut before = heap.intern("keep").unwrap();
        gc_frame!(heap, [before]);
        heap.collect_now();
        let after = heap.intern("keep").unwrap();
        assert_eq!(before, after, "interned identity must survive collection");
    }

    #[test]
    fn test_compiled_body_not_traced() {
        let mut heap = small_heap();
        let mut f = heap.alloc_function(HeapTag::Lambda, NIL, NIL, NIL);
        gc_frame!(heap, [f]);
        // Pretend-compile with an address that would crash if traced.
        heap.set_func_body_raw(f, 0xdead_bee8);
        heap.set_func_state(f, CompileState::Compiled);

        heap.collect_now();
        assert_eq!(heap.func_state(f), CompileState::Compiled);
        assert_eq!(heap.func_body_raw(f), 0xdead_bee8);
    }

    #[test]
    fn test_growth_after_high_occupancy() {
        let mut heap = Heap::new(HeapConfig {
            heap_size: 8 * 1024,
            grow_threshold: 10,
            ..Default::default()
        })
        .unwrap();
        let before = heap.semi_space_bytes();

        // Keep enough live data to exceed 10% of the 4 KiB semi-space.
        let mut list = NIL;
        gc_frame!(heap, [list]);
        for i in 0..30 {
            list = heap.alloc_cons(Value::number(i), list);
        }

        heap.collect_now(); // arms growth
        heap.collect_now(); // grows
        assert!(heap.semi_space_bytes() > before, "arena should have grown");

        // The live list is intact in the new arena.
        let mut n = 0;
        let mut v = list;
        while v.is_cons() {
            n += 1;
            v = heap.cdr(v);
        }
        assert_eq!(n, 30);
    }
}
