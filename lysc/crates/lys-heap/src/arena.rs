//! Semi-space arena.
//!
//! The heap is one contiguous anonymous mapping split into two equal
//! halves. One half is *active* and serves bump allocations; the other is
//! *reserved* and becomes the destination of the next copying collection.
//!
//! ```text
//! ┌───────────────────────────┬───────────────────────────┐
//! │          active           │         reserved          │
//! │  [allocated…)  [free…)    │                           │
//! └───────────────────────────┴───────────────────────────┘
//!                 ▲
//!                 bump pointer
//! ```
//!
//! Allocation is a bounds check plus a pointer increment. The arena never
//! hands out a block that is not word aligned; callers pass pre-aligned
//! sizes.

use memmap2::MmapMut;

use crate::error::{HeapError, Result};
use crate::value::WORD;

/// A pair of semi-spaces backed by a single anonymous mapping.
pub struct SemiSpaces {
    map: MmapMut,
    total: usize,
    half: usize,
    active_high: bool,
    bump: usize,
}

impl SemiSpaces {
    /// Map a fresh arena of `total` bytes (a power-of-two word multiple;
    /// validated by [`crate::HeapConfig`]). The low half starts active.
    pub fn new(total: usize) -> Result<SemiSpaces> {
        debug_assert!(total % (2 * WORD) == 0);
        let map = MmapMut::map_anon(total)
            .map_err(|e| HeapError::Init(format!("cannot map {total} byte arena: {e}")))?;
        Ok(SemiSpaces {
            map,
            total,
            half: total / 2,
            active_high: false,
            bump: 0,
        })
    }

    #[inline]
    fn base(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Start address of the active semi-space.
    #[inline]
    pub fn active_base(&self) -> usize {
        if self.active_high {
            self.base() + self.half
        } else {
            self.base()
        }
    }

    /// Start address of the reserved semi-space.
    #[inline]
    pub fn reserved_base(&self) -> usize {
        if self.active_high {
            self.base()
        } else {
            self.base() + self.half
        }
    }

    /// Bytes allocated in the active semi-space.
    #[inline]
    pub fn used(&self) -> usize {
        self.bump
    }

    /// Bytes still free in the active semi-space.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.half - self.bump
    }

    /// Size of one semi-space.
    #[inline]
    pub fn half(&self) -> usize {
        self.half
    }

    /// Size of the whole arena.
    #[inline]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bump-allocate `size` bytes (already word aligned) in the active
    /// semi-space. Returns the block address, or `None` when it would
    /// overflow and a collection is due.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        debug_assert_eq!(size % WORD, 0, "allocation sizes are word aligned");
        if self.bump + size > self.half {
            return None;
        }
        let addr = self.active_base() + self.bump;
        self.bump += size;
        Some(addr)
    }

    /// Make the reserved semi-space active after a collection evacuated
    /// `live_bytes` into it.
    pub fn flip(&mut self, live_bytes: usize) {
        debug_assert!(live_bytes <= self.half);
        self.active_high = !self.active_high;
        self.bump = live_bytes;
    }

    /// Set the bump pointer directly. Used when a freshly grown arena has
    /// been filled by evacuation.
    pub(crate) fn set_used(&mut self, live_bytes: usize) {
        debug_assert!(live_bytes <= self.half);
        self.bump = live_bytes;
    }

    /// Whether `addr` lies inside the active semi-space. Debug aid.
    #[cfg(debug_assertions)]
    pub fn contains_active(&self, addr: usize) -> bool {
        addr >= self.active_base() && addr < self.active_base() + self.half
    }
}
