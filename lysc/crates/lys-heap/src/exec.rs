//! Executable code pages.
//!
//! JIT output lives in anonymous mappings outside GC-managed memory. A page
//! starts writable, is filled by the emitter, and is then flipped to
//! read-execute and registered here. Pages never move and are only released
//! when the registry drops at shutdown; redefining a compiled function
//! strands its old page until then.

use memmap2::{Mmap, MmapMut};

use crate::error::{HeapError, Result};
use crate::object::align_up;

/// One finalized (read-execute) code page.
pub struct CodePage {
    map: Mmap,
    len: usize,
}

impl CodePage {
    /// Entry address of the emitted function.
    #[inline]
    pub fn entry(&self) -> usize {
        self.map.as_ptr() as usize
    }

    /// Bytes of emitted code.
    #[inline]
    pub fn code_len(&self) -> usize {
        self.len
    }
}

/// Owner of every executable page produced over the process lifetime.
#[derive(Default)]
pub struct ExecRegistry {
    pages: Vec<CodePage>,
}

impl ExecRegistry {
    pub fn new() -> ExecRegistry {
        ExecRegistry { pages: Vec::new() }
    }

    /// Map a writable buffer of at least `size` bytes, rounded up to the
    /// system page size.
    pub fn alloc_writable(&self, size: usize) -> Result<MmapMut> {
        let size = align_up(size.max(1), page_size::get());
        MmapMut::map_anon(size)
            .map_err(|e| HeapError::Exec(format!("cannot map {size} byte code buffer: {e}")))
    }

    /// Flip a filled buffer to read-execute, register it, and return its
    /// entry address. `len` is the number of emitted bytes.
    pub fn commit(&mut self, map: MmapMut, len: usize) -> Result<usize> {
        debug_assert!(len <= map.len());
        let map = map
            .make_exec()
            .map_err(|e| HeapError::Exec(format!("cannot make code page executable: {e}")))?;
        let page = CodePage { map, len };
        let entry = page.entry();
        log::debug!("[jit] committed {len} byte code page at {entry:#x}");
        self.pages.push(page);
        Ok(entry)
    }

    /// Number of live pages.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_page() {
        let registry = ExecRegistry::new();
        let map = registry.alloc_writable(10).unwrap();
        assert_eq!(map.len() % page_size::get(), 0);
        assert!(map.len() >= 10);
    }

    #[test]
    fn test_commit_registers_page() {
        let mut registry = ExecRegistry::new();
        let mut map = registry.alloc_writable(16).unwrap();
        map[0] = 0xc3; // ret
        let entry = registry.commit(map, 1).unwrap();
        assert_ne!(entry, 0);
        assert_eq!(registry.page_count(), 1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_committed_page_is_executable() {
        let mut registry = ExecRegistry::new();
        let mut map = registry.alloc_writable(16).unwrap();
        // mov eax, 0x2a; ret
        map[..6].copy_from_slice(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        let entry = registry.commit(map, 6).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(f(), 0x2a);
    }
}
