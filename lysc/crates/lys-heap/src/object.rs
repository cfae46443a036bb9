//! Heap object layouts and the forwarding header.
//!
//! Object Layout (64-bit words):
//!
//! ```text
//! ┌──────────────────────┐
//! │ forwarded_or_type    │  every object starts with this one-word header
//! ├──────────────────────┤
//! │ type-specific payload│
//! └──────────────────────┘
//!
//! cons:     header | car | cdr
//! builtin:  header | fn pointer
//! lambda:   header | params | body | captured_env | compile state
//! macro:    header | params | body | captured_env | compile state
//! symbol:   header | name length | name bytes … NUL (padded to a word)
//! ```
//!
//! While an object is live in the current semi-space, the header holds the
//! object's [`HeapTag`] in its low three bits and zeros everywhere else.
//! After the collector copies the object, the header holds the full tagged
//! pointer to the copy. A tagged pointer always has non-zero bits above the
//! tag, so a single mask test tells the two states apart.

use crate::value::{HeapTag, Value, TAG_MASK, WORD};

/// Byte offsets of object fields, measured from the object start.
pub mod layout {
    use super::WORD;

    pub const CONS_CAR: usize = WORD;
    pub const CONS_CDR: usize = 2 * WORD;
    pub const CONS_SIZE: usize = 3 * WORD;

    pub const BUILTIN_FN: usize = WORD;
    pub const BUILTIN_SIZE: usize = 2 * WORD;

    pub const FUNC_PARAMS: usize = WORD;
    pub const FUNC_BODY: usize = 2 * WORD;
    pub const FUNC_ENV: usize = 3 * WORD;
    pub const FUNC_STATE: usize = 4 * WORD;
    pub const FUNC_SIZE: usize = 5 * WORD;

    pub const SYM_LEN: usize = WORD;
    pub const SYM_NAME: usize = 2 * WORD;
}

/// Displacement of the car field relative to a *tagged* cons pointer.
///
/// Emitted native code adds this to the value word directly instead of
/// masking the tag off first; the cons tag is folded into the constant.
pub const NATIVE_CAR_DISP: i32 = layout::CONS_CAR as i32 - HeapTag::Cons as i32;

/// Displacement of the cdr field relative to a tagged cons pointer.
pub const NATIVE_CDR_DISP: i32 = layout::CONS_CDR as i32 - HeapTag::Cons as i32;

/// Compilation state of a lambda or macro.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompileState {
    /// Body is the source tree as read.
    NotCompiled = 0,
    /// Body symbols have been rewritten to their resolved values.
    SymbolsResolved = 1,
    /// Body slot holds a raw native code address, not a value.
    Compiled = 2,
}

impl CompileState {
    #[inline]
    pub fn from_word(w: u64) -> CompileState {
        match w {
            1 => CompileState::SymbolsResolved,
            2 => CompileState::Compiled,
            _ => CompileState::NotCompiled,
        }
    }
}

/// Decoded form of the one-word object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    /// Object is live in its current location.
    Live(HeapTag),
    /// Object was copied; the word is the tagged pointer to the copy.
    Forwarded(Value),
}

impl Header {
    /// Decode a header word.
    #[inline]
    pub fn decode(word: u64) -> Header {
        if word & !TAG_MASK == 0 {
            match HeapTag::from_bits(word) {
                Some(tag) => Header::Live(tag),
                None => unreachable!("corrupt object header: {word:#x}"),
            }
        } else {
            Header::Forwarded(Value::from_raw(word))
        }
    }

    /// Encode back into a word.
    #[inline]
    pub fn encode(self) -> u64 {
        match self {
            Header::Live(tag) => tag as u64,
            Header::Forwarded(v) => v.raw(),
        }
    }
}

/// Round `n` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Allocation size of a symbol whose name is `name_len` bytes.
///
/// The name is stored inline after the length word, NUL terminated, and the
/// whole object is padded to a word multiple.
#[inline]
pub const fn symbol_size(name_len: usize) -> usize {
    layout::SYM_NAME + align_up(name_len + 1, WORD)
}

#[inline]
pub(crate) unsafe fn read_word(addr: usize) -> u64 {
    (addr as *const u64).read()
}

#[inline]
pub(crate) unsafe fn write_word(addr: usize, word: u64) {
    (addr as *mut u64).write(word);
}

/// Exact size of the live object at `addr`, derived from the header alone
/// (plus the stored name length for symbols). The collector relies on this
/// to walk a semi-space linearly.
///
/// # Safety
///
/// `addr` must point at a live object header.
pub(crate) unsafe fn object_size(addr: usize) -> usize {
    match Header::decode(read_word(addr)) {
        Header::Live(HeapTag::Cons) => layout::CONS_SIZE,
        Header::Live(HeapTag::Builtin) => layout::BUILTIN_SIZE,
        Header::Live(HeapTag::Lambda) | Header::Live(HeapTag::Macro) => layout::FUNC_SIZE,
        Header::Live(HeapTag::Symbol) => {
            let len = read_word(addr + layout::SYM_LEN) as usize;
            symbol_size(len)
        }
        Header::Forwarded(_) => panic!("object_size called on a forwarded object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_live_roundtrip() {
        for tag in [
            HeapTag::Symbol,
            HeapTag::Builtin,
            HeapTag::Cons,
            HeapTag::Lambda,
            HeapTag::Macro,
        ] {
            let h = Header::Live(tag);
            assert_eq!(Header::decode(h.encode()), h);
        }
    }

    #[test]
    fn test_header_forwarded_roundtrip() {
        let v = Value::pointer(0x1000, HeapTag::Cons);
        let h = Header::Forwarded(v);
        assert_eq!(Header::decode(h.encode()), h);
    }

    #[test]
    fn test_live_and_forwarded_distinguishable() {
        // A forwarded header always has address bits set; a live header never
        // does. Any non-zero address makes the states distinct.
        let live = Header::Live(HeapTag::Cons).encode();
        let fwd = Header::Forwarded(Value::pointer(WORD, HeapTag::Cons)).encode();
        assert_eq!(live & !TAG_MASK, 0);
        assert_ne!(fwd & !TAG_MASK, 0);
    }

    #[test]
    fn test_symbol_size_padding() {
        // "a" -> len word + name word holding "a\0" padded.
        assert_eq!(symbol_size(1), layout::SYM_NAME + WORD);
        // Seven bytes plus NUL exactly fill one word.
        assert_eq!(symbol_size(7), layout::SYM_NAME + WORD);
        // Eight bytes spill into a second word for the NUL.
        assert_eq!(symbol_size(8), layout::SYM_NAME + 2 * WORD);
    }

    #[test]
    fn test_native_disps() {
        assert_eq!(NATIVE_CAR_DISP, 5);
        assert_eq!(NATIVE_CDR_DISP, 13);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
    }
}
