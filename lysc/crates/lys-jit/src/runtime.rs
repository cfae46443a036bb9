//! Helpers callable from emitted code.
//!
//! Emitted code stays inside the integer-register convention: one tagged
//! word in, one tagged word out. Nothing here may allocate on the Lisp
//! heap; native frames are invisible to the collector.

use std::io::Write;

use lys_heap::value::NIL;

/// `write-char` for compiled code: writes the payload's low byte to
/// stdout and returns `nil`, mirroring the interpreted primitive.
pub unsafe extern "C" fn rt_write_char(v: u64) -> u64 {
    let byte = (((v as i64) >> 2) & 0xff) as u8;
    let _ = std::io::stdout().write_all(&[byte]);
    NIL.raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_char_returns_nil() {
        // Smoke test; the byte lands on stdout.
        let ret = unsafe { rt_write_char(lys_heap::Value::number(10).raw()) };
        assert_eq!(ret, NIL.raw());
    }
}
