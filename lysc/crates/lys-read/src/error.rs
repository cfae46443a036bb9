//! Reader error types.

use lys_heap::HeapError;
use thiserror::Error;

/// Errors produced while lexing or parsing source text.
#[derive(Debug, Error)]
pub enum ReadError {
    /// Input ended in the middle of a form. The REPL treats this as "keep
    /// reading lines" rather than as a hard failure.
    #[error("unexpected end of input at line {line}")]
    UnexpectedEof { line: u32 },

    #[error("unexpected ')' at line {line}")]
    UnexpectedRParen { line: u32 },

    #[error("integer literal '{literal}' overflows 62 bits")]
    IntegerOverflow { literal: String },

    #[error("symbol name too long: {len} bytes (limit {max})")]
    SymbolTooLong { len: usize, max: usize },

    #[error("unterminated quoted symbol starting at line {line}")]
    UnterminatedQuotedSymbol { line: u32 },

    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl ReadError {
    /// True when more input could complete the form.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            ReadError::UnexpectedEof { .. } | ReadError::UnterminatedQuotedSymbol { .. }
        )
    }
}
