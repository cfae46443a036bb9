//! Heap error types.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the heap and its collaborators.
///
/// Memory exhaustion is deliberately absent: running out of heap after a
/// grow attempt is fatal and aborts the process instead of unwinding
/// through the evaluator.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("heap initialization failed: {0}")]
    Init(String),

    #[error("symbol name too long: {len} bytes (limit {max})")]
    SymbolTooLong { len: usize, max: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("executable page error: {0}")]
    Exec(String),
}

/// Result type alias for heap operations.
pub type Result<T> = std::result::Result<T, HeapError>;
