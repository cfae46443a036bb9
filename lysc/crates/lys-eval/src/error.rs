//! Lisp-level errors and the bounded error ring.
//!
//! Evaluation errors are not Rust errors: the faulting operation records
//! its complaint here, substitutes `nil`, and evaluation continues. The
//! REPL drains the ring to stderr after every top-level form. The ring
//! holds sixteen entries; past that, the oldest are overwritten.

use std::collections::VecDeque;
use thiserror::Error;

/// One recorded evaluation error.
#[derive(Debug, Clone, Error)]
pub enum LispError {
    #[error("undefined symbol '{name}'")]
    UndefinedSymbol { name: String },

    #[error("'{what}' is not a function")]
    NotAFunction { what: String },

    #[error("{name}: expected {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("{name}: expected {expected}")]
    Type {
        name: &'static str,
        expected: &'static str,
    },

    #[error("parse error: {0}")]
    Read(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("cannot open '{path}': {reason}")]
    Io { path: String, reason: String },
}

/// Bounded ring of pending errors.
pub struct ErrorRing {
    slots: VecDeque<LispError>,
}

impl ErrorRing {
    /// Ring capacity; the oldest entry is overwritten past this.
    pub const CAPACITY: usize = 16;

    pub fn new() -> ErrorRing {
        ErrorRing {
            slots: VecDeque::with_capacity(Self::CAPACITY),
        }
    }

    /// Record an error, dropping the oldest when full.
    pub fn push(&mut self, err: LispError) {
        if self.slots.len() == Self::CAPACITY {
            self.slots.pop_front();
        }
        self.slots.push_back(err);
    }

    /// Take every pending error in insertion order, leaving the ring empty.
    pub fn drain(&mut self) -> Vec<LispError> {
        self.slots.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for ErrorRing {
    fn default() -> Self {
        ErrorRing::new()
    }
}
