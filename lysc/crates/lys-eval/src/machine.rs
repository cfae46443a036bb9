//! The machine: everything one Lisp session owns.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use lys_heap::{ExecRegistry, Heap, HeapConfig, HeapError};

use crate::error::{ErrorRing, LispError};
use crate::primitives;

/// A complete, single-threaded Lisp machine: the heap, the pending-error
/// ring, the executable-page registry, and the session flags.
pub struct Machine {
    pub heap: Heap,
    pub errors: ErrorRing,

    /// JIT code pages; freed when the machine drops at shutdown.
    pub exec: ExecRegistry,

    /// Set by `(exit)`; the REPL finishes the current form and stops.
    pub shutdown: bool,

    /// Toggled by `(debug …)` in debug builds; enables per-application
    /// trace logging in the evaluator.
    pub debug: bool,

    /// Echo every recorded error to stderr immediately instead of waiting
    /// for the REPL drain. Driven by the driver's `--stack-trace` flag.
    pub trace_errors: bool,

    rng: StdRng,
}

impl Machine {
    /// Build a machine over a fresh heap and install the core primitives
    /// into the global environment.
    pub fn new(config: HeapConfig) -> Result<Machine, HeapError> {
        let heap = Heap::new(config)?;
        let mut machine = Machine {
            heap,
            errors: ErrorRing::new(),
            exec: ExecRegistry::new(),
            shutdown: false,
            debug: false,
            trace_errors: false,
            rng: StdRng::from_entropy(),
        };
        primitives::install(&mut machine)?;
        Ok(machine)
    }

    /// A machine with the default heap configuration.
    pub fn with_defaults() -> Result<Machine, HeapError> {
        Machine::new(HeapConfig::default())
    }

    /// Record a non-fatal error; the caller substitutes `nil` and carries
    /// on.
    pub fn record_error(&mut self, err: LispError) {
        log::debug!("recorded error: {err}");
        if self.trace_errors {
            eprintln!("Error: {err}");
        }
        self.errors.push(err);
    }

    /// Value for the `(rand)` primitive: a non-negative 32-bit draw.
    pub fn rand(&mut self) -> i64 {
        self.rng.gen::<u32>() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_boots_with_primitives() {
        let mut m = Machine::with_defaults().unwrap();
        let plus = m.heap.intern("+").unwrap();
        let v = crate::scope::lookup(&m.heap, m.heap.globals(), plus);
        assert!(v.is_builtin(), "'+' must be installed as a builtin");
    }

    #[test]
    fn test_rand_is_non_negative() {
        let mut m = Machine::with_defaults().unwrap();
        for _ in 0..100 {
            assert!(m.rand() >= 0);
        }
    }
}
