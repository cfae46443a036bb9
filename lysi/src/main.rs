//! Lysi — the interactive driver for the lys Lisp system.
//!
//! Wires the reader, evaluator, collector, and JIT together into a REPL:
//! parse flags, initialize logging, boot a machine with the primitive set
//! (including the `freeze`/`compile` hooks) and the standard prelude, then
//! read one expression at a time, evaluate it, print the result, and drain
//! the error ring to stderr. Script files given on the command line are
//! loaded in order instead of running the REPL.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lys_eval::{eval, eval_source, load_file, Machine};
use lys_heap::HeapConfig;
use lys_read::{print_value, Reader};

/// The embedded standard prelude.
const STD_SOURCE: &str = include_str!("../lisp/std.lys");

/// Lysi — a small Lisp with a copying collector and a native-code JIT.
#[derive(Parser, Debug)]
#[command(name = "lysi")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Interactive REPL for the lys Lisp system", long_about = None)]
struct Cli {
    /// Script files to load in order; the REPL runs only when none are
    /// given.
    files: Vec<PathBuf>,

    /// Total heap arena size in bytes (a power of two)
    #[arg(long, env = "LYS_HEAP_SIZE")]
    heap_size: Option<usize>,

    /// Occupancy percentage above which a collection grows the arena
    #[arg(short = 'm', long, env = "LYS_GC_THRESHOLD",
          value_parser = clap::value_parser!(u8).range(1..=99))]
    gc_threshold: Option<u8>,

    /// Echo each form as it is read, before evaluation
    #[arg(short, long)]
    echo: bool,

    /// Report per-cycle collection statistics
    #[arg(short = 'g', long)]
    verbose_gc: bool,

    /// Suppress the banner and prompt
    #[arg(short, long)]
    quiet: bool,

    /// Do not load the standard prelude
    #[arg(long)]
    no_std: bool,

    /// Echo recorded errors to stderr as they happen
    #[cfg(debug_assertions)]
    #[arg(long)]
    stack_trace: bool,

    /// Start with evaluator tracing enabled
    #[cfg(debug_assertions)]
    #[arg(short, long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose_gc)?;

    let mut machine = boot(&cli)?;

    if cli.files.is_empty() {
        repl(&mut machine, cli.echo, cli.quiet)
    } else {
        run_files(&mut machine, &cli.files)
    }
}

/// Initialize the tracing subscriber; library crates log through the
/// `log` facade and are captured by the fmt layer.
fn init_logging(verbose_gc: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose_gc { "info" } else { "warn" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).without_time())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;
    Ok(())
}

/// Build the machine from the flags: heap configuration, JIT hooks, and
/// the standard prelude.
fn boot(cli: &Cli) -> anyhow::Result<Machine> {
    let mut config = HeapConfig::from_env();
    if let Some(size) = cli.heap_size {
        config.heap_size = size;
    }
    if let Some(pct) = cli.gc_threshold {
        config.grow_threshold = pct;
    }
    config.verbose_gc |= cli.verbose_gc;

    let mut machine = Machine::new(config).context("cannot initialize the heap")?;
    lys_jit::install(&mut machine).context("cannot install the compiler hooks")?;

    #[cfg(debug_assertions)]
    {
        machine.trace_errors = cli.stack_trace;
        machine.debug = cli.debug;
    }

    if !cli.no_std {
        eval_source(&mut machine, STD_SOURCE);
        drain_errors(&mut machine);
    }
    Ok(machine)
}

/// Load each script file in order; `(exit)` stops the sequence.
fn run_files(machine: &mut Machine, files: &[PathBuf]) -> anyhow::Result<()> {
    for path in files {
        load_file(machine, &path.to_string_lossy());
        drain_errors(machine);
        if machine.shutdown {
            break;
        }
    }
    io::stdout().flush().ok();
    Ok(())
}

/// The read-eval-print loop. Incomplete forms accumulate across lines
/// until they close; EOF or `(exit)` ends the session cleanly.
fn repl(machine: &mut Machine, echo: bool, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("lys {} — (exit) or ^D to quit", env!("CARGO_PKG_VERSION"));
    }

    let stdin = io::stdin();
    let mut pending = String::new();
    loop {
        if machine.shutdown {
            break;
        }
        if !quiet {
            print!("{}", if pending.is_empty() { "> " } else { ".. " });
            io::stdout().flush().ok();
        }

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        pending.push_str(&line);

        let leftover = eval_buffer(machine, &pending, echo);
        pending = leftover;
    }
    io::stdout().flush().ok();
    Ok(())
}

/// Evaluate every complete form in `buffer`, printing each result, and
/// return the unconsumed text (the tail of an incomplete form) for the
/// next line to extend.
fn eval_buffer(machine: &mut Machine, buffer: &str, echo: bool) -> String {
    let mut reader = Reader::new(buffer, &machine.heap);
    let mut consumed = 0;
    loop {
        match reader.read(&mut machine.heap) {
            Ok(Some(form)) => {
                consumed = reader.offset();
                if echo {
                    println!("{}", print_value(&machine.heap, form));
                }
                let globals = machine.heap.globals();
                let result = eval(machine, globals, form);
                println!("{}", print_value(&machine.heap, result));
                io::stdout().flush().ok();
                drain_errors(machine);
                if machine.shutdown {
                    return String::new();
                }
            }
            Ok(None) => return String::new(),
            Err(e) if e.is_incomplete() => {
                return buffer[consumed..].to_string();
            }
            Err(e) => {
                machine.record_error(lys_eval::LispError::Read(e.to_string()));
                drain_errors(machine);
                return String::new();
            }
        }
    }
}

/// Print every pending error as one "Error: …" line on stderr, in
/// insertion order.
fn drain_errors(machine: &mut Machine) {
    for err in machine.errors.drain() {
        eprintln!("Error: {err}");
    }
}
