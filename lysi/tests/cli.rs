//! End-to-end CLI tests: drive the built binary over pipes and script
//! files the way a user would.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn lysi() -> Command {
    Command::cargo_bin("lysi").unwrap()
}

#[test]
fn test_simple_arithmetic() {
    lysi()
        .arg("--quiet")
        .write_stdin("(+ 1 2 3)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("6"));
}

#[test]
fn test_scenario_factorial_with_prelude() {
    let src = "(defun fact (n) (if (< n 2) 1 (mul n (fact (- n 1)))))\n(fact 10)\n";
    lysi()
        .arg("--quiet")
        .write_stdin(src)
        .assert()
        .success()
        .stdout(predicate::str::contains("3628800"));
}

#[test]
fn test_tail_recursion_does_not_overflow() {
    let src = "(defun countdown (n) (if (eq n 0) 'done (countdown (- n 1))))\n(countdown 1000000)\n";
    lysi()
        .arg("--quiet")
        .write_stdin(src)
        .assert()
        .success()
        .stdout(predicate::str::contains("done"));
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_scenario_compile_add1() {
    let src = "(defun add1 (x) (+ x 1))\n(compile add1)\n(add1 41)\n";
    lysi()
        .arg("--quiet")
        .write_stdin(src)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[cfg(all(target_arch = "x86_64", unix))]
#[test]
fn test_scenario_compiled_tail_recursion() {
    let src = "(defun f (x) (if (eq x 0) 0 (f (- x 1))))\n(compile f)\n(f 1000000)\n";
    lysi()
        .arg("--quiet")
        .write_stdin(src)
        .assert()
        .success()
        .stdout(predicate::str::contains("0"));
}

#[test]
fn test_errors_go_to_stderr_and_repl_survives() {
    lysi()
        .arg("--quiet")
        .write_stdin("(car 5)\n(+ 2 2)\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("Error:"))
        .stdout(predicate::str::contains("4"));
}

#[test]
fn test_undefined_symbol_reports() {
    lysi()
        .arg("--quiet")
        .write_stdin("no-such-symbol\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("undefined symbol 'no-such-symbol'"));
}

#[test]
fn test_exit_terminates_cleanly() {
    lysi()
        .arg("--quiet")
        .write_stdin("(exit)\n(print 'never)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("never").not());
}

#[test]
fn test_eof_exits_zero() {
    lysi().arg("--quiet").write_stdin("").assert().success();
}

#[test]
fn test_unknown_flag_is_rejected() {
    lysi().arg("--definitely-not-a-flag").assert().failure();
}

#[test]
fn test_banner_suppressed_by_quiet() {
    lysi()
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("lys"));
    lysi()
        .arg("--quiet")
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_echo_flag_reprints_input() {
    lysi()
        .args(["--quiet", "--echo"])
        .write_stdin("(quote hello)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("(quote hello)"));
}

#[test]
fn test_multiline_form_continues() {
    lysi()
        .arg("--quiet")
        .write_stdin("(+ 1\n2\n3)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("6"));
}

#[test]
fn test_script_file_runs_without_repl() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.lys");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "(print (mul 6 7))").unwrap();
    drop(f);

    lysi()
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn test_load_between_files() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.lys");
    std::fs::write(&lib, "(define answer 42)\n").unwrap();
    let main = dir.path().join("main.lys");
    std::fs::write(
        &main,
        format!("(load \"{}\")\n(print answer)\n", lib.display()),
    )
    .unwrap();

    lysi()
        .arg(&main)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
}

#[test]
fn test_no_std_skips_prelude() {
    lysi()
        .args(["--quiet", "--no-std"])
        .write_stdin("(mul 2 3)\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("undefined symbol 'mul'"));
}

#[test]
fn test_write_char_emits_raw_bytes() {
    lysi()
        .arg("--quiet")
        .write_stdin("(write-char 104 105 10)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}

#[test]
fn test_gc_threshold_flag_accepted() {
    lysi()
        .args(["--quiet", "-m", "50", "--heap-size", "65536"])
        .write_stdin("(+ 1 1)\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
}

#[test]
fn test_heap_pressure_program_completes() {
    // Allocation-heavy enough to force collections in a small arena.
    let src = "\
(defun build (n) (if (eq n 0) nil (cons n (build (- n 1)))))\n\
(len (build 200))\n";
    lysi()
        .args(["--quiet", "--heap-size", "32768"])
        .write_stdin(src)
        .assert()
        .success()
        .stdout(predicate::str::contains("200"));
}
