//! Tracer integration tests: fork real children under ptrace and observe
//! what they read.

use std::fs;
use std::path::PathBuf;

use helpcache::trace;

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn run_collecting(script: &str) -> (trace::TraceOutput, Vec<PathBuf>) {
    let mut deps = Vec::new();
    let output = trace::run(&sh(script), |path| deps.push(path.to_path_buf()))
        .expect("trace should succeed");
    (output, deps)
}

fn contains_path(deps: &[PathBuf], wanted: &PathBuf) -> bool {
    let canonical = fs::canonicalize(wanted).ok();
    deps.iter()
        .any(|p| p == wanted || Some(p) == canonical.as_ref())
}

#[test]
fn captures_stdout_and_exit_status() {
    let (output, _) = run_collecting("echo USAGE");
    assert_eq!(output.stdout, b"USAGE\n");
    assert_eq!(output.exit_status, 0);
}

#[test]
fn reports_nonzero_exit_status() {
    let (output, _) = run_collecting("exit 3");
    assert_eq!(output.exit_status, 3);
}

#[test]
fn stderr_is_not_captured() {
    let (output, _) = run_collecting("echo OUT; echo ERR >&2");
    assert_eq!(output.stdout, b"OUT\n");
}

#[test]
fn records_files_opened_for_reading() {
    let dir = tempfile::tempdir().unwrap();
    let dep = dir.path().join("data.txt");
    fs::write(&dep, "A\n").unwrap();

    // `exec` keeps the open in the traced process; the tracer does not
    // follow forked grandchildren.
    let (output, deps) = run_collecting(&format!("exec cat {}", dep.display()));
    assert_eq!(output.stdout, b"A\n");
    assert!(
        contains_path(&deps, &dep),
        "{deps:?} should contain {dep:?}"
    );
}

#[test]
fn resolves_relative_opens_against_child_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let dep = dir.path().join("cfg");
    fs::write(&dep, "X\n").unwrap();

    // The child chdirs away from the tracer's own cwd before the
    // relative open; the recorded dependency must follow the child.
    let (output, deps) =
        run_collecting(&format!("cd {} && exec cat ./cfg", dir.path().display()));
    assert_eq!(output.stdout, b"X\n");

    let expected = fs::canonicalize(&dep).unwrap();
    assert!(
        deps.contains(&expected),
        "{deps:?} should contain {expected:?}"
    );
}

#[test]
fn failed_opens_are_not_recorded() {
    // `exec` so the failing open happens on the traced pid itself; cat
    // exits nonzero when the file does not exist.
    let (output, deps) = run_collecting("exec cat /no-such-helpcache-dep 2>/dev/null");
    assert_ne!(output.exit_status, 0);
    assert!(
        !deps
            .iter()
            .any(|p| p.to_string_lossy().contains("no-such-helpcache-dep")),
        "missing file must not appear in {deps:?}"
    );
}

#[test]
fn write_only_opens_are_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.txt");

    let (_, deps) = run_collecting(&format!("echo x > {}", target.display()));
    assert!(
        !contains_path(&deps, &target),
        "write-only open must not appear in {deps:?}"
    );
}

#[test]
fn child_killed_by_signal_reports_conventional_status() {
    let (output, _) = run_collecting("kill -KILL $$");
    assert_eq!(output.exit_status, 128 + libc::SIGKILL);
}
