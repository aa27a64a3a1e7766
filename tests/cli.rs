//! Integration tests for the binary: record a trace, run `unspool` on it,
//! check the exit status and the files it leaves behind.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use unspool::record::{StreamRecorder, TraceRecorder};

fn unspool() -> Command {
    assert_cmd::cargo::cargo_bin_cmd!("unspool")
}

fn record_trace(dir: &TempDir) -> std::path::PathBuf {
    let mut rec = TraceRecorder::create(dir.path().join("trace")).unwrap();
    rec.host("alpha", 1).unwrap();
    let mut t = StreamRecorder::new();
    t.event(100, "SHc", &0i32.to_le_bytes()).unwrap();
    t.event(200, "SHx", &0i32.to_le_bytes()).unwrap();
    t.event(300, "SHe", &[]).unwrap();
    rec.thread("alpha", 1, t).unwrap();
    rec.root().to_path_buf()
}

#[test]
fn replays_into_the_trace_directory_by_default() {
    let dir = TempDir::new().unwrap();
    let root = record_trace(&dir);
    unspool().arg(&root).assert().success();
    assert!(root.join("cpu.tsv").is_file());
    assert!(root.join("thread.tsv").is_file());
}

#[test]
fn output_flag_and_verbose_summary() {
    let dir = TempDir::new().unwrap();
    let root = record_trace(&dir);
    let out = dir.path().join("out");
    unspool()
        .arg(&root)
        .arg("-o")
        .arg(&out)
        .arg("-v")
        .assert()
        .success()
        .stderr(predicate::str::contains("replay complete"));
    assert!(out.join("cpu.tsv").is_file());
    assert!(out.join("thread.tsv").is_file());
    assert!(!root.join("cpu.tsv").exists());
}

#[test]
fn a_missing_trace_directory_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    unspool()
        .arg(dir.path().join("nope"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error:"));
}
