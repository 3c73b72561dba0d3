//! CLI argument parsing tests for the dtsd and dtsq binaries.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn dtsd_help_runs() {
    Command::cargo_bin("dtsd")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn dtsd_version_runs() {
    Command::cargo_bin("dtsd")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn dtsd_without_config_fails_with_exit_1() {
    Command::cargo_bin("dtsd")
        .unwrap()
        .env_remove("DTS_CONFIG")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("DTS_CONFIG"));
}

#[test]
fn dtsq_help_runs() {
    Command::cargo_bin("dtsq")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn dtsq_requires_a_queue() {
    Command::cargo_bin("dtsq")
        .unwrap()
        .env_remove("DTSQ_CONFIG")
        .env("HOME", "/tmp")
        .arg("/no/such/file.fits")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("queue"));
}

#[test]
fn dtsq_requires_files_outside_recovery_mode() {
    Command::cargo_bin("dtsq")
        .unwrap()
        .env_remove("DTSQ_CONFIG")
        .env("HOME", "/tmp")
        .args(["-q", "sci", "account=des"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no files"));
}

#[test]
fn dtsq_verbose_levels_parse() {
    // flag parsing only; the files do not exist so the run still fails
    Command::cargo_bin("dtsq")
        .unwrap()
        .env_remove("DTSQ_CONFIG")
        .env("HOME", "/tmp")
        .args(["-vv", "-q", "sci", "-H", "localhost", "-p", "1", "/no/such.fits"])
        .assert()
        .failure()
        .code(1);
}
