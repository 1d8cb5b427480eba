//! Integration tests for the Drover CLI

use std::path::Path;
use std::sync::Arc;

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use drover::config::StoreConfig;
use drover::process::SignalProbe;
use drover::store::{SessionStatus, SessionUpdate, StateStore};

/// Get a Command for the drover binary with the registry pinned to `state_dir`
fn drover(state_dir: &Path) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("drover"));
    cmd.env("DROVER_STATE_DIR", state_dir);
    cmd.env_remove("DROVER_STATE_FILE");
    cmd.env_remove("DROVER_LOCK_FILE");
    cmd.env_remove("DROVER_LOCK_TIMEOUT");
    cmd
}

/// Seed one registry record through the library, the same way the binary does
fn seed_session(state_dir: &Path, name: &str, dir: &Path, update: SessionUpdate) {
    let store = StateStore::new(StoreConfig::at_dir(state_dir), Arc::new(SignalProbe));
    store.upsert(name, update).unwrap();
}

/// A pid no live process can plausibly own (beyond i32::MAX)
const DEAD_PID: u32 = 4_000_000_000;

#[test]
fn test_help() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("unattended agent loops"));
}

#[test]
fn test_version() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_status_empty_registry() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions"));
}

#[test]
fn test_status_json_empty_registry() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_start_rejects_missing_directory() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .args(["start", "api", "--dir", "/nonexistent/project"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Missing working directory"));
}

#[test]
fn test_start_rejects_missing_task_file() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    drover(temp.path())
        .args(["start", "api", "--dir"])
        .arg(project.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Missing required file"));
}

#[test]
fn test_start_rejects_zero_iteration_budget() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("PRD.md"), "- [ ] task\n").unwrap();

    drover(temp.path())
        .args(["start", "api", "--max-iterations", "0", "--dir"])
        .arg(project.path())
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("Invalid iteration budget"));
}

#[test]
fn test_stop_unknown_session() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .args(["stop", "ghost"])
        .assert()
        .failure()
        .code(5)
        .stderr(predicate::str::contains("Session not found: ghost"));
}

#[test]
fn test_stop_requires_a_target() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .arg("stop")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Provide a session name"));
}

#[test]
fn test_resume_with_nothing_to_resume() {
    let temp = TempDir::new().unwrap();
    drover(temp.path())
        .arg("resume")
        .assert()
        .success()
        .stdout(predicate::str::contains("No resumable sessions"));
}

#[test]
fn test_status_lists_seeded_session() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    seed_session(
        temp.path(),
        "api",
        project.path(),
        SessionUpdate {
            dir: Some(project.path().to_path_buf()),
            status: Some(SessionStatus::Stopped),
            iteration: Some(3),
            max_iterations: Some(50),
            last_task_count: Some(Some(7)),
            ..Default::default()
        },
    );

    drover(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("api"))
        .stdout(predicate::str::contains("stopped"));
}

#[test]
fn test_status_json_carries_record_fields() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    seed_session(
        temp.path(),
        "api",
        project.path(),
        SessionUpdate {
            dir: Some(project.path().to_path_buf()),
            status: Some(SessionStatus::Failed),
            iteration: Some(9),
            ..Default::default()
        },
    );

    drover(temp.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"api\""))
        .stdout(predicate::str::contains("\"status\": \"failed\""))
        .stdout(predicate::str::contains("\"iteration\": 9"));
}

#[test]
fn test_status_survives_corrupt_state_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("sessions.json"), "{not json at all").unwrap();

    drover(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions"))
        // The self-heal warning belongs on stderr, not mixed into output.
        .stderr(predicate::str::contains("Corrupted state file"));
}

#[test]
fn test_status_marks_dead_running_session_stale() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    seed_session(
        temp.path(),
        "api",
        project.path(),
        SessionUpdate {
            dir: Some(project.path().to_path_buf()),
            status: Some(SessionStatus::Running),
            pid: Some(Some(DEAD_PID)),
            ..Default::default()
        },
    );

    drover(temp.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("stale"));
}

#[test]
fn test_stop_all_clears_dead_running_session() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    seed_session(
        temp.path(),
        "worker",
        project.path(),
        SessionUpdate {
            dir: Some(project.path().to_path_buf()),
            status: Some(SessionStatus::Running),
            pid: Some(Some(DEAD_PID)),
            ..Default::default()
        },
    );

    drover(temp.path())
        .args(["stop", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped: worker"));

    let store = StateStore::new(StoreConfig::at_dir(temp.path()), Arc::new(SignalProbe));
    let record = store.get("worker").unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Stopped);
    assert_eq!(record.pid, None);
}

#[test]
fn test_stop_prune_removes_stale_records() {
    let temp = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    seed_session(
        temp.path(),
        "orphan",
        project.path(),
        SessionUpdate {
            dir: Some(project.path().to_path_buf()),
            status: Some(SessionStatus::Running),
            pid: Some(Some(DEAD_PID)),
            ..Default::default()
        },
    );

    drover(temp.path())
        .args(["stop", "--prune"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pruned stale sessions: orphan"));

    let store = StateStore::new(StoreConfig::at_dir(temp.path()), Arc::new(SignalProbe));
    assert!(store.get("orphan").unwrap().is_none());
}
