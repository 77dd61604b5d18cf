//! Argument handling of the `run-jobs` binary. Every case here fails before a
//! database connection is attempted.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::json;

fn run_jobs(dir: &Path, args: &[&str]) -> Output {
    let bin_path = assert_cmd::cargo::cargo_bin!("run-jobs");
    Command::new(bin_path)
        .args(args)
        .current_dir(dir)
        .env_clear()
        .env("SAPSYNC_LOG_LEVEL", "warn")
        .output()
        .expect("failed to spawn run-jobs")
}

fn write_materials_job(root: &Path) {
    let dir = root.join("jobs").join("materials");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("job.json"),
        json!({
            "id": "materials",
            "mode": "pull",
            "schedule": "*/5 * * * *",
            "source": {"url": "https://sap.example.com/odata/Materials"},
            "target": {"table": "materials", "strategy": "replace"}
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("mapping.json"),
        json!({"columns": ["id"], "rename": {"Material": "id"}}).to_string(),
    )
    .unwrap();
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn requires_a_selection() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_jobs(dir.path(), &[]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("nothing to run"));
}

#[test]
fn unknown_job_id_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_materials_job(dir.path());

    let output = run_jobs(dir.path(), &["--job", "materials", "--job", "ghost"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown job id(s): ghost"));
}

#[test]
fn all_conflicts_with_job() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_jobs(dir.path(), &["--all", "--job", "materials"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("cannot be used with"));
}

#[test]
fn missing_jobs_dir_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_jobs(dir.path(), &["--all", "--jobs-dir", "nowhere"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("loading job definitions"));
}
