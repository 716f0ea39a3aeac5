use predicates::prelude::*;

use super::common::{BUILD_SCRIPT, TestEnv};

#[test]
fn gc_with_empty_root_succeeds() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("gc")
    .assert()
    .success()
    .stdout(predicate::str::contains("Garbage collection complete"));
}

#[test]
fn gc_dry_run_shows_what_would_be_removed() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("gc")
    .arg("--dry-run")
    .assert()
    .success()
    .stdout(predicate::str::contains("Dry run"));
}

#[test]
fn gc_json_output_is_valid() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .arg("gc")
    .args(["-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("snapshots_deleted"))
    .stdout(predicate::str::contains("cache_entries_evicted"))
    .stdout(predicate::str::contains("deleted_paths"));
}

#[test]
fn gc_keeps_snapshots_of_cached_results() {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env.kiln_cmd().arg("run").assert().success();
  let before = env.snapshot_count();
  assert!(before > 0);

  env.kiln_cmd().arg("gc").assert().success();

  assert_eq!(env.snapshot_count(), before);
}

#[test]
fn gc_after_clearing_the_cache_removes_snapshots() {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env.kiln_cmd().arg("run").assert().success();

  env.kiln_cmd().args(["cache", "clear"]).assert().success();
  let dry = env.kiln_cmd().args(["gc", "--dry-run", "-o", "json"]).output().unwrap();
  let report: serde_json::Value = serde_json::from_slice(&dry.stdout).unwrap();
  assert!(report["stats"]["snapshots_deleted"].as_u64().unwrap() > 0);
  assert!(env.snapshot_count() > 0);

  env.kiln_cmd().arg("gc").assert().success();

  assert_eq!(env.snapshot_count(), 0);
}

#[test]
fn gc_applies_the_entry_bound() {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env.kiln_cmd().arg("run").assert().success();

  let output = env
    .kiln_cmd()
    .args(["gc", "--max-entries", "1", "-o", "json"])
    .output()
    .unwrap();

  assert!(output.status.success());
  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert!(report["stats"]["cache_entries_evicted"].as_u64().unwrap() > 0);
}
