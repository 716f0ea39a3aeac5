use predicates::prelude::*;

use super::common::{BUILD_SCRIPT, TestEnv};

#[test]
fn empty_cache_lists_nothing() {
  let env = TestEnv::new();

  env
    .kiln_cmd()
    .args(["cache", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Cache is empty"));
}

#[test]
fn cache_list_shows_entries_after_a_run() {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env.kiln_cmd().arg("run").assert().success();

  env
    .kiln_cmd()
    .args(["cache", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("container"))
    .stdout(predicate::str::contains("directory"))
    .stdout(predicate::str::contains("Entries:"));
}

#[test]
fn cache_clear_empties_the_cache() {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env.kiln_cmd().arg("run").assert().success();

  env
    .kiln_cmd()
    .args(["cache", "clear", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"removed\""));

  let output = env.kiln_cmd().args(["cache", "list", "-o", "json"]).output().unwrap();
  let entries: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(entries.as_array().unwrap().len(), 0);
}
