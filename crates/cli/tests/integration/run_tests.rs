use predicates::prelude::*;

use super::common::{BUILD_SCRIPT, TestEnv};

fn built_env() -> TestEnv {
  let env = TestEnv::new();
  env.write_file("app.txt", "v1\n");
  env.write_script(BUILD_SCRIPT);
  env
}

#[test]
fn run_builds_and_reports_targets() {
  let env = built_env();

  env
    .kiln_cmd()
    .arg("run")
    .assert()
    .success()
    .stdout(predicate::str::contains("dist (directory)"))
    .stdout(predicate::str::contains("Pipeline complete"))
    .stderr(predicate::str::contains("building"));
}

#[test]
fn second_run_is_served_from_the_cache() {
  let env = built_env();
  env.kiln_cmd().arg("run").assert().success();

  env
    .kiln_cmd()
    .arg("run")
    .assert()
    .success()
    .stderr(predicate::str::contains("(cached)"))
    .stderr(predicate::str::contains("building").not());
}

#[test]
fn host_changes_rerun_the_build() {
  let env = built_env();
  env.kiln_cmd().arg("run").assert().success();

  env.write_file("app.txt", "v2\n");

  env
    .kiln_cmd()
    .arg("run")
    .assert()
    .success()
    .stderr(predicate::str::contains("building"));
}

#[test]
fn quiet_hides_process_output() {
  let env = built_env();

  env
    .kiln_cmd()
    .args(["run", "--quiet"])
    .assert()
    .success()
    .stderr(predicate::str::contains("building").not());
}

#[test]
fn ephemeral_runs_leave_no_cache_behind() {
  let env = built_env();

  env.kiln_cmd().args(["run", "--ephemeral"]).assert().success();

  assert!(!env.root_path().join("cache").exists());
}

#[test]
fn failing_steps_fail_the_run() {
  let env = TestEnv::new();
  env.write_script(
    r#"{
      "steps": [
        { "name": "base", "call": "base", "image": "alpine:3" },
        { "name": "test", "call": "exec", "container": "base",
          "args": ["/bin/sh", "-c", "echo '2 tests failed' >&2; exit 3"] },
        { "name": "after", "call": "exec", "container": "test", "args": ["/bin/sh", "-c", "true"] },
        { "name": "out", "call": "resolve", "node": "after" }
      ]
    }"#,
  );

  env
    .kiln_cmd()
    .arg("run")
    .assert()
    .failure()
    .stderr(predicate::str::contains("2 tests failed"))
    .stderr(predicate::str::contains("process exited with status 3"));
}

#[test]
fn timeouts_fail_the_run() {
  let env = TestEnv::new();
  env.write_script(
    r#"{
      "steps": [
        { "name": "base", "call": "base", "image": "alpine:3" },
        { "name": "slow", "call": "exec", "container": "base", "args": ["/bin/sleep", "5"] },
        { "name": "out", "call": "resolve", "node": "slow" }
      ]
    }"#,
  );

  env
    .kiln_cmd()
    .args(["run", "--timeout", "200ms"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("timed out"));
}

#[test]
fn exec_env_reaches_the_process() {
  let env = TestEnv::new();
  env.write_script(
    r#"{
      "steps": [
        { "name": "base", "call": "base", "image": "alpine:3" },
        { "name": "greet", "call": "exec", "container": "base", "args": ["/bin/sh", "-c", "echo \"hello $WHO\""] },
        { "name": "out", "call": "resolve", "node": "greet" }
      ]
    }"#,
  );

  env
    .kiln_cmd()
    .args(["run", "-e", "WHO=kiln"])
    .assert()
    .success()
    .stderr(predicate::str::contains("hello kiln"));
}

#[test]
fn json_output_lists_step_outcomes() {
  let env = built_env();

  let output = env.kiln_cmd().args(["run", "-o", "json"]).output().unwrap();

  assert!(output.status.success());
  let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  let steps = report["steps"].as_array().unwrap();
  assert_eq!(steps.len(), 5);
  assert_eq!(steps[4]["call"], "directory");
  assert!(steps[4]["output"].as_str().unwrap().starts_with("directory "));
  assert!(steps[0].get("output").is_none());
}

#[test]
fn no_host_refuses_mounts() {
  let env = built_env();

  env
    .kiln_cmd()
    .args(["run", "--no-host"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("host access failed"));
}
