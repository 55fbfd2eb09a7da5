use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn plan_prints_waves() {
  let env = TestEnv::from_fixture("pipeline.yaml");

  env
    .cmd()
    .arg("plan")
    .arg(&env.project_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Wave 1:"))
    .stdout(predicate::str::contains("Wave 2:"))
    .stdout(predicate::str::contains("build → prepare"));
}

#[test]
fn plan_does_not_run_or_touch_the_store() {
  let env = TestEnv::from_fixture("pipeline.yaml");

  env.cmd().arg("plan").arg(&env.project_path).assert().success();

  assert!(!env.workspace().join("prepared.txt").exists());
  assert!(!env.store_path().exists());
}

#[test]
fn plan_json_output_is_valid() {
  let env = TestEnv::from_fixture("matrix.yaml");

  let output = env
    .cmd()
    .arg("plan")
    .arg(&env.project_path)
    .args(["-o", "json"])
    .output()
    .unwrap();
  assert!(output.status.success());

  let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(
    plan["waves"],
    serde_json::json!([["build"], ["test#os=linux", "test#os=windows"]])
  );
  assert_eq!(plan["steps"]["test#os=windows"]["matrix"]["os"], "windows");
}

#[test]
fn plan_applies_matrix_filter() {
  let env = TestEnv::from_fixture("matrix.yaml");

  env
    .cmd()
    .arg("plan")
    .arg(&env.project_path)
    .args(["-m", "os=windows"])
    .assert()
    .success()
    .stdout(predicate::str::contains("test#os=windows"))
    .stdout(predicate::str::contains("test#os=linux").not());
}

#[test]
fn plan_reports_cycle_members() {
  let env = TestEnv::from_fixture("cycle.yaml");

  env
    .cmd()
    .arg("plan")
    .arg(&env.project_path)
    .assert()
    .code(2)
    .stderr(predicate::str::contains("cycle"))
    .stderr(predicate::str::contains("a, b"));
}

#[test]
fn plan_rejects_malformed_filter() {
  let env = TestEnv::from_fixture("matrix.yaml");

  env
    .cmd()
    .arg("plan")
    .arg(&env.project_path)
    .args(["-m", "os"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("axis=value"));
}
