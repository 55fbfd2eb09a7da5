use predicates::prelude::*;

use super::common::{TestEnv, step};

#[test]
fn run_pipeline_succeeds() {
  let env = TestEnv::from_fixture("pipeline.yaml");

  env
    .cmd()
    .arg("run")
    .arg(&env.project_path)
    .assert()
    .success()
    .stdout(predicate::str::contains("Wave 1:"))
    .stdout(predicate::str::contains("prepare"))
    .stdout(predicate::str::contains("succeeded"));

  assert!(env.workspace().join("prepared.txt").exists());
  assert!(env.workspace().join("out.txt").exists());
}

#[test]
fn run_json_report_lists_waves_and_artifacts() {
  let env = TestEnv::from_fixture("pipeline.yaml");

  let (code, report) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  assert_eq!(report["status"], "succeeded");
  assert_eq!(report["waves"], serde_json::json!([["prepare"], ["build", "lint"]]));

  let build = step(&report, "build");
  assert_eq!(build["status"], "succeeded");
  assert_eq!(build["attempts"], 1);
  assert_eq!(build["artifacts"][0]["name"], "primary");
  assert!(env.store_path().join("artifacts").exists());
}

#[test]
fn run_json_project_file() {
  let env = TestEnv::from_fixture("pipeline.json");

  let (code, report) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  assert_eq!(report["waves"], serde_json::json!([["first"], ["second"]]));
}

#[test]
fn failed_step_exits_one_and_skips_dependents() {
  let env = TestEnv::from_fixture("failing.yaml");

  let (code, report) = env.run_json(&[]);
  assert_eq!(code, Some(1));
  assert_eq!(report["status"], "failed");
  assert_eq!(step(&report, "compile")["status"], "failed");
  assert_eq!(step(&report, "package")["status"], "skipped");
  assert_eq!(step(&report, "docs")["status"], "succeeded");
}

#[test]
fn failed_step_text_output_names_the_command() {
  let env = TestEnv::from_fixture("failing.yaml");

  env
    .cmd()
    .arg("run")
    .arg(&env.project_path)
    .assert()
    .code(1)
    .stdout(predicate::str::contains("compile"))
    .stdout(predicate::str::contains("exit 3"))
    .stderr(predicate::str::contains("failed"));
}

#[test]
fn fail_fast_still_reports_every_step() {
  let env = TestEnv::from_fixture("failing.yaml");

  let (code, report) = env.run_json(&["--fail-fast", "-j", "1"]);
  assert_eq!(code, Some(1));
  assert_eq!(report["steps"].as_array().unwrap().len(), 3);
  assert_eq!(step(&report, "package")["status"], "skipped");
}

#[test]
fn second_run_hits_the_cache() {
  let env = TestEnv::from_fixture("cached.yaml");
  env.write_file("lock.txt", "v1");

  let (code, first) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  assert_eq!(step(&first, "deps")["cache_hit"], false);

  std::fs::remove_file(env.workspace().join("vendor.txt")).unwrap();

  let (code, second) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  let deps = step(&second, "deps");
  assert_eq!(deps["cache_hit"], true);
  assert_eq!(deps["attempts"], 0);
  assert!(env.workspace().join("vendor.txt").exists());
}

#[test]
fn changed_inputs_miss_the_cache() {
  let env = TestEnv::from_fixture("cached.yaml");
  env.write_file("lock.txt", "v1");
  let (_, _) = env.run_json(&[]);

  env.write_file("lock.txt", "v2");
  let (code, report) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  assert_eq!(step(&report, "deps")["cache_hit"], false);
}

#[test]
fn matrix_filter_limits_combinations() {
  let env = TestEnv::from_fixture("matrix.yaml");

  let (code, report) = env.run_json(&["--matrix-filter", "os=linux"]);
  assert_eq!(code, Some(0));

  let ids: Vec<&str> = report["steps"]
    .as_array()
    .unwrap()
    .iter()
    .map(|s| s["id"].as_str().unwrap())
    .collect();
  assert_eq!(ids, vec!["build", "test#os=linux"]);
}

#[test]
fn unknown_filter_axis_exits_two() {
  let env = TestEnv::from_fixture("matrix.yaml");

  env
    .cmd()
    .arg("run")
    .arg(&env.project_path)
    .args(["--matrix-filter", "arch=arm64"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("arch"));
}

#[test]
fn cycle_exits_two_before_running() {
  let env = TestEnv::from_fixture("cycle.yaml");

  env
    .cmd()
    .arg("run")
    .arg(&env.project_path)
    .assert()
    .code(2)
    .stderr(predicate::str::contains("cycle"));

  assert!(!env.store_path().exists());
}

#[test]
fn missing_project_file_exits_two() {
  let env = TestEnv::with_project("steps: {}\n");

  env
    .cmd()
    .arg("run")
    .arg(env.workspace().join("missing.yaml"))
    .assert()
    .code(2)
    .stderr(predicate::str::contains("missing.yaml"));
}

#[test]
fn unknown_field_exits_two() {
  let env = TestEnv::with_project("steps:\n  build:\n    comands: [echo hi]\n");

  env
    .cmd()
    .arg("run")
    .arg(&env.project_path)
    .assert()
    .code(2)
    .stderr(predicate::str::contains("comands"));
}

#[cfg(unix)]
#[test]
fn step_env_reaches_commands() {
  let env = TestEnv::with_project(
    r#"
env:
  GREETING: hello
steps:
  greet:
    env:
      TARGET: world
    commands:
      - echo "$GREETING $TARGET $STEPWISE_STEP_ID" > greeting.txt
"#,
  );

  env.cmd().arg("run").arg(&env.project_path).assert().success();

  let content = std::fs::read_to_string(env.workspace().join("greeting.txt")).unwrap();
  assert!(content.contains("hello world greet"), "got {}", content);
}

#[cfg(unix)]
#[test]
fn step_timeout_flag_bounds_steps() {
  let env = TestEnv::from_fixture("slow.yaml");

  let (code, report) = env.run_json(&["--step-timeout", "500ms"]);
  assert_eq!(code, Some(1));
  assert_eq!(step(&report, "slow")["status"], "timed_out");
}

#[cfg(unix)]
#[test]
fn retries_are_reported() {
  let env = TestEnv::with_project(
    r#"
steps:
  flaky:
    commands:
      - test -f marker || { touch marker; exit 1; }
    retry:
      retries: 2
      backoff: 10ms
"#,
  );

  let (code, report) = env.run_json(&[]);
  assert_eq!(code, Some(0));
  assert_eq!(step(&report, "flaky")["attempts"], 2);
}
