use predicates::prelude::*;

use super::common::TestEnv;

fn warm_cache(env: &TestEnv) {
  env.write_file("lock.txt", "v1");
  env.cmd().arg("run").arg(&env.project_path).assert().success();
}

#[test]
fn stats_on_empty_store() {
  let env = TestEnv::from_fixture("cached.yaml");

  env
    .cmd()
    .args(["cache", "stats"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Entries: 0"));
}

#[test]
fn stats_json_counts_entries() {
  let env = TestEnv::from_fixture("cached.yaml");
  warm_cache(&env);

  let output = env.cmd().args(["cache", "stats", "-o", "json"]).output().unwrap();
  assert!(output.status.success());

  let stats: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(stats["entries"], 1);
  assert!(stats["total_bytes"].as_u64().unwrap() > 0);
}

#[test]
fn prune_all_empties_the_cache() {
  let env = TestEnv::from_fixture("cached.yaml");
  warm_cache(&env);

  env
    .cmd()
    .args(["cache", "prune", "--all"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Cache pruned"))
    .stdout(predicate::str::contains("Entries removed: 1"));

  let (_, report) = env.run_json(&[]);
  assert_eq!(super::common::step(&report, "deps")["cache_hit"], false);
}

#[test]
fn prune_within_capacity_keeps_entries() {
  let env = TestEnv::from_fixture("cached.yaml");
  warm_cache(&env);

  env
    .cmd()
    .args(["cache", "prune", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"entries_removed\": 0"));
}

#[test]
fn prune_to_zero_bytes_evicts() {
  let env = TestEnv::from_fixture("cached.yaml");
  warm_cache(&env);

  env
    .cmd()
    .args(["cache", "prune", "--max-bytes", "0", "-o", "json"])
    .assert()
    .success()
    .stdout(predicate::str::contains("\"entries_removed\": 1"));
}

#[test]
fn prune_flags_conflict() {
  let env = TestEnv::from_fixture("cached.yaml");

  env
    .cmd()
    .args(["cache", "prune", "--all", "--max-bytes", "10"])
    .assert()
    .failure();
}

#[test]
fn store_flag_overrides_env() {
  let env = TestEnv::from_fixture("cached.yaml");
  let custom = env.temp.path().join("custom-store");

  env
    .cmd()
    .args(["cache", "stats", "--store"])
    .arg(&custom)
    .assert()
    .success();

  assert!(custom.join("cache").exists());
  assert!(!env.store_path().exists());
}
