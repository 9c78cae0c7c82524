use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;

const GRAPH: &str = r#"{
  "stacks": [
    {
      "name": "base",
      "environment": "prod",
      "resources": [
        {
          "name": "db",
          "type": "gcp-cloudsql-postgres",
          "config": { "version": "POSTGRES_16", "tier": "db-f1-micro" }
        }
      ]
    },
    {
      "name": "api",
      "environment": "prod",
      "parent": { "stack": "base" },
      "workload": {
        "name": "api",
        "shape": "kubernetes-pod",
        "containers": [{ "name": "app", "image": "api:1" }],
        "uses": ["db"]
      }
    }
  ]
}"#;

fn fleetstack(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fleetstack").unwrap();
    cmd.current_dir(dir)
        .env("NO_COLOR", "1")
        .env("FLEETSTACK_CONFIG_PATH", dir.join("fleetstack.yaml"));
    cmd
}

fn project() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("fleetstack.yaml"), "project: acme\n").unwrap();
    fs::write(dir.path().join("graph.json"), GRAPH).unwrap();
    dir
}

#[test]
fn test_cli_help() {
    let dir = project();
    fleetstack(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("deploy"))
        .stdout(predicate::str::contains("outputs"))
        .stdout(predicate::str::contains("names"));
}

#[test]
fn test_names() {
    let dir = project();
    fleetstack(dir.path())
        .args(["names", "base", "pr-7", "--parent-env", "prod", "cache"])
        .assert()
        .success()
        .stdout(predicate::str::diff("base--cache--prod\n"));
}

#[test]
fn test_plan_summary() {
    let dir = project();
    fleetstack(dir.path())
        .args(["plan", "graph.json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("base--db--prod"))
        .stdout(predicate::str::contains(
            "2 stacks: 1 to create, 0 to adopt, 6 exports, 1 consumer wirings",
        ));
}

#[test]
fn test_plan_rejects_invalid_graph() {
    let dir = project();
    fs::write(
        dir.path().join("broken.json"),
        r#"{"stacks":[{"name":"api","environment":"prod","parent":{"stack":"missing"}}]}"#,
    )
    .unwrap();
    fleetstack(dir.path())
        .args(["plan", "broken.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_deploy_requires_simulate() {
    let dir = project();
    fleetstack(dir.path())
        .args(["deploy", "graph.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--simulate"));
}

#[test]
fn test_deploy_then_outputs_masks_secrets() {
    let dir = project();
    fleetstack(dir.path())
        .args(["deploy", "graph.json", "--simulate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deploy finished"));

    assert!(dir.path().join(".fleetstack").join("state.json").exists());

    fleetstack(dir.path())
        .args(["outputs", "base", "prod"])
        .assert()
        .success()
        .stdout(predicate::str::contains("base--db--prod-connection-name = acme:"))
        .stdout(predicate::str::contains("base--db--prod-root-password = ********"));
}
