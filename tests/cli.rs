//! CLI tests for code-sentinel.
//!
//! None of these reach a sandbox provider or model endpoint.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use code_sentinel::db::SentinelDb;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV_OVERRIDES: [&str; 8] = [
    "SENTINEL_CONFIG",
    "AI_PIPE_URL",
    "AI_PIPE_KEY",
    "SENTINEL_MODEL",
    "MONGO_URI",
    "SENTINEL_SANDBOX_IMAGE",
    "SENTINEL_DB_PATH",
    "SENTINEL_PORT",
];

/// A command running in `dir` with no environment overrides leaking in.
fn sentinel(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("code-sentinel");
    cmd.current_dir(dir.path());
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join("sentinel.toml"), content).unwrap();
}

/// Seed a database with one pending job, returning its id.
fn seed_job(dir: &TempDir) -> i64 {
    let db_dir = dir.path().join(".sentinel");
    fs::create_dir_all(&db_dir).unwrap();
    let db = SentinelDb::new(&db_dir.join("sentinel.db")).unwrap();
    let user = db.upsert_user("cli-test").unwrap();
    let repo = db
        .upsert_repository(user.id, "acme", "shop", "https://github.com/acme/shop")
        .unwrap();
    db.create_job(user.id, repo.id, "checkout accepts negative quantities")
        .unwrap()
        .id
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("compare"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_requires_arguments() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir).arg("run").assert().failure();
    }
}

mod config_command {
    use super::*;

    #[test]
    fn test_check_defaults_are_valid() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir)
            .args(["config", "check"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_check_reports_problems() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            r#"
[agent]
max_turns = 0

[provisioning]
cluster_uri = "mongodb+srv://user:pw@cluster.example.net/"
"#,
        );
        sentinel(&dir)
            .args(["config", "check"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("agent.max_turns"))
            .stdout(predicate::str::contains("{db_name}"));
    }

    #[test]
    fn test_env_override_is_validated() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir)
            .env("MONGO_URI", "mongodb://localhost:27017/fixed")
            .args(["config", "check"])
            .assert()
            .failure();
    }

    #[test]
    fn test_show_masks_secrets() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir)
            .env("AI_PIPE_KEY", "sk-very-secret")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("code-sentinel-dev"))
            .stdout(predicate::str::contains("sk-very-secret").not());
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "[agent\nmax_turns = ");
        sentinel(&dir)
            .args(["config", "check"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("sentinel.toml"));
    }
}

mod job_commands {
    use super::*;

    #[test]
    fn test_list_without_database() {
        let dir = TempDir::new().unwrap();
        sentinel(&dir)
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No database"));
    }

    #[test]
    fn test_list_and_status() {
        let dir = TempDir::new().unwrap();
        let id = seed_job(&dir);

        sentinel(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("PENDING"))
            .stdout(predicate::str::contains("negative quantities"));

        sentinel(&dir)
            .args(["status", &id.to_string(), "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"PENDING\""));
    }

    #[test]
    fn test_cancel_twice() {
        let dir = TempDir::new().unwrap();
        let id = seed_job(&dir);

        sentinel(&dir)
            .args(["cancel", &id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("canceled"));

        sentinel(&dir)
            .args(["cancel", &id.to_string()])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not running"));

        sentinel(&dir)
            .args(["list", "--status", "FAILED"])
            .assert()
            .success()
            .stdout(predicate::str::contains("FAILED"));
    }

    #[test]
    fn test_status_unknown_job() {
        let dir = TempDir::new().unwrap();
        seed_job(&dir);
        sentinel(&dir)
            .args(["status", "999"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}
