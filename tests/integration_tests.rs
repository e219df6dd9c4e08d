//! Integration tests for the `studio` binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A `studio` command isolated from the caller's environment.
fn studio(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("studio");
    cmd.current_dir(dir.path())
        .env_remove("SANDBOX_API_KEY")
        .env_remove("SANDBOX_API_URL")
        .env_remove("SANDBOX_WEBHOOK_SECRET")
        .env_remove("SANDBOX_PROVIDER")
        .env_remove("STUDIO_DB_PATH")
        .env_remove("RUST_LOG");
    cmd
}

fn write_replay(dir: &TempDir) -> std::path::PathBuf {
    let replay = serde_json::json!({
        "planner": [r#"{"goal": "counter", "tasks": [{"title": "Counter page", "files": ["app/page.tsx"]}]}"#],
        "coder": [concat!(
            r#"{"tool_calls": [{"tool": "createOrUpdateFiles", "files": [{"path": "app/page.tsx", "content": "export default function Page() { return null }"}]}]}"#,
            "\n<task_summary>Built a counter page.</task_summary>"
        )],
        "reviewer": [r#"{"verdict": "approved"}"#],
    });
    let path = dir.path().join("replay.json");
    fs::write(&path, replay.to_string()).unwrap();
    path
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        studio(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_log_format_rejected() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["--log-format", "xml", "config", "show"])
            .assert()
            .failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_creates_file_once() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created studio.toml"));
        assert!(dir.path().join(".studio/studio.toml").exists());

        studio(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_warns_about_missing_provider_settings() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("sandbox.api_url"));
    }

    #[test]
    fn test_config_show_reflects_file_values() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".studio")).unwrap();
        fs::write(
            dir.path().join(".studio/studio.toml"),
            "[agent]\nmodel = \"my-model\"\n",
        )
        .unwrap();
        studio(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("my-model"))
            .stdout(predicate::str::contains("SANDBOX_API_KEY = not set"));
    }
}

mod ledger_and_sandbox {
    use super::*;

    #[test]
    fn test_actions_empty_project() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["actions", "--project", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No actions recorded"));
    }

    #[test]
    fn test_sandbox_status_untracked() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["sandbox", "status", "--project", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sandbox tracked"));
    }

    #[test]
    fn test_sandbox_wake_requires_provider_credentials() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .args(["sandbox", "wake", "--project", "p1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("api_url"));
    }
}

mod workflow_runs {
    use super::*;

    #[test]
    fn test_run_with_replay_saves_fragment_and_ledger() {
        let dir = TempDir::new().unwrap();
        let replay = write_replay(&dir);

        studio(&dir)
            .env("SANDBOX_PROVIDER", "local")
            .args(["run", "--project", "p1", "--message", "add a counter", "--replay"])
            .arg(&replay)
            .assert()
            .success()
            .stdout(predicate::str::contains("Built a counter page."))
            .stdout(predicate::str::contains("fragment:"));

        studio(&dir)
            .args(["actions", "--project", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("SAVE_RESULT"))
            .stdout(predicate::str::contains("WRITE_FILES"));

        studio(&dir)
            .args(["sandbox", "status", "--project", "p1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("RUNNING"));
    }

    #[test]
    fn test_run_rejects_empty_message() {
        let dir = TempDir::new().unwrap();
        studio(&dir)
            .env("SANDBOX_PROVIDER", "local")
            .args(["run", "--project", "p1", "--message", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("must not be empty"));
    }
}
