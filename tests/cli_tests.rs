//! CLI smoke tests against the built binary with a sandboxed `$HOME`.

mod common;

use std::fs;

use tempfile::TempDir;

#[test]
fn help_command_prints_usage() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case("help_command_prints_usage", home.path(), &["--help"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());
    for subcmd in ["provision", "status", "plan", "clean", "config", "completions"] {
        assert!(
            result.stdout.contains(subcmd),
            "help is missing {subcmd}; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn version_command_prints_version() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case("version_command_prints_version", home.path(), &["--version"]);
    assert!(result.status.success());
    assert!(result.stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn plan_json_lists_foundation_first() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case("plan_json", home.path(), &["plan", "--json"]);
    assert!(result.status.success(), "log: {}", result.log_path.display());

    let payload = result.json();
    assert_eq!(payload["command"], "plan");
    let tiers = payload["tiers"].as_array().unwrap();
    assert!(!tiers.is_empty());
    let position = |name: &str| {
        tiers
            .iter()
            .position(|t| t.as_array().unwrap().iter().any(|n| n == name))
    };
    let go = position("go").expect("go is planned");
    let gopls = position("gopls").expect("gopls is planned");
    assert!(go < gopls);
}

#[test]
fn plan_only_pulls_in_dependencies() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case(
        "plan_only",
        home.path(),
        &["plan", "--only", "gopls", "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let names: Vec<String> = result.json()["tiers"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|t| t.as_array().unwrap().clone())
        .filter_map(|n| n.as_str().map(str::to_string))
        .collect();
    assert_eq!(names, ["base-packages", "go", "gopls"]);
}

#[test]
fn unknown_only_component_is_a_user_error() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case(
        "unknown_only",
        home.path(),
        &["plan", "--only", "no-such-tool"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("devstation:"));
}

#[test]
fn config_path_and_validate_use_defaults() {
    let home = TempDir::new().unwrap();
    let path = common::run_cli_case("config_path", home.path(), &["config", "path", "--json"]);
    assert!(path.status.success());
    let payload = path.json();
    assert_eq!(payload["exists"], false);
    assert!(
        payload["path"]
            .as_str()
            .unwrap()
            .ends_with(".config/devstation/config.toml")
    );

    let validate = common::run_cli_case(
        "config_validate",
        home.path(),
        &["config", "validate", "--json"],
    );
    assert!(validate.status.success(), "log: {}", validate.log_path.display());
    assert_eq!(validate.json()["valid"], true);
}

#[test]
fn invalid_config_exits_with_user_error() {
    let home = TempDir::new().unwrap();
    let config = home.path().join("bad.toml");
    fs::write(&config, "[run]\njobs = 0\n").unwrap();
    let result = common::run_cli_case(
        "invalid_config",
        home.path(),
        &["--config", config.to_str().unwrap(), "config", "validate", "--json"],
    );
    assert_eq!(result.code(), Some(1), "log: {}", result.log_path.display());
    assert_eq!(result.json()["valid"], false);
}

#[test]
fn missing_explicit_config_is_a_user_error() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case(
        "missing_config",
        home.path(),
        &["--config", "/nonexistent/devstation.toml", "plan"],
    );
    assert_eq!(result.code(), Some(1));
    assert!(result.stderr.contains("DVS-1002"));
}

#[test]
fn status_json_reports_every_component() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case(
        "status_json",
        home.path(),
        &["status", "--only", "go", "--json"],
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["command"], "status");
    let rows = payload["components"].as_array().unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
    assert_eq!(names, ["base-packages", "go"]);
    let go = &rows[1];
    assert_eq!(go["required"], true);
    assert!(go["health"]["health"].is_string());
    assert_eq!(go["profile_block"], false);
}

#[test]
fn provision_dry_run_touches_nothing() {
    let home = TempDir::new().unwrap();
    let profile = home.path().join(".bashrc");
    fs::write(&profile, "alias ll='ls -l'\n").unwrap();

    let result = common::run_cli_case(
        "provision_dry_run",
        home.path(),
        &["provision", "--dry-run", "--skip-host-check", "--only", "go", "--json"],
    );
    assert_eq!(result.code(), Some(0), "log: {}", result.log_path.display());

    let payload = result.json();
    assert_eq!(payload["command"], "provision");
    assert_eq!(payload["success"], true);
    assert_eq!(payload["summary"]["dry_run"], true);
    assert_eq!(fs::read_to_string(&profile).unwrap(), "alias ll='ls -l'\n");
    assert!(home.path().join("activity.jsonl").exists());
}

#[test]
fn clean_rejects_unknown_component() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case("clean_unknown", home.path(), &["clean", "no-such-tool"]);
    assert_eq!(result.code(), Some(1));
}

#[test]
fn completions_emit_a_script() {
    let home = TempDir::new().unwrap();
    let result = common::run_cli_case("completions_bash", home.path(), &["completions", "bash"]);
    assert!(result.status.success());
    assert!(result.stdout.contains("devstation"));
}
