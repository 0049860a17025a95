//! End-to-end provisioning scenarios against a sandboxed `$HOME`.
//!
//! Real processes run through `SystemRunner`; only acquisition is faked,
//! by a fetcher that stages shell scripts where downloads would land.

mod common;

use std::fs;
use std::time::Duration;

use common::{ScriptFetcher, go_component, go_script, host, sandbox_env, tool, write_executable};
use devstation::installer::InstallOutcome;
use devstation::logger::ActivityLog;
use devstation::orchestrator::{ComponentState, Orchestrator, RunOptions, RunSummary};
use devstation::platform::env::Environment;
use devstation::platform::pal::{HostFacts, SystemRunner};
use devstation::profile::ProfileMutator;
use devstation::registry::{Component, Registry};
use serde_json::Value;
use tempfile::TempDir;

struct Sandbox {
    home: TempDir,
    registry: Registry,
    host: HostFacts,
}

impl Sandbox {
    fn new(components: Vec<Component>) -> Self {
        Self {
            home: TempDir::new().unwrap(),
            registry: Registry::new(components).unwrap(),
            host: host(),
        }
    }

    fn profile(&self) -> ProfileMutator {
        ProfileMutator::new(self.home.path().join(".bashrc"))
    }

    fn profile_text(&self) -> String {
        fs::read_to_string(self.home.path().join(".bashrc")).unwrap_or_default()
    }

    fn env(&self) -> Environment {
        sandbox_env(self.home.path())
    }

    fn options(&self, jobs: usize) -> RunOptions {
        RunOptions {
            jobs,
            fetch_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            ..RunOptions::default()
        }
    }

    fn run(&self, fetcher: &ScriptFetcher, env: Environment) -> RunSummary {
        self.run_with(fetcher, self.options(4), env)
    }

    fn run_with(&self, fetcher: &ScriptFetcher, options: RunOptions, env: Environment) -> RunSummary {
        Orchestrator::new(&self.registry, &self.host, &SystemRunner, fetcher)
            .with_options(options)
            .run(self.profile(), env)
            .unwrap()
    }
}

#[test]
fn stale_go_toolchain_is_replaced_and_configured() {
    let sandbox = Sandbox::new(vec![go_component("1.24")]);
    let home = sandbox.home.path();

    // An older toolchain, a leftover legacy install, a build cache and an
    // unmanaged PATH line from a previous installer.
    write_executable(&home.join(".local/go/bin/go"), &go_script("1.21.5"));
    fs::create_dir_all(home.join("legacy-go/bin")).unwrap();
    fs::create_dir_all(home.join(".cache/go-build/00")).unwrap();
    fs::write(
        home.join(".bashrc"),
        "alias ll='ls -l'\nexport PATH=$PATH:/usr/local/go/bin\n",
    )
    .unwrap();
    let mut env = sandbox.env();
    env.set("GOROOT", "/usr/local/go");

    let fetcher = ScriptFetcher::new().with_version("go", "1.24.0");
    let summary = sandbox.run(&fetcher, env);

    assert!(summary.success(), "{summary:?}");
    let go = summary.get("go").unwrap();
    assert_eq!(go.state, ComponentState::Satisfied);
    assert_eq!(
        go.outcome,
        InstallOutcome::Installed {
            version: "1.24.0".into()
        }
    );
    assert_eq!(go.attempts, 1);

    assert!(!home.join("legacy-go").exists());
    assert!(!home.join(".cache/go-build").exists());

    let profile = sandbox.profile_text();
    assert!(profile.starts_with("alias ll='ls -l'\n"));
    assert!(!profile.contains("/usr/local/go/bin"));
    assert_eq!(profile.matches("# >>> devstation:go >>>").count(), 1);
    let block = sandbox.profile().block("go").unwrap().unwrap();
    assert_eq!(block.content.lines().count(), 4);
    assert!(block.content.contains("export GOROOT=\"$HOME/.local/go\""));
    assert!(block.content.contains("export GOPATH=\"$HOME/go\""));
    assert!(block.content.contains("$HOME/.local/go/bin"));
    assert!(block.content.contains("$HOME/go/bin"));

    // A fresh shell that sources the profile sees a healthy toolchain and
    // nothing is fetched or rewritten.
    let second = sandbox.run(&fetcher, sandbox.env());
    assert!(second.success());
    assert_eq!(
        second.get("go").unwrap().outcome,
        InstallOutcome::AlreadySatisfied {
            version: "1.24.0".into()
        }
    );
    assert_eq!(fetcher.calls(), ["go"]);
    assert_eq!(sandbox.profile_text(), profile);
}

#[test]
fn repeated_runs_converge_to_identical_profile() {
    let sandbox = Sandbox::new(vec![
        go_component("1.24"),
        tool("gopls", &["go"]),
        tool("kubectl", &[]),
        tool("helm", &["kubectl"]),
    ]);
    let fetcher = ScriptFetcher::new().with_version("go", "1.24.0");

    let first = sandbox.run(&fetcher, sandbox.env());
    assert!(first.success());
    assert_eq!(first.counts().installed, 4);
    let after_first = sandbox.profile_text();

    for _ in 0..2 {
        let again = sandbox.run(&fetcher, sandbox.env());
        assert_eq!(again.counts().already_satisfied, 4);
        assert_eq!(sandbox.profile_text(), after_first);
    }
    assert_eq!(fetcher.calls().len(), 4);
}

#[test]
fn failed_foundation_skips_dependents_but_not_siblings() {
    let sandbox = Sandbox::new(vec![
        go_component("1.24"),
        tool("gopls", &["go"]),
        tool("jq", &[]),
    ]);
    let fetcher = ScriptFetcher::new().with_broken("go");

    let summary = sandbox.run(&fetcher, sandbox.env());

    assert!(!summary.success());
    assert_eq!(summary.get("go").unwrap().state, ComponentState::Failed);
    let gopls = summary.get("gopls").unwrap();
    assert_eq!(gopls.state, ComponentState::SkippedDependency);
    assert_eq!(
        gopls.outcome,
        InstallOutcome::skipped("dependency unsatisfied: go")
    );
    assert_eq!(summary.get("jq").unwrap().state, ComponentState::Satisfied);
    assert!(!fetcher.calls().contains(&"gopls".to_string()));
    assert_eq!(
        summary
            .unsatisfied_required()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>(),
        ["go"]
    );
}

#[test]
fn fetch_timeout_fails_only_that_component() {
    let sandbox = Sandbox::new(vec![go_component("1.24"), tool("helm", &[])]);
    let fetcher = ScriptFetcher::new()
        .with_version("go", "1.24.0")
        .with_slow("helm");
    let options = RunOptions {
        fetch_timeout: Duration::from_secs(3),
        ..sandbox.options(2)
    };

    let summary = sandbox.run_with(&fetcher, options, sandbox.env());

    assert!(summary.success());
    let helm = summary.get("helm").unwrap();
    assert_eq!(helm.state, ComponentState::Failed);
    assert_eq!(helm.outcome, InstallOutcome::failed("timeout after 3s"));
    assert_eq!(helm.attempts, 1);
    assert!(sandbox.profile().block("helm").unwrap().is_none());
}

#[test]
fn concurrent_and_sequential_runs_write_the_same_blocks() {
    let components = || {
        vec![
            go_component("1.24"),
            tool("gopls", &["go"]),
            tool("kubectl", &[]),
            tool("helm", &[]),
            tool("k9s", &[]),
            tool("jq", &[]),
        ]
    };
    let fetcher = || ScriptFetcher::new().with_version("go", "1.24.0");

    let sequential = Sandbox::new(components());
    let seq_summary = sequential.run_with(&fetcher(), sequential.options(1), sequential.env());
    let concurrent = Sandbox::new(components());
    let par_summary = concurrent.run_with(&fetcher(), concurrent.options(4), concurrent.env());

    assert!(seq_summary.success() && par_summary.success());
    let names = |s: &RunSummary| s.components.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&seq_summary), names(&par_summary));

    let sorted_blocks = |s: &Sandbox| {
        let mut blocks = s.profile().blocks().unwrap();
        blocks.sort_by(|a, b| a.name.cmp(&b.name));
        blocks
    };
    assert_eq!(sorted_blocks(&sequential), sorted_blocks(&concurrent));
    assert_eq!(sorted_blocks(&concurrent).len(), 6);
}

#[test]
fn activity_log_records_the_run() {
    let sandbox = Sandbox::new(vec![go_component("1.24"), tool("gopls", &["go"])]);
    let log_path = sandbox.home.path().join("activity.jsonl");
    let fetcher = ScriptFetcher::new().with_version("go", "1.24.0");

    {
        let log = ActivityLog::open(&log_path);
        let summary = Orchestrator::new(&sandbox.registry, &sandbox.host, &SystemRunner, &fetcher)
            .with_options(sandbox.options(2))
            .with_log(&log)
            .run(sandbox.profile(), sandbox.env())
            .unwrap();
        assert!(summary.success());
    }

    let entries: Vec<Value> = fs::read_to_string(&log_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let events: Vec<&str> = entries.iter().filter_map(|e| e["event"].as_str()).collect();
    assert_eq!(events.first(), Some(&"run_start"));
    assert_eq!(events.last(), Some(&"run_complete"));

    let installs: Vec<&str> = entries
        .iter()
        .filter(|e| e["event"] == "install_complete")
        .filter_map(|e| e["component"].as_str())
        .collect();
    assert_eq!(installs, ["go", "gopls"]);
    assert!(
        entries
            .iter()
            .any(|e| e["event"] == "profile_update" && e["component"] == "go")
    );
    assert!(entries.iter().all(|e| e["ts"].is_string()));
}
