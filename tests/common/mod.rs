#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use devstation::installer::{FetchError, FetchReceipt, FetchRequest, Fetcher};
use devstation::platform::env::Environment;
use devstation::platform::pal::HostFacts;
use devstation::registry::{
    AmbientRoot, ArchiveFormat, ArchiveSpec, CleanupSpec, Component, InstallMethod, ProbeSpec,
    ProfileExport, SmokeTest, VersionSpec,
};

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// First stdout line parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().next().unwrap_or_default();
        serde_json::from_str(line).unwrap_or_else(|e| {
            panic!(
                "stdout is not JSON ({e}); log: {}\n{}",
                self.log_path.display(),
                self.stdout
            )
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_devstation") {
        return PathBuf::from(path);
    }

    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join("devstation"));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve devstation binary path for integration test"),
    }
}

/// Run the binary with `home` as `$HOME`, so config, profile and activity
/// log all land in the sandbox.
pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("devstation-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", home)
        .env("DEVSTATION_ACTIVITY_LOG", home.join("activity.jsonl"))
        .env_remove("DEVSTATION_OUTPUT_FORMAT")
        .env_remove("DEVSTATION_PROFILE_PATH")
        .env("RUST_BACKTRACE", "1")
        .output()
        .expect("execute devstation command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── library fixtures ────────────────────

pub fn host() -> HostFacts {
    HostFacts {
        arch: "amd64".to_string(),
        distro: "debian".to_string(),
        id_like: Vec::new(),
        codename: "bookworm".to_string(),
    }
}

/// `HOME` pointing at the sandbox and a minimal system `PATH`.
pub fn sandbox_env(home: &Path) -> Environment {
    Environment::from_pairs([
        ("HOME".to_string(), home.to_string_lossy().into_owned()),
        ("PATH".to_string(), "/usr/bin:/bin".to_string()),
    ])
}

pub fn write_executable(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Shell script printing `<name> <version>`.
pub fn version_script(name: &str, version: &str) -> String {
    format!("#!/bin/sh\necho \"{name} {version}\"\n")
}

/// A Go toolchain stand-in: `go version` and `go run` both work.
pub fn go_script(version: &str) -> String {
    format!(
        "#!/bin/sh\ncase \"$1\" in\n  version) echo \"go version go{version} linux/amd64\" ;;\n  run) cat \"$2\" >/dev/null && echo \"hello from go\" ;;\n  *) exit 2 ;;\nesac\n"
    )
}

/// Single-binary tool under `$HOME/tools/<name>`, exporting its directory
/// on `PATH` and a `<NAME>_HOME` variable.
pub fn tool(name: &str, deps: &[&str]) -> Component {
    Component {
        name: name.to_string(),
        description: format!("{name} test tool"),
        required: false,
        enabled: true,
        version: VersionSpec::Exact("1.0.0".to_string()),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            url: format!("https://example.invalid/{name}/{{version}}"),
            latest_url: None,
            latest_pattern: None,
            format: ArchiveFormat::Binary,
            archive_root: None,
            install_root: format!("$HOME/tools/{name}/{name}"),
            sha256: None,
        }),
        depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        exports: vec![
            ProfileExport::PrependPath(format!("$HOME/tools/{name}")),
            ProfileExport::set(
                &format!("{}_HOME", name.to_ascii_uppercase().replace('-', "_")),
                &format!("$HOME/tools/{name}"),
            ),
        ],
        owned_paths: Vec::new(),
        probe: ProbeSpec {
            locate: None,
            command: vec![name.to_string()],
            version_pattern: format!(r"{name} (\S+)"),
            smoke: None,
            ambient_root: None,
        },
        cleanup: CleanupSpec::default(),
    }
}

/// Required Go toolchain at `$HOME/.local/go` with four exports and a
/// compile-and-run smoke test.
pub fn go_component(pin: &str) -> Component {
    Component {
        name: "go".to_string(),
        description: "Go toolchain".to_string(),
        required: true,
        enabled: true,
        version: VersionSpec::parse(pin),
        method: InstallMethod::DownloadArchive(ArchiveSpec {
            url: "https://example.invalid/go{version}.linux-{arch}.tar.gz".to_string(),
            latest_url: None,
            latest_pattern: None,
            format: ArchiveFormat::TarGz,
            archive_root: Some("go".to_string()),
            install_root: "$HOME/.local/go".to_string(),
            sha256: None,
        }),
        depends_on: Vec::new(),
        exports: vec![
            ProfileExport::set("GOROOT", "$HOME/.local/go"),
            ProfileExport::set("GOPATH", "$HOME/go"),
            ProfileExport::PrependPath("$HOME/.local/go/bin".to_string()),
            ProfileExport::PrependPath("$HOME/go/bin".to_string()),
        ],
        owned_paths: Vec::new(),
        probe: ProbeSpec {
            locate: Some("$HOME/.local/go/bin/go".to_string()),
            command: vec!["$HOME/.local/go/bin/go".to_string(), "version".to_string()],
            version_pattern: r"go version go(\S+)".to_string(),
            smoke: Some(SmokeTest {
                files: vec![(
                    "main.go".to_string(),
                    "package main\n\nfunc main() { println(\"hello from go\") }\n".to_string(),
                )],
                command: vec!["go".to_string(), "run".to_string(), "main.go".to_string()],
                expect_stdout: Some("hello from go".to_string()),
            }),
            ambient_root: Some(AmbientRoot {
                var: "GOROOT".to_string(),
                expected: "$HOME/.local/go".to_string(),
            }),
        },
        cleanup: CleanupSpec {
            legacy_paths: vec!["$HOME/legacy-go".to_string()],
            package_patterns: Vec::new(),
            cache_paths: vec!["$HOME/.cache/go-build".to_string()],
            legacy_profile_lines: vec!["/usr/local/go/bin".to_string()],
        },
    }
}

/// Drops shell scripts where the installer expects payloads.
#[derive(Default)]
pub struct ScriptFetcher {
    /// Version to stage per component; the pin when absent.
    pub versions: HashMap<String, String>,
    /// Components whose fetch fails outright.
    pub broken: HashSet<String>,
    /// Components whose fetch runs out of time.
    pub slow: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, name: &str, version: &str) -> Self {
        self.versions.insert(name.to_string(), version.to_string());
        self
    }

    pub fn with_broken(mut self, name: &str) -> Self {
        self.broken.insert(name.to_string());
        self
    }

    pub fn with_slow(mut self, name: &str) -> Self {
        self.slow.insert(name.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for ScriptFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchReceipt, FetchError> {
        let name = &request.component.name;
        self.calls.lock().unwrap().push(name.clone());
        if self.slow.contains(name) {
            return Err(FetchError::Timeout {
                after: request.timeout,
            });
        }
        if self.broken.contains(name) {
            return Err(FetchError::Command {
                command: "curl".into(),
                detail: "exit code 22".into(),
            });
        }
        let version = self
            .versions
            .get(name)
            .cloned()
            .unwrap_or_else(|| request.ctx.version.clone());
        let staging = request.staging.expect("archive components stage");

        let payload = if name == "go" {
            let root = staging.join("go");
            write_executable(&root.join("bin").join("go"), &go_script(&version));
            root
        } else {
            let file = staging.join("download");
            write_executable(&file, &version_script(name, &version));
            file
        };
        Ok(FetchReceipt {
            version,
            payload: Some(payload),
        })
    }
}
