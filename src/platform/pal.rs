//! Host abstraction: command execution with deadlines and host facts.

#![allow(missing_docs)]

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use thiserror::Error;

use crate::core::errors::{DvsError, Result};
use crate::platform::env::Environment;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: None,
            stdin: None,
        }
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Rendered command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr; some tools print versions on stderr.
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    /// Last non-empty stderr line, for compact failure reasons.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }
}

/// Why a command could not produce an output.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("IO failure while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Command execution surface used by probes, fetchers and cleanup.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
        env: &Environment,
    ) -> std::result::Result<CommandOutput, RunError>;
}

/// Runs real processes with a clean environment taken from `Environment`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        invocation: &Invocation,
        env: &Environment,
    ) -> std::result::Result<CommandOutput, RunError> {
        let program = env
            .which(&invocation.program)
            .unwrap_or_else(|| PathBuf::from(&invocation.program));

        let mut cmd = Command::new(&program);
        cmd.args(&invocation.args)
            .env_clear()
            .envs(env.iter())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
            // A child that exits without reading stdin closes the pipe; that
            // is not an error for us.
            let _ = stdin.write_all(input.as_bytes());
        }

        let deadline = invocation.timeout.map(|t| Instant::now() + t);
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let code = wait_with_deadline(&mut child, invocation, deadline)?;

        // Background processes started by the child may keep the pipes open
        // after it exits; the readers are left detached once the deadline
        // passes.
        let stdout = collect_output(&stdout_reader, invocation, deadline)?;
        let stderr = collect_output(&stderr_reader, invocation, deadline)?;

        Ok(CommandOutput {
            code,
            stdout,
            stderr,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut r) = source {
            let _ = r.read_to_end(&mut buf);
        }
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}

fn collect_output(
    reader: &Receiver<String>,
    invocation: &Invocation,
    deadline: Option<Instant>,
) -> std::result::Result<String, RunError> {
    let Some(deadline) = deadline else {
        return Ok(reader.recv().unwrap_or_default());
    };
    match reader.recv_deadline(deadline) {
        Ok(text) => Ok(text),
        Err(RecvTimeoutError::Disconnected) => Ok(String::new()),
        Err(RecvTimeoutError::Timeout) => Err(RunError::Timeout {
            program: invocation.program.clone(),
            after: invocation.timeout.unwrap_or_default(),
        }),
    }
}

fn wait_with_deadline(
    child: &mut Child,
    invocation: &Invocation,
    deadline: Option<Instant>,
) -> std::result::Result<Option<i32>, RunError> {
    let io_err = |source| RunError::Io {
        program: invocation.program.clone(),
        source,
    };

    let Some(deadline) = deadline else {
        return child.wait().map(|s| s.code()).map_err(io_err);
    };

    loop {
        if let Some(status) = child.try_wait().map_err(io_err)? {
            return Ok(status.code());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Timeout {
                program: invocation.program.clone(),
                after: invocation.timeout.unwrap_or_default(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

// ──────────────────── host facts ────────────────────

/// Facts about the host used to render download URLs and apt sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostFacts {
    /// Debian architecture name (`amd64`, `arm64`, ...).
    pub arch: String,
    /// `ID` from os-release (`debian`, `ubuntu`, ...).
    pub distro: String,
    /// `ID_LIKE` entries.
    pub id_like: Vec<String>,
    /// Release codename (`bookworm`, `noble`, ...).
    pub codename: String,
}

impl HostFacts {
    /// Read `/etc/os-release` and the compile-time architecture.
    pub fn detect() -> Result<Self> {
        Self::detect_from(Path::new("/etc/os-release"))
    }

    pub fn detect_from(os_release: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(os_release).map_err(|e| DvsError::io(os_release, e))?;
        Ok(Self::from_os_release(
            &contents,
            debian_arch(std::env::consts::ARCH),
        ))
    }

    /// Parse os-release contents. Unknown keys are ignored; quoting is
    /// stripped.
    #[must_use]
    pub fn from_os_release(contents: &str, arch: &str) -> Self {
        let mut distro = String::new();
        let mut id_like = Vec::new();
        let mut codename = String::new();
        let mut ubuntu_codename = String::new();

        for line in contents.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key {
                "ID" => distro = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    id_like = value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect();
                }
                "VERSION_CODENAME" => codename = value.to_string(),
                "UBUNTU_CODENAME" => ubuntu_codename = value.to_string(),
                _ => {}
            }
        }

        // Ubuntu derivatives (Mint, Pop!_OS) carry their own codename but
        // use Ubuntu's repositories.
        if !ubuntu_codename.is_empty() && distro != "ubuntu" && distro != "debian" {
            codename = ubuntu_codename;
            distro = "ubuntu".to_string();
        }

        Self {
            arch: arch.to_string(),
            distro,
            id_like,
            codename,
        }
    }

    #[must_use]
    pub fn is_debian_family(&self) -> bool {
        self.distro == "debian"
            || self.distro == "ubuntu"
            || self.id_like.iter().any(|l| l == "debian" || l == "ubuntu")
    }

    /// Facts for hosts where detection is skipped.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            arch: debian_arch(std::env::consts::ARCH).to_string(),
            distro: "debian".to_string(),
            id_like: Vec::new(),
            codename: "bookworm".to_string(),
        }
    }
}

/// Map a Rust target architecture onto Debian's naming.
#[must_use]
pub fn debian_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "x86" => "i386",
        other => other,
    }
}

/// Whether the current process runs with root privileges.
#[cfg(unix)]
#[must_use]
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
#[must_use]
pub fn is_root() -> bool {
    false
}
