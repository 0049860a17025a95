//! JSONL activity log: one self-contained JSON object per line.
//!
//! Lines are built in memory and handed to a single `write_all`, so a tail
//! never sees half a record. Writing degrades instead of failing:
//!
//! 1. primary path
//! 2. fallback path (defaults to the temp dir)
//! 3. stderr, prefixed `[DVS-JSONL]`
//! 4. discard

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{DvsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Provisioning events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStart,
    Probe,
    StateChange,
    CleanupStep,
    ProfileUpdate,
    InstallComplete,
    InstallFailed,
    DependencySkip,
    RunComplete,
}

/// One log line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 UTC timestamp with milliseconds.
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    /// Component state after a transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// New entry stamped with the current UTC time.
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            severity,
            component: None,
            state: None,
            version: None,
            path: None,
            duration_ms: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.component = Some(name.into());
        self
    }

    #[must_use]
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn path(mut self, path: &Path) -> Self {
        self.path = Some(path.display().to_string());
        self
    }

    #[must_use]
    pub fn duration(mut self, elapsed: Duration) -> Self {
        self.duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub const fn ok(mut self, ok: bool) -> Self {
        self.ok = Some(ok);
        self
    }

    /// Record a failure: code, message and `ok = false`.
    #[must_use]
    pub fn error(mut self, error: &DvsError) -> Self {
        self.error_code = Some(error.code().to_string());
        self.error_message = Some(error.to_string());
        self.ok = Some(false);
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Primary,
    Fallback,
    Stderr,
    Discard,
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    /// Rotated generations kept (`.1` newest).
    pub max_rotated_files: u32,
    /// Minimum time between forced `sync_data` calls.
    pub fsync_interval: Duration,
}

impl JsonlConfig {
    /// Defaults for a primary path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("devstation-activity.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
            fsync_interval: Duration::from_secs(5),
        }
    }
}

/// Append-only writer with rotation and the degradation chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    file: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    last_sync: Instant,
}

impl JsonlWriter {
    /// Open the primary path, degrading as far as needed.
    pub fn open(config: JsonlConfig) -> Self {
        let mut writer = Self {
            config,
            file: None,
            state: WriterState::Discard,
            bytes_written: 0,
            last_sync: Instant::now(),
        };
        match open_append(&writer.config.path) {
            Ok((file, size)) => writer.attach(file, size, WriterState::Primary),
            Err(_) => writer.open_fallback(),
        }
        writer
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_string(entry) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[DVS-JSONL] serialize error: {e}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
        }
    }

    /// Flush and `sync_data` the current file.
    pub fn sync(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
            let _ = f.get_ref().sync_data();
        }
        self.last_sync = Instant::now();
    }

    /// `primary`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        match self.state {
            WriterState::Primary => "primary",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Where lines currently go, when that is a file.
    pub fn current_path(&self) -> Option<&Path> {
        match self.state {
            WriterState::Primary => Some(&self.config.path),
            WriterState::Fallback => self.config.fallback_path.as_deref(),
            WriterState::Stderr | WriterState::Discard => None,
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn attach(&mut self, file: File, size: u64, state: WriterState) {
        self.file = Some(BufWriter::with_capacity(16 * 1024, file));
        self.bytes_written = size;
        self.state = state;
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if self.file.is_some() && self.bytes_written > 0 && self.bytes_written + len > self.config.max_size_bytes {
            self.rotate();
        }
        match self.state {
            WriterState::Primary | WriterState::Fallback => {
                let written = self
                    .file
                    .as_mut()
                    .is_some_and(|f| f.write_all(line.as_bytes()).is_ok());
                if !written {
                    self.degrade();
                    self.write_line(line);
                    return;
                }
                self.bytes_written += len;
                if self.last_sync.elapsed() >= self.config.fsync_interval {
                    self.sync();
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[DVS-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn open_fallback(&mut self) {
        let Some(fallback) = self.config.fallback_path.clone() else {
            let _ = writeln!(
                io::stderr(),
                "[DVS-JSONL] activity log unavailable and no fallback configured, using stderr"
            );
            self.state = WriterState::Stderr;
            return;
        };
        if let Ok((file, size)) = open_append(&fallback) {
            let _ = writeln!(
                io::stderr(),
                "[DVS-JSONL] activity log unavailable, using fallback {}",
                fallback.display()
            );
            self.attach(file, size, WriterState::Fallback);
        } else {
            let _ = writeln!(
                io::stderr(),
                "[DVS-JSONL] activity log and fallback unavailable, using stderr"
            );
            self.state = WriterState::Stderr;
        }
    }

    fn degrade(&mut self) {
        self.file = None;
        self.state = match self.state {
            WriterState::Primary => {
                self.open_fallback();
                return;
            }
            WriterState::Fallback => {
                let _ = writeln!(io::stderr(), "[DVS-JSONL] fallback write failed, using stderr");
                WriterState::Stderr
            }
            WriterState::Stderr | WriterState::Discard => WriterState::Discard,
        };
    }

    /// `log.jsonl` → `log.jsonl.1`, shifting older generations up and
    /// dropping the oldest.
    fn rotate(&mut self) {
        let Some(base) = self.current_path().map(Path::to_path_buf) else {
            return;
        };
        self.flush();
        self.file = None;

        let keep = self.config.max_rotated_files.max(1);
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = fs::rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = fs::rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                let state = self.state;
                self.attach(file, 0, state);
            }
            Err(_) => self.degrade(),
        }
    }
}

// ──────────────────────── helpers ────────────────────────

/// Open or create for appending; returns the file and its current size.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| DvsError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| DvsError::io(path, source))?;
    let size = file.metadata().map_or(0, |m| m.len());
    Ok((file, size))
}

fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
