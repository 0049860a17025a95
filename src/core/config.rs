//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{DvsError, Result};
use crate::core::paths::{expand_tilde, home_dir};
use crate::registry::Registry;

/// Full devstation configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub run: RunConfig,
    pub profile: ProfileConfig,
    pub paths: PathsConfig,
    /// Per-component overlays keyed by catalog name.
    pub components: BTreeMap<String, ComponentOverride>,
}

/// Orchestrator knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound on concurrently installing optional components.
    pub jobs: usize,
    pub fetch_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub dry_run: bool,
}

/// Which shell profile is managed and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProfileConfig {
    pub path: PathBuf,
    /// Take a timestamped copy before the first mutation of a run.
    pub backup: bool,
}

/// Filesystem paths used by devstation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
    /// Where downloads are staged. Unset means next to each install root.
    pub staging_dir: Option<PathBuf>,
}

/// `[components.<name>]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentOverride {
    /// Version pin, or `"latest"`.
    pub version: Option<String>,
    pub enabled: Option<bool>,
    /// Expected SHA-256 of the download for the pinned version.
    pub sha256: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: 4,
            fetch_timeout_secs: 600,
            probe_timeout_secs: 30,
            dry_run: false,
        }
    }
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            path: fallback_home().join(".bashrc"),
            backup: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = fallback_home();
        Self {
            config_file: home.join(".config").join("devstation").join("config.toml"),
            activity_log: home
                .join(".local")
                .join("share")
                .join("devstation")
                .join("activity.jsonl"),
            staging_dir: None,
        }
    }
}

fn fallback_home() -> PathBuf {
    home_dir().unwrap_or_else(|| {
        eprintln!("[DVS-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
        PathBuf::from("/tmp")
    })
}

impl RunConfig {
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |name| env::var(name).ok())
    }

    /// [`Config::load`] with an injectable environment lookup.
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DvsError::Io {
                path: path_buf.clone(),
                source,
            })?;
            Self::from_toml(&raw)?
        } else if is_explicit_path {
            return Err(DvsError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(lookup)?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without touching the environment.
    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Deterministic hash of the effective config for the activity log.
    ///
    /// FNV-1a over canonical JSON, stable across processes and releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    /// Built-in catalog with this config's component overrides applied.
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::builtin()?;
        registry.apply_overrides(&self.components)?;
        Ok(registry)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = var("DEVSTATION_RUN_JOBS") {
            self.run.jobs = parse_env("DEVSTATION_RUN_JOBS", &raw)?;
        }
        if let Some(raw) = var("DEVSTATION_RUN_FETCH_TIMEOUT_SECS") {
            self.run.fetch_timeout_secs = parse_env("DEVSTATION_RUN_FETCH_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("DEVSTATION_RUN_PROBE_TIMEOUT_SECS") {
            self.run.probe_timeout_secs = parse_env("DEVSTATION_RUN_PROBE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("DEVSTATION_RUN_DRY_RUN") {
            self.run.dry_run = parse_env("DEVSTATION_RUN_DRY_RUN", &raw)?;
        }
        if let Some(raw) = var("DEVSTATION_PROFILE_PATH") {
            self.profile.path = PathBuf::from(raw);
        }
        if let Some(raw) = var("DEVSTATION_PROFILE_BACKUP") {
            self.profile.backup = parse_env("DEVSTATION_PROFILE_BACKUP", &raw)?;
        }
        if let Some(raw) = var("DEVSTATION_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Expand `~` and strip trailing slashes so paths compare consistently.
    fn normalize_paths(&mut self) {
        let home = home_dir();
        let fix = |path: &mut PathBuf| {
            let expanded = expand_tilde(&path.to_string_lossy(), home.as_deref());
            let s = expanded.to_string_lossy();
            *path = match s.strip_suffix('/') {
                Some(stripped) if s.len() > 1 => PathBuf::from(stripped),
                _ => expanded.clone(),
            };
        };
        fix(&mut self.profile.path);
        fix(&mut self.paths.activity_log);
        if let Some(staging) = self.paths.staging_dir.as_mut() {
            fix(staging);
        }
    }

    /// Reject configurations the orchestrator cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.run.jobs == 0 {
            return Err(DvsError::InvalidConfig {
                details: "run.jobs must be at least 1".to_string(),
            });
        }
        if self.run.fetch_timeout_secs == 0 {
            return Err(DvsError::InvalidConfig {
                details: "run.fetch_timeout_secs must be > 0".to_string(),
            });
        }
        if self.run.probe_timeout_secs == 0 {
            return Err(DvsError::InvalidConfig {
                details: "run.probe_timeout_secs must be > 0".to_string(),
            });
        }
        if self.profile.path.as_os_str().is_empty() {
            return Err(DvsError::InvalidConfig {
                details: "profile.path must not be empty".to_string(),
            });
        }
        if self.profile.path.is_dir() {
            return Err(DvsError::InvalidConfig {
                details: format!("profile.path {} is a directory", self.profile.path.display()),
            });
        }
        // Overrides are checked against the catalog they will be applied to.
        self.registry().map(|_| ())
    }
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|error| DvsError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
