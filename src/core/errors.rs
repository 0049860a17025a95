//! DVS-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DvsError>;

/// Top-level error type for devstation.
#[derive(Debug, Error)]
pub enum DvsError {
    #[error("[DVS-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DVS-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DVS-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DVS-1004] invalid component registry: {details}")]
    InvalidRegistry { details: String },

    #[error("[DVS-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[DVS-2001] probe of {component} failed: {details}")]
    Probe { component: String, details: String },

    #[error("[DVS-2101] fetch for {component} failed: {details}")]
    Fetch { component: String, details: String },

    #[error("[DVS-2102] {component}: timeout after {}s", .after.as_secs())]
    Timeout { component: String, after: Duration },

    #[error("[DVS-2201] install of {component} could not be verified: {details}")]
    Install { component: String, details: String },

    #[error("[DVS-2301] {component}: dependency unsatisfied: {dependency}")]
    DependencyUnsatisfied {
        component: String,
        dependency: String,
    },

    #[error("[DVS-3001] shell profile write failed for {path}: {details}")]
    ProfileWrite { path: PathBuf, details: String },

    #[error("[DVS-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DVS-3101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DVS-3900] run cancelled")]
    Cancelled,
}

impl DvsError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DVS-1001",
            Self::MissingConfig { .. } => "DVS-1002",
            Self::ConfigParse { .. } => "DVS-1003",
            Self::InvalidRegistry { .. } => "DVS-1004",
            Self::UnsupportedPlatform { .. } => "DVS-1101",
            Self::Probe { .. } => "DVS-2001",
            Self::Fetch { .. } => "DVS-2101",
            Self::Timeout { .. } => "DVS-2102",
            Self::Install { .. } => "DVS-2201",
            Self::DependencyUnsatisfied { .. } => "DVS-2301",
            Self::ProfileWrite { .. } => "DVS-3001",
            Self::Io { .. } => "DVS-3002",
            Self::Serialization { .. } => "DVS-3101",
            Self::Cancelled => "DVS-3900",
        }
    }

    /// Whether re-running the whole tool might resolve the failure.
    ///
    /// Nothing is retried internally; this only informs the summary.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::Timeout { .. } | Self::Io { .. } | Self::Cancelled
        )
    }

    /// Errors that must stop the whole run rather than a single component.
    #[must_use]
    pub const fn is_fatal_to_run(&self) -> bool {
        matches!(self, Self::ProfileWrite { .. } | Self::Cancelled)
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for profile write failures.
    #[must_use]
    pub fn profile_write(path: impl AsRef<Path>, details: impl Into<String>) -> Self {
        Self::ProfileWrite {
            path: path.as_ref().to_path_buf(),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for DvsError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DvsError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
