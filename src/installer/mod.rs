//! Component installation: fetch, place, configure, verify.

#![allow(missing_docs)]

pub mod cleanup;
pub mod fetch;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::errors::{DvsError, Result};
use crate::platform::env::Environment;
use crate::platform::pal::HostFacts;
use crate::probe::smoke::ScratchDir;
use crate::probe::{HealthCheck, VersionProbe};
use crate::profile::{Mutation, ProfileMutator};
use crate::registry::{ArchiveFormat, Component, InstallMethod, TemplateContext};

pub use cleanup::{CleanupAgent, CleanupReport};
pub use fetch::{FetchError, FetchReceipt, FetchRequest, Fetcher, SystemFetcher};

/// Final word on one component for this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InstallOutcome {
    AlreadySatisfied { version: String },
    Installed { version: String },
    Skipped { reason: String },
    Failed { reason: String },
}

impl InstallOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::AlreadySatisfied { .. } => "already-satisfied",
            Self::Installed { .. } => "installed",
            Self::Skipped { .. } => "skipped",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::AlreadySatisfied { .. } | Self::Installed { .. })
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::AlreadySatisfied { version } | Self::Installed { version } => Some(version),
            Self::Skipped { .. } | Self::Failed { .. } => None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadySatisfied { version } => write!(f, "already satisfied ({version})"),
            Self::Installed { version } => write!(f, "installed ({version})"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// A successful install and the profile edit it made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    /// Always [`InstallOutcome::Installed`].
    pub outcome: InstallOutcome,
    /// `None` when the component exports nothing.
    pub profile: Option<Mutation>,
}

/// Shared, run-wide resources handed to installers and cleanup.
pub struct InstallContext<'a> {
    pub host: &'a HostFacts,
    pub env: &'a RwLock<Environment>,
    pub profile: &'a Mutex<ProfileMutator>,
    pub fetch_timeout: Duration,
    /// Overrides the default staging location next to each install root.
    pub staging_dir: Option<&'a Path>,
}

impl InstallContext<'_> {
    /// Upsert the component's block and apply its exports in-process.
    ///
    /// Returns the profile mutation, `None` when the component exports
    /// nothing.
    pub fn configure(&self, component: &Component) -> Result<Option<Mutation>> {
        let ctx = TemplateContext::for_component(component, self.host);
        let mutation = match component.profile_content(&ctx) {
            Some(content) => Some(self.profile.lock().upsert(&component.name, &content)?),
            None => None,
        };
        component.apply_exports(&ctx, &mut self.env.write());
        Ok(mutation)
    }
}

/// Fetch, place, configure and verify one component.
pub struct ComponentInstaller<'a> {
    fetcher: &'a dyn Fetcher,
    probe: VersionProbe<'a>,
}

impl<'a> ComponentInstaller<'a> {
    #[must_use]
    pub fn new(fetcher: &'a dyn Fetcher, probe: VersionProbe<'a>) -> Self {
        Self { fetcher, probe }
    }

    /// Install `component`. Expects cleanup to have run already.
    ///
    /// A failed verification is [`DvsError::Install`] so the caller can
    /// decide to retry.
    pub fn install(&self, component: &Component, ctx: &InstallContext<'_>) -> Result<Installation> {
        let tctx = TemplateContext::for_component(component, ctx.host);
        let snapshot = ctx.env.read().clone();

        let staging = match &component.method {
            InstallMethod::DownloadArchive(spec) => {
                let install_root = PathBuf::from(tctx.resolve(&spec.install_root, &snapshot));
                let base = staging_base(ctx.staging_dir, &install_root);
                fs::create_dir_all(&base).map_err(|e| DvsError::io(&base, e))?;
                let dir = ScratchDir::create(&base, &format!("stage-{}", component.name))
                    .map_err(|e| DvsError::io(&base, e))?;
                Some((dir, install_root, spec.format))
            }
            InstallMethod::PackageRepository { .. } | InstallMethod::LanguagePackage { .. } => None,
        };

        let request = FetchRequest {
            component,
            ctx: &tctx,
            env: &snapshot,
            staging: staging.as_ref().map(|(dir, _, _)| dir.path()),
            timeout: ctx.fetch_timeout,
        };
        let receipt = self
            .fetcher
            .fetch(&request)
            .map_err(|e| e.into_dvs(&component.name))?;

        if let Some((_dir, install_root, format)) = &staging {
            let Some(payload) = &receipt.payload else {
                return Err(DvsError::Fetch {
                    component: component.name.clone(),
                    details: "fetcher returned no payload for a download".to_string(),
                });
            };
            place(payload, install_root, *format).map_err(|e| DvsError::Install {
                component: component.name.clone(),
                details: format!("placing {}: {e}", install_root.display()),
            })?;
        }
        drop(staging);

        let profile = ctx.configure(component)?;

        let env = ctx.env.read().clone();
        match self.probe.probe(component, &tctx, &env) {
            HealthCheck::PresentAndHealthy { version } => Ok(Installation {
                outcome: InstallOutcome::Installed { version },
                profile,
            }),
            other => Err(DvsError::Install {
                component: component.name.clone(),
                details: format!("verification failed: {other}"),
            }),
        }
    }
}

/// Staging goes next to the install root so the final move is a rename.
fn staging_base(configured: Option<&Path>, install_root: &Path) -> PathBuf {
    configured.map_or_else(
        || {
            install_root
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(std::env::temp_dir, Path::to_path_buf)
        },
        Path::to_path_buf,
    )
}

/// Move `payload` onto `target`, replacing whatever is there.
fn place(payload: &Path, target: &Path, format: ArchiveFormat) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target)?,
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    match fs::rename(payload, target) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => copy_recursive(payload, target)?,
        Err(e) => return Err(e),
    }
    if format == ArchiveFormat::Binary || target.is_file() {
        make_executable(target)?;
    }
    Ok(())
}

fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_dir() {
        fs::create_dir_all(to)?;
        for entry in fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        fs::copy(from, to).map(|_| ())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
