//! Artifact acquisition.
//!
//! A [`Fetcher`] turns a component's [`InstallMethod`] into something the
//! installer can place: a staged payload for downloads, or packages already
//! installed by apt, `go install`, `npm -g` or nvm. Every external command
//! shares one deadline derived from the request timeout.

#![allow(missing_docs)]

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::errors::DvsError;
use crate::platform::env::Environment;
use crate::platform::pal::{CommandOutput, CommandRunner, Invocation, RunError};
use crate::registry::{
    AptRepository, ArchiveSpec, Component, InstallMethod, LanguageManager,
    TemplateContext, VersionSpec,
};

/// Failure while acquiring an artifact.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{command} failed: {detail}")]
    Command { command: String, detail: String },
    #[error("timed out after {}s", .after.as_secs())]
    Timeout { after: Duration },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
    #[error("could not resolve latest version: {0}")]
    Resolve(String),
    #[error("IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FetchError {
    /// Attach the component name.
    #[must_use]
    pub fn into_dvs(self, component: &str) -> DvsError {
        match self {
            Self::Timeout { after } => DvsError::Timeout {
                component: component.to_string(),
                after,
            },
            other => DvsError::Fetch {
                component: component.to_string(),
                details: other.to_string(),
            },
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything a fetcher needs for one component.
pub struct FetchRequest<'a> {
    pub component: &'a Component,
    /// Context carrying the desired (possibly `latest`) version.
    pub ctx: &'a TemplateContext,
    pub env: &'a Environment,
    /// Empty directory for downloads; present for archive methods only.
    pub staging: Option<&'a Path>,
    pub timeout: Duration,
}

/// What a successful fetch produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchReceipt {
    /// Concrete version fetched, or `latest` when the manager resolves it.
    pub version: String,
    /// Staged file or directory to move onto the install root.
    pub payload: Option<PathBuf>,
}

/// Acquisition seam; tests substitute fakes that drop scripts on disk.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchReceipt, FetchError>;
}

/// Fetches with `curl`, `tar`, `apt-get` and the language package managers.
#[derive(Clone)]
pub struct SystemFetcher {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for SystemFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemFetcher").finish_non_exhaustive()
    }
}

impl SystemFetcher {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl Fetcher for SystemFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<FetchReceipt, FetchError> {
        let mut session = Session {
            runner: self.runner.as_ref(),
            env: request.env.clone(),
            deadline: Instant::now() + request.timeout,
            budget: request.timeout,
        };
        let component = request.component;
        match &component.method {
            InstallMethod::DownloadArchive(spec) => {
                let staging = request.staging.ok_or_else(|| FetchError::Command {
                    command: "stage".to_string(),
                    detail: "no staging directory for download".to_string(),
                })?;
                session.fetch_archive(component, spec, request.ctx, staging)
            }
            InstallMethod::PackageRepository {
                repository,
                packages,
            } => {
                session.install_packages(repository.as_ref(), packages, request.ctx)?;
                Ok(FetchReceipt {
                    version: request.ctx.version.clone(),
                    payload: None,
                })
            }
            InstallMethod::LanguagePackage { manager, package } => {
                session.install_language_package(*manager, package, &component.version)?;
                Ok(FetchReceipt {
                    version: component.version.to_string(),
                    payload: None,
                })
            }
        }
    }
}

/// One fetch: shared deadline plus the environment children see.
struct Session<'a> {
    runner: &'a dyn CommandRunner,
    env: Environment,
    deadline: Instant,
    budget: Duration,
}

impl Session<'_> {
    fn run(&self, invocation: Invocation) -> Result<CommandOutput, FetchError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(FetchError::Timeout { after: self.budget });
        }
        let invocation = invocation.with_timeout(remaining);
        let command = invocation.display();
        let output = self
            .runner
            .run(&invocation, &self.env)
            .map_err(|e| match e {
                RunError::Timeout { .. } => FetchError::Timeout { after: self.budget },
                other => FetchError::Command {
                    command: command.clone(),
                    detail: other.to_string(),
                },
            })?;
        if !output.success() {
            let tail = output.stderr_tail();
            return Err(FetchError::Command {
                command,
                detail: match output.code {
                    Some(code) if tail.is_empty() => format!("exit code {code}"),
                    Some(code) => format!("exit code {code}: {tail}"),
                    None => "killed by signal".to_string(),
                },
            });
        }
        Ok(output)
    }

    fn curl_to(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
        self.run(Invocation::new(
            "curl",
            [
                "-fsSL".to_string(),
                "--retry".to_string(),
                "2".to_string(),
                "-o".to_string(),
                dest.to_string_lossy().into_owned(),
                url.to_string(),
            ],
        ))
        .map(|_| ())
    }

    fn resolve_latest(&self, spec: &ArchiveSpec, ctx: &TemplateContext) -> Result<String, FetchError> {
        let Some(url) = &spec.latest_url else {
            return Err(FetchError::Resolve(
                "no release endpoint declared; pin a version".to_string(),
            ));
        };
        let output = self.run(Invocation::new("curl", ["-fsSL", ctx.render(url).as_str()]))?;
        let pattern = spec.latest_pattern.as_deref().unwrap_or(r"(\S+)");
        let re = Regex::new(pattern).map_err(|e| FetchError::Resolve(e.to_string()))?;
        re.captures(&output.stdout)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim_start_matches('v').to_string())
            .ok_or_else(|| FetchError::Resolve(format!("no match for {pattern} in {url}")))
    }

    fn fetch_archive(
        &self,
        component: &Component,
        spec: &ArchiveSpec,
        ctx: &TemplateContext,
        staging: &Path,
    ) -> Result<FetchReceipt, FetchError> {
        let version = match &component.version {
            VersionSpec::Exact(v) => v.clone(),
            VersionSpec::Latest => self.resolve_latest(spec, ctx)?,
        };
        let ctx = TemplateContext::new(version.clone(), ctx.host.clone());
        let url = ctx.render(&spec.url);
        let download = staging.join("download");
        self.curl_to(&url, &download)?;

        if let Some(expected) = &spec.sha256 {
            let actual = sha256_file(&download).map_err(|e| FetchError::io(&download, e))?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(FetchError::Checksum {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let payload = match spec.format.tar_flag() {
            None => download,
            Some(flag) => {
                let extract = staging.join("extract");
                std::fs::create_dir(&extract).map_err(|e| FetchError::io(&extract, e))?;
                self.run(Invocation::new(
                    "tar",
                    [
                        flag.to_string(),
                        download.to_string_lossy().into_owned(),
                        "-C".to_string(),
                        extract.to_string_lossy().into_owned(),
                    ],
                ))?;
                let root = spec
                    .archive_root
                    .as_ref()
                    .map_or_else(|| extract.clone(), |r| extract.join(ctx.render(r)));
                if !root.exists() {
                    return Err(FetchError::Command {
                        command: format!("tar {flag}"),
                        detail: format!(
                            "archive does not contain {}",
                            root.strip_prefix(&extract).unwrap_or(&root).display()
                        ),
                    });
                }
                root
            }
        };
        Ok(FetchReceipt {
            version,
            payload: Some(payload),
        })
    }

    fn install_packages(
        &mut self,
        repository: Option<&AptRepository>,
        packages: &[String],
        ctx: &TemplateContext,
    ) -> Result<(), FetchError> {
        self.env.set("DEBIAN_FRONTEND", "noninteractive");
        if let Some(repo) = repository {
            self.add_repository(repo, ctx)?;
        }
        self.run(Invocation::new("apt-get", ["update"]))?;
        let mut args = vec![
            "install".to_string(),
            "-y".to_string(),
            "--no-install-recommends".to_string(),
        ];
        args.extend(packages.iter().cloned());
        self.run(Invocation::new("apt-get", args)).map(|_| ())
    }

    fn add_repository(&self, repo: &AptRepository, ctx: &TemplateContext) -> Result<(), FetchError> {
        let keyring = repo.keyring_path();
        let keyring_dir = keyring
            .parent()
            .map_or_else(|| "/etc/apt/keyrings".to_string(), |p| p.to_string_lossy().into_owned());
        self.run(Invocation::new("install", ["-m", "0755", "-d", keyring_dir.as_str()]))?;
        self.curl_to(&ctx.render(&repo.key_url), &keyring)?;
        self.run(Invocation::new(
            "chmod",
            ["a+r".to_string(), keyring.to_string_lossy().into_owned()],
        ))?;
        self.run(
            Invocation::new(
                "tee",
                [repo.source_list_path().to_string_lossy().into_owned()],
            )
            .with_stdin(repo.source_line(ctx)),
        )
        .map(|_| ())
    }

    fn install_language_package(
        &self,
        manager: LanguageManager,
        package: &str,
        version: &VersionSpec,
    ) -> Result<(), FetchError> {
        let invocation = match manager {
            LanguageManager::Go => {
                let tag = version
                    .pinned()
                    .map_or_else(|| "latest".to_string(), |v| format!("v{v}"));
                Invocation::new("go", ["install".to_string(), format!("{package}@{tag}")])
            }
            LanguageManager::Npm => {
                let tag = version.pinned().unwrap_or("latest");
                Invocation::new(
                    "npm",
                    ["install".to_string(), "-g".to_string(), format!("{package}@{tag}")],
                )
            }
            LanguageManager::Nvm => {
                let tag = version.pinned().unwrap_or(package);
                Invocation::new(
                    "bash",
                    [
                        "-c".to_string(),
                        format!(
                            "export NVM_DIR=\"${{NVM_DIR:-$HOME/.nvm}}\"; . \"$NVM_DIR/nvm.sh\" && nvm install {tag}"
                        ),
                    ],
                )
            }
        };
        self.run(invocation).map(|_| ())
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}
