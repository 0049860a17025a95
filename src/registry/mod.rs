//! Component model: what gets installed, how, and what it owns.
//!
//! Components are plain data built from the static catalog in
//! [`catalog`]. Configuration may overlay version pins and enablement before
//! a run starts; after that they are immutable.

#![allow(missing_docs)]

pub mod catalog;
pub mod plan;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::config::ComponentOverride;
use crate::core::errors::{DvsError, Result};
use crate::platform::env::{Environment, is_identifier};
use crate::platform::pal::HostFacts;

pub use plan::Plan;

// ──────────────────── versions ────────────────────

/// Desired version of a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSpec {
    /// Exact pin, e.g. `1.24.0`. A shorter pin (`1.24`) accepts any patch.
    Exact(String),
    /// Whatever the upstream currently calls latest.
    Latest,
}

impl VersionSpec {
    /// Parse a user-facing specifier; `latest` (any case) and the empty
    /// string mean [`VersionSpec::Latest`]. A leading `v` is dropped.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
            return Self::Latest;
        }
        Self::Exact(trimmed.trim_start_matches('v').to_string())
    }

    #[must_use]
    pub fn pinned(&self) -> Option<&str> {
        match self {
            Self::Exact(v) => Some(v),
            Self::Latest => None,
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(v) => f.write_str(v),
            Self::Latest => f.write_str("latest"),
        }
    }
}

// ──────────────────── install methods ────────────────────

/// Payload shape of a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    /// A single executable, no archive.
    Binary,
}

impl ArchiveFormat {
    /// `tar` decompression flag, `None` for raw binaries.
    #[must_use]
    pub const fn tar_flag(self) -> Option<&'static str> {
        match self {
            Self::TarGz => Some("-xzf"),
            Self::TarXz => Some("-xJf"),
            Self::Binary => None,
        }
    }
}

/// Direct download of an archive or binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSpec {
    /// Download URL template.
    pub url: String,
    /// Plain-text endpoint naming the latest release, for `Latest` pins.
    pub latest_url: Option<String>,
    /// Regex with one capture group extracting the version from `latest_url`.
    pub latest_pattern: Option<String>,
    pub format: ArchiveFormat,
    /// Path inside the extracted archive that becomes the install root.
    pub archive_root: Option<String>,
    /// Where the payload lives once placed.
    pub install_root: String,
    /// Expected SHA-256 of the download, hex. Only set from configuration.
    pub sha256: Option<String>,
}

/// Third-party apt repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AptRepository {
    /// File stem used for the keyring and the source list.
    pub name: String,
    pub key_url: String,
    /// Keyring file name under `/etc/apt/keyrings` (extension matters to apt).
    pub keyring_file: String,
    pub uri: String,
    pub suite: String,
    pub components: Vec<String>,
}

impl AptRepository {
    #[must_use]
    pub fn keyring_path(&self) -> PathBuf {
        PathBuf::from("/etc/apt/keyrings").join(&self.keyring_file)
    }

    #[must_use]
    pub fn source_list_path(&self) -> PathBuf {
        PathBuf::from("/etc/apt/sources.list.d").join(format!("{}.list", self.name))
    }

    /// One-line `deb` source entry.
    #[must_use]
    pub fn source_line(&self, ctx: &TemplateContext) -> String {
        format!(
            "deb [arch={} signed-by={}] {} {} {}\n",
            ctx.host.arch,
            self.keyring_path().display(),
            ctx.render(&self.uri),
            ctx.render(&self.suite),
            self.components.join(" ")
        )
    }
}

/// Language-level package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageManager {
    /// `go install module@version`.
    Go,
    /// `npm install -g package@version`.
    Npm,
    /// `nvm install version`.
    Nvm,
}

impl fmt::Display for LanguageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Go => f.write_str("go"),
            Self::Npm => f.write_str("npm"),
            Self::Nvm => f.write_str("nvm"),
        }
    }
}

/// How a component is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstallMethod {
    DownloadArchive(ArchiveSpec),
    PackageRepository {
        repository: Option<AptRepository>,
        packages: Vec<String>,
    },
    LanguagePackage {
        manager: LanguageManager,
        package: String,
    },
}

impl InstallMethod {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::DownloadArchive(_) => "download-archive",
            Self::PackageRepository { .. } => "package-repository",
            Self::LanguagePackage { .. } => "language-package-manager",
        }
    }

    /// Shared resource that forbids running two installs of this kind at
    /// once (`apt` holds a global lock, `npm -g` and `nvm` share a prefix).
    #[must_use]
    pub const fn exclusive_resource(&self) -> Option<&'static str> {
        match self {
            Self::PackageRepository { .. } => Some("apt"),
            Self::LanguagePackage {
                manager: LanguageManager::Npm | LanguageManager::Nvm,
                ..
            } => Some("node-prefix"),
            Self::DownloadArchive(_)
            | Self::LanguagePackage {
                manager: LanguageManager::Go,
                ..
            } => None,
        }
    }
}

// ──────────────────── profile exports ────────────────────

/// One line of environment configuration owned by a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProfileExport {
    /// `export NAME="value"`.
    Set { name: String, value: String },
    /// Guarded `PATH` prepend.
    PrependPath(String),
    /// Verbatim shell line; affects the profile only.
    Raw(String),
}

impl ProfileExport {
    pub fn set(name: &str, value: &str) -> Self {
        Self::Set {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// Shell text for the profile. `$VAR` references are left for the shell.
    #[must_use]
    pub fn render(&self, ctx: &TemplateContext) -> String {
        match self {
            Self::Set { name, value } => format!("export {name}=\"{}\"", ctx.render(value)),
            Self::PrependPath(dir) => {
                let dir = ctx.render(dir);
                format!("case \":$PATH:\" in *\":{dir}:\"*) ;; *) export PATH=\"{dir}:$PATH\" ;; esac")
            }
            Self::Raw(line) => ctx.render(line),
        }
    }

    /// Apply to the in-process environment. Returns `true` on change.
    pub fn apply(&self, ctx: &TemplateContext, env: &mut Environment) -> bool {
        match self {
            Self::Set { name, value } => {
                let value = env.expand(&ctx.render(value));
                if env.get(name) == Some(value.as_str()) {
                    return false;
                }
                env.set(name.clone(), value);
                true
            }
            Self::PrependPath(dir) => {
                let dir = env.expand(&ctx.render(dir));
                env.prepend_path(&dir)
            }
            Self::Raw(_) => false,
        }
    }

    /// Undo [`ProfileExport::apply`]. Returns `true` on change.
    pub fn revert(&self, ctx: &TemplateContext, env: &mut Environment) -> bool {
        match self {
            Self::Set { name, .. } => env.unset(name).is_some(),
            Self::PrependPath(dir) => {
                let dir = env.expand(&ctx.render(dir));
                env.remove_path_entry(&dir)
            }
            Self::Raw(_) => false,
        }
    }

    fn validate(&self, component: &str) -> Result<()> {
        let bad = |what: String| DvsError::InvalidRegistry {
            details: format!("{component}: {what}"),
        };
        let check_value = |v: &str| -> Result<()> {
            if v.contains(['"', '`', '\n', '\\']) {
                return Err(bad(format!("export value {v:?} needs shell escaping")));
            }
            Ok(())
        };
        match self {
            Self::Set { name, value } => {
                if !is_identifier(name) {
                    return Err(bad(format!("export name {name:?} is not a shell identifier")));
                }
                check_value(value)
            }
            Self::PrependPath(dir) => check_value(dir),
            Self::Raw(line) => {
                if line.contains('\n') || line.trim_start().starts_with("# >>>")
                    || line.trim_start().starts_with("# <<<")
                {
                    return Err(bad(format!("raw profile line {line:?} is not allowed")));
                }
                Ok(())
            }
        }
    }
}

// ──────────────────── probing & cleanup specs ────────────────────

/// Functional check beyond presence: write files into a scratch dir, run a
/// command there, optionally require a token on stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmokeTest {
    pub files: Vec<(String, String)>,
    pub command: Vec<String>,
    pub expect_stdout: Option<String>,
}

/// An environment variable that, if set, must point at the install root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbientRoot {
    pub var: String,
    pub expected: String,
}

/// How to classify an installed component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    /// Path that must exist for the component to count as present. When
    /// unset, the command's program must resolve on `PATH`.
    pub locate: Option<String>,
    /// Version command; the first element is the program.
    pub command: Vec<String>,
    /// Regex whose first capture group is the version.
    pub version_pattern: String,
    pub smoke: Option<SmokeTest>,
    pub ambient_root: Option<AmbientRoot>,
}

/// What a reinstall must clear beyond the owned paths and profile block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSpec {
    /// Alternate or historical install locations.
    pub legacy_paths: Vec<String>,
    /// dpkg name patterns to purge.
    pub package_patterns: Vec<String>,
    pub cache_paths: Vec<String>,
    /// Substrings identifying unmanaged profile lines from older installers.
    pub legacy_profile_lines: Vec<String>,
}

// ──────────────────── component ────────────────────

/// One managed toolchain or tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    pub name: String,
    pub description: String,
    /// Foundation components fail the run; others are best-effort.
    pub required: bool,
    /// Disabled components are probed but never installed.
    pub enabled: bool,
    pub version: VersionSpec,
    pub method: InstallMethod,
    pub depends_on: Vec<String>,
    pub exports: Vec<ProfileExport>,
    pub owned_paths: Vec<String>,
    pub probe: ProbeSpec,
    pub cleanup: CleanupSpec,
}

impl Component {
    /// Body of the component's profile block, `None` when it exports nothing.
    #[must_use]
    pub fn profile_content(&self, ctx: &TemplateContext) -> Option<String> {
        if self.exports.is_empty() {
            return None;
        }
        let mut out = String::new();
        for export in &self.exports {
            out.push_str(&export.render(ctx));
            out.push('\n');
        }
        Some(out)
    }

    /// Apply every export to `env`, in declaration order.
    pub fn apply_exports(&self, ctx: &TemplateContext, env: &mut Environment) -> usize {
        self.exports
            .iter()
            .filter(|e| e.apply(ctx, env))
            .count()
    }

    /// Remove every export from `env`, in reverse order.
    pub fn revert_exports(&self, ctx: &TemplateContext, env: &mut Environment) -> usize {
        self.exports
            .iter()
            .rev()
            .filter(|e| e.revert(ctx, env))
            .count()
    }

    /// Owned paths with templates and variables resolved.
    #[must_use]
    pub fn resolved_owned_paths(&self, ctx: &TemplateContext, env: &Environment) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .owned_paths
            .iter()
            .map(|p| PathBuf::from(ctx.resolve(p, env)))
            .collect();
        if let InstallMethod::DownloadArchive(spec) = &self.method {
            let root = PathBuf::from(ctx.resolve(&spec.install_root, env));
            if !paths.contains(&root) {
                paths.push(root);
            }
        }
        paths
    }

    /// Eligible to share a concurrent batch with other components.
    #[must_use]
    pub fn is_concurrency_safe(&self) -> bool {
        !self.required && self.method.exclusive_resource().is_none()
    }

    /// Whether exported or owned paths contain `{version}`.
    fn paths_embed_version(&self) -> bool {
        let export_text = |e: &ProfileExport| match e {
            ProfileExport::Set { value, .. } => value.contains("{version}"),
            ProfileExport::PrependPath(text) | ProfileExport::Raw(text) => text.contains("{version}"),
        };
        self.exports.iter().any(export_text)
            || self.owned_paths.iter().any(|p| p.contains("{version}"))
    }

    fn apply_override(&mut self, ov: &ComponentOverride) -> Result<()> {
        if let Some(enabled) = ov.enabled {
            if !enabled && self.required {
                return Err(DvsError::InvalidConfig {
                    details: format!("components.{}: a required component cannot be disabled", self.name),
                });
            }
            self.enabled = enabled;
        }
        if let Some(raw) = &ov.version {
            let spec = VersionSpec::parse(raw);
            if matches!(self.method, InstallMethod::PackageRepository { .. })
                && spec != VersionSpec::Latest
            {
                return Err(DvsError::InvalidConfig {
                    details: format!(
                        "components.{}: apt-managed components track the repository and cannot be pinned",
                        self.name
                    ),
                });
            }
            if self.paths_embed_version() && !is_full_version(&spec) {
                return Err(DvsError::InvalidConfig {
                    details: format!(
                        "components.{}: install paths embed the version, so it needs a full x.y.z pin (got {raw:?})",
                        self.name
                    ),
                });
            }
            self.version = spec;
        }
        if let Some(digest) = &ov.sha256 {
            let InstallMethod::DownloadArchive(spec) = &mut self.method else {
                return Err(DvsError::InvalidConfig {
                    details: format!("components.{}: sha256 only applies to downloads", self.name),
                });
            };
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DvsError::InvalidConfig {
                    details: format!("components.{}: sha256 must be 64 hex characters", self.name),
                });
            }
            spec.sha256 = Some(digest.to_ascii_lowercase());
        }
        Ok(())
    }
}

// ──────────────────── templates ────────────────────

/// Values substituted into catalog templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    pub version: String,
    pub host: HostFacts,
}

impl TemplateContext {
    #[must_use]
    pub fn new(version: impl Into<String>, host: HostFacts) -> Self {
        Self {
            version: version.into(),
            host,
        }
    }

    /// Context for a component before its version is resolved.
    #[must_use]
    pub fn for_component(component: &Component, host: &HostFacts) -> Self {
        Self::new(component.version.to_string(), host.clone())
    }

    /// Substitute `{version}`, `{arch}`, `{distro}` and `{codename}`.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{version}", &self.version)
            .replace("{arch}", &self.host.arch)
            .replace("{distro}", &self.host.distro)
            .replace("{codename}", &self.host.codename)
    }

    /// [`TemplateContext::render`] followed by variable expansion.
    #[must_use]
    pub fn resolve(&self, template: &str, env: &Environment) -> String {
        env.expand(&self.render(template))
    }
}

// ──────────────────── registry ────────────────────

/// Validated, ordered set of components.
#[derive(Debug, Clone)]
pub struct Registry {
    components: Vec<Component>,
}

impl Registry {
    /// The built-in workstation catalog.
    pub fn builtin() -> Result<Self> {
        Self::new(catalog::builtin_components())
    }

    /// Validate names, dependencies and exports, and reject cycles.
    pub fn new(components: Vec<Component>) -> Result<Self> {
        let mut seen = HashSet::new();
        for c in &components {
            if !is_block_name(&c.name) {
                return Err(DvsError::InvalidRegistry {
                    details: format!("component name {:?} must match [A-Za-z0-9._-]+", c.name),
                });
            }
            if !seen.insert(c.name.as_str()) {
                return Err(DvsError::InvalidRegistry {
                    details: format!("duplicate component {:?}", c.name),
                });
            }
            if c.probe.command.is_empty() {
                return Err(DvsError::InvalidRegistry {
                    details: format!("{}: probe command is empty", c.name),
                });
            }
            regex::Regex::new(&c.probe.version_pattern).map_err(|e| {
                DvsError::InvalidRegistry {
                    details: format!("{}: bad version pattern: {e}", c.name),
                }
            })?;
            for export in &c.exports {
                export.validate(&c.name)?;
            }
        }
        for c in &components {
            for dep in &c.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(DvsError::InvalidRegistry {
                        details: format!("{} depends on unknown component {dep:?}", c.name),
                    });
                }
            }
        }
        let registry = Self { components };
        // Planning the full set is the cycle check.
        plan::Plan::build(&registry, None)?;
        Ok(registry)
    }

    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Overlay configuration onto the catalog.
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, ComponentOverride>) -> Result<()> {
        for (name, ov) in overrides {
            let Some(component) = self.components.iter_mut().find(|c| &c.name == name) else {
                return Err(DvsError::InvalidConfig {
                    details: format!("components.{name}: no such component"),
                });
            };
            component.apply_override(ov)?;
        }
        Ok(())
    }

    /// Plan the whole registry, or `only` plus transitive dependencies.
    pub fn plan(&self, only: Option<&[String]>) -> Result<Plan> {
        Plan::build(self, only)
    }
}

/// `x.y.z` with numeric parts; shorter pins and `latest` resolve elsewhere.
fn is_full_version(spec: &VersionSpec) -> bool {
    spec.pinned().is_some_and(|v| {
        let parts: Vec<&str> = v.split('.').collect();
        parts.len() == 3
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    })
}

/// Block and component names: `[A-Za-z0-9._-]+`.
#[must_use]
pub fn is_block_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal archive component for tests.
    pub fn component(name: &str, deps: &[&str]) -> Component {
        Component {
            name: name.to_string(),
            description: format!("{name} for tests"),
            required: false,
            enabled: true,
            version: VersionSpec::Exact("1.0.0".to_string()),
            method: InstallMethod::DownloadArchive(ArchiveSpec {
                url: format!("https://example.invalid/{name}-{{version}}.tar.gz"),
                latest_url: None,
                latest_pattern: None,
                format: ArchiveFormat::TarGz,
                archive_root: None,
                install_root: format!("/nonexistent/devstation/{name}"),
                sha256: None,
            }),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
            exports: Vec::new(),
            owned_paths: Vec::new(),
            probe: ProbeSpec {
                locate: None,
                command: vec![name.to_string(), "--version".to_string()],
                version_pattern: r"(\d+\.\d+\.\d+)".to_string(),
                smoke: None,
                ambient_root: None,
            },
            cleanup: CleanupSpec::default(),
        }
    }

    pub fn host() -> HostFacts {
        HostFacts {
            arch: "amd64".to_string(),
            distro: "debian".to_string(),
            id_like: Vec::new(),
            codename: "bookworm".to_string(),
        }
    }
}
