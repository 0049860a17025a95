//! Best-effort removal of everything a component left behind.
//!
//! Every step runs even when an earlier one failed; failures are recorded
//! in the [`CleanupReport`]. Only a profile write failure escapes, and only
//! after the filesystem, package and environment steps have run.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::core::errors::DvsError;
use crate::installer::InstallContext;
use crate::platform::env::Environment;
use crate::platform::pal::{CommandRunner, Invocation};
use crate::registry::{Component, TemplateContext};

/// Which part of the cleanup a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStage {
    Paths,
    Packages,
    Caches,
    Environment,
    Profile,
}

impl CleanupStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Paths => "paths",
            Self::Packages => "packages",
            Self::Caches => "caches",
            Self::Environment => "environment",
            Self::Profile => "profile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Removed,
    Absent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStep {
    pub stage: CleanupStage,
    pub target: String,
    pub outcome: StepOutcome,
}

/// Everything one cleanup pass did.
#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub component: String,
    pub steps: Vec<CleanupStep>,
    /// Set when the profile could not be rewritten; the run must stop.
    #[serde(skip)]
    pub profile_error: Option<DvsError>,
}

impl CleanupReport {
    fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            steps: Vec::new(),
            profile_error: None,
        }
    }

    fn record(&mut self, stage: CleanupStage, target: impl Into<String>, outcome: StepOutcome) {
        self.steps.push(CleanupStep {
            stage,
            target: target.into(),
            outcome,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Failed(_)))
    }

    #[must_use]
    pub fn removed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Removed)
            .count()
    }
}

/// Removes a component's paths, packages, caches, exports and profile lines.
pub struct CleanupAgent<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> CleanupAgent<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    pub fn clean(&self, component: &Component, ctx: &InstallContext<'_>) -> CleanupReport {
        let mut report = CleanupReport::new(&component.name);
        let tctx = TemplateContext::for_component(component, ctx.host);
        let snapshot = ctx.env.read().clone();

        // 1. owned and legacy paths
        let mut paths = component.resolved_owned_paths(&tctx, &snapshot);
        for legacy in &component.cleanup.legacy_paths {
            let p = PathBuf::from(tctx.resolve(legacy, &snapshot));
            if !paths.contains(&p) {
                paths.push(p);
            }
        }
        for path in &paths {
            let outcome = remove_path(path, &snapshot);
            report.record(CleanupStage::Paths, path.display().to_string(), outcome);
        }

        // 2. packages
        self.purge_packages(component, &snapshot, &mut report);

        // 3. caches
        for cache in &component.cleanup.cache_paths {
            let path = PathBuf::from(tctx.resolve(cache, &snapshot));
            let outcome = remove_path(&path, &snapshot);
            report.record(CleanupStage::Caches, path.display().to_string(), outcome);
        }

        // 4. in-process environment
        {
            let mut env = ctx.env.write();
            let mut changed = component.revert_exports(&tctx, &mut env);
            if let Some(root) = &component.probe.ambient_root
                && env.unset(&root.var).is_some()
            {
                changed += 1;
            }
            let outcome = if changed > 0 {
                StepOutcome::Removed
            } else {
                StepOutcome::Absent
            };
            report.record(CleanupStage::Environment, "exports", outcome);
        }

        // 5. profile block and legacy lines
        let mut profile = ctx.profile.lock();
        match profile.remove(&component.name) {
            Ok(mutation) => {
                let outcome = if mutation.changed() {
                    StepOutcome::Removed
                } else {
                    StepOutcome::Absent
                };
                report.record(CleanupStage::Profile, format!("block {}", component.name), outcome);
            }
            Err(e) => {
                report.record(
                    CleanupStage::Profile,
                    format!("block {}", component.name),
                    StepOutcome::Failed(e.to_string()),
                );
                report.profile_error = Some(e);
                return report;
            }
        }
        match profile.remove_legacy_lines(&component.cleanup.legacy_profile_lines) {
            Ok(0) => {}
            Ok(n) => report.record(
                CleanupStage::Profile,
                format!("{n} legacy line(s)"),
                StepOutcome::Removed,
            ),
            Err(e) => {
                report.record(
                    CleanupStage::Profile,
                    "legacy lines",
                    StepOutcome::Failed(e.to_string()),
                );
                report.profile_error = Some(e);
            }
        }
        report
    }

    fn purge_packages(&self, component: &Component, env: &Environment, report: &mut CleanupReport) {
        let patterns = &component.cleanup.package_patterns;
        if patterns.is_empty() {
            return;
        }
        let mut installed = BTreeSet::new();
        for pattern in patterns {
            let query = Invocation::new(
                "dpkg-query",
                ["-W", "-f", "${db:Status-Abbrev}\t${Package}\n", pattern.as_str()],
            )
            .with_timeout(self.timeout);
            // dpkg-query exits 1 when nothing matches; both cases mean "none".
            let Ok(output) = self.runner.run(&query, env) else {
                report.record(
                    CleanupStage::Packages,
                    pattern.clone(),
                    StepOutcome::Failed("dpkg-query unavailable".to_string()),
                );
                continue;
            };
            let found = parse_installed_packages(&output.stdout);
            if found.is_empty() {
                report.record(CleanupStage::Packages, pattern.clone(), StepOutcome::Absent);
            }
            installed.extend(found);
        }
        if installed.is_empty() {
            return;
        }

        let mut purge_env = env.clone();
        purge_env.set("DEBIAN_FRONTEND", "noninteractive");
        let mut args = vec!["purge".to_string(), "-y".to_string()];
        args.extend(installed.iter().cloned());
        let purge = Invocation::new("apt-get", args).with_timeout(self.timeout);
        let target = installed.into_iter().collect::<Vec<_>>().join(" ");
        let outcome = match self.runner.run(&purge, &purge_env) {
            Ok(output) if output.success() => StepOutcome::Removed,
            Ok(output) => StepOutcome::Failed(format!(
                "apt-get purge exited with {}: {}",
                output.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                output.stderr_tail()
            )),
            Err(e) => StepOutcome::Failed(e.to_string()),
        };
        report.record(CleanupStage::Packages, target, outcome);
    }
}

/// Package names from `${db:Status-Abbrev}\t${Package}` lines, skipping
/// packages dpkg knows about but that are not on the system.
fn parse_installed_packages(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| {
            let (status, name) = line.split_once('\t')?;
            let state = status.chars().nth(1)?;
            (state != 'n' && !name.trim().is_empty()).then(|| name.trim().to_string())
        })
        .collect()
}

/// Remove a file, symlink or directory tree. Refuses obviously dangerous
/// targets.
fn remove_path(path: &Path, env: &Environment) -> StepOutcome {
    if !path.is_absolute()
        || path.parent().is_none()
        || env.home().is_some_and(|home| home == path)
    {
        return StepOutcome::Failed(format!("refusing to remove {}", path.display()));
    }
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return StepOutcome::Absent,
        Err(e) => return StepOutcome::Failed(e.to_string()),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => StepOutcome::Removed,
        Err(e) => StepOutcome::Failed(e.to_string()),
    }
}
