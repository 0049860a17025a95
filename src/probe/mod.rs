//! Component health classification.
//!
//! A probe never fails: every problem it meets becomes part of the
//! [`HealthCheck`] it returns.

#![allow(missing_docs)]

pub mod smoke;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::platform::env::Environment;
use crate::platform::pal::{CommandRunner, Invocation, RunError};
use crate::registry::{Component, TemplateContext, VersionSpec};

/// Observed state of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum HealthCheck {
    Absent,
    PresentButUnhealthy { detail: String },
    PresentAndHealthy { version: String },
}

impl HealthCheck {
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::PresentAndHealthy { .. })
    }

    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::PresentButUnhealthy { .. } => "unhealthy",
            Self::PresentAndHealthy { .. } => "healthy",
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self::PresentButUnhealthy {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("absent"),
            Self::PresentButUnhealthy { detail } => write!(f, "unhealthy: {detail}"),
            Self::PresentAndHealthy { version } => write!(f, "healthy ({version})"),
        }
    }
}

/// Runs the probe pipeline against an [`Environment`].
pub struct VersionProbe<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> VersionProbe<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Classify `component` as seen through `env`.
    #[must_use]
    pub fn probe(
        &self,
        component: &Component,
        ctx: &TemplateContext,
        env: &Environment,
    ) -> HealthCheck {
        let spec = &component.probe;
        let Some((program, args)) = spec.command.split_first() else {
            return HealthCheck::unhealthy("probe command is empty");
        };

        // 1. locate
        if let Some(locate) = &spec.locate {
            if !Path::new(&ctx.resolve(locate, env)).exists() {
                return HealthCheck::Absent;
            }
        } else if env.which(&ctx.resolve(program, env)).is_none() {
            return HealthCheck::Absent;
        }

        // 2. ambient root
        if let Some(root) = &spec.ambient_root
            && let Some(actual) = env.get(&root.var).filter(|v| !v.is_empty())
        {
            let expected = ctx.resolve(&root.expected, env);
            if actual.trim_end_matches('/') != expected.trim_end_matches('/') {
                return HealthCheck::unhealthy(format!(
                    "{} points at {actual}, expected {expected}",
                    root.var
                ));
            }
        }

        // 3. version
        let invocation = Invocation::new(
            ctx.resolve(program, env),
            args.iter().map(|a| ctx.render(a)),
        )
        .with_timeout(self.timeout);
        let output = match self.runner.run(&invocation, env) {
            Ok(output) => output,
            Err(RunError::Timeout { after, .. }) => {
                return HealthCheck::unhealthy(format!(
                    "version command timed out after {}s",
                    after.as_secs()
                ));
            }
            Err(RunError::Spawn { .. }) if spec.locate.is_none() => return HealthCheck::Absent,
            Err(other) => return HealthCheck::unhealthy(other.to_string()),
        };
        if !output.success() {
            let tail = output.stderr_tail();
            return HealthCheck::unhealthy(if tail.is_empty() {
                "version command failed".to_string()
            } else {
                format!("version command failed: {tail}")
            });
        }
        let Some(found) = extract_version(&spec.version_pattern, &output.combined()) else {
            return HealthCheck::unhealthy("unparseable version output");
        };

        // 4. compare
        if !version_matches(&component.version, &found) {
            return HealthCheck::unhealthy(format!(
                "version {found} does not match pin {}",
                component.version
            ));
        }

        // 5. smoke
        if let Some(test) = &spec.smoke
            && let Err(reason) = smoke::run_smoke(test, self.runner, env, ctx, self.timeout)
        {
            return HealthCheck::unhealthy(reason);
        }

        HealthCheck::PresentAndHealthy { version: found }
    }
}

/// First capture group of `pattern` in `text`.
#[must_use]
pub fn extract_version(pattern: &str, text: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    let caps = re.captures(text)?;
    caps.get(1)
        .map(|m| m.as_str().trim().trim_start_matches('v').to_string())
        .filter(|v| !v.is_empty())
}

/// `Latest` accepts anything; an exact pin accepts itself and any version
/// it is a dotted prefix of. A leading `v` is ignored on both sides.
#[must_use]
pub fn version_matches(spec: &VersionSpec, found: &str) -> bool {
    let VersionSpec::Exact(pin) = spec else {
        return true;
    };
    let pin = pin.trim().trim_start_matches('v');
    let found = found.trim().trim_start_matches('v');
    if pin == found {
        return true;
    }
    let pin_parts: Vec<&str> = pin.split('.').collect();
    let found_parts: Vec<&str> = found.split('.').collect();
    pin_parts.len() < found_parts.len() && found_parts.starts_with(&pin_parts)
}
