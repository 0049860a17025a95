//! Run results.

#![allow(missing_docs)]

use serde::Serialize;

use crate::installer::InstallOutcome;

use super::state::ComponentState;

/// Final record for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentReport {
    pub name: String,
    pub required: bool,
    pub state: ComponentState,
    pub outcome: InstallOutcome,
    /// Clean+install cycles started (0 when nothing was installed).
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ComponentReport {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        required: bool,
        state: ComponentState,
        outcome: InstallOutcome,
    ) -> Self {
        Self {
            name: name.into(),
            required,
            state,
            outcome,
            attempts: 0,
            duration_ms: 0,
        }
    }

    /// A component that never left `Pending`, recorded with `reason`.
    #[must_use]
    pub fn skipped(name: impl Into<String>, required: bool, reason: impl Into<String>) -> Self {
        Self::new(
            name,
            required,
            ComponentState::SkippedDependency,
            InstallOutcome::skipped(reason),
        )
    }

    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.state == ComponentState::Satisfied
    }
}

/// Tally of outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SummaryCounts {
    pub already_satisfied: usize,
    pub installed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Ordered results of one run, in plan order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub components: Vec<ComponentReport>,
    pub cancelled: bool,
    pub aborted: bool,
    /// Error that aborted the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub dry_run: bool,
    /// Profile backup taken during the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_backup: Option<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Every required component satisfied, and the run ran to completion.
    ///
    /// A dry run only fails when it was aborted or cancelled: its
    /// would-install components are not failures.
    #[must_use]
    pub fn success(&self) -> bool {
        if self.aborted || self.cancelled {
            return false;
        }
        self.dry_run
            || self
                .components
                .iter()
                .filter(|c| c.required)
                .all(ComponentReport::is_satisfied)
    }

    /// Required components that did not reach `Satisfied`.
    pub fn unsatisfied_required(&self) -> impl Iterator<Item = &ComponentReport> {
        self.components
            .iter()
            .filter(|c| c.required && !c.is_satisfied())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn counts(&self) -> SummaryCounts {
        let mut counts = SummaryCounts::default();
        for report in &self.components {
            match report.outcome {
                InstallOutcome::AlreadySatisfied { .. } => counts.already_satisfied += 1,
                InstallOutcome::Installed { .. } => counts.installed += 1,
                InstallOutcome::Skipped { .. } => counts.skipped += 1,
                InstallOutcome::Failed { .. } => counts.failed += 1,
            }
        }
        counts
    }

    /// Reports in plan order, given the plan's flattened names.
    pub(crate) fn sort_by_plan<'a>(&mut self, order: impl Iterator<Item = &'a str>) {
        let rank: std::collections::HashMap<&str, usize> =
            order.enumerate().map(|(i, n)| (n, i)).collect();
        self.components
            .sort_by_key(|c| rank.get(c.name.as_str()).copied().unwrap_or(usize::MAX));
    }
}
