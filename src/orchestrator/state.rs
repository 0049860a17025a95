//! Per-component state machine and progress reporting.

#![allow(missing_docs)]

use std::fmt;

use serde::Serialize;

use crate::probe::HealthCheck;

use super::summary::ComponentReport;

/// Where a component is in the provisioning pipeline.
///
/// ```text
/// Pending → Probing → Satisfied
///                   → Cleaning → Installing → Verifying → Satisfied | Failed
///                                            (Verifying → Cleaning, once)
/// Pending → SkippedDependency
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    Pending,
    Probing,
    Cleaning,
    Installing,
    Verifying,
    Satisfied,
    Failed,
    SkippedDependency,
}

impl ComponentState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Probing => "probing",
            Self::Cleaning => "cleaning",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::Satisfied => "satisfied",
            Self::Failed => "failed",
            Self::SkippedDependency => "skipped_dependency",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Satisfied | Self::Failed | Self::SkippedDependency)
    }

    /// Legal edges of the state machine.
    ///
    /// `Failed` and `SkippedDependency` are reachable from every live state
    /// because an abort or cancellation can land between any two steps.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ComponentState::{
            Cleaning, Failed, Installing, Pending, Probing, Satisfied, SkippedDependency,
            Verifying,
        };
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Probing)
                | (Probing, Satisfied | Cleaning)
                | (Cleaning, Installing)
                | (Installing, Verifying)
                | (Verifying, Satisfied | Cleaning)
                | (_, Failed | SkippedDependency)
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives progress while a run is in flight. Called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn state_changed(&self, _component: &str, _state: ComponentState) {}

    fn probed(&self, _component: &str, _health: &HealthCheck) {}

    fn finished(&self, _report: &ComponentReport) {}
}

/// Discards everything.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {}
