//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use devstation::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DvsError, Result};

// Platform
pub use crate::platform::env::Environment;
pub use crate::platform::pal::{CommandRunner, HostFacts, SystemRunner};

// Registry
pub use crate::registry::{Component, InstallMethod, Plan, Registry, VersionSpec};

// Probe / install
pub use crate::installer::{
    CleanupAgent, CleanupReport, ComponentInstaller, Fetcher, InstallOutcome, Installation,
    SystemFetcher,
};
pub use crate::probe::{HealthCheck, VersionProbe};

// Profile
pub use crate::profile::{Mutation, ProfileMutator};

// Orchestration
pub use crate::logger::ActivityLog;
pub use crate::orchestrator::{
    CancelFlag, ComponentState, Orchestrator, ProgressSink, RunOptions, RunSummary,
};
