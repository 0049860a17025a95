#![forbid(unsafe_code)]

//! devstation: idempotent provisioner for a development workstation.
//!
//! A static registry of components (Go, Docker, kubectl, Node, CLI tools)
//! is planned into dependency tiers. Each component is probed, and only
//! when it is missing or unhealthy is it cleaned, installed and verified.
//! Environment exports land in named, marker-delimited blocks of the
//! user's shell profile, so re-runs converge to a byte-identical file.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use devstation::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use devstation::core::config::Config;
//! use devstation::profile::ProfileMutator;
//! ```

pub mod prelude;

pub mod core;
pub mod installer;
pub mod logger;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod profile;
pub mod registry;
