//! Host-facing primitives: process environment and command execution.

pub mod env;
pub mod pal;
