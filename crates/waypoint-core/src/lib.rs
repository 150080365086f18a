//! Workflow engine and repository trait definitions for Waypoint.
//!
//! This crate defines the "ports" (repository and node traits) that the
//! infrastructure layer implements, plus the engine itself. It depends only
//! on `waypoint-types` -- never on `waypoint-infra` or any database/IO crate.

pub mod event;
pub mod logic;
pub mod node;
pub mod repository;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
