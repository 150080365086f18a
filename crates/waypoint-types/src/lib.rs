//! Shared domain types for Waypoint.
//!
//! This crate contains the domain types used across the Waypoint workflow
//! engine: the declared node graph, runtime instance records, workflow
//! events, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
