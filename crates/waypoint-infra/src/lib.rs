//! Infrastructure layer for Waypoint.
//!
//! Contains the implementations of the repository traits defined in
//! `waypoint-core` (SQLite storage), the engine config loader, and
//! filesystem adapters for the data directory and workflow files.

pub mod config;
pub mod filesystem;
pub mod sqlite;
