//! Engine configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls the
//! step budget, event bus sizing, and confirm-node authorization.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Waypoint engine.
///
/// Loaded from `~/.waypoint/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of node executions per top-level run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Capacity of the workflow event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Permission every confirmer of a confirm node must hold.
    #[serde(default = "default_confirm_permission")]
    pub confirm_permission: String,

    /// Users granted `confirm_permission` by the built-in authorizer.
    #[serde(default)]
    pub authorized_confirmers: Vec<String>,
}

fn default_max_steps() -> u32 {
    100
}

fn default_event_capacity() -> usize {
    1024
}

fn default_confirm_permission() -> String {
    "workflow:confirm".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            event_capacity: default_event_capacity(),
            confirm_permission: default_confirm_permission(),
            authorized_confirmers: Vec::new(),
        }
    }
}
