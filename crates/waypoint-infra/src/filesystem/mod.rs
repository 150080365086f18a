//! Filesystem adapters for Waypoint.
//!
//! Resolves the data directory and reads/writes workflow definition files.

pub mod workflow_file;

use std::path::PathBuf;

pub use workflow_file::{WorkflowFileError, load_workflow_file, save_workflow_file};

/// Resolve the Waypoint data directory.
///
/// Priority:
/// 1. `WAYPOINT_DATA_DIR` environment variable
/// 2. `~/.waypoint`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WAYPOINT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".waypoint");
    }

    // Last resort: current directory
    PathBuf::from(".waypoint")
}
