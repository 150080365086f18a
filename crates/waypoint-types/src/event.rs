//! Event types for the Waypoint workflow event bus.
//!
//! `WorkflowEvent` is broadcast during execution. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};

/// Events emitted while a workflow instance runs.
///
/// Used by the event bus to communicate run and node lifecycle to
/// subscribers (CLI progress output, logging, external hooks).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A workflow instance has started (or resumed).
    RunStarted {
        instance_id: String,
        workflow_id: String,
        start_node_id: String,
        resumed: bool,
    },

    /// A node has started executing.
    NodeStarted {
        instance_id: String,
        node_id: String,
        class: String,
    },

    /// A node finished successfully.
    NodeCompleted {
        instance_id: String,
        node_id: String,
        duration_ms: u64,
    },

    /// A node failed.
    NodeFailed {
        instance_id: String,
        node_id: String,
        error: String,
    },

    /// A run completed successfully.
    RunCompleted {
        instance_id: String,
        workflow_id: String,
        steps: u32,
    },

    /// A run failed.
    RunFailed {
        instance_id: String,
        workflow_id: String,
        node_id: Option<String>,
        error: String,
    },

    /// A run is waiting on a confirm node.
    RunPaused {
        instance_id: String,
        node_id: String,
        reason: String,
    },

    /// A run was cancelled or exceeded its step budget.
    RunAborted {
        instance_id: String,
        node_id: Option<String>,
        reason: String,
    },
}

impl WorkflowEvent {
    /// The instance this event belongs to.
    pub fn instance_id(&self) -> &str {
        match self {
            WorkflowEvent::RunStarted { instance_id, .. }
            | WorkflowEvent::NodeStarted { instance_id, .. }
            | WorkflowEvent::NodeCompleted { instance_id, .. }
            | WorkflowEvent::NodeFailed { instance_id, .. }
            | WorkflowEvent::RunCompleted { instance_id, .. }
            | WorkflowEvent::RunFailed { instance_id, .. }
            | WorkflowEvent::RunPaused { instance_id, .. }
            | WorkflowEvent::RunAborted { instance_id, .. } => instance_id,
        }
    }

    /// Whether this event ends an attempt of the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunCompleted { .. }
                | WorkflowEvent::RunFailed { .. }
                | WorkflowEvent::RunPaused { .. }
                | WorkflowEvent::RunAborted { .. }
        )
    }
}
