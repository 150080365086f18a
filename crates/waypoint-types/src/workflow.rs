//! Workflow domain types for Waypoint.
//!
//! Defines the declared node graph (`Workflow`, `Node`), the typed views of
//! the built-in logic nodes' input fields (`SwitchLogicNode`,
//! `LoopFromListNode`, `ConfirmLogicNode`), and the runtime records that the
//! engine persists (`WorkflowInstance`, `WorkflowInstanceNode`,
//! `ConfirmRecord`, `Trigger`, `Credential`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Well-known classes
// ---------------------------------------------------------------------------

/// Class of the built-in conditional branch node.
pub const SWITCH_CLASS: &str = "logic#switch";

/// Class of the built-in loop node.
pub const FOREACH_CLASS: &str = "logic#foreach";

/// Class of the built-in pause-for-approval node.
pub const CONFIRM_CLASS: &str = "logic#confirm";

/// Generate a fresh string ID.
///
/// UUIDv7 in simple (hex) form, so generated IDs are time-sortable and pass
/// the alphanumeric/underscore ID format check.
pub fn new_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Whether `id` is a well-formed workflow or node ID (non-empty, ASCII
/// alphanumeric or underscore).
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A declared workflow: a named graph of nodes with a single start node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    /// Empty for a workflow that has never been applied.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// ID of the node execution starts from (normally the trigger).
    pub start_node_id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Workflow {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Whether a workflow's trigger is allowed to start runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Enabled,
    #[default]
    Disabled,
}

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Unique within the workflow; ASCII alphanumeric or underscore.
    pub id: String,
    /// Unique within the workflow; used to diff nodes on re-apply.
    pub name: String,
    /// `adapterName#specName` identifier of the implementation.
    pub class: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// ID of the next node, or empty when this node ends its chain.
    #[serde(default)]
    pub transition: String,
    #[serde(default)]
    pub data: NodeData,
}

impl Node {
    pub fn is_switch(&self) -> bool {
        self.class == SWITCH_CLASS
    }

    pub fn is_foreach(&self) -> bool {
        self.class == FOREACH_CLASS
    }

    pub fn is_confirm(&self) -> bool {
        self.class == CONFIRM_CLASS
    }
}

/// The role a node plays in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Trigger,
    Actor,
    Logic,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Trigger => "trigger",
            NodeType::Actor => "actor",
            NodeType::Logic => "logic",
        };
        f.write_str(s)
    }
}

/// Static node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeData {
    #[serde(default)]
    pub metadata: NodeMetadata,
    /// Raw, unevaluated input fields. String leaves may contain `{{ expr }}`
    /// templates.
    #[serde(default = "empty_object")]
    pub input_fields: Value,
}

/// Adapter metadata attached to a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeMetadata {
    #[serde(default)]
    pub adapter_class: String,
    /// Credential the node authenticates with, if its adapter needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Logic node views
// ---------------------------------------------------------------------------

/// Input fields of a switch node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SwitchLogicNode {
    /// Evaluated in order; the first matching path wins.
    pub paths: Vec<SwitchPath>,
}

/// One branch of a switch node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SwitchPath {
    #[serde(default)]
    pub name: String,
    /// OR of AND groups: the path matches when every condition of at least
    /// one group holds.
    #[serde(default)]
    pub conditions: Vec<Vec<Condition>>,
    /// First node of the branch; empty ends the run when selected.
    #[serde(default)]
    pub transition: String,
    #[serde(default)]
    pub is_default: bool,
}

/// A single comparison inside a switch condition group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub left: String,
    pub operation: Operation,
    #[serde(default)]
    pub right: String,
}

/// Comparison operations understood by the comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    ContainsIgnoreCase,
    NotContainsIgnoreCase,
    StartsWith,
    EndsWith,
    Before,
    After,
    WithinLastDays,
    WithinLastHours,
    WithinLastWeeks,
    Empty,
    NotEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

/// Input fields of a foreach node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoopFromListNode {
    /// Expression (or a single `{{ ref }}`) producing the items to iterate.
    #[serde(default)]
    pub input_collection: String,
    /// First node of the loop body.
    #[serde(default)]
    pub transition: String,
}

/// Input fields of a confirm node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfirmLogicNode {
    #[serde(default)]
    pub description: String,
    /// How long approvers have to decide before the request expires.
    #[serde(default)]
    pub timeout_minutes: u32,
    /// User identifiers (email addresses) allowed to decide.
    #[serde(default)]
    pub confirmers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Runtime records
// ---------------------------------------------------------------------------

/// Where a run came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    Trigger,
    #[default]
    Manual,
    Preview,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Trigger => "trigger",
            RunSource::Manual => "manual",
            RunSource::Preview => "preview",
        }
    }
}

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Completed,
    Failed,
    Paused,
    Aborted,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Aborted
        )
    }
}

/// A single run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub source: RunSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_payload: Option<Value>,
    /// Steps consumed across every attempt of this instance.
    pub steps: u32,
    /// Innermost node the run is waiting on (a confirm inside a loop body
    /// names the confirm, not the loop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_node_id: Option<String>,
    /// Top-level node a resume restarts from. Equal to `paused_node_id`
    /// unless the pause happened inside a subflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of one node execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Completed,
    Failed,
    Paused,
}

/// Persisted per-node execution record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstanceNode {
    pub id: String,
    pub workflow_id: String,
    pub workflow_instance_id: String,
    pub node_id: String,
    pub status: NodeRunStatus,
    pub class: String,
    pub duration_ms: i64,
    pub input: Value,
    pub output: Value,
    pub start_time: DateTime<Utc>,
    pub source: RunSource,
    /// Identifier of the resource the output describes, when it has one.
    #[serde(default)]
    pub sample_resource_id: String,
    /// Random per record.
    #[serde(default)]
    pub sample_version: String,
}

/// State of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmDecision {
    Pending,
    Approved,
    Declined,
}

impl ConfirmDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmDecision::Pending => "pending",
            ConfirmDecision::Approved => "approved",
            ConfirmDecision::Declined => "declined",
        }
    }
}

/// An approval request raised by a confirm node, keyed by
/// `(workflow_instance_id, node_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfirmRecord {
    pub id: String,
    pub workflow_id: String,
    pub workflow_instance_id: String,
    pub node_id: String,
    pub description: String,
    pub confirmers: Vec<String>,
    pub decision: ConfirmDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Activation state of a trigger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Inactive,
    Active,
}

/// Trigger registration for a workflow's start node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: String,
    pub workflow_id: String,
    pub node_id: String,
    pub class: String,
    pub status: TriggerStatus,
    /// Provider-specific configuration (e.g. the registered webhook).
    pub config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A stored credential reference. Secret material lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: String,
    pub adapter_class: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
