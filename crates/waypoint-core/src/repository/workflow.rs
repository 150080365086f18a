//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, instances,
//! per-node execution records, confirm requests, trigger registrations and
//! credential references. The infrastructure layer (waypoint-infra)
//! implements this trait with SQLite persistence.

use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    ConfirmDecision, ConfirmRecord, Credential, InstanceStatus, Node, NodeRunStatus, Trigger,
    Workflow, WorkflowInstance, WorkflowInstanceNode, WorkflowStatus,
};

/// Everything one apply writes, computed up front so the repository can
/// commit it atomically.
#[derive(Debug, Clone)]
pub struct ApplyPlan {
    /// Final definition with persisted IDs and rewritten transitions.
    pub workflow: Workflow,
    pub is_new: bool,
    pub insert_nodes: Vec<Node>,
    pub update_nodes: Vec<Node>,
    pub delete_node_ids: Vec<String>,
}

/// Repository trait for workflow persistence.
///
/// Covers five entity families:
/// - **Definitions:** workflows with their nodes, written through a single
///   transactional [`apply_workflow`](WorkflowRepository::apply_workflow).
/// - **Instances:** create/update/query runs.
/// - **Node records:** per-node execution records of an instance.
/// - **Confirms:** approval requests keyed by `(instance_id, node_id)`.
/// - **Triggers and credentials:** trigger registrations and credential
///   references used during apply.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Write a whole apply plan in one transaction.
    fn apply_workflow(
        &self,
        plan: &ApplyPlan,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow (with its nodes, in declared order) by ID.
    fn get_workflow(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// List workflows ordered by name. Nodes are included.
    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Workflow>, RepositoryError>> + Send;

    /// Delete a workflow and everything it owns. Returns `true` if it existed.
    fn delete_workflow(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite the mutable fields (status, steps, paused/failed node,
    /// error, completion time) of an existing instance.
    fn update_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances of a workflow, newest first, optionally filtered by
    /// status.
    fn list_instances(
        &self,
        workflow_id: &str,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node records
    // -----------------------------------------------------------------------

    fn save_instance_nodes(
        &self,
        records: &[WorkflowInstanceNode],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Records of an instance ordered by start time.
    fn list_instance_nodes(
        &self,
        instance_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstanceNode>, RepositoryError>> + Send;

    /// Delete the records of one node with the given status. Returns the
    /// number removed.
    fn delete_instance_nodes(
        &self,
        instance_id: &str,
        node_id: &str,
        status: NodeRunStatus,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Confirms
    // -----------------------------------------------------------------------

    /// Insert a pending confirm. Fails with `Conflict` if one already exists
    /// for the same `(instance_id, node_id)`.
    fn create_confirm(
        &self,
        record: &ConfirmRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ConfirmRecord>, RepositoryError>> + Send;

    /// Move a pending confirm to a final decision. Fails with `NotFound` if
    /// there is no request and `Conflict` if it is already resolved.
    fn resolve_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
        decision: ConfirmDecision,
        decided_by: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ConfirmRecord, RepositoryError>> + Send;

    fn list_pending_confirms(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ConfirmRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Triggers and credentials
    // -----------------------------------------------------------------------

    /// Return the trigger registered for `(workflow_id, node_id)`, creating
    /// an inactive placeholder if there is none.
    fn get_or_create_trigger(
        &self,
        workflow_id: &str,
        node_id: &str,
        class: &str,
    ) -> impl std::future::Future<Output = Result<Trigger, RepositoryError>> + Send;

    fn update_trigger(
        &self,
        trigger: &Trigger,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn save_credential(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_credential(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Credential>, RepositoryError>> + Send;
}
