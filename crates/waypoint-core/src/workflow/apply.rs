//! Apply pipeline: validate a declared workflow, persist it, and initialize
//! its trigger.
//!
//! Re-applying a workflow diffs its nodes against the stored definition by
//! *name*, so a node keeps its persisted ID across edits as long as its name
//! is unchanged. Transitions pointing at remapped IDs (including switch paths
//! and foreach bodies) are rewritten before anything is written.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    new_id, Node, Trigger, TriggerStatus, Workflow, WorkflowStatus, FOREACH_CLASS, SWITCH_CLASS,
};

use super::validator::{validate_workflow, Issue, Report, ValidateOptions};
use crate::node::{NodeError, NodeRegistry, RegistryError, TriggerPolicy, TriggerRequest};
use crate::repository::{ApplyPlan, WorkflowRepository};

/// Errors from [`WorkflowApplier::apply`].
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("workflow is invalid: {0}")]
    Invalid(Report),

    #[error("node name '{0}' is used more than once")]
    DuplicateNodeName(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("trigger activation failed: {0}")]
    Node(#[from] NodeError),
}

/// What an apply did.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The stored definition, with persisted IDs.
    pub workflow: Workflow,
    pub is_new: bool,
    /// Non-blocking validation findings.
    pub risks: Vec<Issue>,
    pub trigger: Option<Trigger>,
}

/// Persists workflow definitions through a [`WorkflowRepository`].
pub struct WorkflowApplier<R> {
    repo: R,
    registry: Arc<NodeRegistry>,
}

impl<R: WorkflowRepository> WorkflowApplier<R> {
    pub fn new(repo: R, registry: Arc<NodeRegistry>) -> Self {
        Self { repo, registry }
    }

    /// Validate, diff and persist `workflow`, then initialize its trigger.
    ///
    /// A fatal validation report, a duplicate node name or an unknown class
    /// aborts before any write.
    pub async fn apply(&self, workflow: Workflow) -> Result<ApplyOutcome, ApplyError> {
        let risks = validate_workflow(&workflow, ValidateOptions::default())
            .into_result()
            .map_err(ApplyError::Invalid)?;
        for issue in &risks {
            tracing::warn!(workflow = %workflow.name, %issue, "validation risk");
        }

        check_unique_names(&workflow)?;
        for node in &workflow.nodes {
            if !self.registry.contains(&node.class) {
                return Err(RegistryError::UnknownClass(node.class.clone()).into());
            }
        }

        let existing = if workflow.id.is_empty() {
            None
        } else {
            self.repo.get_workflow(&workflow.id).await?
        };
        let plan = build_plan(workflow, existing.as_ref());

        self.repo.apply_workflow(&plan).await?;
        tracing::info!(
            workflow_id = %plan.workflow.id,
            is_new = plan.is_new,
            inserted = plan.insert_nodes.len(),
            updated = plan.update_nodes.len(),
            deleted = plan.delete_node_ids.len(),
            "workflow applied"
        );

        let trigger = self.init_trigger(&plan.workflow).await?;
        let mut workflow = plan.workflow;
        if trigger
            .as_ref()
            .is_some_and(|t| t.status == TriggerStatus::Active)
            && workflow.status != WorkflowStatus::Enabled
        {
            self.repo
                .update_workflow_status(&workflow.id, WorkflowStatus::Enabled)
                .await?;
            workflow.status = WorkflowStatus::Enabled;
        }

        Ok(ApplyOutcome {
            workflow,
            is_new: plan.is_new,
            risks,
            trigger,
        })
    }

    /// Make sure the start node has a trigger record; activate it on first
    /// apply when its policy and credentials allow.
    async fn init_trigger(&self, workflow: &Workflow) -> Result<Option<Trigger>, ApplyError> {
        let Some(start) = workflow.node(&workflow.start_node_id) else {
            return Ok(None);
        };
        let Some(spec) = self.registry.spec(&start.class) else {
            return Ok(None);
        };
        let Some(policy) = spec.trigger_policy else {
            return Ok(None);
        };

        let mut trigger = self
            .repo
            .get_or_create_trigger(&workflow.id, &start.id, &start.class)
            .await?;
        if trigger.status == TriggerStatus::Active || policy != TriggerPolicy::EnableAtFirst {
            return Ok(Some(trigger));
        }

        if spec.requires_auth && !self.has_credential(start).await? {
            tracing::info!(node_id = %start.id, class = %start.class, "trigger waits for a credential");
            return Ok(Some(trigger));
        }

        let handler = self.registry.create(&start.class)?;
        if let Some(provider) = handler.as_trigger_provider() {
            let existing_config = if is_empty_config(&trigger.config) {
                provider.config_object()
            } else {
                trigger.config.clone()
            };
            let request = TriggerRequest {
                workflow_id: workflow.id.clone(),
                node: start.clone(),
                existing_config,
            };
            trigger.config = provider.create(&request).await?;
        }

        trigger.status = TriggerStatus::Active;
        trigger.updated_at = Utc::now();
        self.repo.update_trigger(&trigger).await?;
        tracing::info!(workflow_id = %workflow.id, trigger_id = %trigger.id, "trigger activated");
        Ok(Some(trigger))
    }

    async fn has_credential(&self, node: &Node) -> Result<bool, ApplyError> {
        match &node.data.metadata.credential_id {
            Some(id) if !id.is_empty() => Ok(self.repo.get_credential(id).await?.is_some()),
            _ => Ok(false),
        }
    }
}

fn is_empty_config(config: &Value) -> bool {
    match config {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn check_unique_names(workflow: &Workflow) -> Result<(), ApplyError> {
    let mut seen = HashSet::new();
    for node in &workflow.nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(ApplyError::DuplicateNodeName(node.name.clone()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// Compute the writes for `workflow` against the stored definition.
fn build_plan(mut workflow: Workflow, existing: Option<&Workflow>) -> ApplyPlan {
    let Some(existing) = existing else {
        if workflow.id.is_empty() {
            workflow.id = new_id();
        }
        return ApplyPlan {
            insert_nodes: workflow.nodes.clone(),
            workflow,
            is_new: true,
            update_nodes: Vec::new(),
            delete_node_ids: Vec::new(),
        };
    };

    let stored_by_name: HashMap<&str, &str> = existing
        .nodes
        .iter()
        .map(|n| (n.name.as_str(), n.id.as_str()))
        .collect();
    let kept_ids: HashSet<&str> = workflow
        .nodes
        .iter()
        .filter_map(|n| stored_by_name.get(n.name.as_str()).copied())
        .collect();

    // Declared ID -> persisted ID.
    let mut ids: HashMap<String, String> = HashMap::new();
    let mut insert_nodes = Vec::new();
    let mut update_nodes = Vec::new();
    let mut matched: HashSet<&str> = HashSet::new();

    for node in &workflow.nodes {
        let persisted = match stored_by_name.get_key_value(node.name.as_str()) {
            Some((name, id)) => {
                matched.insert(*name);
                (*id).to_string()
            }
            // A new node may not take over an ID another node keeps.
            None if kept_ids.contains(node.id.as_str()) => new_id(),
            None => node.id.clone(),
        };
        ids.insert(node.id.clone(), persisted);
    }

    workflow.start_node_id = remap(&workflow.start_node_id, &ids);
    for node in &mut workflow.nodes {
        let is_update = matched.contains(node.name.as_str());
        node.id = remap(&node.id, &ids);
        rewrite_transitions(node, &ids);
        if is_update {
            update_nodes.push(node.clone());
        } else {
            insert_nodes.push(node.clone());
        }
    }

    let delete_node_ids = existing
        .nodes
        .iter()
        .filter(|n| !matched.contains(n.name.as_str()))
        .map(|n| n.id.clone())
        .collect();

    ApplyPlan {
        workflow,
        is_new: false,
        insert_nodes,
        update_nodes,
        delete_node_ids,
    }
}

fn remap(id: &str, ids: &HashMap<String, String>) -> String {
    ids.get(id).cloned().unwrap_or_else(|| id.to_string())
}

/// Rewrite the node's own transition plus the ones stored in logic node
/// input fields.
fn rewrite_transitions(node: &mut Node, ids: &HashMap<String, String>) {
    node.transition = remap(&node.transition, ids);
    let fields = &mut node.data.input_fields;
    if node.class == SWITCH_CLASS {
        if let Some(paths) = fields.get_mut("paths").and_then(Value::as_array_mut) {
            for path in paths {
                rewrite_field(path, ids);
            }
        }
    } else if node.class == FOREACH_CLASS {
        rewrite_field(fields, ids);
    }
}

fn rewrite_field(value: &mut Value, ids: &HashMap<String, String>) {
    if let Some(Value::String(target)) = value.get_mut("transition") {
        *target = remap(target, ids);
    }
}
