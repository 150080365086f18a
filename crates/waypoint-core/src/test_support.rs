//! Shared test doubles: workflow builders, demo node classes and an
//! in-memory repository.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::{json, Value};
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    new_id, ConfirmDecision, ConfirmRecord, Credential, InstanceStatus, Node, NodeData,
    NodeMetadata, NodeRunStatus, NodeType, Trigger, TriggerStatus, Workflow, WorkflowInstance,
    WorkflowInstanceNode, WorkflowStatus, CONFIRM_CLASS, FOREACH_CLASS, SWITCH_CLASS,
};

use crate::node::{
    HandlerMetadata, InputSchema, NodeContext, NodeError, NodeHandler, NodeOutput, NodeRegistry,
    Passthrough, ProvisionDeps, SetVariables, SpecInfo, TriggerPolicy,
};
use crate::repository::{ApplyPlan, WorkflowRepository};
use crate::workflow::execution::{
    ExecutionContext, ExecutionOptions, ExecutionResult, WorkflowGraph,
};

pub const TRIGGER_CLASS: &str = "webhook#receive";
pub const ECHO_CLASS: &str = "demo#echo";
pub const SCRIPT_CLASS: &str = "demo#script";
pub const VARS_CLASS: &str = "demo#vars";

// ---------------------------------------------------------------------------
// Demo nodes
// ---------------------------------------------------------------------------

/// Outputs its resolved input.
pub struct EchoNode;

impl NodeHandler for EchoNode {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(ECHO_CLASS, InputSchema::Fields)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Value(ctx.input().clone()))
    }
}

/// Behaves according to its `mode` field: `ok`, `fail`, `panic`, `pause`
/// or `goto` (jump to `target`).
pub struct ScriptNode;

impl NodeHandler for ScriptNode {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(SCRIPT_CLASS, InputSchema::Any)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        let mode = ctx.input()["mode"].as_str().unwrap_or("ok").to_string();
        match mode.as_str() {
            "fail" => Err(NodeError::Execution("scripted failure".to_string())),
            "panic" => panic!("scripted panic"),
            "pause" => Ok(NodeOutput::Paused {
                reason: "scripted pause".to_string(),
            }),
            "goto" => {
                let target = ctx.input()["target"].as_str().unwrap_or_default().to_string();
                ctx.take_control(Some(&target));
                Ok(NodeOutput::Value(json!({"goto": target})))
            }
            _ => Ok(NodeOutput::Value(json!({"mode": mode}))),
        }
    }
}

pub fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::with_logic_nodes();
    registry
        .register(
            SpecInfo::trigger(TRIGGER_CLASS, TriggerPolicy::EnableAtFirst),
            || Passthrough::new(TRIGGER_CLASS),
        )
        .unwrap();
    registry.register(SpecInfo::actor(ECHO_CLASS), || EchoNode).unwrap();
    registry.register(SpecInfo::actor(SCRIPT_CLASS), || ScriptNode).unwrap();
    registry
        .register(SpecInfo::actor(VARS_CLASS), || SetVariables::new(VARS_CLASS))
        .unwrap();
    registry
}

// ---------------------------------------------------------------------------
// Workflow builders
// ---------------------------------------------------------------------------

pub fn node(id: &str, class: &str, node_type: NodeType, transition: &str, input_fields: Value) -> Node {
    Node {
        id: id.to_string(),
        name: id.to_string(),
        class: class.to_string(),
        node_type,
        transition: transition.to_string(),
        data: NodeData {
            metadata: NodeMetadata {
                adapter_class: class.split('#').next().unwrap_or_default().to_string(),
                credential_id: None,
            },
            input_fields,
        },
    }
}

/// Workflow `wf` starting at its first node.
pub fn workflow(nodes: Vec<Node>) -> Workflow {
    Workflow {
        id: "wf".to_string(),
        name: "test".to_string(),
        description: None,
        status: WorkflowStatus::Disabled,
        start_node_id: nodes.first().map(|n| n.id.clone()).unwrap_or_default(),
        nodes,
    }
}

pub fn trigger(id: &str, transition: &str) -> Node {
    node(id, TRIGGER_CLASS, NodeType::Trigger, transition, json!({}))
}

pub fn actor(id: &str, transition: &str) -> Node {
    node(id, ECHO_CLASS, NodeType::Actor, transition, json!({}))
}

pub fn scripted(id: &str, mode: &str, transition: &str) -> Node {
    node(id, SCRIPT_CLASS, NodeType::Actor, transition, json!({ "mode": mode }))
}

pub fn switch_node(id: &str, paths: Value) -> Node {
    node(id, SWITCH_CLASS, NodeType::Logic, "", json!({ "paths": paths }))
}

pub fn foreach_node(id: &str, collection: &str, body: &str, transition: &str) -> Node {
    node(
        id,
        FOREACH_CLASS,
        NodeType::Logic,
        transition,
        json!({ "input_collection": collection, "transition": body }),
    )
}

pub fn confirm_node(
    id: &str,
    description: &str,
    timeout_minutes: u32,
    confirmers: Value,
    transition: &str,
) -> Node {
    node(
        id,
        CONFIRM_CLASS,
        NodeType::Logic,
        transition,
        json!({
            "description": description,
            "timeout_minutes": timeout_minutes,
            "confirmers": confirmers,
        }),
    )
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

pub fn graph_with(wf: &Workflow, deps: &ProvisionDeps) -> Arc<WorkflowGraph> {
    Arc::new(WorkflowGraph::build(wf, &registry(), deps).unwrap())
}

pub fn graph(wf: &Workflow) -> Arc<WorkflowGraph> {
    graph_with(wf, &ProvisionDeps::in_memory())
}

/// Run `wf` from its start node with default services and options.
pub async fn run_workflow(wf: &Workflow, input: Option<Value>) -> ExecutionResult {
    ExecutionContext::new(graph(wf), Arc::default(), ExecutionOptions::default())
        .run(&wf.start_node_id, input)
        .await
}

// ---------------------------------------------------------------------------
// In-memory repository
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryState {
    pub workflows: HashMap<String, Workflow>,
    pub instances: HashMap<String, WorkflowInstance>,
    pub nodes: Vec<WorkflowInstanceNode>,
    pub confirms: HashMap<(String, String), ConfirmRecord>,
    pub triggers: Vec<Trigger>,
    pub credentials: HashMap<String, Credential>,
    pub apply_calls: usize,
    /// Make `save_instance_nodes` fail.
    pub fail_node_saves: bool,
}

/// Process-local [`WorkflowRepository`]; clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkflowRepository for InMemoryRepository {
    async fn apply_workflow(&self, plan: &ApplyPlan) -> Result<(), RepositoryError> {
        let mut state = self.state();
        state.apply_calls += 1;
        state
            .workflows
            .insert(plan.workflow.id.clone(), plan.workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, RepositoryError> {
        Ok(self.state().workflows.get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let mut all: Vec<Workflow> = self.state().workflows.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(all)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.state().workflows.remove(id).is_some())
    }

    async fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state();
        let wf = state.workflows.get_mut(id).ok_or(RepositoryError::NotFound)?;
        wf.status = status;
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.state()
            .instances
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut state = self.state();
        let slot = state
            .instances
            .get_mut(&instance.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = instance.clone();
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.state().instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        workflow_id: &str,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut found: Vec<WorkflowInstance> = self
            .state()
            .instances
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn save_instance_nodes(
        &self,
        records: &[WorkflowInstanceNode],
    ) -> Result<(), RepositoryError> {
        let mut state = self.state();
        if state.fail_node_saves {
            return Err(RepositoryError::Connection);
        }
        state.nodes.extend_from_slice(records);
        Ok(())
    }

    async fn list_instance_nodes(
        &self,
        instance_id: &str,
    ) -> Result<Vec<WorkflowInstanceNode>, RepositoryError> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|n| n.workflow_instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn delete_instance_nodes(
        &self,
        instance_id: &str,
        node_id: &str,
        status: NodeRunStatus,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state();
        let before = state.nodes.len();
        state.nodes.retain(|n| {
            !(n.workflow_instance_id == instance_id && n.node_id == node_id && n.status == status)
        });
        Ok((before - state.nodes.len()) as u64)
    }

    async fn create_confirm(&self, record: &ConfirmRecord) -> Result<(), RepositoryError> {
        let mut state = self.state();
        let key = (record.workflow_instance_id.clone(), record.node_id.clone());
        if state.confirms.contains_key(&key) {
            return Err(RepositoryError::Conflict("confirm exists".to_string()));
        }
        state.confirms.insert(key, record.clone());
        Ok(())
    }

    async fn get_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
    ) -> Result<Option<ConfirmRecord>, RepositoryError> {
        Ok(self
            .state()
            .confirms
            .get(&(instance_id.to_string(), node_id.to_string()))
            .cloned())
    }

    async fn resolve_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
        decision: ConfirmDecision,
        decided_by: Option<&str>,
    ) -> Result<ConfirmRecord, RepositoryError> {
        let mut state = self.state();
        let record = state
            .confirms
            .get_mut(&(instance_id.to_string(), node_id.to_string()))
            .ok_or(RepositoryError::NotFound)?;
        if record.decision != ConfirmDecision::Pending {
            return Err(RepositoryError::Conflict("already resolved".to_string()));
        }
        record.decision = decision;
        record.decided_by = decided_by.map(str::to_string);
        record.resolved_at = Some(Utc::now());
        Ok(record.clone())
    }

    async fn list_pending_confirms(&self) -> Result<Vec<ConfirmRecord>, RepositoryError> {
        Ok(self
            .state()
            .confirms
            .values()
            .filter(|c| c.decision == ConfirmDecision::Pending)
            .cloned()
            .collect())
    }

    async fn get_or_create_trigger(
        &self,
        workflow_id: &str,
        node_id: &str,
        class: &str,
    ) -> Result<Trigger, RepositoryError> {
        let mut state = self.state();
        if let Some(existing) = state
            .triggers
            .iter()
            .find(|t| t.workflow_id == workflow_id && t.node_id == node_id)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let trigger = Trigger {
            id: new_id(),
            workflow_id: workflow_id.to_string(),
            node_id: node_id.to_string(),
            class: class.to_string(),
            status: TriggerStatus::Inactive,
            config: json!({}),
            created_at: now,
            updated_at: now,
        };
        state.triggers.push(trigger.clone());
        Ok(trigger)
    }

    async fn update_trigger(&self, trigger: &Trigger) -> Result<(), RepositoryError> {
        let mut state = self.state();
        let slot = state
            .triggers
            .iter_mut()
            .find(|t| t.id == trigger.id)
            .ok_or(RepositoryError::NotFound)?;
        *slot = trigger.clone();
        Ok(())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<(), RepositoryError> {
        self.state()
            .credentials
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Credential>, RepositoryError> {
        Ok(self.state().credentials.get(id).cloned())
    }
}
