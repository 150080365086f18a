//! Run lifecycle on top of the interpreter: start, trigger, resume, decide,
//! preview and cancel, with instances and node records persisted through a
//! [`WorkflowRepository`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use waypoint_types::config::EngineConfig;
use waypoint_types::error::RepositoryError;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    new_id, ConfirmDecision, InstanceStatus, NodeRunStatus, RunSource, Workflow, WorkflowInstance,
    WorkflowInstanceNode, WorkflowStatus,
};

use super::execution::{
    ExecutionContext, ExecutionOptions, ExecutionResult, ExecutionServices, RunOutcome,
    WorkflowGraph,
};
use super::validator::{validate_workflow, Report, ValidateOptions};
use crate::event::EventBus;
use crate::node::provision::RepositoryConfirmStore;
use crate::node::{NodeError, NodeRegistry, ProvisionDeps, RegistryError};
use crate::repository::WorkflowRepository;

/// Errors from [`WorkflowRunner`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("workflow '{0}' is disabled")]
    Disabled(String),

    #[error("workflow is invalid: {0}")]
    Invalid(Report),

    #[error("instance '{instance_id}' is {status:?}, not paused")]
    NotPaused {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("'{0}' is not a final decision")]
    InvalidDecision(String),

    #[error("'{user}' may not decide on node '{node_id}'")]
    NotAConfirmer { user: String, node_id: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// A finished run attempt and the instance as persisted afterwards.
#[derive(Debug)]
pub struct RunReport {
    pub instance: WorkflowInstance,
    pub result: ExecutionResult,
}

/// Starts, resumes and cancels workflow runs.
///
/// Each run attempt builds a fresh [`WorkflowGraph`] from the stored
/// definition and gets its own cancellation token, tracked until the
/// attempt ends.
pub struct WorkflowRunner<R> {
    repo: R,
    registry: Arc<NodeRegistry>,
    services: Arc<ExecutionServices>,
    deps: ProvisionDeps,
    events: EventBus,
    max_steps: u32,
    cancels: DashMap<String, CancellationToken>,
}

impl<R: WorkflowRepository + Clone + 'static> WorkflowRunner<R> {
    pub fn new(repo: R, registry: Arc<NodeRegistry>, config: &EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let confirms = Arc::new(RepositoryConfirmStore::new(repo.clone()));
        Self {
            deps: ProvisionDeps::from_config(config, confirms),
            services: Arc::new(ExecutionServices::default().with_events(events.clone())),
            repo,
            registry,
            events,
            max_steps: config.max_steps,
            cancels: DashMap::new(),
        }
    }

    /// Replace the services injected into provisioned nodes.
    pub fn with_deps(mut self, deps: ProvisionDeps) -> Self {
        self.deps = deps;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Start a new instance of a stored workflow from its start node.
    pub async fn start(
        &self,
        workflow_id: &str,
        source: RunSource,
        payload: Option<Value>,
    ) -> Result<RunReport, RunnerError> {
        let workflow = self.load_workflow(workflow_id).await?;
        self.start_loaded(&workflow, source, payload).await
    }

    /// Deliver a trigger payload. Returns `None` when the workflow's trigger
    /// filtered the payload out.
    pub async fn trigger(
        &self,
        workflow_id: &str,
        payload: Value,
    ) -> Result<Option<RunReport>, RunnerError> {
        let workflow = self.load_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Enabled {
            return Err(RunnerError::Disabled(workflow.id));
        }

        if let Some(start) = workflow.node(&workflow.start_node_id) {
            let handler = self.registry.create(&start.class)?;
            if let Some(filter) = handler.as_pre_filter_provider() {
                if !filter.pre_filter(&payload, &start.data.input_fields)? {
                    tracing::debug!(workflow_id, node_id = %start.id, "payload filtered out");
                    return Ok(None);
                }
            }
        }

        self.start_loaded(&workflow, RunSource::Trigger, Some(payload))
            .await
            .map(Some)
    }

    /// Continue a paused instance. The run restarts at the top-level node
    /// that paused; a loop paused inside its body picks up its progress from
    /// its paused record.
    pub async fn resume(&self, instance_id: &str) -> Result<RunReport, RunnerError> {
        let instance = self
            .repo
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| RunnerError::InstanceNotFound(instance_id.to_string()))?;
        let Some(start) = instance
            .resume_node_id
            .clone()
            .or_else(|| instance.paused_node_id.clone())
            .filter(|_| instance.status == InstanceStatus::Paused)
        else {
            return Err(RunnerError::NotPaused {
                instance_id: instance.id,
                status: instance.status,
            });
        };
        let workflow = self.load_workflow(&instance.workflow_id).await?;
        let graph = self.build_graph(&workflow)?;

        // Paused nodes re-run and write fresh records.
        let records = self.repo.list_instance_nodes(instance_id).await?;
        let paused: BTreeSet<&str> = records
            .iter()
            .filter(|r| r.status == NodeRunStatus::Paused)
            .map(|r| r.node_id.as_str())
            .collect();
        for node_id in &paused {
            self.repo
                .delete_instance_nodes(instance_id, node_id, NodeRunStatus::Paused)
                .await?;
        }
        tracing::info!(instance_id, node_id = %start, replayed = records.len(), paused = paused.len(), "resuming instance");

        self.execute(graph, instance, &start, None, Some(&records))
            .await
    }

    /// Resolve the confirm request of `node_id` and resume the instance.
    pub async fn decide(
        &self,
        instance_id: &str,
        node_id: &str,
        decision: ConfirmDecision,
        decided_by: &str,
    ) -> Result<RunReport, RunnerError> {
        if decision == ConfirmDecision::Pending {
            return Err(RunnerError::InvalidDecision(decision.as_str().to_string()));
        }
        let request = self
            .repo
            .get_confirm(instance_id, node_id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if !request
            .confirmers
            .iter()
            .any(|c| c.eq_ignore_ascii_case(decided_by))
        {
            return Err(RunnerError::NotAConfirmer {
                user: decided_by.to_string(),
                node_id: node_id.to_string(),
            });
        }

        self.repo
            .resolve_confirm(instance_id, node_id, decision, Some(decided_by))
            .await?;
        tracing::info!(instance_id, node_id, decision = decision.as_str(), decided_by, "confirm decided");
        self.resume(instance_id).await
    }

    /// Execute exactly one node of `workflow` without persisting anything.
    /// Nodes with a sample provider return their sample.
    pub async fn preview(
        &self,
        workflow: &Workflow,
        node_id: &str,
    ) -> Result<ExecutionResult, RunnerError> {
        let graph = Arc::new(WorkflowGraph::build(
            workflow,
            &self.registry,
            &ProvisionDeps::in_memory(),
        )?);
        let options = ExecutionOptions {
            source: RunSource::Preview,
            single_step: true,
            ..Default::default()
        };
        let ctx = ExecutionContext::new(graph, Arc::clone(&self.services), options);
        Ok(ctx.run(node_id, None).await)
    }

    /// Request cancellation of a running instance. Returns `false` when the
    /// instance has no attempt in flight.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.cancels.get(instance_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(instance_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow, RunnerError> {
        self.repo
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| RunnerError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn start_loaded(
        &self,
        workflow: &Workflow,
        source: RunSource,
        payload: Option<Value>,
    ) -> Result<RunReport, RunnerError> {
        validate_workflow(workflow, ValidateOptions::default())
            .into_result()
            .map_err(RunnerError::Invalid)?;

        let graph = self.build_graph(workflow)?;

        let instance = WorkflowInstance {
            id: new_id(),
            workflow_id: workflow.id.clone(),
            status: InstanceStatus::Running,
            source,
            trigger_payload: payload.clone(),
            steps: 0,
            paused_node_id: None,
            resume_node_id: None,
            failed_node_id: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.repo.create_instance(&instance).await?;

        self.execute(graph, instance, &workflow.start_node_id, payload, None)
            .await
    }

    fn build_graph(&self, workflow: &Workflow) -> Result<Arc<WorkflowGraph>, RunnerError> {
        Ok(Arc::new(WorkflowGraph::build(
            workflow,
            &self.registry,
            &self.deps,
        )?))
    }

    async fn execute(
        &self,
        graph: Arc<WorkflowGraph>,
        mut instance: WorkflowInstance,
        start: &str,
        payload: Option<Value>,
        resume: Option<&[WorkflowInstanceNode]>,
    ) -> Result<RunReport, RunnerError> {
        let workflow_id = graph.workflow_id().to_string();
        let cancel = CancellationToken::new();
        let tracked = CancelGuard::track(&self.cancels, &instance.id, cancel.clone());

        if instance.status != InstanceStatus::Running {
            instance.status = InstanceStatus::Running;
            instance.paused_node_id = None;
            instance.resume_node_id = None;
            self.repo.update_instance(&instance).await?;
        }
        self.events.publish(WorkflowEvent::RunStarted {
            instance_id: instance.id.clone(),
            workflow_id: workflow_id.clone(),
            start_node_id: start.to_string(),
            resumed: resume.is_some(),
        });

        let options = ExecutionOptions {
            instance_id: instance.id.clone(),
            source: instance.source,
            max_steps: self.max_steps,
            single_step: false,
            cancel,
        };
        let mut ctx = ExecutionContext::new(graph, Arc::clone(&self.services), options);
        if let Some(records) = resume {
            ctx = ctx.with_resume(records);
        }

        let span = tracing::info_span!("workflow_run", instance_id = %instance.id, workflow_id = %workflow_id);
        let result = ctx.run(start, payload).instrument(span).await;
        drop(tracked);
        instance.steps += result.steps;

        let records = result.node_records(&workflow_id, &instance.id, instance.source);
        if let Err(err) = self.repo.save_instance_nodes(&records).await {
            self.mark_failed(&mut instance, format!("saving node records: {err}"))
                .await;
            return Err(err.into());
        }

        instance.status = result.outcome.instance_status();
        instance.paused_node_id = result.paused_node_id.clone();
        instance.resume_node_id = result.resume_node_id.clone();
        instance.failed_node_id = result.failed_node_id.clone();
        instance.error = result.error.as_ref().map(ToString::to_string);
        if instance.status.is_terminal() {
            instance.completed_at = Some(Utc::now());
        }
        if let Err(err) = self.repo.update_instance(&instance).await {
            tracing::error!(instance_id = %instance.id, error = %err, "failed to store run outcome");
            return Err(err.into());
        }

        self.publish_outcome(&instance, &result);
        Ok(RunReport { instance, result })
    }

    /// Best-effort: leave the instance failed rather than running.
    async fn mark_failed(&self, instance: &mut WorkflowInstance, error: String) {
        tracing::error!(instance_id = %instance.id, %error, "run could not be persisted");
        instance.status = InstanceStatus::Failed;
        instance.paused_node_id = None;
        instance.resume_node_id = None;
        instance.error = Some(error);
        instance.completed_at = Some(Utc::now());
        if let Err(err) = self.repo.update_instance(instance).await {
            tracing::error!(instance_id = %instance.id, error = %err, "failed to mark instance failed");
        }
    }

    fn publish_outcome(&self, instance: &WorkflowInstance, result: &ExecutionResult) {
        let instance_id = instance.id.clone();
        let error = instance.error.clone().unwrap_or_default();
        let event = match result.outcome {
            RunOutcome::Completed => WorkflowEvent::RunCompleted {
                instance_id,
                workflow_id: instance.workflow_id.clone(),
                steps: result.steps,
            },
            RunOutcome::Failed => WorkflowEvent::RunFailed {
                instance_id,
                workflow_id: instance.workflow_id.clone(),
                node_id: result.failed_node_id.clone(),
                error,
            },
            RunOutcome::Paused => WorkflowEvent::RunPaused {
                instance_id,
                node_id: result.paused_node_id.clone().unwrap_or_default(),
                reason: result.pause_reason.clone().unwrap_or_default(),
            },
            RunOutcome::Aborted => WorkflowEvent::RunAborted {
                instance_id,
                node_id: result.failed_node_id.clone(),
                reason: error,
            },
        };
        tracing::info!(
            instance_id = %instance.id,
            outcome = ?result.outcome,
            steps = result.steps,
            "run attempt finished"
        );
        self.events.publish(event);
    }
}

/// Keeps a run's cancellation token registered until dropped.
struct CancelGuard<'a> {
    cancels: &'a DashMap<String, CancellationToken>,
    instance_id: String,
}

impl<'a> CancelGuard<'a> {
    fn track(
        cancels: &'a DashMap<String, CancellationToken>,
        instance_id: &str,
        token: CancellationToken,
    ) -> Self {
        cancels.insert(instance_id.to_string(), token);
        Self {
            cancels,
            instance_id: instance_id.to_string(),
        }
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        self.cancels.remove(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{
        HandlerMetadata, InputSchema, NodeContext, NodeHandler, NodeOutput, PreFilterProvider,
        SpecInfo, TriggerPolicy,
    };
    use crate::test_support::*;
    use crate::workflow::apply::WorkflowApplier;
    use serde_json::json;
    use waypoint_types::workflow::NodeType;

    /// Trigger that only accepts payloads whose `action` matches its own.
    struct ActionTrigger;

    impl NodeHandler for ActionTrigger {
        fn metadata(&self) -> HandlerMetadata {
            HandlerMetadata::new("forge#issue", InputSchema::Fields)
        }

        async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::Value(ctx.input().clone()))
        }

        fn as_pre_filter_provider(&self) -> Option<&dyn PreFilterProvider> {
            Some(self)
        }
    }

    impl PreFilterProvider for ActionTrigger {
        fn pre_filter(&self, payload: &Value, input_fields: &Value) -> Result<bool, NodeError> {
            Ok(payload["action"] == input_fields["action"])
        }
    }

    fn shared_registry() -> Arc<NodeRegistry> {
        let mut registry = registry();
        registry
            .register(
                SpecInfo::trigger("forge#issue", TriggerPolicy::EnableAtFirst),
                || ActionTrigger,
            )
            .unwrap();
        Arc::new(registry)
    }

    fn runner(repo: &InMemoryRepository) -> WorkflowRunner<InMemoryRepository> {
        let config = EngineConfig {
            authorized_confirmers: vec!["ops@example.com".to_string()],
            ..Default::default()
        };
        WorkflowRunner::new(repo.clone(), shared_registry(), &config)
    }

    async fn stored(repo: &InMemoryRepository, wf: Workflow) -> String {
        let applier = WorkflowApplier::new(repo.clone(), shared_registry());
        applier.apply(wf).await.unwrap().workflow.id
    }

    fn gated() -> Workflow {
        workflow(vec![
            trigger("hook", "gate"),
            confirm_node("gate", "deploy?", 60, json!(["ops@example.com"]), "after"),
            actor("after", ""),
        ])
    }

    fn statuses(repo: &InMemoryRepository, instance_id: &str) -> Vec<(String, NodeRunStatus)> {
        repo.state()
            .nodes
            .iter()
            .filter(|n| n.workflow_instance_id == instance_id)
            .map(|n| (n.node_id.clone(), n.status))
            .collect()
    }

    #[tokio::test]
    async fn test_start_persists_instance_and_records() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, workflow(vec![trigger("hook", "send"), actor("send", "")])).await;

        let report = runner(&repo)
            .start(&wf_id, RunSource::Manual, Some(json!({"user": "ana"})))
            .await
            .unwrap();
        assert_eq!(report.result.outcome, RunOutcome::Completed);

        let instance = repo.get_instance(&report.instance.id).await.unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.steps, 2);
        assert!(instance.completed_at.is_some());
        assert_eq!(instance.trigger_payload, Some(json!({"user": "ana"})));
        assert_eq!(statuses(&repo, &instance.id).len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_pause_then_approve() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated()).await;
        let runner = runner(&repo);

        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();
        let instance_id = paused.instance.id.clone();
        assert_eq!(paused.instance.status, InstanceStatus::Paused);
        assert_eq!(paused.instance.paused_node_id.as_deref(), Some("gate"));
        assert_eq!(repo.list_pending_confirms().await.unwrap().len(), 1);

        let done = runner
            .decide(&instance_id, "gate", ConfirmDecision::Approved, "Ops@Example.com")
            .await
            .unwrap();
        assert_eq!(done.instance.status, InstanceStatus::Completed);
        assert_eq!(done.instance.steps, 2 + 2);
        assert_eq!(
            statuses(&repo, &instance_id),
            vec![
                ("hook".to_string(), NodeRunStatus::Completed),
                ("gate".to_string(), NodeRunStatus::Completed),
                ("after".to_string(), NodeRunStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_while_pending_keeps_single_record() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated()).await;
        let runner = runner(&repo);

        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();
        let again = runner.resume(&paused.instance.id).await.unwrap();
        assert_eq!(again.instance.status, InstanceStatus::Paused);

        let gate_records = statuses(&repo, &paused.instance.id)
            .into_iter()
            .filter(|(id, _)| id == "gate")
            .count();
        assert_eq!(gate_records, 1);
    }

    fn gated_loop() -> Workflow {
        let mut hook = trigger("hook", "loop");
        hook.data.input_fields = json!({"hosts": ["web-1", "web-2"]});
        let mut restart = actor("restart", "gate");
        restart.data.input_fields = json!({"host": "{{ iter.item }}"});
        workflow(vec![
            hook,
            foreach_node("loop", "{{ node.hook.output.hosts }}", "restart", "after"),
            restart,
            confirm_node("gate", "continue rollout?", 60, json!(["ops@example.com"]), ""),
            actor("after", ""),
        ])
    }

    #[tokio::test]
    async fn test_confirm_inside_foreach_resumes_through_loop() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated_loop()).await;
        let runner = runner(&repo);

        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();
        let instance_id = paused.instance.id.clone();
        assert_eq!(paused.instance.status, InstanceStatus::Paused);
        assert_eq!(paused.instance.paused_node_id.as_deref(), Some("gate"));
        assert_eq!(paused.instance.resume_node_id.as_deref(), Some("loop"));
        assert!(paused.instance.error.is_none());

        let done = runner
            .decide(&instance_id, "gate", ConfirmDecision::Approved, "ops@example.com")
            .await
            .unwrap();
        assert_eq!(done.instance.status, InstanceStatus::Completed, "{:?}", done.instance.error);
        assert!(done.instance.resume_node_id.is_none());

        let records = statuses(&repo, &instance_id);
        assert!(records.iter().all(|(_, status)| *status == NodeRunStatus::Completed));
        let restarts = records.iter().filter(|(id, _)| id == "restart").count();
        assert_eq!(restarts, 2);
        assert_eq!(records.iter().filter(|(id, _)| id == "loop").count(), 1);
        assert!(records.iter().any(|(id, _)| id == "after"));

        let looped = repo
            .list_instance_nodes(&instance_id)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.node_id == "loop")
            .unwrap();
        assert_eq!(looped.output["results"][1]["restart"]["host"], "web-2");
    }

    #[tokio::test]
    async fn test_resume_keeps_paused_records_when_graph_cannot_build() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated()).await;
        let runner = runner(&repo);
        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();

        repo.state()
            .workflows
            .get_mut(&wf_id)
            .unwrap()
            .nodes
            .push(node("ghost", "gone#away", NodeType::Actor, "", json!({})));

        let err = runner.resume(&paused.instance.id).await.unwrap_err();
        assert!(matches!(err, RunnerError::Registry(RegistryError::UnknownClass(_))));
        assert!(statuses(&repo, &paused.instance.id)
            .contains(&("gate".to_string(), NodeRunStatus::Paused)));
        assert!(runner.cancels.is_empty());
    }

    #[tokio::test]
    async fn test_unsaved_records_fail_instance_and_release_token() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, workflow(vec![trigger("hook", "send"), actor("send", "")])).await;
        let runner = runner(&repo);
        repo.state().fail_node_saves = true;

        let err = runner
            .start(&wf_id, RunSource::Manual, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Repository(RepositoryError::Connection)));
        assert!(runner.cancels.is_empty());

        let state = repo.state();
        let instance = state.instances.values().next().unwrap();
        assert_eq!(instance.status, InstanceStatus::Failed);
        assert!(instance.completed_at.is_some());
        assert!(instance
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("saving node records")));
    }

    #[tokio::test]
    async fn test_decline_fails_instance() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated()).await;
        let runner = runner(&repo);

        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();
        let failed = runner
            .decide(&paused.instance.id, "gate", ConfirmDecision::Declined, "ops@example.com")
            .await
            .unwrap();
        assert_eq!(failed.instance.status, InstanceStatus::Failed);
        assert_eq!(failed.instance.failed_node_id.as_deref(), Some("gate"));

        let gate = repo
            .list_instance_nodes(&paused.instance.id)
            .await
            .unwrap()
            .into_iter()
            .find(|n| n.node_id == "gate")
            .unwrap();
        assert_eq!(gate.status, NodeRunStatus::Failed);
        assert_eq!(gate.output["decision"], "declined");
        assert!(repo
            .state()
            .nodes
            .iter()
            .all(|n| n.node_id != "after"));
    }

    #[tokio::test]
    async fn test_decide_rejects_outsiders_and_pending() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, gated()).await;
        let runner = runner(&repo);
        let paused = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();

        let err = runner
            .decide(&paused.instance.id, "gate", ConfirmDecision::Approved, "eve@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::NotAConfirmer { .. }));

        let err = runner
            .decide(&paused.instance.id, "gate", ConfirmDecision::Pending, "ops@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidDecision(_)));
    }

    #[tokio::test]
    async fn test_resume_requires_paused_instance() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, workflow(vec![trigger("hook", "")])).await;
        let runner = runner(&repo);
        let report = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();

        let err = runner.resume(&report.instance.id).await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::NotPaused {
                status: InstanceStatus::Completed,
                ..
            }
        ));
        assert!(matches!(
            runner.resume("missing").await.unwrap_err(),
            RunnerError::InstanceNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_trigger_respects_status_and_pre_filter() {
        let repo = InMemoryRepository::new();
        let hook = node("hook", "forge#issue", NodeType::Trigger, "send", json!({"action": "opened"}));
        let wf_id = stored(&repo, workflow(vec![hook, actor("send", "")])).await;
        let runner = runner(&repo);

        assert!(runner
            .trigger(&wf_id, json!({"action": "closed"}))
            .await
            .unwrap()
            .is_none());
        let report = runner
            .trigger(&wf_id, json!({"action": "opened"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.instance.source, RunSource::Trigger);
        assert_eq!(report.result.outcome, RunOutcome::Completed);

        repo.update_workflow_status(&wf_id, WorkflowStatus::Disabled)
            .await
            .unwrap();
        assert!(matches!(
            runner.trigger(&wf_id, json!({})).await.unwrap_err(),
            RunnerError::Disabled(_)
        ));
    }

    #[tokio::test]
    async fn test_preview_runs_one_node_without_writes() {
        let repo = InMemoryRepository::new();
        let runner = runner(&repo);
        let mut hook = trigger("hook", "send");
        hook.data.input_fields = json!({"sample": 1});
        let wf = workflow(vec![hook, actor("send", "")]);

        let result = runner.preview(&wf, "hook").await.unwrap();
        assert_eq!(result.steps, 1);
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.record("hook").unwrap().output, json!({"sample": 1}));
        assert!(repo.state().instances.is_empty());
    }

    #[tokio::test]
    async fn test_run_events_and_cancel_of_idle_instance() {
        let repo = InMemoryRepository::new();
        let wf_id = stored(&repo, workflow(vec![trigger("hook", "")])).await;
        let runner = runner(&repo);
        let mut rx = runner.subscribe();

        let report = runner.start(&wf_id, RunSource::Manual, None).await.unwrap();
        assert!(!runner.cancel(&report.instance.id));

        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                WorkflowEvent::RunStarted { resumed, .. } => saw_started = !resumed,
                WorkflowEvent::RunCompleted { steps, .. } => saw_completed = steps == 1,
                _ => {}
            }
        }
        assert!(saw_started);
        assert!(saw_completed);
    }
}
