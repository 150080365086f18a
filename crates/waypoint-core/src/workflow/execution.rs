//! The stepped workflow interpreter.
//!
//! An [`ExecutionContext`] walks a [`WorkflowGraph`] one node per step:
//! resolve the current node, check cancellation, charge the step budget,
//! bind input, run the handler, store the output in the scope, then follow
//! the node's transition unless a control-flow node took control.
//!
//! Runs end in one of four outcomes ([`RunOutcome`]). Failures carry the ID
//! of the innermost failing node, including nodes inside subflows. Panics in
//! handlers are caught and reported as failures.
//!
//! A pause inside a subflow pauses every enclosing node up to the top-level
//! flow. The result names both the innermost paused node (what the run waits
//! on) and the top-level node a resume restarts from. Enclosing nodes store
//! their progress as the output of their paused record; on resume that output
//! is handed back to them through [`NodeContext::take_resume_state`].
//!
//! [`NodeContext::take_resume_state`]: crate::node::NodeContext::take_resume_state

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    new_id, InstanceStatus, Node, NodeRunStatus, RunSource, Workflow, WorkflowInstanceNode,
};

use super::compare::{Comparator, DefaultComparator};
use super::expression::{resolve_value, Evaluator, JexlEvaluator};
use super::instance::NodeInstance;
use super::scope::{NodeIo, Scope, ScopeData};
use crate::event::EventBus;
use crate::node::{
    BoxNodeHandler, InputSchema, NodeContext, NodeError, NodeOutput, NodeRegistry, ProvisionDeps,
    RegistryError,
};

/// Default step budget of a top-level run.
pub const DEFAULT_MAX_STEPS: u32 = 100;

// ---------------------------------------------------------------------------
// Errors and results
// ---------------------------------------------------------------------------

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("node '{node_id}' ({class}) failed: {source}")]
    Node {
        node_id: String,
        class: String,
        #[source]
        source: NodeError,
    },

    #[error("step budget of {budget} exceeded at node '{node_id}'")]
    StepBudgetExceeded { node_id: String, budget: u32 },

    #[error("run cancelled before node '{node_id}'")]
    Cancelled { node_id: String },

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{node_id}' panicked: {message}")]
    Panicked { node_id: String, message: String },
}

impl ExecutionError {
    /// The innermost error, looking through failed subflows.
    pub fn root_cause(&self) -> &ExecutionError {
        match self {
            ExecutionError::Node {
                source: NodeError::Subflow(inner),
                ..
            } => inner.root_cause(),
            other => other,
        }
    }

    /// ID of the innermost failing node.
    pub fn node_id(&self) -> Option<&str> {
        match self.root_cause() {
            ExecutionError::Node { node_id, .. }
            | ExecutionError::StepBudgetExceeded { node_id, .. }
            | ExecutionError::Cancelled { node_id }
            | ExecutionError::Panicked { node_id, .. } => Some(node_id),
            ExecutionError::NodeNotFound(id) => Some(id),
        }
    }

    /// Whether the run was stopped (budget or cancellation) rather than
    /// failed by a node.
    pub fn is_abort(&self) -> bool {
        matches!(
            self.root_cause(),
            ExecutionError::StepBudgetExceeded { .. }
                | ExecutionError::Cancelled { .. }
                | ExecutionError::Node {
                    source: NodeError::Cancelled,
                    ..
                }
        )
    }
}

/// Final state of a run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Paused,
    Aborted,
}

impl RunOutcome {
    pub fn instance_status(&self) -> InstanceStatus {
        match self {
            RunOutcome::Completed => InstanceStatus::Completed,
            RunOutcome::Failed => InstanceStatus::Failed,
            RunOutcome::Paused => InstanceStatus::Paused,
            RunOutcome::Aborted => InstanceStatus::Aborted,
        }
    }
}

/// Everything a top-level run produced.
#[derive(Debug)]
pub struct ExecutionResult {
    pub outcome: RunOutcome,
    pub steps: u32,
    pub failed_node_id: Option<String>,
    /// Innermost node the run waits on.
    pub paused_node_id: Option<String>,
    /// Top-level node to resume from.
    pub resume_node_id: Option<String>,
    pub pause_reason: Option<String>,
    pub error: Option<ExecutionError>,
    /// Node executions of this attempt, including those of subflows.
    pub records: Vec<NodeInstance>,
}

/// How a subflow ended when it did not fail.
#[derive(Debug)]
pub enum SubflowEnd {
    /// The flow ran to its end. Holds the node data it wrote.
    Completed(BTreeMap<String, NodeIo>),
    /// A node of the flow paused. `node_id` is the node of this flow to
    /// restart from; `written` is the node data written before the pause.
    Paused {
        node_id: String,
        reason: String,
        written: BTreeMap<String, NodeIo>,
    },
}

impl ExecutionResult {
    /// Persistable node records for this attempt.
    pub fn node_records(
        &self,
        workflow_id: &str,
        instance_id: &str,
        source: RunSource,
    ) -> Vec<WorkflowInstanceNode> {
        self.records
            .iter()
            .filter_map(|r| r.to_record(workflow_id, instance_id, source))
            .collect()
    }

    pub fn record(&self, node_id: &str) -> Option<&NodeInstance> {
        self.records.iter().find(|r| r.node_id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Graph and services
// ---------------------------------------------------------------------------

/// A node definition with its provisioned handler.
#[derive(Debug)]
pub struct GraphNode {
    pub definition: Node,
    pub handler: BoxNodeHandler,
}

/// Runtime graph: every node of a workflow bound to a handler.
#[derive(Debug)]
pub struct WorkflowGraph {
    workflow_id: String,
    start_node_id: String,
    nodes: HashMap<String, GraphNode>,
}

impl WorkflowGraph {
    /// Create a handler for every node and provision those that ask for it.
    pub fn build(
        workflow: &Workflow,
        registry: &NodeRegistry,
        deps: &ProvisionDeps,
    ) -> Result<Self, RegistryError> {
        let mut nodes = HashMap::with_capacity(workflow.nodes.len());
        for node in &workflow.nodes {
            let mut handler = registry.create(&node.class)?;
            if let Some(provisioner) = handler.as_provisioner() {
                provisioner.provision(deps);
            }
            nodes.insert(
                node.id.clone(),
                GraphNode {
                    definition: node.clone(),
                    handler,
                },
            );
        }
        Ok(Self {
            workflow_id: workflow.id.clone(),
            start_node_id: workflow.start_node_id.clone(),
            nodes,
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn start_node_id(&self) -> &str {
        &self.start_node_id
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Pluggable services shared by every context of a run.
#[derive(Clone)]
pub struct ExecutionServices {
    pub evaluator: Arc<dyn Evaluator>,
    pub comparator: Arc<dyn Comparator>,
    pub events: Option<EventBus>,
}

impl ExecutionServices {
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }
}

impl Default for ExecutionServices {
    fn default() -> Self {
        Self {
            evaluator: Arc::new(JexlEvaluator::new()),
            comparator: Arc::new(DefaultComparator::new()),
            events: None,
        }
    }
}

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub instance_id: String,
    pub source: RunSource,
    pub max_steps: u32,
    /// Execute exactly one node (preview).
    pub single_step: bool,
    pub cancel: CancellationToken,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            instance_id: new_id(),
            source: RunSource::Manual,
            max_steps: DEFAULT_MAX_STEPS,
            single_step: false,
            cancel: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

enum LoopEnd {
    Completed,
    Paused { node_id: String, reason: String },
}

/// Interpreter state for one (sub)flow.
pub struct ExecutionContext {
    graph: Arc<WorkflowGraph>,
    services: Arc<ExecutionServices>,
    options: ExecutionOptions,
    scope: Scope,
    instances: HashMap<String, NodeInstance>,
    order: Vec<String>,
    /// Records of subflows, keyed by the node that spawned them.
    absorbed: Vec<(String, Vec<NodeInstance>)>,
    /// Outputs of nodes paused by an earlier attempt, by node ID.
    resume_state: HashMap<String, Value>,
    /// Innermost paused node of the current step, set by a paused subflow.
    inner_pause: Option<String>,
    steps: u32,
    budget: u32,
    current_node: String,
    next_node: String,
    control_taken: bool,
    is_subflow: bool,
}

impl ExecutionContext {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        services: Arc<ExecutionServices>,
        options: ExecutionOptions,
    ) -> Self {
        let budget = options.max_steps;
        Self {
            graph,
            services,
            options,
            scope: Scope::new().clone_proxy(),
            instances: HashMap::new(),
            order: Vec::new(),
            absorbed: Vec::new(),
            resume_state: HashMap::new(),
            inner_pause: None,
            steps: 0,
            budget,
            current_node: String::new(),
            next_node: String::new(),
            control_taken: false,
            is_subflow: false,
        }
    }

    /// Replay records of earlier attempts: completed nodes are restored into
    /// the scope and their instances marked as replayed. Outputs of paused
    /// records become resume state for the nodes that re-run.
    pub fn with_resume(mut self, records: &[WorkflowInstanceNode]) -> Self {
        let mut data = ScopeData::default();
        for record in records {
            if record.status == NodeRunStatus::Paused {
                if !record.output.is_null() {
                    self.resume_state
                        .insert(record.node_id.clone(), record.output.clone());
                }
                continue;
            }
            if record.status != NodeRunStatus::Completed {
                continue;
            }
            data.node.insert(
                record.node_id.clone(),
                NodeIo {
                    input: record.input.clone(),
                    output: record.output.clone(),
                },
            );
            self.instances
                .insert(record.node_id.clone(), NodeInstance::from_record(record));
        }
        tracing::debug!(
            instance_id = %self.options.instance_id,
            replayed = data.node.len(),
            "rehydrated scope"
        );
        self.scope = Scope::from_data(data).clone_proxy();
        self
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub(crate) fn services(&self) -> &ExecutionServices {
        &self.services
    }

    pub(crate) fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub(crate) fn workflow_id(&self) -> &str {
        self.graph.workflow_id()
    }

    /// Preview run: samples instead of side effects, subflows included.
    pub(crate) fn is_preview(&self) -> bool {
        self.options.single_step
    }

    /// Progress a paused node stored in an earlier attempt. Handed out once.
    pub(crate) fn take_resume_state(&mut self, node_id: &str) -> Option<Value> {
        self.resume_state.remove(node_id)
    }

    /// Override linear advance for the current step. `None` ends the flow.
    pub(crate) fn take_control(&mut self, next: Option<&str>) {
        self.control_taken = true;
        self.next_node = next.unwrap_or_default().to_string();
    }

    /// Run from `start` until the flow ends. `input` is bound as the first
    /// node's input instead of its templates (trigger payload).
    pub async fn run(mut self, start: &str, input: Option<Value>) -> ExecutionResult {
        if self.graph.is_empty() {
            return self.finish(Ok(LoopEnd::Completed));
        }

        tracing::debug!(
            instance_id = %self.options.instance_id,
            workflow_id = %self.graph.workflow_id(),
            start,
            budget = self.budget,
            "starting run"
        );

        let caught = AssertUnwindSafe(self.run_loop(start, input))
            .catch_unwind()
            .await;
        let result = match caught {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::Panicked {
                node_id: self.current_node.clone(),
                message: panic_message(panic.as_ref()),
            }),
        };
        self.finish(result)
    }

    /// Run `start` as a nested flow sharing this context's graph.
    ///
    /// The child works through a proxy of this scope with the remaining step
    /// budget. It returns the node data the child wrote, or where it paused;
    /// its steps and records are absorbed either way. A paused child makes
    /// the calling node responsible for pausing too.
    pub fn run_subflow<'a>(
        &'a mut self,
        start: &'a str,
    ) -> BoxFuture<'a, Result<SubflowEnd, ExecutionError>> {
        Box::pin(async move {
            let mut child = ExecutionContext {
                graph: Arc::clone(&self.graph),
                services: Arc::clone(&self.services),
                options: self.options.clone(),
                scope: self.scope.clone_proxy(),
                instances: HashMap::new(),
                order: Vec::new(),
                absorbed: Vec::new(),
                resume_state: std::mem::take(&mut self.resume_state),
                inner_pause: None,
                steps: 0,
                budget: self.budget.saturating_sub(self.steps),
                current_node: String::new(),
                next_node: String::new(),
                control_taken: false,
                is_subflow: true,
            };
            tracing::debug!(
                start,
                depth = child.scope.depth(),
                budget = child.budget,
                "running subflow"
            );

            let result = child.run_loop(start, None).await;
            self.steps += child.steps;
            self.resume_state = std::mem::take(&mut child.resume_state);
            let records = child.collect_records();
            self.absorbed.push((self.current_node.clone(), records));

            match result {
                Ok(LoopEnd::Completed) => Ok(SubflowEnd::Completed(child.scope.diff_node_data())),
                Ok(LoopEnd::Paused { node_id, reason }) => {
                    self.inner_pause = Some(child.inner_pause.take().unwrap_or(node_id.clone()));
                    Ok(SubflowEnd::Paused {
                        node_id,
                        reason,
                        written: child.scope.diff_node_data(),
                    })
                }
                Err(e) => Err(e),
            }
        })
    }

    async fn run_loop(
        &mut self,
        start: &str,
        mut input: Option<Value>,
    ) -> Result<LoopEnd, ExecutionError> {
        let mut current = start.to_string();
        loop {
            if current.is_empty() {
                return Ok(LoopEnd::Completed);
            }
            if self.options.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled { node_id: current });
            }
            self.steps += 1;
            if self.steps > self.budget {
                return Err(ExecutionError::StepBudgetExceeded {
                    node_id: current,
                    budget: self.budget,
                });
            }

            self.current_node.clone_from(&current);
            let graph = Arc::clone(&self.graph);
            let node = graph
                .node(&current)
                .ok_or_else(|| ExecutionError::NodeNotFound(current.clone()))?;

            if let NodeOutput::Paused { reason } = self.execute_node(node, input.take()).await? {
                return Ok(LoopEnd::Paused {
                    node_id: current,
                    reason,
                });
            }

            if self.is_preview() && !self.is_subflow {
                return Ok(LoopEnd::Completed);
            }
            if self.control_taken {
                self.control_taken = false;
                current = std::mem::take(&mut self.next_node);
            } else {
                current.clone_from(&node.definition.transition);
            }
        }
    }

    async fn execute_node(
        &mut self,
        node: &GraphNode,
        payload: Option<Value>,
    ) -> Result<NodeOutput, ExecutionError> {
        let def = &node.definition;
        let span = tracing::debug_span!("node", node_id = %def.id, class = %def.class, step = self.steps);
        async move {
            self.emit(WorkflowEvent::NodeStarted {
                instance_id: self.options.instance_id.clone(),
                node_id: def.id.clone(),
                class: def.class.clone(),
            });
            if !self.order.iter().any(|id| id == &def.id) {
                self.order.push(def.id.clone());
            }
            self.inner_pause = None;

            let input = match self.bind_input(node, payload) {
                Ok(input) => input,
                Err(err) => {
                    let instance = self.instance_mut(def);
                    instance.begin(Value::Null);
                    return Err(self.node_failed(def, err, None));
                }
            };
            self.instance_mut(def).begin(input.clone());

            let sampler = if self.is_preview() {
                node.handler.as_sample_provider()
            } else {
                None
            };

            let (result, extra_output) = match sampler {
                Some(sampler) => (Ok(sampler.sample(def).await.map(NodeOutput::Value)), None),
                None => {
                    let mut ctx = NodeContext::new(self, def, input.clone());
                    let result = AssertUnwindSafe(node.handler.run(&mut ctx))
                        .catch_unwind()
                        .await;
                    (result, ctx.into_output())
                }
            };

            match result {
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    self.instance_mut(def).fail(&message);
                    self.emit(WorkflowEvent::NodeFailed {
                        instance_id: self.options.instance_id.clone(),
                        node_id: def.id.clone(),
                        error: message.clone(),
                    });
                    tracing::warn!(node_id = %def.id, %message, "node panicked");
                    Err(ExecutionError::Panicked {
                        node_id: def.id.clone(),
                        message,
                    })
                }
                Ok(Ok(NodeOutput::Value(output))) => {
                    self.scope.set_node_data(
                        &def.id,
                        NodeIo {
                            input,
                            output: output.clone(),
                        },
                    );
                    let instance = self.instance_mut(def);
                    instance.complete(output.clone());
                    let duration_ms = instance.duration_ms.max(0) as u64;
                    self.emit(WorkflowEvent::NodeCompleted {
                        instance_id: self.options.instance_id.clone(),
                        node_id: def.id.clone(),
                        duration_ms,
                    });
                    tracing::debug!(duration_ms, "node completed");
                    Ok(NodeOutput::Value(output))
                }
                Ok(Ok(NodeOutput::Paused { reason })) => {
                    let instance = self.instance_mut(def);
                    if let Some(progress) = extra_output {
                        instance.output = progress;
                    }
                    instance.pause(&reason);
                    tracing::info!(node_id = %def.id, %reason, "node paused");
                    Ok(NodeOutput::Paused { reason })
                }
                Ok(Err(err)) => Err(self.node_failed(def, err, extra_output)),
            }
        }
        .instrument(span)
        .await
    }

    fn bind_input(&self, node: &GraphNode, payload: Option<Value>) -> Result<Value, NodeError> {
        if let Some(payload) = payload.filter(|_| !self.is_subflow) {
            return Ok(payload);
        }
        let fields = &node.definition.data.input_fields;
        match node.handler.metadata().input_schema {
            InputSchema::Any => Ok(fields.clone()),
            InputSchema::Fields => resolve_value(
                self.services.evaluator.as_ref(),
                fields,
                &self.scope.read_view(),
            )
            .map_err(|e| NodeError::Input(e.to_string())),
        }
    }

    fn instance_mut(&mut self, def: &Node) -> &mut NodeInstance {
        self.instances
            .entry(def.id.clone())
            .or_insert_with(|| NodeInstance::new(&def.id, &def.class))
    }

    fn node_failed(
        &mut self,
        def: &Node,
        err: NodeError,
        output: Option<Value>,
    ) -> ExecutionError {
        let message = err.to_string();
        let instance = self.instance_mut(def);
        if let Some(output) = output {
            instance.output = output;
        }
        instance.fail(&message);
        self.emit(WorkflowEvent::NodeFailed {
            instance_id: self.options.instance_id.clone(),
            node_id: def.id.clone(),
            error: message.clone(),
        });
        tracing::warn!(node_id = %def.id, error = %message, "node failed");
        ExecutionError::Node {
            node_id: def.id.clone(),
            class: def.class.clone(),
            source: err,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Some(bus) = &self.services.events {
            bus.publish(event);
        }
    }

    fn collect_records(&mut self) -> Vec<NodeInstance> {
        let mut absorbed = std::mem::take(&mut self.absorbed);
        let mut records = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(instance) = self.instances.get(id) {
                if !instance.replayed && instance.status.is_some() {
                    records.push(instance.clone());
                }
            }
            for (parent, nested) in absorbed.iter_mut() {
                if parent == id {
                    records.append(nested);
                }
            }
        }
        records
    }

    fn finish(mut self, result: Result<LoopEnd, ExecutionError>) -> ExecutionResult {
        let mut outcome = RunOutcome::Completed;
        let mut failed_node_id = None;
        let mut paused_node_id = None;
        let mut resume_node_id = None;
        let mut pause_reason = None;
        let mut error = None;

        match result {
            Ok(LoopEnd::Completed) => {}
            Ok(LoopEnd::Paused { node_id, reason }) => {
                outcome = RunOutcome::Paused;
                paused_node_id = Some(self.inner_pause.take().unwrap_or(node_id.clone()));
                resume_node_id = Some(node_id);
                pause_reason = Some(reason);
            }
            Err(err) => {
                outcome = if err.is_abort() {
                    RunOutcome::Aborted
                } else {
                    RunOutcome::Failed
                };
                failed_node_id = err.node_id().map(str::to_string);
                if let ExecutionError::Panicked { node_id, message } = &err {
                    if let Some(instance) = self.instances.get_mut(node_id) {
                        if instance.status.is_none() {
                            instance.fail(message);
                        }
                    }
                }
                error = Some(err);
            }
        }

        tracing::debug!(
            instance_id = %self.options.instance_id,
            ?outcome,
            steps = self.steps,
            "run finished"
        );

        ExecutionResult {
            outcome,
            steps: self.steps,
            failed_node_id,
            paused_node_id,
            resume_node_id,
            pause_reason,
            error,
            records: self.collect_records(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
