//! The view a running node has of its execution context.

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use waypoint_types::workflow::{Node, RunSource};

use super::NodeError;
use crate::workflow::compare::Comparator;
use crate::workflow::execution::{ExecutionContext, ExecutionError, SubflowEnd};
use crate::workflow::expression::{resolve_operand, Evaluator, ExpressionError};
use crate::workflow::scope::Scope;

/// Handed to [`NodeHandler::run`](super::NodeHandler::run).
///
/// Gives access to the bound input, the scope, the pluggable evaluator and
/// comparator, and the control-flow hooks (`take_control`, `run_subflow`)
/// that logic nodes use.
pub struct NodeContext<'a> {
    exec: &'a mut ExecutionContext,
    node: &'a Node,
    input: Value,
    output: Option<Value>,
}

impl<'a> NodeContext<'a> {
    pub(crate) fn new(exec: &'a mut ExecutionContext, node: &'a Node, input: Value) -> Self {
        Self {
            exec,
            node,
            input,
            output: None,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Input as bound by the engine.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Declared input fields, templates unevaluated.
    pub fn raw_input_fields(&self) -> &Value {
        &self.node.data.input_fields
    }

    /// Deserialize the bound input into a typed view.
    pub fn fields<T: DeserializeOwned>(&self) -> Result<T, NodeError> {
        serde_json::from_value(self.input.clone())
            .map_err(|e| NodeError::Config(format!("{}: {e}", self.node.class)))
    }

    pub fn scope(&self) -> &Scope {
        self.exec.scope()
    }

    pub fn evaluator(&self) -> &dyn Evaluator {
        self.exec.services().evaluator.as_ref()
    }

    pub fn comparator(&self) -> &dyn Comparator {
        self.exec.services().comparator.as_ref()
    }

    /// JSON read view of the scope.
    pub fn data(&self) -> Value {
        self.scope().read_view()
    }

    pub fn evaluate(&self, expression: &str) -> Result<Value, ExpressionError> {
        self.scope().evaluate(self.evaluator(), expression)
    }

    /// Evaluate a single `{{ ref }}` to its typed value, render anything
    /// else as text.
    pub fn resolve_operand(&self, text: &str) -> Result<Value, ExpressionError> {
        resolve_operand(self.evaluator(), text, &self.data())
    }

    /// Choose the next node instead of following this node's transition.
    /// `None` ends the current flow after this node.
    pub fn take_control(&mut self, next: Option<&str>) {
        self.exec.take_control(next);
    }

    /// Run a nested flow starting at `start`; see
    /// [`ExecutionContext::run_subflow`].
    pub fn run_subflow<'b>(
        &'b mut self,
        start: &'b str,
    ) -> BoxFuture<'b, Result<SubflowEnd, ExecutionError>> {
        self.exec.run_subflow(start)
    }

    /// Progress this node stored when it paused in an earlier attempt, if
    /// the run is resuming through it. Returns `Some` at most once.
    pub fn take_resume_state(&mut self) -> Option<Value> {
        self.exec.take_resume_state(&self.node.id)
    }

    /// Whether this is a single-step preview run.
    pub fn is_preview(&self) -> bool {
        self.exec.is_preview()
    }

    pub fn is_cancelled(&self) -> bool {
        self.exec.options().cancel.is_cancelled()
    }

    pub fn instance_id(&self) -> &str {
        &self.exec.options().instance_id
    }

    pub fn workflow_id(&self) -> &str {
        self.exec.workflow_id()
    }

    pub fn source(&self) -> RunSource {
        self.exec.options().source
    }

    /// Record an output even if the node goes on to fail.
    pub fn set_output(&mut self, output: Value) {
        self.output = Some(output);
    }

    pub(crate) fn into_output(self) -> Option<Value> {
        self.output
    }
}
