//! Node implementations and their capabilities.
//!
//! Every node class is implemented by a [`NodeHandler`]. Beyond running,
//! a handler may expose optional capabilities through capability queries
//! (`as_provisioner`, `as_trigger_provider`, ...); the engine asks for a
//! capability and gets `None` when the handler does not offer it.
//!
//! Storage in the registry uses the boxed-trait pattern:
//! 1. Define an object-safe `NodeHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `NodeHandlerDyn` for all `T: NodeHandler`
//! 3. `BoxNodeHandler` wraps `Box<dyn NodeHandlerDyn>` and delegates

pub mod context;
pub mod provision;
pub mod registry;

use std::future::Future;
use std::pin::Pin;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::Node;

use crate::workflow::compare::CompareError;
use crate::workflow::execution::ExecutionError;
use crate::workflow::expression::ExpressionError;

pub use context::NodeContext;
pub use provision::{Authorizer, ConfirmStore, Notifier, ProvisionDeps, Provisioner};
pub use registry::{NodeRegistry, RegistryError, SpecInfo, TriggerPolicy};

// ---------------------------------------------------------------------------
// Outcome and errors
// ---------------------------------------------------------------------------

/// Result of running a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// The node finished and produced this output.
    Value(Value),
    /// The node is waiting on something outside the run; the run pauses at
    /// this node and resumes by re-running it.
    Paused { reason: String },
}

/// Errors a node can fail with.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("input binding failed: {0}")]
    Input(String),

    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error("subflow failed: {0}")]
    Subflow(Box<ExecutionError>),

    #[error("cancelled")]
    Cancelled,

    #[error("declined{}", .decided_by.as_deref().map(|by| format!(" by {by}")).unwrap_or_default())]
    Declined { decided_by: Option<String> },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ExecutionError> for NodeError {
    fn from(err: ExecutionError) -> Self {
        NodeError::Subflow(Box::new(err))
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// How the engine binds a node's input before running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSchema {
    /// The node binds itself from its raw, unevaluated input fields.
    Any,
    /// Every string leaf of the input fields is resolved against the scope.
    Fields,
}

/// Static description of a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerMetadata {
    pub class: String,
    pub input_schema: InputSchema,
}

impl HandlerMetadata {
    pub fn new(class: impl Into<String>, input_schema: InputSchema) -> Self {
        Self {
            class: class.into(),
            input_schema,
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What a trigger provider gets when its trigger is activated.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub workflow_id: String,
    pub node: Node,
    /// Configuration stored from a previous activation, if any.
    pub existing_config: Value,
}

/// Manages the external lifecycle of a trigger (e.g. a webhook).
pub trait TriggerProvider: Send + Sync {
    /// Register the trigger externally; returns the config to store.
    fn create<'a>(&'a self, request: &'a TriggerRequest) -> BoxFuture<'a, Result<Value, NodeError>>;

    /// Remove the external registration.
    fn delete<'a>(&'a self, request: &'a TriggerRequest) -> BoxFuture<'a, Result<(), NodeError>>;

    /// Default configuration for a trigger that has not been created yet.
    fn config_object(&self) -> Value;
}

/// Produces representative output without side effects (used by preview).
pub trait SampleProvider: Send + Sync {
    fn sample<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, Result<Value, NodeError>>;
}

/// A paginated lookup of selectable values for a dynamic input field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldQuery {
    pub field: String,
    #[serde(default)]
    pub search: String,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldQueryPage {
    pub items: Vec<FieldOption>,
    /// Page to request next, `None` on the last page.
    pub next_page: Option<u32>,
}

/// Answers dynamic input-field lookups.
pub trait QueryFieldResultProvider: Send + Sync {
    fn query_field<'a>(
        &'a self,
        query: &'a FieldQuery,
    ) -> BoxFuture<'a, Result<FieldQueryPage, NodeError>>;
}

/// Decides whether an incoming trigger payload should start a run.
pub trait PreFilterProvider: Send + Sync {
    fn pre_filter(&self, payload: &Value, input_fields: &Value) -> Result<bool, NodeError>;
}

// ---------------------------------------------------------------------------
// NodeHandler
// ---------------------------------------------------------------------------

/// Implementation of one node class.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition). Capability
/// queries default to `None`.
pub trait NodeHandler: Send + Sync {
    fn metadata(&self) -> HandlerMetadata;

    /// Execute the node against its bound input.
    fn run(
        &self,
        ctx: &mut NodeContext<'_>,
    ) -> impl Future<Output = Result<NodeOutput, NodeError>> + Send;

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        None
    }

    fn as_trigger_provider(&self) -> Option<&dyn TriggerProvider> {
        None
    }

    fn as_sample_provider(&self) -> Option<&dyn SampleProvider> {
        None
    }

    fn as_query_field_provider(&self) -> Option<&dyn QueryFieldResultProvider> {
        None
    }

    fn as_pre_filter_provider(&self) -> Option<&dyn PreFilterProvider> {
        None
    }
}

/// Object-safe version of [`NodeHandler`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch. A blanket
/// implementation is provided for all types implementing `NodeHandler`.
pub trait NodeHandlerDyn: Send + Sync {
    fn metadata(&self) -> HandlerMetadata;

    fn run_boxed<'a>(
        &'a self,
        ctx: &'a mut NodeContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>>;

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner>;
    fn as_trigger_provider(&self) -> Option<&dyn TriggerProvider>;
    fn as_sample_provider(&self) -> Option<&dyn SampleProvider>;
    fn as_query_field_provider(&self) -> Option<&dyn QueryFieldResultProvider>;
    fn as_pre_filter_provider(&self) -> Option<&dyn PreFilterProvider>;
}

impl<T: NodeHandler> NodeHandlerDyn for T {
    fn metadata(&self) -> HandlerMetadata {
        NodeHandler::metadata(self)
    }

    fn run_boxed<'a>(
        &'a self,
        ctx: &'a mut NodeContext<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<NodeOutput, NodeError>> + Send + 'a>> {
        Box::pin(self.run(ctx))
    }

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        NodeHandler::as_provisioner(self)
    }

    fn as_trigger_provider(&self) -> Option<&dyn TriggerProvider> {
        NodeHandler::as_trigger_provider(self)
    }

    fn as_sample_provider(&self) -> Option<&dyn SampleProvider> {
        NodeHandler::as_sample_provider(self)
    }

    fn as_query_field_provider(&self) -> Option<&dyn QueryFieldResultProvider> {
        NodeHandler::as_query_field_provider(self)
    }

    fn as_pre_filter_provider(&self) -> Option<&dyn PreFilterProvider> {
        NodeHandler::as_pre_filter_provider(self)
    }
}

/// Type-erased node handler stored in the registry and the runtime graph.
pub struct BoxNodeHandler {
    inner: Box<dyn NodeHandlerDyn + Send + Sync>,
}

impl BoxNodeHandler {
    pub fn new<T: NodeHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn metadata(&self) -> HandlerMetadata {
        self.inner.metadata()
    }

    pub async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        self.inner.run_boxed(ctx).await
    }

    pub fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        self.inner.as_provisioner()
    }

    pub fn as_trigger_provider(&self) -> Option<&dyn TriggerProvider> {
        self.inner.as_trigger_provider()
    }

    pub fn as_sample_provider(&self) -> Option<&dyn SampleProvider> {
        self.inner.as_sample_provider()
    }

    pub fn as_query_field_provider(&self) -> Option<&dyn QueryFieldResultProvider> {
        self.inner.as_query_field_provider()
    }

    pub fn as_pre_filter_provider(&self) -> Option<&dyn PreFilterProvider> {
        self.inner.as_pre_filter_provider()
    }
}

impl std::fmt::Debug for BoxNodeHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxNodeHandler")
            .field("class", &self.inner.metadata().class)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Generic handlers
// ---------------------------------------------------------------------------

/// Passes its bound input through as output. As a trigger the input is the
/// trigger payload; as an actor it echoes its resolved input fields.
#[derive(Debug, Clone)]
pub struct Passthrough {
    class: String,
}

impl Passthrough {
    pub fn new(class: impl Into<String>) -> Self {
        Self { class: class.into() }
    }
}

impl NodeHandler for Passthrough {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(self.class.clone(), InputSchema::Fields)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Value(ctx.input().clone()))
    }

    fn as_sample_provider(&self) -> Option<&dyn SampleProvider> {
        Some(self)
    }
}

impl SampleProvider for Passthrough {
    fn sample<'a>(&'a self, node: &'a Node) -> BoxFuture<'a, Result<Value, NodeError>> {
        Box::pin(async move { Ok(node.data.input_fields.clone()) })
    }
}

/// Actor that stores each bound input field as a user variable (`var.*`)
/// and outputs the fields it stored.
#[derive(Debug, Clone)]
pub struct SetVariables {
    class: String,
}

impl SetVariables {
    pub fn new(class: impl Into<String>) -> Self {
        Self { class: class.into() }
    }
}

impl NodeHandler for SetVariables {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(self.class.clone(), InputSchema::Fields)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        let Value::Object(fields) = ctx.input().clone() else {
            return Err(NodeError::Config(
                "input fields must be an object of variable names".to_string(),
            ));
        };
        for (name, value) in &fields {
            ctx.scope().set_var(name, value.clone());
        }
        tracing::debug!(node_id = %ctx.node_id(), count = fields.len(), "variables set");
        Ok(NodeOutput::Value(Value::Object(fields)))
    }
}
