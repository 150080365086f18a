//! Node registry for runtime handler lookup.
//!
//! Maps a node class (`adapter#spec`) to a constructor and the static spec
//! information the apply pipeline needs. The registry is an explicit
//! service: build it once at startup, share it behind an `Arc`, and pass it
//! wherever handlers are created.

use std::collections::HashMap;
use std::sync::Arc;

use waypoint_types::workflow::{CONFIRM_CLASS, FOREACH_CLASS, NodeType, SWITCH_CLASS};

use super::{BoxNodeHandler, FieldQuery, FieldQueryPage, NodeError, NodeHandler};
use crate::logic::{ConfirmNode, ForeachNode, SwitchNode};

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("class '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown node class '{0}'")]
    UnknownClass(String),

    #[error("class '{0}' does not answer field queries")]
    NoQueryFields(String),
}

/// When a trigger registration is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolicy {
    /// Activate on the first apply when credentials allow.
    EnableAtFirst,
    /// Stay inactive until enabled explicitly.
    Manual,
}

/// Static information about a registered class.
#[derive(Debug, Clone, PartialEq)]
pub struct SpecInfo {
    pub class: String,
    pub node_type: NodeType,
    /// Set for trigger classes.
    pub trigger_policy: Option<TriggerPolicy>,
    /// Whether the adapter needs a credential before it can act.
    pub requires_auth: bool,
}

impl SpecInfo {
    pub fn actor(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            node_type: NodeType::Actor,
            trigger_policy: None,
            requires_auth: false,
        }
    }

    pub fn logic(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            node_type: NodeType::Logic,
            trigger_policy: None,
            requires_auth: false,
        }
    }

    pub fn trigger(class: impl Into<String>, policy: TriggerPolicy) -> Self {
        Self {
            class: class.into(),
            node_type: NodeType::Trigger,
            trigger_policy: Some(policy),
            requires_auth: false,
        }
    }

    pub fn with_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }
}

type Constructor = Arc<dyn Fn() -> BoxNodeHandler + Send + Sync>;

struct RegistryEntry {
    constructor: Constructor,
    spec: SpecInfo,
}

/// Registry of node classes, indexed by class.
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in logic nodes (switch, foreach,
    /// confirm).
    pub fn with_logic_nodes() -> Self {
        let mut registry = Self::new();
        registry.insert(SpecInfo::logic(SWITCH_CLASS), SwitchNode::new);
        registry.insert(SpecInfo::logic(FOREACH_CLASS), ForeachNode::new);
        registry.insert(SpecInfo::logic(CONFIRM_CLASS), ConfirmNode::new);
        registry
    }

    /// Register a class. Each call of `constructor` must produce a fresh
    /// handler; one is created per node of every built graph.
    pub fn register<H, F>(&mut self, spec: SpecInfo, constructor: F) -> Result<(), RegistryError>
    where
        H: NodeHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        if self.entries.contains_key(&spec.class) {
            return Err(RegistryError::Duplicate(spec.class));
        }
        self.insert(spec, constructor);
        Ok(())
    }

    fn insert<H, F>(&mut self, spec: SpecInfo, constructor: F)
    where
        H: NodeHandler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        tracing::debug!(class = %spec.class, node_type = %spec.node_type, "registered node class");
        self.entries.insert(
            spec.class.clone(),
            RegistryEntry {
                constructor: Arc::new(move || BoxNodeHandler::new(constructor())),
                spec,
            },
        );
    }

    /// Build a fresh handler for `class`.
    pub fn create(&self, class: &str) -> Result<BoxNodeHandler, RegistryError> {
        self.entries
            .get(class)
            .map(|entry| (entry.constructor)())
            .ok_or_else(|| RegistryError::UnknownClass(class.to_string()))
    }

    pub fn spec(&self, class: &str) -> Option<&SpecInfo> {
        self.entries.get(class).map(|entry| &entry.spec)
    }

    pub fn contains(&self, class: &str) -> bool {
        self.entries.contains_key(class)
    }

    /// Registered classes, sorted.
    pub fn classes(&self) -> Vec<&str> {
        let mut classes: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        classes.sort_unstable();
        classes
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Answer a dynamic field lookup with a fresh handler of `class`.
    pub async fn query_field(
        &self,
        class: &str,
        query: &FieldQuery,
    ) -> Result<FieldQueryPage, QueryFieldError> {
        let handler = self.create(class)?;
        let provider = handler
            .as_query_field_provider()
            .ok_or_else(|| RegistryError::NoQueryFields(class.to_string()))?;
        Ok(provider.query_field(query).await?)
    }
}

/// Errors from [`NodeRegistry::query_field`].
#[derive(Debug, thiserror::Error)]
pub enum QueryFieldError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_logic_nodes()
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FieldOption, Passthrough, QueryFieldResultProvider};
    use crate::node::{HandlerMetadata, InputSchema, NodeContext, NodeOutput};
    use futures_util::future::BoxFuture;
    use serde_json::json;

    struct ChannelPicker;

    impl NodeHandler for ChannelPicker {
        fn metadata(&self) -> HandlerMetadata {
            HandlerMetadata::new("slack#post", InputSchema::Fields)
        }

        async fn run(&self, _ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::Value(json!({})))
        }

        fn as_query_field_provider(&self) -> Option<&dyn QueryFieldResultProvider> {
            Some(self)
        }
    }

    impl QueryFieldResultProvider for ChannelPicker {
        fn query_field<'a>(
            &'a self,
            query: &'a FieldQuery,
        ) -> BoxFuture<'a, Result<FieldQueryPage, NodeError>> {
            Box::pin(async move {
                let all = ["general", "deploys", "random"];
                let items = all
                    .iter()
                    .filter(|c| c.contains(query.search.as_str()))
                    .map(|c| FieldOption {
                        label: format!("#{c}"),
                        value: json!(c),
                    })
                    .collect();
                Ok(FieldQueryPage {
                    items,
                    next_page: None,
                })
            })
        }
    }

    #[test]
    fn test_with_logic_nodes() {
        let registry = NodeRegistry::with_logic_nodes();
        assert_eq!(
            registry.classes(),
            vec![CONFIRM_CLASS, FOREACH_CLASS, SWITCH_CLASS]
        );
        assert_eq!(registry.spec(SWITCH_CLASS).unwrap().node_type, NodeType::Logic);
        assert_eq!(registry.create(FOREACH_CLASS).unwrap().metadata().class, FOREACH_CLASS);
    }

    #[test]
    fn test_builtin_classes_cannot_be_registered_again() {
        let mut registry = NodeRegistry::with_logic_nodes();
        let err = registry
            .register(SpecInfo::logic(CONFIRM_CLASS), || ConfirmNode::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(class) if class == CONFIRM_CLASS));
        assert_eq!(registry.classes().len(), 3);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = NodeRegistry::new();
        registry
            .register(
                SpecInfo::trigger("webhook#receive", TriggerPolicy::EnableAtFirst),
                || Passthrough::new("webhook#receive"),
            )
            .unwrap();
        let err = registry
            .register(SpecInfo::actor("webhook#receive"), || {
                Passthrough::new("webhook#receive")
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn test_unknown_class_and_clear() {
        let mut registry = NodeRegistry::with_logic_nodes();
        assert!(matches!(
            registry.create("gitlab#issue").unwrap_err(),
            RegistryError::UnknownClass(_)
        ));
        registry.clear();
        assert!(registry.classes().is_empty());
        assert!(!registry.contains(SWITCH_CLASS));
    }

    #[tokio::test]
    async fn test_query_field() {
        let mut registry = NodeRegistry::new();
        registry
            .register(SpecInfo::actor("slack#post").with_auth(), || ChannelPicker)
            .unwrap();

        let page = registry
            .query_field(
                "slack#post",
                &FieldQuery {
                    field: "channel".to_string(),
                    search: "dep".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].label, "#deploys");

        registry
            .register(SpecInfo::actor("demo#noop"), || Passthrough::new("demo#noop"))
            .unwrap();
        let err = registry
            .query_field("demo#noop", &FieldQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryFieldError::Registry(RegistryError::NoQueryFields(_))));
    }
}
