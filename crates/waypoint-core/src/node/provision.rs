//! Services injected into nodes that declare the `Provisioner` capability.
//!
//! The confirm node is the main consumer: it needs an [`Authorizer`] to
//! check that every confirmer may approve, a [`Notifier`] to reach them, and
//! a [`ConfirmStore`] holding the pending request between run attempts.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use waypoint_types::config::EngineConfig;
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{ConfirmDecision, ConfirmRecord, NodeRunStatus};

use super::NodeError;
use crate::repository::WorkflowRepository;

// ---------------------------------------------------------------------------
// Service traits
// ---------------------------------------------------------------------------

/// Answers permission checks for users.
pub trait Authorizer: Send + Sync {
    fn has_permission(&self, user: &str, permission: &str) -> bool;
}

/// Delivers approval requests to confirmers.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, request: &'a ConfirmRecord) -> BoxFuture<'a, Result<(), NodeError>>;
}

/// Storage for confirm requests and the paused records they leave behind.
pub trait ConfirmStore: Send + Sync {
    fn get_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ConfirmRecord>, RepositoryError>>;

    fn create_confirm<'a>(
        &'a self,
        record: &'a ConfirmRecord,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;

    fn resolve_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
        decision: ConfirmDecision,
        decided_by: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ConfirmRecord, RepositoryError>>;

    /// Remove `paused` node records left by earlier attempts.
    fn purge_paused_records<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, RepositoryError>>;
}

/// Everything a provisioned node may need.
#[derive(Clone)]
pub struct ProvisionDeps {
    pub authorizer: Arc<dyn Authorizer>,
    pub notifier: Arc<dyn Notifier>,
    pub confirms: Arc<dyn ConfirmStore>,
    /// Permission each confirmer must hold.
    pub confirm_permission: String,
}

impl ProvisionDeps {
    /// Deps built from engine config: a static authorizer, a log notifier,
    /// and the given confirm store.
    pub fn from_config(config: &EngineConfig, confirms: Arc<dyn ConfirmStore>) -> Self {
        Self {
            authorizer: Arc::new(StaticAuthorizer::from_config(config)),
            notifier: Arc::new(LogNotifier),
            confirms,
            confirm_permission: config.confirm_permission.clone(),
        }
    }

    /// In-memory deps for previews and tests; nobody is authorized.
    pub fn in_memory() -> Self {
        Self::from_config(&EngineConfig::default(), Arc::new(MemoryConfirmStore::default()))
    }
}

impl std::fmt::Debug for ProvisionDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionDeps")
            .field("confirm_permission", &self.confirm_permission)
            .finish_non_exhaustive()
    }
}

/// Implemented by handlers that need injected services.
pub trait Provisioner: Send + Sync {
    fn provision(&mut self, deps: &ProvisionDeps);
}

// ---------------------------------------------------------------------------
// Built-in implementations
// ---------------------------------------------------------------------------

/// Grants one permission to a fixed set of users.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    permission: String,
    users: HashSet<String>,
}

impl StaticAuthorizer {
    pub fn new(permission: impl Into<String>, users: impl IntoIterator<Item = String>) -> Self {
        Self {
            permission: permission.into(),
            users: users.into_iter().map(|u| u.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.confirm_permission.clone(),
            config.authorized_confirmers.iter().cloned(),
        )
    }
}

impl Authorizer for StaticAuthorizer {
    fn has_permission(&self, user: &str, permission: &str) -> bool {
        permission == self.permission && self.users.contains(&user.to_lowercase())
    }
}

/// Writes approval requests to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, request: &'a ConfirmRecord) -> BoxFuture<'a, Result<(), NodeError>> {
        Box::pin(async move {
            tracing::info!(
                instance_id = %request.workflow_instance_id,
                node_id = %request.node_id,
                confirmers = ?request.confirmers,
                expires_at = %request.expires_at,
                "approval requested: {}",
                request.description
            );
            Ok(())
        })
    }
}

/// Confirm store backed by a [`WorkflowRepository`].
#[derive(Debug, Clone)]
pub struct RepositoryConfirmStore<R> {
    repo: R,
}

impl<R> RepositoryConfirmStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }
}

impl<R: WorkflowRepository> ConfirmStore for RepositoryConfirmStore<R> {
    fn get_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ConfirmRecord>, RepositoryError>> {
        Box::pin(self.repo.get_confirm(instance_id, node_id))
    }

    fn create_confirm<'a>(
        &'a self,
        record: &'a ConfirmRecord,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.repo.create_confirm(record))
    }

    fn resolve_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
        decision: ConfirmDecision,
        decided_by: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ConfirmRecord, RepositoryError>> {
        Box::pin(self.repo.resolve_confirm(instance_id, node_id, decision, decided_by))
    }

    fn purge_paused_records<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, RepositoryError>> {
        Box::pin(
            self.repo
                .delete_instance_nodes(instance_id, node_id, NodeRunStatus::Paused),
        )
    }
}

/// Process-local confirm store keyed by `(instance_id, node_id)`.
#[derive(Debug, Default)]
pub struct MemoryConfirmStore {
    records: DashMap<(String, String), ConfirmRecord>,
}

fn confirm_key(instance_id: &str, node_id: &str) -> (String, String) {
    (instance_id.to_string(), node_id.to_string())
}

impl ConfirmStore for MemoryConfirmStore {
    fn get_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<ConfirmRecord>, RepositoryError>> {
        let found = self
            .records
            .get(&confirm_key(instance_id, node_id))
            .map(|r| r.value().clone());
        Box::pin(async move { Ok(found) })
    }

    fn create_confirm<'a>(
        &'a self,
        record: &'a ConfirmRecord,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        let key = confirm_key(&record.workflow_instance_id, &record.node_id);
        let result = match self.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "confirm already exists for node '{}'",
                record.node_id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn resolve_confirm<'a>(
        &'a self,
        instance_id: &'a str,
        node_id: &'a str,
        decision: ConfirmDecision,
        decided_by: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ConfirmRecord, RepositoryError>> {
        let result = match self.records.get_mut(&confirm_key(instance_id, node_id)) {
            None => Err(RepositoryError::NotFound),
            Some(record) if record.decision != ConfirmDecision::Pending => Err(
                RepositoryError::Conflict(format!("confirm for node '{node_id}' already resolved")),
            ),
            Some(mut record) => {
                record.decision = decision;
                record.decided_by = decided_by.map(str::to_string);
                record.resolved_at = Some(chrono::Utc::now());
                Ok(record.clone())
            }
        };
        Box::pin(async move { result })
    }

    fn purge_paused_records<'a>(
        &'a self,
        _instance_id: &'a str,
        _node_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, RepositoryError>> {
        // No node records are kept here.
        Box::pin(async move { Ok(0) })
    }
}
