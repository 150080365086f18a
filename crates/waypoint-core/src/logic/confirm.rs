//! Pause-for-approval node.
//!
//! A confirm node is visited once per run attempt. The first visit raises a
//! pending request keyed by `(instance_id, node_id)` and pauses the run.
//! Later visits find the request: still pending pauses again (without a new
//! notification), resolved completes or fails the node.

use chrono::{Duration, Utc};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use waypoint_types::workflow::{
    new_id, ConfirmDecision, ConfirmLogicNode, ConfirmRecord, Node, CONFIRM_CLASS,
};

use crate::node::provision::{ProvisionDeps, Provisioner};
use crate::node::{
    HandlerMetadata, InputSchema, NodeContext, NodeError, NodeHandler, NodeOutput, SampleProvider,
};

/// Most confirmers a single request may name.
pub const MAX_CONFIRMERS: usize = 10;

/// Longest allowed approval window: one week.
pub const MAX_TIMEOUT_MINUTES: u32 = 7 * 24 * 60;

/// Decided-by marker of a request that ran out of time.
pub const EXPIRED: &str = "expired";

/// Built-in `logic#confirm` node.
#[derive(Debug, Default)]
pub struct ConfirmNode {
    deps: Option<ProvisionDeps>,
}

impl ConfirmNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn deps(&self) -> Result<&ProvisionDeps, NodeError> {
        self.deps
            .as_ref()
            .ok_or_else(|| NodeError::Unsupported("confirm node was not provisioned".to_string()))
    }

    fn validate(&self, view: &ConfirmLogicNode, deps: &ProvisionDeps) -> Result<(), NodeError> {
        if view.description.trim().is_empty() {
            return Err(NodeError::Config("description is required".to_string()));
        }
        if !(1..=MAX_TIMEOUT_MINUTES).contains(&view.timeout_minutes) {
            return Err(NodeError::Config(format!(
                "timeout_minutes must be between 1 and {MAX_TIMEOUT_MINUTES}"
            )));
        }
        if view.confirmers.is_empty() || view.confirmers.len() > MAX_CONFIRMERS {
            return Err(NodeError::Config(format!(
                "between 1 and {MAX_CONFIRMERS} confirmers are required, got {}",
                view.confirmers.len()
            )));
        }
        for confirmer in &view.confirmers {
            if !deps
                .authorizer
                .has_permission(confirmer, &deps.confirm_permission)
            {
                return Err(NodeError::PermissionDenied(format!(
                    "'{confirmer}' lacks '{}'",
                    deps.confirm_permission
                )));
            }
        }
        Ok(())
    }
}

impl NodeHandler for ConfirmNode {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(CONFIRM_CLASS, InputSchema::Fields)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        if ctx.is_preview() {
            return Ok(NodeOutput::Value(synthetic_approval()));
        }
        let deps = self.deps()?;
        let instance_id = ctx.instance_id().to_string();
        let node_id = ctx.node_id().to_string();

        let existing = deps.confirms.get_confirm(&instance_id, &node_id).await?;
        let record = match existing {
            None => {
                let view: ConfirmLogicNode = ctx.fields()?;
                self.validate(&view, deps)?;

                let now = Utc::now();
                let record = ConfirmRecord {
                    id: new_id(),
                    workflow_id: ctx.workflow_id().to_string(),
                    workflow_instance_id: instance_id,
                    node_id,
                    description: view.description,
                    confirmers: view.confirmers,
                    decision: ConfirmDecision::Pending,
                    decided_by: None,
                    created_at: now,
                    expires_at: now + Duration::minutes(i64::from(view.timeout_minutes)),
                    resolved_at: None,
                };
                deps.confirms.create_confirm(&record).await?;
                deps.notifier.notify(&record).await?;
                return Ok(NodeOutput::Paused {
                    reason: format!("awaiting approval: {}", record.description),
                });
            }
            Some(record) if record.decision == ConfirmDecision::Pending => {
                if record.expires_at > Utc::now() {
                    tracing::debug!(node_id = %record.node_id, "confirm still pending");
                    return Ok(NodeOutput::Paused {
                        reason: format!("awaiting approval: {}", record.description),
                    });
                }
                tracing::info!(node_id = %record.node_id, expires_at = %record.expires_at, "confirm expired");
                deps.confirms
                    .resolve_confirm(
                        &instance_id,
                        &node_id,
                        ConfirmDecision::Declined,
                        Some(EXPIRED),
                    )
                    .await?
            }
            Some(record) => record,
        };

        let purged = deps
            .confirms
            .purge_paused_records(&record.workflow_instance_id, &record.node_id)
            .await?;
        tracing::debug!(node_id = %record.node_id, decision = record.decision.as_str(), purged, "confirm resolved");

        let output = json!({
            "decision": record.decision,
            "decided_by": record.decided_by,
            "resolved_at": record.resolved_at,
        });
        match record.decision {
            ConfirmDecision::Declined => {
                ctx.set_output(output);
                Err(NodeError::Declined {
                    decided_by: record.decided_by,
                })
            }
            _ => Ok(NodeOutput::Value(output)),
        }
    }

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        Some(self)
    }

    fn as_sample_provider(&self) -> Option<&dyn SampleProvider> {
        Some(self)
    }
}

impl Provisioner for ConfirmNode {
    fn provision(&mut self, deps: &ProvisionDeps) {
        self.deps = Some(deps.clone());
    }
}

impl SampleProvider for ConfirmNode {
    fn sample<'a>(&'a self, _node: &'a Node) -> BoxFuture<'a, Result<Value, NodeError>> {
        Box::pin(async { Ok(synthetic_approval()) })
    }
}

fn synthetic_approval() -> Value {
    json!({
        "decision": ConfirmDecision::Approved,
        "decided_by": "preview",
        "resolved_at": Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::provision::{Authorizer, ConfirmStore, MemoryConfirmStore, Notifier, StaticAuthorizer};
    use crate::test_support::*;
    use crate::workflow::execution::{
        ExecutionContext, ExecutionError, ExecutionOptions, ExecutionResult, RunOutcome,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use waypoint_types::workflow::{NodeRunStatus, RunSource, Workflow};

    #[derive(Default)]
    struct CountingNotifier {
        sent: AtomicUsize,
    }

    impl Notifier for CountingNotifier {
        fn notify<'a>(&'a self, _request: &'a ConfirmRecord) -> BoxFuture<'a, Result<(), NodeError>> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct Harness {
        wf: Workflow,
        deps: ProvisionDeps,
        store: Arc<MemoryConfirmStore>,
        notifier: Arc<CountingNotifier>,
    }

    impl Harness {
        fn new(confirmers: Value) -> Self {
            let store = Arc::new(MemoryConfirmStore::default());
            let notifier = Arc::new(CountingNotifier::default());
            let authorizer: Arc<dyn Authorizer> = Arc::new(StaticAuthorizer::new(
                "workflow:confirm",
                vec!["ops@example.com".to_string(), "lead@example.com".to_string()],
            ));
            let deps = ProvisionDeps {
                authorizer,
                notifier: Arc::clone(&notifier) as Arc<dyn Notifier>,
                confirms: Arc::clone(&store) as Arc<dyn ConfirmStore>,
                confirm_permission: "workflow:confirm".to_string(),
            };
            let wf = workflow(vec![
                trigger("hook", "gate"),
                confirm_node("gate", "ship release?", 30, confirmers, "after"),
                actor("after", ""),
            ]);
            Self {
                wf,
                deps,
                store,
                notifier,
            }
        }

        async fn attempt(&self, start: &str, previous: &[&ExecutionResult]) -> ExecutionResult {
            let records: Vec<_> = previous
                .iter()
                .flat_map(|r| r.node_records("wf", "inst", RunSource::Manual))
                .collect();
            let options = ExecutionOptions {
                instance_id: "inst".to_string(),
                ..Default::default()
            };
            ExecutionContext::new(graph_with(&self.wf, &self.deps), Arc::default(), options)
                .with_resume(&records)
                .run(start, None)
                .await
        }

        fn sent(&self) -> usize {
            self.notifier.sent.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_first_visit_pauses_and_notifies_once() {
        let h = Harness::new(json!(["ops@example.com"]));
        let first = h.attempt("hook", &[]).await;
        assert_eq!(first.outcome, RunOutcome::Paused);
        assert_eq!(first.paused_node_id.as_deref(), Some("gate"));
        assert_eq!(h.sent(), 1);

        let pending = h.store.get_confirm("inst", "gate").await.unwrap().unwrap();
        assert_eq!(pending.decision, ConfirmDecision::Pending);
        assert_eq!(pending.description, "ship release?");
        assert_eq!(pending.expires_at - pending.created_at, Duration::minutes(30));

        let second = h.attempt("gate", &[&first]).await;
        assert_eq!(second.outcome, RunOutcome::Paused);
        assert_eq!(h.sent(), 1);
    }

    #[tokio::test]
    async fn test_approval_completes_run() {
        let h = Harness::new(json!(["ops@example.com"]));
        let first = h.attempt("hook", &[]).await;
        h.store
            .resolve_confirm("inst", "gate", ConfirmDecision::Approved, Some("ops@example.com"))
            .await
            .unwrap();

        let second = h.attempt("gate", &[&first]).await;
        assert_eq!(second.outcome, RunOutcome::Completed);
        let gate = second.record("gate").unwrap();
        assert_eq!(gate.output["decision"], "approved");
        assert_eq!(gate.output["decided_by"], "ops@example.com");
        assert!(second.record("after").is_some());
        // The trigger was replayed, not re-run.
        assert!(second.record("hook").is_none());
    }

    #[tokio::test]
    async fn test_decline_fails_and_keeps_output() {
        let h = Harness::new(json!(["ops@example.com"]));
        let first = h.attempt("hook", &[]).await;
        h.store
            .resolve_confirm("inst", "gate", ConfirmDecision::Declined, Some("ops@example.com"))
            .await
            .unwrap();

        let second = h.attempt("gate", &[&first]).await;
        assert_eq!(second.outcome, RunOutcome::Failed);
        assert_eq!(second.failed_node_id.as_deref(), Some("gate"));
        let gate = second.record("gate").unwrap();
        assert_eq!(gate.status, Some(NodeRunStatus::Failed));
        assert_eq!(gate.output["decision"], "declined");
        assert!(matches!(
            second.error,
            Some(ExecutionError::Node {
                source: NodeError::Declined { .. },
                ..
            })
        ));
        assert!(second.record("after").is_none());
    }

    #[tokio::test]
    async fn test_expired_request_is_declined() {
        let h = Harness::new(json!(["ops@example.com"]));
        let now = Utc::now();
        h.store
            .create_confirm(&ConfirmRecord {
                id: "c1".to_string(),
                workflow_id: "wf".to_string(),
                workflow_instance_id: "inst".to_string(),
                node_id: "gate".to_string(),
                description: "ship release?".to_string(),
                confirmers: vec!["ops@example.com".to_string()],
                decision: ConfirmDecision::Pending,
                decided_by: None,
                created_at: now - Duration::minutes(60),
                expires_at: now - Duration::minutes(30),
                resolved_at: None,
            })
            .await
            .unwrap();

        let result = h.attempt("gate", &[]).await;
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert_eq!(result.record("gate").unwrap().output["decided_by"], EXPIRED);
    }

    fn gated_loop(items: Value) -> Workflow {
        let mut hook = actor("hook", "loop");
        hook.data.input_fields = json!({ "items": items });
        let mut each = actor("each", "gate");
        each.data.input_fields = json!({ "item": "{{ iter.item }}" });
        workflow(vec![
            hook,
            foreach_node("loop", "{{ node.hook.output.items }}", "each", "after"),
            each,
            confirm_node("gate", "ship it?", 30, json!(["ops@example.com"]), ""),
            actor("after", ""),
        ])
    }

    #[tokio::test]
    async fn test_confirm_inside_foreach_pauses_the_loop() {
        let mut h = Harness::new(json!(["ops@example.com"]));
        h.wf = gated_loop(json!(["a", "b"]));

        let first = h.attempt("hook", &[]).await;
        assert_eq!(first.outcome, RunOutcome::Paused, "{:?}", first.error);
        assert_eq!(first.paused_node_id.as_deref(), Some("gate"));
        assert_eq!(first.resume_node_id.as_deref(), Some("loop"));
        assert!(first.error.is_none());

        let looped = first.record("loop").unwrap();
        assert_eq!(looped.status, Some(NodeRunStatus::Paused));
        assert_eq!(looped.output["loop_iteration"], 1);
        assert_eq!(looped.output["resume_at"], "gate");
        assert_eq!(looped.output["current"]["each"]["item"], "a");
        assert_eq!(first.record("gate").unwrap().status, Some(NodeRunStatus::Paused));
        assert!(first.record("after").is_none());
        assert_eq!(h.sent(), 1);

        // Still pending: re-entering the loop pauses at the same gate.
        let again = h.attempt("loop", &[&first]).await;
        assert_eq!(again.outcome, RunOutcome::Paused);
        assert_eq!(again.paused_node_id.as_deref(), Some("gate"));
        assert_eq!(again.record("loop").unwrap().output["current"]["each"]["item"], "a");
        assert!(again.record("each").is_none());
        assert_eq!(h.sent(), 1);
    }

    #[tokio::test]
    async fn test_approval_resumes_loop_at_paused_iteration() {
        let mut h = Harness::new(json!(["ops@example.com"]));
        h.wf = gated_loop(json!(["a", "b"]));
        let first = h.attempt("hook", &[]).await;
        h.store
            .resolve_confirm("inst", "gate", ConfirmDecision::Approved, Some("ops@example.com"))
            .await
            .unwrap();

        let resumed = h.attempt("loop", &[&first]).await;
        assert_eq!(resumed.outcome, RunOutcome::Completed, "{:?}", resumed.error);
        let output = &resumed.record("loop").unwrap().output;
        assert_eq!(output["loop_iteration"], 2);
        assert_eq!(output["results"][0]["each"]["item"], "a");
        assert_eq!(output["results"][0]["gate"]["decided_by"], "ops@example.com");
        // The request is keyed by instance and node, so it covers later iterations.
        assert_eq!(output["results"][1]["each"]["item"], "b");
        assert_eq!(output["results"][1]["gate"]["decision"], "approved");
        assert!(resumed.record("after").is_some());

        // The paused iteration restarted at the gate; only the second ran `each`.
        let body_runs = resumed.records.iter().filter(|r| r.node_id == "each").count();
        assert_eq!(body_runs, 1);
        assert_eq!(h.sent(), 1);
    }

    #[tokio::test]
    async fn test_decline_inside_foreach_fails_at_gate() {
        let mut h = Harness::new(json!(["ops@example.com"]));
        h.wf = gated_loop(json!(["a"]));
        let first = h.attempt("hook", &[]).await;
        h.store
            .resolve_confirm("inst", "gate", ConfirmDecision::Declined, Some("lead@example.com"))
            .await
            .unwrap();

        let resumed = h.attempt("loop", &[&first]).await;
        assert_eq!(resumed.outcome, RunOutcome::Failed);
        assert_eq!(resumed.failed_node_id.as_deref(), Some("gate"));
        assert!(matches!(
            resumed.error.as_ref().map(ExecutionError::root_cause),
            Some(ExecutionError::Node {
                source: NodeError::Declined { .. },
                ..
            })
        ));
        assert!(resumed.record("after").is_none());
    }

    #[tokio::test]
    async fn test_too_many_confirmers_rejected() {
        let confirmers: Vec<String> = (0..=MAX_CONFIRMERS).map(|i| format!("u{i}@example.com")).collect();
        let h = Harness::new(json!(confirmers));
        let result = h.attempt("hook", &[]).await;
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert!(matches!(
            result.error,
            Some(ExecutionError::Node {
                source: NodeError::Config(_),
                ..
            })
        ));
        assert_eq!(h.sent(), 0);
    }

    #[tokio::test]
    async fn test_confirmer_without_permission_rejected() {
        let h = Harness::new(json!(["ops@example.com", "intern@example.com"]));
        let result = h.attempt("hook", &[]).await;
        assert_eq!(result.outcome, RunOutcome::Failed);
        assert!(matches!(
            result.error,
            Some(ExecutionError::Node {
                source: NodeError::PermissionDenied(_),
                ..
            })
        ));
        assert!(h.store.get_confirm("inst", "gate").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_preview_returns_synthetic_approval() {
        let h = Harness::new(json!(["ops@example.com"]));
        let options = ExecutionOptions {
            single_step: true,
            ..Default::default()
        };
        let result = ExecutionContext::new(graph_with(&h.wf, &h.deps), Arc::default(), options)
            .run("gate", None)
            .await;
        assert_eq!(result.outcome, RunOutcome::Completed);
        assert_eq!(result.record("gate").unwrap().output["decision"], "approved");
        assert_eq!(h.sent(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_deps_authorize_nobody() {
        let wf = workflow(vec![confirm_node("gate", "ok?", 5, json!(["ops@example.com"]), "")]);
        let graph = crate::workflow::execution::WorkflowGraph::build(
            &wf,
            &registry(),
            &ProvisionDeps::in_memory(),
        )
        .unwrap();
        let result = ExecutionContext::new(Arc::new(graph), Arc::default(), ExecutionOptions::default())
            .run("gate", None)
            .await;
        assert!(matches!(
            result.error,
            Some(ExecutionError::Node {
                source: NodeError::PermissionDenied(_),
                ..
            })
        ));
    }
}
