//! Live execution state of one node inside an execution context.

use chrono::{DateTime, Utc};
use serde_json::Value;
use waypoint_types::workflow::{
    new_id, NodeRunStatus, RunSource, WorkflowInstanceNode,
};

/// A node definition bound to the state of its (latest) execution.
///
/// One is created per node per execution context; it is only mutated by that
/// context and turned into a [`WorkflowInstanceNode`] record at run end.
#[derive(Debug, Clone)]
pub struct NodeInstance {
    pub node_id: String,
    pub class: String,
    pub executed: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Value,
    pub status: Option<NodeRunStatus>,
    pub duration_ms: i64,
    pub error: Option<String>,
    /// Loaded from a previous attempt rather than executed in this one.
    pub replayed: bool,
}

impl NodeInstance {
    pub fn new(node_id: &str, class: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            class: class.to_string(),
            executed: false,
            start_time: None,
            input: Value::Null,
            output: Value::Null,
            status: None,
            duration_ms: 0,
            error: None,
            replayed: false,
        }
    }

    /// Rebuild from a persisted record when resuming an instance.
    pub fn from_record(record: &WorkflowInstanceNode) -> Self {
        Self {
            node_id: record.node_id.clone(),
            class: record.class.clone(),
            executed: true,
            start_time: Some(record.start_time),
            input: record.input.clone(),
            output: record.output.clone(),
            status: Some(record.status),
            duration_ms: record.duration_ms,
            error: None,
            replayed: true,
        }
    }

    /// Mark the start of an execution with its bound input. Clears any
    /// state from an earlier visit (loop bodies run the same node again).
    pub fn begin(&mut self, input: Value) {
        self.executed = true;
        self.replayed = false;
        self.start_time = Some(Utc::now());
        self.input = input;
        self.output = Value::Null;
        self.status = None;
        self.error = None;
        self.duration_ms = 0;
    }

    pub fn complete(&mut self, output: Value) {
        self.output = output;
        self.finish(NodeRunStatus::Completed);
    }

    pub fn pause(&mut self, reason: &str) {
        self.error = Some(reason.to_string());
        self.finish(NodeRunStatus::Paused);
    }

    /// Record a failure. An output set before the failure is kept.
    pub fn fail(&mut self, error: &str) {
        self.error = Some(error.to_string());
        self.finish(NodeRunStatus::Failed);
    }

    fn finish(&mut self, status: NodeRunStatus) {
        self.status = Some(status);
        if let Some(start) = self.start_time {
            self.duration_ms = (Utc::now() - start).num_milliseconds().max(0);
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(NodeRunStatus::Completed)
    }

    /// Persistable record of this execution, or `None` if it never ran.
    pub fn to_record(
        &self,
        workflow_id: &str,
        instance_id: &str,
        source: RunSource,
    ) -> Option<WorkflowInstanceNode> {
        let status = self.status?;
        let start_time = self.start_time?;
        Some(WorkflowInstanceNode {
            id: new_id(),
            workflow_id: workflow_id.to_string(),
            workflow_instance_id: instance_id.to_string(),
            node_id: self.node_id.clone(),
            status,
            class: self.class.clone(),
            duration_ms: self.duration_ms,
            input: self.input.clone(),
            output: self.output.clone(),
            start_time,
            source,
            sample_resource_id: sample_resource_id(&self.output),
            sample_version: new_id(),
        })
    }
}

/// `id` of the output resource, when the output names one.
fn sample_resource_id(output: &Value) -> String {
    match output.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_complete() {
        let mut inst = NodeInstance::new("send", "slack#post");
        assert!(inst.to_record("wf", "run", RunSource::Manual).is_none());

        inst.begin(json!({"text": "hi"}));
        inst.complete(json!({"id": "msg_1"}));
        assert!(inst.succeeded());

        let record = inst.to_record("wf", "run", RunSource::Manual).unwrap();
        assert_eq!(record.status, NodeRunStatus::Completed);
        assert_eq!(record.input, json!({"text": "hi"}));
        assert_eq!(record.sample_resource_id, "msg_1");
        assert_eq!(record.workflow_instance_id, "run");
        assert!(record.duration_ms >= 0);
    }

    #[test]
    fn test_fail_keeps_output() {
        let mut inst = NodeInstance::new("gate", "logic#confirm");
        inst.begin(json!({}));
        inst.output = json!({"decision": "declined"});
        inst.fail("declined");
        assert!(!inst.succeeded());
        assert_eq!(inst.output["decision"], "declined");
        assert_eq!(inst.status, Some(NodeRunStatus::Failed));
    }

    #[test]
    fn test_begin_resets_previous_visit() {
        let mut inst = NodeInstance::new("body", "demo#step");
        inst.begin(json!(1));
        inst.fail("boom");
        inst.begin(json!(2));
        assert!(inst.error.is_none());
        assert!(inst.status.is_none());
        assert_eq!(inst.input, json!(2));
    }

    #[test]
    fn test_sample_versions_differ() {
        let mut inst = NodeInstance::new("a", "demo#step");
        inst.begin(json!({}));
        inst.complete(json!({}));
        let a = inst.to_record("wf", "run", RunSource::Trigger).unwrap();
        let b = inst.to_record("wf", "run", RunSource::Trigger).unwrap();
        assert_ne!(a.sample_version, b.sample_version);
        assert_eq!(a.sample_resource_id, "");
    }
}
