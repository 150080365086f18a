//! Static validation of a declared workflow graph.
//!
//! Validation runs in three stages and collects findings into a [`Report`]:
//!
//! 1. Workflow properties (name, ID). A fatal issue here stops validation.
//! 2. Per-node checks (ID format, name, class, adapter metadata, logic node
//!    input shapes). Any fatal issue skips the DAG stage.
//! 3. DAG check over the resolved transitions: duplicate IDs, dangling
//!    references and cycles are fatal; a dead-end node is a risk.
//!
//! Edges come from the *effective* transitions: a switch contributes each
//! path's transition (its own is ignored), a foreach contributes its loop
//! body plus its outer transition.

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::Serialize;
use waypoint_types::workflow::{
    is_valid_id, LoopFromListNode, Node, SwitchLogicNode, Workflow,
};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Category of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    WorkflowProperty,
    StartNode,
    NodeProperty,
    InputFields,
    DuplicateId,
    DanglingReference,
    MissingTransition,
    Cycle,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: IssueKind,
    pub message: String,
}

impl Issue {
    fn workflow(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            node_id: None,
            kind,
            message: message.into(),
        }
    }

    fn node(node_id: &str, kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "node '{id}': {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of validating a workflow.
///
/// Fatal issues block persistence and execution; risks are surfaced but do
/// not block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub fatal: Vec<Issue>,
    pub risk: Vec<Issue>,
}

impl Report {
    pub fn is_fatal(&self) -> bool {
        !self.fatal.is_empty()
    }

    /// `Ok(risks)` when nothing is fatal, otherwise the whole report.
    pub fn into_result(self) -> Result<Vec<Issue>, Report> {
        if self.is_fatal() {
            Err(self)
        } else {
            Ok(self.risk)
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fatal, {} risk", self.fatal.len(), self.risk.len())?;
        if let Some(first) = self.fatal.first() {
            write!(f, " (first: {first})")?;
        }
        Ok(())
    }
}

/// Validation switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateOptions {
    /// Skip input-field shape checks (used when importing definitions whose
    /// fields are filled in later).
    pub import_mode: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow definition.
pub fn validate_workflow(workflow: &Workflow, opts: ValidateOptions) -> Report {
    let mut report = Report::default();

    check_workflow_properties(workflow, &mut report);
    if report.is_fatal() {
        return report;
    }

    for node in &workflow.nodes {
        check_node(node, opts, &mut report);
    }
    if report.is_fatal() {
        return report;
    }

    check_dag(workflow, &mut report);
    report
}

fn check_workflow_properties(workflow: &Workflow, report: &mut Report) {
    if workflow.name.trim().is_empty() {
        report
            .fatal
            .push(Issue::workflow(IssueKind::WorkflowProperty, "workflow name is empty"));
    }
    // An empty ID means "not yet persisted".
    if !workflow.id.is_empty() && !is_valid_id(&workflow.id) {
        report.fatal.push(Issue::workflow(
            IssueKind::WorkflowProperty,
            format!("workflow ID '{}' is not alphanumeric/underscore", workflow.id),
        ));
    }
}

fn check_node(node: &Node, opts: ValidateOptions, report: &mut Report) {
    let id = node.id.as_str();

    if !is_valid_id(id) {
        report.fatal.push(Issue::node(
            id,
            IssueKind::NodeProperty,
            "ID must be non-empty and alphanumeric/underscore",
        ));
    }
    if node.name.trim().is_empty() {
        report
            .fatal
            .push(Issue::node(id, IssueKind::NodeProperty, "name is empty"));
    }
    if !is_valid_class(&node.class) {
        report.fatal.push(Issue::node(
            id,
            IssueKind::NodeProperty,
            format!("class '{}' is not of the form adapter#spec", node.class),
        ));
    }
    if node.data.metadata.adapter_class.trim().is_empty() {
        report.fatal.push(Issue::node(
            id,
            IssueKind::NodeProperty,
            "metadata.adapter_class is empty",
        ));
    }

    if opts.import_mode {
        return;
    }

    if !node.data.input_fields.is_object() {
        report.fatal.push(Issue::node(
            id,
            IssueKind::InputFields,
            "input_fields must be an object",
        ));
        return;
    }

    if node.is_switch() {
        check_switch_fields(node, report);
    } else if node.is_foreach() {
        match serde_json::from_value::<LoopFromListNode>(node.data.input_fields.clone()) {
            Ok(view) if !view.input_collection.trim().is_empty() => {}
            Ok(_) => report.fatal.push(Issue::node(
                id,
                IssueKind::InputFields,
                "foreach input_collection is empty",
            )),
            Err(e) => report.fatal.push(Issue::node(
                id,
                IssueKind::InputFields,
                format!("invalid foreach input fields: {e}"),
            )),
        }
    }
}

fn check_switch_fields(node: &Node, report: &mut Report) {
    let id = node.id.as_str();
    let view = match serde_json::from_value::<SwitchLogicNode>(node.data.input_fields.clone()) {
        Ok(view) => view,
        Err(e) => {
            report.fatal.push(Issue::node(
                id,
                IssueKind::InputFields,
                format!("invalid switch input fields: {e}"),
            ));
            return;
        }
    };

    if view.paths.is_empty() {
        report
            .fatal
            .push(Issue::node(id, IssueKind::InputFields, "switch has no paths"));
        return;
    }

    let last = view.paths.len() - 1;
    for (i, path) in view.paths.iter().enumerate() {
        if path.is_default {
            if i != last {
                report.fatal.push(Issue::node(
                    id,
                    IssueKind::InputFields,
                    format!("default path '{}' must be the last path", path.name),
                ));
            }
            if !path.conditions.is_empty() {
                report.fatal.push(Issue::node(
                    id,
                    IssueKind::InputFields,
                    format!("default path '{}' must not have conditions", path.name),
                ));
            }
        } else if path.conditions.iter().all(|group| group.is_empty()) {
            report.fatal.push(Issue::node(
                id,
                IssueKind::InputFields,
                format!("path '{}' has no conditions", path.name),
            ));
        }
    }
}

fn is_valid_class(class: &str) -> bool {
    match class.split_once('#') {
        Some((adapter, spec)) => {
            !adapter.is_empty() && !spec.is_empty() && !spec.contains('#')
        }
        None => false,
    }
}

// ---------------------------------------------------------------------------
// DAG check
// ---------------------------------------------------------------------------

/// Outgoing edges of a node after resolving switch/foreach indirection.
///
/// Unparseable logic fields yield whatever transitions could be read; shape
/// problems are reported by the per-node stage.
pub fn effective_transitions(node: &Node) -> Vec<&str> {
    if node.is_switch() {
        return node
            .data
            .input_fields
            .get("paths")
            .and_then(|p| p.as_array())
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| p.get("transition").and_then(|t| t.as_str()))
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
    }

    let mut edges = Vec::new();
    if node.is_foreach() {
        if let Some(body) = node
            .data
            .input_fields
            .get("transition")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
        {
            edges.push(body);
        }
    }
    if !node.transition.is_empty() {
        edges.push(node.transition.as_str());
    }
    edges
}

fn check_dag(workflow: &Workflow, report: &mut Report) {
    let mut graph = DiGraph::<&str, ()>::new();
    let mut indices = HashMap::new();
    let mut seen = HashSet::new();

    for node in &workflow.nodes {
        if !seen.insert(node.id.as_str()) {
            report.fatal.push(Issue::node(
                &node.id,
                IssueKind::DuplicateId,
                "duplicate node ID",
            ));
            continue;
        }
        indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
    }

    if workflow.start_node_id.is_empty() {
        report
            .fatal
            .push(Issue::workflow(IssueKind::StartNode, "start_node_id is empty"));
    } else if !indices.contains_key(workflow.start_node_id.as_str()) {
        report.fatal.push(Issue::workflow(
            IssueKind::StartNode,
            format!("start node '{}' does not exist", workflow.start_node_id),
        ));
    }

    let last_index = workflow.nodes.len().saturating_sub(1);
    for (position, node) in workflow.nodes.iter().enumerate() {
        let Some(&from) = indices.get(node.id.as_str()) else {
            continue;
        };

        for target in effective_transitions(node) {
            match indices.get(target) {
                Some(&to) => {
                    graph.add_edge(from, to, ());
                }
                None => report.fatal.push(Issue::node(
                    &node.id,
                    IssueKind::DanglingReference,
                    format!("transition references unknown node '{target}'"),
                )),
            }
        }

        if !node.is_switch() && node.transition.is_empty() && position != last_index {
            report.risk.push(Issue::node(
                &node.id,
                IssueKind::MissingTransition,
                "node has no transition and ends its chain",
            ));
        }
    }

    if let Err(cycle) = toposort(&graph, None) {
        let node_id = graph[cycle.node_id()];
        report.fatal.push(Issue::node(
            node_id,
            IssueKind::Cycle,
            format!("cycle detected involving node '{node_id}'"),
        ));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
