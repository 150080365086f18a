//! Structural walks over a workflow graph.
//!
//! [`NodeIterator`] follows the effective execution order without running
//! anything: a switch fans out to all of its paths, a foreach descends into
//! its loop body before continuing with its outer transition. It backs
//! delete-impact analysis ([`NodeIterator::delete_material`]) and linting.

use std::collections::{HashMap, HashSet, VecDeque};

use waypoint_types::workflow::{Node, Workflow};

/// Errors from walking the graph.
#[derive(Debug, thiserror::Error)]
pub enum IteratorError {
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{node_id}' has more than one predecessor: {predecessors:?}")]
    AmbiguousPredecessor {
        node_id: String,
        predecessors: Vec<String>,
    },
}

/// The atomic unit removed when a node is deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMaterial {
    pub target: String,
    /// Node whose transition, path or loop body points at the target.
    pub predecessor: Option<String>,
    /// Nodes owned by the target (loop body, switch branches), in walk order.
    pub contained: Vec<String>,
}

impl DeleteMaterial {
    /// Every node ID removed together: the target followed by its contents.
    pub fn node_ids(&self) -> Vec<&str> {
        std::iter::once(self.target.as_str())
            .chain(self.contained.iter().map(String::as_str))
            .collect()
    }
}

/// Walks a workflow's nodes in effective execution order.
pub struct NodeIterator<'a> {
    nodes: HashMap<&'a str, &'a Node>,
    order: Vec<&'a Node>,
}

impl<'a> NodeIterator<'a> {
    pub fn new(workflow: &'a Workflow) -> Self {
        Self {
            nodes: workflow.nodes.iter().map(|n| (n.id.as_str(), n)).collect(),
            order: workflow.nodes.iter().collect(),
        }
    }

    fn get(&self, id: &str) -> Result<&'a Node, IteratorError> {
        self.nodes
            .get(id)
            .copied()
            .ok_or_else(|| IteratorError::NodeNotFound(id.to_string()))
    }

    /// Visit nodes from `start` in effective order until `f` returns `true`
    /// or the walk is exhausted.
    ///
    /// Switch path transitions are queued behind the current chain; a
    /// foreach runs its body first and then resumes at its outer transition.
    /// Each node is visited at most once.
    pub fn walk<F>(&self, start: &str, mut f: F) -> Result<(), IteratorError>
    where
        F: FnMut(&'a Node) -> bool,
    {
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut current = start.to_string();

        loop {
            if current.is_empty() {
                match queue.pop_front() {
                    Some(next) => current = next,
                    None => return Ok(()),
                }
                continue;
            }

            let node = self.get(&current)?;
            if !visited.insert(node.id.as_str()) {
                current.clear();
                continue;
            }

            if f(node) {
                return Ok(());
            }

            if node.is_switch() {
                queue.extend(switch_targets(node).into_iter().map(str::to_string));
                current.clear();
            } else if node.is_foreach() {
                if !node.transition.is_empty() {
                    queue.push_front(node.transition.clone());
                }
                current = foreach_body(node).unwrap_or_default().to_string();
            } else {
                current = node.transition.clone();
            }
        }
    }

    /// Node IDs in effective order from `start`.
    pub fn ordered_ids(&self, start: &str) -> Result<Vec<&'a str>, IteratorError> {
        let mut ids = Vec::new();
        self.walk(start, |node| {
            ids.push(node.id.as_str());
            false
        })?;
        Ok(ids)
    }

    /// Find the deletion unit for `target`: its unique predecessor and every
    /// node it contains.
    pub fn delete_material(&self, target: &str) -> Result<DeleteMaterial, IteratorError> {
        let node = self.get(target)?;

        let predecessors: Vec<String> = self
            .order
            .iter()
            .filter(|candidate| points_at(candidate, target))
            .map(|candidate| candidate.id.clone())
            .collect();
        if predecessors.len() > 1 {
            return Err(IteratorError::AmbiguousPredecessor {
                node_id: target.to_string(),
                predecessors,
            });
        }

        let mut contained = Vec::new();
        let mut visited = HashSet::from([node.id.as_str()]);
        if node.is_foreach() {
            if let Some(body) = foreach_body(node) {
                self.collect_chain(body, "", &mut contained, &mut visited)?;
            }
        } else if node.is_switch() {
            for start in switch_targets(node) {
                self.collect_chain(start, &node.transition, &mut contained, &mut visited)?;
            }
        }

        Ok(DeleteMaterial {
            target: target.to_string(),
            predecessor: predecessors.into_iter().next(),
            contained,
        })
    }

    fn collect_chain(
        &self,
        start: &str,
        stop: &str,
        out: &mut Vec<String>,
        visited: &mut HashSet<&'a str>,
    ) -> Result<(), IteratorError> {
        let mut current = start;
        while !current.is_empty() && current != stop {
            let node = self.get(current)?;
            if !visited.insert(node.id.as_str()) {
                break;
            }
            out.push(node.id.clone());

            if node.is_switch() {
                for branch in switch_targets(node) {
                    self.collect_chain(branch, stop, out, visited)?;
                }
                break;
            }
            if node.is_foreach() {
                if let Some(body) = foreach_body(node) {
                    self.collect_chain(body, "", out, visited)?;
                }
            }
            current = node.transition.as_str();
        }
        Ok(())
    }
}

/// Remove a delete unit from `workflow`, relinking its predecessor (or the
/// start node) to the target's outer transition.
pub fn remove_material(workflow: &mut Workflow, material: &DeleteMaterial) {
    let next = workflow
        .node(&material.target)
        .map(|n| n.transition.clone())
        .unwrap_or_default();
    let removed: HashSet<&str> = material.node_ids().into_iter().collect();
    workflow.nodes.retain(|n| !removed.contains(n.id.as_str()));

    if workflow.start_node_id == material.target {
        workflow.start_node_id.clone_from(&next);
    }
    let Some(pred_id) = &material.predecessor else {
        return;
    };
    let Some(pred) = workflow.nodes.iter_mut().find(|n| &n.id == pred_id) else {
        return;
    };
    if pred.transition == material.target {
        pred.transition.clone_from(&next);
    }
    let target = material.target.as_str();
    let relink = |slot: &mut serde_json::Value| {
        if slot.get("transition").and_then(|t| t.as_str()) == Some(target) {
            slot["transition"] = serde_json::Value::String(next.clone());
        }
    };
    if pred.is_switch() {
        if let Some(paths) = pred
            .data
            .input_fields
            .get_mut("paths")
            .and_then(|p| p.as_array_mut())
        {
            paths.iter_mut().for_each(relink);
        }
    } else if pred.is_foreach() {
        relink(&mut pred.data.input_fields);
    }
}

fn switch_targets(node: &Node) -> Vec<&str> {
    node.data
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
        .unwrap_or_default()
}

fn foreach_body(node: &Node) -> Option<&str> {
    node.data
        .input_fields
        .get("transition")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
}

fn points_at(candidate: &Node, target: &str) -> bool {
    if candidate.is_switch() {
        return switch_targets(candidate).contains(&target);
    }
    if candidate.is_foreach() && foreach_body(candidate) == Some(target) {
        return true;
    }
    candidate.transition == target
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
