//! Layered variable environment for a running workflow.
//!
//! A scope holds three namespaces: `node` (node ID to `{input, output}`),
//! `var` (user variables) and `iter` (the current foreach element). Data
//! always lives at the root; nested executions work through a proxy created
//! with [`Scope::clone_proxy`] that sees everything but remembers which node
//! IDs it wrote itself, so [`Scope::diff_node_data`] can report just those.
//!
//! Levels form an explicit parent-owning chain. Writes made directly on the
//! root are treated as seed data (rehydrated records, trigger payload) and
//! are attributed to first-level proxies; deeper proxies report only their
//! own writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::expression::{Evaluator, ExpressionError};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// What a node consumed and produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeIo {
    pub input: Value,
    pub output: Value,
}

/// The current foreach element.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterData {
    /// 1-based.
    pub index: usize,
    pub item: Value,
    pub is_last: bool,
    pub length: usize,
}

/// Full snapshot of every namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScopeData {
    #[serde(default)]
    pub node: BTreeMap<String, NodeIo>,
    #[serde(default)]
    pub var: BTreeMap<String, Value>,
    #[serde(default)]
    pub iter: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

struct Level {
    parent: Option<Arc<Level>>,
    written: Mutex<Vec<String>>,
}

impl Level {
    fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Handle to one level of a scope chain.
///
/// Cloning the handle shares the level; use [`Scope::clone_proxy`] to open a
/// nested level.
#[derive(Clone)]
pub struct Scope {
    data: Arc<Mutex<ScopeData>>,
    level: Arc<Level>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("depth", &self.depth())
            .field("written", &*lock(&self.level.written))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scope {
    /// Create an empty root scope.
    pub fn new() -> Self {
        Self::from_data(ScopeData::default())
    }

    /// Create a root scope seeded with `data`.
    pub fn from_data(data: ScopeData) -> Self {
        let written = data.node.keys().cloned().collect();
        Self {
            data: Arc::new(Mutex::new(data)),
            level: Arc::new(Level {
                parent: None,
                written: Mutex::new(written),
            }),
        }
    }

    /// Open a nested level that reads and writes through to this one.
    pub fn clone_proxy(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            level: Arc::new(Level {
                parent: Some(Arc::clone(&self.level)),
                written: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of levels above this one (0 for the root).
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut level = &self.level;
        while let Some(parent) = &level.parent {
            depth += 1;
            level = parent;
        }
        depth
    }

    pub fn is_proxy(&self) -> bool {
        !self.level.is_root()
    }

    fn track(&self, node_id: &str) {
        let mut written = lock(&self.level.written);
        if !written.iter().any(|id| id == node_id) {
            written.push(node_id.to_string());
        }
    }

    // -- Node namespace --

    pub fn set_node_data(&self, node_id: &str, io: NodeIo) {
        lock(&self.data).node.insert(node_id.to_string(), io);
        self.track(node_id);
    }

    pub fn get_node_data(&self, node_id: &str) -> Option<NodeIo> {
        lock(&self.data).node.get(node_id).cloned()
    }

    pub fn delete_node(&self, node_id: &str) {
        lock(&self.data).node.remove(node_id);
        lock(&self.level.written).retain(|id| id != node_id);
    }

    /// Current values of the node IDs attributable to this level.
    ///
    /// A first-level proxy also reports the root's seed writes.
    pub fn diff_node_data(&self) -> BTreeMap<String, NodeIo> {
        let mut ids: Vec<String> = Vec::new();
        if let Some(parent) = &self.level.parent {
            if parent.is_root() {
                ids.extend(lock(&parent.written).iter().cloned());
            }
        }
        ids.extend(lock(&self.level.written).iter().cloned());

        let data = lock(&self.data);
        ids.into_iter()
            .filter_map(|id| data.node.get(&id).cloned().map(|io| (id, io)))
            .collect()
    }

    // -- Var namespace --

    pub fn set_var(&self, key: &str, value: Value) {
        lock(&self.data).var.insert(key.to_string(), value);
    }

    pub fn get_var(&self, key: &str) -> Option<Value> {
        lock(&self.data).var.get(key).cloned()
    }

    // -- Iter namespace --

    pub fn set_iter_data(&self, iter: &IterData) {
        let mut data = lock(&self.data);
        data.iter.insert("index".to_string(), json!(iter.index));
        data.iter.insert("item".to_string(), iter.item.clone());
        data.iter.insert("is_last".to_string(), json!(iter.is_last));
        data.iter.insert("length".to_string(), json!(iter.length));
    }

    pub fn set_iter_key_value(&self, key: &str, value: Value) {
        lock(&self.data).iter.insert(key.to_string(), value);
    }

    pub fn get_iter(&self) -> Map<String, Value> {
        lock(&self.data).iter.clone()
    }

    /// Replace the whole iter namespace (used to restore an outer loop).
    pub fn replace_iter(&self, iter: Map<String, Value>) {
        lock(&self.data).iter = iter;
    }

    pub fn clear_iter(&self) {
        lock(&self.data).iter.clear();
    }

    // -- Snapshots --

    /// Full snapshot of every namespace.
    pub fn get_data(&self) -> ScopeData {
        lock(&self.data).clone()
    }

    /// Replace every namespace; the restored node IDs count as written by
    /// this level.
    pub fn set_data(&self, data: ScopeData) {
        let ids: Vec<String> = data.node.keys().cloned().collect();
        *lock(&self.data) = data;
        for id in ids {
            self.track(&id);
        }
    }

    /// JSON read view expressions evaluate against.
    pub fn read_view(&self) -> Value {
        let data = lock(&self.data);
        json!({
            "node": data.node,
            "var": data.var,
            "iter": data.iter,
        })
    }

    pub fn evaluate(
        &self,
        evaluator: &dyn Evaluator,
        expression: &str,
    ) -> Result<Value, ExpressionError> {
        evaluator.evaluate(expression, &self.read_view())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::JexlEvaluator;

    fn io(output: Value) -> NodeIo {
        NodeIo {
            input: json!({}),
            output,
        }
    }

    #[test]
    fn test_proxy_reads_ancestor_state() {
        let root = Scope::new();
        root.set_node_data("hook", io(json!({"a": 1})));

        let proxy = root.clone_proxy().clone_proxy();
        assert_eq!(proxy.get_node_data("hook").unwrap().output, json!({"a": 1}));
        assert_eq!(proxy.depth(), 2);
        assert!(proxy.is_proxy());
        assert!(!root.is_proxy());
    }

    #[test]
    fn test_proxy_writes_are_visible_upstream() {
        let root = Scope::new();
        let proxy = root.clone_proxy();
        proxy.set_node_data("step", io(json!("done")));
        assert_eq!(root.get_node_data("step").unwrap().output, json!("done"));
    }

    #[test]
    fn test_nested_proxy_diff_counts() {
        let root = Scope::new();
        root.set_node_data("node1", io(json!(1)));

        let level2 = root.clone_proxy();
        level2.set_node_data("confirmNode1", io(json!(2)));
        level2.set_node_data("confirmNode2", io(json!(3)));
        assert_eq!(level2.diff_node_data().len(), 3);

        let level3 = level2.clone_proxy();
        level3.set_node_data("foreachNode1", io(json!(4)));
        let diff = level3.diff_node_data();
        assert_eq!(diff.len(), 1);
        assert!(diff.contains_key("foreachNode1"));

        // The outer level does not absorb the inner level's writes.
        assert_eq!(level2.diff_node_data().len(), 3);
    }

    #[test]
    fn test_diff_reports_current_values() {
        let root = Scope::new();
        let level2 = root.clone_proxy();
        let level3 = level2.clone_proxy();
        level3.set_node_data("body", io(json!("first")));
        level3.set_node_data("body", io(json!("second")));

        let diff = level3.diff_node_data();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["body"].output, json!("second"));
    }

    #[test]
    fn test_delete_node_untracks() {
        let root = Scope::new();
        let proxy = root.clone_proxy().clone_proxy();
        proxy.set_node_data("tmp", io(json!(true)));
        proxy.delete_node("tmp");
        assert!(proxy.diff_node_data().is_empty());
        assert!(root.get_node_data("tmp").is_none());
    }

    #[test]
    fn test_iter_namespace() {
        let scope = Scope::new();
        scope.set_iter_data(&IterData {
            index: 2,
            item: json!("b"),
            is_last: false,
            length: 3,
        });
        scope.set_iter_key_value("extra", json!(7));

        let iter = scope.get_iter();
        assert_eq!(iter["index"], json!(2));
        assert_eq!(iter["item"], json!("b"));
        assert_eq!(iter["extra"], json!(7));

        scope.clear_iter();
        assert!(scope.get_iter().is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_through_root() {
        let scope = Scope::new();
        scope.set_node_data("hook", io(json!({"x": 1})));
        scope.set_var("env", json!("prod"));

        let restored = Scope::from_data(scope.get_data());
        assert_eq!(restored.get_var("env"), Some(json!("prod")));
        assert_eq!(restored.clone_proxy().diff_node_data().len(), 1);
    }

    #[test]
    fn test_evaluate_against_read_view() {
        let scope = Scope::new();
        scope.set_node_data("hook", io(json!({"user": "ana"})));
        scope.set_var("greeting", json!("hi"));
        scope.set_iter_key_value("index", json!(1));

        let eval = JexlEvaluator::new();
        assert_eq!(
            scope.evaluate(&eval, "node.hook.output.user").unwrap(),
            json!("ana")
        );
        assert_eq!(scope.evaluate(&eval, "var.greeting").unwrap(), json!("hi"));
        assert_eq!(scope.evaluate(&eval, "iter.index").unwrap(), json!(1));
    }
}
