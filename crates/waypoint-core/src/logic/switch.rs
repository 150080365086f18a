//! Conditional branch node.

use serde_json::{json, Value};
use waypoint_types::workflow::{Condition, SWITCH_CLASS, SwitchLogicNode, SwitchPath};

use crate::node::{HandlerMetadata, InputSchema, NodeContext, NodeError, NodeHandler, NodeOutput};

/// Picks the next node from an ordered list of paths.
///
/// Every normal path is evaluated so the output reports each path's truth
/// value; the first true path (or a trailing default when none matched)
/// decides where the run goes. With no match and no default the flow ends.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchNode;

impl SwitchNode {
    pub fn new() -> Self {
        Self
    }
}

impl NodeHandler for SwitchNode {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(SWITCH_CLASS, InputSchema::Any)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        let view: SwitchLogicNode = ctx.fields()?;
        if view.paths.is_empty() {
            return Err(NodeError::Config("switch has no paths".to_string()));
        }

        let last = view.paths.len() - 1;
        let mut selected: Option<&SwitchPath> = None;
        let mut results = Vec::with_capacity(view.paths.len());

        for (i, path) in view.paths.iter().enumerate() {
            if path.is_default {
                let taken = i == last && selected.is_none();
                if taken {
                    selected = Some(path);
                }
                results.push(path_result("default".to_string(), path, taken));
                continue;
            }

            let matched = path_matches(ctx, path)?;
            if matched && selected.is_none() {
                selected = Some(path);
            }
            results.push(path_result((i + 1).to_string(), path, matched));
        }

        let next = selected
            .map(|p| p.transition.as_str())
            .filter(|t| !t.is_empty());
        tracing::debug!(node_id = %ctx.node_id(), selected = ?selected.map(|p| &p.name), "switch evaluated");
        ctx.take_control(next);

        Ok(NodeOutput::Value(Value::Array(results)))
    }
}

fn path_result(id: String, path: &SwitchPath, execution_result: bool) -> Value {
    json!({
        "id": id,
        "name": path.name,
        "execution_result": execution_result,
    })
}

/// OR over groups, AND within a group.
fn path_matches(ctx: &NodeContext<'_>, path: &SwitchPath) -> Result<bool, NodeError> {
    for group in &path.conditions {
        if group.is_empty() {
            continue;
        }
        let mut all = true;
        for condition in group {
            if !condition_holds(ctx, condition)? {
                all = false;
                break;
            }
        }
        if all {
            return Ok(true);
        }
    }
    Ok(false)
}

fn condition_holds(ctx: &NodeContext<'_>, condition: &Condition) -> Result<bool, NodeError> {
    let left = ctx.resolve_operand(&condition.left)?;
    let right = ctx.resolve_operand(&condition.right)?;
    Ok(ctx.comparator().compare(condition.operation, &left, &right)?)
}
