//! Loop node: runs its body once per element of a collection.
//!
//! When the body pauses (a confirm gate inside the loop), the loop pauses
//! too and stores its progress as its output. Resuming the run re-enters
//! the loop, which skips the finished iterations and restarts the paused
//! one at the node that paused.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use waypoint_types::workflow::{FOREACH_CLASS, LoopFromListNode};

use crate::node::{HandlerMetadata, InputSchema, NodeContext, NodeError, NodeHandler, NodeOutput};
use crate::workflow::execution::SubflowEnd;
use crate::workflow::expression::single_reference;
use crate::workflow::scope::{IterData, NodeIo};

/// Iterates `input_collection`, running the loop body as a subflow per
/// element with `iter` set to the element. Execution then continues with the
/// node's own transition.
///
/// A preview runs one synthetic iteration over the first element.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForeachNode;

impl ForeachNode {
    pub fn new() -> Self {
        Self
    }
}

/// Output of a loop paused inside its body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LoopProgress {
    /// 1-based iteration the body paused in.
    loop_iteration: usize,
    loop_total_iterations: usize,
    /// Results of the finished iterations.
    results: Vec<Value>,
    /// Body node to restart the paused iteration from.
    resume_at: String,
    /// Outputs the paused iteration wrote before pausing.
    #[serde(default)]
    current: Map<String, Value>,
}

impl NodeHandler for ForeachNode {
    fn metadata(&self) -> HandlerMetadata {
        HandlerMetadata::new(FOREACH_CLASS, InputSchema::Any)
    }

    async fn run(&self, ctx: &mut NodeContext<'_>) -> Result<NodeOutput, NodeError> {
        let view: LoopFromListNode = ctx.fields()?;
        let collection_expr = view.input_collection.trim();
        if collection_expr.is_empty() {
            return Err(NodeError::Config("input_collection is empty".to_string()));
        }
        let preview = ctx.is_preview();
        if view.transition.is_empty() && !preview {
            return Err(NodeError::Config("loop body transition is empty".to_string()));
        }

        let items = match resolve_collection(ctx, collection_expr)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        let total = items.len();

        if total == 0 {
            return Ok(NodeOutput::Value(json!({
                "loop_iteration": 0,
                "loop_total_iterations": 0,
                "loop_iteration_is_last": false,
                "results": [],
            })));
        }

        let progress = ctx
            .take_resume_state()
            .and_then(|state| serde_json::from_value::<LoopProgress>(state).ok())
            .filter(|p| {
                let fits = p.loop_total_iterations == total
                    && (1..=total).contains(&p.loop_iteration)
                    && p.results.len() + 1 == p.loop_iteration;
                if !fits {
                    tracing::warn!(node_id = %ctx.node_id(), total, "loop progress does not match collection, restarting");
                }
                fits
            });
        let (skip, mut results, mut resume) = match progress {
            Some(p) => {
                tracing::debug!(node_id = %ctx.node_id(), iteration = p.loop_iteration, at = %p.resume_at, "resuming loop");
                (p.loop_iteration - 1, p.results, Some((p.resume_at, p.current)))
            }
            None => (0, Vec::with_capacity(total), None),
        };

        let runs = if preview { 1 } else { total };
        let outer_iter = ctx.scope().get_iter();

        for (i, item) in items.into_iter().enumerate().take(runs).skip(skip) {
            if ctx.is_cancelled() {
                restore_iter(ctx, outer_iter);
                return Err(NodeError::Cancelled);
            }

            ctx.scope().set_iter_data(&IterData {
                index: i + 1,
                item: item.clone(),
                is_last: i + 1 == total,
                length: total,
            });
            tracing::debug!(node_id = %ctx.node_id(), iteration = i + 1, total, "foreach iteration");

            if view.transition.is_empty() {
                results.push(json!({ "item": item }));
                continue;
            }

            let (start, mut outputs) = resume
                .take()
                .unwrap_or_else(|| (view.transition.clone(), Map::new()));

            match ctx.run_subflow(&start).await {
                Ok(SubflowEnd::Completed(written)) => {
                    outputs.extend(output_map(written));
                    results.push(Value::Object(outputs));
                }
                Ok(SubflowEnd::Paused {
                    node_id,
                    reason,
                    written,
                }) => {
                    outputs.extend(output_map(written));
                    restore_iter(ctx, outer_iter);
                    let progress = LoopProgress {
                        loop_iteration: i + 1,
                        loop_total_iterations: total,
                        results,
                        resume_at: node_id,
                        current: outputs,
                    };
                    let progress = serde_json::to_value(&progress)
                        .map_err(|e| NodeError::Execution(format!("loop progress: {e}")))?;
                    ctx.set_output(progress);
                    return Ok(NodeOutput::Paused { reason });
                }
                Err(err) => {
                    restore_iter(ctx, outer_iter);
                    return Err(err.into());
                }
            }
        }

        restore_iter(ctx, outer_iter);
        Ok(NodeOutput::Value(json!({
            "loop_iteration": runs,
            "loop_total_iterations": total,
            "loop_iteration_is_last": runs == total,
            "results": results,
        })))
    }
}

fn output_map(written: BTreeMap<String, NodeIo>) -> Map<String, Value> {
    written
        .into_iter()
        .map(|(node_id, io)| (node_id, io.output))
        .collect()
}

/// A lone `{{ ref }}` or a bare expression evaluates to its value; other
/// templated text renders to a string.
fn resolve_collection(ctx: &NodeContext<'_>, text: &str) -> Result<Value, NodeError> {
    if let Some(reference) = single_reference(text) {
        return Ok(ctx.evaluate(reference)?);
    }
    if text.contains("{{") {
        return Ok(ctx.resolve_operand(text)?);
    }
    Ok(ctx.evaluate(text)?)
}

/// Put back the iteration state of an enclosing loop, or clear it.
fn restore_iter(ctx: &NodeContext<'_>, outer: Map<String, Value>) {
    if outer.is_empty() {
        ctx.scope().clear_iter();
    } else {
        ctx.scope().replace_iter(outer);
    }
}
