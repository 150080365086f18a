//! CLI workflow subcommands.
//!
//! Offline commands (validate, order, remove-node, preview) work on a
//! definition file. The rest go through the SQLite repository: apply, list,
//! show, enable/disable, delete, run, trigger, resume, decide, instances,
//! records and pending confirms.

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Subcommand, ValueEnum};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;

use waypoint_core::repository::WorkflowRepository;
use waypoint_core::workflow::iterator::{NodeIterator, remove_material};
use waypoint_core::workflow::validator::{Issue, ValidateOptions, validate_workflow};
use waypoint_core::workflow::{ExecutionResult, RunOutcome, RunReport, RunnerError};
use waypoint_infra::filesystem::{load_workflow_file, save_workflow_file};
use waypoint_types::event::WorkflowEvent;
use waypoint_types::workflow::{
    ConfirmDecision, InstanceStatus, NodeRunStatus, RunSource, Workflow, WorkflowStatus,
};

use crate::state::{AppState, ConcreteRunner};

/// Workflow subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Validate a workflow file without storing it.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// Skip input-field shape checks.
        #[arg(long)]
        import: bool,
    },

    /// Validate and store a workflow, activating its trigger on first apply.
    Apply {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// Re-apply onto this stored workflow (defaults to the file's `id`).
        #[arg(long)]
        id: Option<String>,

        /// Write the stored definition (with persisted IDs) back to the file.
        #[arg(long)]
        write_back: bool,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List,

    /// Show a stored workflow and its nodes in execution order.
    Show {
        /// Workflow ID.
        workflow_id: String,
    },

    /// Print the nodes of a workflow file in execution order.
    Order {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Remove a node (and everything nested under it) from a workflow file,
    /// relinking its predecessor to its successor.
    RemoveNode {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// ID of the node to remove.
        node_id: String,

        /// Show what would be removed without writing the file.
        #[arg(long)]
        dry_run: bool,
    },

    /// Allow the workflow's trigger to start runs.
    Enable {
        /// Workflow ID.
        workflow_id: String,
    },

    /// Stop the workflow's trigger from starting runs.
    Disable {
        /// Workflow ID.
        workflow_id: String,
    },

    /// Delete a stored workflow with its instances and records.
    #[command(alias = "rm")]
    Delete {
        /// Workflow ID.
        workflow_id: String,
    },

    /// Start a run by hand. Ctrl+C cancels it.
    Run {
        /// Workflow ID.
        workflow_id: String,

        /// JSON payload handed to the start node.
        #[arg(long)]
        payload: Option<String>,
    },

    /// Deliver a trigger payload to an enabled workflow.
    Trigger {
        /// Workflow ID.
        workflow_id: String,

        /// JSON payload for the trigger.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Resume a paused instance from the node that paused it.
    Resume {
        /// Instance ID.
        instance_id: String,
    },

    /// Approve or decline a confirm node, then resume the instance.
    Decide {
        /// Instance ID.
        instance_id: String,

        /// ID of the confirm node.
        node_id: String,

        /// The decision.
        #[arg(value_enum)]
        decision: DecisionArg,

        /// User making the decision; must be one of the node's confirmers.
        #[arg(long, env = "WAYPOINT_USER")]
        by: String,
    },

    /// Execute a single node of a workflow file without storing anything.
    Preview {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// ID of the node to execute.
        node_id: String,
    },

    /// List instances of a workflow, newest first.
    Instances {
        /// Workflow ID.
        workflow_id: String,

        /// Only show instances with this status.
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the per-node records of an instance.
    Records {
        /// Instance ID.
        instance_id: String,
    },

    /// List confirm requests waiting for a decision.
    Pending,
}

/// Final decision on a confirm node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Decline,
}

impl From<DecisionArg> for ConfirmDecision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => ConfirmDecision::Approved,
            DecisionArg::Decline => ConfirmDecision::Declined,
        }
    }
}

/// Instance status filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Running,
    Completed,
    Failed,
    Paused,
    Aborted,
}

impl From<StatusArg> for InstanceStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Running => InstanceStatus::Running,
            StatusArg::Completed => InstanceStatus::Completed,
            StatusArg::Failed => InstanceStatus::Failed,
            StatusArg::Paused => InstanceStatus::Paused,
            StatusArg::Aborted => InstanceStatus::Aborted,
        }
    }
}

/// Commands that only read or rewrite a definition file.
pub fn is_offline(cmd: &WorkflowCommand) -> bool {
    matches!(
        cmd,
        WorkflowCommand::Validate { .. }
            | WorkflowCommand::Order { .. }
            | WorkflowCommand::RemoveNode { .. }
    )
}

/// Handle an offline subcommand; no database is opened.
pub async fn handle_offline_command(cmd: WorkflowCommand, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Validate { file, import } => handle_validate(&file, import, json).await,
        WorkflowCommand::Order { file } => handle_order(&file, json).await,
        WorkflowCommand::RemoveNode {
            file,
            node_id,
            dry_run,
        } => handle_remove_node(&file, &node_id, dry_run, json).await,
        _ => bail!("command needs the workflow database"),
    }
}

/// Handle a subcommand that uses the repository.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Apply {
            file,
            id,
            write_back,
        } => handle_apply(&file, id, write_back, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show { workflow_id } => handle_show(&workflow_id, state, json).await,
        WorkflowCommand::Enable { workflow_id } => {
            handle_set_status(&workflow_id, WorkflowStatus::Enabled, state, json).await
        }
        WorkflowCommand::Disable { workflow_id } => {
            handle_set_status(&workflow_id, WorkflowStatus::Disabled, state, json).await
        }
        WorkflowCommand::Delete { workflow_id } => handle_delete(&workflow_id, state, json).await,
        WorkflowCommand::Run {
            workflow_id,
            payload,
        } => {
            let payload = payload.as_deref().map(parse_payload).transpose()?;
            let runner = state.runner();
            let report = drive(
                &runner,
                runner.start(&workflow_id, RunSource::Manual, payload),
                json,
            )
            .await?;
            print_run_report(&report, json)
        }
        WorkflowCommand::Trigger {
            workflow_id,
            payload,
        } => {
            let payload = parse_payload(&payload)?;
            let runner = state.runner();
            match drive(&runner, runner.trigger(&workflow_id, payload), json).await? {
                Some(report) => print_run_report(&report, json),
                None => {
                    if json {
                        println!("{}", serde_json::json!({ "started": false }));
                    } else {
                        println!();
                        println!("  Trigger filtered the payload out; no run started.");
                        println!();
                    }
                    Ok(())
                }
            }
        }
        WorkflowCommand::Resume { instance_id } => {
            let runner = state.runner();
            let report = drive(&runner, runner.resume(&instance_id), json).await?;
            print_run_report(&report, json)
        }
        WorkflowCommand::Decide {
            instance_id,
            node_id,
            decision,
            by,
        } => {
            let runner = state.runner();
            let report = drive(
                &runner,
                runner.decide(&instance_id, &node_id, decision.into(), &by),
                json,
            )
            .await?;
            print_run_report(&report, json)
        }
        WorkflowCommand::Preview { file, node_id } => {
            handle_preview(&file, &node_id, state, json).await
        }
        WorkflowCommand::Instances {
            workflow_id,
            status,
            limit,
        } => handle_instances(&workflow_id, status.map(Into::into), limit, state, json).await,
        WorkflowCommand::Records { instance_id } => {
            handle_records(&instance_id, state, json).await
        }
        WorkflowCommand::Pending => handle_pending(state, json).await,
        WorkflowCommand::Validate { .. }
        | WorkflowCommand::Order { .. }
        | WorkflowCommand::RemoveNode { .. } => handle_offline_command(cmd, json).await,
    }
}

// ---------------------------------------------------------------------------
// Offline
// ---------------------------------------------------------------------------

async fn handle_validate(file: &Path, import: bool, json: bool) -> Result<()> {
    let workflow = load_workflow_file(file).await?;
    let report = validate_workflow(
        &workflow,
        ValidateOptions {
            import_mode: import,
        },
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        if report.fatal.is_empty() && report.risk.is_empty() {
            println!(
                "  {} '{}' is valid",
                style("*").green().bold(),
                style(&workflow.name).cyan()
            );
        }
        print_issues("fatal", &report.fatal);
        print_issues("risk", &report.risk);
        println!();
    }

    if report.is_fatal() {
        bail!("validation failed: {report}");
    }
    Ok(())
}

async fn handle_order(file: &Path, json: bool) -> Result<()> {
    let workflow = load_workflow_file(file).await?;
    let order = NodeIterator::new(&workflow).ordered_ids(&workflow.start_node_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&order)?);
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("#"),
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Class"),
            Cell::new("Type"),
        ]);
    for (i, id) in order.iter().enumerate() {
        let (class, node_type) = workflow
            .node(id)
            .map(|n| (n.class.clone(), n.node_type.to_string()))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(i + 1),
            Cell::new(id),
            Cell::new(class),
            Cell::new(node_type),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_remove_node(file: &Path, node_id: &str, dry_run: bool, json: bool) -> Result<()> {
    let mut workflow = load_workflow_file(file).await?;
    let material = NodeIterator::new(&workflow).delete_material(node_id)?;
    let removed: Vec<String> = material.node_ids().into_iter().map(str::to_string).collect();

    if !dry_run {
        remove_material(&mut workflow, &material);
        save_workflow_file(file, &workflow).await?;
    }

    if json {
        let out = serde_json::json!({
            "removed": removed,
            "predecessor": material.predecessor,
            "written": !dry_run,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        let verb = if dry_run { "Would remove" } else { "Removed" };
        println!(
            "  {} {verb} {} node(s): {}",
            style("*").green().bold(),
            removed.len(),
            style(removed.join(", ")).cyan()
        );
        if let Some(pred) = &material.predecessor {
            println!("  Relinked: {pred}");
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

async fn handle_apply(
    file: &Path,
    id: Option<String>,
    write_back: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let mut workflow = load_workflow_file(file).await?;
    if let Some(id) = id {
        workflow.id = id;
    }

    let outcome = state.applier().apply(workflow).await?;
    if write_back {
        save_workflow_file(file, &outcome.workflow).await?;
    }

    let trigger_status = outcome
        .trigger
        .as_ref()
        .map(|t| format!("{:?}", t.status).to_lowercase());

    if json {
        let out = serde_json::json!({
            "id": outcome.workflow.id,
            "name": outcome.workflow.name,
            "created": outcome.is_new,
            "status": outcome.workflow.status,
            "nodes": outcome.workflow.nodes.len(),
            "trigger": trigger_status,
            "risks": outcome.risks,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        let verb = if outcome.is_new { "Created" } else { "Updated" };
        println!();
        println!(
            "  {} {verb} workflow '{}'",
            style("*").green().bold(),
            style(&outcome.workflow.name).cyan()
        );
        println!("  ID: {}", outcome.workflow.id);
        println!("  Nodes: {}", outcome.workflow.nodes.len());
        println!("  Status: {}", format_workflow_status(outcome.workflow.status));
        if let Some(status) = &trigger_status {
            println!("  Trigger: {status}");
        }
        print_issues("risk", &outcome.risks);
        println!();
    }
    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.repo.list_workflows().await?;

    if json {
        let out: Vec<_> = workflows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "id": w.id,
                    "name": w.name,
                    "status": w.status,
                    "nodes": w.nodes.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if workflows.is_empty() {
        println!();
        println!("  No workflows stored.");
        println!(
            "  Apply one with: {}",
            style("wpt workflow apply <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("Status"),
            Cell::new("Nodes"),
        ]);
    for w in &workflows {
        table.add_row(vec![
            Cell::new(&w.name),
            Cell::new(&w.id),
            Cell::new(format_workflow_status(w.status)),
            Cell::new(w.nodes.len()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(workflow_id: &str, state: &AppState, json: bool) -> Result<()> {
    let workflow = load_stored(workflow_id, state).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&workflow)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Workflow:").bold(),
        style(&workflow.name).cyan()
    );
    println!("  ID: {}", workflow.id);
    println!("  Status: {}", format_workflow_status(workflow.status));
    if let Some(description) = &workflow.description {
        println!("  Description: {description}");
    }
    println!("  Start: {}", workflow.start_node_id);

    let order = NodeIterator::new(&workflow).ordered_ids(&workflow.start_node_id)?;
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Class"),
            Cell::new("Next"),
        ]);
    for id in &order {
        if let Some(node) = workflow.node(id) {
            let next = if node.transition.is_empty() {
                "-".to_string()
            } else {
                node.transition.clone()
            };
            table.add_row(vec![
                Cell::new(&node.id),
                Cell::new(&node.name),
                Cell::new(&node.class),
                Cell::new(next),
            ]);
        }
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_set_status(
    workflow_id: &str,
    status: WorkflowStatus,
    state: &AppState,
    json: bool,
) -> Result<()> {
    state
        .repo
        .update_workflow_status(workflow_id, status)
        .await
        .with_context(|| format!("Failed to update workflow '{workflow_id}'"))?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "id": workflow_id, "status": status })
        );
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is now {}",
            style("*").green().bold(),
            style(workflow_id).cyan(),
            format_workflow_status(status)
        );
        println!();
    }
    Ok(())
}

async fn handle_delete(workflow_id: &str, state: &AppState, json: bool) -> Result<()> {
    if !state.repo.delete_workflow(workflow_id).await? {
        bail!("Workflow '{workflow_id}' not found");
    }

    if json {
        println!("{}", serde_json::json!({ "deleted": workflow_id }));
    } else {
        println!();
        println!(
            "  {} Deleted workflow '{}'",
            style("*").green().bold(),
            style(workflow_id).cyan()
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Poll a runner operation while printing its events. The first Ctrl+C
/// cancels the instance once its ID is known.
async fn drive<T, F>(runner: &ConcreteRunner, run: F, json: bool) -> Result<T>
where
    F: Future<Output = Result<T, RunnerError>>,
{
    let mut events = runner.subscribe();
    tokio::pin!(run);
    let mut instance_id: Option<String> = None;
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => {
                if let Ok(event) = event {
                    if let WorkflowEvent::RunStarted { instance_id: id, .. } = &event {
                        instance_id = Some(id.clone());
                    }
                    if !json {
                        print_event(&event);
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                match &instance_id {
                    Some(id) if runner.cancel(id) => eprintln!("  cancelling {id}..."),
                    _ => eprintln!("  nothing to cancel yet"),
                }
            }
            output = &mut run => return Ok(output?),
        }
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted {
            instance_id,
            resumed,
            ..
        } => {
            let verb = if *resumed { "resumed" } else { "started" };
            println!("  {} instance {} {verb}", style(">").dim(), style(instance_id).cyan());
        }
        WorkflowEvent::NodeCompleted {
            node_id,
            duration_ms,
            ..
        } => println!(
            "  {} {node_id} {}",
            style("✓").green(),
            style(format!("{duration_ms}ms")).dim()
        ),
        WorkflowEvent::NodeFailed { node_id, error, .. } => {
            println!("  {} {node_id}: {}", style("✗").red(), style(error).red())
        }
        _ => {}
    }
}

fn print_run_report(report: &RunReport, json: bool) -> Result<()> {
    let result = &report.result;
    let instance = &report.instance;

    if json {
        let out = serde_json::json!({
            "instance": instance,
            "outcome": instance.status,
            "steps": result.steps,
            "paused_node_id": result.paused_node_id,
            "resume_node_id": result.resume_node_id,
            "pause_reason": result.pause_reason,
            "failed_node_id": result.failed_node_id,
            "error": result.error.as_ref().map(ToString::to_string),
            "outputs": outputs(result),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} ({} steps)",
            style("Instance:").bold(),
            style(&instance.id).cyan(),
            result.steps
        );
        println!("  Outcome: {}", style_instance_status(instance.status));
        if let (Some(node), Some(reason)) = (&result.paused_node_id, &result.pause_reason) {
            println!("  Paused at {node}: {reason}");
            if let Some(outer) = result.resume_node_id.as_deref().filter(|id| *id != node.as_str()) {
                println!("  Resumes through: {outer}");
            }
            println!(
                "  Continue with: {}",
                style(format!("wpt workflow decide {} {node} approve --by <user>", instance.id))
                    .dim()
            );
        }
        if let Some(err) = &result.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
    }

    match result.outcome {
        RunOutcome::Completed | RunOutcome::Paused => Ok(()),
        RunOutcome::Failed | RunOutcome::Aborted => {
            bail!("instance {} ended {:?}", instance.id, result.outcome)
        }
    }
}

/// Output of every executed node, keyed by node ID.
fn outputs(result: &ExecutionResult) -> Value {
    let map = result
        .records
        .iter()
        .filter(|r| r.executed)
        .map(|r| (r.node_id.clone(), r.output.clone()))
        .collect();
    Value::Object(map)
}

async fn handle_preview(file: &Path, node_id: &str, state: &AppState, json: bool) -> Result<()> {
    let workflow = load_workflow_file(file).await?;
    let result = state.runner().preview(&workflow, node_id).await?;
    let record = result.record(node_id);

    if json {
        let out = serde_json::json!({
            "node_id": node_id,
            "outcome": result.outcome.instance_status(),
            "input": record.map(|r| r.input.clone()),
            "output": record.map(|r| r.output.clone()),
            "error": result.error.as_ref().map(ToString::to_string),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {} -> {}",
            style("Preview:").bold(),
            style(node_id).cyan(),
            style_instance_status(result.outcome.instance_status())
        );
        if let Some(record) = record {
            println!("  Input:  {}", record.input);
            println!("  Output: {}", record.output);
        }
        if let Some(err) = &result.error {
            println!("  Error: {}", style(err).red());
        }
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Instances and records
// ---------------------------------------------------------------------------

async fn handle_instances(
    workflow_id: &str,
    status: Option<InstanceStatus>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let instances = state.repo.list_instances(workflow_id, status, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  No instances for workflow '{workflow_id}'.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Source"),
            Cell::new("Steps"),
            Cell::new("Started"),
            Cell::new("At node"),
        ]);
    for i in &instances {
        let at_node = i
            .paused_node_id
            .as_deref()
            .or(i.failed_node_id.as_deref())
            .unwrap_or("-");
        table.add_row(vec![
            Cell::new(&i.id),
            format_instance_status(i.status),
            Cell::new(i.source.as_str()),
            Cell::new(i.steps),
            Cell::new(i.started_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(at_node),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_records(instance_id: &str, state: &AppState, json: bool) -> Result<()> {
    let instance = state
        .repo
        .get_instance(instance_id)
        .await?
        .with_context(|| format!("Instance '{instance_id}' not found"))?;
    let records = state.repo.list_instance_nodes(instance_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} {}",
        style("Instance:").bold(),
        style(&instance.id).cyan(),
        style_instance_status(instance.status)
    );
    if let Some(err) = &instance.error {
        println!("  Error: {}", style(err).red());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Class"),
            Cell::new("Duration"),
            Cell::new("Output"),
        ]);
    for r in &records {
        table.add_row(vec![
            Cell::new(&r.node_id),
            format_record_status(r.status),
            Cell::new(&r.class),
            Cell::new(format!("{}ms", r.duration_ms)),
            Cell::new(truncate(&r.output.to_string(), 60)),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_pending(state: &AppState, json: bool) -> Result<()> {
    let pending = state.repo.list_pending_confirms().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!();
        println!("  No confirm requests waiting.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Instance").fg(Color::Cyan),
            Cell::new("Node"),
            Cell::new("Description"),
            Cell::new("Confirmers"),
            Cell::new("Expires"),
        ]);
    for c in &pending {
        table.add_row(vec![
            Cell::new(&c.workflow_instance_id),
            Cell::new(&c.node_id),
            Cell::new(&c.description),
            Cell::new(c.confirmers.join(", ")),
            Cell::new(c.expires_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn load_stored(workflow_id: &str, state: &AppState) -> Result<Workflow> {
    state
        .repo
        .get_workflow(workflow_id)
        .await?
        .with_context(|| format!("Workflow '{workflow_id}' not found"))
}

fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Invalid JSON payload")
}

fn print_issues(label: &str, issues: &[Issue]) {
    for issue in issues {
        let tag = match label {
            "fatal" => style(label).red().bold(),
            _ => style(label).yellow(),
        };
        println!("  {tag}: {issue}");
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

fn format_workflow_status(status: WorkflowStatus) -> String {
    match status {
        WorkflowStatus::Enabled => style("enabled").green().to_string(),
        WorkflowStatus::Disabled => style("disabled").dim().to_string(),
    }
}

fn style_instance_status(status: InstanceStatus) -> String {
    let label = instance_status_label(status);
    match status {
        InstanceStatus::Running => style(label).blue().to_string(),
        InstanceStatus::Completed => style(label).green().to_string(),
        InstanceStatus::Failed => style(label).red().to_string(),
        InstanceStatus::Paused => style(label).magenta().to_string(),
        InstanceStatus::Aborted => style(label).yellow().to_string(),
    }
}

fn instance_status_label(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Running => "running",
        InstanceStatus::Completed => "completed",
        InstanceStatus::Failed => "failed",
        InstanceStatus::Paused => "paused",
        InstanceStatus::Aborted => "aborted",
    }
}

fn format_instance_status(status: InstanceStatus) -> Cell {
    match status {
        InstanceStatus::Running => Cell::new("running").fg(Color::Blue),
        InstanceStatus::Completed => Cell::new("completed").fg(Color::Green),
        InstanceStatus::Failed => Cell::new("failed").fg(Color::Red),
        InstanceStatus::Paused => Cell::new("paused").fg(Color::Magenta),
        InstanceStatus::Aborted => Cell::new("aborted").fg(Color::DarkYellow),
    }
}

fn format_record_status(status: NodeRunStatus) -> Cell {
    match status {
        NodeRunStatus::Completed => Cell::new("completed").fg(Color::Green),
        NodeRunStatus::Failed => Cell::new("failed").fg(Color::Red),
        NodeRunStatus::Paused => Cell::new("paused").fg(Color::Magenta),
    }
}
