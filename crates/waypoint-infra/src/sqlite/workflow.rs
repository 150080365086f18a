//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `waypoint-core` using sqlx with split
//! read/write pools. Nodes are stored one row per node with their static
//! data as a JSON column; an apply plan is written in a single transaction.
//! Enums are stored as their snake_case serde names.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use waypoint_core::repository::workflow::{ApplyPlan, WorkflowRepository};
use waypoint_types::error::RepositoryError;
use waypoint_types::workflow::{
    ConfirmDecision, ConfirmRecord, Credential, InstanceStatus, Node, NodeRunStatus, Trigger,
    TriggerStatus, Workflow, WorkflowInstance, WorkflowInstanceNode, WorkflowStatus, new_id,
};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_nodes(&self, workflow_id: &str) -> Result<Vec<Node>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM nodes WHERE workflow_id = ? ORDER BY position")
            .bind(workflow_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| NodeRow::from_row(row).map_err(db_err)?.into_node())
            .collect()
    }

    async fn with_nodes(&self, row: &SqliteRow) -> Result<Workflow, RepositoryError> {
        let mut workflow = WorkflowRow::from_row(row).map_err(db_err)?.into_workflow()?;
        workflow.nodes = self.load_nodes(&workflow.id).await?;
        Ok(workflow)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct WorkflowRow {
    id: String,
    name: String,
    description: Option<String>,
    status: String,
    start_node_id: String,
}

impl WorkflowRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            start_node_id: row.try_get("start_node_id")?,
        })
    }

    /// Nodes are loaded separately.
    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        Ok(Workflow {
            status: enum_from_str::<WorkflowStatus>(&self.status, "workflow status")?,
            id: self.id,
            name: self.name,
            description: self.description,
            start_node_id: self.start_node_id,
            nodes: Vec::new(),
        })
    }
}

struct NodeRow {
    id: String,
    name: String,
    class: String,
    node_type: String,
    transition: String,
    data: String,
}

impl NodeRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            class: row.try_get("class")?,
            node_type: row.try_get("node_type")?,
            transition: row.try_get("transition")?,
            data: row.try_get("data")?,
        })
    }

    fn into_node(self) -> Result<Node, RepositoryError> {
        Ok(Node {
            node_type: enum_from_str(&self.node_type, "node type")?,
            data: serde_json::from_str(&self.data)
                .map_err(|e| RepositoryError::Query(format!("invalid node data JSON: {e}")))?,
            id: self.id,
            name: self.name,
            class: self.class,
            transition: self.transition,
        })
    }
}

struct InstanceRow {
    id: String,
    workflow_id: String,
    status: String,
    source: String,
    trigger_payload: Option<String>,
    steps: i64,
    paused_node_id: Option<String>,
    resume_node_id: Option<String>,
    failed_node_id: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            source: row.try_get("source")?,
            trigger_payload: row.try_get("trigger_payload")?,
            steps: row.try_get("steps")?,
            paused_node_id: row.try_get("paused_node_id")?,
            resume_node_id: row.try_get("resume_node_id")?,
            failed_node_id: row.try_get("failed_node_id")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let trigger_payload = self
            .trigger_payload
            .as_deref()
            .map(|s| parse_json(s, "trigger_payload"))
            .transpose()?;

        Ok(WorkflowInstance {
            status: enum_from_str(&self.status, "instance status")?,
            source: enum_from_str(&self.source, "run source")?,
            trigger_payload,
            steps: u32::try_from(self.steps).unwrap_or(u32::MAX),
            started_at: parse_datetime(&self.started_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            id: self.id,
            workflow_id: self.workflow_id,
            paused_node_id: self.paused_node_id,
            resume_node_id: self.resume_node_id,
            failed_node_id: self.failed_node_id,
            error: self.error,
        })
    }
}

struct InstanceNodeRow {
    id: String,
    workflow_id: String,
    workflow_instance_id: String,
    node_id: String,
    status: String,
    class: String,
    duration_ms: i64,
    input: String,
    output: String,
    start_time: String,
    source: String,
    sample_resource_id: String,
    sample_version: String,
}

impl InstanceNodeRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            class: row.try_get("class")?,
            duration_ms: row.try_get("duration_ms")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            start_time: row.try_get("start_time")?,
            source: row.try_get("source")?,
            sample_resource_id: row.try_get("sample_resource_id")?,
            sample_version: row.try_get("sample_version")?,
        })
    }

    fn into_record(self) -> Result<WorkflowInstanceNode, RepositoryError> {
        Ok(WorkflowInstanceNode {
            status: enum_from_str(&self.status, "node run status")?,
            source: enum_from_str(&self.source, "run source")?,
            input: parse_json(&self.input, "record input")?,
            output: parse_json(&self.output, "record output")?,
            start_time: parse_datetime(&self.start_time)?,
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_instance_id: self.workflow_instance_id,
            node_id: self.node_id,
            class: self.class,
            duration_ms: self.duration_ms,
            sample_resource_id: self.sample_resource_id,
            sample_version: self.sample_version,
        })
    }
}

struct ConfirmRow {
    id: String,
    workflow_id: String,
    workflow_instance_id: String,
    node_id: String,
    description: String,
    confirmers: String,
    decision: String,
    decided_by: Option<String>,
    created_at: String,
    expires_at: String,
    resolved_at: Option<String>,
}

impl ConfirmRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            node_id: row.try_get("node_id")?,
            description: row.try_get("description")?,
            confirmers: row.try_get("confirmers")?,
            decision: row.try_get("decision")?,
            decided_by: row.try_get("decided_by")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }

    fn into_record(self) -> Result<ConfirmRecord, RepositoryError> {
        let confirmers: Vec<String> = serde_json::from_str(&self.confirmers)
            .map_err(|e| RepositoryError::Query(format!("invalid confirmers JSON: {e}")))?;

        Ok(ConfirmRecord {
            confirmers,
            decision: enum_from_str(&self.decision, "confirm decision")?,
            created_at: parse_datetime(&self.created_at)?,
            expires_at: parse_datetime(&self.expires_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_datetime).transpose()?,
            id: self.id,
            workflow_id: self.workflow_id,
            workflow_instance_id: self.workflow_instance_id,
            node_id: self.node_id,
            description: self.description,
            decided_by: self.decided_by,
        })
    }
}

struct TriggerRow {
    id: String,
    workflow_id: String,
    node_id: String,
    class: String,
    status: String,
    config: String,
    created_at: String,
    updated_at: String,
}

impl TriggerRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            node_id: row.try_get("node_id")?,
            class: row.try_get("class")?,
            status: row.try_get("status")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_trigger(self) -> Result<Trigger, RepositoryError> {
        Ok(Trigger {
            status: enum_from_str(&self.status, "trigger status")?,
            config: parse_json(&self.config, "trigger config")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            id: self.id,
            workflow_id: self.workflow_id,
            node_id: self.node_id,
            class: self.class,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Unique-constraint violations surface as `Conflict`.
fn db_err(e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return RepositoryError::Conflict(db_err.message().to_string());
        }
    }
    RepositoryError::Query(e.to_string())
}

/// Fixed-width UTC timestamps, so text order is chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_json(s: &str, what: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what}: {e}")))
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn enum_to_str<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Err(RepositoryError::Query(format!(
            "expected a string enum, got {other}"
        ))),
        Err(e) => Err(RepositoryError::Query(e.to_string())),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn apply_workflow(&self, plan: &ApplyPlan) -> Result<(), RepositoryError> {
        let workflow = &plan.workflow;
        let now = format_datetime(&Utc::now());
        let status = enum_to_str(&workflow.status)?;
        let positions: HashMap<&str, i64> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i as i64))
            .collect();
        let position_of = |id: &str| {
            positions
                .get(id)
                .copied()
                .unwrap_or(workflow.nodes.len() as i64)
        };

        // Dropping the transaction without commit rolls everything back.
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        if plan.is_new {
            sqlx::query(
                "INSERT INTO workflows (id, name, description, status, start_node_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&workflow.id)
            .bind(&workflow.name)
            .bind(&workflow.description)
            .bind(&status)
            .bind(&workflow.start_node_id)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| match db_err(e) {
                RepositoryError::Conflict(_) => {
                    RepositoryError::Conflict(format!("workflow {} already exists", workflow.id))
                }
                other => other,
            })?;
        } else {
            let result = sqlx::query(
                "UPDATE workflows
                 SET name = ?, description = ?, status = ?, start_node_id = ?, updated_at = ?
                 WHERE id = ?",
            )
            .bind(&workflow.name)
            .bind(&workflow.description)
            .bind(&status)
            .bind(&workflow.start_node_id)
            .bind(&now)
            .bind(&workflow.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
        }

        for node_id in &plan.delete_node_ids {
            sqlx::query("DELETE FROM nodes WHERE workflow_id = ? AND id = ?")
                .bind(&workflow.id)
                .bind(node_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        for node in &plan.update_nodes {
            let result = sqlx::query(
                "UPDATE nodes
                 SET name = ?, class = ?, node_type = ?, transition = ?, data = ?, position = ?
                 WHERE workflow_id = ? AND id = ?",
            )
            .bind(&node.name)
            .bind(&node.class)
            .bind(enum_to_str(&node.node_type)?)
            .bind(&node.transition)
            .bind(to_json(&node.data, "node data")?)
            .bind(position_of(&node.id))
            .bind(&workflow.id)
            .bind(&node.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(RepositoryError::NotFound);
            }
        }

        for node in &plan.insert_nodes {
            sqlx::query(
                "INSERT INTO nodes (workflow_id, id, name, class, node_type, transition, data, position)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&workflow.id)
            .bind(&node.id)
            .bind(&node.name)
            .bind(&node.class)
            .bind(enum_to_str(&node.node_type)?)
            .bind(&node.transition)
            .bind(to_json(&node.data, "node data")?)
            .bind(position_of(&node.id))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;

        tracing::debug!(
            workflow_id = %workflow.id,
            inserted = plan.insert_nodes.len(),
            updated = plan.update_nodes.len(),
            deleted = plan.delete_node_ids.len(),
            "applied workflow"
        );
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(self.with_nodes(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflows ORDER BY name, id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(self.with_nodes(row).await?);
        }
        Ok(workflows)
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflows SET status = ?, updated_at = ? WHERE id = ?")
            .bind(enum_to_str(&status)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let trigger_payload = instance
            .trigger_payload
            .as_ref()
            .map(|p| to_json(p, "trigger_payload"))
            .transpose()?;

        sqlx::query(
            "INSERT INTO workflow_instances
               (id, workflow_id, status, source, trigger_payload, steps, paused_node_id,
                resume_node_id, failed_node_id, error, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id)
        .bind(&instance.workflow_id)
        .bind(enum_to_str(&instance.status)?)
        .bind(enum_to_str(&instance.source)?)
        .bind(&trigger_payload)
        .bind(i64::from(instance.steps))
        .bind(&instance.paused_node_id)
        .bind(&instance.resume_node_id)
        .bind(&instance.failed_node_id)
        .bind(&instance.error)
        .bind(format_datetime(&instance.started_at))
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn update_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances
             SET status = ?, steps = ?, paused_node_id = ?, resume_node_id = ?,
                 failed_node_id = ?, error = ?,
                 completed_at = ?
             WHERE id = ?",
        )
        .bind(enum_to_str(&instance.status)?)
        .bind(i64::from(instance.steps))
        .bind(&instance.paused_node_id)
        .bind(&instance.resume_node_id)
        .bind(&instance.failed_node_id)
        .bind(&instance.error)
        .bind(instance.completed_at.as_ref().map(format_datetime))
        .bind(&instance.id)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(
                InstanceRow::from_row(&row).map_err(db_err)?.into_instance()?,
            )),
            None => Ok(None),
        }
    }

    async fn list_instances(
        &self,
        workflow_id: &str,
        status: Option<InstanceStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => sqlx::query(
                "SELECT * FROM workflow_instances WHERE workflow_id = ? AND status = ?
                 ORDER BY started_at DESC LIMIT ?",
            )
            .bind(workflow_id)
            .bind(enum_to_str(&status)?)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await,
            None => sqlx::query(
                "SELECT * FROM workflow_instances WHERE workflow_id = ?
                 ORDER BY started_at DESC LIMIT ?",
            )
            .bind(workflow_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await,
        }
        .map_err(db_err)?;

        rows.iter()
            .map(|row| InstanceRow::from_row(row).map_err(db_err)?.into_instance())
            .collect()
    }

    async fn save_instance_nodes(
        &self,
        records: &[WorkflowInstanceNode],
    ) -> Result<(), RepositoryError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        for record in records {
            sqlx::query(
                "INSERT INTO workflow_instance_nodes
                   (id, workflow_id, workflow_instance_id, node_id, status, class, duration_ms,
                    input, output, start_time, source, sample_resource_id, sample_version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.workflow_id)
            .bind(&record.workflow_instance_id)
            .bind(&record.node_id)
            .bind(enum_to_str(&record.status)?)
            .bind(&record.class)
            .bind(record.duration_ms)
            .bind(to_json(&record.input, "record input")?)
            .bind(to_json(&record.output, "record output")?)
            .bind(format_datetime(&record.start_time))
            .bind(enum_to_str(&record.source)?)
            .bind(&record.sample_resource_id)
            .bind(&record.sample_version)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(())
    }

    async fn list_instance_nodes(
        &self,
        instance_id: &str,
    ) -> Result<Vec<WorkflowInstanceNode>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instance_nodes WHERE workflow_instance_id = ?
             ORDER BY start_time, rowid",
        )
        .bind(instance_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| InstanceNodeRow::from_row(row).map_err(db_err)?.into_record())
            .collect()
    }

    async fn delete_instance_nodes(
        &self,
        instance_id: &str,
        node_id: &str,
        status: NodeRunStatus,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "DELETE FROM workflow_instance_nodes
             WHERE workflow_instance_id = ? AND node_id = ? AND status = ?",
        )
        .bind(instance_id)
        .bind(node_id)
        .bind(enum_to_str(&status)?)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn create_confirm(&self, record: &ConfirmRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO confirms
               (id, workflow_id, workflow_instance_id, node_id, description, confirmers,
                decision, decided_by, created_at, expires_at, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.workflow_id)
        .bind(&record.workflow_instance_id)
        .bind(&record.node_id)
        .bind(&record.description)
        .bind(to_json(&record.confirmers, "confirmers")?)
        .bind(enum_to_str(&record.decision)?)
        .bind(&record.decided_by)
        .bind(format_datetime(&record.created_at))
        .bind(format_datetime(&record.expires_at))
        .bind(record.resolved_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match db_err(e) {
            RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
                "confirm already exists for node {} of instance {}",
                record.node_id, record.workflow_instance_id
            )),
            other => other,
        })?;

        Ok(())
    }

    async fn get_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
    ) -> Result<Option<ConfirmRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM confirms WHERE workflow_instance_id = ? AND node_id = ?",
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => Ok(Some(ConfirmRow::from_row(&row).map_err(db_err)?.into_record()?)),
            None => Ok(None),
        }
    }

    async fn resolve_confirm(
        &self,
        instance_id: &str,
        node_id: &str,
        decision: ConfirmDecision,
        decided_by: Option<&str>,
    ) -> Result<ConfirmRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "SELECT * FROM confirms WHERE workflow_instance_id = ? AND node_id = ?",
        )
        .bind(instance_id)
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or(RepositoryError::NotFound)?;

        let mut record = ConfirmRow::from_row(&row).map_err(db_err)?.into_record()?;
        if record.decision != ConfirmDecision::Pending {
            return Err(RepositoryError::Conflict(format!(
                "confirm for node {node_id} is already {}",
                record.decision.as_str()
            )));
        }

        let resolved_at = Utc::now();
        sqlx::query("UPDATE confirms SET decision = ?, decided_by = ?, resolved_at = ? WHERE id = ?")
            .bind(enum_to_str(&decision)?)
            .bind(decided_by)
            .bind(format_datetime(&resolved_at))
            .bind(&record.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        record.decision = decision;
        record.decided_by = decided_by.map(str::to_string);
        record.resolved_at = Some(resolved_at);
        Ok(record)
    }

    async fn list_pending_confirms(&self) -> Result<Vec<ConfirmRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM confirms WHERE decision = ? ORDER BY created_at")
            .bind(enum_to_str(&ConfirmDecision::Pending)?)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;

        rows.iter()
            .map(|row| ConfirmRow::from_row(row).map_err(db_err)?.into_record())
            .collect()
    }

    async fn get_or_create_trigger(
        &self,
        workflow_id: &str,
        node_id: &str,
        class: &str,
    ) -> Result<Trigger, RepositoryError> {
        let now = format_datetime(&Utc::now());

        // Placeholder insert is a no-op when a registration already exists.
        sqlx::query(
            "INSERT INTO triggers (id, workflow_id, node_id, class, status, config, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, '{}', ?, ?)
             ON CONFLICT(workflow_id, node_id) DO NOTHING",
        )
        .bind(new_id())
        .bind(workflow_id)
        .bind(node_id)
        .bind(class)
        .bind(enum_to_str(&TriggerStatus::Inactive)?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        // Read back through the writer so the row just inserted is visible.
        let row = sqlx::query("SELECT * FROM triggers WHERE workflow_id = ? AND node_id = ?")
            .bind(workflow_id)
            .bind(node_id)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(db_err)?;

        TriggerRow::from_row(&row).map_err(db_err)?.into_trigger()
    }

    async fn update_trigger(&self, trigger: &Trigger) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE triggers SET class = ?, status = ?, config = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&trigger.class)
        .bind(enum_to_str(&trigger.status)?)
        .bind(to_json(&trigger.config, "trigger config")?)
        .bind(format_datetime(&trigger.updated_at))
        .bind(&trigger.id)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO credentials (id, adapter_class, name, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               adapter_class = excluded.adapter_class,
               name = excluded.name",
        )
        .bind(&credential.id)
        .bind(&credential.adapter_class)
        .bind(&credential.name)
        .bind(format_datetime(&credential.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn get_credential(&self, id: &str) -> Result<Option<Credential>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let created_at: String = row.try_get("created_at").map_err(db_err)?;
        Ok(Some(Credential {
            id: row.try_get("id").map_err(db_err)?,
            adapter_class: row.try_get("adapter_class").map_err(db_err)?,
            name: row.try_get("name").map_err(db_err)?,
            created_at: parse_datetime(&created_at)?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
