//! Application state wiring the engine together.
//!
//! AppState holds the data directory, engine config, database pool and node
//! registry. The applier and runner are generic over the repository; AppState
//! pins them to the SQLite implementation.

use std::path::PathBuf;
use std::sync::Arc;

use waypoint_core::node::{NodeRegistry, Passthrough, SetVariables, SpecInfo, TriggerPolicy};
use waypoint_core::workflow::{WorkflowApplier, WorkflowRunner};
use waypoint_infra::config::{load_engine_config, resolve_max_steps};
use waypoint_infra::filesystem::resolve_data_dir;
use waypoint_infra::sqlite::{DatabasePool, SqliteWorkflowRepository};
use waypoint_types::config::EngineConfig;

/// Trigger started by an incoming webhook payload. Activates on first apply.
pub const WEBHOOK_TRIGGER: &str = "webhook#receive";
/// Trigger only started by hand.
pub const MANUAL_TRIGGER: &str = "manual#start";
/// Actor that outputs its resolved input fields.
pub const ECHO_ACTOR: &str = "core#echo";
/// Actor that stores its resolved input fields as variables.
pub const SET_VARS_ACTOR: &str = "core#set_vars";

pub type ConcreteApplier = WorkflowApplier<SqliteWorkflowRepository>;
pub type ConcreteRunner = WorkflowRunner<SqliteWorkflowRepository>;

/// Shared state for every command.
pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub repo: SqliteWorkflowRepository,
    pub registry: Arc<NodeRegistry>,
}

impl AppState {
    /// Resolve the data dir, load `config.toml` and open the database.
    pub async fn init(max_steps: Option<u32>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let mut config = load_engine_config(&data_dir).await;
        config.max_steps = resolve_max_steps(&config, max_steps);

        let db_pool = DatabasePool::open_in(&data_dir).await?;
        tracing::debug!(data_dir = %data_dir.display(), max_steps = config.max_steps, "state ready");

        Ok(Self {
            data_dir,
            config,
            repo: SqliteWorkflowRepository::new(db_pool),
            registry: Arc::new(builtin_registry()?),
        })
    }

    pub fn applier(&self) -> ConcreteApplier {
        WorkflowApplier::new(self.repo.clone(), self.registry.clone())
    }

    pub fn runner(&self) -> ConcreteRunner {
        WorkflowRunner::new(self.repo.clone(), self.registry.clone(), &self.config)
    }
}

/// The logic nodes plus the generic classes shipped with the CLI.
pub fn builtin_registry() -> anyhow::Result<NodeRegistry> {
    let mut registry = NodeRegistry::with_logic_nodes();
    registry.register(
        SpecInfo::trigger(WEBHOOK_TRIGGER, TriggerPolicy::EnableAtFirst),
        || Passthrough::new(WEBHOOK_TRIGGER),
    )?;
    registry.register(SpecInfo::trigger(MANUAL_TRIGGER, TriggerPolicy::Manual), || {
        Passthrough::new(MANUAL_TRIGGER)
    })?;
    registry.register(SpecInfo::actor(ECHO_ACTOR), || Passthrough::new(ECHO_ACTOR))?;
    registry.register(SpecInfo::actor(SET_VARS_ACTOR), || {
        SetVariables::new(SET_VARS_ACTOR)
    })?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_types::workflow::{CONFIRM_CLASS, FOREACH_CLASS, NodeType, SWITCH_CLASS};

    #[test]
    fn test_builtin_registry_classes() {
        let registry = builtin_registry().unwrap();
        for class in [
            SWITCH_CLASS,
            FOREACH_CLASS,
            CONFIRM_CLASS,
            WEBHOOK_TRIGGER,
            MANUAL_TRIGGER,
            ECHO_ACTOR,
            SET_VARS_ACTOR,
        ] {
            assert!(registry.contains(class), "{class} missing");
        }
        let manual = registry.spec(MANUAL_TRIGGER).unwrap();
        assert_eq!(manual.node_type, NodeType::Trigger);
        assert_eq!(manual.trigger_policy, Some(TriggerPolicy::Manual));
    }
}
