//! Engine configuration loader for Waypoint.
//!
//! Reads `config.toml` from the data directory (`~/.waypoint/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use waypoint_types::config::EngineConfig;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`] (100 step budget).
/// - Unreadable or unparsable file: a warning is logged and the default is
///   returned.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the step budget for a run.
///
/// A command-line override wins over `config.toml`. A budget of zero would
/// abort every run before its first node, so it is raised to one.
pub fn resolve_max_steps(config: &EngineConfig, cli_override: Option<u32>) -> u32 {
    cli_override.unwrap_or(config.max_steps).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_steps, 100);
        assert!(config.authorized_confirmers.is_empty());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
max_steps = 500
event_capacity = 64
confirm_permission = "approvals:write"
authorized_confirmers = ["ops@example.com", "lead@example.com"]
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_steps, 500);
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.confirm_permission, "approvals:write");
        assert_eq!(config.authorized_confirmers.len(), 2);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "max_steps = \"many\" {{")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_steps, 100);
    }

    #[test]
    fn resolve_max_steps_prefers_override() {
        let config = EngineConfig {
            max_steps: 250,
            ..Default::default()
        };
        assert_eq!(resolve_max_steps(&config, Some(10)), 10);
        assert_eq!(resolve_max_steps(&config, None), 250);
    }

    #[test]
    fn resolve_max_steps_enforces_minimum() {
        let config = EngineConfig {
            max_steps: 0,
            ..Default::default()
        };
        assert_eq!(resolve_max_steps(&config, None), 1);
        assert_eq!(resolve_max_steps(&config, Some(0)), 1);
    }
}
