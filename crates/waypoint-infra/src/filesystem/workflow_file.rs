//! Workflow definition files.
//!
//! A workflow is authored as YAML (`.yaml`/`.yml`) or JSON (`.json`). Both
//! map onto the same [`Workflow`] structure.

use std::path::{Path, PathBuf};

use thiserror::Error;
use waypoint_types::workflow::Workflow;

#[derive(Debug, Error)]
pub enum WorkflowFileError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize workflow: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Anything that is not `.json` is treated as YAML.
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

/// Read and parse a workflow file.
pub async fn load_workflow_file(path: &Path) -> Result<Workflow, WorkflowFileError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| WorkflowFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let parsed = match Format::of(path) {
        Format::Json => serde_json::from_str(&content).map_err(|e| e.to_string()),
        Format::Yaml => serde_yaml_ng::from_str(&content).map_err(|e| e.to_string()),
    };
    let workflow: Workflow = parsed.map_err(|message| WorkflowFileError::Parse {
        path: path.to_path_buf(),
        message,
    })?;

    tracing::debug!(
        path = %path.display(),
        workflow = %workflow.name,
        nodes = workflow.nodes.len(),
        "loaded workflow file"
    );
    Ok(workflow)
}

/// Write a workflow back to disk in the format implied by `path`.
pub async fn save_workflow_file(path: &Path, workflow: &Workflow) -> Result<(), WorkflowFileError> {
    let content = match Format::of(path) {
        Format::Json => serde_json::to_string_pretty(workflow)
            .map_err(|e| WorkflowFileError::Serialize(e.to_string()))?,
        Format::Yaml => serde_yaml_ng::to_string(workflow)
            .map_err(|e| WorkflowFileError::Serialize(e.to_string()))?,
    };

    tokio::fs::write(path, content)
        .await
        .map_err(|source| WorkflowFileError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use waypoint_types::workflow::NodeType;

    const TRIAGE_YAML: &str = r#"
name: triage
start_node_id: hook
nodes:
  - id: hook
    name: Hook
    class: webhook#receive
    type: trigger
    transition: route
  - id: route
    name: Route
    class: logic#switch
    type: logic
    data:
      input_fields:
        paths:
          - name: urgent
            conditions:
              - - left: "{{ node.hook.output.priority }}"
                  operation: equals
                  right: high
            transition: ""
          - name: otherwise
            is_default: true
"#;

    #[tokio::test]
    async fn test_load_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("triage.yaml");
        tokio::fs::write(&path, TRIAGE_YAML).await.unwrap();

        let wf = load_workflow_file(&path).await.unwrap();
        assert_eq!(wf.name, "triage");
        assert!(wf.id.is_empty());
        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.nodes[0].node_type, NodeType::Trigger);
        assert!(wf.nodes[1].is_switch());
        assert_eq!(
            wf.nodes[1].data.input_fields["paths"][0]["conditions"][0][0]["right"],
            "high"
        );
    }

    #[tokio::test]
    async fn test_save_then_load_json_keeps_definition() {
        let tmp = TempDir::new().unwrap();
        let yaml_path = tmp.path().join("triage.yml");
        tokio::fs::write(&yaml_path, TRIAGE_YAML).await.unwrap();
        let wf = load_workflow_file(&yaml_path).await.unwrap();

        let json_path = tmp.path().join("triage.json");
        save_workflow_file(&json_path, &wf).await.unwrap();
        let raw = tokio::fs::read_to_string(&json_path).await.unwrap();
        assert!(raw.trim_start().starts_with('{'));

        assert_eq!(load_workflow_file(&json_path).await.unwrap(), wf);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = load_workflow_file(&tmp.path().join("nope.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowFileError::Io { .. }));
    }

    #[tokio::test]
    async fn test_malformed_file_is_parse_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.yaml");
        tokio::fs::write(&path, "name: [unterminated").await.unwrap();

        let err = load_workflow_file(&path).await.unwrap_err();
        assert!(matches!(err, WorkflowFileError::Parse { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }
}
