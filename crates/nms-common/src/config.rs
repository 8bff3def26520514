//! Server configuration: a JSON file assigning tasks to agents.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::Task;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// A task with the agent it belongs to, as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub agent_id: String,
    #[serde(flatten)]
    pub task: Task,
}

/// The server's configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub tasks: Vec<TaskAssignment>,
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ServerConfig, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Group the assignments by agent.
    pub fn tasks_by_agent(&self) -> HashMap<String, Vec<Task>> {
        let mut by_agent: HashMap<String, Vec<Task>> = HashMap::new();
        for assignment in &self.tasks {
            by_agent
                .entry(assignment.agent_id.clone())
                .or_default()
                .push(assignment.task.clone());
        }
        by_agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_groups_by_agent() {
        let json = r#"{
            "tasks": [
                {"agent_id": "a1", "task_id": "t1", "frequency": 20},
                {"agent_id": "a1", "task_id": "t2", "frequency": 60},
                {"agent_id": "a2", "task_id": "t3", "frequency": 30}
            ]
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        let by_agent = config.tasks_by_agent();
        assert_eq!(by_agent["a1"].len(), 2);
        assert_eq!(by_agent["a2"].len(), 1);
        assert_eq!(by_agent["a2"][0].task_id, "t3");
    }

    #[test]
    fn empty_config_is_valid() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert!(config.tasks.is_empty());
        assert!(config.tasks_by_agent().is_empty());
    }
}
