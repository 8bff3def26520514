//! Task registry: which tasks belong to which agent, straight from the
//! configuration file.

use std::collections::HashMap;

use nms_common::config::ServerConfig;
use nms_common::task::Task;

pub struct TaskRegistry {
    by_agent: HashMap<String, Vec<Task>>,
}

impl TaskRegistry {
    pub fn new(config: &ServerConfig) -> TaskRegistry {
        TaskRegistry {
            by_agent: config.tasks_by_agent(),
        }
    }

    /// Tasks assigned to an agent; empty for an unknown agent.
    pub fn agent_tasks(&self, agent_id: &str) -> &[Task] {
        self.by_agent
            .get(agent_id)
            .map_or(&[], Vec::as_slice)
    }

    pub fn assignment_count(&self) -> usize {
        self.by_agent.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_agent_has_no_tasks() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"tasks":[{"agent_id":"a1","task_id":"t1","frequency":20}]}"#,
        )
        .unwrap();
        let registry = TaskRegistry::new(&config);
        assert_eq!(registry.agent_tasks("a1").len(), 1);
        assert!(registry.agent_tasks("nobody").is_empty());
        assert_eq!(registry.assignment_count(), 1);
    }
}
