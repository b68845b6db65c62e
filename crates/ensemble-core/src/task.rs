use serde::Deserialize;
use tracing::{error, info};

use crate::EnsembleError;
use crate::operation::{Operation, OperationDeps};
use crate::vars::Vars;

/// Service/tag constraints deciding which nodes run a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Raw manifest shape of a task, before operations are decoded.
#[derive(Debug, Deserialize)]
pub(crate) struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub trigger: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default)]
    pub operations: Vec<serde_json::Value>,
}

/// A task declared in a pattern manifest: an ordered list of operations
/// behind a trigger and a filter.
#[derive(Debug)]
pub struct Task {
    pub pattern: String,
    pub name: String,
    pub trigger: Option<String>,
    pub description: String,
    pub filter: Filter,
    pub operations: Vec<Operation>,
}

impl Task {
    pub(crate) fn decode(spec: TaskSpec, deps: &OperationDeps) -> Result<Self, EnsembleError> {
        Ok(Self {
            pattern: String::new(),
            name: spec.name,
            trigger: spec.trigger,
            description: spec.description,
            filter: spec.filter,
            operations: Operation::decode_all(&spec.operations, deps)?,
        })
    }

    pub fn set_pattern(&mut self, pattern: &str) {
        self.pattern = pattern.to_string();
        for operation in &mut self.operations {
            operation.set_pattern(pattern);
        }
    }

    /// Execute the operations strictly in declared order, aborting on the
    /// first failure.
    pub async fn run(&self, vars: &Vars) -> anyhow::Result<()> {
        info!(task = %self.name, "task started");
        for operation in &self.operations {
            info!(task = %self.name, operation = operation.name(), "operation started");
            if let Err(err) = operation.run(vars).await {
                error!(task = %self.name, operation = operation.name(), "task failed");
                return Err(err);
            }
            info!(task = %self.name, operation = operation.name(), "operation finished successfully");
        }
        info!(task = %self.name, "task finished successfully");
        Ok(())
    }

    /// Multi-line rendering for status output and debugging.
    pub fn describe(&self) -> String {
        let mut lines = vec![
            format!("Task {}", self.name),
            format!("  Pattern: {}", self.pattern),
            format!("  Trigger: {}", self.trigger.as_deref().unwrap_or("-")),
            format!("  Description: {}", self.description),
            format!(
                "  Filter: service={} tag={}",
                self.filter.service.as_deref().unwrap_or("-"),
                self.filter.tag.as_deref().unwrap_or("-")
            ),
            "  Operations:".to_string(),
        ];
        for operation in &self.operations {
            lines.push(format!("    {}", operation.name()));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::kvs::MemoryKvs;
    use crate::operation::RunnerSettings;

    fn deps(base: PathBuf) -> OperationDeps {
        OperationDeps {
            kvs: Arc::new(MemoryKvs::new()),
            settings: Arc::new(RunnerSettings {
                shell: "/bin/sh".to_string(),
                base_dir: base,
                remote_config_command: "true".to_string(),
                roles: vec!["web".to_string()],
            }),
        }
    }

    fn decode_task(raw: serde_json::Value, deps: &OperationDeps) -> Task {
        let spec: TaskSpec = serde_json::from_value(raw).unwrap();
        let mut task = Task::decode(spec, deps).unwrap();
        task.set_pattern("blog");
        task
    }

    #[tokio::test]
    async fn operations_run_in_order_and_abort_on_failure() {
        let base = tempfile::tempdir().unwrap();
        let pattern_dir = base.path().join("patterns/blog");
        std::fs::create_dir_all(&pattern_dir).unwrap();
        let deps = deps(base.path().to_path_buf());

        let marker = pattern_dir.join("ran");
        let task = decode_task(
            json!({
                "name": "configure",
                "trigger": "deploy",
                "operations": [
                    {"type": "execute", "script": format!("touch {}", marker.display())},
                    {"type": "execute", "script": "exit 1"},
                    {"type": "execute", "script": format!("rm {}", marker.display())},
                ],
            }),
            &deps,
        );

        task.run(&HashMap::new()).await.unwrap_err();
        // The first operation ran, the one after the failure did not.
        assert!(marker.exists());
    }

    #[test]
    fn unknown_operation_kind_fails_the_whole_task_decode() {
        let base = tempfile::tempdir().unwrap();
        let deps = deps(base.path().to_path_buf());
        let spec: TaskSpec = serde_json::from_value(json!({
            "name": "broken",
            "operations": [{"type": "warp"}],
        }))
        .unwrap();

        assert!(matches!(
            Task::decode(spec, &deps).unwrap_err(),
            EnsembleError::Decode(_)
        ));
    }

    #[test]
    fn describe_lists_operations() {
        let base = tempfile::tempdir().unwrap();
        let deps = deps(base.path().to_path_buf());
        let task = decode_task(
            json!({
                "name": "configure",
                "trigger": "deploy",
                "description": "bring the app up",
                "filter": {"service": "web"},
                "operations": [
                    {"type": "remote-config"},
                    {"type": "execute", "script": "echo ok"},
                ],
            }),
            &deps,
        );

        let rendered = task.describe();
        assert!(rendered.contains("Task configure"));
        assert!(rendered.contains("service=web"));
        assert!(rendered.contains("remote-config"));
        assert!(rendered.contains("execute"));
    }
}
