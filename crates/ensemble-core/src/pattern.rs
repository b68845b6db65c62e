//! Pattern manifests and event → task expansion.
//!
//! A pattern is a directory bundling a `task.yml` manifest with the assets
//! its operations use. Expansion walks patterns in stable name order so
//! every node derives the same task sequence for a given event.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::EnsembleError;
use crate::operation::OperationDeps;
use crate::task::{Task, TaskSpec};

pub const MANIFEST_FILE: &str = "task.yml";

#[derive(Debug, Deserialize)]
struct ManifestSpec {
    #[serde(default)]
    events: HashMap<String, EventBinding>,
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// What a pattern schedules when a trigger fires: a single task or an
/// ordered sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBinding {
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub ordered_tasks: Vec<TaskRef>,
}

/// Reference to a task from an event binding, optionally narrowing the
/// filter for this slot only.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TaskRef {
    Name(String),
    Detailed {
        task: String,
        #[serde(default)]
        service: Option<String>,
        #[serde(default)]
        tag: Option<String>,
    },
}

impl TaskRef {
    fn task(&self) -> &str {
        match self {
            TaskRef::Name(name) => name,
            TaskRef::Detailed { task, .. } => task,
        }
    }

    fn service(&self) -> Option<&str> {
        match self {
            TaskRef::Name(_) => None,
            TaskRef::Detailed { service, .. } => service.as_deref(),
        }
    }

    fn tag(&self) -> Option<&str> {
        match self {
            TaskRef::Name(_) => None,
            TaskRef::Detailed { tag, .. } => tag.as_deref(),
        }
    }
}

/// One task slot selected for an event, before ordinals are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSelection {
    pub pattern: String,
    pub task: String,
    pub service: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug)]
pub struct Pattern {
    pub name: String,
    pub dir: PathBuf,
    events: HashMap<String, EventBinding>,
    tasks: Vec<Task>,
}

impl Pattern {
    /// Parse a manifest string; `dir` is where the pattern's assets live.
    pub fn from_manifest_str(
        name: impl Into<String>,
        dir: impl Into<PathBuf>,
        manifest: &str,
        deps: &OperationDeps,
    ) -> Result<Self, EnsembleError> {
        let name = name.into();
        let dir = dir.into();
        let spec: ManifestSpec = serde_yaml::from_str(manifest)
            .map_err(|err| EnsembleError::manifest(dir.join(MANIFEST_FILE), err))?;

        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for task_spec in spec.tasks {
            let mut task = Task::decode(task_spec, deps)?;
            task.set_pattern(&name);
            tasks.push(task);
        }

        Ok(Self {
            name,
            dir,
            events: spec.events,
            tasks,
        })
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name == name)
    }

    /// Tasks this pattern schedules for `trigger`, in manifest order.
    ///
    /// An explicit event binding wins; any task whose own `trigger` matches
    /// and is not already covered by the binding follows. A slot's filter
    /// falls back per-axis to the referenced task's filter.
    fn selections_for(&self, trigger: &str) -> Vec<TaskSelection> {
        let mut selections = Vec::new();

        if let Some(binding) = self.events.get(trigger) {
            if let Some(task) = &binding.task {
                selections.push(self.selection(task, None, None));
            }
            for task_ref in &binding.ordered_tasks {
                selections.push(self.selection(
                    task_ref.task(),
                    task_ref.service(),
                    task_ref.tag(),
                ));
            }
        }

        for task in &self.tasks {
            if task.trigger.as_deref() != Some(trigger) {
                continue;
            }
            if selections.iter().any(|selection| selection.task == task.name) {
                continue;
            }
            selections.push(self.selection(&task.name, None, None));
        }

        selections
    }

    fn selection(&self, task: &str, service: Option<&str>, tag: Option<&str>) -> TaskSelection {
        let filter = self.task(task).map(|definition| definition.filter.clone());
        TaskSelection {
            pattern: self.name.clone(),
            task: task.to_string(),
            service: service
                .map(str::to_string)
                .or_else(|| filter.as_ref().and_then(|filter| filter.service.clone())),
            tag: tag
                .map(str::to_string)
                .or_else(|| filter.as_ref().and_then(|filter| filter.tag.clone())),
        }
    }
}

/// All loaded patterns, held in stable name order.
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn from_patterns(mut patterns: Vec<Pattern>) -> Self {
        patterns.sort_by(|a, b| a.name.cmp(&b.name));
        Self { patterns }
    }

    /// Scan `dir` for pattern subdirectories carrying a manifest.
    pub fn load(dir: &Path, deps: &OperationDeps) -> Result<Self, EnsembleError> {
        let mut patterns = Vec::new();
        let entries = fs::read_dir(dir)
            .map_err(|err| EnsembleError::config_io(dir.to_path_buf(), err))?;

        for entry in entries {
            let entry = entry.map_err(|err| EnsembleError::config_io(dir.to_path_buf(), err))?;
            let path = entry.path();
            let manifest_path = path.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let manifest = fs::read_to_string(&manifest_path)
                .map_err(|err| EnsembleError::config_io(manifest_path.clone(), err))?;
            patterns.push(Pattern::from_manifest_str(name, &path, &manifest, deps)?);
        }

        Ok(Self::from_patterns(patterns))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn task(&self, pattern: &str, name: &str) -> Option<&Task> {
        self.patterns
            .iter()
            .find(|candidate| candidate.name == pattern)
            .and_then(|pattern| pattern.task(name))
    }

    /// Every task slot scheduled for `trigger`: manifest order within a
    /// pattern, then stable pattern-name order across patterns.
    pub fn selections_for(&self, trigger: &str) -> Vec<TaskSelection> {
        self.patterns
            .iter()
            .flat_map(|pattern| pattern.selections_for(trigger))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kvs::MemoryKvs;
    use crate::operation::RunnerSettings;

    fn deps() -> OperationDeps {
        OperationDeps {
            kvs: Arc::new(MemoryKvs::new()),
            settings: Arc::new(RunnerSettings {
                shell: "/bin/sh".to_string(),
                base_dir: PathBuf::from("/opt/ensemble"),
                remote_config_command: "true".to_string(),
                roles: vec!["web".to_string()],
            }),
        }
    }

    fn pattern(name: &str, manifest: &str) -> Pattern {
        Pattern::from_manifest_str(name, format!("/opt/ensemble/patterns/{name}"), manifest, &deps())
            .unwrap()
    }

    #[test]
    fn ordered_tasks_expand_in_manifest_order() {
        let set = PatternSet::from_patterns(vec![
            pattern(
                "p2",
                r#"
                events:
                  deploy:
                    task: c
                tasks:
                  - name: c
                    operations: []
                "#,
            ),
            pattern(
                "p1",
                r#"
                events:
                  deploy:
                    ordered_tasks: [a, b]
                tasks:
                  - name: a
                    operations: []
                  - name: b
                    operations: []
                "#,
            ),
        ]);

        let names: Vec<(String, String)> = set
            .selections_for("deploy")
            .into_iter()
            .map(|selection| (selection.pattern, selection.task))
            .collect();
        assert_eq!(
            names,
            vec![
                ("p1".to_string(), "a".to_string()),
                ("p1".to_string(), "b".to_string()),
                ("p2".to_string(), "c".to_string()),
            ]
        );
    }

    #[test]
    fn trigger_matched_tasks_follow_the_binding_without_duplication() {
        let set = PatternSet::from_patterns(vec![pattern(
            "p1",
            r#"
            events:
              deploy:
                ordered_tasks: [a]
            tasks:
              - name: a
                trigger: deploy
                operations: []
              - name: d
                trigger: deploy
                operations: []
              - name: x
                trigger: restart
                operations: []
            "#,
        )]);

        let names: Vec<String> = set
            .selections_for("deploy")
            .into_iter()
            .map(|selection| selection.task)
            .collect();
        assert_eq!(names, vec!["a", "d"]);
    }

    #[test]
    fn slot_filter_falls_back_to_the_task_filter() {
        let set = PatternSet::from_patterns(vec![pattern(
            "p1",
            r#"
            events:
              deploy:
                ordered_tasks:
                  - a
                  - task: a
                    service: db
            tasks:
              - name: a
                filter:
                  service: web
                  tag: primary
                operations: []
            "#,
        )]);

        let selections = set.selections_for("deploy");
        assert_eq!(selections[0].service.as_deref(), Some("web"));
        assert_eq!(selections[0].tag.as_deref(), Some("primary"));
        // The explicit service wins; the tag still falls back.
        assert_eq!(selections[1].service.as_deref(), Some("db"));
        assert_eq!(selections[1].tag.as_deref(), Some("primary"));
    }

    #[test]
    fn malformed_manifest_names_the_file() {
        let err = Pattern::from_manifest_str("p1", "/opt/p1", "events: [not-a-map", &deps())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Manifest { .. }));
        assert!(err.to_string().contains("task.yml"));
    }

    #[test]
    fn load_scans_pattern_directories() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("blog");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            r#"
            tasks:
              - name: a
                trigger: deploy
                operations:
                  - type: execute
                    script: echo ok
            "#,
        )
        .unwrap();
        // Directories without a manifest are skipped.
        std::fs::create_dir_all(root.path().join("empty")).unwrap();

        let set = PatternSet::load(root.path(), &deps()).unwrap();
        assert!(!set.is_empty());
        assert!(set.task("blog", "a").is_some());
        assert_eq!(set.selections_for("deploy").len(), 1);
    }
}
