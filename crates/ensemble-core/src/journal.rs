//! Structured result records persisted at fixed KVS paths.
//!
//! Each path has a single writer per transition (the lock holder for event
//! and task records, the executing node for its own record), so plain
//! idempotent puts are enough and no CAS is involved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EnsembleError;
use crate::keys;
use crate::kvs::KvStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    InProgress,
    Success,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::InProgress => "inprogress",
            Status::Success => "success",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one user event, at `events/<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResult {
    pub id: String,
    pub name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl EventResult {
    pub fn started(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: Status::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub async fn save(&self, kvs: &dyn KvStore) -> Result<(), EnsembleError> {
        kvs.put(&keys::event(&self.id), serde_json::to_vec(self)?)
            .await
    }

    pub async fn load(kvs: &dyn KvStore, id: &str) -> Result<Option<Self>, EnsembleError> {
        match kvs.get(&keys::event(id)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }
}

/// Aggregated outcome of one task instance, at `events/<id>/tasks/<no>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub event_id: String,
    pub no: u32,
    pub name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn started(event_id: impl Into<String>, no: u32, name: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            no,
            name: name.into(),
            status: Status::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub async fn save(&self, kvs: &dyn KvStore) -> Result<(), EnsembleError> {
        kvs.put(
            &keys::task(&self.event_id, self.no),
            serde_json::to_vec(self)?,
        )
        .await
    }

    pub async fn load(
        kvs: &dyn KvStore,
        event_id: &str,
        no: u32,
    ) -> Result<Option<Self>, EnsembleError> {
        match kvs.get(&keys::task(event_id, no)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Every task record written for an event, in ordinal order.
    pub async fn load_all(kvs: &dyn KvStore, event_id: &str) -> Result<Vec<Self>, EnsembleError> {
        let prefix = format!("{}/tasks/", keys::event(event_id));
        let mut results = Vec::new();
        for entry in kvs.list(&prefix).await? {
            // Skip the per-node records nested one level deeper.
            if entry.key[prefix.len()..].contains('/') {
                continue;
            }
            results.push(serde_json::from_slice::<Self>(&entry.value)?);
        }
        results.sort_by_key(|result| result.no);
        Ok(results)
    }
}

/// One node's view of one task instance, at
/// `events/<id>/tasks/<no>/nodes/<node>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTaskResult {
    pub node: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeTaskResult {
    pub fn started(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: Status::InProgress,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finished(mut self, status: Status) -> Self {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self
    }

    pub async fn save(
        &self,
        kvs: &dyn KvStore,
        event_id: &str,
        no: u32,
    ) -> Result<(), EnsembleError> {
        kvs.put(
            &keys::node_task(event_id, no, &self.node),
            serde_json::to_vec(self)?,
        )
        .await
    }

    pub async fn load(
        kvs: &dyn KvStore,
        event_id: &str,
        no: u32,
        node: &str,
    ) -> Result<Option<Self>, EnsembleError> {
        match kvs.get(&keys::node_task(event_id, no, node)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// All node records written for one task instance.
    pub async fn load_all(
        kvs: &dyn KvStore,
        event_id: &str,
        no: u32,
    ) -> Result<Vec<Self>, EnsembleError> {
        let mut results = Vec::new();
        for entry in kvs.list(&keys::task_nodes_prefix(event_id, no)).await? {
            results.push(serde_json::from_slice::<Self>(&entry.value)?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvs::MemoryKvs;

    #[test]
    fn statuses_serialize_to_their_wire_names() {
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"inprogress\""
        );
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), "\"success\"");
        assert_eq!(serde_json::to_string(&Status::Error).unwrap(), "\"error\"");
        assert!(!Status::InProgress.is_terminal());
        assert!(Status::Error.is_terminal());
    }

    #[tokio::test]
    async fn event_result_round_trips() {
        let kvs = MemoryKvs::new();
        let mut result = EventResult::started("e1", "deploy");
        result.save(&kvs).await.unwrap();

        let loaded = EventResult::load(&kvs, "e1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "deploy");
        assert_eq!(loaded.status, Status::InProgress);
        assert!(loaded.finished_at.is_none());

        result.status = Status::Success;
        result.finished_at = Some(Utc::now());
        result.save(&kvs).await.unwrap();
        let loaded = EventResult::load(&kvs, "e1").await.unwrap().unwrap();
        assert_eq!(loaded.status, Status::Success);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn task_results_exclude_node_records() {
        let kvs = MemoryKvs::new();
        TaskResult::started("e1", 0, "configure")
            .save(&kvs)
            .await
            .unwrap();
        TaskResult::started("e1", 1, "restart")
            .save(&kvs)
            .await
            .unwrap();
        NodeTaskResult::started("web-01")
            .save(&kvs, "e1", 0)
            .await
            .unwrap();

        let tasks = TaskResult::load_all(&kvs, "e1").await.unwrap();
        let names: Vec<&str> = tasks.iter().map(|task| task.name.as_str()).collect();
        assert_eq!(names, vec!["configure", "restart"]);

        let nodes = NodeTaskResult::load_all(&kvs, "e1", 0).await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node, "web-01");
    }
}
