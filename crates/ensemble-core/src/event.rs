use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::NodeRegistration;

/// Externally injected cluster event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One expanded unit of work scheduled on behalf of an event.
///
/// `(event_id, no)` is the cross-node identity of a task instance; `no` is
/// assigned contiguously at expansion time and fixes execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventTask {
    pub pattern: String,
    pub event_id: String,
    pub no: u32,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl EventTask {
    /// Whether `registration` satisfies this task's filter.
    ///
    /// `service` and `tag` each name a role the node must carry; an unset
    /// axis matches every node.
    pub fn matches(&self, registration: &NodeRegistration) -> bool {
        let carries = |label: &Option<String>| match label {
            Some(label) => registration.roles.iter().any(|role| role == label),
            None => true,
        };
        carries(&self.service) && carries(&self.tag)
    }
}
