//! KVS key layout.
//!
//! Everything the cluster shares lives under one root so several unrelated
//! applications can coexist on the same store. The same name doubles as the
//! top-level key of the parameter document consumed by remote-config runs.

pub const ROOT: &str = "ensemble";

pub const EVENT_QUEUE: &str = "ensemble/queue/events";
pub const PROGRESS_QUEUE: &str = "ensemble/queue/progress";
pub const SCHEDULER_LOCK: &str = "ensemble/lock/scheduler";
pub const SERVERS_PREFIX: &str = "ensemble/servers/";
pub const PARAMETERS: &str = "ensemble/parameters";

pub fn server(node: &str) -> String {
    format!("{SERVERS_PREFIX}{node}")
}

pub fn event(id: &str) -> String {
    format!("{ROOT}/events/{id}")
}

pub fn task(id: &str, no: u32) -> String {
    format!("{ROOT}/events/{id}/tasks/{no}")
}

pub fn task_nodes_prefix(id: &str, no: u32) -> String {
    format!("{ROOT}/events/{id}/tasks/{no}/nodes/")
}

pub fn node_task(id: &str, no: u32, node: &str) -> String {
    format!("{ROOT}/events/{id}/tasks/{no}/nodes/{node}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_paths_nest_under_the_event() {
        assert_eq!(event("e1"), "ensemble/events/e1");
        assert_eq!(task("e1", 2), "ensemble/events/e1/tasks/2");
        assert_eq!(
            node_task("e1", 2, "web-01"),
            "ensemble/events/e1/tasks/2/nodes/web-01"
        );
        assert!(node_task("e1", 2, "web-01").starts_with(&task_nodes_prefix("e1", 2)));
    }
}
