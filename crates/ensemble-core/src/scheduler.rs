//! Per-node polling loop.
//!
//! Every tick acquires the cluster-wide scheduler lock, inspects the
//! progress queue and takes exactly one step: dispatch the next event,
//! run the head task locally, finalize a task the whole cluster has
//! finished, or wait. The lock gates only the coordination phase; a node
//! that decides to run the head task releases it first, so any number of
//! nodes may execute the same task instance concurrently.

use std::time::Duration;

use chrono::Utc;
use tokio::time::{Instant, sleep};
use tracing::{error, info, instrument, warn};

use crate::EnsembleError;
use crate::event::{Event, EventTask};
use crate::journal::{EventResult, NodeTaskResult, Status, TaskResult};
use crate::keys;
use crate::kvs::DynKvStore;
use crate::metrics;
use crate::pattern::PatternSet;
use crate::queue::CasQueue;
use crate::registry::{NodeRegistration, register_node, registered_nodes};
use crate::vars::Vars;

pub struct Scheduler {
    kvs: DynKvStore,
    patterns: PatternSet,
    node: String,
    roles: Vec<String>,
    poll_interval: Duration,
    events: CasQueue<Event>,
    progress: CasQueue<EventTask>,
}

impl Scheduler {
    pub fn new(
        kvs: DynKvStore,
        patterns: PatternSet,
        node: impl Into<String>,
        roles: Vec<String>,
    ) -> Self {
        let events = CasQueue::new(kvs.clone(), keys::EVENT_QUEUE);
        let progress = CasQueue::new(kvs.clone(), keys::PROGRESS_QUEUE);
        Self {
            kvs,
            patterns,
            node: node.into(),
            roles,
            poll_interval: Duration::from_secs(1),
            events,
            progress,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Publish this node's registration. Fatal when the catalog does not
    /// know us: an unregistered node could never satisfy a filter.
    pub async fn connect(&self) -> Result<(), EnsembleError> {
        register_node(&*self.kvs, &self.node, &self.roles).await?;
        Ok(())
    }

    /// Register, then poll forever. Tick-level errors are logged and the
    /// loop continues; only startup failures propagate.
    pub async fn run(&self) -> Result<(), EnsembleError> {
        self.connect().await?;
        info!(node = %self.node, "scheduler started");

        loop {
            sleep(self.poll_interval).await;
            if let Err(err) = self.poll_once().await {
                metrics::record_tick("error");
                error!(error = %err, "scheduler tick failed");
            }
        }
    }

    /// A single tick: coordination under the cluster lock, then (at most)
    /// one local task execution after the lock is released.
    #[instrument(name = "scheduler.tick", skip(self), fields(node = %self.node))]
    pub async fn poll_once(&self) -> Result<(), EnsembleError> {
        let lock = self.kvs.lock(keys::SCHEDULER_LOCK).await?;

        let event_tasks = self.progress.items().await?;
        let Some(head) = event_tasks.into_iter().next() else {
            return self.dispatch_event().await;
        };

        if self.should_run(&head).await? {
            // Execution is parallelizable across nodes; hand the lock back
            // before the potentially long-running operations start.
            drop(lock);
            metrics::record_tick("run");
            return self.run_task(&head).await;
        }

        if self.task_finished(&head).await? {
            metrics::record_tick("finish");
            return self.finish_task(&head).await;
        }

        metrics::record_tick("wait");
        info!(
            task = %head.task,
            service = head.service.as_deref().unwrap_or("-"),
            tag = head.tag.as_deref().unwrap_or("-"),
            "waiting for task to finish on other nodes"
        );
        Ok(())
    }

    /// Drain one event from the event queue and expand it into ordered
    /// task instances on the progress queue.
    async fn dispatch_event(&self) -> Result<(), EnsembleError> {
        let Some(event) = self.events.dequeue().await? else {
            metrics::record_tick("idle");
            return Ok(());
        };
        info!(id = %event.id, name = %event.name, "dispatching event");
        metrics::record_tick("dispatch");

        let selections = self.patterns.selections_for(&event.name);
        if selections.is_empty() {
            warn!(name = %event.name, "no pattern schedules tasks for this event");
            let mut result = EventResult::started(&event.id, &event.name);
            result.status = Status::Success;
            result.finished_at = Some(Utc::now());
            return result.save(&*self.kvs).await;
        }

        for (no, selection) in selections.into_iter().enumerate() {
            self.progress
                .enqueue(&EventTask {
                    pattern: selection.pattern,
                    event_id: event.id.clone(),
                    no: no as u32,
                    task: selection.task,
                    service: selection.service,
                    tag: selection.tag,
                })
                .await?;
        }

        EventResult::started(&event.id, &event.name)
            .save(&*self.kvs)
            .await
    }

    /// This node must run the head task iff its registration satisfies the
    /// filter and it has not recorded a result for this instance yet.
    async fn should_run(&self, task: &EventTask) -> Result<bool, EnsembleError> {
        let Some(registration) = NodeRegistration::load(&*self.kvs, &self.node).await? else {
            return Ok(false);
        };
        if !task.matches(&registration) {
            return Ok(false);
        }
        let already_ran =
            NodeTaskResult::load(&*self.kvs, &task.event_id, task.no, &self.node).await?;
        Ok(already_ran.is_none())
    }

    /// A task instance is finished globally once every registered node
    /// matching its filter has written a terminal result.
    async fn task_finished(&self, task: &EventTask) -> Result<bool, EnsembleError> {
        for (name, registration) in registered_nodes(&*self.kvs).await? {
            if !task.matches(&registration) {
                continue;
            }
            match NodeTaskResult::load(&*self.kvs, &task.event_id, task.no, &name).await? {
                Some(result) if result.status.is_terminal() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Execute the head task locally, bracketing it with start/finish
    /// records. Operation failures end up in the journal, not the tick.
    async fn run_task(&self, task: &EventTask) -> Result<(), EnsembleError> {
        info!(
            task = %task.task,
            event = %task.event_id,
            no = task.no,
            service = task.service.as_deref().unwrap_or("-"),
            tag = task.tag.as_deref().unwrap_or("-"),
            "running task"
        );

        let started = NodeTaskResult::started(&self.node);
        started.save(&*self.kvs, &task.event_id, task.no).await?;

        let clock = Instant::now();
        let vars = self.vars_for(task).await?;
        let status = match self.patterns.task(&task.pattern, &task.task) {
            Some(definition) => match definition.run(&vars).await {
                Ok(()) => Status::Success,
                Err(err) => {
                    error!(task = %task.task, error = %err, "task execution failed");
                    Status::Error
                }
            },
            None => {
                error!(
                    pattern = %task.pattern,
                    task = %task.task,
                    "task is not declared in the pattern manifest"
                );
                Status::Error
            }
        };
        metrics::record_task_run(status.as_str(), clock.elapsed().as_millis() as u64);

        started
            .finished(status)
            .save(&*self.kvs, &task.event_id, task.no)
            .await
    }

    /// Aggregate per-node results into the task record, pop the head, and
    /// finalize the event once the progress queue drains. Any error cancels
    /// the remainder of the event.
    async fn finish_task(&self, task: &EventTask) -> Result<(), EnsembleError> {
        let node_results = NodeTaskResult::load_all(&*self.kvs, &task.event_id, task.no).await?;
        let status = if node_results
            .iter()
            .any(|result| result.status == Status::Error)
        {
            Status::Error
        } else {
            Status::Success
        };

        let mut result = TaskResult::load(&*self.kvs, &task.event_id, task.no)
            .await?
            .unwrap_or_else(|| TaskResult::started(&task.event_id, task.no, &task.task));
        result.status = status;
        result.finished_at = Some(Utc::now());
        result.save(&*self.kvs).await?;
        info!(task = %task.task, no = task.no, status = %status, "task finished across the cluster");

        self.progress.dequeue().await?;
        if status == Status::Error {
            warn!(event = %task.event_id, "clearing remaining tasks after failure");
            self.progress.clear().await?;
        }

        if self.progress.items().await?.is_empty() {
            if let Some(mut event_result) = EventResult::load(&*self.kvs, &task.event_id).await? {
                event_result.status = status;
                event_result.finished_at = Some(Utc::now());
                event_result.save(&*self.kvs).await?;
                info!(event = %task.event_id, status = %status, "event finished");
            }
        }
        Ok(())
    }

    /// Substitution context handed to the task's operations.
    async fn vars_for(&self, task: &EventTask) -> Result<Vars, EnsembleError> {
        let mut vars = Vars::new();
        vars.insert("node".to_string(), self.node.clone());
        vars.insert("pattern".to_string(), task.pattern.clone());
        vars.insert("event_id".to_string(), task.event_id.clone());
        if let Some(event) = EventResult::load(&*self.kvs, &task.event_id).await? {
            vars.insert("event_name".to_string(), event.name);
        }
        if let Some(service) = &task.service {
            vars.insert("service".to_string(), service.clone());
        }
        if let Some(tag) = &task.tag {
            vars.insert("tag".to_string(), tag.clone());
        }
        Ok(vars)
    }
}
