//! Core primitives for the Ensemble cluster scheduler.
//!
//! Every node runs the same agent against a shared, strongly-consistent
//! key/value store:
//! - a CAS-backed queue protocol (events in, expanded task instances out)
//! - a per-node polling loop gated by one cluster-wide lock
//! - a result journal that converges on a single global view of each event
//! - pluggable operations (shell execute, remote configuration)

mod config;
mod error;
mod telemetry;

pub mod event;
pub mod journal;
pub mod keys;
pub mod kvs;
pub mod metrics;
pub mod operation;
pub mod pattern;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod vars;

pub use config::{
    Config, ConfigLoader, KvsConfig, LoggingConfig, NodeConfig, RemoteConfigSettings,
    RuntimeConfig,
};
pub use error::{EnsembleError, OperationError};
pub use event::{Event, EventTask};
pub use journal::{EventResult, NodeTaskResult, Status, TaskResult};
pub use kvs::{DynKvStore, KvStore, MemoryKvs};
pub use operation::{Operation, OperationDeps, RunnerSettings};
pub use pattern::{Pattern, PatternSet};
pub use queue::CasQueue;
pub use scheduler::Scheduler;
pub use task::{Filter, Task};
pub use telemetry::{TelemetryOptions, init_telemetry};
