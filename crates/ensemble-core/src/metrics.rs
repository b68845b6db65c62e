use once_cell::sync::OnceCell;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{KeyValue, global};

struct SchedulerMetrics {
    ticks: Counter<u64>,
    cas_retries: Counter<u64>,
    task_runs: Counter<u64>,
    task_duration_ms: Histogram<f64>,
}

static METRICS: OnceCell<SchedulerMetrics> = OnceCell::new();

fn handles() -> &'static SchedulerMetrics {
    METRICS.get_or_init(|| {
        let meter: Meter = global::meter("ensemble.scheduler");
        SchedulerMetrics {
            ticks: meter
                .u64_counter("scheduler_ticks_total")
                .with_description("Polling ticks by outcome")
                .init(),
            cas_retries: meter
                .u64_counter("queue_cas_retries_total")
                .with_description("Queue writes rejected by compare-and-swap")
                .init(),
            task_runs: meter
                .u64_counter("task_runs_total")
                .with_description("Task executions on this node by status")
                .init(),
            task_duration_ms: meter
                .f64_histogram("task_duration_ms")
                .with_description("Task execution wall time in milliseconds")
                .init(),
        }
    })
}

/// Record a completed polling tick (no-op if no meter provider installed).
pub fn record_tick(outcome: &str) {
    handles()
        .ticks
        .add(1, &[KeyValue::new("outcome", outcome.to_string())]);
}

/// Record a rejected CAS write on a queue key.
pub fn record_cas_retry(key: &str) {
    handles()
        .cas_retries
        .add(1, &[KeyValue::new("key", key.to_string())]);
}

/// Record a local task execution.
pub fn record_task_run(status: &str, duration_ms: u64) {
    let metrics = handles();
    let attrs = [KeyValue::new("status", status.to_string())];
    metrics.task_runs.add(1, &attrs);
    metrics.task_duration_ms.record(duration_ms as f64, &attrs);
}
