//! Prometheus metrics for the queue worker pool
//!
//! Provides observability into buffers, handlers, workers and the server.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops. Returns `false` when another
/// recorder is already installed.
pub fn init_metrics() -> bool {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .is_ok()
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record one remote batch call and its size
    pub fn batch_submitted(&self, op: &'static str, size: usize) {
        counter!(
            "sqs_worker_batch_calls_total",
            "queue" => self.queue.clone(),
            "op" => op
        )
        .increment(1);

        histogram!(
            "sqs_worker_batch_size",
            "queue" => self.queue.clone(),
            "op" => op
        )
        .record(size as f64);
    }

    /// Record a failed entry inside a batch call
    pub fn batch_entry_failed(&self, op: &'static str) {
        counter!(
            "sqs_worker_batch_entry_failures_total",
            "queue" => self.queue.clone(),
            "op" => op
        )
        .increment(1);
    }

    /// Record a receive served from the prefetch cache
    pub fn prefetch_hit(&self) {
        counter!("sqs_worker_prefetch_hits_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Update the prefetch cache depth
    pub fn prefetch_depth(&self, depth: usize) {
        gauge!("sqs_worker_prefetch_depth", "queue" => self.queue.clone()).set(depth as f64);
    }

    /// Record a message handed to a handler
    pub fn message_received(&self) {
        counter!("sqs_worker_messages_received_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Record a message processed successfully
    pub fn message_processed(&self, duration: Duration) {
        counter!(
            "sqs_worker_messages_processed_total",
            "queue" => self.queue.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "sqs_worker_message_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a message failing
    pub fn message_failed(&self, code: &'static str) {
        counter!(
            "sqs_worker_messages_processed_total",
            "queue" => self.queue.clone(),
            "status" => "failed"
        )
        .increment(1);

        counter!(
            "sqs_worker_message_errors_total",
            "queue" => self.queue.clone(),
            "code" => code
        )
        .increment(1);
    }

    /// Record a message requeued for another attempt
    pub fn message_retried(&self) {
        counter!("sqs_worker_messages_retried_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Record a message moved to the dead-letter queue
    pub fn message_dead_lettered(&self) {
        counter!("sqs_worker_messages_dlq_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a failed handler pass that put the worker into backoff
    pub fn worker_backoff(&self) {
        counter!("sqs_worker_worker_backoffs_total", "queue" => self.queue.clone())
            .increment(1);
    }

    /// Record a crashed worker being replaced
    pub fn worker_restarted(&self) {
        counter!("sqs_worker_worker_restarts_total", "queue" => self.queue.clone())
            .increment(1);
    }
}

/// Record a control loop failure
pub fn server_error() {
    counter!("sqs_worker_server_errors_total").increment(1);
}

/// Update the running worker gauge
pub fn workers_running(count: usize) {
    gauge!("sqs_worker_workers_running").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = QueueMetrics::new("mq:Order.inq");
        assert_eq!(metrics.queue, "mq:Order.inq");
    }
}
