//! Polling workers.
//!
//! A [`Worker`] owns one dedicated thread that repeatedly hands its queue to a
//! [`MessageHandler`]. Failed passes back off linearly up to a cap; a fatal error or a panic
//! stops the worker and reports it to the server, which replaces it with a fresh clone.

use crate::client::MqClient;
use crate::error::{MqError, MqResult};
use crate::handler::{HandlerStatsSnapshot, MessageHandler};
use crate::metrics::QueueMetrics;
use crate::names::QueueName;
use crate::runtime::{current_thread_runtime, join_bounded};
use crate::server::ControlOp;
use crate::status::{AtomicStatus, Status};
use crossbeam_channel::Sender;
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Settings and channels shared by every worker of a server.
pub(crate) struct WorkerContext {
    pub(crate) client: MqClient,
    pub(crate) polling_interval: Duration,
    pub(crate) retry_step: Duration,
    pub(crate) retry_cap: Duration,
    pub(crate) join_timeout: Duration,
    pub(crate) events: Sender<ControlOp>,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: u64,
    pub queue: String,
    pub status: Status,
    pub processed: u64,
    pub last_error: Option<String>,
    pub handler: HandlerStatsSnapshot,
}

struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Worker {
    id: u64,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
    context: Arc<WorkerContext>,
    status: Arc<AtomicStatus>,
    processed: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    running: Mutex<Option<Running>>,
}

impl Worker {
    pub(crate) fn new(
        queue: QueueName,
        handler: Arc<dyn MessageHandler>,
        context: Arc<WorkerContext>,
    ) -> Self {
        Self {
            id: NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed),
            queue,
            handler,
            context,
            status: Arc::new(AtomicStatus::new(Status::Stopped)),
            processed: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// A new worker on the same queue with the same handler and a fresh lifecycle.
    pub(crate) fn respawn(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.handler.clone(),
            self.context.clone(),
        )
    }

    fn thread_name(&self) -> String {
        format!("sqs-worker-{}", self.id)
    }

    /// Spawn the polling thread. A no-op while the worker is already running.
    pub fn start(&self) -> MqResult<()> {
        match self.status.get() {
            Status::Disposed => return Err(MqError::Disposed(self.thread_name())),
            Status::Started | Status::Starting => return Ok(()),
            Status::Stopping | Status::Stopped => {}
        }

        // A thread left over from a crash or an interrupted stop
        self.join_thread();
        self.status.transition(Status::Stopping, Status::Stopped);
        if !self.status.transition(Status::Stopped, Status::Starting) {
            return Ok(());
        }

        let runtime = match current_thread_runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                self.status.transition(Status::Starting, Status::Stopped);
                return Err(e);
            }
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let poller = Poller {
            id: self.id,
            queue: self.queue.clone(),
            handler: self.handler.clone(),
            context: self.context.clone(),
            status: self.status.clone(),
            processed: self.processed.clone(),
            last_error: self.last_error.clone(),
            metrics: QueueMetrics::new(self.queue.logical()),
        };

        if !self.status.transition(Status::Starting, Status::Started) {
            // Stopped or disposed while starting
            return match self.status.get() {
                Status::Disposed => Err(MqError::Disposed(self.thread_name())),
                _ => Ok(()),
            };
        }
        let spawned = std::thread::Builder::new()
            .name(self.thread_name())
            .spawn(move || {
                let crash = runtime.block_on(poller.run(shutdown_rx));
                poller.finish(crash);
            });

        match spawned {
            Ok(handle) => {
                *self.running.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Running { shutdown, handle });
                debug!(worker_id = self.id, queue = %self.queue, "Worker started");
                Ok(())
            }
            Err(e) => {
                self.status.transition(Status::Started, Status::Stopped);
                Err(e.into())
            }
        }
    }

    fn join_thread(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            join_bounded(running.handle, self.context.join_timeout, &self.thread_name());
        }
    }

    /// Signal the polling thread and wait (bounded) for it to exit.
    pub fn stop(&self) {
        if !self.status.transition(Status::Started, Status::Stopping) {
            self.status.transition(Status::Starting, Status::Stopping);
        }
        self.join_thread();
        if self.status.transition(Status::Stopping, Status::Stopped) {
            debug!(worker_id = self.id, queue = %self.queue, "Worker stopped");
        }
    }

    pub fn dispose(&self) {
        self.stop();
        self.status.dispose();
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            queue: self.queue.logical().to_string(),
            status: self.status.get(),
            processed: self.processed.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            handler: self.handler.stats(),
        }
    }

    pub(crate) fn handler_stats(&self) -> HandlerStatsSnapshot {
        self.handler.stats()
    }
}

/// State moved onto the worker thread.
struct Poller {
    id: u64,
    queue: QueueName,
    handler: Arc<dyn MessageHandler>,
    context: Arc<WorkerContext>,
    status: Arc<AtomicStatus>,
    processed: Arc<AtomicU64>,
    last_error: Arc<Mutex<Option<String>>>,
    metrics: QueueMetrics,
}

impl Poller {
    fn backoff(&self, retry: u32, error: &MqError) -> Duration {
        let factor = error.category().backoff_factor().max(1);
        self.context
            .retry_step
            .saturating_mul(retry.saturating_mul(factor))
            .min(self.context.retry_cap)
    }

    fn record_error(&self, error: &MqError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    /// Poll until stopped; returns the error that crashed the worker, if any.
    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Option<MqError> {
        let client = self.context.client.clone();
        let status = self.status.clone();
        let is_running = move || status.is(Status::Started);
        let mut retry: u32 = 0;

        while self.status.is(Status::Started) && !*shutdown.borrow() {
            let pass = AssertUnwindSafe(self.handler.process_queue(&client, &self.queue, &is_running))
                .catch_unwind()
                .await;

            match pass {
                Ok(Ok(count)) => {
                    self.processed.fetch_add(count as u64, Ordering::Relaxed);
                    retry = 0;
                }
                Ok(Err(e)) if e.is_fatal() => return Some(e),
                Ok(Err(e)) => {
                    if !self.status.is(Status::Started) {
                        break;
                    }
                    let backoff = self.backoff(retry, &e);
                    warn!(
                        worker_id = self.id,
                        queue = %self.queue,
                        error = %e,
                        retry,
                        backoff_ms = backoff.as_millis() as u64,
                        "Queue pass failed, backing off"
                    );
                    self.record_error(&e);
                    self.metrics.worker_backoff();
                    retry = retry.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => if changed.is_err() { break },
                    }
                    continue;
                }
                Err(panic) => {
                    return Some(MqError::Fatal(format!(
                        "handler panicked: {}",
                        panic_message(panic.as_ref())
                    )));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.context.polling_interval) => {}
                changed = shutdown.changed() => if changed.is_err() { break },
            }
        }
        None
    }

    /// Runs on the worker thread after the poll loop returns.
    fn finish(&self, crash: Option<MqError>) {
        let Some(error) = crash else {
            return;
        };
        self.record_error(&error);
        // Only a running worker reports; one being stopped is already accounted for
        if !self.status.transition(Status::Started, Status::Stopped) {
            return;
        }
        error!(worker_id = self.id, queue = %self.queue, error = %error, "Worker crashed");
        let event = ControlOp::WorkerFailed {
            worker_id: self.id,
            error,
        };
        if self.context.events.send(event).is_err() {
            warn!(worker_id = self.id, "Server control channel closed, crash not reported");
        } else {
            info!(worker_id = self.id, "Worker crash reported to server");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferFactory;
    use crate::handler::IsRunning;
    use crate::queue_manager::{QueueDefaults, QueueManager};
    use crate::test_support::{RecordingQueueService, wait_until};
    use async_trait::async_trait;
    use crossbeam_channel::Receiver;
    use std::sync::atomic::AtomicUsize;

    /// Handler that counts passes and fails according to `mode`.
    struct ScriptedHandler {
        passes: AtomicUsize,
        mode: &'static str,
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        fn type_name(&self) -> &str {
            "Scripted"
        }

        async fn process_queue(
            &self,
            _client: &MqClient,
            _queue: &QueueName,
            _is_running: IsRunning<'_>,
        ) -> MqResult<usize> {
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            match self.mode {
                "panic" => panic!("handler exploded"),
                "fatal" => Err(MqError::Fatal("cannot continue".into())),
                "flaky" if pass < 2 => Err(MqError::service("Throttled", "slow down")),
                _ => Ok(1),
            }
        }

        fn stats(&self) -> HandlerStatsSnapshot {
            HandlerStatsSnapshot::default()
        }
    }

    fn context(step: Duration) -> (Arc<WorkerContext>, Receiver<ControlOp>) {
        let svc = RecordingQueueService::new();
        let qm = Arc::new(QueueManager::new(svc.factory(), QueueDefaults::default()));
        let buffers = Arc::new(BufferFactory::new(svc.factory(), false));
        let (events, rx) = crossbeam_channel::unbounded();
        let context = WorkerContext {
            client: MqClient::new(qm, buffers),
            polling_interval: Duration::from_millis(5),
            retry_step: step,
            retry_cap: Duration::from_millis(50),
            join_timeout: Duration::from_secs(2),
            events,
        };
        (Arc::new(context), rx)
    }

    fn worker(mode: &'static str, context: Arc<WorkerContext>) -> (Worker, Arc<ScriptedHandler>) {
        let handler = Arc::new(ScriptedHandler {
            passes: AtomicUsize::new(0),
            mode,
        });
        let worker = Worker::new(QueueName::new("mq:Scripted.inq"), handler.clone(), context);
        (worker, handler)
    }

    #[test]
    fn test_start_stop() {
        let (context, _rx) = context(Duration::from_millis(1));
        let (worker, handler) = worker("ok", context);

        worker.start().unwrap();
        worker.start().unwrap();
        assert_eq!(worker.status(), Status::Started);
        assert!(wait_until(Duration::from_secs(2), || {
            handler.passes.load(Ordering::SeqCst) >= 3
        }));

        worker.stop();
        assert_eq!(worker.status(), Status::Stopped);
        assert!(worker.stats().processed >= 3);

        worker.start().unwrap();
        worker.dispose();
        assert_eq!(worker.status(), Status::Disposed);
        assert!(matches!(worker.start(), Err(MqError::Disposed(_))));
    }

    #[test]
    fn test_transient_errors_back_off_and_recover() {
        let (context, rx) = context(Duration::from_millis(1));
        let (worker, handler) = worker("flaky", context);

        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            handler.passes.load(Ordering::SeqCst) >= 4
        }));
        assert_eq!(worker.status(), Status::Started);
        assert!(worker.stats().last_error.unwrap().contains("slow down"));
        assert!(rx.try_recv().is_err());
        worker.dispose();
    }

    #[test]
    fn test_panic_reports_crash() {
        let (context, rx) = context(Duration::from_millis(1));
        let (worker, _) = worker("panic", context);

        worker.start().unwrap();
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            ControlOp::WorkerFailed { worker_id, error } => {
                assert_eq!(worker_id, worker.id());
                assert!(matches!(error, MqError::Fatal(ref m) if m.contains("handler exploded")));
            }
            other => panic!("unexpected control op {other:?}"),
        }
        assert_eq!(worker.status(), Status::Stopped);
        worker.dispose();
    }

    #[test]
    fn test_fatal_error_reports_crash_and_respawn_is_fresh() {
        let (context, rx) = context(Duration::from_millis(1));
        let (worker, handler) = worker("fatal", context);

        worker.start().unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(ControlOp::WorkerFailed { .. })
        ));

        let clone = worker.respawn();
        assert_ne!(clone.id(), worker.id());
        assert_eq!(clone.queue(), worker.queue());
        assert_eq!(clone.status(), Status::Stopped);
        assert_eq!(clone.stats().processed, 0);
        assert_eq!(handler.passes.load(Ordering::SeqCst), 1);
        worker.dispose();
        clone.dispose();
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let (context, _rx) = context(Duration::from_millis(10));
        let (worker, handler) = worker("ok", context.clone());
        let poller = Poller {
            id: worker.id(),
            queue: worker.queue().clone(),
            handler,
            context,
            status: Arc::new(AtomicStatus::new(Status::Started)),
            processed: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(Mutex::new(None)),
            metrics: QueueMetrics::new("mq:Scripted.inq"),
        };
        let transient = MqError::service("InternalError", "boom");
        assert_eq!(poller.backoff(0, &transient), Duration::ZERO);
        assert_eq!(poller.backoff(3, &transient), Duration::from_millis(30));
        assert_eq!(poller.backoff(100, &transient), Duration::from_millis(50));
        assert_eq!(
            poller.backoff(1, &MqError::RateLimited("slow".into())),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
