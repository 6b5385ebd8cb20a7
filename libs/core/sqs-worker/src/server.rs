//! Message queue server
//!
//! [`MqServer`] owns the worker roster and drives it from a background control thread:
//!
//! - `start()` creates the queues of every registered type once, starts the workers and
//!   returns when the control loop is running
//! - `stop()` and `restart()` are signalled to the control loop and return immediately
//! - a crashed worker is replaced by a fresh clone on the same queue
//! - a failure of the control loop stops every worker and optionally restarts the server
//!   after a delay

use crate::buffer::{BufferFactory, ErrorHandler, log_error_handler};
use crate::client::MqClient;
use crate::config::MqServerConfig;
use crate::error::{MqError, MqResult};
use crate::handler::{HandlerStatsSnapshot, MessageProcessor, QueueMessage};
use crate::metrics::{self, QueueMetrics};
use crate::queue_manager::{QueueDefaults, QueueManager};
use crate::registry::{HandlerOptions, WorkerInfo};
use crate::runtime::{current_thread_runtime, join_bounded, run_blocking};
use crate::service::QueueServiceFactory;
use crate::status::{AtomicStatus, Status};
use crate::worker::{Worker, WorkerContext, WorkerStats, panic_message};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CONTROL_THREAD: &str = "sqs-mq-control";

/// Operations handled by the control loop.
#[derive(Debug)]
pub(crate) enum ControlOp {
    Stop,
    Restart,
    WorkerFailed { worker_id: u64, error: MqError },
}

/// Server report: lifecycle, error counters, workers and per-type handler totals.
#[derive(Debug, Clone, Serialize)]
pub struct MqServerStats {
    pub status: Status,
    pub total_processed: u64,
    pub error_count: u64,
    pub consecutive_errors: u64,
    pub last_error: Option<String>,
    pub worker_restarts: u64,
    pub running_workers: usize,
    pub workers: Vec<WorkerStats>,
    pub handlers: Vec<HandlerStatsSnapshot>,
}

#[derive(Default)]
struct ErrorCounters {
    total: AtomicU64,
    consecutive: AtomicU64,
    last: Mutex<Option<String>>,
}

struct ServerInner {
    config: MqServerConfig,
    queue_manager: Arc<QueueManager>,
    buffers: Arc<BufferFactory>,
    worker_context: Arc<WorkerContext>,
    registrations: Mutex<Vec<WorkerInfo>>,
    workers: Mutex<Vec<Arc<Worker>>>,
    initialized: AtomicBool,
    status: AtomicStatus,
    control_tx: Sender<ControlOp>,
    control_rx: Receiver<ControlOp>,
    control: Mutex<Option<JoinHandle<()>>>,
    control_thread: Mutex<Option<ThreadId>>,
    error_handler: ErrorHandler,
    errors: ErrorCounters,
    worker_restarts: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker pool over a set of message-type queues.
///
/// Cloning is cheap; clones share the same server.
#[derive(Clone)]
pub struct MqServer {
    inner: Arc<ServerInner>,
}

impl MqServer {
    pub fn new(factory: Arc<dyn QueueServiceFactory>, config: MqServerConfig) -> MqResult<Self> {
        Self::with_error_handler(factory, config, log_error_handler())
    }

    /// Create a server whose unreturned failures (worker crashes, control loop errors, failed
    /// batch entries) are passed to `error_handler`.
    pub fn with_error_handler(
        factory: Arc<dyn QueueServiceFactory>,
        config: MqServerConfig,
        error_handler: ErrorHandler,
    ) -> MqResult<Self> {
        config.validate()?;

        let queue_manager = Arc::new(QueueManager::new(
            factory.clone(),
            QueueDefaults {
                visibility_timeout: config.visibility_timeout,
                receive_wait_time: config.receive_wait_time,
                buffer_sizes: config.buffer_sizes,
            },
        ));
        let buffers = Arc::new(
            BufferFactory::new(factory, !config.disable_buffering)
                .with_error_handler(error_handler.clone())
                .with_nak_budget(config.nak_drain_budget),
        );
        let client = MqClient::new(queue_manager.clone(), buffers.clone())
            .with_queue_name_prefix(config.queue_name_prefix.clone())
            .with_priority_queues(config.enable_priority_queues);

        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let worker_context = Arc::new(WorkerContext {
            client,
            polling_interval: config.polling_interval,
            retry_step: config.worker_retry_step,
            retry_cap: config.worker_retry_cap,
            join_timeout: config.thread_join_timeout,
            events: control_tx.clone(),
        });

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                queue_manager,
                buffers,
                worker_context,
                registrations: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                status: AtomicStatus::new(Status::Stopped),
                control_tx,
                control_rx,
                control: Mutex::new(None),
                control_thread: Mutex::new(None),
                error_handler,
                errors: ErrorCounters::default(),
                worker_restarts: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &MqServerConfig {
        &self.inner.config
    }

    pub fn queue_manager(&self) -> &Arc<QueueManager> {
        &self.inner.queue_manager
    }

    /// A client sharing the server's queue definitions and buffers.
    pub fn create_client(&self) -> MqClient {
        self.inner.worker_context.client.clone()
    }

    pub fn status(&self) -> Status {
        self.inner.status.get()
    }

    /// Register a processor for `T` with the server defaults.
    pub fn register_handler<T, P>(&self, processor: P) -> MqResult<()>
    where
        T: QueueMessage,
        P: MessageProcessor<T>,
    {
        self.register_handler_with(processor, HandlerOptions::default())
    }

    /// Register a processor for `T`. Options are validated immediately.
    pub fn register_handler_with<T, P>(&self, processor: P, options: HandlerOptions) -> MqResult<()>
    where
        T: QueueMessage,
        P: MessageProcessor<T>,
    {
        let inner = &self.inner;
        if inner.status.is(Status::Disposed) {
            return Err(MqError::Disposed("MqServer".into()));
        }
        if inner.initialized.load(Ordering::Acquire) {
            return Err(MqError::InvalidParameter(format!(
                "{}: handlers must be registered before the server starts",
                T::TYPE_NAME
            )));
        }

        let info = WorkerInfo::new::<T, P>(processor, options, &inner.config)?;
        let mut registrations = lock(&inner.registrations);
        if registrations.iter().any(|r| r.type_name == info.type_name) {
            return Err(MqError::InvalidParameter(format!(
                "a handler for {} is already registered",
                info.type_name
            )));
        }
        info!(
            type_name = info.type_name,
            threads = info.thread_count,
            retry_count = info.retry_count,
            "Registered message handler"
        );
        registrations.push(info);
        Ok(())
    }

    /// Start the server; returns once the workers are running.
    ///
    /// On an already started server this only restarts workers that are not running.
    pub fn start(&self) -> MqResult<()> {
        let inner = &self.inner;
        match inner.status.get() {
            Status::Disposed => return Err(MqError::Disposed("MqServer".into())),
            Status::Started => return inner.start_workers(),
            _ => {}
        }
        if inner.is_control_thread() {
            return inner.start_inline();
        }
        if !inner.status.transition(Status::Stopped, Status::Starting) {
            debug!(status = %inner.status.get(), "Start ignored");
            return Ok(());
        }
        if lock(&inner.registrations).is_empty() {
            inner.status.transition(Status::Starting, Status::Stopped);
            return Err(MqError::NoHandlersRegistered);
        }

        // Operations left over from a previous run
        while inner.control_rx.try_recv().is_ok() {}
        let previous = lock(&inner.control).take();
        if let Some(previous) = previous {
            join_bounded(previous, inner.config.thread_join_timeout, CONTROL_THREAD);
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let server = inner.clone();
        let spawned = std::thread::Builder::new()
            .name(CONTROL_THREAD.into())
            .spawn(move || {
                *lock(&server.control_thread) = Some(std::thread::current().id());
                let booted = server.boot();
                let ok = booted.is_ok();
                let _ = ready_tx.send(booted);
                if ok {
                    server.control_loop();
                }
                lock(&server.control_thread).take();
            });

        match spawned {
            Ok(handle) => *lock(&inner.control) = Some(handle),
            Err(e) => {
                inner.status.transition(Status::Starting, Status::Stopped);
                return Err(e.into());
            }
        }

        ready_rx
            .recv()
            .unwrap_or_else(|_| Err(MqError::Internal("control thread exited during start".into())))
    }

    /// Ask the control loop to stop every worker. Returns without waiting.
    pub fn stop(&self) -> MqResult<()> {
        match self.inner.status.get() {
            Status::Disposed => Err(MqError::Disposed("MqServer".into())),
            Status::Started | Status::Starting => self.inner.signal(ControlOp::Stop),
            Status::Stopping | Status::Stopped => Ok(()),
        }
    }

    /// Ask the control loop to stop and start every worker again.
    pub fn restart(&self) -> MqResult<()> {
        match self.inner.status.get() {
            Status::Disposed => Err(MqError::Disposed("MqServer".into())),
            Status::Started => self.inner.signal(ControlOp::Restart),
            _ => Ok(()),
        }
    }

    /// Poll until the server is stopped (or disposed); false on timeout.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if matches!(self.status(), Status::Stopped | Status::Disposed) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Stop, release every worker, the control thread, the buffers and the queue manager.
    ///
    /// Idempotent. Prefetched messages are returned to their queues.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.status.is(Status::Disposed) {
            return;
        }
        let join_timeout = inner.config.thread_join_timeout;
        if self.stop().is_ok() && !self.wait_until_stopped(join_timeout) {
            warn!("Server did not stop in time, disposing anyway");
        }
        if !inner.status.dispose() {
            return;
        }

        let workers = std::mem::take(&mut *lock(&inner.workers));
        for worker in workers {
            worker.dispose();
        }

        // Wakes a control loop that is still running; it exits on a disposed server
        let _ = inner.control_tx.send(ControlOp::Stop);
        let control = lock(&inner.control).take();
        if let Some(control) = control
            && !inner.is_control_thread()
        {
            join_bounded(control, join_timeout, CONTROL_THREAD);
        }

        inner.buffers.stop_drain_timer(join_timeout);
        if let Err(e) = run_blocking(inner.buffers.dispose()) {
            warn!(error = %e, "Failed to dispose queue buffers");
        }
        inner.queue_manager.dispose();
        metrics::workers_running(0);
        info!("MqServer disposed");
    }

    pub fn stats(&self) -> MqServerStats {
        let inner = &self.inner;
        let workers: Vec<Arc<Worker>> = lock(&inner.workers).clone();

        let mut handlers: Vec<HandlerStatsSnapshot> = Vec::new();
        for worker in &workers {
            let snapshot = worker.handler_stats();
            match handlers.iter_mut().find(|h| h.type_name == snapshot.type_name) {
                Some(total) => total.merge(&snapshot),
                None => handlers.push(snapshot),
            }
        }
        let workers: Vec<WorkerStats> = workers.iter().map(|w| w.stats()).collect();

        MqServerStats {
            status: inner.status.get(),
            total_processed: workers.iter().map(|w| w.processed).sum(),
            error_count: inner.errors.total.load(Ordering::Relaxed),
            consecutive_errors: inner.errors.consecutive.load(Ordering::Relaxed),
            last_error: lock(&inner.errors.last).clone(),
            worker_restarts: inner.worker_restarts.load(Ordering::Relaxed),
            running_workers: workers.iter().filter(|w| w.status == Status::Started).count(),
            workers,
            handlers,
        }
    }

    /// Ids of the workers currently in the roster.
    pub fn worker_ids(&self) -> Vec<u64> {
        lock(&self.inner.workers).iter().map(|w| w.id()).collect()
    }

    /// Delete temporary queues created before `cutoff` that hold no messages.
    pub async fn remove_empty_temporary_queues(&self, cutoff: DateTime<Utc>) -> MqResult<usize> {
        self.inner
            .queue_manager
            .remove_empty_temporary_queues(cutoff.timestamp())
            .await
    }
}

impl ServerInner {
    fn is_control_thread(&self) -> bool {
        *lock(&self.control_thread) == Some(std::thread::current().id())
    }

    fn signal(&self, op: ControlOp) -> MqResult<()> {
        self.control_tx
            .send(op)
            .map_err(|_| MqError::Internal("server control channel closed".into()))
    }

    fn start_inline(&self) -> MqResult<()> {
        if !self.status.transition(Status::Stopped, Status::Starting) {
            return self.check_disposed();
        }
        self.boot()
    }

    fn check_disposed(&self) -> MqResult<()> {
        if self.status.is(Status::Disposed) {
            return Err(MqError::Disposed("MqServer".into()));
        }
        Ok(())
    }

    /// Create queues and workers once, then start every worker. Leaves the server `Started`
    /// on success and `Stopped` on failure; a server disposed meanwhile stays `Disposed`.
    fn boot(&self) -> MqResult<()> {
        let booted = current_thread_runtime()
            .and_then(|runtime| runtime.block_on(self.init()))
            .and_then(|()| self.check_disposed())
            .and_then(|()| self.start_workers())
            .and_then(|()| {
                if self.status.transition(Status::Starting, Status::Started) {
                    Ok(())
                } else {
                    Err(MqError::Disposed("MqServer".into()))
                }
            });

        match booted {
            Ok(()) => {
                info!(workers = lock(&self.workers).len(), "MqServer started");
                Ok(())
            }
            Err(e) if self.status.is(Status::Disposed) => {
                warn!(error = %e, "MqServer disposed while starting");
                let workers = std::mem::take(&mut *lock(&self.workers));
                for worker in workers {
                    worker.dispose();
                }
                self.buffers.stop_drain_timer(self.config.thread_join_timeout);
                metrics::workers_running(0);
                Err(MqError::Disposed("MqServer".into()))
            }
            Err(e) => {
                error!(error = %e, "MqServer failed to start");
                self.stop_workers();
                self.status.transition(Status::Starting, Status::Stopped);
                self.record_error(&e);
                Err(e)
            }
        }
    }

    async fn init(&self) -> MqResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let registrations = lock(&self.registrations).clone();

        let mut roster = Vec::new();
        for info in &registrations {
            let queues = self
                .queue_manager
                .create_type_queues(&info.queue_names, &info.queue_options())
                .await?;
            let definitions = [
                Some(&queues.input),
                queues.priority.as_ref(),
                Some(&queues.out),
                Some(&queues.dead_letter),
            ];
            for definition in definitions.into_iter().flatten() {
                self.buffers.get_or_create(definition, info.buffered);
            }

            for _ in 0..info.thread_count {
                roster.push(Arc::new(Worker::new(
                    info.queue_names.input.clone(),
                    (info.handler_factory)(),
                    self.worker_context.clone(),
                )));
            }
            if info.priority_queue {
                roster.push(Arc::new(Worker::new(
                    info.queue_names.priority.clone(),
                    (info.handler_factory)(),
                    self.worker_context.clone(),
                )));
            }
        }
        if roster.is_empty() {
            return Err(MqError::NoHandlersRegistered);
        }

        self.check_disposed()?;
        if let Some(interval) = self.config.buffer_flush_interval {
            self.buffers.start_drain_timer(interval)?;
        }
        *lock(&self.workers) = roster;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn start_workers(&self) -> MqResult<()> {
        let workers = lock(&self.workers).clone();
        for worker in &workers {
            worker.start()?;
        }
        metrics::workers_running(workers.len());
        Ok(())
    }

    fn stop_workers(&self) {
        let workers = lock(&self.workers).clone();
        for worker in &workers {
            worker.stop();
        }
        metrics::workers_running(0);
    }

    fn record_error(&self, error: &MqError) {
        self.errors.total.fetch_add(1, Ordering::Relaxed);
        self.errors.consecutive.fetch_add(1, Ordering::Relaxed);
        *lock(&self.errors.last) = Some(error.to_string());
        metrics::server_error();
    }

    fn control_loop(&self) {
        while let Ok(op) = self.control_rx.recv() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle(op)))
                .unwrap_or_else(|panic| {
                    Err(MqError::Fatal(format!(
                        "control loop panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });

            match outcome {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => return,
                Err(e) => {
                    error!(error = %e, "MqServer control loop failed, stopping workers");
                    self.record_error(&e);
                    self.status.transition(Status::Started, Status::Stopping);
                    self.stop_workers();
                    self.status.transition(Status::Stopping, Status::Stopped);
                    (self.error_handler)(&e);
                    if self.status.is(Status::Disposed) || !self.auto_restart() {
                        return;
                    }
                }
            }
        }
    }

    /// Retry the start sequence after the configured delay until it succeeds. False when
    /// auto-restart is disabled or the server was disposed meanwhile.
    fn auto_restart(&self) -> bool {
        let Some(delay) = self.config.auto_restart_delay else {
            return false;
        };
        loop {
            warn!(delay_ms = delay.as_millis() as u64, "Restarting MqServer after failure");
            std::thread::sleep(delay);
            if self.status.is(Status::Disposed) {
                return false;
            }
            match self.start_inline() {
                Ok(()) => return true,
                Err(_) if self.status.is(Status::Disposed) => return false,
                Err(e) => (self.error_handler)(&e),
            }
        }
    }

    fn handle(&self, op: ControlOp) -> MqResult<ControlFlow<()>> {
        match op {
            ControlOp::Stop => {
                if self.status.is(Status::Disposed) {
                    return Ok(ControlFlow::Break(()));
                }
                if !self.status.transition(Status::Started, Status::Stopping) {
                    return Ok(ControlFlow::Continue(()));
                }
                self.stop_workers();
                self.status.transition(Status::Stopping, Status::Stopped);
                self.errors.consecutive.store(0, Ordering::Relaxed);
                info!("MqServer stopped");
                Ok(ControlFlow::Break(()))
            }
            ControlOp::Restart => {
                if self.status.is(Status::Started) {
                    info!("Restarting MqServer workers");
                    self.stop_workers();
                    self.start_workers()?;
                }
                Ok(ControlFlow::Continue(()))
            }
            ControlOp::WorkerFailed { worker_id, error } => {
                self.replace_worker(worker_id, &error)?;
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    /// Swap a crashed worker for a fresh clone on the same queue.
    fn replace_worker(&self, worker_id: u64, error: &MqError) -> MqResult<()> {
        self.record_error(error);
        (self.error_handler)(error);
        if !self.status.is(Status::Started) {
            return Ok(());
        }

        let (crashed, replacement) = {
            let mut workers = lock(&self.workers);
            let Some(pos) = workers.iter().position(|w| w.id() == worker_id) else {
                return Ok(());
            };
            let replacement = Arc::new(workers[pos].respawn());
            let crashed = std::mem::replace(&mut workers[pos], replacement.clone());
            (crashed, replacement)
        };

        warn!(
            worker_id,
            replacement_id = replacement.id(),
            queue = %crashed.queue(),
            error = %error,
            "Replacing crashed worker"
        );
        replacement.start()?;
        crashed.dispose();
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::new(crashed.queue().logical()).worker_restarted();
        self.errors.consecutive.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MessageProducer;
    use crate::message::{Message, TypedMessage};
    use crate::test_support::{RecordingQueueService, wait_until};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::future::Future;

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u32,
        panic: bool,
    }

    impl QueueMessage for Order {
        const TYPE_NAME: &'static str = "Order";
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<u32>>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<u32> {
            lock(&self.seen).clone()
        }
    }

    #[async_trait]
    impl MessageProcessor<Order> for Recorder {
        async fn process(&self, message: &TypedMessage<Order>) -> MqResult<Option<serde_json::Value>> {
            if message.payload.panic {
                panic!("poison order {}", message.payload.id);
            }
            lock(&self.seen).push(message.payload.id);
            Ok(None)
        }
    }

    fn config() -> MqServerConfig {
        MqServerConfig::default()
            .with_polling_interval(Duration::from_millis(10))
            .with_buffering_disabled(true)
            .with_buffer_flush_interval(None)
            .with_thread_join_timeout(Duration::from_secs(2))
    }

    fn new_server(config: MqServerConfig) -> (MqServer, Arc<RecordingQueueService>) {
        let svc = RecordingQueueService::new();
        let server = MqServer::new(svc.factory(), config).unwrap();
        (server, svc)
    }

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn publish(server: &MqServer, id: u32, panic: bool) {
        let client = server.create_client();
        block_on(client.publish_typed(&Order { id, panic })).unwrap();
    }

    #[test]
    fn test_start_without_handlers_fails() {
        let (server, _) = new_server(config());
        assert!(matches!(server.start(), Err(MqError::NoHandlersRegistered)));
        assert_eq!(server.status(), Status::Stopped);
        server.dispose();
    }

    #[test]
    fn test_registration_is_validated() {
        let (server, _) = new_server(config());
        server.register_handler::<Order, _>(Recorder::default()).unwrap();
        assert!(matches!(
            server.register_handler::<Order, _>(Recorder::default()),
            Err(MqError::InvalidParameter(_))
        ));

        let (invalid, _) = new_server(config());
        assert!(matches!(
            invalid.register_handler_with::<Order, _>(
                Recorder::default(),
                HandlerOptions::default().with_visibility_timeout(50_000),
            ),
            Err(MqError::Config(_))
        ));

        server.start().unwrap();
        let (late, _) = new_server(config());
        late.register_handler::<Order, _>(Recorder::default()).unwrap();
        late.start().unwrap();
        assert!(matches!(
            late.register_handler::<Order, _>(Recorder::default()),
            Err(MqError::InvalidParameter(_))
        ));
        late.dispose();
        server.dispose();
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (server, svc) = new_server(config());
        server
            .register_handler_with::<Order, _>(
                Recorder::default(),
                HandlerOptions::default().with_thread_count(2),
            )
            .unwrap();

        server.start().unwrap();
        assert_eq!(server.status(), Status::Started);
        let ids = server.worker_ids();
        assert_eq!(ids.len(), 2);
        let creates = svc.count("create_queue");
        assert_eq!(creates, 3);

        server.start().unwrap();
        assert_eq!(server.worker_ids(), ids);

        server.stop().unwrap();
        assert!(server.wait_until_stopped(Duration::from_secs(2)));
        assert_eq!(server.status(), Status::Stopped);
        assert!(server.stats().workers.iter().all(|w| w.status == Status::Stopped));

        server.start().unwrap();
        assert_eq!(server.status(), Status::Started);
        assert_eq!(server.worker_ids(), ids);
        assert_eq!(svc.count("create_queue"), creates);

        server.dispose();
        assert_eq!(server.status(), Status::Disposed);
        assert!(matches!(server.start(), Err(MqError::Disposed(_))));
        assert!(matches!(server.stop(), Err(MqError::Disposed(_))));
        server.dispose();
    }

    #[test]
    fn test_messages_are_processed() {
        let (server, _) = new_server(config());
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();

        for id in 1..=5 {
            publish(&server, id, false);
        }
        assert!(wait_until(Duration::from_secs(5), || {
            server.stats().total_processed == 5
        }));
        assert_eq!(recorder.seen(), vec![1, 2, 3, 4, 5]);

        let stats = server.stats();
        assert_eq!(stats.status, Status::Started);
        assert_eq!(stats.total_processed, 5);
        assert_eq!(stats.handlers.len(), 1);
        assert_eq!(stats.handlers[0].processed, 5);
        assert_eq!(stats.running_workers, 1);
        server.dispose();
    }

    #[test]
    fn test_crashed_worker_is_replaced() {
        let (server, _) = new_server(config());
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();
        let original = server.worker_ids();
        let crashed = lock(&server.inner.workers)[0].clone();

        publish(&server, 1, true);
        assert!(wait_until(Duration::from_secs(5), || {
            server.stats().worker_restarts == 1
        }));
        let replaced = server.worker_ids();
        assert_eq!(replaced.len(), 1);
        assert_ne!(replaced, original);
        assert!(wait_until(Duration::from_secs(5), || {
            crashed.status() == Status::Disposed
        }));

        publish(&server, 2, false);
        assert!(wait_until(Duration::from_secs(5), || recorder.seen() == vec![2]));

        let stats = server.stats();
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_error.unwrap().contains("poison order 1"));
        assert_eq!(stats.status, Status::Started);
        server.dispose();
    }

    #[test]
    fn test_crash_reaches_error_handler() {
        let svc = RecordingQueueService::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        let server = MqServer::with_error_handler(
            svc.factory(),
            config(),
            Arc::new(move |e: &MqError| lock(&sink).push(e.code().to_string())),
        )
        .unwrap();
        server.register_handler::<Order, _>(Recorder::default()).unwrap();
        server.start().unwrap();

        publish(&server, 1, true);
        assert!(wait_until(Duration::from_secs(5), || {
            lock(&seen).contains(&"Fatal".to_string())
        }));
        server.dispose();
    }

    #[test]
    fn test_failed_restart_is_retried_until_workers_start() {
        let svc = RecordingQueueService::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        let server = MqServer::with_error_handler(
            svc.factory(),
            config().with_auto_restart_delay(Some(Duration::from_millis(100))),
            Arc::new(move |e: &MqError| lock(&sink).push(e.code().to_string())),
        )
        .unwrap();
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();

        // A worker that can no longer start fails the restart
        let broken = lock(&server.inner.workers)[0].clone();
        broken.dispose();
        server.restart().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            lock(&seen).contains(&"ObjectDisposed".to_string())
        }));
        let stats = server.stats();
        assert!(stats.error_count >= 1);
        assert!(stats.consecutive_errors >= 1);
        assert!(stats.last_error.unwrap().contains(&broken.id().to_string()));

        lock(&server.inner.workers)[0] = Arc::new(broken.respawn());
        assert!(wait_until(Duration::from_secs(5), || {
            server.status() == Status::Started
        }));
        publish(&server, 9, false);
        assert!(wait_until(Duration::from_secs(5), || recorder.seen() == vec![9]));
        server.dispose();
    }

    #[test]
    fn test_dispose_during_slow_start_wins() {
        let (server, svc) = new_server(
            config().with_thread_join_timeout(Duration::from_millis(200)),
        );
        server.register_handler::<Order, _>(Recorder::default()).unwrap();
        svc.delay_next("create_queue", Duration::from_millis(300));

        let starting = server.clone();
        let start = std::thread::spawn(move || starting.start());
        std::thread::sleep(Duration::from_millis(50));
        server.dispose();

        let result = start.join().unwrap();
        assert!(matches!(result, Err(MqError::Disposed(_))));
        assert_eq!(server.status(), Status::Disposed);
        assert!(matches!(server.start(), Err(MqError::Disposed(_))));
        assert_eq!(server.stats().running_workers, 0);
    }

    #[test]
    fn test_receive_failures_back_off_and_recover() {
        let (server, svc) = new_server(
            config().with_worker_backoff(Duration::from_millis(1), Duration::from_millis(10)),
        );
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        svc.fail_next_receives(2);
        server.start().unwrap();

        publish(&server, 4, false);
        assert!(wait_until(Duration::from_secs(5), || recorder.seen() == vec![4]));
        let stats = server.stats();
        assert!(stats.workers[0].last_error.as_deref().unwrap().contains("injected failure"));
        assert_eq!(stats.status, Status::Started);
        server.dispose();
    }

    #[test]
    fn test_restart_keeps_processing() {
        let (server, _) = new_server(config());
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();

        server.restart().unwrap();
        publish(&server, 7, false);
        assert!(wait_until(Duration::from_secs(5), || recorder.seen() == vec![7]));
        assert_eq!(server.status(), Status::Started);
        server.dispose();
    }

    #[test]
    fn test_priority_queue_gets_its_own_worker() {
        let (server, svc) = new_server(config().with_priority_queues(true));
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();
        assert_eq!(server.worker_ids().len(), 2);
        assert_eq!(svc.count("create_queue"), 4);

        let client = server.create_client();
        let message = Message::from_payload(&Order { id: 3, panic: false })
            .unwrap()
            .with_priority(1);
        block_on(client.publish_message::<Order>(&message)).unwrap();
        assert!(wait_until(Duration::from_secs(5), || recorder.seen() == vec![3]));
        assert_eq!(server.stats().handlers[0].priority_received, 1);
        server.dispose();
    }

    #[test]
    fn test_buffered_server_flushes_on_dispose() {
        let (server, svc) = new_server(config().with_buffering_disabled(false));
        let recorder = Recorder::default();
        server.register_handler::<Order, _>(recorder.clone()).unwrap();
        server.start().unwrap();

        let client = server.create_client();
        for id in 0..3 {
            block_on(client.publish_typed(&Order { id, panic: false })).unwrap();
        }
        assert!(block_on(client.flush()) >= 1);
        assert!(wait_until(Duration::from_secs(5), || recorder.seen().len() == 3));

        assert_eq!(svc.count("delete_message_batch"), 0);

        server.dispose();
        let deletes: usize = svc
            .calls_of("delete_message_batch")
            .iter()
            .map(|c| c.ids.len())
            .sum();
        assert_eq!(deletes, 3);
    }

    #[test]
    fn test_remove_empty_temporary_queues() {
        let (server, _) = new_server(config());
        let client = server.create_client();
        let temp = block_on(client.create_temp_queue()).unwrap();
        block_on(client.send_one_way(&temp, &Message::new("{}"))).unwrap();
        let empty = block_on(client.create_temp_queue()).unwrap();

        let cutoff = Utc::now() + chrono::Duration::minutes(5);
        let removed = block_on(server.remove_empty_temporary_queues(cutoff)).unwrap();
        assert_eq!(removed, 1);
        assert!(!block_on(server.queue_manager().queue_exists(&empty, true)).unwrap());
        assert!(block_on(server.queue_manager().queue_exists(&temp, true)).unwrap());
        server.dispose();
    }
}
