use super::{BatchingBuffer, ErrorHandler, PassThroughBuffer, QueueBuffer, log_error_handler};
use crate::definition::DefinitionRef;
use crate::error::MqResult;
use crate::names::QueueName;
use crate::runtime::{current_thread_runtime, join_bounded};
use crate::service::QueueServiceFactory;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, warn};

struct DrainTimer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one buffer per logical queue name and drives periodic partial drains.
pub struct BufferFactory {
    service_factory: Arc<dyn QueueServiceFactory>,
    buffers: DashMap<QueueName, Arc<dyn QueueBuffer>>,
    buffering_enabled: bool,
    error_handler: ErrorHandler,
    nak_budget: Duration,
    /// Held for the length of a drain pass.
    drain_lock: AsyncMutex<()>,
    timer: Mutex<Option<DrainTimer>>,
}

impl BufferFactory {
    pub fn new(service_factory: Arc<dyn QueueServiceFactory>, buffering_enabled: bool) -> Self {
        Self {
            service_factory,
            buffers: DashMap::new(),
            buffering_enabled,
            error_handler: log_error_handler(),
            nak_budget: Duration::from_secs(5),
            drain_lock: AsyncMutex::new(()),
            timer: Mutex::new(None),
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_nak_budget(mut self, budget: Duration) -> Self {
        self.nak_budget = budget;
        self
    }

    /// Buffer for a queue, created on first request.
    ///
    /// `buffered` overrides the factory default for a newly created buffer.
    pub fn get_or_create(
        &self,
        definition: &DefinitionRef,
        buffered: Option<bool>,
    ) -> Arc<dyn QueueBuffer> {
        let name = definition.snapshot().name;
        self.buffers
            .entry(name)
            .or_insert_with(|| {
                if buffered.unwrap_or(self.buffering_enabled) {
                    Arc::new(BatchingBuffer::new(
                        definition.clone(),
                        self.service_factory.clone(),
                        self.error_handler.clone(),
                        self.nak_budget,
                    ))
                } else {
                    Arc::new(PassThroughBuffer::new(
                        definition.clone(),
                        self.service_factory.clone(),
                    ))
                }
            })
            .clone()
    }

    pub fn get(&self, name: &QueueName) -> Option<Arc<dyn QueueBuffer>> {
        self.buffers.get(name).map(|b| b.value().clone())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Drain every buffer; returns the number of remote calls made.
    ///
    /// A periodic partial pass is skipped (returns 0) while another pass runs; full and
    /// nak drains wait for it and then run.
    pub async fn drain_all(&self, full_drain: bool, nak_received: bool) -> usize {
        let _guard = if full_drain || nak_received {
            self.drain_lock.lock().await
        } else {
            match self.drain_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return 0,
            }
        };
        let buffers: Vec<Arc<dyn QueueBuffer>> =
            self.buffers.iter().map(|b| b.value().clone()).collect();
        let mut calls = 0;
        for buffer in buffers {
            match buffer.drain(full_drain, nak_received).await {
                Ok(n) => calls += n,
                Err(e) => (self.error_handler)(&e),
            }
        }
        calls
    }

    /// Start the periodic partial drain on a dedicated thread.
    pub fn start_drain_timer(self: &Arc<Self>, interval: Duration) -> MqResult<()> {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.is_some() {
            return Ok(());
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let factory: Weak<Self> = Arc::downgrade(self);
        let runtime = current_thread_runtime()?;
        let handle = std::thread::Builder::new()
            .name("sqs-buffer-drain".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {}
                            _ = shutdown_rx.changed() => break,
                        }
                        let Some(factory) = factory.upgrade() else {
                            break;
                        };
                        let calls = factory.drain_all(false, false).await;
                        if calls > 0 {
                            debug!(calls, "Periodic buffer drain");
                        }
                    }
                });
            })?;

        info!(interval_ms = interval.as_millis() as u64, "Buffer drain timer started");
        *timer = Some(DrainTimer { shutdown, handle });
        Ok(())
    }

    /// Stop the drain timer, waiting up to `timeout` for its thread.
    pub fn stop_drain_timer(&self, timeout: Duration) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            let _ = timer.shutdown.send(true);
            join_bounded(timer.handle, timeout, "sqs-buffer-drain");
        }
    }

    /// Final full drain of every buffer, returning prefetched messages, then release them.
    pub async fn dispose(&self) {
        let _guard = self.drain_lock.lock().await;
        let buffers: Vec<Arc<dyn QueueBuffer>> =
            self.buffers.iter().map(|b| b.value().clone()).collect();
        for buffer in buffers {
            buffer.dispose().await;
        }
        self.buffers.clear();
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            warn!("Buffer factory disposed while the drain timer is running");
            let _ = timer.shutdown.send(true);
        }
    }
}
