//! Test helpers: a call-recording queue service and polling waits.

use crate::error::{MqError, MqResult};
use crate::memory::InMemoryQueueService;
use crate::service::{
    BatchResult, ChangeVisibilityEntry, DeleteEntry, QueueAttributes, QueueService,
    QueueServiceFactory, QueueSettings, ReceiveRequest, ReceivedMessage, SendEntry,
    SharedServiceFactory,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One recorded remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    /// Wire name for name-based calls, url otherwise.
    pub queue: String,
    /// Batch entry ids, or the receipt handle of single-message calls.
    pub ids: Vec<String>,
}

/// [`InMemoryQueueService`] wrapper that records every call.
#[derive(Default)]
pub struct RecordingQueueService {
    inner: InMemoryQueueService,
    calls: Mutex<Vec<Call>>,
    fail_receives: AtomicUsize,
    delays: Mutex<HashMap<&'static str, Duration>>,
}

impl RecordingQueueService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn QueueServiceFactory> {
        Arc::new(SharedServiceFactory::new(self.clone()))
    }

    pub fn inner(&self) -> &InMemoryQueueService {
        &self.inner
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_of(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Make the next `n` receive calls fail with a transient service error.
    pub fn fail_next_receives(&self, n: usize) {
        self.fail_receives.store(n, Ordering::SeqCst);
    }

    /// Hold the next `op` call for `delay` before it reaches the store.
    pub fn delay_next(&self, op: &'static str, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, delay);
    }

    async fn pause(&self, op: &'static str) {
        let delay = self
            .delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(op);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, op: &'static str, queue: &str, ids: Vec<String>) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Call {
                op,
                queue: queue.to_string(),
                ids,
            });
    }
}

#[async_trait]
impl QueueService for RecordingQueueService {
    async fn create_queue(&self, wire_name: &str, settings: &QueueSettings) -> MqResult<String> {
        self.record("create_queue", wire_name, vec![]);
        self.pause("create_queue").await;
        self.inner.create_queue(wire_name, settings).await
    }

    async fn get_queue_url(&self, wire_name: &str) -> MqResult<String> {
        self.record("get_queue_url", wire_name, vec![]);
        self.inner.get_queue_url(wire_name).await
    }

    async fn get_queue_attributes(&self, queue_url: &str) -> MqResult<QueueAttributes> {
        self.record("get_queue_attributes", queue_url, vec![]);
        self.inner.get_queue_attributes(queue_url).await
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        settings: &QueueSettings,
    ) -> MqResult<()> {
        self.record("set_queue_attributes", queue_url, vec![]);
        self.inner.set_queue_attributes(queue_url, settings).await
    }

    async fn list_queues(&self, prefix: &str) -> MqResult<Vec<String>> {
        self.record("list_queues", prefix, vec![]);
        self.inner.list_queues(prefix).await
    }

    async fn delete_queue(&self, queue_url: &str) -> MqResult<()> {
        self.record("delete_queue", queue_url, vec![]);
        self.inner.delete_queue(queue_url).await
    }

    async fn purge_queue(&self, queue_url: &str) -> MqResult<()> {
        self.record("purge_queue", queue_url, vec![]);
        self.inner.purge_queue(queue_url).await
    }

    async fn send_message(&self, queue_url: &str, entry: SendEntry) -> MqResult<String> {
        self.record("send_message", queue_url, vec![entry.id.clone()]);
        self.inner.send_message(queue_url, entry).await
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> MqResult<BatchResult> {
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        self.record("send_message_batch", queue_url, ids);
        self.inner.send_message_batch(queue_url, entries).await
    }

    async fn receive_message(&self, request: ReceiveRequest) -> MqResult<Vec<ReceivedMessage>> {
        self.record("receive_message", &request.queue_url, vec![]);
        let failing = self
            .fail_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MqError::service("ServiceUnavailable", "injected failure"));
        }
        self.inner.receive_message(request).await
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> MqResult<()> {
        self.record("delete_message", queue_url, vec![receipt_handle.to_string()]);
        self.inner.delete_message(queue_url, receipt_handle).await
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> MqResult<BatchResult> {
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        self.record("delete_message_batch", queue_url, ids);
        self.inner.delete_message_batch(queue_url, entries).await
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<()> {
        self.record(
            "change_message_visibility",
            queue_url,
            vec![receipt_handle.to_string()],
        );
        self.inner
            .change_message_visibility(queue_url, receipt_handle, visibility_timeout)
            .await
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<ChangeVisibilityEntry>,
    ) -> MqResult<BatchResult> {
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        self.record("change_message_visibility_batch", queue_url, ids);
        self.pause("change_message_visibility_batch").await;
        self.inner
            .change_message_visibility_batch(queue_url, entries)
            .await
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
