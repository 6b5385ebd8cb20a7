use super::{ClientSlot, ErrorHandler, QueueBuffer};
use crate::definition::DefinitionRef;
use crate::error::{MqError, MqResult};
use crate::metrics::QueueMetrics;
use crate::service::{
    BatchResult, ChangeVisibilityEntry, DeleteEntry, MAX_BATCH_CHANGE_VISIBILITY_ITEMS,
    MAX_BATCH_DELETE_ITEMS, MAX_BATCH_RECEIVE_ITEMS, MAX_BATCH_SEND_ITEMS, QueueServiceFactory,
    ReceiveRequest, ReceivedMessage, SendEntry,
};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const OP_SEND: &str = "send";
const OP_DELETE: &str = "delete";
const OP_CHANGE_VISIBILITY: &str = "change_visibility";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hex SHA-256 of a receipt handle; the dedup key and batch entry id of the handle.
fn handle_key(receipt_handle: &str) -> String {
    let digest = Sha256::digest(receipt_handle.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Batch threshold for an operation, within `1..=max`.
fn threshold(configured: usize, max: usize, full_drain: bool) -> usize {
    if full_drain {
        1
    } else {
        configured.clamp(1, max)
    }
}

/// Take up to `max` entries off the front of `queue`, collapsing entries with the same key.
///
/// A later entry for a key replaces the earlier one in place. Returns `None` when fewer than
/// `min` entries are queued.
fn take_deduplicated<T>(
    queue: &mut VecDeque<T>,
    min: usize,
    max: usize,
    key: impl Fn(&T) -> String,
) -> Option<Vec<(String, T)>> {
    if queue.is_empty() || queue.len() < min {
        return None;
    }
    let mut batch: Vec<(String, T)> = Vec::with_capacity(max);
    while let Some(next) = queue.front() {
        let k = key(next);
        let existing = batch.iter().position(|(bk, _)| *bk == k);
        if existing.is_none() && batch.len() >= max {
            break;
        }
        let Some(entry) = queue.pop_front() else {
            break;
        };
        match existing {
            Some(i) => batch[i].1 = entry,
            None => batch.push((k, entry)),
        }
    }
    Some(batch)
}

/// Give every send entry in a batch a distinct id.
fn distinct_send_ids(batch: &mut [SendEntry]) {
    let mut seen = HashSet::new();
    for (i, entry) in batch.iter_mut().enumerate() {
        if !seen.insert(entry.id.clone()) {
            entry.id = format!("{}-{i}", entry.id);
            seen.insert(entry.id.clone());
        }
    }
}

/// Buffer that batches outbound calls and prefetches receives.
///
/// Each operation has its own FIFO. Entries are dequeued under the FIFO lock before the
/// remote call, so concurrent flushes never submit the same entry twice.
pub struct BatchingBuffer {
    definition: DefinitionRef,
    client: ClientSlot,
    sends: Mutex<VecDeque<SendEntry>>,
    deletes: Mutex<VecDeque<DeleteEntry>>,
    visibility_changes: Mutex<VecDeque<ChangeVisibilityEntry>>,
    prefetched: Mutex<VecDeque<ReceivedMessage>>,
    error_handler: ErrorHandler,
    nak_budget: Duration,
    metrics: QueueMetrics,
    disposed: AtomicBool,
}

impl BatchingBuffer {
    pub fn new(
        definition: DefinitionRef,
        factory: Arc<dyn QueueServiceFactory>,
        error_handler: ErrorHandler,
        nak_budget: Duration,
    ) -> Self {
        let metrics = QueueMetrics::new(definition.snapshot().name.logical());
        Self {
            definition,
            client: ClientSlot::new(factory),
            sends: Mutex::new(VecDeque::new()),
            deletes: Mutex::new(VecDeque::new()),
            visibility_changes: Mutex::new(VecDeque::new()),
            prefetched: Mutex::new(VecDeque::new()),
            error_handler,
            nak_budget,
            metrics,
            disposed: AtomicBool::new(false),
        }
    }

    /// Buffered entries per FIFO: (sends, deletes, visibility changes, prefetched).
    pub fn pending(&self) -> (usize, usize, usize, usize) {
        (
            lock(&self.sends).len(),
            lock(&self.deletes).len(),
            lock(&self.visibility_changes).len(),
            lock(&self.prefetched).len(),
        )
    }

    fn check(&self) -> MqResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MqError::Disposed(format!(
                "buffer {}",
                self.definition.snapshot().name
            )));
        }
        Ok(())
    }

    fn report_failures(&self, op: &'static str, result: &BatchResult) {
        if result.failed.is_empty() {
            return;
        }
        let queue = self.definition.snapshot().name.logical().to_string();
        for failure in &result.failed {
            self.metrics.batch_entry_failed(op);
            (self.error_handler)(&MqError::BatchEntry {
                queue: queue.clone(),
                id: failure.id.clone(),
                code: failure.code.clone(),
                message: failure.message.clone(),
            });
        }
    }

    async fn flush_sends(&self, full_drain: bool) -> MqResult<usize> {
        let min = threshold(
            self.definition.snapshot().buffer_sizes.send,
            MAX_BATCH_SEND_ITEMS,
            full_drain,
        );
        let mut calls = 0;
        loop {
            let mut batch: Vec<SendEntry> = {
                let mut queue = lock(&self.sends);
                if queue.is_empty() || queue.len() < min {
                    break;
                }
                let n = queue.len().min(MAX_BATCH_SEND_ITEMS);
                queue.drain(..n).collect()
            };
            distinct_send_ids(&mut batch);
            let size = batch.len();
            let url = self.definition.queue_url();
            match self.client.get().send_message_batch(&url, batch.clone()).await {
                Ok(result) => {
                    calls += 1;
                    self.metrics.batch_submitted(OP_SEND, size);
                    self.report_failures(OP_SEND, &result);
                }
                Err(e) => {
                    let mut queue = lock(&self.sends);
                    for entry in batch.into_iter().rev() {
                        queue.push_front(entry);
                    }
                    return Err(e);
                }
            }
        }
        Ok(calls)
    }

    async fn flush_deletes(&self, full_drain: bool) -> MqResult<usize> {
        let min = threshold(
            self.definition.snapshot().buffer_sizes.delete,
            MAX_BATCH_DELETE_ITEMS,
            full_drain,
        );
        let mut calls = 0;
        loop {
            let batch = {
                let mut queue = lock(&self.deletes);
                take_deduplicated(&mut queue, min, MAX_BATCH_DELETE_ITEMS, |e: &DeleteEntry| {
                    handle_key(&e.receipt_handle)
                })
            };
            let Some(batch) = batch else {
                break;
            };
            let entries: Vec<DeleteEntry> = batch
                .into_iter()
                .map(|(key, entry)| DeleteEntry { id: key, ..entry })
                .collect();
            let size = entries.len();
            let url = self.definition.queue_url();
            match self.client.get().delete_message_batch(&url, entries.clone()).await {
                Ok(result) => {
                    calls += 1;
                    self.metrics.batch_submitted(OP_DELETE, size);
                    self.report_failures(OP_DELETE, &result);
                }
                Err(e) => {
                    let mut queue = lock(&self.deletes);
                    for entry in entries.into_iter().rev() {
                        queue.push_front(entry);
                    }
                    return Err(e);
                }
            }
        }
        Ok(calls)
    }

    async fn flush_visibility_changes(&self, full_drain: bool) -> MqResult<usize> {
        self.flush_visibility_changes_until(full_drain, None).await
    }

    /// Flush visibility changes; a batch still pending at `deadline` is put back and the
    /// flush fails with `DrainTimeout`.
    async fn flush_visibility_changes_until(
        &self,
        full_drain: bool,
        deadline: Option<Instant>,
    ) -> MqResult<usize> {
        let min = threshold(
            self.definition.snapshot().buffer_sizes.change_visibility,
            MAX_BATCH_CHANGE_VISIBILITY_ITEMS,
            full_drain,
        );
        let mut calls = 0;
        loop {
            let batch = {
                let mut queue = lock(&self.visibility_changes);
                take_deduplicated(
                    &mut queue,
                    min,
                    MAX_BATCH_CHANGE_VISIBILITY_ITEMS,
                    |e: &ChangeVisibilityEntry| handle_key(&e.receipt_handle),
                )
            };
            let Some(batch) = batch else {
                break;
            };
            let entries: Vec<ChangeVisibilityEntry> = batch
                .into_iter()
                .map(|(key, entry)| ChangeVisibilityEntry { id: key, ..entry })
                .collect();
            let size = entries.len();
            let url = self.definition.queue_url();
            let service = self.client.get();
            let submitted = service.change_message_visibility_batch(&url, entries.clone());
            let outcome = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, submitted)
                    .await
                    .unwrap_or_else(|_| {
                        Err(MqError::service(
                            "DrainTimeout",
                            "visibility changes exceeded the drain budget",
                        ))
                    }),
                None => submitted.await,
            };
            match outcome {
                Ok(result) => {
                    calls += 1;
                    self.metrics.batch_submitted(OP_CHANGE_VISIBILITY, size);
                    self.report_failures(OP_CHANGE_VISIBILITY, &result);
                }
                Err(e) => {
                    let mut queue = lock(&self.visibility_changes);
                    for entry in entries.into_iter().rev() {
                        queue.push_front(entry);
                    }
                    return Err(e);
                }
            }
        }
        Ok(calls)
    }

    /// Queue a visibility reset for every prefetched message and flush them within the
    /// nak budget. Resets left unsent stay queued for the next drain.
    async fn nak_prefetched(&self) -> MqResult<usize> {
        let returned: Vec<ReceivedMessage> = lock(&self.prefetched).drain(..).collect();
        self.metrics.prefetch_depth(0);
        if returned.is_empty() {
            return Ok(0);
        }
        let count = returned.len();
        {
            let mut queue = lock(&self.visibility_changes);
            for message in returned {
                queue.push_back(ChangeVisibilityEntry {
                    id: String::new(),
                    receipt_handle: message.receipt_handle,
                    visibility_timeout: 0,
                });
            }
        }
        let deadline = Instant::now() + self.nak_budget;
        let flushed = self.flush_visibility_changes_until(true, Some(deadline)).await;
        if let Err(e) = &flushed {
            warn!(
                queue = %self.definition.snapshot().name,
                count,
                pending = lock(&self.visibility_changes).len(),
                budget_ms = self.nak_budget.as_millis() as u64,
                error = %e,
                "Returning prefetched messages did not finish within the drain budget"
            );
        }
        flushed
    }
}

#[async_trait]
impl QueueBuffer for BatchingBuffer {
    fn definition(&self) -> &DefinitionRef {
        &self.definition
    }

    async fn send(&self, entry: SendEntry) -> MqResult<bool> {
        self.check()?;
        lock(&self.sends).push_back(entry);
        Ok(self.flush_sends(false).await? > 0)
    }

    async fn delete(&self, receipt_handle: &str) -> MqResult<bool> {
        self.check()?;
        lock(&self.deletes).push_back(DeleteEntry {
            id: String::new(),
            receipt_handle: receipt_handle.to_string(),
        });
        Ok(self.flush_deletes(false).await? > 0)
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<bool> {
        self.check()?;
        lock(&self.visibility_changes).push_back(ChangeVisibilityEntry {
            id: String::new(),
            receipt_handle: receipt_handle.to_string(),
            visibility_timeout,
        });
        Ok(self.flush_visibility_changes(false).await? > 0)
    }

    async fn receive(&self, wait_time: Duration) -> MqResult<Option<ReceivedMessage>> {
        self.check()?;
        if let Some(message) = lock(&self.prefetched).pop_front() {
            self.metrics.prefetch_hit();
            return Ok(Some(message));
        }

        let definition = self.definition.snapshot();
        let max_messages = definition.buffer_sizes.receive.clamp(1, MAX_BATCH_RECEIVE_ITEMS);
        let mut messages = self
            .client
            .get()
            .receive_message(ReceiveRequest {
                queue_url: definition.queue_url,
                max_messages,
                wait_time,
                visibility_timeout: None,
            })
            .await?
            .into_iter();

        let first = messages.next();
        let mut prefetched = lock(&self.prefetched);
        prefetched.extend(messages);
        self.metrics.prefetch_depth(prefetched.len());
        Ok(first)
    }

    async fn drain(&self, full_drain: bool, nak_received: bool) -> MqResult<usize> {
        let mut calls = 0;
        let mut first_error = None;

        let mut nak_failed = false;
        if nak_received {
            match self.nak_prefetched().await {
                Ok(n) => calls += n,
                Err(e) => {
                    nak_failed = true;
                    first_error = Some(e);
                }
            }
        }
        let sends = self.flush_sends(full_drain).await;
        let deletes = self.flush_deletes(full_drain).await;
        let visibility = if nak_failed {
            // Resets already missed the budget; the next drain sends them
            Ok(0)
        } else {
            self.flush_visibility_changes(full_drain).await
        };
        for result in [sends, deletes, visibility] {
            match result {
                Ok(n) => calls += n,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(calls),
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.drain(true, true).await {
            (self.error_handler)(&e);
        }
        self.client.release();
        debug!(queue = %self.definition.snapshot().name, "Buffer disposed");
    }
}
