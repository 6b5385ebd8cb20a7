//! Queue definition cache and queue administration.
//!
//! Resolves logical queue names to [`QueueDefinition`]s, creating queues on demand and wiring
//! dead-letter redrive policies. Every logical name maps to one shared [`DefinitionRef`] for
//! the lifetime of the manager, so repeated lookups never create the queue twice.

use crate::definition::{BufferSizes, DefinitionRef, QueueDefinition};
use crate::error::{MqError, MqResult};
use crate::names::{QueueName, QueueNames, temp_wire_prefix};
use crate::service::{
    QueueAttributes, QueueService, QueueServiceFactory, QueueSettings, RedrivePolicy,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

/// Attributes applied to queues created without explicit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDefaults {
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub buffer_sizes: BufferSizes,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            visibility_timeout: 30,
            receive_wait_time: 0,
            buffer_sizes: BufferSizes::default(),
        }
    }
}

impl QueueDefaults {
    pub fn settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: self.visibility_timeout,
            receive_wait_time: self.receive_wait_time,
            redrive_policy: None,
        }
    }
}

/// Queue attributes requested for one message type.
#[derive(Debug, Clone)]
pub struct TypeQueueOptions {
    pub retry_count: u32,
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub buffer_sizes: BufferSizes,
    pub priority_queue: bool,
}

/// Definitions materialized for one message type.
#[derive(Debug, Clone)]
pub struct TypeQueues {
    pub input: DefinitionRef,
    pub priority: Option<DefinitionRef>,
    pub out: DefinitionRef,
    pub dead_letter: DefinitionRef,
}

/// Cache of queue definitions backed by the remote service.
pub struct QueueManager {
    factory: Arc<dyn QueueServiceFactory>,
    client: Mutex<Option<Arc<dyn QueueService>>>,
    definitions: DashMap<QueueName, DefinitionRef>,
    /// One creation in flight per name.
    creating: DashMap<QueueName, Arc<AsyncMutex<()>>>,
    defaults: QueueDefaults,
    disposed: AtomicBool,
}

impl QueueManager {
    pub fn new(factory: Arc<dyn QueueServiceFactory>, defaults: QueueDefaults) -> Self {
        Self {
            factory,
            client: Mutex::new(None),
            definitions: DashMap::new(),
            creating: DashMap::new(),
            defaults,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn defaults(&self) -> &QueueDefaults {
        &self.defaults
    }

    /// The remote client, created on first use.
    pub fn client(&self) -> MqResult<Arc<dyn QueueService>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(MqError::Disposed("QueueManager".into()));
        }
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .get_or_insert_with(|| self.factory.create_client())
            .clone())
    }

    /// Cached definition, or a fresh one from the remote service when `force_recheck` is set
    /// or nothing is cached. A missing queue yields `Ok(None)`.
    pub async fn get_queue_definition(
        &self,
        name: &QueueName,
        force_recheck: bool,
    ) -> MqResult<Option<DefinitionRef>> {
        if !force_recheck && let Some(def) = self.cached(name) {
            return Ok(Some(def));
        }

        let client = self.client()?;
        let url = match self.cached(name) {
            Some(def) => def.queue_url(),
            None => match client.get_queue_url(name.wire()).await {
                Ok(url) => url,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        match client.get_queue_attributes(&url).await {
            Ok(attributes) => Ok(Some(self.cache(name, &url, attributes, None))),
            Err(e) if e.is_not_found() => {
                self.definitions.remove(name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_queue_url(
        &self,
        name: &QueueName,
        force_recheck: bool,
    ) -> MqResult<Option<String>> {
        Ok(self
            .get_queue_definition(name, force_recheck)
            .await?
            .map(|d| d.queue_url()))
    }

    pub async fn queue_exists(&self, name: &QueueName, force_recheck: bool) -> MqResult<bool> {
        Ok(self.get_queue_definition(name, force_recheck).await?.is_some())
    }

    /// Cached definition or a newly created queue with default attributes.
    pub async fn get_or_create(&self, name: &QueueName) -> MqResult<DefinitionRef> {
        if let Some(def) = self.cached(name) {
            return Ok(def);
        }
        let creating = self.creating.entry(name.clone()).or_default().clone();
        let _guard = creating.lock().await;
        if let Some(def) = self.cached(name) {
            return Ok(def);
        }
        let created = self
            .create_queue(name, self.defaults.settings(), self.defaults.buffer_sizes)
            .await;
        if created.is_ok() {
            self.creating.remove(name);
        }
        created
    }

    /// Create a queue, or update the attributes of a conflicting existing one.
    ///
    /// Server-assigned fields (ARN, creation time) are fetched right after creation.
    pub async fn create_queue(
        &self,
        name: &QueueName,
        settings: QueueSettings,
        buffer_sizes: BufferSizes,
    ) -> MqResult<DefinitionRef> {
        let client = self.client()?;
        let url = match client.create_queue(name.wire(), &settings).await {
            Ok(url) => url,
            Err(MqError::QueueNameExists(_)) => {
                info!(queue = %name, "Queue exists with different attributes, updating");
                let url = client.get_queue_url(name.wire()).await?;
                client.set_queue_attributes(&url, &settings).await?;
                url
            }
            Err(e) => return Err(e),
        };

        let attributes = client.get_queue_attributes(&url).await?;
        debug!(queue = %name, arn = %attributes.queue_arn, "Queue created");
        Ok(self.cache(name, &url, attributes, Some(buffer_sizes)))
    }

    /// Create the queue set of one message type.
    ///
    /// The dead-letter queue comes first; its ARN drives the redrive policy of the input and
    /// priority queues.
    pub async fn create_type_queues(
        &self,
        names: &QueueNames,
        options: &TypeQueueOptions,
    ) -> MqResult<TypeQueues> {
        let plain = QueueSettings {
            visibility_timeout: options.visibility_timeout,
            receive_wait_time: options.receive_wait_time,
            redrive_policy: None,
        };

        let dead_letter = self
            .create_queue(&names.dead_letter, plain.clone(), options.buffer_sizes)
            .await?;
        let dlq_arn = dead_letter.snapshot().queue_arn;
        let redriven = QueueSettings {
            redrive_policy: Some(RedrivePolicy::new(dlq_arn, options.retry_count.max(1))),
            ..plain.clone()
        };

        let input = self
            .create_queue(&names.input, redriven.clone(), options.buffer_sizes)
            .await?;
        let priority = if options.priority_queue {
            Some(
                self.create_queue(&names.priority, redriven, options.buffer_sizes)
                    .await?,
            )
        } else {
            None
        };
        let out = self
            .create_queue(&names.out, plain, options.buffer_sizes)
            .await?;

        Ok(TypeQueues {
            input,
            priority,
            out,
            dead_letter,
        })
    }

    /// Remove every message from a queue. A missing queue is not an error.
    pub async fn purge_queue(&self, name: &QueueName) -> MqResult<()> {
        let Some(url) = self.get_queue_url(name, false).await? else {
            return Ok(());
        };
        match self.client()?.purge_queue(&url).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete a queue and drop its cached definition. A missing queue is not an error.
    pub async fn delete_queue(&self, name: &QueueName) -> MqResult<()> {
        let url = self.get_queue_url(name, false).await?;
        self.definitions.remove(name);
        let Some(url) = url else {
            return Ok(());
        };
        match self.client()?.delete_queue(&url).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Delete temporary queues created before `cutoff` (unix seconds) that hold no messages.
    ///
    /// Locally known temporary queues are checked first, then every remote queue carrying the
    /// temporary prefix that was not already considered. Returns the number of queues removed.
    pub async fn remove_empty_temporary_queues(&self, cutoff: i64) -> MqResult<usize> {
        let client = self.client()?;
        let mut considered = HashSet::new();
        let mut removed = 0;

        let local: Vec<QueueName> = self
            .definitions
            .iter()
            .filter(|e| e.key().is_temporary())
            .map(|e| e.key().clone())
            .collect();

        for name in local {
            let Some(def) = self.get_queue_definition(&name, true).await? else {
                continue;
            };
            let snapshot = def.snapshot();
            considered.insert(snapshot.queue_url.clone());
            if snapshot.created_timestamp < cutoff && snapshot.approximate_number_of_messages == 0 {
                self.delete_queue(&name).await?;
                removed += 1;
            }
        }

        for url in client.list_queues(&temp_wire_prefix()).await? {
            if considered.contains(&url) {
                continue;
            }
            let attributes = match client.get_queue_attributes(&url).await {
                Ok(a) => a,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if attributes.created_timestamp < cutoff
                && attributes.approximate_number_of_messages == 0
            {
                match client.delete_queue(&url).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if removed > 0 {
            info!(count = removed, "Removed empty temporary queues");
        }
        Ok(removed)
    }

    /// Snapshot of every cached definition.
    pub fn definitions(&self) -> Vec<QueueDefinition> {
        self.definitions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Release the remote client. Later calls fail with a disposed error.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        debug!("Queue manager disposed");
    }

    fn cached(&self, name: &QueueName) -> Option<DefinitionRef> {
        self.definitions.get(name).map(|e| e.value().clone())
    }

    /// Store fresh attributes, reusing the cached handle when there is one.
    fn cache(
        &self,
        name: &QueueName,
        url: &str,
        attributes: QueueAttributes,
        buffer_sizes: Option<BufferSizes>,
    ) -> DefinitionRef {
        let entry = self.definitions.entry(name.clone());
        match entry {
            Entry::Occupied(existing) => {
                let def = existing.get().clone();
                def.update(|d| {
                    d.queue_url = url.to_string();
                    d.apply_attributes(attributes);
                    if let Some(sizes) = buffer_sizes {
                        d.buffer_sizes = sizes;
                    }
                });
                def
            }
            Entry::Vacant(slot) => {
                let def = DefinitionRef::new(QueueDefinition::from_attributes(
                    name.clone(),
                    url,
                    attributes,
                    buffer_sizes.unwrap_or(self.defaults.buffer_sizes),
                ));
                slot.insert(def.clone());
                def
            }
        }
    }
}
