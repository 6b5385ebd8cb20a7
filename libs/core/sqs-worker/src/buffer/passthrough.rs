use super::{ClientSlot, QueueBuffer};
use crate::definition::DefinitionRef;
use crate::error::{MqError, MqResult};
use crate::service::{QueueServiceFactory, ReceiveRequest, ReceivedMessage, SendEntry};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Buffer that forwards every operation as its own remote call.
pub struct PassThroughBuffer {
    definition: DefinitionRef,
    client: ClientSlot,
    disposed: AtomicBool,
}

impl PassThroughBuffer {
    pub fn new(definition: DefinitionRef, factory: Arc<dyn QueueServiceFactory>) -> Self {
        Self {
            definition,
            client: ClientSlot::new(factory),
            disposed: AtomicBool::new(false),
        }
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
}

#[async_trait]
impl QueueBuffer for PassThroughBuffer {
    fn definition(&self) -> &DefinitionRef {
        &self.definition
    }

    async fn send(&self, entry: SendEntry) -> MqResult<bool> {
        self.check()?;
        self.client
            .get()
            .send_message(&self.definition.queue_url(), entry)
            .await?;
        Ok(true)
    }

    async fn delete(&self, receipt_handle: &str) -> MqResult<bool> {
        self.check()?;
        self.client
            .get()
            .delete_message(&self.definition.queue_url(), receipt_handle)
            .await?;
        Ok(true)
    }

    async fn change_visibility(
        &self,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<bool> {
        self.check()?;
        self.client
            .get()
            .change_message_visibility(
                &self.definition.queue_url(),
                receipt_handle,
                visibility_timeout,
            )
            .await?;
        Ok(true)
    }

    async fn receive(&self, wait_time: Duration) -> MqResult<Option<ReceivedMessage>> {
        self.check()?;
        let messages = self
            .client
            .get()
            .receive_message(ReceiveRequest {
                queue_url: self.definition.queue_url(),
                max_messages: 1,
                wait_time,
                visibility_timeout: None,
            })
            .await?;
        Ok(messages.into_iter().next())
    }

    async fn drain(&self, _full_drain: bool, _nak_received: bool) -> MqResult<usize> {
        Ok(0)
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.client.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::{QueueDefaults, QueueManager};
    use crate::names::QueueName;
    use crate::test_support::RecordingQueueService;

    #[tokio::test]
    async fn test_every_call_goes_remote() {
        let svc = RecordingQueueService::new();
        let qm = QueueManager::new(svc.factory(), QueueDefaults::default());
        let def = qm.get_or_create(&QueueName::new("mq:Order.inq")).await.unwrap();
        let buffer = PassThroughBuffer::new(def, svc.factory());
        svc.clear();

        for i in 0..3 {
            let sent = buffer
                .send(SendEntry {
                    id: i.to_string(),
                    body: "{}".into(),
                    attributes: Default::default(),
                })
                .await
                .unwrap();
            assert!(sent);
        }
        assert_eq!(svc.count("send_message"), 3);

        let msg = buffer.receive(Duration::ZERO).await.unwrap().unwrap();
        assert!(buffer.delete(&msg.receipt_handle).await.unwrap());
        assert_eq!(svc.count("receive_message"), 1);
        assert_eq!(svc.count("delete_message"), 1);
        assert_eq!(buffer.drain(true, true).await.unwrap(), 0);

        buffer.dispose().await;
        assert!(matches!(
            buffer.receive(Duration::ZERO).await,
            Err(MqError::Disposed(_))
        ));
        qm.dispose();
    }
}
