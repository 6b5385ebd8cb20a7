//! Order messages processed by this service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqs_worker::{MessageProcessor, MqError, MqResult, QueueMessage, TypedMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

impl QueueMessage for Order {
    const TYPE_NAME: &'static str = "Order";
}

/// Prices orders; invalid orders fail permanently and land in the dead-letter queue.
#[derive(Debug, Default)]
pub struct OrderProcessor {
    processed: AtomicU64,
}

impl OrderProcessor {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageProcessor<Order> for OrderProcessor {
    #[instrument(skip_all, fields(order_id = message.payload.id, attempt = message.retry_attempts()))]
    async fn process(&self, message: &TypedMessage<Order>) -> MqResult<Option<Value>> {
        let order = &message.payload;
        if order.quantity == 0 {
            return Err(MqError::permanent(format!("order {} has no items", order.id)));
        }
        let total = order
            .unit_price_cents
            .checked_mul(u64::from(order.quantity))
            .ok_or_else(|| MqError::permanent(format!("order {} total overflows", order.id)))?;

        self.processed.fetch_add(1, Ordering::Relaxed);
        info!(sku = %order.sku, total_cents = total, "Order priced");

        Ok(Some(json!({
            "order_id": order.id,
            "total_cents": total,
        })))
    }

    fn name(&self) -> &'static str {
        "OrderProcessor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqs_worker::Message;

    fn typed(order: Order) -> TypedMessage<Order> {
        TypedMessage::decode(Message::from_payload(&order).unwrap()).unwrap()
    }

    fn order(quantity: u32) -> Order {
        Order {
            id: 7,
            sku: "SKU-1".into(),
            quantity,
            unit_price_cents: 250,
        }
    }

    #[tokio::test]
    async fn test_prices_order() {
        let processor = OrderProcessor::default();
        let response = processor.process(&typed(order(4))).await.unwrap().unwrap();

        assert_eq!(response["order_id"], 7);
        assert_eq!(response["total_cents"], 1000);
        assert_eq!(processor.processed(), 1);
    }

    #[tokio::test]
    async fn test_empty_order_is_permanent_failure() {
        let processor = OrderProcessor::default();
        let err = processor.process(&typed(order(0))).await.unwrap_err();

        assert!(!err.should_retry(0, 5));
        assert_eq!(processor.processed(), 0);
    }
}
