use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    BasicProperties, Channel, Connection, Consumer,
};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ports::notification_queue::{Delivery, NotificationQueue, QueueError, ReceiptHandle};

pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// Persistent messages
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Notification queue implemented on a RabbitMQ quorum queue
///
/// RabbitMQ has no visibility timeout: an unacknowledged delivery stays with its consumer
/// until the channel closes. The repository keeps a deadline per delivery instead, and
/// hands back to the broker (nack with requeue) every delivery whose deadline passed, the
/// next time `receive` is called.
///
/// A RabbitMQ channel should not be shared between tasks, so one repository should be built
/// for each task using it.
pub struct MessageRabbitMQRepository {
    channel: Channel,
    queue_name: String,
    visibility_timeout: Duration,
    prefetch_count: u16,
    /// Created on the first `receive`, a publishing-only repository never consumes
    consumer: tokio::sync::Mutex<Option<Consumer>>,
    in_flight: Mutex<HashMap<ReceiptHandle, InFlightDelivery>>,
}

struct InFlightDelivery {
    delivery_tag: u64,
    deadline: Instant,
}

impl MessageRabbitMQRepository {
    /// Opens a channel with publisher confirms and declares the queue with its dead-letter queue
    ///
    /// Declarations are idempotent, every task can call this on the same queue.
    #[tracing::instrument(name = "🏗️ Initializing MessageRabbitMQRepository", skip(connection))]
    pub async fn try_new(
        connection: &Connection,
        queue_name: &str,
        visibility_timeout: Duration,
        prefetch_count: u16,
    ) -> Result<Self, QueueError> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let dead_letter_queue_name = dead_letter_queue_name(queue_name);
        channel
            .queue_declare(
                &dead_letter_queue_name,
                durable_queue_options(),
                quorum_queue_arguments(),
            )
            .await?;

        let mut arguments = quorum_queue_arguments();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter_queue_name.as_str().into()),
        );
        channel
            .queue_declare(queue_name, durable_queue_options(), arguments)
            .await?;

        info!(
            "Successfully declared queue {} and its dead letter queue {}",
            queue_name, dead_letter_queue_name
        );

        Ok(Self {
            channel,
            queue_name: queue_name.to_string(),
            visibility_timeout,
            prefetch_count: prefetch_count.max(1),
            consumer: tokio::sync::Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<ReceiptHandle, InFlightDelivery>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn start_consuming(&self) -> Result<Consumer, QueueError> {
        self.channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await?;

        let consumer_options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &format!("{}_{}", self.queue_name, Uuid::new_v4()),
                consumer_options,
                FieldTable::default(),
            )
            .await?;

        Ok(consumer)
    }

    /// Hands the deliveries held past their deadline back to the broker
    async fn requeue_expired(&self) -> Result<(), QueueError> {
        let now = Instant::now();
        let expired_tags: Vec<u64> = {
            let mut in_flight = self.lock_in_flight();
            let expired_handles: Vec<ReceiptHandle> = in_flight
                .iter()
                .filter(|(_, delivery)| delivery.deadline <= now)
                .map(|(handle, _)| handle.clone())
                .collect();

            expired_handles
                .iter()
                .filter_map(|handle| in_flight.remove(handle))
                .map(|delivery| delivery.delivery_tag)
                .collect()
        };

        for delivery_tag in expired_tags {
            warn!(delivery_tag, "Visibility timeout elapsed, requeuing delivery");
            self.channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    fn track(&self, delivery: lapin::message::Delivery) -> Delivery {
        let receipt_handle = ReceiptHandle::new(Uuid::new_v4().to_string());
        let receive_count = receive_count(&delivery.properties, delivery.redelivered);
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| delivery.delivery_tag.to_string());

        self.lock_in_flight().insert(
            receipt_handle.clone(),
            InFlightDelivery {
                delivery_tag: delivery.delivery_tag,
                deadline: Instant::now() + self.visibility_timeout,
            },
        );

        Delivery {
            message_id,
            payload: delivery.data,
            receipt_handle,
            receive_count,
        }
    }

    fn untrack(&self, handle: &ReceiptHandle) -> Result<u64, QueueError> {
        self.lock_in_flight()
            .remove(handle)
            .map(|delivery| delivery.delivery_tag)
            .ok_or_else(|| QueueError::ReceiptHandleExpired(handle.to_string()))
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties
                    .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                    .with_timestamp(Utc::now().timestamp_millis() as u64),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::NotConfirmed(format!(
                "message to {} was nacked by the broker",
                routing_key
            )));
        }
        Ok(())
    }
}

pub fn dead_letter_queue_name(queue_name: &str) -> String {
    format!("{}_dead_letter", queue_name)
}

fn durable_queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

fn quorum_queue_arguments() -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    arguments
}

/// Quorum queues count previous deliveries in a header, classic queues only flag redeliveries
fn receive_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let previous_deliveries = properties
        .headers()
        .as_ref()
        .and_then(|headers| {
            headers
                .inner()
                .iter()
                .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
                .and_then(|(_, value)| match value {
                    AMQPValue::LongLongInt(count) => Some(*count),
                    AMQPValue::LongInt(count) => Some(i64::from(*count)),
                    AMQPValue::LongUInt(count) => Some(i64::from(*count)),
                    AMQPValue::ShortInt(count) => Some(i64::from(*count)),
                    AMQPValue::ShortShortInt(count) => Some(i64::from(*count)),
                    _ => None,
                })
        })
        .unwrap_or(0)
        .clamp(0, i64::from(u32::MAX - 1)) as u32;

    let minimum = if redelivered { 2 } else { 1 };
    (previous_deliveries + 1).max(minimum)
}

#[async_trait]
impl NotificationQueue for MessageRabbitMQRepository {
    #[tracing::instrument(name = "Publishing message", skip(self, payload))]
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError> {
        let properties =
            BasicProperties::default().with_message_id(Uuid::new_v4().to_string().into());

        self.publish(&self.queue_name, payload, properties).await
    }

    #[tracing::instrument(name = "Receiving messages from RabbitMQ", skip(self))]
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        self.requeue_expired().await?;
        if max == 0 {
            return Ok(vec![]);
        }

        let mut consumer_slot = self.consumer.lock().await;
        if consumer_slot.is_none() {
            *consumer_slot = Some(self.start_consuming().await?);
        }
        let consumer = consumer_slot
            .as_mut()
            .ok_or_else(|| QueueError::Closed("consumer could not be started".to_string()))?;

        let first = match tokio::time::timeout(wait, consumer.next()).await {
            Err(_elapsed) => return Ok(vec![]),
            Ok(None) => {
                return Err(QueueError::Closed(format!(
                    "consumer of {} got cancelled",
                    self.queue_name
                )))
            }
            Ok(Some(delivery)) => delivery?,
        };

        let mut deliveries = vec![self.track(first)];

        // Takes what the broker already pushed, without waiting any longer
        while deliveries.len() < max {
            match consumer.next().now_or_never() {
                Some(Some(delivery)) => deliveries.push(self.track(delivery?)),
                _ => break,
            }
        }

        Ok(deliveries)
    }

    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut in_flight = self.lock_in_flight();
        let delivery = in_flight
            .get_mut(handle)
            .ok_or_else(|| QueueError::ReceiptHandleExpired(handle.to_string()))?;
        delivery.deadline = Instant::now() + timeout;

        Ok(())
    }

    #[tracing::instrument(name = "Acknowledging message", skip(self))]
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let delivery_tag = self.untrack(handle)?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;

        Ok(())
    }

    #[tracing::instrument(name = "Dead-lettering message", skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let delivery_tag = self.untrack(&delivery.receipt_handle)?;

        let mut headers = FieldTable::default();
        headers.insert(
            DEAD_LETTER_REASON_HEADER.into(),
            AMQPValue::LongString(LongString::from(reason)),
        );
        headers.insert(
            DELIVERY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(delivery.receive_count)),
        );
        let properties = BasicProperties::default()
            .with_message_id(delivery.message_id.clone().into())
            .with_headers(headers);

        // Published first: a crash in between leads to a duplicate dead letter, never a lost one
        self.publish(
            &dead_letter_queue_name(&self.queue_name),
            &delivery.payload,
            properties,
        )
        .await?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;

        info!(reason, "Message moved to the dead letter queue");
        Ok(())
    }
}
