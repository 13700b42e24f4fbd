use std::time::Duration;

use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ports::notification_queue::{Delivery, NotificationQueue, QueueError, ReceiptHandle};

/// Postgres channel notified on every enqueue, with the queue name as payload
pub const NEW_MESSAGE_CHANNEL: &str = "notification_messages";

/// Upper bound between two looks at the table while long-polling
///
/// Messages whose visibility timeout lapsed are not announced on the channel.
const RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Notification queue implemented on a Postgres table
///
/// Several consumers can receive concurrently: visible rows are claimed with
/// `FOR UPDATE SKIP LOCKED`, and every delivery writes a fresh receipt handle which
/// invalidates the handles of previous deliveries of the same message.
pub struct MessagePostgresRepository {
    pg_pool: PgPool,
    queue_name: String,
    visibility_timeout: Duration,
    /// Connected on the first empty `receive`, then kept for the next ones
    listener: Mutex<Option<PgListener>>,
}

impl MessagePostgresRepository {
    pub fn new(pg_pool: PgPool, queue_name: &str, visibility_timeout: Duration) -> Self {
        Self {
            pg_pool,
            queue_name: queue_name.to_string(),
            visibility_timeout,
            listener: Mutex::new(None),
        }
    }

    /// Number of dead-lettered messages of this queue
    #[tracing::instrument(name = "Counting dead-lettered messages", skip(self))]
    pub async fn dead_letter_count(&self) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
    SELECT COUNT(*) FROM notification_messages
    WHERE queue_name = $1 AND dead_lettered_at IS NOT NULL
            "#,
        )
        .bind(&self.queue_name)
        .fetch_one(&self.pg_pool)
        .await?;

        Ok(count)
    }

    async fn take_visible(&self, max: usize) -> Result<Vec<Delivery>, QueueError> {
        let rows = sqlx::query_as::<_, (i64, Vec<u8>, Uuid, i32)>(
            r#"
    UPDATE notification_messages
    SET receipt_handle = gen_random_uuid(),
        receive_count = receive_count + 1,
        visible_at = now() + make_interval(secs => $3)
    WHERE id IN (
        SELECT id FROM notification_messages
        WHERE queue_name = $1 AND dead_lettered_at IS NULL AND visible_at <= now()
        ORDER BY id
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, payload, receipt_handle, receive_count
            "#,
        )
        .bind(&self.queue_name)
        .bind(max.min(i64::MAX as usize) as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pg_pool)
        .await?;

        let deliveries = rows
            .into_iter()
            .map(|(id, payload, receipt_handle, receive_count)| Delivery {
                message_id: id.to_string(),
                payload,
                receipt_handle: ReceiptHandle::new(receipt_handle.to_string()),
                receive_count: receive_count.max(0) as u32,
            })
            .collect();

        Ok(deliveries)
    }

    async fn listen(&self) -> Result<PgListener, QueueError> {
        let mut listener = PgListener::connect_with(&self.pg_pool).await?;
        listener.listen(NEW_MESSAGE_CHANNEL).await?;
        Ok(listener)
    }
}

/// A receipt handle that is not even a UUID can't match any row
fn parse_handle(handle: &ReceiptHandle) -> Result<Uuid, QueueError> {
    Uuid::parse_str(handle.as_ref())
        .map_err(|_| QueueError::ReceiptHandleExpired(handle.to_string()))
}

#[async_trait]
impl NotificationQueue for MessagePostgresRepository {
    #[tracing::instrument(name = "Enqueuing message in database", skip(self, payload))]
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError> {
        let mut transaction = self.pg_pool.begin().await?;

        sqlx::query(
            r#"
    INSERT INTO notification_messages (queue_name, payload)
    VALUES ($1, $2)
            "#,
        )
        .bind(&self.queue_name)
        .bind(payload)
        .execute(&mut *transaction)
        .await?;

        // Only sent to listeners once the transaction commits
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NEW_MESSAGE_CHANNEL)
            .bind(&self.queue_name)
            .execute(&mut *transaction)
            .await?;

        transaction.commit().await?;

        Ok(())
    }

    #[tracing::instrument(name = "Receiving messages from database", skip(self))]
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }
        let deadline = Instant::now() + wait;
        let mut listener_guard = self.listener.lock().await;
        let listener = &mut *listener_guard;

        loop {
            let deliveries = self.take_visible(max).await?;
            if !deliveries.is_empty() {
                debug!(count = deliveries.len(), "Received messages");
                return Ok(deliveries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }

            match listener {
                // Looks at the table once more after listening, an enqueue could have
                // committed in between
                None => *listener = Some(self.listen().await?),
                Some(active) => {
                    let recheck_in = (deadline - now).min(RECHECK_INTERVAL);
                    if let Ok(Err(error)) =
                        tokio::time::timeout(recheck_in, active.recv()).await
                    {
                        warn!(?error, "Lost the new message listener, reconnecting");
                        *listener = None;
                    }
                }
            }
        }
    }

    #[tracing::instrument(name = "Extending message visibility", skip(self))]
    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
    UPDATE notification_messages
    SET visible_at = now() + make_interval(secs => $3)
    WHERE queue_name = $1 AND receipt_handle = $2 AND dead_lettered_at IS NULL
            "#,
        )
        .bind(&self.queue_name)
        .bind(parse_handle(handle)?)
        .bind(timeout.as_secs_f64())
        .execute(&self.pg_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ReceiptHandleExpired(handle.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(name = "Acknowledging message", skip(self))]
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
    DELETE FROM notification_messages
    WHERE queue_name = $1 AND receipt_handle = $2 AND dead_lettered_at IS NULL
            "#,
        )
        .bind(&self.queue_name)
        .bind(parse_handle(handle)?)
        .execute(&self.pg_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ReceiptHandleExpired(handle.to_string()));
        }
        Ok(())
    }

    #[tracing::instrument(name = "Dead-lettering message", skip(self, delivery), fields(message_id = %delivery.message_id))]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
    UPDATE notification_messages
    SET dead_lettered_at = now(), dead_letter_reason = $3, receipt_handle = NULL
    WHERE queue_name = $1 AND receipt_handle = $2 AND dead_lettered_at IS NULL
            "#,
        )
        .bind(&self.queue_name)
        .bind(parse_handle(&delivery.receipt_handle)?)
        .bind(reason)
        .execute(&self.pg_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::ReceiptHandleExpired(
                delivery.receipt_handle.to_string(),
            ));
        }

        info!(reason, "Message moved to the dead letters");
        Ok(())
    }
}
