use std::time::Duration;

use async_trait::async_trait;

use crate::helper::error_chain_fmt;

/// Capability to acknowledge, or extend the visibility of, one specific delivery of a message
///
/// A handle stops being valid once the message is acknowledged, dead-lettered or handed out
/// again to another consumer after its visibility window elapsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }
}

impl AsRef<str> for ReceiptHandle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One delivery of a queued message
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub receipt_handle: ReceiptHandle,
    /// How many times the message has been handed out, this delivery included
    pub receive_count: u32,
}

/// Durable, at-least-once message channel
///
/// A message can be delivered more than once, to the same or to different consumers,
/// and there is no ordering between messages. Consumers acknowledge a delivery only once its
/// effect is durably committed.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Returns once the queue durably holds the message
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Waits up to `wait` for at most `max` deliveries
    ///
    /// Can return fewer deliveries than available, or none.
    /// Every returned delivery is hidden from other consumers for the visibility timeout of the queue.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError>;

    /// Hides the delivered message for `timeout` from now on
    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Deletes the message so it is never delivered again
    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError>;

    /// Moves a message that cannot be processed to the dead-letter side channel
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

#[derive(thiserror::Error)]
pub enum QueueError {
    #[error("Receipt handle {0} is expired or unknown")]
    ReceiptHandleExpired(String),
    #[error(transparent)]
    DBError(#[from] sqlx::Error),
    #[error(transparent)]
    RabbitMQError(#[from] lapin::Error),
    #[error("The broker did not confirm the message: {0}")]
    NotConfirmed(String),
    #[error("The queue is closed: {0}")]
    Closed(String),
}

impl QueueError {
    /// The delivery raced with a visibility expiry, not a failure of the queue itself
    pub fn is_expired_handle(&self) -> bool {
        matches!(self, QueueError::ReceiptHandleExpired(_))
    }
}

impl std::fmt::Debug for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
