use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::ports::notification_queue::{Delivery, NotificationQueue, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of deliveries pulled by one `receive`
    pub batch_size: usize,
    /// Long-poll duration of one `receive`
    pub wait: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
        }
    }
}

/// Endless sequence of deliveries pulled from a queue
///
/// Deliveries are received in batches and handed out one by one. The sequence itself holds no
/// state that the queue does not: dropping it and building a new one over the same queue
/// resumes consumption, buffered deliveries simply becoming visible again after their
/// visibility timeout.
pub struct Deliveries {
    queue: Arc<dyn NotificationQueue>,
    options: ReceiveOptions,
    buffer: VecDeque<Delivery>,
}

impl Deliveries {
    pub fn new(queue: Arc<dyn NotificationQueue>, options: ReceiveOptions) -> Self {
        Self {
            queue,
            options,
            buffer: VecDeque::new(),
        }
    }

    /// Waits for the next delivery
    ///
    /// Cancel safe: a delivery is only removed from the buffer once it is returned.
    pub async fn next(&mut self) -> Result<Delivery, QueueError> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Ok(delivery);
            }

            let batch = self
                .queue
                .receive(self.options.batch_size.max(1), self.options.wait)
                .await?;

            debug!(received = batch.len(), "Long-poll completed");
            self.buffer.extend(batch);
        }
    }

    /// Hands back deliveries already pulled from the queue but not yet returned by `next`
    pub fn take_buffered(&mut self) -> Vec<Delivery> {
        self.buffer.drain(..).collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
