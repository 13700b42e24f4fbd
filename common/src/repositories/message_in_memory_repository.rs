use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::Notify, time::Instant};
use uuid::Uuid;

use crate::ports::notification_queue::{Delivery, NotificationQueue, QueueError, ReceiptHandle};

/// Notification queue living in the memory of the current process
///
/// Follows the same delivery contract as the durable back-ends (visibility timeout,
/// receipt handle rotation on redelivery, dead-letter list) which makes it the queue
/// of choice for tests. Nothing survives the process.
pub struct MessageInMemoryRepository {
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    new_message: Notify,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    messages: BTreeMap<u64, StoredMessage>,
    dead_letters: Vec<DeadLetter>,
}

struct StoredMessage {
    payload: Vec<u8>,
    visible_at: Instant,
    receive_count: u32,
    receipt_handle: Option<ReceiptHandle>,
}

/// A message moved out of the queue because it could not be processed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub receive_count: u32,
    pub reason: String,
}

impl MessageInMemoryRepository {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
            new_message: Notify::new(),
        }
    }

    /// Messages that can be received right now
    pub fn pending_len(&self) -> usize {
        let now = Instant::now();
        self.lock_state()
            .messages
            .values()
            .filter(|message| message.visible_at <= now)
            .count()
    }

    /// Messages handed out and still hidden from other consumers
    pub fn in_flight_len(&self) -> usize {
        let now = Instant::now();
        self.lock_state()
            .messages
            .values()
            .filter(|message| message.receipt_handle.is_some() && message.visible_at > now)
            .count()
    }

    /// Every message not yet acknowledged nor dead-lettered
    pub fn len(&self) -> usize {
        self.lock_state().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_state().dead_letters.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the map half-updated
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out up to `max` visible messages, or tells when the next one becomes visible
    fn take_visible(&self, max: usize) -> Result<Vec<Delivery>, Option<Instant>> {
        let now = Instant::now();
        let mut state = self.lock_state();

        let mut deliveries = vec![];
        let mut next_visible_at: Option<Instant> = None;

        for (id, message) in state.messages.iter_mut() {
            if deliveries.len() >= max {
                break;
            }
            if message.visible_at > now {
                next_visible_at = Some(match next_visible_at {
                    Some(at) => at.min(message.visible_at),
                    None => message.visible_at,
                });
                continue;
            }

            let receipt_handle = ReceiptHandle::new(Uuid::new_v4().to_string());
            message.receive_count += 1;
            message.visible_at = now + self.visibility_timeout;
            message.receipt_handle = Some(receipt_handle.clone());

            deliveries.push(Delivery {
                message_id: id.to_string(),
                payload: message.payload.clone(),
                receipt_handle,
                receive_count: message.receive_count,
            });
        }

        if deliveries.is_empty() {
            Err(next_visible_at)
        } else {
            Ok(deliveries)
        }
    }

    fn find_by_handle(state: &QueueState, handle: &ReceiptHandle) -> Option<u64> {
        state
            .messages
            .iter()
            .find(|(_, message)| message.receipt_handle.as_ref() == Some(handle))
            .map(|(id, _)| *id)
    }
}

#[async_trait]
impl NotificationQueue for MessageInMemoryRepository {
    #[tracing::instrument(name = "Enqueuing in-memory message", skip(self, payload))]
    async fn enqueue(&self, payload: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.lock_state();
            state.next_id += 1;
            let id = state.next_id;
            state.messages.insert(
                id,
                StoredMessage {
                    payload: payload.to_vec(),
                    visible_at: Instant::now(),
                    receive_count: 0,
                    receipt_handle: None,
                },
            );
        }
        self.new_message.notify_waiters();

        Ok(())
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>, QueueError> {
        if max == 0 {
            return Ok(vec![]);
        }
        let deadline = Instant::now() + wait;

        loop {
            // Registered before looking at the messages so an enqueue in between is not missed
            let new_message = self.new_message.notified();

            let wake_up_at = match self.take_visible(max) {
                Ok(deliveries) => return Ok(deliveries),
                Err(Some(next_visible_at)) => next_visible_at.min(deadline),
                Err(None) => deadline,
            };

            if Instant::now() >= deadline {
                return Ok(vec![]);
            }

            tokio::select! {
                _ = new_message => {},
                _ = tokio::time::sleep_until(wake_up_at) => {},
            }
        }
    }

    async fn extend_visibility(
        &self,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        let id = Self::find_by_handle(&state, handle)
            .ok_or_else(|| QueueError::ReceiptHandleExpired(handle.to_string()))?;

        if let Some(message) = state.messages.get_mut(&id) {
            message.visible_at = Instant::now() + timeout;
        }
        Ok(())
    }

    async fn acknowledge(&self, handle: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        let id = Self::find_by_handle(&state, handle)
            .ok_or_else(|| QueueError::ReceiptHandleExpired(handle.to_string()))?;

        state.messages.remove(&id);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.lock_state();
        let id = Self::find_by_handle(&state, &delivery.receipt_handle)
            .ok_or_else(|| QueueError::ReceiptHandleExpired(delivery.receipt_handle.to_string()))?;

        if let Some(message) = state.messages.remove(&id) {
            state.dead_letters.push(DeadLetter {
                message_id: id.to_string(),
                payload: message.payload,
                receive_count: message.receive_count,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }
}
