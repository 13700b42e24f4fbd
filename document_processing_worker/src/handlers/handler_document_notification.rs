use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{
    core::{
        deliveries::{Deliveries, ReceiveOptions},
        retry::{retry_with_backoff, RetryPolicy},
    },
    domain::entities::{
        blob_locator::BlobLocator,
        document::{ClaimOutcome, DocumentEnrichment, DocumentId, ProcessingClaim},
        document_status::DocumentStatus,
    },
    dtos::document_notification::DocumentNotificationDto,
    ports::{
        blob_store::{BlobStore, BlobStoreError},
        document_repository::{DocumentRepository, DocumentRepositoryError},
        notification_queue::{Delivery, NotificationQueue, QueueError, ReceiptHandle},
    },
};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    configuration::Settings,
    domain::services::document_enrichment::enrich_document,
};

/// Pause after a failed `receive` before polling again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Extra time given to a live processing claim before its notification comes back
const CLAIM_EXPIRY_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub receive: ReceiveOptions,
    pub processing_visibility: Duration,
    pub max_receive_count: u32,
    pub processing_lease: Duration,
    pub commit_retry: RetryPolicy,
}

impl HandlerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let worker = &settings.worker;

        Self {
            receive: ReceiveOptions {
                batch_size: settings.queue.receive_batch_size,
                wait: settings.queue.receive_wait(),
            },
            processing_visibility: worker.processing_visibility(),
            max_receive_count: worker.max_receive_count,
            processing_lease: worker.processing_lease(),
            commit_retry: RetryPolicy::new(
                worker.commit_retry_attempts,
                worker.commit_retry_backoff(),
            ),
        }
    }
}

/// What became of one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The enrichment is committed and the message acknowledged (or its handle had expired)
    Processed {
        doc_id: DocumentId,
        status: DocumentStatus,
    },
    /// The document had already been processed, the message is acknowledged
    Duplicate {
        doc_id: DocumentId,
        status: DocumentStatus,
    },
    /// The document can never be processed, it is marked as failed and the message acknowledged
    DocumentFailed { doc_id: DocumentId, reason: String },
    DeadLettered { reason: String },
    /// Not acknowledged, the message comes back once its visibility timeout elapses
    LeftForRedelivery { reason: String },
    /// The delivery was handed out again to another consumer, nothing was done
    HandleExpired,
}

/// Processes the document notifications received from one queue handle
///
/// A delivery is acknowledged only once its effect is committed to the document repository.
/// Redeliveries are made harmless by the document status: a document can only be claimed
/// while `draft` (or while the claim of a vanished worker is expired), and a commit only goes
/// through while the claim is still held.
pub struct DocumentNotificationHandler {
    queue: Arc<dyn NotificationQueue>,
    document_repository: Arc<dyn DocumentRepository>,
    blob_store: Arc<dyn BlobStore>,
    options: HandlerOptions,
}

impl DocumentNotificationHandler {
    pub fn new(
        queue: Arc<dyn NotificationQueue>,
        document_repository: Arc<dyn DocumentRepository>,
        blob_store: Arc<dyn BlobStore>,
        options: HandlerOptions,
    ) -> Self {
        Self {
            queue,
            document_repository,
            blob_store,
            options,
        }
    }

    /// One worker iteration: a single `receive`, then every received delivery is handled
    pub async fn run_once(&self) -> Result<Vec<DeliveryOutcome>, QueueError> {
        let deliveries = self
            .queue
            .receive(self.options.receive.batch_size.max(1), self.options.receive.wait)
            .await?;

        let mut outcomes = Vec::with_capacity(deliveries.len());
        for delivery in &deliveries {
            outcomes.push(self.handle_delivery(delivery).await);
        }
        Ok(outcomes)
    }

    /// Handles deliveries until `cancel_token` is cancelled
    ///
    /// Stops pulling new deliveries on cancellation, but finishes the delivery in progress
    /// and the ones already pulled from the queue before returning.
    pub async fn run_until_cancelled(&self, cancel_token: CancellationToken) {
        info!("📡 Handling document notifications until cancelled");
        let mut deliveries = Deliveries::new(self.queue.clone(), self.options.receive);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Ok(delivery) => {
                    self.handle_delivery(&delivery).await;
                }
                Err(error) => {
                    error!(?error, "Failed to receive document notifications");
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        let buffered = deliveries.take_buffered();
        info!(
            "Draining {} buffered deliveries before stopping",
            buffered.len()
        );
        for delivery in &buffered {
            self.handle_delivery(delivery).await;
        }
        info!("👋 Stopped handling document notifications");
    }

    /// Handles one delivery, from its visibility extension to its acknowledgement
    ///
    /// Never fails: every error ends up in the returned outcome.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let span = info_span!(
            "Handling document notification",
            message_id = %delivery.message_id,
            receive_count = delivery.receive_count,
            doc_id = tracing::field::Empty,
        );

        async move {
            let outcome = self.process(delivery).await;
            match &outcome {
                DeliveryOutcome::Processed { .. } | DeliveryOutcome::Duplicate { .. } => {
                    info!(?outcome, "Delivery handled")
                }
                _ => warn!(?outcome, "Delivery not processed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let notification = DocumentNotificationDto::try_parsing(&delivery.payload);
        if let Ok(notification) = &notification {
            tracing::Span::current().record("doc_id", notification.doc_id);
        }

        if delivery.receive_count > self.options.max_receive_count {
            let reason = format!(
                "delivered {} times, more than the maximum of {}",
                delivery.receive_count, self.options.max_receive_count
            );
            if let Ok(notification) = &notification {
                if let Err(error) = self
                    .document_repository
                    .mark_failed(notification.doc_id, &reason)
                    .await
                {
                    error!(?error, "Failed to mark the document of a poison message as failed");
                    return DeliveryOutcome::LeftForRedelivery {
                        reason: error.to_string(),
                    };
                }
            }
            return self.dead_letter(delivery, reason).await;
        }

        match self
            .queue
            .extend_visibility(&delivery.receipt_handle, self.options.processing_visibility)
            .await
        {
            Ok(()) => {}
            Err(error) if error.is_expired_handle() => return DeliveryOutcome::HandleExpired,
            // Best effort, the default visibility timeout still hides the message
            Err(error) => warn!(?error, "Failed to extend the visibility of the delivery"),
        }

        let notification = match notification {
            Ok(notification) => notification,
            Err(error) => {
                error!(?error, "Undecodable document notification");
                return self
                    .dead_letter(delivery, format!("undecodable payload: {}", error))
                    .await;
            }
        };
        let doc_id = notification.doc_id;

        let claim = match self
            .document_repository
            .try_claim(doc_id, self.options.processing_lease)
            .await
        {
            Ok(ClaimOutcome::Claimed(claim)) => claim,
            Ok(ClaimOutcome::NotFound) => {
                return self
                    .dead_letter(delivery, format!("document {} does not exist", doc_id))
                    .await
            }
            Ok(ClaimOutcome::AlreadySettled(status)) => {
                self.acknowledge(&delivery.receipt_handle).await;
                return DeliveryOutcome::Duplicate { doc_id, status };
            }
            Ok(ClaimOutcome::InProgressElsewhere { lease_expires_at }) => {
                // Comes back when the other claim can be taken over if its worker vanished
                let remaining = (lease_expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if let Err(error) = self
                    .queue
                    .extend_visibility(&delivery.receipt_handle, remaining + CLAIM_EXPIRY_MARGIN)
                    .await
                {
                    warn!(?error, "Failed to delay the delivery of a claimed document");
                }
                return DeliveryOutcome::LeftForRedelivery {
                    reason: format!("document {} is being processed elsewhere", doc_id),
                };
            }
            Err(error) => {
                error!(?error, "Failed to claim the document");
                return DeliveryOutcome::LeftForRedelivery {
                    reason: error.to_string(),
                };
            }
        };

        let enrichment = match self
            .with_heartbeat(&delivery.receipt_handle, &claim, self.enrich(&claim))
            .await
        {
            Ok(enrichment) => enrichment,
            Err(error) if error.is_permanent() => {
                return self
                    .fail_document(delivery, doc_id, format!("document file unavailable: {}", error))
                    .await
            }
            Err(error) => {
                error!(?error, "Failed to get the document file");
                return DeliveryOutcome::LeftForRedelivery {
                    reason: error.to_string(),
                };
            }
        };

        match self.commit(&claim, &enrichment).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("The processing claim was lost before the commit");
                return DeliveryOutcome::LeftForRedelivery {
                    reason: "processing claim lost".to_string(),
                };
            }
            Err(error) => {
                error!(?error, "Failed to commit the document enrichment");
                return DeliveryOutcome::LeftForRedelivery {
                    reason: error.to_string(),
                };
            }
        }

        self.acknowledge(&delivery.receipt_handle).await;
        DeliveryOutcome::Processed {
            doc_id,
            status: enrichment.status,
        }
    }

    #[tracing::instrument(name = "Enriching document", skip(self, claim), fields(doc_id = claim.document_id()))]
    async fn enrich(&self, claim: &ProcessingClaim) -> Result<DocumentEnrichment, BlobStoreError> {
        let document = &claim.document;
        let locator = BlobLocator::parse(&document.file_path)?;
        let bytes = self.blob_store.get(&locator).await?;

        Ok(enrich_document(document.file_name(), &bytes))
    }

    async fn commit(
        &self,
        claim: &ProcessingClaim,
        enrichment: &DocumentEnrichment,
    ) -> Result<bool, DocumentRepositoryError> {
        retry_with_backoff(
            self.options.commit_retry,
            |error| matches!(error, DocumentRepositoryError::DBError(_)),
            || self.document_repository.commit_enrichment(claim, enrichment),
        )
        .await
    }

    /// Renews the visibility of the delivery and the lease of the claim while `work` runs
    ///
    /// Ticks every half of the shortest of the visibility window and the lease.
    async fn with_heartbeat<F: Future>(
        &self,
        handle: &ReceiptHandle,
        claim: &ProcessingClaim,
        work: F,
    ) -> F::Output {
        let visibility = self.options.processing_visibility;
        let lease = self.options.processing_lease;
        let period = (visibility.min(lease) / 2).max(Duration::from_millis(10));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = heartbeat.tick() => {
                    if let Err(error) = self.queue.extend_visibility(handle, visibility).await {
                        warn!(?error, "Failed to renew the visibility of the delivery");
                    }
                    match self.document_repository.renew_claim(claim, lease).await {
                        Ok(true) => {}
                        Ok(false) => warn!("The processing claim was lost while processing"),
                        Err(error) => warn!(?error, "Failed to renew the processing claim"),
                    }
                }
            }
        }
    }

    async fn fail_document(
        &self,
        delivery: &Delivery,
        doc_id: DocumentId,
        reason: String,
    ) -> DeliveryOutcome {
        if let Err(error) = self.document_repository.mark_failed(doc_id, &reason).await {
            error!(?error, "Failed to mark the document as failed");
            return DeliveryOutcome::LeftForRedelivery {
                reason: error.to_string(),
            };
        }

        self.acknowledge(&delivery.receipt_handle).await;
        DeliveryOutcome::DocumentFailed { doc_id, reason }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> DeliveryOutcome {
        match self.queue.dead_letter(delivery, &reason).await {
            Ok(()) => DeliveryOutcome::DeadLettered { reason },
            Err(error) if error.is_expired_handle() => DeliveryOutcome::HandleExpired,
            Err(error) => {
                error!(?error, "Failed to dead-letter the delivery");
                DeliveryOutcome::LeftForRedelivery {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Failing to acknowledge leads to a redelivery, which the document status turns into a duplicate
    async fn acknowledge(&self, handle: &ReceiptHandle) {
        match self.queue.acknowledge(handle).await {
            Ok(()) => {}
            Err(error) if error.is_expired_handle() => {
                warn!(?error, "Receipt handle expired before the acknowledgement")
            }
            Err(error) => error!(?error, "Failed to acknowledge the delivery"),
        }
    }
}
