use std::sync::Arc;
use std::time::Duration;

use claims::{assert_matches, assert_none, assert_some};
use common::{
    domain::entities::{blob_locator::BlobLocator, document_status::DocumentStatus},
    ports::{document_repository::DocumentRepository, notification_queue::NotificationQueue},
};
use document_processing_worker::handlers::handler_document_notification::DeliveryOutcome;
use fake::{faker::lorem::en::Sentence, Fake};
use tokio_util::sync::CancellationToken;

use crate::helpers::{
    test_options, EventLog, RecordingDocumentRepository, RecordingQueue, SlowBlobStore,
    TestWorker,
};

#[tokio::test]
async fn a_notified_draft_is_processed_and_its_notification_acknowledged() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker
        .seed_document(42, "report.txt", b"Quarterly report\nAll good.\n")
        .await;
    worker.notify(42).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Processed {
            doc_id: 42,
            status: DocumentStatus::Processed
        }]
    );
    let document = assert_some!(worker.document(42).await);
    assert_eq!(document.status, DocumentStatus::Processed);
    assert_eq!(document.title, "Quarterly report");
    assert_eq!(document.content, "Quarterly report\nAll good.\n");
    assert_eq!(document.meta["word_count"], "4");
    assert_none!(document.processing_lease);
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn a_binary_document_is_left_pre_processed() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker
        .seed_document(7, "scan.pdf", &[0x25, 0x50, 0x44, 0x46, 0x00, 0xc3, 0x28])
        .await;
    worker.notify(7).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Processed {
            doc_id: 7,
            status: DocumentStatus::PreProcessed
        }]
    );
    let document = assert_some!(worker.document(7).await);
    assert_eq!(document.status, DocumentStatus::PreProcessed);
    assert_eq!(document.title, "scan");
    assert_eq!(document.meta["content_type"], "application/pdf");
}

#[tokio::test]
async fn a_notification_of_an_unknown_document_is_dead_lettered() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker.notify(999).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::DeadLettered { .. }]);
    assert!(worker.queue.is_empty());
    assert_eq!(worker.queue.dead_letters().len(), 1);
    assert_none!(worker.document(999).await);
    assert!(worker.document_repository.is_empty());
}

#[tokio::test]
async fn a_malformed_payload_does_not_block_the_next_deliveries() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker.seed_document(1, "a.txt", b"First").await;
    worker.queue.enqueue(b"not-json").await.unwrap();
    worker.notify(1).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_matches!(&outcomes[0], DeliveryOutcome::DeadLettered { .. });
    assert_matches!(&outcomes[1], DeliveryOutcome::Processed { doc_id: 1, .. });
    assert_eq!(worker.queue.dead_letters()[0].payload, b"not-json".to_vec());
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn processing_a_notification_twice_changes_nothing_the_second_time() {
    let worker = TestWorker::new(Duration::from_secs(30));
    let text: String = Sentence(3..10).fake();
    worker.seed_document(5, "note.txt", text.as_bytes()).await;
    let handler = worker.handler();

    worker.notify(5).await;
    handler.run_once().await.unwrap();
    let processed_once = assert_some!(worker.document(5).await);

    worker.notify(5).await;
    let outcomes = handler.run_once().await.unwrap();

    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Duplicate {
            doc_id: 5,
            status: DocumentStatus::Processed
        }]
    );
    assert_eq!(assert_some!(worker.document(5).await), processed_once);
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn a_delivery_whose_visibility_expired_is_processed_by_its_redelivery() {
    let worker = TestWorker::new(Duration::from_millis(50));
    worker.seed_document(3, "slow.txt", b"Slow document").await;
    worker.notify(3).await;

    // A first consumer receives the message and stalls past its visibility timeout
    let stalled = worker
        .queue
        .receive(1, Duration::ZERO)
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let handler = worker.handler();
    let outcomes = handler.run_once().await.unwrap();
    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::Processed { doc_id: 3, .. }]);

    // The stalled consumer wakes up: its delivery belongs to someone else now
    assert_eq!(
        handler.handle_delivery(&stalled).await,
        DeliveryOutcome::HandleExpired
    );
    let document = assert_some!(worker.document(3).await);
    assert_eq!(document.status, DocumentStatus::Processed);
    assert_eq!(document.title, "Slow document");
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn the_acknowledgement_always_comes_after_the_commit() {
    let worker = TestWorker::new(Duration::from_secs(30));
    for id in 1..=3 {
        worker.seed_document(id, "doc.txt", b"Some text").await;
        worker.notify(id).await;
    }
    let log = EventLog::default();
    let handler = worker.handler_with(
        Arc::new(RecordingQueue {
            inner: worker.queue.clone(),
            log: log.clone(),
        }),
        Arc::new(RecordingDocumentRepository {
            inner: worker.document_repository.clone(),
            log: log.clone(),
            fail_commits: false,
        }),
        worker.blob_store.clone(),
        test_options(),
    );

    handler.run_once().await.unwrap();

    assert_eq!(
        log.events(),
        [
            "commit true",
            "acknowledge",
            "commit true",
            "acknowledge",
            "commit true",
            "acknowledge"
        ]
    );
}

#[tokio::test]
async fn a_failed_commit_leaves_the_notification_for_redelivery() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker.seed_document(8, "doc.txt", b"Some text").await;
    worker.notify(8).await;
    let log = EventLog::default();
    let handler = worker.handler_with(
        Arc::new(RecordingQueue {
            inner: worker.queue.clone(),
            log: log.clone(),
        }),
        Arc::new(RecordingDocumentRepository {
            inner: worker.document_repository.clone(),
            log: log.clone(),
            fail_commits: true,
        }),
        worker.blob_store.clone(),
        test_options(),
    );

    let outcomes = handler.run_once().await.unwrap();

    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::LeftForRedelivery { .. }]);
    // Retried once locally, never acknowledged
    assert_eq!(log.events(), ["commit failed", "commit failed"]);
    assert_eq!(worker.queue.len(), 1);
    let document = assert_some!(worker.document(8).await);
    assert_eq!(document.status, DocumentStatus::Processing);
}

#[tokio::test]
async fn a_document_whose_file_is_missing_is_marked_as_failed() {
    let worker = TestWorker::new(Duration::from_secs(30));
    let locator = BlobLocator::parse("memory://documents/11/lost.txt").unwrap();
    worker.seed_draft(11, &locator, 12);
    worker.notify(11).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::DocumentFailed { doc_id: 11, .. }]);
    let document = assert_some!(worker.document(11).await);
    assert_eq!(document.status, DocumentStatus::Failed);
    assert_some!(document.failure_reason);
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn a_notification_delivered_too_many_times_is_dead_lettered() {
    let worker = TestWorker::new(Duration::from_millis(20));
    worker.seed_document(13, "doc.txt", b"Some text").await;
    worker.notify(13).await;

    // Three consumers crash in turn without acknowledging
    for _ in 0..test_options().max_receive_count {
        let deliveries = worker.queue.receive(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::DeadLettered { .. }]);
    assert_eq!(worker.queue.dead_letters()[0].receive_count, 4);
    let document = assert_some!(worker.document(13).await);
    assert_eq!(document.status, DocumentStatus::Failed);
}

#[tokio::test]
async fn a_document_claimed_by_another_worker_is_left_alone() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker.seed_document(21, "doc.txt", b"Some text").await;
    worker
        .document_repository
        .try_claim(21, Duration::from_secs(60))
        .await
        .unwrap();
    worker.notify(21).await;

    let outcomes = worker.handler().run_once().await.unwrap();

    assert_matches!(outcomes.as_slice(), [DeliveryOutcome::LeftForRedelivery { .. }]);
    assert_eq!(worker.queue.len(), 1);
    assert_eq!(worker.queue.in_flight_len(), 1);
    let document = assert_some!(worker.document(21).await);
    assert_eq!(document.status, DocumentStatus::Processing);
}

#[tokio::test]
async fn cancelling_a_running_handler_drains_the_deliveries_already_pulled() {
    let worker = TestWorker::new(Duration::from_secs(30));
    for id in 1..=3 {
        worker.seed_document(id, "doc.txt", b"Some text").await;
        worker.notify(id).await;
    }
    let handler = worker.handler_with(
        worker.queue.clone(),
        worker.document_repository.clone(),
        Arc::new(SlowBlobStore {
            inner: worker.blob_store.clone(),
            delay: Duration::from_millis(100),
        }),
        test_options(),
    );
    let cancel_token = CancellationToken::new();

    let running = tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move { handler.run_until_cancelled(cancel_token).await }
    });
    // The whole batch is pulled, the first delivery is in progress
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_token.cancel();

    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("the handler should stop once drained")
        .unwrap();

    for id in 1..=3 {
        let document = assert_some!(worker.document(id).await);
        assert_eq!(document.status, DocumentStatus::Processed);
    }
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn the_heartbeat_keeps_a_slow_delivery_hidden_from_other_consumers() {
    let worker = TestWorker::new(Duration::from_millis(100));
    worker.seed_document(5, "slow.txt", b"Slow document").await;
    worker.notify(5).await;
    let mut options = test_options();
    options.processing_visibility = Duration::from_millis(200);
    let slow_handler = worker.handler_with(
        worker.queue.clone(),
        worker.document_repository.clone(),
        Arc::new(SlowBlobStore {
            inner: worker.blob_store.clone(),
            delay: Duration::from_millis(600),
        }),
        options.clone(),
    );
    options.receive.wait = Duration::from_millis(700);
    let other_handler = worker.handler_with(
        worker.queue.clone(),
        worker.document_repository.clone(),
        worker.blob_store.clone(),
        options,
    );

    let (slow_outcomes, other_outcomes) = tokio::join!(slow_handler.run_once(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        other_handler.run_once().await
    });

    assert_matches!(
        slow_outcomes.unwrap().as_slice(),
        [DeliveryOutcome::Processed { doc_id: 5, .. }]
    );
    assert!(other_outcomes.unwrap().is_empty());
    assert!(worker.queue.is_empty());
}

#[tokio::test]
async fn a_slow_transform_keeps_its_claim_against_a_duplicate_delivery() {
    let worker = TestWorker::new(Duration::from_secs(30));
    worker.seed_document(1, "slow.txt", b"Slow document").await;
    worker.notify(1).await;
    worker.notify(1).await;
    let mut options = test_options();
    options.receive.batch_size = 1;
    options.processing_visibility = Duration::from_secs(1);
    options.processing_lease = Duration::from_millis(100);
    let slow_handler = worker.handler_with(
        worker.queue.clone(),
        worker.document_repository.clone(),
        Arc::new(SlowBlobStore {
            inner: worker.blob_store.clone(),
            delay: Duration::from_millis(400),
        }),
        options.clone(),
    );
    let duplicate_handler = worker.handler_with(
        worker.queue.clone(),
        worker.document_repository.clone(),
        worker.blob_store.clone(),
        options,
    );

    let (slow_outcomes, duplicate_outcomes) = tokio::join!(slow_handler.run_once(), async {
        // Well past the initial lease of the first claim
        tokio::time::sleep(Duration::from_millis(200)).await;
        duplicate_handler.run_once().await
    });

    assert_matches!(
        slow_outcomes.unwrap().as_slice(),
        [DeliveryOutcome::Processed { doc_id: 1, .. }]
    );
    assert_matches!(
        duplicate_outcomes.unwrap().as_slice(),
        [DeliveryOutcome::LeftForRedelivery { .. }]
    );
    let document = assert_some!(worker.document(1).await);
    assert_eq!(document.status, DocumentStatus::Processed);
    assert_eq!(document.title, "Slow document");
}
