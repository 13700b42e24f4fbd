use std::time::Duration;

use common::{
    ports::notification_queue::NotificationQueue,
    repositories::message_postgres_repository::MessagePostgresRepository,
};

use crate::helpers::set_up_database;

const QUEUE_NAME: &str = "document_notifications";

// The tests below need a Postgres server listening on 127.0.0.1:5432

#[tokio::test]
#[ignore]
async fn a_received_message_is_hidden_until_its_visibility_expires() {
    let pg_pool = set_up_database().await;
    let queue = MessagePostgresRepository::new(pg_pool, QUEUE_NAME, Duration::from_millis(500));
    queue.enqueue(br#"{"doc_id":42}"#).await.unwrap();

    let first = queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].receive_count, 1);
    assert_eq!(first[0].payload, br#"{"doc_id":42}"#.to_vec());

    assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

    let redelivered = queue.receive(10, Duration::from_secs(3)).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].message_id, first[0].message_id);
    assert_eq!(redelivered[0].receive_count, 2);
}

#[tokio::test]
#[ignore]
async fn a_redelivery_invalidates_the_previous_receipt_handle() {
    let pg_pool = set_up_database().await;
    let queue = MessagePostgresRepository::new(pg_pool, QUEUE_NAME, Duration::from_millis(100));
    queue.enqueue(b"first").await.unwrap();

    let stale = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
    let fresh = queue.receive(1, Duration::from_secs(3)).await.unwrap().remove(0);
    assert_ne!(stale.receipt_handle, fresh.receipt_handle);

    let expired = queue.acknowledge(&stale.receipt_handle).await.unwrap_err();
    assert!(expired.is_expired_handle());
    let expired = queue
        .extend_visibility(&stale.receipt_handle, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(expired.is_expired_handle());

    queue.acknowledge(&fresh.receipt_handle).await.unwrap();
    assert!(queue.receive(1, Duration::from_millis(300)).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn concurrent_consumers_never_receive_the_same_message() {
    let pg_pool = set_up_database().await;
    let first_consumer =
        MessagePostgresRepository::new(pg_pool.clone(), QUEUE_NAME, Duration::from_secs(30));
    let second_consumer =
        MessagePostgresRepository::new(pg_pool, QUEUE_NAME, Duration::from_secs(30));
    for i in 0..20 {
        first_consumer
            .enqueue(format!(r#"{{"doc_id":{}}}"#, i).as_bytes())
            .await
            .unwrap();
    }

    let (first, second) = tokio::join!(
        first_consumer.receive(15, Duration::ZERO),
        second_consumer.receive(15, Duration::ZERO)
    );
    let mut message_ids: Vec<String> = first
        .unwrap()
        .into_iter()
        .chain(second.unwrap())
        .map(|delivery| delivery.message_id)
        .collect();
    let received = message_ids.len();
    message_ids.sort();
    message_ids.dedup();

    assert_eq!(message_ids.len(), received);
    assert!(received <= 20);
}

#[tokio::test]
#[ignore]
async fn a_waiting_receive_is_woken_up_by_an_enqueue() {
    let pg_pool = set_up_database().await;
    let consumer =
        MessagePostgresRepository::new(pg_pool.clone(), QUEUE_NAME, Duration::from_secs(30));
    let producer = MessagePostgresRepository::new(pg_pool, QUEUE_NAME, Duration::from_secs(30));

    let (deliveries, _) = tokio::join!(consumer.receive(1, Duration::from_secs(5)), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        producer.enqueue(b"late").await.unwrap();
    });

    assert_eq!(deliveries.unwrap().len(), 1);
    // The listener is kept for the next receive
    producer.enqueue(b"later").await.unwrap();
    assert_eq!(consumer.receive(1, Duration::from_secs(5)).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore]
async fn dead_lettered_messages_are_never_delivered_again() {
    let pg_pool = set_up_database().await;
    let queue = MessagePostgresRepository::new(pg_pool, QUEUE_NAME, Duration::from_millis(100));
    queue.enqueue(b"not-json").await.unwrap();

    let delivery = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
    queue.dead_letter(&delivery, "undecodable payload").await.unwrap();

    assert!(queue.receive(1, Duration::from_millis(300)).await.unwrap().is_empty());
    assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
}
