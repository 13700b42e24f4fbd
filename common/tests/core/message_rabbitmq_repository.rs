use std::time::Duration;

use chrono::Utc;
use common::{
    configuration::RabbitMQSettings,
    ports::notification_queue::NotificationQueue,
    repositories::message_rabbitmq_repository::MessageRabbitMQRepository,
};
use lapin::Connection;
use secrecy::Secret;
use uuid::Uuid;

use crate::helpers::init_test;

fn local_rabbitmq_settings() -> RabbitMQSettings {
    RabbitMQSettings {
        username: "guest".to_string(),
        password: Secret::new("guest".to_string()),
        port: 5672,
        host: "127.0.0.1".to_string(),
    }
}

fn unique_queue_name() -> String {
    format!(
        "test_queue_{}_{}",
        Utc::now().format("%Y-%m-%d_%H-%M-%S"),
        Uuid::new_v4()
    )
}

// Needs a RabbitMQ broker listening on 127.0.0.1:5672
#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn an_unacknowledged_delivery_comes_back_once_its_visibility_expired() {
    init_test();
    let settings = local_rabbitmq_settings();
    let connection = Connection::connect(&settings.get_uri(), settings.get_connection_properties())
        .await
        .unwrap();
    let queue_name = unique_queue_name();

    let publisher = MessageRabbitMQRepository::try_new(&connection, &queue_name, Duration::from_secs(30), 1)
        .await
        .unwrap();
    let consumer = MessageRabbitMQRepository::try_new(
        &connection,
        &queue_name,
        Duration::from_millis(200),
        10,
    )
    .await
    .unwrap();

    publisher.enqueue(br#"{"doc_id":42}"#).await.unwrap();

    let first = consumer.receive(10, Duration::from_secs(5)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].receive_count, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let second = consumer.receive(10, Duration::from_secs(5)).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].payload, first[0].payload);
    assert!(second[0].receive_count >= 2);

    let error = consumer.acknowledge(&first[0].receipt_handle).await.unwrap_err();
    assert!(error.is_expired_handle());
    consumer.acknowledge(&second[0].receipt_handle).await.unwrap();
}

// Needs a RabbitMQ broker listening on 127.0.0.1:5672
#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn dead_lettered_messages_are_not_delivered_again() {
    init_test();
    let settings = local_rabbitmq_settings();
    let connection = Connection::connect(&settings.get_uri(), settings.get_connection_properties())
        .await
        .unwrap();
    let queue_name = unique_queue_name();

    let queue = MessageRabbitMQRepository::try_new(&connection, &queue_name, Duration::from_millis(100), 10)
        .await
        .unwrap();
    queue.enqueue(b"not-json").await.unwrap();

    let delivery = queue
        .receive(1, Duration::from_secs(5))
        .await
        .unwrap()
        .remove(0);
    queue.dead_letter(&delivery, "malformed payload").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(queue.receive(10, Duration::from_millis(500)).await.unwrap().is_empty());
}
