use std::time::Duration;

use common::{
    dtos::document_notification::DocumentNotificationDto, ports::notification_queue::NotificationQueue,
};
use fake::{faker::lorem::en::Paragraph, Fake};
use reqwest::multipart::Form;
use serde_json::Value;

use crate::helpers::spawn_app;

#[tokio::test]
async fn upload_returns_a_201_with_the_draft_document() {
    let app = spawn_app().await;
    let text: String = Paragraph(3..6).fake();

    let response = app
        .post_upload("notes.txt", text.clone().into_bytes(), Some(7))
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let document: Value = response.json().await.expect("Invalid JSON body");
    assert_eq!(document["status"], "draft");
    assert_eq!(document["doc_size"], text.len() as i64);
    assert_eq!(document["author_id"], 7);
    let file_path = document["file_path"].as_str().unwrap();
    assert!(!file_path.is_empty());
    assert!(file_path.ends_with("/notes.txt"));
}

#[tokio::test]
async fn upload_stores_the_bytes_and_the_document_before_answering() {
    let app = spawn_app().await;

    let response = app.post_upload("notes.txt", b"hello".to_vec(), None).await;

    assert_eq!(response.status().as_u16(), 201);
    let document: Value = response.json().await.expect("Invalid JSON body");
    assert_eq!(app.blob_store.len(), 1);
    assert_eq!(app.document_repository.len(), 1);
    assert!(document["author_id"].is_null());
}

#[tokio::test]
async fn upload_enqueues_a_notification_with_the_document_id() {
    let app = spawn_app().await;

    let response = app.post_upload("notes.txt", b"hello".to_vec(), None).await;
    let document: Value = response.json().await.expect("Invalid JSON body");
    let doc_id = document["id"].as_i64().unwrap();

    let deliveries = app
        .queue
        .receive(10, Duration::from_millis(50))
        .await
        .expect("Failed to receive");
    assert_eq!(deliveries.len(), 1);
    assert_eq!(
        DocumentNotificationDto::try_parsing(&deliveries[0].payload).unwrap(),
        DocumentNotificationDto::new(doc_id)
    );
}

#[tokio::test]
async fn two_uploads_of_the_same_file_name_do_not_overwrite_each_other() {
    let app = spawn_app().await;

    let first: Value = app
        .post_upload("notes.txt", b"first".to_vec(), None)
        .await
        .json()
        .await
        .unwrap();
    let second: Value = app
        .post_upload("notes.txt", b"second".to_vec(), None)
        .await
        .json()
        .await
        .unwrap();

    assert_ne!(first["file_path"], second["file_path"]);
    assert_eq!(app.blob_store.len(), 2);
}

#[tokio::test]
async fn upload_sanitizes_the_file_name() {
    let app = spawn_app().await;

    let response = app
        .post_upload("my*report&v2.txt", b"hello".to_vec(), None)
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let document: Value = response.json().await.unwrap();
    assert!(document["file_path"]
        .as_str()
        .unwrap()
        .ends_with("/my_report_v2.txt"));
}

#[tokio::test]
async fn upload_returns_a_400_when_the_file_is_missing_or_empty() {
    let app = spawn_app().await;

    let test_cases = vec![
        (Form::new().text("author_id", "7"), "no file field"),
        (
            Form::new().part(
                "file",
                reqwest::multipart::Part::bytes(Vec::new()).file_name("empty.txt"),
            ),
            "empty file",
        ),
    ];

    for (form, description) in test_cases {
        let response = app.post_upload_form(form).await;

        assert_eq!(
            response.status().as_u16(),
            400,
            "The API did not fail with a 400 when the payload was: {}",
            description
        );
    }

    assert!(app.document_repository.is_empty());
    assert!(app.queue.is_empty());
}

#[tokio::test]
async fn upload_returns_a_400_when_the_file_name_is_unusable() {
    let app = spawn_app().await;

    let response = app.post_upload("...", b"hello".to_vec(), None).await;

    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().is_some());
    assert!(app.document_repository.is_empty());
}
