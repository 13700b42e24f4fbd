use std::time::Duration;

use claims::assert_ok;
use common::{
    core::notification_queue_factory::NotificationQueueFactory,
    domain::entities::document_status::DocumentStatus,
};
use document_processing_worker::startup::Application;
use tokio_util::sync::CancellationToken;

use crate::helpers::{test_options, TestWorker};

#[tokio::test(flavor = "multi_thread")]
async fn worker_tasks_share_the_queue_and_stop_on_cancellation() {
    let worker = TestWorker::new(Duration::from_secs(30));
    for id in 1..=10 {
        worker
            .seed_document(id, "doc.txt", format!("Document {}", id).as_bytes())
            .await;
        worker.notify(id).await;
    }

    let application = Application::from_parts(
        NotificationQueueFactory::in_memory(worker.queue.clone()),
        worker.document_repository.clone(),
        worker.blob_store.clone(),
        test_options(),
        3,
    );
    let cancel_token = CancellationToken::new();
    let running = tokio::spawn(application.run_until_stopped(cancel_token.clone()));

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while !worker.queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    cancel_token.cancel();

    assert_ok!(drained);
    assert_ok!(running.await.unwrap());
    for id in 1..=10 {
        let document = worker.document(id).await.unwrap();
        assert_eq!(document.status, DocumentStatus::Processed);
        assert_eq!(document.title, format!("Document {}", id));
    }
}
