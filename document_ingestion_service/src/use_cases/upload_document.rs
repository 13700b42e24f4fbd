use common::{
    core::retry::{retry_with_backoff, RetryPolicy},
    domain::entities::document::{Document, DocumentId, NewDocument},
    dtos::document_notification::{DocumentNotificationDto, DocumentNotificationDtoError},
    helper::error_chain_fmt,
    ports::{
        blob_store::{BlobStore, BlobStoreError},
        document_repository::{DocumentRepository, DocumentRepositoryError},
        notification_queue::{NotificationQueue, QueueError},
    },
};
use tracing::{error, info};
use uuid::Uuid;

pub const MAX_FILE_NAME_CHARS: usize = 200;

/// Stores an uploaded file, creates its `draft` document and notifies the processing workers
///
/// The document is committed before the notification is enqueued. If the enqueue still fails
/// after `enqueue_retry`, the document stays a `draft` nobody will process: it is logged as an
/// orphan and the error is returned to the caller.
#[tracing::instrument(
    name = "Uploading document",
    skip(bytes, blob_store, document_repository, queue),
    fields(byte_size = bytes.len())
)]
pub async fn upload_document(
    file_name: &str,
    bytes: &[u8],
    author_id: Option<i64>,
    blob_store: &dyn BlobStore,
    document_repository: &dyn DocumentRepository,
    queue: &dyn NotificationQueue,
    enqueue_retry: RetryPolicy,
) -> Result<Document, UploadDocumentError> {
    let file_name = sanitize_file_name(file_name)?;
    if bytes.is_empty() {
        return Err(UploadDocumentError::EmptyFile(file_name));
    }

    let object_key = format!("{}/{}", Uuid::new_v4(), file_name);
    let locator = blob_store.put(&object_key, bytes).await?;

    let document = document_repository
        .insert(
            NewDocument::builder()
                .file_path(locator.to_string())
                .doc_size(bytes.len() as i64)
                .author_id(author_id)
                .build(),
        )
        .await?;

    let notification = DocumentNotificationDto::new(document.id).try_serializing()?;
    let enqueued = retry_with_backoff(enqueue_retry, |_| true, || {
        queue.enqueue(notification.as_bytes())
    })
    .await;

    if let Err(error) = enqueued {
        error!(
            doc_id = document.id,
            file_path = %document.file_path,
            ?error,
            "Orphaned draft document: saved but not queued for processing"
        );
        return Err(UploadDocumentError::NotificationError(document.id, error));
    }

    info!(doc_id = document.id, "Document uploaded and queued for processing");
    Ok(document)
}

/// Keeps the last path segment of an uploaded file name, with only `[A-Za-z0-9._-]` characters
pub fn sanitize_file_name(file_name: &str) -> Result<String, UploadDocumentError> {
    let base_name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);

    let sanitized: String = base_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    let sanitized = sanitized.trim_start_matches('.').to_string();

    if sanitized.is_empty() || sanitized.chars().all(|c| c == '_') {
        return Err(UploadDocumentError::InvalidFileName(file_name.to_string()));
    }
    Ok(sanitized)
}

#[derive(thiserror::Error)]
pub enum UploadDocumentError {
    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),
    #[error("The file {0} is empty")]
    EmptyFile(String),
    #[error(transparent)]
    BlobStoreError(#[from] BlobStoreError),
    #[error(transparent)]
    DocumentRepositoryError(#[from] DocumentRepositoryError),
    #[error(transparent)]
    SerializingError(#[from] DocumentNotificationDtoError),
    #[error("Document {0} was saved but could not be queued for processing")]
    NotificationError(DocumentId, #[source] QueueError),
}

impl std::fmt::Debug for UploadDocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
