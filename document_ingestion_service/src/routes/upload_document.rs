use std::sync::Arc;

use actix_multipart::form::{tempfile::TempFile, text::Text, MultipartForm};
use actix_web::{
    http::{header::ContentType, StatusCode},
    web, HttpResponse, ResponseError,
};
use anyhow::Context;
use common::{
    core::retry::RetryPolicy,
    helper::error_chain_fmt,
    ports::{
        blob_store::BlobStore, document_repository::DocumentRepository,
        notification_queue::NotificationQueue,
    },
};
use serde_json::json;
use tracing::info;

use crate::{
    configuration::IngestionSettings,
    use_cases::upload_document::{upload_document as upload, UploadDocumentError},
};

#[derive(MultipartForm)]
pub struct UploadForm {
    #[multipart(rename = "file")]
    file: Option<TempFile>,
    author_id: Option<Text<i64>>,
}

/// Stores the uploaded file and queues it for processing
///
/// Answers `201 Created` with the `draft` document once it is both saved and queued.
#[tracing::instrument(
    name = "Upload document",
    skip_all
)]
pub async fn upload_document(
    MultipartForm(form): MultipartForm<UploadForm>,
    blob_store: web::Data<dyn BlobStore>,
    document_repository: web::Data<dyn DocumentRepository>,
    queue: web::Data<Arc<dyn NotificationQueue>>,
    ingestion: web::Data<IngestionSettings>,
) -> Result<HttpResponse, UploadDocumentRouteError> {
    let file = form.file.ok_or(UploadDocumentRouteError::MissingFile)?;
    let file_name = file.file_name.clone().unwrap_or_default();
    let author_id = form.author_id.map(|author_id| author_id.into_inner());

    info!(%file_name, size = file.size, ?author_id, "Receiving file");

    let bytes = tokio::fs::read(file.file.path())
        .await
        .with_context(|| format!("Failed to read the uploaded file {}", file_name))?;

    let document = upload(
        &file_name,
        &bytes,
        author_id,
        blob_store.get_ref(),
        document_repository.get_ref(),
        queue.get_ref().as_ref(),
        RetryPolicy::new(
            ingestion.enqueue_retry_attempts,
            ingestion.enqueue_retry_backoff(),
        ),
    )
    .await?;

    Ok(HttpResponse::Created().json(document))
}

#[derive(thiserror::Error)]
pub enum UploadDocumentRouteError {
    #[error("A `file` field is required")]
    MissingFile,
    #[error(transparent)]
    UploadError(#[from] UploadDocumentError),
    #[error(transparent)]
    InternalError(#[from] anyhow::Error),
}

impl std::fmt::Debug for UploadDocumentRouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for UploadDocumentRouteError {
    fn status_code(&self) -> StatusCode {
        match self {
            UploadDocumentRouteError::MissingFile
            | UploadDocumentRouteError::UploadError(
                UploadDocumentError::InvalidFileName(_) | UploadDocumentError::EmptyFile(_),
            ) => StatusCode::BAD_REQUEST,
            UploadDocumentRouteError::UploadError(_) | UploadDocumentRouteError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    #[tracing::instrument(name = "Response error from upload_document route", skip(self), fields(error = %self))]
    fn error_response(&self) -> HttpResponse<actix_web::body::BoxBody> {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(json!({ "error": self.to_string() }))
    }
}
