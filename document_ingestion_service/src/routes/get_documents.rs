use actix_web::{
    http::{header::ContentType, StatusCode},
    web, HttpResponse, ResponseError,
};
use common::{
    domain::entities::document::DocumentId,
    helper::error_chain_fmt,
    ports::document_repository::{DocumentRepository, DocumentRepositoryError},
};
use serde::Deserialize;
use serde_json::json;

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct ListDocumentsQuery {
    pub author_id: Option<i64>,
    pub limit: Option<i64>,
}

/// Most recent documents first, optionally only the ones of `author_id`
#[tracing::instrument(name = "List documents", skip(document_repository))]
pub async fn list_documents(
    query: web::Query<ListDocumentsQuery>,
    document_repository: web::Data<dyn DocumentRepository>,
) -> Result<HttpResponse, GetDocumentsError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let documents = document_repository.list(query.author_id, limit).await?;

    Ok(HttpResponse::Ok().json(documents))
}

#[tracing::instrument(name = "Get document", skip(document_repository))]
pub async fn get_document(
    path: web::Path<DocumentId>,
    document_repository: web::Data<dyn DocumentRepository>,
) -> Result<HttpResponse, GetDocumentsError> {
    let id = path.into_inner();

    match document_repository.get_by_id(id).await? {
        Some(document) => Ok(HttpResponse::Ok().json(document)),
        None => Err(GetDocumentsError::NotFound(id)),
    }
}

#[derive(thiserror::Error)]
pub enum GetDocumentsError {
    #[error("Document {0} not found")]
    NotFound(DocumentId),
    #[error(transparent)]
    RepositoryError(#[from] DocumentRepositoryError),
}

impl std::fmt::Debug for GetDocumentsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ResponseError for GetDocumentsError {
    fn status_code(&self) -> StatusCode {
        match self {
            GetDocumentsError::NotFound(_) => StatusCode::NOT_FOUND,
            GetDocumentsError::RepositoryError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<actix_web::body::BoxBody> {
        HttpResponse::build(self.status_code())
            .insert_header(ContentType::json())
            .json(json!({ "error": self.to_string() }))
    }
}
