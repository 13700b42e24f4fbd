use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::entities::{
        document::{
            ClaimOutcome, Document, DocumentEnrichment, DocumentError, DocumentId, NewDocument,
            ProcessingClaim,
        },
        document_status::DocumentStatusError,
    },
    helper::error_chain_fmt,
};

/// Durable store of documents and their lifecycle status
///
/// Every mutation of an existing document is a single conditional write, so concurrent
/// processors of the same document can never interleave partial updates.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn insert(&self, new_document: NewDocument) -> Result<Document, DocumentRepositoryError>;

    async fn get_by_id(&self, id: DocumentId) -> Result<Option<Document>, DocumentRepositoryError>;

    /// Most recently created documents first
    async fn list(
        &self,
        author_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Document>, DocumentRepositoryError>;

    /// Moves a `draft` document, or one whose processing lease expired, into `processing`
    async fn try_claim(
        &self,
        id: DocumentId,
        lease: Duration,
    ) -> Result<ClaimOutcome, DocumentRepositoryError>;

    /// Writes title, content, meta and status in one go
    ///
    /// Returns `false` without writing anything when the claim no longer holds the document.
    /// Pushes the expiry of a claim still held to `lease` from now
    ///
    /// Returns `false` when the claim was lost, ex: taken over after its expiry.
    async fn renew_claim(
        &self,
        claim: &ProcessingClaim,
        lease: Duration,
    ) -> Result<bool, DocumentRepositoryError>;

    async fn commit_enrichment(
        &self,
        claim: &ProcessingClaim,
        enrichment: &DocumentEnrichment,
    ) -> Result<bool, DocumentRepositoryError>;

    /// Returns `false` when the document is not in flight anymore (or does not exist)
    async fn mark_failed(
        &self,
        id: DocumentId,
        reason: &str,
    ) -> Result<bool, DocumentRepositoryError>;
}

#[derive(thiserror::Error)]
pub enum DocumentRepositoryError {
    #[error(transparent)]
    DBError(#[from] sqlx::Error),
    #[error("Stored document {0} is invalid: {1}")]
    InvalidRow(DocumentId, String),
    #[error(transparent)]
    DocumentError(#[from] DocumentError),
    #[error(transparent)]
    StatusError(#[from] DocumentStatusError),
}

impl std::fmt::Debug for DocumentRepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
