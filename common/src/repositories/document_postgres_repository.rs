use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    domain::entities::{
        document::{
            ClaimOutcome, Document, DocumentEnrichment, DocumentError, DocumentId, DocumentMeta,
            NewDocument, ProcessingClaim, ProcessingLease,
        },
        document_status::DocumentStatus,
    },
    ports::document_repository::{DocumentRepository, DocumentRepositoryError},
};

/// Document repository implemented using Postgres
pub struct DocumentPostgresRepository {
    pg_pool: PgPool,
}

impl DocumentPostgresRepository {
    pub fn new(pg_pool: PgPool) -> Self {
        Self { pg_pool }
    }
}

#[derive(sqlx::FromRow)]
struct DocumentRecord {
    id: i64,
    title: String,
    content: String,
    doc_size: i64,
    status: String,
    meta: Json<DocumentMeta>,
    file_path: String,
    author_id: Option<i64>,
    claim_token: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DocumentRecord> for Document {
    type Error = DocumentRepositoryError;

    fn try_from(record: DocumentRecord) -> Result<Self, Self::Error> {
        let status = record
            .status
            .parse::<DocumentStatus>()
            .map_err(|error| DocumentRepositoryError::InvalidRow(record.id, error.to_string()))?;

        let processing_lease = match (record.claim_token, record.claimed_until) {
            (Some(token), Some(expires_at)) => Some(ProcessingLease { token, expires_at }),
            _ => None,
        };

        Ok(Document {
            id: record.id,
            title: record.title,
            content: record.content,
            doc_size: record.doc_size,
            status,
            meta: record.meta.0,
            file_path: record.file_path,
            author_id: record.author_id,
            failure_reason: record.failure_reason,
            processing_lease,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[async_trait]
impl DocumentRepository for DocumentPostgresRepository {
    #[tracing::instrument(name = "Saving new document in database", skip(self))]
    async fn insert(&self, new_document: NewDocument) -> Result<Document, DocumentRepositoryError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            r#"
    INSERT INTO documents (title, content, doc_size, file_path, author_id)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id, title, content, doc_size, status, meta, file_path, author_id,
        claim_token, claimed_until, failure_reason, created_at, updated_at
            "#,
        )
        .bind(&new_document.title)
        .bind(&new_document.content)
        .bind(new_document.doc_size)
        .bind(&new_document.file_path)
        .bind(new_document.author_id)
        .fetch_one(&self.pg_pool)
        .await?;

        record.try_into()
    }

    #[tracing::instrument(name = "Getting document from database", skip(self))]
    async fn get_by_id(&self, id: DocumentId) -> Result<Option<Document>, DocumentRepositoryError> {
        let record = sqlx::query_as::<_, DocumentRecord>(
            r#"
    SELECT id, title, content, doc_size, status, meta, file_path, author_id,
        claim_token, claimed_until, failure_reason, created_at, updated_at
    FROM documents
    WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pg_pool)
        .await?;

        record.map(Document::try_from).transpose()
    }

    #[tracing::instrument(name = "Listing documents from database", skip(self))]
    async fn list(
        &self,
        author_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Document>, DocumentRepositoryError> {
        let records = sqlx::query_as::<_, DocumentRecord>(
            r#"
    SELECT id, title, content, doc_size, status, meta, file_path, author_id,
        claim_token, claimed_until, failure_reason, created_at, updated_at
    FROM documents
    WHERE $1::BIGINT IS NULL OR author_id = $1
    ORDER BY created_at DESC, id DESC
    LIMIT $2
            "#,
        )
        .bind(author_id)
        .bind(limit.max(0))
        .fetch_all(&self.pg_pool)
        .await?;

        records.into_iter().map(Document::try_from).collect()
    }

    #[tracing::instrument(name = "Claiming document for processing", skip(self))]
    async fn try_claim(
        &self,
        id: DocumentId,
        lease: Duration,
    ) -> Result<ClaimOutcome, DocumentRepositoryError> {
        let token = Uuid::new_v4();

        let record = sqlx::query_as::<_, DocumentRecord>(
            r#"
    UPDATE documents
    SET status = 'processing',
        claim_token = $2,
        claimed_until = now() + make_interval(secs => $3),
        updated_at = now()
    WHERE id = $1
        AND (status = 'draft'
            OR (status = 'processing' AND (claimed_until IS NULL OR claimed_until <= now())))
    RETURNING id, title, content, doc_size, status, meta, file_path, author_id,
        claim_token, claimed_until, failure_reason, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(token)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pg_pool)
        .await?;

        if let Some(record) = record {
            let document = Document::try_from(record)?;
            let expires_at = document
                .processing_lease
                .as_ref()
                .map(|lease| lease.expires_at)
                .ok_or_else(|| {
                    DocumentRepositoryError::InvalidRow(id, "claim without lease".to_string())
                })?;

            return Ok(ClaimOutcome::Claimed(ProcessingClaim {
                token,
                expires_at,
                document,
            }));
        }

        Ok(match self.get_by_id(id).await? {
            None => ClaimOutcome::NotFound,
            Some(document) => document.unclaimable_outcome(),
        })
    }

    #[tracing::instrument(
        name = "Renewing document claim",
        skip(self, claim),
        fields(document_id = claim.document_id())
    )]
    async fn renew_claim(
        &self,
        claim: &ProcessingClaim,
        lease: Duration,
    ) -> Result<bool, DocumentRepositoryError> {
        let result = sqlx::query(
            r#"
    UPDATE documents
    SET claimed_until = now() + make_interval(secs => $3),
        updated_at = now()
    WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(claim.document_id())
        .bind(claim.token)
        .bind(lease.as_secs_f64())
        .execute(&self.pg_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(
        name = "Committing document enrichment",
        skip(self, claim, enrichment),
        fields(document_id = claim.document_id(), status = %enrichment.status)
    )]
    async fn commit_enrichment(
        &self,
        claim: &ProcessingClaim,
        enrichment: &DocumentEnrichment,
    ) -> Result<bool, DocumentRepositoryError> {
        if !enrichment.status.is_enrichment_result() {
            return Err(DocumentError::InvalidEnrichmentStatus(enrichment.status).into());
        }

        let result = sqlx::query(
            r#"
    UPDATE documents
    SET title = $3,
        content = $4,
        meta = $5,
        status = $6,
        claim_token = NULL,
        claimed_until = NULL,
        updated_at = now()
    WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(claim.document_id())
        .bind(claim.token)
        .bind(&enrichment.title)
        .bind(&enrichment.content)
        .bind(Json(&enrichment.meta))
        .bind(enrichment.status.as_str())
        .execute(&self.pg_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(name = "Marking document as failed", skip(self))]
    async fn mark_failed(
        &self,
        id: DocumentId,
        reason: &str,
    ) -> Result<bool, DocumentRepositoryError> {
        let result = sqlx::query(
            r#"
    UPDATE documents
    SET status = 'failed',
        failure_reason = $2,
        claim_token = NULL,
        claimed_until = NULL,
        updated_at = now()
    WHERE id = $1 AND status IN ('draft', 'processing', 'pre-processed')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pg_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
