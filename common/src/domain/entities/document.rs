use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::document_status::{DocumentStatus, DocumentStatusError};
use crate::helper::error_chain_fmt;

pub type DocumentId = i64;

/// Annotations attached by processing steps, ordered by key
pub type DocumentMeta = BTreeMap<String, String>;

/// An uploaded document and its place in the processing pipeline
///
/// Created as a `draft` by the ingestion service, then only mutated by the processing
/// workers. `file_path` is the blob store locator of the uploaded bytes and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    /// Byte length of the stored blob
    pub doc_size: i64,
    pub status: DocumentStatus,
    pub meta: DocumentMeta,
    pub file_path: String,
    pub author_id: Option<i64>,
    pub failure_reason: Option<String>,
    /// Set while a worker holds the document in `processing`
    #[serde(skip)]
    pub processing_lease: Option<ProcessingLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingLease {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// What the ingestion path inserts; everything else is filled in by the repository
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewDocument {
    pub file_path: String,
    pub doc_size: i64,
    #[builder(default)]
    pub author_id: Option<i64>,
    #[builder(default, setter(into))]
    pub title: String,
    #[builder(default, setter(into))]
    pub content: String,
}

/// Result of a transform on a claimed document
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEnrichment {
    pub title: String,
    pub content: String,
    pub meta: DocumentMeta,
    pub status: DocumentStatus,
}

/// Proof that the holder moved a document into `processing`
///
/// Commits are only accepted while the `token` is still the one stored on the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingClaim {
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
    /// The document as it was right after the claim
    pub document: Document,
}

impl ProcessingClaim {
    pub fn document_id(&self) -> DocumentId {
        self.document.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(ProcessingClaim),
    /// Nothing left to do: the document is past processing (or failed)
    AlreadySettled(DocumentStatus),
    /// Another worker holds a live claim
    InProgressElsewhere { lease_expires_at: DateTime<Utc> },
    NotFound,
}

impl Document {
    /// Last segment of the blob key, which is the file name given at upload time
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit('/')
            .next()
            .unwrap_or(self.file_path.as_str())
    }

    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DocumentStatus::Draft => true,
            DocumentStatus::Processing => self
                .processing_lease
                .as_ref()
                .map_or(true, |lease| lease.expires_at <= now),
            _ => false,
        }
    }

    /// Describes why the document cannot be claimed right now
    pub fn unclaimable_outcome(&self) -> ClaimOutcome {
        match (&self.status, &self.processing_lease) {
            (DocumentStatus::Processing, Some(lease)) => ClaimOutcome::InProgressElsewhere {
                lease_expires_at: lease.expires_at,
            },
            (status, _) => ClaimOutcome::AlreadySettled(*status),
        }
    }

    /// Moves the document into `processing` under a fresh lease
    pub fn claim(
        &mut self,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<ProcessingClaim, DocumentError> {
        if !self.is_claimable_at(now) {
            return Err(DocumentError::NotClaimable(self.id, self.status));
        }
        self.status = self.status.transition_to(DocumentStatus::Processing)?;

        let lease = ProcessingLease {
            token: Uuid::new_v4(),
            expires_at: now + lease_to_chrono(lease),
        };
        self.processing_lease = Some(lease.clone());
        self.updated_at = now;

        Ok(ProcessingClaim {
            token: lease.token,
            expires_at: lease.expires_at,
            document: self.clone(),
        })
    }

    /// Writes the result of a transform, as long as `claim` still holds the document
    pub fn apply_enrichment(
        &mut self,
        claim: &ProcessingClaim,
        enrichment: &DocumentEnrichment,
        now: DateTime<Utc>,
    ) -> Result<(), DocumentError> {
        if !self.is_held_by(claim) {
            return Err(DocumentError::ClaimLost(self.id));
        }
        if !enrichment.status.is_enrichment_result() {
            return Err(DocumentError::InvalidEnrichmentStatus(enrichment.status));
        }
        self.status = self.status.transition_to(enrichment.status)?;
        self.title = enrichment.title.clone();
        self.content = enrichment.content.clone();
        self.meta = enrichment.meta.clone();
        self.processing_lease = None;
        self.updated_at = now;

        Ok(())
    }

    /// Extends the lease of `claim` to `lease` from `now`, as long as it still holds the document
    pub fn renew_claim(
        &mut self,
        claim: &ProcessingClaim,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, DocumentError> {
        if !self.is_held_by(claim) {
            return Err(DocumentError::ClaimLost(self.id));
        }
        let expires_at = now + lease_to_chrono(lease);
        self.processing_lease = Some(ProcessingLease {
            token: claim.token,
            expires_at,
        });
        self.updated_at = now;

        Ok(expires_at)
    }

    pub fn fail(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), DocumentError> {
        self.status = self.status.transition_to(DocumentStatus::Failed)?;
        self.failure_reason = Some(reason.to_string());
        self.processing_lease = None;
        self.updated_at = now;

        Ok(())
    }

    fn is_held_by(&self, claim: &ProcessingClaim) -> bool {
        self.status == DocumentStatus::Processing
            && self
                .processing_lease
                .as_ref()
                .is_some_and(|lease| lease.token == claim.token)
    }
}

pub fn lease_to_chrono(lease: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(lease.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(thiserror::Error)]
pub enum DocumentError {
    #[error("Document {0} cannot be claimed while {1}")]
    NotClaimable(DocumentId, DocumentStatus),
    #[error("The processing claim on document {0} is no longer held")]
    ClaimLost(DocumentId),
    #[error("A processing step cannot commit the status {0}")]
    InvalidEnrichmentStatus(DocumentStatus),
    #[error(transparent)]
    StatusError(#[from] DocumentStatusError),
}

impl std::fmt::Debug for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
