use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    domain::entities::{
        document::{
            ClaimOutcome, Document, DocumentEnrichment, DocumentError, DocumentId, DocumentMeta,
            NewDocument, ProcessingClaim,
        },
        document_status::DocumentStatus,
    },
    ports::document_repository::{DocumentRepository, DocumentRepositoryError},
};

/// Document repository kept in the memory of the current process
///
/// Every operation runs under one lock, which gives the same atomicity as the conditional
/// updates of the database repository.
#[derive(Default)]
pub struct DocumentInMemoryRepository {
    state: Mutex<DocumentsState>,
}

#[derive(Default)]
struct DocumentsState {
    last_id: DocumentId,
    documents: BTreeMap<DocumentId, Document>,
}

impl DocumentInMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a document as is, keeping its id
    pub fn upsert(&self, document: Document) {
        let mut state = self.lock_state();
        state.last_id = state.last_id.max(document.id);
        state.documents.insert(document.id, document);
    }

    /// A new `draft` document with the given id, as the ingestion service would have created it
    pub fn draft(id: DocumentId, file_path: &str, doc_size: i64) -> Document {
        let now = Utc::now();
        Document {
            id,
            title: String::new(),
            content: String::new(),
            doc_size,
            status: DocumentStatus::Draft,
            meta: DocumentMeta::new(),
            file_path: file_path.to_string(),
            author_id: None,
            failure_reason: None,
            processing_lease: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.lock_state().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DocumentsState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentRepository for DocumentInMemoryRepository {
    async fn insert(&self, new_document: NewDocument) -> Result<Document, DocumentRepositoryError> {
        let mut state = self.lock_state();
        state.last_id += 1;

        let mut document = Self::draft(state.last_id, &new_document.file_path, new_document.doc_size);
        document.author_id = new_document.author_id;
        document.title = new_document.title;
        document.content = new_document.content;

        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_by_id(&self, id: DocumentId) -> Result<Option<Document>, DocumentRepositoryError> {
        Ok(self.lock_state().documents.get(&id).cloned())
    }

    async fn list(
        &self,
        author_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Document>, DocumentRepositoryError> {
        let state = self.lock_state();
        let mut documents: Vec<Document> = state
            .documents
            .values()
            .filter(|document| author_id.is_none() || document.author_id == author_id)
            .cloned()
            .collect();

        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        documents.truncate(limit.max(0) as usize);

        Ok(documents)
    }

    async fn try_claim(
        &self,
        id: DocumentId,
        lease: Duration,
    ) -> Result<ClaimOutcome, DocumentRepositoryError> {
        let mut state = self.lock_state();
        let Some(document) = state.documents.get_mut(&id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let now = Utc::now();
        if !document.is_claimable_at(now) {
            return Ok(document.unclaimable_outcome());
        }

        Ok(ClaimOutcome::Claimed(document.claim(lease, now)?))
    }

    async fn renew_claim(
        &self,
        claim: &ProcessingClaim,
        lease: Duration,
    ) -> Result<bool, DocumentRepositoryError> {
        let mut state = self.lock_state();
        let Some(document) = state.documents.get_mut(&claim.document_id()) else {
            return Ok(false);
        };

        match document.renew_claim(claim, lease, Utc::now()) {
            Ok(_) => Ok(true),
            Err(DocumentError::ClaimLost(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn commit_enrichment(
        &self,
        claim: &ProcessingClaim,
        enrichment: &DocumentEnrichment,
    ) -> Result<bool, DocumentRepositoryError> {
        let mut state = self.lock_state();
        let Some(document) = state.documents.get_mut(&claim.document_id()) else {
            return Ok(false);
        };

        match document.apply_enrichment(claim, enrichment, Utc::now()) {
            Ok(()) => Ok(true),
            Err(DocumentError::ClaimLost(_)) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn mark_failed(
        &self,
        id: DocumentId,
        reason: &str,
    ) -> Result<bool, DocumentRepositoryError> {
        let mut state = self.lock_state();
        let Some(document) = state.documents.get_mut(&id) else {
            return Ok(false);
        };
        if !document.status.is_in_flight() {
            return Ok(false);
        }

        document.fail(reason, Utc::now())?;
        Ok(true)
    }
}
