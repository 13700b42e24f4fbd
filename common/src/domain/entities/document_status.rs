use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::helper::error_chain_fmt;

/// Lifecycle of a document
///
/// ```text
/// draft ──> processing ──> pre-processed ──> processed
///   │           │  ↺            │
///   └───────────┴───────────────┴──────────> failed
/// ```
///
/// `processing` is held by exactly one processing claim at a time. It can be taken over
/// (`processing -> processing`) once the claim lease has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    #[serde(rename = "draft")]
    Draft,
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "pre-processed")]
    PreProcessed,
    #[serde(rename = "processed")]
    Processed,
    #[serde(rename = "failed")]
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Processing => "processing",
            DocumentStatus::PreProcessed => "pre-processed",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    /// A document still moving through the pipeline, which can therefore still fail
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft | DocumentStatus::Processing | DocumentStatus::PreProcessed
        )
    }

    /// Statuses a processing step is allowed to commit
    pub fn is_enrichment_result(&self) -> bool {
        matches!(
            self,
            DocumentStatus::PreProcessed | DocumentStatus::Processed
        )
    }

    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;

        match (self, next) {
            (_, Failed) => self.is_in_flight(),
            (Draft, Processing) => true,
            (Processing, Processing | PreProcessed | Processed) => true,
            (PreProcessed, Processed) => true,
            _ => false,
        }
    }

    pub fn transition_to(
        &self,
        next: DocumentStatus,
    ) -> Result<DocumentStatus, DocumentStatusError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DocumentStatusError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = DocumentStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DocumentStatus::Draft),
            "processing" => Ok(DocumentStatus::Processing),
            "pre-processed" => Ok(DocumentStatus::PreProcessed),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(DocumentStatusError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error)]
pub enum DocumentStatusError {
    #[error("Unknown document status: {0}")]
    Unknown(String),
    #[error("A document cannot go from {from} to {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
}

impl std::fmt::Debug for DocumentStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
