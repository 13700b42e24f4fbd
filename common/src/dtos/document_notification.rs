use serde::{Deserialize, Serialize};

use crate::{domain::entities::document::DocumentId, helper::error_chain_fmt};

/// Message body telling the processing workers that a document needs processing
///
/// On the wire: `{"doc_id": <integer>}`. Unknown fields are ignored when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentNotificationDto {
    pub doc_id: DocumentId,
}

impl DocumentNotificationDto {
    pub fn new(doc_id: DocumentId) -> Self {
        Self { doc_id }
    }

    pub fn try_parsing(data: &[u8]) -> Result<Self, DocumentNotificationDtoError> {
        let data = std::str::from_utf8(data)?;
        serde_json::from_str(data)
            .map_err(|e| DocumentNotificationDtoError::InvalidJsonData(e, data.to_string()))
    }

    pub fn try_serializing(&self) -> Result<String, DocumentNotificationDtoError> {
        serde_json::to_string(self).map_err(DocumentNotificationDtoError::SerializingError)
    }
}

#[derive(thiserror::Error)]
pub enum DocumentNotificationDtoError {
    #[error("Data could not be converted from utf8 u8 vector to string")]
    InvalidStringData(#[from] std::str::Utf8Error),
    #[error("Data did not represent a valid document notification: {0}. Data: {1}")]
    InvalidJsonData(serde_json::Error, String),
    #[error("Document notification could not be serialized: {0}")]
    SerializingError(serde_json::Error),
}

impl std::fmt::Debug for DocumentNotificationDtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
