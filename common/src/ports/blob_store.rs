use async_trait::async_trait;

use crate::{
    domain::entities::blob_locator::{BlobLocator, BlobLocatorError},
    helper::error_chain_fmt,
};

/// Stores the raw bytes of uploaded documents
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobLocator, BlobStoreError>;

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, BlobStoreError>;
}

#[derive(thiserror::Error)]
pub enum BlobStoreError {
    #[error("The object could not be found in the bucket: {0}")]
    ObjectNotFound(String),
    #[error("Locator {0} does not belong to this blob store")]
    ForeignLocator(String),
    #[error(transparent)]
    LocatorError(#[from] BlobLocatorError),
    #[error("The object store answered with status {0}: {1}")]
    UnexpectedStatus(u16, String),
    #[error("S3 credentials error: {0}")]
    S3CredentialsError(#[from] s3::creds::error::CredentialsError),
    #[error(transparent)]
    S3Error(#[from] s3::error::S3Error),
}

impl BlobStoreError {
    /// Retrying will not make the object appear
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BlobStoreError::ObjectNotFound(_)
                | BlobStoreError::ForeignLocator(_)
                | BlobStoreError::LocatorError(_)
        )
    }
}

impl std::fmt::Debug for BlobStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
