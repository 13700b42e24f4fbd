use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    domain::entities::blob_locator::BlobLocator,
    ports::blob_store::{BlobStore, BlobStoreError},
};

pub const MEMORY_SCHEME: &str = "memory";

/// Blob store kept in the memory of the current process
pub struct DocumentFileInMemoryRepository {
    bucket_name: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl Default for DocumentFileInMemoryRepository {
    fn default() -> Self {
        Self::new("documents")
    }
}

impl DocumentFileInMemoryRepository {
    pub fn new(bucket_name: &str) -> Self {
        Self {
            bucket_name: bucket_name.to_string(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn locator_for(&self, key: &str) -> Result<BlobLocator, BlobStoreError> {
        Ok(BlobLocator::new(MEMORY_SCHEME, &self.bucket_name, key)?)
    }

    pub fn len(&self) -> usize {
        self.lock_objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for DocumentFileInMemoryRepository {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobLocator, BlobStoreError> {
        let locator = self.locator_for(key)?;
        self.lock_objects()
            .insert(locator.key().to_string(), bytes.to_vec());

        Ok(locator)
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, BlobStoreError> {
        if locator.scheme() != MEMORY_SCHEME || locator.bucket() != self.bucket_name {
            return Err(BlobStoreError::ForeignLocator(locator.to_string()));
        }

        self.lock_objects()
            .get(locator.key())
            .cloned()
            .ok_or_else(|| BlobStoreError::ObjectNotFound(locator.to_string()))
    }
}
