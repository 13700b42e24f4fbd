use crate::helper::error_chain_fmt;

/// Where the bytes of a document live: `scheme://bucket/key`
///
/// Opaque to the pipeline beyond being handed back to the blob store it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocator {
    scheme: String,
    bucket: String,
    key: String,
}

impl BlobLocator {
    pub fn new(scheme: &str, bucket: &str, key: &str) -> Result<Self, BlobLocatorError> {
        let locator = Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
        };
        if locator.scheme.is_empty() || locator.bucket.is_empty() || locator.key.is_empty() {
            return Err(BlobLocatorError::InvalidFormat(locator.to_string()));
        }
        Ok(locator)
    }

    pub fn parse(s: &str) -> Result<Self, BlobLocatorError> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| BlobLocatorError::InvalidFormat(s.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| BlobLocatorError::InvalidFormat(s.to_string()))?;

        Self::new(scheme, bucket, key).map_err(|_| BlobLocatorError::InvalidFormat(s.to_string()))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

#[derive(thiserror::Error)]
pub enum BlobLocatorError {
    #[error("{0} is not a valid blob locator, expected scheme://bucket/key")]
    InvalidFormat(String),
}

impl std::fmt::Debug for BlobLocatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
