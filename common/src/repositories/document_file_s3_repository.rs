use async_trait::async_trait;
use s3::{creds::Credentials, error::S3Error, Bucket, BucketConfiguration, Region};
use secrecy::ExposeSecret;
use tracing::info;

use crate::{
    configuration::ObjectStorageSettings,
    domain::entities::blob_locator::BlobLocator,
    ports::blob_store::{BlobStore, BlobStoreError},
};

pub const S3_SCHEME: &str = "s3";

/// Simple Storage Service (S3) client storing the uploaded document files
pub struct DocumentFileS3Repository {
    bucket: Bucket,
}

impl DocumentFileS3Repository {
    pub fn new(bucket: Bucket) -> Self {
        Self { bucket }
    }

    /// Connects to the bucket of the environment, creating it if it does not exist yet
    #[tracing::instrument(name = "Setting up S3 object store")]
    pub async fn try_set_up(settings: &ObjectStorageSettings) -> Result<Self, BlobStoreError> {
        let region = Region::Custom {
            region: settings.region.to_owned(),
            endpoint: settings.endpoint(),
        };

        let credentials = Credentials::new(
            Some(&settings.username),
            Some(settings.password.expose_secret()),
            None,
            None,
            None,
        )?;

        let bucket = Bucket::new(&settings.bucket_name, region.clone(), credentials.clone())?
            .with_path_style();

        if let Err(error) = bucket.head_object("/").await {
            // Only a missing bucket (404) is expected here
            match error {
                S3Error::Http(404, _) => {}
                error => return Err(BlobStoreError::S3Error(error)),
            }

            info!("🪣 Unknown bucket {}, creating it ...", settings.bucket_name);

            Bucket::create_with_path_style(
                &settings.bucket_name,
                region,
                credentials,
                BucketConfiguration::default(),
            )
            .await?;
        }

        info!(
            "🪣 Bucket {} has been correctly instantiated",
            settings.bucket_name
        );
        Ok(Self::new(bucket))
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    fn locator_for(&self, key: &str) -> Result<BlobLocator, BlobStoreError> {
        Ok(BlobLocator::new(S3_SCHEME, &self.bucket.name, key)?)
    }
}

#[async_trait]
impl BlobStore for DocumentFileS3Repository {
    #[tracing::instrument(name = "Putting file in bucket", skip(self, bytes), fields(byte_size = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<BlobLocator, BlobStoreError> {
        let locator = self.locator_for(key)?;

        let response = self.bucket.put_object(locator.key(), bytes).await?;
        let status_code = response.status_code();
        if !(200..300).contains(&status_code) {
            return Err(BlobStoreError::UnexpectedStatus(
                status_code,
                String::from_utf8_lossy(response.bytes()).to_string(),
            ));
        }

        Ok(locator)
    }

    #[tracing::instrument(name = "Getting file from bucket", skip(self))]
    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, BlobStoreError> {
        if locator.scheme() != S3_SCHEME || locator.bucket() != self.bucket.name {
            return Err(BlobStoreError::ForeignLocator(locator.to_string()));
        }

        let response = match self.bucket.get_object(locator.key()).await {
            Ok(response) => response,
            Err(S3Error::Http(404, _)) => {
                return Err(BlobStoreError::ObjectNotFound(locator.to_string()))
            }
            Err(error) => return Err(error.into()),
        };

        match response.status_code() {
            200..=299 => Ok(response.to_vec()),
            404 => Err(BlobStoreError::ObjectNotFound(locator.to_string())),
            status_code => Err(BlobStoreError::UnexpectedStatus(
                status_code,
                String::from_utf8_lossy(response.bytes()).to_string(),
            )),
        }
    }
}
