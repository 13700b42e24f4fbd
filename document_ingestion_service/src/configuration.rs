use std::time::Duration;

use common::configuration::{
    DatabaseSettings, ObjectStorageSettings, QueueSettings, RabbitMQSettings,
};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub object_storage: ObjectStorageSettings,
    pub queue: QueueSettings,
    pub rabbitmq: RabbitMQSettings,
    pub ingestion: IngestionSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionSettings {
    /// Upper bound of a whole multipart upload request
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_upload_size_bytes: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub enqueue_retry_attempts: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub enqueue_retry_backoff_ms: u64,
}

impl IngestionSettings {
    pub fn enqueue_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.enqueue_retry_backoff_ms)
    }
}

/// Extracts the service settings from configuration files and env variables
pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    common::configuration::get_configuration::<Settings>()
}
