use std::time::Duration;

use common::configuration::{
    DatabaseSettings, ObjectStorageSettings, QueueSettings, RabbitMQSettings,
};
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub object_storage: ObjectStorageSettings,
    pub queue: QueueSettings,
    pub rabbitmq: RabbitMQSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// Number of worker tasks, each one with its own queue handle
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub concurrency: usize,
    /// How long a delivery is hidden from other workers once its processing started,
    /// renewed by a heartbeat while the document is processed
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub processing_visibility_seconds: u64,
    /// Deliveries of a message above this count are dead-lettered
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_receive_count: u32,
    /// Lifetime of the processing claim on a document
    ///
    /// Should not exceed `processing_visibility_seconds`: a redelivery could otherwise find
    /// the claim of a crashed worker still alive.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub processing_lease_seconds: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub commit_retry_attempts: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub commit_retry_backoff_ms: u64,
}

impl WorkerSettings {
    pub fn processing_visibility(&self) -> Duration {
        Duration::from_secs(self.processing_visibility_seconds)
    }

    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_seconds)
    }

    pub fn commit_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.commit_retry_backoff_ms)
    }
}

/// Extracts the worker settings from configuration files and env variables
pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    common::configuration::get_configuration::<Settings>()
}
