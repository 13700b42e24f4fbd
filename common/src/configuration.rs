use std::time::Duration;

use lapin::ConnectionProperties;
use secrecy::{ExposeSecret, Secret};
use serde::{de::DeserializeOwned, Deserialize};
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::{
    postgres::{PgConnectOptions, PgSslMode},
    ConnectOptions,
};

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    // Determines if we demand the connection to be encrypted or not
    pub require_ssl: bool,
    /// Runs the embedded migrations from `migrations/` when the binary starts
    #[serde(default)]
    pub migrate_on_startup: bool,
}

impl DatabaseSettings {
    pub fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
    }

    pub fn with_db(&self) -> PgConnectOptions {
        // Lowers sqlx statement logs from INFO to TRACE
        self.without_db()
            .database(&self.database_name)
            .log_statements(tracing::log::LevelFilter::Trace)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ObjectStorageSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub region: String,
    /// A bucket for each environment
    pub bucket_name: String,
}

impl ObjectStorageSettings {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Which service carries the document notifications
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    #[serde(rename = "postgres")]
    Postgres,
    #[serde(rename = "rabbitmq")]
    RabbitMQ,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub backend: QueueBackend,
    pub queue_name: String,
    /// How long a received message stays hidden from other consumers
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub visibility_timeout_seconds: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub receive_batch_size: usize,
    /// Long-poll duration of a single receive call
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub receive_wait_seconds: u64,
}

impl QueueSettings {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_secs(self.receive_wait_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RabbitMQSettings {
    pub username: String,
    pub password: Secret<String>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
}

impl RabbitMQSettings {
    pub fn get_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/%2f",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port
        )
    }

    pub fn get_connection_properties(&self) -> ConnectionProperties {
        ConnectionProperties::default()
            // Uses tokio executor and reactor.
            // At the moment the reactor is only available for unix.
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio)
    }
}

/// Extracts settings from configuration files and env variables
///
/// `configuration/base.yaml` (relative to the current directory) holds the settings shared by
/// every environment, `configuration/<environment>.yaml` the specific ones.
/// The environment is set with `APP_ENVIRONMENT` and defaults to `local`.
///
/// Env variables prefixed with `APP_` override both files, with `__` as separator.
/// For ex: `APP_QUEUE__RECEIVE_BATCH_SIZE=20` sets `Settings.queue.receive_batch_size`
pub fn get_configuration<T: DeserializeOwned>() -> Result<T, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|error| {
        config::ConfigError::Message(format!(
            "Failed to determine the current directory: {}",
            error
        ))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    let environment_filename = format!("{}.yaml", environment.as_str());

    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<T>()
}

/// The possible runtime environment for our binaries.
#[derive(Debug, PartialEq, Eq)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}
