use std::sync::Arc;

use lapin::Connection as RabbitMQConnection;
use sqlx::PgPool;
use tracing::info;

use crate::{
    configuration::{QueueBackend, QueueSettings, RabbitMQSettings},
    ports::notification_queue::{NotificationQueue, QueueError},
    repositories::{
        message_in_memory_repository::MessageInMemoryRepository,
        message_postgres_repository::MessagePostgresRepository,
        message_rabbitmq_repository::MessageRabbitMQRepository,
    },
};

/// Builds notification queue handles, one for each task consuming or publishing
///
/// Cheap to clone: only the shared connection (or pool) is cloned.
#[derive(Clone)]
pub enum NotificationQueueFactory {
    Postgres {
        pg_pool: PgPool,
        settings: QueueSettings,
    },
    RabbitMQ {
        /// RabbitMQ connection shared between tasks, each task opening its own channel
        connection: Arc<RabbitMQConnection>,
        settings: QueueSettings,
    },
    /// Every handle is the same process-local queue
    InMemory(Arc<MessageInMemoryRepository>),
}

impl NotificationQueueFactory {
    /// Connects to the configured queue back-end
    #[tracing::instrument(name = "Connecting to the notification queue", skip(pg_pool, rabbitmq))]
    pub async fn try_from_settings(
        settings: &QueueSettings,
        pg_pool: &PgPool,
        rabbitmq: &RabbitMQSettings,
    ) -> Result<Self, QueueError> {
        let factory = match settings.backend {
            QueueBackend::Postgres => Self::Postgres {
                pg_pool: pg_pool.clone(),
                settings: settings.clone(),
            },
            QueueBackend::RabbitMQ => {
                // TODO: reconnect when the connection drops, consumers currently stop with `Closed`
                let connection = RabbitMQConnection::connect(
                    &rabbitmq.get_uri(),
                    rabbitmq.get_connection_properties(),
                )
                .await?;

                Self::RabbitMQ {
                    connection: Arc::new(connection),
                    settings: settings.clone(),
                }
            }
        };

        info!("📬 Notification queue {} ready", settings.queue_name);
        Ok(factory)
    }

    pub fn in_memory(queue: Arc<MessageInMemoryRepository>) -> Self {
        Self::InMemory(queue)
    }

    pub async fn build(&self) -> Result<Arc<dyn NotificationQueue>, QueueError> {
        let queue: Arc<dyn NotificationQueue> = match self {
            Self::Postgres { pg_pool, settings } => Arc::new(MessagePostgresRepository::new(
                pg_pool.clone(),
                &settings.queue_name,
                settings.visibility_timeout(),
            )),
            Self::RabbitMQ {
                connection,
                settings,
            } => Arc::new(
                MessageRabbitMQRepository::try_new(
                    connection,
                    &settings.queue_name,
                    settings.visibility_timeout(),
                    prefetch_count(settings.receive_batch_size),
                )
                .await?,
            ),
            Self::InMemory(queue) => queue.clone(),
        };

        Ok(queue)
    }
}

fn prefetch_count(receive_batch_size: usize) -> u16 {
    receive_batch_size.clamp(1, u16::MAX as usize) as u16
}
