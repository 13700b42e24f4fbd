use std::sync::Arc;
use std::time::Duration;

use common::{
    configuration::DatabaseSettings,
    core::notification_queue_factory::NotificationQueueFactory,
    helper::error_chain_fmt,
    ports::{
        blob_store::{BlobStore, BlobStoreError},
        document_repository::DocumentRepository,
        notification_queue::QueueError,
    },
    repositories::{
        document_file_s3_repository::DocumentFileS3Repository,
        document_postgres_repository::DocumentPostgresRepository, MIGRATOR,
    },
};
use futures::future::join_all;
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use crate::{
    configuration::Settings,
    handlers::handler_document_notification::{DocumentNotificationHandler, HandlerOptions},
};

/// Holds everything the worker tasks share
pub struct Application {
    queue_factory: NotificationQueueFactory,
    document_repository: Arc<dyn DocumentRepository>,
    blob_store: Arc<dyn BlobStore>,
    options: HandlerOptions,
    concurrency: usize,
}

impl Application {
    #[tracing::instrument(name = "Building worker application", skip(settings))]
    pub async fn build(settings: Settings) -> Result<Self, ApplicationError> {
        let pg_pool = get_pg_pool(&settings.database);
        if settings.database.migrate_on_startup {
            info!("Running database migrations");
            MIGRATOR.run(&pg_pool).await?;
        }

        let blob_store = DocumentFileS3Repository::try_set_up(&settings.object_storage).await?;
        let queue_factory =
            NotificationQueueFactory::try_from_settings(&settings.queue, &pg_pool, &settings.rabbitmq)
                .await?;

        Ok(Self::from_parts(
            queue_factory,
            Arc::new(DocumentPostgresRepository::new(pg_pool)),
            Arc::new(blob_store),
            HandlerOptions::from_settings(&settings),
            settings.worker.concurrency,
        ))
    }

    /// Assembles an application from already built adapters, ex: in-memory ones in tests
    pub fn from_parts(
        queue_factory: NotificationQueueFactory,
        document_repository: Arc<dyn DocumentRepository>,
        blob_store: Arc<dyn BlobStore>,
        options: HandlerOptions,
        concurrency: usize,
    ) -> Self {
        Self {
            queue_factory,
            document_repository,
            blob_store,
            options,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs `concurrency` worker tasks until `cancel_token` is cancelled
    ///
    /// Each task owns its queue handle. Returns once every task drained its deliveries.
    pub async fn run_until_stopped(
        self,
        cancel_token: CancellationToken,
    ) -> Result<(), ApplicationError> {
        info!("📡 Running {} worker tasks until stopped", self.concurrency);

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(self.concurrency);
        for worker_id in 0..self.concurrency {
            let queue = match self.queue_factory.build().await {
                Ok(queue) => queue,
                Err(error) => {
                    cancel_token.cancel();
                    join_all(workers).await;
                    return Err(error.into());
                }
            };
            let handler = DocumentNotificationHandler::new(
                queue,
                self.document_repository.clone(),
                self.blob_store.clone(),
                self.options.clone(),
            );
            let cancel_token = cancel_token.clone();

            workers.push(tokio::spawn(
                async move { handler.run_until_cancelled(cancel_token).await }
                    .instrument(info_span!("Worker task", worker_id)),
            ));
        }

        let mut result = Ok(());
        for joined in join_all(workers).await {
            if let Err(error) = joined {
                error!(?error, "A worker task panicked");
                result = Err(ApplicationError::WorkerPanicked(error));
            }
        }

        info!("👋 Bye!");
        result
    }
}

/// Cancels `cancel_token` on Ctrl-C or, on unix, SIGTERM
pub async fn cancel_on_shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(?error, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received, draining"),
        _ = terminate => info!("SIGTERM received, draining"),
    }
    cancel_token.cancel();
}

pub fn get_pg_pool(settings: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy_with(settings.with_db())
}

#[derive(thiserror::Error)]
pub enum ApplicationError {
    #[error(transparent)]
    BlobStoreError(#[from] BlobStoreError),
    #[error(transparent)]
    QueueError(#[from] QueueError),
    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),
    #[error("A worker task panicked: {0}")]
    WorkerPanicked(#[source] tokio::task::JoinError),
}

impl std::fmt::Debug for ApplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
