use std::{net::TcpListener, sync::Arc};

use actix_multipart::form::MultipartFormConfig;
use actix_web::{
    dev::Server,
    web::{self, Data},
    App, HttpServer,
};
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
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::{
    configuration::{IngestionSettings, Settings},
    routes::{get_document, health_check, list_documents, upload_document},
};

/// Holds the newly built server, and some useful properties
pub struct Application {
    server: Server,
    port: u16,
}

#[derive(thiserror::Error)]
pub enum ApplicationBuildError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    BlobStoreError(#[from] BlobStoreError),
    #[error(transparent)]
    QueueError(#[from] QueueError),
    #[error(transparent)]
    MigrateError(#[from] sqlx::migrate::MigrateError),
}

impl std::fmt::Debug for ApplicationBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl Application {
    /// # Parameters
    /// - nb_workers: number of actix-web workers
    ///   if `None`, the number of available physical CPUs is used as the worker count.
    #[tracing::instrument(name = "Building application", skip(settings))]
    pub async fn build(
        settings: Settings,
        nb_workers: Option<usize>,
    ) -> Result<Self, ApplicationBuildError> {
        let connection_pool = get_connection_pool(&settings.database);
        if settings.database.migrate_on_startup {
            info!("Running database migrations");
            MIGRATOR.run(&connection_pool).await?;
        }

        let blob_store = DocumentFileS3Repository::try_set_up(&settings.object_storage).await?;
        let document_repository = DocumentPostgresRepository::new(connection_pool.clone());
        let queue_factory = NotificationQueueFactory::try_from_settings(
            &settings.queue,
            &connection_pool,
            &settings.rabbitmq,
        )
        .await?;

        let address = format!(
            "{}:{}",
            settings.application.host, settings.application.port
        );
        let listener = TcpListener::bind(address)?;
        let port = listener.local_addr()?.port();

        let server = run(
            listener,
            nb_workers,
            Arc::new(blob_store),
            Arc::new(document_repository),
            queue_factory,
            settings.ingestion,
        )?;

        Ok(Self { server, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// This function only returns when the application is stopped
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        info!("Running server on port {} ...", self.port);
        self.server.await
    }
}

/// listener: the consumer binds their own port
///
/// TracingLogger middleware: generates a unique `request_id` for each incoming request.
///
/// # Parameters
/// - nb_workers: number of actix-web workers
///   if `None`, the number of available physical CPUs is used as the worker count.
pub fn run(
    listener: TcpListener,
    nb_workers: Option<usize>,
    blob_store: Arc<dyn BlobStore>,
    document_repository: Arc<dyn DocumentRepository>,
    queue_factory: NotificationQueueFactory,
    ingestion: IngestionSettings,
) -> Result<Server, std::io::Error> {
    // Shared among all actix-web workers
    let blob_store: Data<dyn BlobStore> = Data::from(blob_store);
    let document_repository: Data<dyn DocumentRepository> = Data::from(document_repository);
    let multipart_config = MultipartFormConfig::default()
        .total_limit(ingestion.max_upload_size_bytes)
        .memory_limit(ingestion.max_upload_size_bytes);
    let ingestion = Data::new(ingestion);

    let server = HttpServer::new(move || {
        info!("Starting actix-web worker");

        let queue_factory = queue_factory.clone();

        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .service(
                web::scope("/api/v1")
                    .route("/upload", web::post().to(upload_document))
                    .route("/docs", web::get().to(list_documents))
                    .route("/docs/{id}", web::get().to(get_document)),
            )
            .app_data(blob_store.clone())
            .app_data(document_repository.clone())
            .app_data(ingestion.clone())
            .app_data(multipart_config.clone())
            // Each actix-web worker publishes through its own queue handle (ex: its own RabbitMQ channel)
            .data_factory(move || {
                let queue_factory = queue_factory.clone();
                async move { queue_factory.build().await }
            })
    })
    .listen(listener)?;

    if let Some(nb_workers) = nb_workers {
        return Ok(server.workers(nb_workers).run());
    }

    Ok(server.run())
}

pub fn get_connection_pool(settings: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(2))
        .connect_lazy_with(settings.with_db())
}
