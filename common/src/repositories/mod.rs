pub mod document_file_in_memory_repository;
pub mod document_file_s3_repository;
pub mod document_in_memory_repository;
pub mod document_postgres_repository;
pub mod message_in_memory_repository;
pub mod message_postgres_repository;
pub mod message_rabbitmq_repository;

/// Database schema of the documents and of the Postgres notification queue
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../migrations");
