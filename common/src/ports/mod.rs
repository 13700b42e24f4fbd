pub mod blob_store;
pub mod document_repository;
pub mod notification_queue;
