pub mod blob_locator;
pub mod document;
pub mod document_status;
