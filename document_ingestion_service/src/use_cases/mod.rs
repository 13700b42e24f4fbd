pub mod upload_document;
