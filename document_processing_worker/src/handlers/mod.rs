pub mod handler_document_notification;
