pub mod document_notification;
