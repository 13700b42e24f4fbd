mod get_documents;
mod health_check;
mod upload_document;

pub use get_documents::*;
pub use health_check::*;
pub use upload_document::*;
