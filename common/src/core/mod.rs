pub mod deliveries;
pub mod notification_queue_factory;
pub mod retry;
