pub mod health_handlers;
pub mod report_handlers;
pub mod webhook_handlers;
