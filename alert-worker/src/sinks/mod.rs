//! Concrete `AlertSink` implementations.
pub mod log;
pub mod webhook;

pub use self::log::LogSink;
pub use self::webhook::WebhookSink;
