pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod reader;
pub mod sinks;
pub mod supervisor;
