use alert_common::event::Event;
use alert_common::sink::{AlertSink, SinkError};
use async_trait::async_trait;
use tracing::info;

/// Writes every event to the log.
#[derive(Default)]
pub struct LogSink {}

#[async_trait]
impl AlertSink for LogSink {
    async fn accept(&self, event: &Event) -> Result<(), SinkError> {
        info!(
            kind = %event.kind(),
            channel = event.channel(),
            occurred_at = %event.occurred_at(),
            time_substituted = event.is_time_substituted(),
            sequence = ?event.source_sequence(),
            description = ?event.event_description(),
            digest = %event.digest(),
            "alert event"
        );

        Ok(())
    }
}
