use std::sync::Arc;
use std::time::Duration;

use alert_common::dedup::{Admission, Deduplicator};
use alert_common::event::Event;
use alert_common::metrics::{
    BYTES_RECEIVED, DISPATCH_DROPPED, EVENTS_ADMITTED, EVENTS_SUPPRESSED, FRAMES_RECEIVED,
    FRAMES_TOO_LARGE, INACTIVE_EVENTS, PARSE_FAILURES,
};
use alert_common::multipart::{Frame, FrameSplitter, SplitError};
use alert_common::parser::{self, ParseFailure};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{StallFailure, TransportError};
use crate::health::HealthHandle;
use crate::reader::{ByteStreamReader, ReadOutcome};

/// Why a connection's pipeline stopped.
#[derive(Debug)]
pub enum StreamEnd {
    /// The device closed the response.
    Ended,
    Stalled(StallFailure),
    Failed(TransportError),
    Cancelled,
}

/// Turns admitted frames into queued events. Lives for one connection, the `Deduplicator` it is
/// given outlives it.
pub struct EventStage {
    events: mpsc::Sender<Arc<Event>>,
    forward_inactive: bool,
}

impl EventStage {
    pub fn new(events: mpsc::Sender<Arc<Event>>, forward_inactive: bool) -> Self {
        Self {
            events,
            forward_inactive,
        }
    }

    pub fn handle_frame(&self, frame: Frame, dedup: &mut Deduplicator) {
        let event = match parser::parse(&frame, Utc::now()) {
            Ok(event) => event,
            Err(failure) => {
                warn!(error = %failure, "dropping unparseable frame");
                let labels = [("reason", parse_failure_label(&failure))];
                metrics::counter!(PARSE_FAILURES, &labels).increment(1);
                return;
            }
        };

        let labels = [("kind", event.kind().as_label())];

        if !event.is_active() && !self.forward_inactive {
            debug!(kind = %event.kind(), channel = event.channel(), "ignoring inactive event");
            metrics::counter!(INACTIVE_EVENTS, &labels).increment(1);
            return;
        }

        match dedup.admit(&event, Instant::now().into_std()) {
            Admission::Suppressed => {
                debug!(kind = %event.kind(), channel = event.channel(), "suppressed duplicate event");
                metrics::counter!(EVENTS_SUPPRESSED, &labels).increment(1);
            }
            Admission::Admitted => {
                info!(
                    kind = %event.kind(),
                    channel = event.channel(),
                    occurred_at = %event.occurred_at(),
                    "admitted event"
                );
                metrics::counter!(EVENTS_ADMITTED, &labels).increment(1);

                if let Err(error) = self.events.try_send(Arc::new(event)) {
                    let reason = match error {
                        mpsc::error::TrySendError::Full(_) => "full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    };
                    warn!(reason, "dispatch queue unavailable, dropping event");
                    metrics::counter!(DISPATCH_DROPPED, &[("reason", reason)]).increment(1);
                }
            }
        }
    }
}

fn parse_failure_label(failure: &ParseFailure) -> &'static str {
    match failure {
        ParseFailure::Empty => "empty",
        ParseFailure::NotUtf8 => "not_utf8",
        ParseFailure::Malformed(_) => "malformed",
    }
}

/// The sequential ingestion flow of one connection: reader, splitter, parser, deduplicator.
///
/// A pipeline is built for every connection attempt and dropped with it, taking the reader and
/// splitter along.
pub struct Pipeline {
    reader: ByteStreamReader,
    splitter: FrameSplitter,
    stage: EventStage,
    first_chunk_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
}

impl Pipeline {
    pub fn new(reader: ByteStreamReader, splitter: FrameSplitter, stage: EventStage) -> Self {
        Self {
            reader,
            splitter,
            stage,
            first_chunk_at: None,
            last_chunk_at: None,
        }
    }

    /// Time between the first and the latest chunk received. Zero until data arrives, so a
    /// connection that only ever stalls never counts as healthy.
    pub fn streamed_for(&self) -> Duration {
        match (self.first_chunk_at, self.last_chunk_at) {
            (Some(first), Some(last)) => last.saturating_duration_since(first),
            _ => Duration::ZERO,
        }
    }

    /// Read until the connection ends, handing events over as they complete.
    pub async fn run(&mut self, dedup: &mut Deduplicator, liveness: &HealthHandle) -> StreamEnd {
        loop {
            match self.reader.read_chunk().await {
                ReadOutcome::Chunk(chunk) => {
                    let now = Instant::now();
                    if self.first_chunk_at.is_none() {
                        self.first_chunk_at = Some(now);
                    }
                    self.last_chunk_at = Some(now);
                    liveness.report_healthy();
                    metrics::counter!(BYTES_RECEIVED).increment(chunk.len() as u64);

                    self.splitter.feed(&chunk);
                    for next in self.splitter.by_ref() {
                        match next {
                            Ok(frame) => {
                                metrics::counter!(FRAMES_RECEIVED).increment(1);
                                self.stage.handle_frame(frame, dedup);
                            }
                            Err(SplitError::FrameTooLarge { limit }) => {
                                warn!(limit, "dropping oversized frame");
                                metrics::counter!(FRAMES_TOO_LARGE).increment(1);
                            }
                        }
                    }
                }
                ReadOutcome::EndOfStream => return StreamEnd::Ended,
                ReadOutcome::Stalled => {
                    return StreamEnd::Stalled(StallFailure(self.reader.idle_timeout()))
                }
                ReadOutcome::Failed(error) => return StreamEnd::Failed(error),
                ReadOutcome::Cancelled => return StreamEnd::Cancelled,
            }
        }
    }
}
