use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;

/// Enumeration of the ways a sink can fail to take an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("event rejected by sink: {0}")]
    Rejected(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("sink did not answer within {0:?}")]
    Timeout(Duration),
    #[error("sink delivery task failed: {0}")]
    Crashed(String),
}

impl SinkError {
    /// Name of the failure, for metrics labels.
    pub fn as_label(&self) -> &'static str {
        match self {
            SinkError::Rejected(_) => "rejected",
            SinkError::Unavailable(_) => "unavailable",
            SinkError::Timeout(_) => "timeout",
            SinkError::Crashed(_) => "crashed",
        }
    }
}

/// A downstream consumer of normalized events.
///
/// Calls are bounded by the dispatcher's timeout and never retried by it; a sink that wants
/// retries must do them itself.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn accept(&self, event: &Event) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct SinkRegistration {
    id: String,
    sink: Arc<dyn AlertSink>,
}

impl SinkRegistration {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sink(&self) -> Arc<dyn AlertSink> {
        self.sink.clone()
    }
}

/// Collects sinks at startup. Registrations are only ever appended.
#[derive(Default)]
pub struct SinkRegistryBuilder {
    sinks: Vec<SinkRegistration>,
}

impl SinkRegistryBuilder {
    pub fn register<S: AlertSink + 'static>(mut self, id: &str, sink: S) -> Self {
        self.sinks.push(SinkRegistration {
            id: id.to_owned(),
            sink: Arc::new(sink),
        });
        self
    }

    pub fn register_shared(mut self, id: &str, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(SinkRegistration {
            id: id.to_owned(),
            sink,
        });
        self
    }

    pub fn build(self) -> SinkRegistry {
        SinkRegistry {
            sinks: self.sinks.into(),
        }
    }
}

/// The frozen set of sinks. Cheap to clone and read-only, so it is shared without locking.
#[derive(Clone)]
pub struct SinkRegistry {
    sinks: Arc<[SinkRegistration]>,
}

impl SinkRegistry {
    pub fn builder() -> SinkRegistryBuilder {
        SinkRegistryBuilder::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SinkRegistration> {
        self.sinks.iter()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
