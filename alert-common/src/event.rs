use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Trigger kinds reported on the alert stream.
///
/// Firmware updates keep adding alert types, so anything this bridge has no mapping for lands in
/// `Unknown` with the raw `eventType` instead of failing the frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DoorbellRing,
    Motion,
    Tamper,
    LineDetection,
    Unknown(String),
}

impl EventKind {
    /// Map a raw ISAPI `eventType` to a kind. Matching is case-insensitive.
    pub fn from_event_type(raw: &str) -> Self {
        let raw = raw.trim();

        match raw.to_ascii_lowercase().as_ref() {
            "doorbell" | "doorbellring" | "ringing" | "callring" => EventKind::DoorbellRing,
            "vmd" | "motion" | "motiondetection" | "pir" => EventKind::Motion,
            "tamperdetection" | "shelteralarm" | "tamper" => EventKind::Tamper,
            "linedetection" | "linecrossing" => EventKind::LineDetection,
            _ => EventKind::Unknown(raw.to_owned()),
        }
    }

    /// Low cardinality name, safe to use as a metrics label.
    pub fn as_label(&self) -> &'static str {
        match self {
            EventKind::DoorbellRing => "doorbell_ring",
            EventKind::Motion => "motion",
            EventKind::Tamper => "tamper",
            EventKind::LineDetection => "line_detection",
            EventKind::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventKind::Unknown(raw) if !raw.is_empty() => write!(f, "unknown({})", raw),
            kind => write!(f, "{}", kind.as_label()),
        }
    }
}

/// SHA-256 over the canonical form of a frame's payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PayloadDigest(pub [u8; 32]);

impl fmt::Display for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PayloadDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PayloadDigest({})", self)
    }
}

impl Serialize for PayloadDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A normalized alert from the device.
///
/// Events have no mutating methods: once the parser hands one over it is shared as-is with the
/// deduplicator and every sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    kind: EventKind,
    channel: u32,
    occurred_at: DateTime<Utc>,
    /// Set when the device omitted a usable timestamp and receipt time was used instead.
    time_substituted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    digest: PayloadDigest,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

impl Event {
    pub fn new(
        kind: EventKind,
        channel: u32,
        occurred_at: DateTime<Utc>,
        digest: PayloadDigest,
    ) -> Self {
        Self {
            kind,
            channel,
            occurred_at,
            time_substituted: false,
            sequence: None,
            digest,
            active: true,
            description: None,
        }
    }

    pub fn time_substituted(mut self, substituted: bool) -> Self {
        self.time_substituted = substituted;
        self
    }

    pub fn sequence(mut self, sequence: Option<u64>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn is_time_substituted(&self) -> bool {
        self.time_substituted
    }

    pub fn source_sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn digest(&self) -> &PayloadDigest {
        &self.digest
    }

    /// `false` for frames whose `eventState` is `inactive`, which the device also uses as a
    /// keep-alive.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn event_description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_event_type() {
        assert_eq!(EventKind::from_event_type("VMD"), EventKind::Motion);
        assert_eq!(
            EventKind::from_event_type(" doorbellRing "),
            EventKind::DoorbellRing
        );
        assert_eq!(EventKind::from_event_type("shelteralarm"), EventKind::Tamper);
        assert_eq!(
            EventKind::from_event_type("linedetection"),
            EventKind::LineDetection
        );
        assert_eq!(
            EventKind::from_event_type("fielddetection"),
            EventKind::Unknown("fielddetection".to_owned())
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(EventKind::DoorbellRing.to_string(), "doorbell_ring");
        assert_eq!(
            EventKind::Unknown("videoloss".to_owned()).to_string(),
            "unknown(videoloss)"
        );
        assert_eq!(EventKind::Unknown(String::new()).to_string(), "unknown");
    }

    #[test]
    fn test_event_serializes_for_sinks() {
        let occurred_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = Event::new(
            EventKind::DoorbellRing,
            1,
            occurred_at,
            PayloadDigest([0xab; 32]),
        )
        .sequence(Some(7));

        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["kind"], "doorbell_ring");
        assert_eq!(value["channel"], 1);
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["active"], true);
        assert_eq!(value["digest"], "ab".repeat(32));
        assert!(value.get("description").is_none());
    }
}
