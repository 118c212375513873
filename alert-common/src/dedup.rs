use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::event::{Event, EventKind, PayloadDigest};

/// Default quiet window during which identical events are suppressed.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_secs(5);

/// Result of offering an event to the `Deduplicator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    /// Source sequence id, only comparable within one connection.
    Sequence(u64),
    Digest(PayloadDigest),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct IdentityKey {
    kind: EventKind,
    channel: u32,
    identity: Identity,
}

/// Debounces bursts of identical alerts.
///
/// Devices re-post the same alarm several times per second while it is active. An event is
/// suppressed when an event with the same identity was admitted less than `quiet_window` ago;
/// suppressed events do not extend the window.
///
/// The identity is the source sequence id when the device provides one and it has not gone
/// backwards since the last reconnect, and the payload digest otherwise. Sequence ids restart with
/// the connection, so `reset_sequences` must be called on every reconnect. Digest identities are
/// kept, since a burst can span a short reconnect.
///
/// Only the ingestion path owns a `Deduplicator`, so nothing here is synchronized.
#[derive(Debug)]
pub struct Deduplicator {
    quiet_window: Duration,
    max_entries: usize,
    entries: HashMap<IdentityKey, Instant>,
    sequence_high_water: Option<u64>,
}

impl Deduplicator {
    pub fn new(quiet_window: Duration, max_entries: usize) -> Self {
        Self {
            quiet_window,
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            sequence_high_water: None,
        }
    }

    /// Decide whether `event`, seen at `now`, should be dispatched.
    pub fn admit(&mut self, event: &Event, now: Instant) -> Admission {
        self.evict_expired(now);

        let key = self.identity_key(event);
        if let Some(admitted_at) = self.entries.get(&key) {
            if now.saturating_duration_since(*admitted_at) < self.quiet_window {
                return Admission::Suppressed;
            }
        }

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(key, now);

        Admission::Admitted
    }

    /// Forget everything keyed on sequence ids. Call when a new connection starts.
    pub fn reset_sequences(&mut self) {
        self.entries
            .retain(|key, _| !matches!(key.identity, Identity::Sequence(_)));
        self.sequence_high_water = None;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn identity_key(&mut self, event: &Event) -> IdentityKey {
        let identity = match event.source_sequence() {
            Some(sequence) if self.sequence_high_water.map_or(true, |high| sequence >= high) => {
                self.sequence_high_water = Some(sequence);
                Identity::Sequence(sequence)
            }
            _ => Identity::Digest(*event.digest()),
        };

        IdentityKey {
            kind: event.kind().clone(),
            channel: event.channel(),
            identity,
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        let horizon = self.quiet_window + self.quiet_window / 2;
        self.entries
            .retain(|_, admitted_at| now.saturating_duration_since(*admitted_at) <= horizon);
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, admitted_at)| **admitted_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_WINDOW, 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(kind: EventKind, channel: u32, digest: u8) -> Event {
        Event::new(kind, channel, Utc::now(), PayloadDigest([digest; 32]))
    }

    #[test]
    fn test_duplicate_within_window_is_suppressed() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let start = Instant::now();
        let ring = event(EventKind::DoorbellRing, 1, 1);

        assert_eq!(dedup.admit(&ring, start), Admission::Admitted);
        assert_eq!(
            dedup.admit(&ring, start + Duration::from_secs(1)),
            Admission::Suppressed
        );
    }

    #[test]
    fn test_duplicate_after_window_is_admitted() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let start = Instant::now();
        let ring = event(EventKind::DoorbellRing, 1, 1);

        assert_eq!(dedup.admit(&ring, start), Admission::Admitted);
        assert_eq!(
            dedup.admit(&ring, start + Duration::from_secs(6)),
            Admission::Admitted
        );
    }

    #[test]
    fn test_three_rings_within_two_seconds() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let start = Instant::now();
        let ring = event(EventKind::DoorbellRing, 1, 1);

        let outcomes: Vec<_> = [0, 900, 2000]
            .iter()
            .map(|ms| dedup.admit(&ring, start + Duration::from_millis(*ms)))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                Admission::Admitted,
                Admission::Suppressed,
                Admission::Suppressed
            ]
        );
    }

    #[test]
    fn test_suppression_does_not_extend_the_window() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let start = Instant::now();
        let motion = event(EventKind::Motion, 1, 1);

        assert_eq!(dedup.admit(&motion, start), Admission::Admitted);
        assert_eq!(
            dedup.admit(&motion, start + Duration::from_secs(4)),
            Admission::Suppressed
        );
        assert_eq!(
            dedup.admit(&motion, start + Duration::from_secs(5)),
            Admission::Admitted
        );
    }

    #[test]
    fn test_identity_includes_kind_and_channel() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        assert_eq!(
            dedup.admit(&event(EventKind::Motion, 1, 1), now),
            Admission::Admitted
        );
        assert_eq!(
            dedup.admit(&event(EventKind::Motion, 2, 1), now),
            Admission::Admitted
        );
        assert_eq!(
            dedup.admit(&event(EventKind::Tamper, 1, 1), now),
            Admission::Admitted
        );
        assert_eq!(
            dedup.admit(&event(EventKind::Motion, 1, 2), now),
            Admission::Admitted
        );
    }

    #[test]
    fn test_sequence_ids_take_precedence_over_digest() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let now = Instant::now();
        let first = event(EventKind::DoorbellRing, 1, 1).sequence(Some(10));
        let next_press = event(EventKind::DoorbellRing, 1, 1).sequence(Some(11));

        assert_eq!(dedup.admit(&first, now), Admission::Admitted);
        assert_eq!(dedup.admit(&first, now), Admission::Suppressed);
        // Same payload, new sequence id: a distinct press.
        assert_eq!(dedup.admit(&next_press, now), Admission::Admitted);
    }

    #[test]
    fn test_sequence_going_backwards_falls_back_to_digest() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let now = Instant::now();

        let by_digest = event(EventKind::Motion, 1, 7);
        assert_eq!(dedup.admit(&by_digest, now), Admission::Admitted);
        assert_eq!(
            dedup.admit(&event(EventKind::Motion, 1, 8).sequence(Some(50)), now),
            Admission::Admitted
        );

        let stale = event(EventKind::Motion, 1, 7).sequence(Some(3));
        assert_eq!(dedup.admit(&stale, now), Admission::Suppressed);
    }

    #[test]
    fn test_reset_sequences_keeps_digest_entries() {
        let mut dedup = Deduplicator::new(Duration::from_secs(5), 16);
        let now = Instant::now();
        let with_sequence = event(EventKind::DoorbellRing, 1, 1).sequence(Some(100));
        let without_sequence = event(EventKind::Motion, 1, 2);

        assert_eq!(dedup.admit(&with_sequence, now), Admission::Admitted);
        assert_eq!(dedup.admit(&without_sequence, now), Admission::Admitted);

        dedup.reset_sequences();

        assert_eq!(dedup.len(), 1);
        assert_eq!(dedup.admit(&with_sequence, now), Admission::Admitted);
        assert_eq!(dedup.admit(&without_sequence, now), Admission::Suppressed);

        // After a reset a lower sequence id is trusted again.
        let restarted = event(EventKind::DoorbellRing, 1, 1).sequence(Some(1));
        dedup.reset_sequences();
        assert_eq!(dedup.admit(&restarted, now), Admission::Admitted);
        assert_eq!(dedup.admit(&restarted, now), Admission::Suppressed);
    }

    #[test]
    fn test_old_entries_are_evicted_on_admit() {
        let mut dedup = Deduplicator::new(Duration::from_secs(2), 16);
        let start = Instant::now();

        for digest in 0..5 {
            dedup.admit(&event(EventKind::Motion, 1, digest), start);
        }
        assert_eq!(dedup.len(), 5);

        dedup.admit(
            &event(EventKind::Motion, 1, 99),
            start + Duration::from_secs(10),
        );
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_table_is_bounded() {
        let mut dedup = Deduplicator::new(Duration::from_secs(60), 3);
        let start = Instant::now();

        for digest in 0..10u8 {
            let now = start + Duration::from_millis(digest as u64);
            assert_eq!(
                dedup.admit(&event(EventKind::Motion, 1, digest), now),
                Admission::Admitted
            );
        }
        assert_eq!(dedup.len(), 3);

        // The newest entries survive.
        assert_eq!(
            dedup.admit(&event(EventKind::Motion, 1, 9), start),
            Admission::Suppressed
        );
    }
}
