//! Duplicate suppression for push events.
//!
//! The server can publish the same logical change more than once (publisher
//! retries, several subscribers, a fast reconnect). Each event is reduced to
//! a fingerprint and remembered for a short retention window in a bounded
//! ledger.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::models::{ChangeEvent, EntityKind, EntityStatus};

/// Default retention for processed fingerprints.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);

/// Default ledger capacity. Oldest fingerprints are evicted past this.
pub const DEFAULT_CAPACITY: usize = 512;

/// Identity of one logical change.
///
/// `status` is part of the identity so a rapid activate/deactivate pair in
/// the same second is never collapsed into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    kind: EntityKind,
    entity_id: String,
    scope: String,
    status: EntityStatus,
    bucket: i64,
}

impl Fingerprint {
    /// The time bucket is the server's emit second when the payload has one,
    /// otherwise the local arrival second.
    pub fn of(event: &ChangeEvent, arrived_at: DateTime<Utc>) -> Self {
        let stamp = event.emitted_at().unwrap_or(arrived_at);
        Self {
            kind: event.kind(),
            entity_id: event.entity_id().to_string(),
            scope: event.scope_key(),
            status: event.new_status(),
            bucket: stamp.timestamp(),
        }
    }
}

/// Bounded ledger of recently processed event fingerprints.
#[derive(Debug)]
pub struct EventDeduplicator {
    retention: chrono::Duration,
    capacity: usize,
    seen: HashMap<Fingerprint, DateTime<Utc>>,
    order: VecDeque<(Fingerprint, DateTime<Utc>)>,
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_CAPACITY)
    }
}

impl EventDeduplicator {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn should_process(&mut self, event: &ChangeEvent) -> bool {
        self.should_process_at(event, Utc::now())
    }

    /// Returns `false` if `event` was already processed within the retention
    /// window. Otherwise records it and returns `true`.
    pub fn should_process_at(&mut self, event: &ChangeEvent, now: DateTime<Utc>) -> bool {
        self.prune(now);

        let fingerprint = Fingerprint::of(event, now);
        if self.seen.contains_key(&fingerprint) {
            trace!(event = event.name(), entity = event.entity_id(), "Duplicate event");
            return false;
        }

        self.seen.insert(fingerprint.clone(), now);
        self.order.push_back((fingerprint, now));

        while self.order.len() > self.capacity {
            if let Some((oldest, at)) = self.order.pop_front() {
                self.forget(&oldest, at);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    /// Drop fingerprints older than the retention window. Entries are in
    /// arrival order, so pruning stops at the first live one.
    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some((_, at)) = self.order.front() {
            if now - *at < self.retention {
                break;
            }
            if let Some((expired, at)) = self.order.pop_front() {
                self.forget(&expired, at);
            }
        }
    }

    fn forget(&mut self, fingerprint: &Fingerprint, at: DateTime<Utc>) {
        if self.seen.get(fingerprint) == Some(&at) {
            self.seen.remove(fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AGENCY_STATUS_CHANGED;
    use crate::models::PRODUCT_AVAILABILITY_CHANGED;
    use serde_json::json;

    fn availability(product: &str, agency: &str, status: &str) -> ChangeEvent {
        ChangeEvent::from_wire(
            PRODUCT_AVAILABILITY_CHANGED,
            &json!({"entityId": product, "scopeId": agency, "newStatus": status}),
        )
        .expect("decode")
    }

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(1_750_000_000 + secs, millis * 1_000_000).expect("valid timestamp")
    }

    #[test]
    fn test_duplicate_within_window_is_dropped() {
        let mut dedup = EventDeduplicator::default();
        let event = availability("p1", "a1", "inactive");

        assert!(dedup.should_process_at(&event, at(0, 100)));
        assert!(!dedup.should_process_at(&event, at(0, 900)));
    }

    #[test]
    fn test_status_is_part_of_identity() {
        let mut dedup = EventDeduplicator::default();

        assert!(dedup.should_process_at(&availability("p1", "a1", "active"), at(0, 0)));
        assert!(dedup.should_process_at(&availability("p1", "a1", "inactive"), at(0, 10)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_scope_and_entity_distinguish_events() {
        let mut dedup = EventDeduplicator::default();

        assert!(dedup.should_process_at(&availability("p1", "a1", "active"), at(0, 0)));
        assert!(dedup.should_process_at(&availability("p1", "a2", "active"), at(0, 0)));
        assert!(dedup.should_process_at(&availability("p2", "a1", "active"), at(0, 0)));
    }

    #[test]
    fn test_emit_time_buckets_across_arrival_seconds() {
        let mut dedup = EventDeduplicator::default();
        let event = ChangeEvent::from_wire(
            AGENCY_STATUS_CHANGED,
            &json!({"entityId": "a1", "newStatus": "active", "emittedAt": "2026-05-01T08:00:00.250Z"}),
        )
        .expect("decode");

        // Redelivered after a reconnect, two seconds later.
        assert!(dedup.should_process_at(&event, at(0, 0)));
        assert!(!dedup.should_process_at(&event, at(2, 0)));
    }

    #[test]
    fn test_entries_expire_after_retention() {
        let mut dedup = EventDeduplicator::new(Duration::from_secs(5), 64);
        let event = availability("p1", "a1", "active");

        assert!(dedup.should_process_at(&event, at(0, 0)));
        // A later arrival lands in a new bucket; the old entry is pruned.
        assert!(dedup.should_process_at(&event, at(6, 0)));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_capacity_bounds_memory() {
        let mut dedup = EventDeduplicator::new(Duration::from_secs(60), 3);
        for i in 0..10 {
            let event = availability(&format!("p{}", i), "a1", "active");
            assert!(dedup.should_process_at(&event, at(0, i)));
        }
        assert_eq!(dedup.len(), 3);

        // Evicted fingerprints are accepted again.
        assert!(dedup.should_process_at(&availability("p0", "a1", "active"), at(0, 20)));
        // Recent ones are still suppressed.
        assert!(!dedup.should_process_at(&availability("p9", "a1", "active"), at(0, 21)));
    }
}
