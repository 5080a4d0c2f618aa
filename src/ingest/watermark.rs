//! Per source-partition watermark tracking.
//!
//! A watermark is the lower bound on event time below which no further
//! in-order events are expected: `max(event_ts seen) - allowed_lateness`.
//! It never moves backward. Events arriving below the watermark are tagged
//! late, processed anyway, and counted toward the lateness ratio.

use crate::ingest::types::SourceKind;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Watermark state for one source-partition.
#[derive(Debug, Clone)]
pub struct Watermark {
    /// Highest event timestamp observed so far
    max_event_ts: Option<DateTime<Utc>>,
    /// How far behind max_event_ts events are still considered on time
    allowed_lateness: Duration,
    /// Wall-clock instant of the last watermark advance
    last_progress_at: DateTime<Utc>,
}

impl Watermark {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            max_event_ts: None,
            allowed_lateness,
            last_progress_at: Utc::now(),
        }
    }

    /// Record an event timestamp. Returns true if the event is late, i.e.
    /// its timestamp falls below the watermark as it stood at arrival.
    pub fn observe(&mut self, event_ts: DateTime<Utc>, arrived_at: DateTime<Utc>) -> bool {
        let is_late = match self.current() {
            Some(mark) => event_ts < mark,
            None => false,
        };

        // Only a new maximum advances the watermark; it never regresses.
        if self.max_event_ts.map_or(true, |max| event_ts > max) {
            self.max_event_ts = Some(event_ts);
            self.last_progress_at = arrived_at;
        }

        is_late
    }

    /// Current watermark, if any event has been seen.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.max_event_ts.map(|max| max - self.allowed_lateness)
    }

    /// Highest event timestamp observed.
    pub fn frontier(&self) -> Option<DateTime<Utc>> {
        self.max_event_ts
    }

    /// Whether the partition has gone silent for longer than `timeout`.
    ///
    /// A partition that never produced an event is not stalled; it simply
    /// has not started.
    pub fn is_stalled(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.max_event_ts.is_some() && now - self.last_progress_at > timeout
    }
}

/// Identity of one watermark partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionId {
    pub source: SourceKind,
    pub key: String,
}

impl PartitionId {
    pub fn new(source: SourceKind, key: impl Into<String>) -> Self {
        Self {
            source,
            key: key.into(),
        }
    }
}

/// Watermark view passed to workers at tick time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionClock {
    /// Watermark (None until the partition has produced an event)
    pub watermark: Option<DateTime<Utc>>,
    /// Highest event timestamp observed
    pub frontier: Option<DateTime<Utc>>,
    /// Silent beyond the stall timeout
    pub stalled: bool,
}

/// Tracks watermarks for every source-partition the pipeline has seen.
///
/// Owned by the ingest side of the runtime; workers never touch it
/// directly, they receive [`PartitionClock`] values in their tick context.
pub struct WatermarkRegistry {
    lateness: HashMap<SourceKind, Duration>,
    stall_timeout: Duration,
    partitions: HashMap<PartitionId, Watermark>,
}

impl WatermarkRegistry {
    pub fn new(lateness: HashMap<SourceKind, Duration>, stall_timeout: Duration) -> Self {
        Self {
            lateness,
            stall_timeout,
            partitions: HashMap::new(),
        }
    }

    /// Record an event for its partition. Returns the lateness tag.
    pub fn observe(
        &mut self,
        source: SourceKind,
        key: &str,
        event_ts: DateTime<Utc>,
        arrived_at: DateTime<Utc>,
    ) -> bool {
        let bound = self
            .lateness
            .get(&source)
            .copied()
            .unwrap_or_else(Duration::zero);
        let mark = self
            .partitions
            .entry(PartitionId::new(source, key))
            .or_insert_with(|| Watermark::new(bound));
        mark.observe(event_ts, arrived_at)
    }

    /// Clock view for one partition.
    pub fn clock(&self, source: SourceKind, key: &str, now: DateTime<Utc>) -> PartitionClock {
        match self.partitions.get(&PartitionId::new(source, key)) {
            Some(mark) => PartitionClock {
                watermark: mark.current(),
                frontier: mark.frontier(),
                stalled: mark.is_stalled(now, self.stall_timeout),
            },
            None => PartitionClock::default(),
        }
    }

    /// Highest event timestamp across every partition, the pipeline's
    /// event-time "now" for replayed streams.
    pub fn global_frontier(&self) -> Option<DateTime<Utc>> {
        self.partitions.values().filter_map(|m| m.frontier()).max()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partitions silent beyond the stall timeout.
    pub fn stalled_partitions(&self, now: DateTime<Utc>) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|(_, mark)| mark.is_stalled(now, self.stall_timeout))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_watermark_monotonic() {
        let mut mark = Watermark::new(Duration::seconds(5));
        let sequence = [10, 3, 25, 7, 25, 40, 2, 41];

        let mut previous: Option<DateTime<Utc>> = None;
        for s in sequence {
            mark.observe(ts(s), ts(s));
            let current = mark.current().unwrap();
            if let Some(prev) = previous {
                assert!(current >= prev, "watermark regressed");
            }
            previous = Some(current);
        }
        // max = 41, lateness = 5
        assert_eq!(mark.current().unwrap(), ts(36));
    }

    #[test]
    fn test_late_tagging() {
        let mut mark = Watermark::new(Duration::seconds(5));
        assert!(!mark.observe(ts(0), ts(0)), "first event is never late");
        assert!(!mark.observe(ts(20), ts(20)));
        // Watermark is now 15; an event at 10 is below it.
        assert!(mark.observe(ts(10), ts(20)));
        // At exactly the watermark an event is still on time.
        assert!(!mark.observe(ts(15), ts(20)));
        // The late event must not have moved the watermark.
        assert_eq!(mark.current().unwrap(), ts(15));
    }

    #[test]
    fn test_stall_detection() {
        let mut mark = Watermark::new(Duration::seconds(5));
        assert!(!mark.is_stalled(ts(1000), Duration::seconds(60)), "unseen partition is not stalled");

        mark.observe(ts(0), ts(0));
        assert!(!mark.is_stalled(ts(30), Duration::seconds(60)));
        assert!(mark.is_stalled(ts(120), Duration::seconds(60)));
    }

    #[test]
    fn test_registry_scopes_partitions() {
        let mut lateness = HashMap::new();
        lateness.insert(SourceKind::Tracking, Duration::seconds(5));
        lateness.insert(SourceKind::Environment, Duration::seconds(10));
        let mut registry = WatermarkRegistry::new(lateness, Duration::seconds(60));

        registry.observe(SourceKind::Tracking, "STL_656427", ts(100), ts(100));
        registry.observe(SourceKind::Tracking, "STL_571945", ts(10), ts(100));
        registry.observe(SourceKind::Environment, "busch_iii", ts(90), ts(100));

        // One pitcher's clock does not leak into another's.
        let a = registry.clock(SourceKind::Tracking, "STL_656427", ts(100));
        let b = registry.clock(SourceKind::Tracking, "STL_571945", ts(100));
        assert_eq!(a.watermark.unwrap(), ts(95));
        assert_eq!(b.watermark.unwrap(), ts(5));

        let env = registry.clock(SourceKind::Environment, "busch_iii", ts(100));
        assert_eq!(env.watermark.unwrap(), ts(80));

        assert_eq!(registry.global_frontier().unwrap(), ts(100));
        assert_eq!(registry.partition_count(), 3);
    }
}
