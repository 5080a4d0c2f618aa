//! Rolling windows with incremental aggregates.
//!
//! Each window keeps a bounded ring of (timestamp, value) slots, Welford
//! accumulators for mean/variance, and monotonic deques for min/max, so
//! updates and evictions are O(1) amortized with no rescans. Count bounds
//! keep the last k events; time bounds keep everything within a span of
//! the newest event timestamp. An out-of-order insert inside the covered
//! range rebuilds the extreme deques; only late events take that path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How a window decides what to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowBound {
    /// Last k events
    Count(usize),
    /// Events within this span of the newest timestamp
    Time(Duration),
}

/// A named window shape, e.g. "short" = last 5 events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
    pub name: String,
    pub bound: WindowBound,
}

impl WindowSpec {
    pub fn count(name: impl Into<String>, events: usize) -> Self {
        Self {
            name: name.into(),
            bound: WindowBound::Count(events),
        }
    }

    pub fn time(name: impl Into<String>, seconds: i64) -> Self {
        Self {
            name: name.into(),
            bound: WindowBound::Time(Duration::seconds(seconds)),
        }
    }
}

/// Aggregate view of one window at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowAggregate {
    pub count: usize,
    pub mean: f64,
    /// Sample variance (n-1 denominator)
    pub variance: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Value of the newest slot
    pub latest: f64,
}

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    ts: DateTime<Utc>,
    seq: u64,
    value: f64,
}

/// One rolling window over a single metric.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    bound: WindowBound,
    slots: VecDeque<WindowSlot>,
    mean: f64,
    m2: f64,
    // Ring-ordered extreme candidates: values strictly decrease front to
    // back in `maxima` and increase in `minima`, so the fronts are the
    // current max/min. Entries are matched to evicted slots by seq.
    maxima: VecDeque<(u64, f64)>,
    minima: VecDeque<(u64, f64)>,
    next_seq: u64,
}

impl RollingWindow {
    pub fn new(bound: WindowBound) -> Self {
        Self {
            bound,
            slots: VecDeque::new(),
            mean: 0.0,
            m2: 0.0,
            maxima: VecDeque::new(),
            minima: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Apply a value at `ts`. Returns false when the window can no longer
    /// cover that timestamp (the relevant slot was already evicted); the
    /// caller counts such events toward QA only.
    pub fn observe(&mut self, ts: DateTime<Utc>, value: f64) -> bool {
        if !self.covers(ts) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;

        // Sorted insert from the back; the common case is a plain append.
        let mut idx = self.slots.len();
        while idx > 0 && self.slots[idx - 1].ts > ts {
            idx -= 1;
        }
        let appended = idx == self.slots.len();
        self.slots.insert(idx, WindowSlot { ts, seq, value });
        self.add_value(value);
        if appended {
            self.push_extreme_candidate(seq, value);
        } else {
            self.rebuild_extremes();
        }

        self.evict();
        true
    }

    /// Drop slots that fall out of a time bound as of `now`. Count bounds
    /// are unaffected; they only evict on arrival.
    pub fn evict_as_of(&mut self, now: DateTime<Utc>) {
        if let WindowBound::Time(span) = self.bound {
            let cutoff = now - span;
            while self.slots.front().map_or(false, |s| s.ts <= cutoff) {
                self.pop_oldest();
            }
        }
    }

    /// Current aggregate, None while the window is empty.
    pub fn aggregate(&self) -> Option<WindowAggregate> {
        let n = self.slots.len();
        if n == 0 {
            return None;
        }
        let variance = if n > 1 {
            (self.m2 / (n as f64 - 1.0)).max(0.0)
        } else {
            0.0
        };
        Some(WindowAggregate {
            count: n,
            mean: self.mean,
            variance,
            std_dev: variance.sqrt(),
            min: self.minima.front().map_or(self.mean, |&(_, v)| v),
            max: self.maxima.front().map_or(self.mean, |&(_, v)| v),
            latest: self.slots.back().map(|s| s.value).unwrap_or(self.mean),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Oldest retained timestamp.
    pub fn oldest_ts(&self) -> Option<DateTime<Utc>> {
        self.slots.front().map(|s| s.ts)
    }

    /// Whether an event at `ts` still falls inside what this window keeps.
    fn covers(&self, ts: DateTime<Utc>) -> bool {
        match self.bound {
            WindowBound::Count(k) => {
                if self.slots.len() < k {
                    true
                } else {
                    // A full count window has evicted everything older
                    // than its front slot.
                    self.slots.front().map_or(true, |front| ts >= front.ts)
                }
            }
            WindowBound::Time(span) => match self.slots.back() {
                Some(newest) if newest.ts > ts => ts > newest.ts - span,
                _ => true,
            },
        }
    }

    fn evict(&mut self) {
        match self.bound {
            WindowBound::Count(k) => {
                while self.slots.len() > k {
                    self.pop_oldest();
                }
            }
            WindowBound::Time(span) => {
                if let Some(newest) = self.slots.back().map(|s| s.ts) {
                    let cutoff = newest - span;
                    while self.slots.front().map_or(false, |s| s.ts <= cutoff) {
                        self.pop_oldest();
                    }
                }
            }
        }
    }

    fn pop_oldest(&mut self) {
        if let Some(slot) = self.slots.pop_front() {
            self.remove_value(slot.value);
            if self.maxima.front().map_or(false, |&(s, _)| s == slot.seq) {
                self.maxima.pop_front();
            }
            if self.minima.front().map_or(false, |&(s, _)| s == slot.seq) {
                self.minima.pop_front();
            }
        }
    }

    /// Welford's online update.
    fn add_value(&mut self, value: f64) {
        let n = self.slots.len() as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        self.m2 += delta * (value - self.mean);
    }

    /// Reverse Welford update: symmetric decrement on eviction.
    fn remove_value(&mut self, value: f64) {
        let n = self.slots.len();
        if n == 0 {
            self.mean = 0.0;
            self.m2 = 0.0;
            return;
        }
        let remaining = n as f64;
        let old_mean = (self.mean * (remaining + 1.0) - value) / remaining;
        self.m2 -= (value - old_mean) * (value - self.mean);
        self.mean = old_mean;
    }

    /// Admit a value appended at the newest edge: dominated candidates
    /// leave from the back, ties keep the newer entry.
    fn push_extreme_candidate(&mut self, seq: u64, value: f64) {
        while self.maxima.back().map_or(false, |&(_, v)| v <= value) {
            self.maxima.pop_back();
        }
        self.maxima.push_back((seq, value));
        while self.minima.back().map_or(false, |&(_, v)| v >= value) {
            self.minima.pop_back();
        }
        self.minima.push_back((seq, value));
    }

    /// Rebuild both deques in ring order after a mid-ring insert.
    fn rebuild_extremes(&mut self) {
        self.maxima.clear();
        self.minima.clear();
        for i in 0..self.slots.len() {
            let WindowSlot { seq, value, .. } = self.slots[i];
            self.push_extreme_candidate(seq, value);
        }
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
    fn test_incremental_matches_batch() {
        use statrs::statistics::Statistics;

        let mut window = RollingWindow::new(WindowBound::Count(5));
        let values: Vec<f64> = (0..40).map(|i| 90.0 + (i as f64 * 0.73).sin() * 3.0).collect();

        for (i, &v) in values.iter().enumerate() {
            assert!(window.observe(ts(i as i64), v));

            let start = i.saturating_sub(4);
            let expected = &values[start..=i];
            let agg = window.aggregate().unwrap();

            assert_eq!(agg.count, expected.len());
            assert!((agg.mean - expected.iter().mean()).abs() < 1e-9);
            if expected.len() > 1 {
                assert!((agg.variance - expected.iter().variance()).abs() < 1e-9);
                assert!((agg.std_dev - expected.iter().std_dev()).abs() < 1e-9);
            } else {
                assert_eq!(agg.variance, 0.0);
            }
            assert_eq!(agg.min, Statistics::min(expected.iter()));
            assert_eq!(agg.max, Statistics::max(expected.iter()));
        }
    }

    #[test]
    fn test_count_eviction() {
        let mut window = RollingWindow::new(WindowBound::Count(5));
        for i in 1..=10 {
            window.observe(ts(i), i as f64);
        }
        let agg = window.aggregate().unwrap();
        // Last five values are 6..=10.
        assert_eq!(agg.count, 5);
        assert!((agg.mean - 8.0).abs() < 1e-9);
        assert!((agg.variance - 2.5).abs() < 1e-9);
        assert_eq!(agg.min, 6.0);
        assert_eq!(agg.max, 10.0);
        assert_eq!(agg.latest, 10.0);
    }

    #[test]
    fn test_time_eviction() {
        let mut window = RollingWindow::new(WindowBound::Time(Duration::seconds(30)));
        window.observe(ts(0), 1.0);
        window.observe(ts(10), 2.0);
        window.observe(ts(29), 3.0);
        assert_eq!(window.len(), 3);

        // An event at 35 pushes the cutoff to 5, dropping the first slot.
        window.observe(ts(35), 4.0);
        assert_eq!(window.len(), 3);
        let agg = window.aggregate().unwrap();
        assert!((agg.mean - 3.0).abs() < 1e-9);

        // Tick-time eviction without a new event.
        window.evict_as_of(ts(62));
        assert_eq!(window.len(), 1);
        assert_eq!(window.aggregate().unwrap().latest, 4.0);
    }

    #[test]
    fn test_late_insert_within_coverage() {
        let mut window = RollingWindow::new(WindowBound::Count(5));
        window.observe(ts(10), 10.0);
        window.observe(ts(30), 30.0);
        // Late but still covered by the count bound.
        assert!(window.observe(ts(20), 20.0));
        let agg = window.aggregate().unwrap();
        assert_eq!(agg.count, 3);
        assert!((agg.mean - 20.0).abs() < 1e-9);
        assert_eq!(window.oldest_ts().unwrap(), ts(10));
    }

    #[test]
    fn test_late_insert_after_eviction_rejected() {
        let mut window = RollingWindow::new(WindowBound::Count(3));
        for i in [10, 20, 30, 40] {
            window.observe(ts(i), i as f64);
        }
        // Slots now cover 20..40; an event from the evicted era is refused.
        assert!(!window.observe(ts(5), 5.0));
        assert_eq!(window.len(), 3);
        assert!((window.aggregate().unwrap().mean - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_late_insert_outside_time_span_rejected() {
        let mut window = RollingWindow::new(WindowBound::Time(Duration::seconds(30)));
        window.observe(ts(100), 1.0);
        assert!(!window.observe(ts(60), 2.0));
        assert!(window.observe(ts(80), 3.0));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_extremes_survive_eviction() {
        let mut window = RollingWindow::new(WindowBound::Count(3));
        window.observe(ts(1), 99.0);
        window.observe(ts(2), 91.0);
        window.observe(ts(3), 95.0);
        assert_eq!(window.aggregate().unwrap().max, 99.0);

        // Evicts the 99 maximum; the deque front must already hold 95.
        window.observe(ts(4), 93.0);
        let agg = window.aggregate().unwrap();
        assert_eq!(agg.max, 95.0);
        assert_eq!(agg.min, 91.0);
    }

    #[test]
    fn test_monotone_streams_track_extremes() {
        // Rising values: every eviction removes the current minimum.
        let mut window = RollingWindow::new(WindowBound::Count(4));
        for i in 0..50i64 {
            window.observe(ts(i), i as f64);
            let agg = window.aggregate().unwrap();
            assert_eq!(agg.min, (i as f64 - 3.0).max(0.0));
            assert_eq!(agg.max, i as f64);
        }

        // Falling values: every eviction removes the current maximum.
        let mut window = RollingWindow::new(WindowBound::Count(4));
        for i in 0..50i64 {
            window.observe(ts(i), -(i as f64));
            let agg = window.aggregate().unwrap();
            assert_eq!(agg.max, (3.0 - i as f64).min(0.0));
            assert_eq!(agg.min, -(i as f64));
        }
    }

    #[test]
    fn test_tied_extremes_evict_one_at_a_time() {
        let mut window = RollingWindow::new(WindowBound::Count(3));
        window.observe(ts(1), 97.0);
        window.observe(ts(2), 97.0);
        window.observe(ts(3), 92.0);
        // Evicts the first 97; the second still holds the maximum.
        window.observe(ts(4), 92.0);
        let agg = window.aggregate().unwrap();
        assert_eq!(agg.max, 97.0);
        assert_eq!(agg.min, 92.0);
    }

    #[test]
    fn test_late_insert_updates_extremes() {
        let mut window = RollingWindow::new(WindowBound::Count(5));
        window.observe(ts(10), 95.0);
        window.observe(ts(30), 94.0);
        assert!(window.observe(ts(20), 99.5));
        let agg = window.aggregate().unwrap();
        assert_eq!(agg.max, 99.5);
        assert_eq!(agg.min, 94.0);
    }

    #[test]
    fn test_empty_window_has_no_aggregate() {
        let window = RollingWindow::new(WindowBound::Count(5));
        assert!(window.aggregate().is_none());
        assert!(window.is_empty());
    }
}
