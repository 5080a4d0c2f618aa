//! Per-entity windowed metric state.
//!
//! Every tracked pitch fans out into one rolling window per (metric,
//! window-spec) pair. Quality gating and lateness accounting happen here:
//! gated events never reach the windows but stay visible to QA counters,
//! so degraded trust is never silently hidden.

use crate::core::window::{RollingWindow, WindowAggregate, WindowBound, WindowSpec};
use crate::ingest::types::PitchSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Fallback depth of the QA accounting ring when no count window is
/// configured.
const DEFAULT_ACCOUNTING_DEPTH: usize = 20;

/// Per-pitch measurements the windows track.
///
/// Names match the metric rows in the baseline store, so deltas can be
/// joined without a mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitchMetric {
    ReleaseSpeed,
    SpinRate,
    SpinAxis,
    Extension,
    ReleaseHeight,
    VerticalBreak,
    HorizontalBreak,
    PlateX,
    PlateZ,
}

impl PitchMetric {
    pub const ALL: [PitchMetric; 9] = [
        PitchMetric::ReleaseSpeed,
        PitchMetric::SpinRate,
        PitchMetric::SpinAxis,
        PitchMetric::Extension,
        PitchMetric::ReleaseHeight,
        PitchMetric::VerticalBreak,
        PitchMetric::HorizontalBreak,
        PitchMetric::PlateX,
        PitchMetric::PlateZ,
    ];

    /// Baseline-store metric name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PitchMetric::ReleaseSpeed => "release_speed_mph",
            PitchMetric::SpinRate => "spin_rate_rpm",
            PitchMetric::SpinAxis => "spin_axis_deg",
            PitchMetric::Extension => "extension_ft",
            PitchMetric::ReleaseHeight => "release_pos_z_ft",
            PitchMetric::VerticalBreak => "vbreak_in",
            PitchMetric::HorizontalBreak => "hbreak_in",
            PitchMetric::PlateX => "plate_x_ft",
            PitchMetric::PlateZ => "plate_z_ft",
        }
    }

    /// Pull this metric's value out of a pitch sample.
    pub fn extract(&self, sample: &PitchSample) -> f64 {
        match self {
            PitchMetric::ReleaseSpeed => sample.release_speed_mph,
            PitchMetric::SpinRate => sample.spin_rate_rpm,
            PitchMetric::SpinAxis => sample.spin_axis_deg,
            PitchMetric::Extension => sample.extension_ft,
            PitchMetric::ReleaseHeight => sample.release_pos_z_ft,
            PitchMetric::VerticalBreak => sample.vbreak_in,
            PitchMetric::HorizontalBreak => sample.hbreak_in,
            PitchMetric::PlateX => sample.plate_x_ft,
            PitchMetric::PlateZ => sample.plate_z_ft,
        }
    }
}

/// The declared window shapes, shared by every entity partition.
#[derive(Debug, Clone)]
pub struct WindowSet {
    specs: Arc<Vec<WindowSpec>>,
}

impl WindowSet {
    pub fn new(specs: Vec<WindowSpec>) -> Self {
        Self {
            specs: Arc::new(specs),
        }
    }

    pub fn specs(&self) -> &[WindowSpec] {
        &self.specs
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.specs.iter().position(|s| s.name == name)
    }

    /// Depth of the QA accounting ring: the deepest count bound.
    fn accounting_depth(&self) -> usize {
        self.specs
            .iter()
            .filter_map(|s| match s.bound {
                WindowBound::Count(k) => Some(k),
                WindowBound::Time(_) => None,
            })
            .max()
            .unwrap_or(DEFAULT_ACCOUNTING_DEPTH)
    }
}

/// One accounted event in the QA ring.
#[derive(Debug, Clone, Copy)]
struct Contribution {
    event_ts: DateTime<Utc>,
    quality: f64,
    is_late: bool,
    /// Passed the quality floor and reached the windows
    contributing: bool,
}

/// Quality metadata for the events backing the current windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QaSummary {
    /// Minimum quality among contributing events, None when none contributed
    pub feature_qa_min: Option<f64>,
    /// Late events over all accounted events (gated ones included)
    pub late_data_frac: f64,
    /// Events in the accounting ring
    pub accounted: usize,
    /// Of those, events that reached the windows
    pub contributing: usize,
}

/// Which source events back a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributionLineage {
    pub session_id: Option<String>,
    pub first_event_ts: DateTime<Utc>,
    pub last_event_ts: DateTime<Utc>,
    pub event_count: usize,
}

/// Outcome of applying one event to the window state.
#[derive(Debug, Clone, Copy)]
pub struct EventDisposition {
    /// Reached the windows (passed the quality floor)
    pub contributing: bool,
    /// Windows that refused the event because its slot was already evicted
    pub missed_windows: usize,
}

/// All windowed state for one pitcher partition.
///
/// Owned exclusively by that partition's worker; nothing here is shared.
pub struct EntityWindowState {
    pitcher_id: String,
    venue_id: String,
    session_id: Option<String>,
    window_set: WindowSet,
    quality_floor: f64,
    windows: HashMap<PitchMetric, Vec<RollingWindow>>,
    contributions: VecDeque<Contribution>,
}

impl EntityWindowState {
    pub fn new(
        pitcher_id: impl Into<String>,
        venue_id: impl Into<String>,
        window_set: WindowSet,
        quality_floor: f64,
    ) -> Self {
        Self {
            pitcher_id: pitcher_id.into(),
            venue_id: venue_id.into(),
            session_id: None,
            window_set,
            quality_floor,
            windows: HashMap::new(),
            contributions: VecDeque::new(),
        }
    }

    pub fn pitcher_id(&self) -> &str {
        &self.pitcher_id
    }

    pub fn venue_id(&self) -> &str {
        &self.venue_id
    }

    /// Apply one pitch to the windows and QA accounting.
    pub fn apply(
        &mut self,
        sample: &PitchSample,
        event_ts: DateTime<Utc>,
        quality: f64,
        is_late: bool,
    ) -> EventDisposition {
        self.session_id = Some(sample.session_id.clone());
        let contributing = quality >= self.quality_floor;
        self.push_contribution(Contribution {
            event_ts,
            quality,
            is_late,
            contributing,
        });

        let mut missed_windows = 0;
        if contributing {
            for metric in PitchMetric::ALL {
                let value = metric.extract(sample);
                let windows = self.windows.entry(metric).or_insert_with(|| {
                    self.window_set
                        .specs
                        .iter()
                        .map(|s| RollingWindow::new(s.bound))
                        .collect()
                });
                for window in windows.iter_mut() {
                    if !window.observe(event_ts, value) {
                        missed_windows += 1;
                    }
                }
            }
        }

        EventDisposition {
            contributing,
            missed_windows,
        }
    }

    /// Aggregate view of every window as of `tick_ts`. None until at
    /// least one event has contributed.
    pub fn frame_at(&mut self, tick_ts: DateTime<Utc>) -> Option<MetricFrame> {
        if self.windows.is_empty() {
            return None;
        }

        let mut aggregates = HashMap::new();
        let mut any = false;
        for (metric, windows) in self.windows.iter_mut() {
            let mut per_spec = Vec::with_capacity(windows.len());
            for window in windows.iter_mut() {
                window.evict_as_of(tick_ts);
                let agg = window.aggregate();
                any |= agg.is_some();
                per_spec.push(agg);
            }
            aggregates.insert(*metric, per_spec);
        }

        if !any {
            return None;
        }
        Some(MetricFrame {
            tick_ts,
            aggregates,
        })
    }

    /// QA metadata over the accounting ring.
    pub fn qa_summary(&self) -> QaSummary {
        let accounted = self.contributions.len();
        let late = self.contributions.iter().filter(|c| c.is_late).count();
        let contributing = self.contributions.iter().filter(|c| c.contributing).count();
        let feature_qa_min = self
            .contributions
            .iter()
            .filter(|c| c.contributing)
            .map(|c| c.quality)
            .fold(None, |acc: Option<f64>, q| {
                Some(acc.map_or(q, |a| a.min(q)))
            });

        QaSummary {
            feature_qa_min,
            late_data_frac: if accounted == 0 {
                0.0
            } else {
                late as f64 / accounted as f64
            },
            accounted,
            contributing,
        }
    }

    /// Which events back the current windows.
    pub fn lineage(&self) -> Option<ContributionLineage> {
        let mut first: Option<DateTime<Utc>> = None;
        let mut last: Option<DateTime<Utc>> = None;
        let mut count = 0;
        for c in self.contributions.iter().filter(|c| c.contributing) {
            count += 1;
            first = Some(first.map_or(c.event_ts, |f: DateTime<Utc>| f.min(c.event_ts)));
            last = Some(last.map_or(c.event_ts, |l: DateTime<Utc>| l.max(c.event_ts)));
        }
        Some(ContributionLineage {
            session_id: self.session_id.clone(),
            first_event_ts: first?,
            last_event_ts: last?,
            event_count: count,
        })
    }

    fn push_contribution(&mut self, c: Contribution) {
        let depth = self.window_set.accounting_depth();
        self.contributions.push_back(c);
        while self.contributions.len() > depth {
            self.contributions.pop_front();
        }
    }
}

/// Aggregates for every (metric, window-spec) pair at one tick.
#[derive(Debug, Clone)]
pub struct MetricFrame {
    pub tick_ts: DateTime<Utc>,
    aggregates: HashMap<PitchMetric, Vec<Option<WindowAggregate>>>,
}

impl MetricFrame {
    pub fn aggregate(&self, metric: PitchMetric, spec_idx: usize) -> Option<&WindowAggregate> {
        self.aggregates
            .get(&metric)
            .and_then(|per_spec| per_spec.get(spec_idx))
            .and_then(|agg| agg.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::PitchType;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn window_set() -> WindowSet {
        WindowSet::new(vec![
            WindowSpec::count("short", 5),
            WindowSpec::count("medium", 20),
            WindowSpec::time("session", 30),
        ])
    }

    fn pitch(speed: f64) -> PitchSample {
        PitchSample {
            pitch_id: "p".to_string(),
            session_id: "sess_1".to_string(),
            pitcher_id: "STL_656427".to_string(),
            venue_id: "busch_iii".to_string(),
            pitch_type: PitchType::FourSeam,
            release_speed_mph: speed,
            spin_rate_rpm: 2450.0,
            spin_axis_deg: 210.0,
            extension_ft: 6.8,
            release_pos_x_ft: -1.2,
            release_pos_y_ft: 54.2,
            release_pos_z_ft: 6.2,
            vbreak_in: 14.5,
            hbreak_in: 8.2,
            plate_x_ft: 0.3,
            plate_z_ft: 2.4,
        }
    }

    #[test]
    fn test_five_clean_events() {
        let mut state = EntityWindowState::new("STL_656427", "busch_iii", window_set(), 0.5);
        let speeds = [97.0, 97.5, 98.0, 98.5, 99.0];
        for (i, &speed) in speeds.iter().enumerate() {
            let d = state.apply(&pitch(speed), ts(i as i64 * 25), 0.95, false);
            assert!(d.contributing);
        }

        let qa = state.qa_summary();
        assert_eq!(qa.feature_qa_min, Some(0.95));
        assert_eq!(qa.late_data_frac, 0.0);
        assert_eq!(qa.accounted, 5);

        let frame = state.frame_at(ts(5 * 25)).unwrap();
        let short = frame.aggregate(PitchMetric::ReleaseSpeed, 0).unwrap();
        assert_eq!(short.count, 5);
        assert!((short.mean - 98.0).abs() < 1e-9);

        let lineage = state.lineage().unwrap();
        assert_eq!(lineage.event_count, 5);
        assert_eq!(lineage.first_event_ts, ts(0));
        assert_eq!(lineage.last_event_ts, ts(100));
    }

    #[test]
    fn test_quality_floor_gates_windows_not_qa() {
        let mut state = EntityWindowState::new("STL_656427", "busch_iii", window_set(), 0.5);
        state.apply(&pitch(98.0), ts(0), 0.95, false);
        let d = state.apply(&pitch(60.0), ts(25), 0.3, true);
        assert!(!d.contributing);
        state.apply(&pitch(98.0), ts(50), 0.9, false);

        // The gated sample never reached the windows.
        let frame = state.frame_at(ts(60)).unwrap();
        let short = frame.aggregate(PitchMetric::ReleaseSpeed, 0).unwrap();
        assert_eq!(short.count, 2);
        assert!((short.mean - 98.0).abs() < 1e-9);

        // But it still counts for lateness, and qa_min ignores it.
        let qa = state.qa_summary();
        assert!((qa.late_data_frac - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(qa.feature_qa_min, Some(0.9));
        assert_eq!(qa.contributing, 2);
    }

    #[test]
    fn test_late_event_raises_late_frac() {
        let mut in_order = EntityWindowState::new("a", "busch_iii", window_set(), 0.5);
        let mut with_late = EntityWindowState::new("b", "busch_iii", window_set(), 0.5);

        for i in 0..4 {
            in_order.apply(&pitch(98.0), ts(i * 25), 0.95, false);
            with_late.apply(&pitch(98.0), ts(i * 25), 0.95, false);
        }
        with_late.apply(&pitch(97.0), ts(10), 0.95, true);

        assert!(with_late.qa_summary().late_data_frac > in_order.qa_summary().late_data_frac);
    }

    #[test]
    fn test_frame_covers_all_metrics() {
        let mut state = EntityWindowState::new("STL_656427", "busch_iii", window_set(), 0.5);
        state.apply(&pitch(98.0), ts(0), 0.95, false);
        let frame = state.frame_at(ts(1)).unwrap();
        for metric in PitchMetric::ALL {
            assert!(frame.aggregate(metric, 0).is_some(), "{}", metric.as_str());
        }
    }

    #[test]
    fn test_empty_state_has_no_frame() {
        let mut state = EntityWindowState::new("STL_656427", "busch_iii", window_set(), 0.5);
        assert!(state.frame_at(ts(0)).is_none());
        assert!(state.lineage().is_none());
        assert_eq!(state.qa_summary().feature_qa_min, None);
    }
}
