//! Per-venue calibration state machine.
//!
//! Confidence decays from the last anchor (a completed calibration or a
//! status report), accelerated by venue stress. Crossing a threshold
//! moves the recommended action one step and emits a single shift event
//! per transition, in either direction. The tracker is synchronous and
//! event-time driven; the task that owns one per venue lives in
//! [`crate::pipeline`].

use crate::calibration::decay::{decayed_confidence, DecayParams, EnvStress};
use crate::ingest::types::{CalibrationStatus, EnvObservation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Recommended handling of the active calibration set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalAction {
    /// Trust the current set
    None,
    /// Schedule a rebaseline at the next natural break
    Rebaseline,
    /// Serve from the fallback set, stop trusting fine deltas
    Fallback,
    /// Operator attention required
    Alert,
}

impl CalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalAction::None => "NONE",
            CalAction::Rebaseline => "REBASELINE",
            CalAction::Fallback => "FALLBACK",
            CalAction::Alert => "ALERT",
        }
    }
}

impl fmt::Display for CalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence cutoffs for each action step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalThresholds {
    pub soft: f64,
    pub hard: f64,
    pub alert: f64,
}

impl Default for CalThresholds {
    fn default() -> Self {
        Self {
            soft: 0.8,
            hard: 0.7,
            alert: 0.6,
        }
    }
}

/// Audit record of one action transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationShiftEvent {
    pub venue_id: String,
    pub shift_ts: DateTime<Utc>,
    pub previous: CalAction,
    pub current: CalAction,
    /// Confidence as of the previous evaluation
    pub confidence_before: f64,
    pub confidence: f64,
    /// Set that was active when the outgoing action was established
    pub previous_set: Option<String>,
    pub active_set: Option<String>,
}

/// Read-only view workers consume at tick time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationSnapshot {
    pub venue_id: String,
    pub confidence: f64,
    pub action: CalAction,
    pub active_set: Option<String>,
    pub anchor_ts: DateTime<Utc>,
}

impl CalibrationSnapshot {
    pub fn needs_recalibration(&self, feature_qa_min: f64, late_data_frac: f64) -> bool {
        recalibration_needed(self.confidence, feature_qa_min, late_data_frac)
    }
}

/// Combined-signal recalibration rule: low confidence alone, or moderate
/// confidence paired with degraded data quality or heavy lateness.
pub fn recalibration_needed(confidence: f64, feature_qa_min: f64, late_data_frac: f64) -> bool {
    confidence < 0.6
        || (feature_qa_min < 0.7 && confidence < 0.8)
        || (late_data_frac > 0.3 && confidence < 0.75)
}

/// Decay and transition state for one venue's rig.
pub struct CalibrationTracker {
    venue_id: String,
    params: DecayParams,
    thresholds: CalThresholds,
    anchor_confidence: f64,
    anchor_ts: DateTime<Utc>,
    /// Conditions at (or first seen after) the anchor, the reference for
    /// temperature and humidity deltas
    anchor_env: Option<EnvObservation>,
    stress: EnvStress,
    confidence: f64,
    action: CalAction,
    active_set: Option<String>,
    set_at_last_transition: Option<String>,
}

impl CalibrationTracker {
    pub fn new(
        venue_id: impl Into<String>,
        params: DecayParams,
        thresholds: CalThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let anchor_confidence = params.initial_confidence;
        Self {
            venue_id: venue_id.into(),
            params,
            thresholds,
            anchor_confidence,
            anchor_ts: now,
            anchor_env: None,
            stress: EnvStress::default(),
            confidence: anchor_confidence,
            action: CalAction::None,
            active_set: None,
            set_at_last_transition: None,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn action(&self) -> CalAction {
        self.action
    }

    /// A status report re-anchors the decay curve. Reports older than
    /// the current anchor are stale and ignored.
    pub fn observe_status(&mut self, status: &CalibrationStatus) {
        if status.detected_ts < self.anchor_ts {
            debug!(
                venue_id = self.venue_id,
                detected_ts = %status.detected_ts,
                anchor_ts = %self.anchor_ts,
                "ignoring stale calibration status"
            );
            return;
        }
        if status.calibration_set.is_some() && status.calibration_set != self.active_set {
            info!(
                venue_id = self.venue_id,
                from = self.active_set.as_deref().unwrap_or("-"),
                to = status.calibration_set.as_deref().unwrap_or("-"),
                "calibration set rotated"
            );
            self.active_set = status.calibration_set.clone();
        }
        self.anchor_confidence = status.confidence.clamp(0.0, 1.0);
        self.anchor_ts = status.detected_ts;
        // Deltas restart against conditions at the new anchor.
        self.anchor_env = None;
        self.stress = EnvStress {
            vibration_idx: self.stress.vibration_idx,
            wind_mph: self.stress.wind_mph,
            temp_delta_f: 0.0,
            humidity_delta_pct: 0.0,
        };
    }

    /// Latest venue conditions update the stress inputs.
    pub fn observe_env(&mut self, obs: &EnvObservation) {
        let anchor = self.anchor_env.get_or_insert_with(|| obs.clone());
        self.stress = EnvStress {
            vibration_idx: obs.rig_vibration_idx,
            wind_mph: obs.wind_mph,
            temp_delta_f: obs.temperature_f - anchor.temperature_f,
            humidity_delta_pct: obs.humidity_pct - anchor.humidity_pct,
        };
    }

    /// Recompute confidence as of `now`; a crossed threshold yields
    /// exactly one shift event.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<CalibrationShiftEvent> {
        let elapsed = now
            .signed_duration_since(self.anchor_ts)
            .to_std()
            .unwrap_or_default();
        let multiplier = self.stress.multiplier(&self.params);
        let confidence_before = self.confidence;
        self.confidence =
            decayed_confidence(&self.params, self.anchor_confidence, multiplier, elapsed);

        let next = self.classify(self.confidence);
        if next == self.action {
            return None;
        }
        let shift = CalibrationShiftEvent {
            venue_id: self.venue_id.clone(),
            shift_ts: now,
            previous: self.action,
            current: next,
            confidence_before,
            confidence: self.confidence,
            previous_set: self.set_at_last_transition.clone(),
            active_set: self.active_set.clone(),
        };
        self.action = next;
        self.set_at_last_transition = self.active_set.clone();
        Some(shift)
    }

    pub fn snapshot(&self) -> CalibrationSnapshot {
        CalibrationSnapshot {
            venue_id: self.venue_id.clone(),
            confidence: self.confidence,
            action: self.action,
            active_set: self.active_set.clone(),
            anchor_ts: self.anchor_ts,
        }
    }

    fn classify(&self, confidence: f64) -> CalAction {
        if confidence >= self.thresholds.soft {
            CalAction::None
        } else if confidence >= self.thresholds.hard {
            CalAction::Rebaseline
        } else if confidence >= self.thresholds.alert {
            CalAction::Fallback
        } else {
            CalAction::Alert
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::CalibrationAction;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn tracker() -> CalibrationTracker {
        CalibrationTracker::new(
            "busch_iii",
            DecayParams::default(),
            CalThresholds::default(),
            ts(0),
        )
    }

    fn status(secs: i64, confidence: f64, set: &str) -> CalibrationStatus {
        CalibrationStatus {
            venue_id: "busch_iii".to_string(),
            session_id: Some("sess_1".to_string()),
            detected_ts: ts(secs),
            confidence,
            calibration_set: Some(set.to_string()),
            recommended: CalibrationAction::None,
        }
    }

    fn env(secs: i64, vibration: f64) -> EnvObservation {
        EnvObservation {
            venue_id: "busch_iii".to_string(),
            obs_ts: ts(secs),
            temperature_f: 70.0,
            humidity_pct: 50.0,
            baro_hpa: 1013.25,
            wind_mph: 4.0,
            wind_dir_deg: 180.0,
            precip: false,
            mound_hardness_idx: 0.6,
            clay_moisture_idx: 0.4,
            rig_vibration_idx: vibration,
        }
    }

    #[test]
    fn test_fresh_tracker_is_trusted() {
        let mut t = tracker();
        assert!(t.tick(ts(0)).is_none());
        assert_eq!(t.action(), CalAction::None);
        assert!((t.confidence() - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_each_threshold_emits_one_shift() {
        let mut t = tracker();
        // Still above the soft threshold ten minutes in.
        assert!(t.tick(ts(600)).is_none());

        // Soft threshold crossing, one event.
        let shift = t.tick(ts(700)).unwrap();
        assert_eq!(shift.previous, CalAction::None);
        assert_eq!(shift.current, CalAction::Rebaseline);
        assert!(shift.confidence < 0.8);
        assert!(t.tick(ts(710)).is_none());

        // Hard threshold crossing.
        let shift = t.tick(ts(1200)).unwrap();
        assert_eq!(shift.previous, CalAction::Rebaseline);
        assert_eq!(shift.current, CalAction::Fallback);
        assert!(shift.confidence < 0.7);
        assert!(t.tick(ts(1250)).is_none());

        // Alert threshold crossing.
        let shift = t.tick(ts(1800)).unwrap();
        assert_eq!(shift.current, CalAction::Alert);
        assert!(shift.confidence < 0.6);
    }

    #[test]
    fn test_floor_stops_the_slide() {
        let mut t = tracker();
        t.tick(ts(8 * 3600));
        assert_eq!(t.confidence(), 0.5);
        assert_eq!(t.action(), CalAction::Alert);
    }

    #[test]
    fn test_status_reanchors_and_recovers() {
        let mut t = tracker();
        t.tick(ts(1200));
        assert_eq!(t.action(), CalAction::Fallback);

        t.observe_status(&status(1300, 0.95, "cal_2026_08_22a"));
        let shift = t.tick(ts(1310)).unwrap();
        assert_eq!(shift.previous, CalAction::Fallback);
        assert_eq!(shift.current, CalAction::None);
        assert!(shift.confidence_before < 0.7);
        assert!(shift.confidence > 0.9);
        assert_eq!(shift.previous_set, None);
        assert_eq!(shift.active_set.as_deref(), Some("cal_2026_08_22a"));
        assert!(t.confidence() > 0.9);
    }

    #[test]
    fn test_stale_status_is_ignored() {
        let mut t = tracker();
        t.observe_status(&status(500, 0.95, "cal_a"));
        t.observe_status(&status(100, 0.2, "cal_stale"));
        t.tick(ts(510));
        assert_eq!(t.action(), CalAction::None);
        assert_eq!(t.snapshot().active_set.as_deref(), Some("cal_a"));
    }

    #[test]
    fn test_vibration_accelerates_decay() {
        let mut calm = tracker();
        let mut shaky = tracker();
        shaky.observe_env(&env(10, 0.5));

        calm.tick(ts(600));
        shaky.tick(ts(600));
        assert!(shaky.confidence() < calm.confidence());
    }

    #[test]
    fn test_temp_swing_counts_from_anchor_conditions() {
        let mut t = tracker();
        let mut first = env(10, 0.0);
        first.temperature_f = 60.0;
        t.observe_env(&first);

        let mut cold_snap = env(300, 0.0);
        cold_snap.temperature_f = 48.0;
        t.observe_env(&cold_snap);

        // Twelve degrees against the anchor reading trips the stressor.
        let mut reference = tracker();
        t.tick(ts(600));
        reference.tick(ts(600));
        assert!(t.confidence() < reference.confidence());
    }

    #[test]
    fn test_needs_recalibration_rules() {
        let snap = |confidence: f64| CalibrationSnapshot {
            venue_id: "busch_iii".to_string(),
            confidence,
            action: CalAction::None,
            active_set: None,
            anchor_ts: ts(0),
        };
        assert!(snap(0.55).needs_recalibration(0.95, 0.0));
        assert!(snap(0.78).needs_recalibration(0.65, 0.0));
        assert!(snap(0.74).needs_recalibration(0.95, 0.35));
        assert!(!snap(0.9).needs_recalibration(0.95, 0.0));
        assert!(!snap(0.78).needs_recalibration(0.9, 0.1));
    }
}
