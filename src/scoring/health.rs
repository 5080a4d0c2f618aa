//! Per-entity health classification and alerting.
//!
//! Each scoring tick folds QA, lateness, and calibration confidence into
//! one health state. Alerts fire on state transitions only, with a dedup
//! window so a flapping entity cannot spam the channel. Alert ids are
//! deterministic, so a replayed tick reproduces the same id.

use crate::core::snapshot::hex_digest;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Health of one scored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    LowQa,
    HighLatency,
    CalDrift,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::LowQa => "LOW_QA",
            HealthState::HighLatency => "HIGH_LATENCY",
            HealthState::CalDrift => "CAL_DRIFT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    LowQa,
    HighLatency,
    CalibrationDrift,
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// An operator-facing notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Deterministic, 16 hex chars
    pub alert_id: String,
    pub entity_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub state: HealthState,
    pub message: String,
    pub ts: DateTime<Utc>,
}

impl Alert {
    /// Critical venue alert for a rig that decayed past the alert
    /// threshold. Emitted by the venue task, not the monitor.
    pub fn calibration_critical(venue_id: &str, ts: DateTime<Utc>, confidence: f64) -> Self {
        Self {
            alert_id: alert_id(venue_id, ts, "CAL_ALERT"),
            entity_id: venue_id.to_string(),
            kind: AlertKind::CalibrationDrift,
            severity: Severity::Critical,
            state: HealthState::CalDrift,
            message: format!(
                "calibration confidence {:.2} below alert threshold, operator attention required",
                confidence
            ),
            ts,
        }
    }
}

/// Degradation cutoffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub qa_floor: f64,
    pub late_frac_max: f64,
    pub calibration_floor: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            qa_floor: 0.7,
            late_frac_max: 0.3,
            calibration_floor: 0.7,
        }
    }
}

/// Tracks health per entity and decides when an alert is worth sending.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    dedup_window: Duration,
    states: HashMap<String, HealthState>,
    last_emitted: HashMap<(String, AlertKind), DateTime<Utc>>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds, dedup_window: Duration) -> Self {
        Self {
            thresholds,
            dedup_window,
            states: HashMap::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn state_of(&self, entity_id: &str) -> HealthState {
        self.states
            .get(entity_id)
            .copied()
            .unwrap_or(HealthState::Healthy)
    }

    /// Fold one tick's signals in. Returns an alert only when the state
    /// changed and the (entity, kind) pair is outside the dedup window.
    pub fn observe(
        &mut self,
        entity_id: &str,
        tick_ts: DateTime<Utc>,
        feature_qa_min: Option<f64>,
        late_data_frac: f64,
        calibration_confidence: f64,
    ) -> Option<Alert> {
        let next = self.classify(feature_qa_min, late_data_frac, calibration_confidence);
        let prev = self.state_of(entity_id);
        if next == prev {
            return None;
        }
        self.states.insert(entity_id.to_string(), next);
        self.prune(tick_ts);

        let (kind, severity, message) = match next {
            HealthState::Healthy => (
                AlertKind::Recovered,
                Severity::Info,
                format!("recovered from {}", prev.as_str()),
            ),
            HealthState::LowQa => (
                AlertKind::LowQa,
                Severity::Warning,
                format!(
                    "feature QA floor breached (qa_min {})",
                    feature_qa_min.map_or("none".to_string(), |q| format!("{:.2}", q))
                ),
            ),
            HealthState::HighLatency => (
                AlertKind::HighLatency,
                Severity::Warning,
                format!("late data fraction {:.2} over threshold", late_data_frac),
            ),
            HealthState::CalDrift => (
                AlertKind::CalibrationDrift,
                Severity::Warning,
                format!(
                    "calibration confidence {:.2} below floor",
                    calibration_confidence
                ),
            ),
        };

        let dedup_key = (entity_id.to_string(), kind);
        if let Some(last) = self.last_emitted.get(&dedup_key) {
            if tick_ts.signed_duration_since(*last) < self.dedup_window {
                return None;
            }
        }
        self.last_emitted.insert(dedup_key, tick_ts);

        Some(Alert {
            alert_id: alert_id(entity_id, tick_ts, next.as_str()),
            entity_id: entity_id.to_string(),
            kind,
            severity,
            state: next,
            message,
            ts: tick_ts,
        })
    }

    /// Worst signal wins: QA, then latency, then calibration.
    fn classify(
        &self,
        feature_qa_min: Option<f64>,
        late_data_frac: f64,
        calibration_confidence: f64,
    ) -> HealthState {
        if feature_qa_min.map_or(true, |q| q < self.thresholds.qa_floor) {
            HealthState::LowQa
        } else if late_data_frac > self.thresholds.late_frac_max {
            HealthState::HighLatency
        } else if calibration_confidence < self.thresholds.calibration_floor {
            HealthState::CalDrift
        } else {
            HealthState::Healthy
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.dedup_window;
        self.last_emitted
            .retain(|_, last| now.signed_duration_since(*last) < window * 2);
    }
}

/// Deterministic id: hash of entity, tick, and state label, truncated.
fn alert_id(entity_id: &str, tick_ts: DateTime<Utc>, label: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(tick_ts.timestamp_millis().to_be_bytes());
    hasher.update(b"|");
    hasher.update(label.as_bytes());
    let digest = hex_digest(hasher.finalize().as_slice());
    digest[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthThresholds::default(), Duration::seconds(300))
    }

    #[test]
    fn test_alerts_fire_on_change_only() {
        let mut m = monitor();
        assert!(m.observe("STL_656427", ts(0), Some(0.95), 0.0, 0.92).is_none());

        let alert = m.observe("STL_656427", ts(30), Some(0.6), 0.0, 0.92).unwrap();
        assert_eq!(alert.kind, AlertKind::LowQa);
        assert_eq!(alert.severity, Severity::Warning);
        assert_eq!(alert.state, HealthState::LowQa);
        assert_eq!(alert.alert_id.len(), 16);

        // Same degraded state keeps quiet.
        assert!(m.observe("STL_656427", ts(60), Some(0.55), 0.0, 0.92).is_none());

        let recovered = m.observe("STL_656427", ts(90), Some(0.95), 0.0, 0.92).unwrap();
        assert_eq!(recovered.kind, AlertKind::Recovered);
        assert_eq!(recovered.severity, Severity::Info);
    }

    #[test]
    fn test_qa_outranks_latency_and_calibration() {
        let mut m = monitor();
        m.observe("e", ts(0), Some(0.5), 0.9, 0.2);
        assert_eq!(m.state_of("e"), HealthState::LowQa);

        let mut m = monitor();
        m.observe("e", ts(0), Some(0.95), 0.9, 0.2);
        assert_eq!(m.state_of("e"), HealthState::HighLatency);

        let mut m = monitor();
        m.observe("e", ts(0), Some(0.95), 0.0, 0.2);
        assert_eq!(m.state_of("e"), HealthState::CalDrift);
    }

    #[test]
    fn test_flapping_is_deduplicated() {
        let mut m = monitor();
        assert!(m.observe("e", ts(0), Some(0.6), 0.0, 0.92).is_some());
        assert!(m.observe("e", ts(10), Some(0.95), 0.0, 0.92).is_some());

        // Second breach inside the window changes state silently.
        assert!(m.observe("e", ts(20), Some(0.6), 0.0, 0.92).is_none());
        assert_eq!(m.state_of("e"), HealthState::LowQa);
        assert!(m.observe("e", ts(30), Some(0.95), 0.0, 0.92).is_none());

        // Outside the window the same transition alerts again.
        assert!(m.observe("e", ts(400), Some(0.6), 0.0, 0.92).is_some());
    }

    #[test]
    fn test_alert_ids_are_deterministic() {
        let a = alert_id("STL_656427", ts(30), "LOW_QA");
        let b = alert_id("STL_656427", ts(30), "LOW_QA");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, alert_id("STL_656427", ts(30), "HIGH_LATENCY"));
        assert_ne!(a, alert_id("STL_656427", ts(31), "LOW_QA"));
    }

    #[test]
    fn test_entities_are_independent() {
        let mut m = monitor();
        assert!(m.observe("a", ts(0), Some(0.6), 0.0, 0.92).is_some());
        assert!(m.observe("b", ts(0), Some(0.6), 0.0, 0.92).is_some());
        assert_eq!(m.state_of("a"), HealthState::LowQa);
        assert_eq!(m.state_of("c"), HealthState::Healthy);
    }

    #[test]
    fn test_critical_calibration_alert() {
        let alert = Alert::calibration_critical("busch_iii", ts(0), 0.58);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.kind, AlertKind::CalibrationDrift);
        assert!(alert.message.contains("0.58"));
    }
}
