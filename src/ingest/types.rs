//! Telemetry event types consumed by the pipeline.
//!
//! Three source streams feed the pipeline: pitch tracking measurements,
//! venue environment observations, and rig calibration status updates.
//! Every event carries both the sensor clock (`event_ts`) and the arrival
//! clock (`ingest_ts`); the two are reconciled by the watermark layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pitch classification reported by the tracking system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PitchType {
    #[serde(rename = "FF")]
    FourSeam,
    #[serde(rename = "SL")]
    Slider,
    #[serde(rename = "CH")]
    Changeup,
    #[serde(rename = "SI")]
    Sinker,
    #[serde(rename = "CT")]
    Cutter,
}

impl PitchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PitchType::FourSeam => "FF",
            PitchType::Slider => "SL",
            PitchType::Changeup => "CH",
            PitchType::Sinker => "SI",
            PitchType::Cutter => "CT",
        }
    }
}

/// A single tracked pitch from the measurement rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitchSample {
    /// Tracking system's pitch identifier
    pub pitch_id: String,
    /// Session (appearance) this pitch belongs to
    pub session_id: String,
    /// Pitcher identity, e.g. "STL_656427"
    pub pitcher_id: String,
    /// Venue whose rig produced the measurement
    pub venue_id: String,
    /// Pitch classification
    pub pitch_type: PitchType,
    /// Release speed in mph
    pub release_speed_mph: f64,
    /// Spin rate in rpm
    pub spin_rate_rpm: f64,
    /// Spin axis in degrees
    pub spin_axis_deg: f64,
    /// Extension toward the plate in feet
    pub extension_ft: f64,
    /// Release point, x (feet, catcher's view)
    pub release_pos_x_ft: f64,
    /// Release point, y (feet from the plate)
    pub release_pos_y_ft: f64,
    /// Release point, z (feet above the mound)
    pub release_pos_z_ft: f64,
    /// Induced vertical break in inches
    pub vbreak_in: f64,
    /// Horizontal break in inches
    pub hbreak_in: f64,
    /// Plate crossing, x (feet)
    pub plate_x_ft: f64,
    /// Plate crossing, z (feet)
    pub plate_z_ft: f64,
}

/// Ambient conditions reported by the venue weather station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvObservation {
    pub venue_id: String,
    /// When the observation was taken
    pub obs_ts: DateTime<Utc>,
    pub temperature_f: f64,
    pub humidity_pct: f64,
    pub baro_hpa: f64,
    pub wind_mph: f64,
    pub wind_dir_deg: f64,
    pub precip: bool,
    /// Mound surface hardness index, 0-1
    pub mound_hardness_idx: f64,
    /// Mound clay moisture index, 0-1
    pub clay_moisture_idx: f64,
    /// Tracking rig vibration index, 0-1
    pub rig_vibration_idx: f64,
}

/// Action recommended by the upstream calibration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalibrationAction {
    None,
    Rebaseline,
    Fallback,
    Alert,
}

impl CalibrationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationAction::None => "NONE",
            CalibrationAction::Rebaseline => "REBASELINE",
            CalibrationAction::Fallback => "FALLBACK",
            CalibrationAction::Alert => "ALERT",
        }
    }
}

/// A calibration status update for one venue's tracking rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub venue_id: String,
    /// Session during which the check ran, if any
    pub session_id: Option<String>,
    /// When the check was performed
    pub detected_ts: DateTime<Utc>,
    /// Measured rig confidence, 0-1
    pub confidence: f64,
    /// Identifier of the calibration set the check validated, if known
    #[serde(default)]
    pub calibration_set: Option<String>,
    /// Action the upstream service recommends
    pub recommended: CalibrationAction,
}

/// Which source stream an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Tracking,
    Environment,
    Calibration,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Tracking => "tracking",
            SourceKind::Environment => "environment",
            SourceKind::Calibration => "calibration",
        }
    }

    /// All source streams the pipeline consumes.
    pub fn all() -> [SourceKind; 3] {
        [
            SourceKind::Tracking,
            SourceKind::Environment,
            SourceKind::Calibration,
        ]
    }
}

/// Typed payload of a telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum TelemetryPayload {
    Pitch(PitchSample),
    Environment(EnvObservation),
    Calibration(CalibrationStatus),
}

/// One event from any source stream.
///
/// `ingest_ts >= event_ts` is expected but not enforced; the router logs
/// a violation and processes the event. Lateness is judged against the
/// watermark, not the arrival clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Sensor clock: when the measurement happened
    pub event_ts: DateTime<Utc>,
    /// Arrival clock: when the event reached the pipeline
    pub ingest_ts: DateTime<Utc>,
    /// Measurement quality, 0-1
    pub quality: f64,
    #[serde(flatten)]
    pub payload: TelemetryPayload,
}

impl TelemetryEvent {
    /// Wrap a pitch sample, stamping arrival at now.
    pub fn pitch(sample: PitchSample, event_ts: DateTime<Utc>, quality: f64) -> Self {
        Self {
            event_ts,
            ingest_ts: Utc::now(),
            quality,
            payload: TelemetryPayload::Pitch(sample),
        }
    }

    /// Wrap an environment observation, stamping arrival at now.
    pub fn environment(obs: EnvObservation) -> Self {
        Self {
            event_ts: obs.obs_ts,
            ingest_ts: Utc::now(),
            quality: 1.0,
            payload: TelemetryPayload::Environment(obs),
        }
    }

    /// Wrap a calibration status, stamping arrival at now.
    pub fn calibration(status: CalibrationStatus) -> Self {
        Self {
            event_ts: status.detected_ts,
            ingest_ts: Utc::now(),
            quality: 1.0,
            payload: TelemetryPayload::Calibration(status),
        }
    }

    /// Override the arrival clock (used by replay and the simulator).
    pub fn with_ingest_ts(mut self, ingest_ts: DateTime<Utc>) -> Self {
        self.ingest_ts = ingest_ts;
        self
    }

    /// Source stream this event belongs to.
    pub fn source(&self) -> SourceKind {
        match self.payload {
            TelemetryPayload::Pitch(_) => SourceKind::Tracking,
            TelemetryPayload::Environment(_) => SourceKind::Environment,
            TelemetryPayload::Calibration(_) => SourceKind::Calibration,
        }
    }

    /// Watermark partition key: pitcher for tracking, venue otherwise.
    pub fn partition_key(&self) -> &str {
        match &self.payload {
            TelemetryPayload::Pitch(p) => &p.pitcher_id,
            TelemetryPayload::Environment(e) => &e.venue_id,
            TelemetryPayload::Calibration(c) => &c.venue_id,
        }
    }

    /// Venue providing environment/calibration context for this event.
    pub fn venue_id(&self) -> &str {
        match &self.payload {
            TelemetryPayload::Pitch(p) => &p.venue_id,
            TelemetryPayload::Environment(e) => &e.venue_id,
            TelemetryPayload::Calibration(c) => &c.venue_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pitch(pitcher_id: &str, speed: f64) -> PitchSample {
        PitchSample {
            pitch_id: "p_0001".to_string(),
            session_id: "sess_test".to_string(),
            pitcher_id: pitcher_id.to_string(),
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
    fn test_event_routing_keys() {
        let ts = Utc::now();
        let pitch = TelemetryEvent::pitch(sample_pitch("STL_656427", 99.2), ts, 0.95);
        assert_eq!(pitch.source(), SourceKind::Tracking);
        assert_eq!(pitch.partition_key(), "STL_656427");
        assert_eq!(pitch.venue_id(), "busch_iii");

        let obs = EnvObservation {
            venue_id: "busch_iii".to_string(),
            obs_ts: ts,
            temperature_f: 88.0,
            humidity_pct: 62.0,
            baro_hpa: 1013.0,
            wind_mph: 8.0,
            wind_dir_deg: 140.0,
            precip: false,
            mound_hardness_idx: 0.7,
            clay_moisture_idx: 0.4,
            rig_vibration_idx: 0.1,
        };
        let env = TelemetryEvent::environment(obs);
        assert_eq!(env.source(), SourceKind::Environment);
        assert_eq!(env.partition_key(), "busch_iii");
        assert_eq!(env.event_ts, ts);
    }

    #[test]
    fn test_pitch_type_codes() {
        assert_eq!(PitchType::FourSeam.as_str(), "FF");
        let json = serde_json::to_string(&PitchType::Slider).unwrap();
        assert_eq!(json, "\"SL\"");
    }

    #[test]
    fn test_event_wire_format() {
        let ts = Utc::now();
        let event = TelemetryEvent::pitch(sample_pitch("STL_656427", 98.4), ts, 0.93);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"stream\":\"pitch\""));
        assert!(json.contains("release_speed_mph"));

        let back: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.partition_key(), "STL_656427");
        assert!((back.quality - 0.93).abs() < 1e-9);
    }
}
