//! Environmental normalization of movement metrics.
//!
//! Air density moves measured pitch break: warm, humid, low-pressure air
//! lets a ball break more than the same pitch on a cold night. Break
//! aggregates are rescaled toward the venue's reference conditions so
//! day-to-day readings stay comparable. The adjustment is a pure function
//! of the latest observation; staleness policy lives with the caller.

use crate::ingest::types::EnvObservation;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Reference conditions and identity for one tracked venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueProfile {
    pub venue_id: String,
    pub display_name: String,
    /// Local zone, used to label sessions with venue-local dates
    pub timezone: Tz,
    pub reference_temperature_f: f64,
    pub reference_humidity_pct: f64,
    pub reference_baro_hpa: f64,
}

impl Default for VenueProfile {
    fn default() -> Self {
        Self {
            venue_id: "busch_iii".to_string(),
            display_name: "Busch Stadium III".to_string(),
            timezone: chrono_tz::America::Chicago,
            reference_temperature_f: 70.0,
            reference_humidity_pct: 50.0,
            reference_baro_hpa: 1013.25,
        }
    }
}

/// Percent-per-decade coefficients for the break adjustment.
///
/// Signs follow air density: warmer and wetter air inflates measured
/// break (positive), higher pressure suppresses it (negative).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentParams {
    pub temp_pct_per_10f: f64,
    pub humidity_pct_per_10pct: f64,
    pub baro_pct_per_10hpa: f64,
}

impl Default for AdjustmentParams {
    fn default() -> Self {
        Self {
            temp_pct_per_10f: 2.0,
            humidity_pct_per_10pct: 0.4,
            baro_pct_per_10hpa: -0.6,
        }
    }
}

/// Rescale a raw break aggregate to the venue's reference conditions.
pub fn adjust(
    raw: f64,
    obs: &EnvObservation,
    profile: &VenueProfile,
    params: &AdjustmentParams,
) -> f64 {
    let temp_pct =
        (obs.temperature_f - profile.reference_temperature_f) / 10.0 * params.temp_pct_per_10f;
    let humidity_pct =
        (obs.humidity_pct - profile.reference_humidity_pct) / 10.0 * params.humidity_pct_per_10pct;
    let baro_pct = (obs.baro_hpa - profile.reference_baro_hpa) / 10.0 * params.baro_pct_per_10hpa;
    raw * (1.0 + (temp_pct + humidity_pct + baro_pct) / 100.0)
}

/// Whether an observation is recent enough to drive adjustment.
pub fn observation_is_fresh(obs: &EnvObservation, now: DateTime<Utc>, max_age: Duration) -> bool {
    now.signed_duration_since(obs.obs_ts) <= max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(temperature_f: f64, humidity_pct: f64, baro_hpa: f64) -> EnvObservation {
        EnvObservation {
            venue_id: "busch_iii".to_string(),
            obs_ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            temperature_f,
            humidity_pct,
            baro_hpa,
            wind_mph: 4.0,
            wind_dir_deg: 180.0,
            precip: false,
            mound_hardness_idx: 0.6,
            clay_moisture_idx: 0.4,
            rig_vibration_idx: 0.05,
        }
    }

    #[test]
    fn test_reference_conditions_are_identity() {
        let profile = VenueProfile::default();
        let params = AdjustmentParams::default();
        let adjusted = adjust(14.5, &obs(70.0, 50.0, 1013.25), &profile, &params);
        assert!((adjusted - 14.5).abs() < 1e-9);
    }

    #[test]
    fn test_ten_degrees_warm_adds_two_percent() {
        let profile = VenueProfile::default();
        let params = AdjustmentParams::default();
        let adjusted = adjust(10.0, &obs(80.0, 50.0, 1013.25), &profile, &params);
        assert!((adjusted - 10.2).abs() < 1e-9);
    }

    #[test]
    fn test_high_pressure_suppresses_break() {
        let profile = VenueProfile::default();
        let params = AdjustmentParams::default();
        let adjusted = adjust(10.0, &obs(70.0, 50.0, 1023.25), &profile, &params);
        assert!(adjusted < 10.0);
        assert!((adjusted - 9.94).abs() < 1e-9);
    }

    #[test]
    fn test_effects_compose_additively() {
        let profile = VenueProfile::default();
        let params = AdjustmentParams::default();
        // +2% temp, +0.4% humidity, -0.6% pressure nets +1.8%.
        let adjusted = adjust(10.0, &obs(80.0, 60.0, 1023.25), &profile, &params);
        assert!((adjusted - 10.18).abs() < 1e-9);
    }

    #[test]
    fn test_freshness_window() {
        let o = obs(70.0, 50.0, 1013.25);
        let now = o.obs_ts + Duration::seconds(90);
        assert!(observation_is_fresh(&o, now, Duration::seconds(120)));
        let later = o.obs_ts + Duration::seconds(121);
        assert!(!observation_is_fresh(&o, later, Duration::seconds(120)));
    }
}
