//! Calibration confidence decay.
//!
//! Tracking rigs drift between recalibrations. Confidence in the active
//! calibration set decays exponentially from the last anchor point, and
//! adverse conditions at the venue (vibration, wind, big swings in
//! temperature or humidity) accelerate the decay. All functions here are
//! pure; the per-venue state machine lives in [`super::tracker`].

use serde::{Deserialize, Serialize};
use std::f64::consts::LN_2;
use std::time::Duration;

/// Decay curve and stress gate parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayParams {
    /// Confidence assigned right after a completed calibration
    pub initial_confidence: f64,
    /// Idle time for confidence to halve under calm conditions
    pub half_life_minutes: f64,
    /// Confidence never decays below this
    pub floor: f64,
    pub vibration_threshold: f64,
    pub wind_threshold_mph: f64,
    pub temp_delta_threshold_f: f64,
    pub humidity_delta_threshold_pct: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            initial_confidence: 0.95,
            half_life_minutes: 45.0,
            floor: 0.5,
            vibration_threshold: 0.3,
            wind_threshold_mph: 15.0,
            temp_delta_threshold_f: 5.0,
            humidity_delta_threshold_pct: 10.0,
        }
    }
}

/// Venue conditions relative to the calibration anchor.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStress {
    pub vibration_idx: f64,
    pub wind_mph: f64,
    pub temp_delta_f: f64,
    pub humidity_delta_pct: f64,
}

impl EnvStress {
    /// Decay-rate multiplier, 1.0 under calm conditions. Each stressor
    /// past its threshold compounds multiplicatively.
    pub fn multiplier(&self, params: &DecayParams) -> f64 {
        let mut m = 1.0;
        if self.vibration_idx > params.vibration_threshold {
            m *= 1.0 + 1.0 * self.vibration_idx;
        }
        if self.wind_mph > params.wind_threshold_mph {
            m *= 1.0 + 0.5 * (self.wind_mph / 30.0).min(1.0);
        }
        if self.temp_delta_f.abs() > params.temp_delta_threshold_f {
            m *= 1.0 + 0.3 * (self.temp_delta_f.abs() / 15.0).min(1.0);
        }
        if self.humidity_delta_pct.abs() > params.humidity_delta_threshold_pct {
            m *= 1.0 + 0.2 * (self.humidity_delta_pct.abs() / 30.0).min(1.0);
        }
        m
    }
}

/// Fraction of anchor confidence remaining after `elapsed` under the
/// given stress multiplier.
pub fn decay_factor(params: &DecayParams, stress_multiplier: f64, elapsed: Duration) -> f64 {
    let half_life_secs = params.half_life_minutes * 60.0;
    if half_life_secs <= 0.0 {
        return 1.0;
    }
    let rate = LN_2 / half_life_secs;
    (-rate * stress_multiplier * elapsed.as_secs_f64()).exp()
}

/// Anchor confidence decayed over `elapsed`, clamped at the floor.
pub fn decayed_confidence(
    params: &DecayParams,
    anchor_confidence: f64,
    stress_multiplier: f64,
    elapsed: Duration,
) -> f64 {
    let decayed = anchor_confidence * decay_factor(params, stress_multiplier, elapsed);
    decayed.max(params.floor)
}
