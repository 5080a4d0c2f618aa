//! Calibration confidence decay and drift tracking.

pub mod decay;
pub mod tracker;

pub use decay::{decay_factor, decayed_confidence, DecayParams, EnvStress};
pub use tracker::{
    recalibration_needed, CalAction, CalThresholds, CalibrationShiftEvent, CalibrationSnapshot,
    CalibrationTracker,
};
