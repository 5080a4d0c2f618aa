//! Watermarked ingestion layer.
//!
//! Normalizes the tracking, environment, and calibration source streams
//! into one event abstraction and tracks a per source-partition watermark
//! so downstream windows know when event time has settled.

pub mod types;
pub mod watermark;

// Re-export commonly used types
pub use types::{
    CalibrationAction, CalibrationStatus, EnvObservation, PitchSample, PitchType,
    SourceKind, TelemetryEvent, TelemetryPayload,
};
pub use watermark::{PartitionClock, PartitionId, Watermark, WatermarkRegistry};
