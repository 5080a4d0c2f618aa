//! Readiness scoring and health alerting.

pub mod health;
pub mod inference;

pub use health::{Alert, AlertKind, HealthMonitor, HealthState, HealthThresholds, Severity};
pub use inference::{ReadinessInference, ReasonCode, ScoreDriver, ScoringModel, StatusBand};
