//! Error taxonomy for the readiness pipeline.
//!
//! Recoverable stream conditions (late data, gated quality, missing
//! baselines, calibration drift) never surface here; they are absorbed into
//! snapshot and inference metadata. These variants are the hard failures:
//! configuration problems and structural faults that stop a partition.

use thiserror::Error;

/// Hard failures surfaced by the pipeline library.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration value or file.
    #[error("config error: {0}")]
    Config(String),

    /// The configured model requires a feature contract the assembler
    /// does not produce. Checked at startup, never per event.
    #[error("model {model} requires contract {required}, active contracts: {active:?}")]
    ContractMismatch {
        model: String,
        required: String,
        active: Vec<String>,
    },

    /// Requested model version is not registered.
    #[error("unknown model version: {0}")]
    UnknownModel(String),

    /// A window spec references a window shape that cannot be built.
    #[error("invalid window spec {name}: {reason}")]
    InvalidWindowSpec { name: String, reason: String },

    /// An input record that does not decode into the telemetry schema.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
