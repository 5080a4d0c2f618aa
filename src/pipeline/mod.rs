//! Async pipeline assembly.
//!
//! Topology: a router task owns the watermark registry and fans events
//! out to per-entity workers (pitch streams) and per-venue tasks
//! (environment and calibration streams). Workers read venue state
//! through a watch channel, so no locks are shared across partitions;
//! one slow entity cannot block another. Everything the pipeline
//! produces funnels into a single output channel.
//!
//! The venue view a worker reads is a published snapshot, not the stream
//! head; in wall-clock mode it can trail by an event. Event-driven mode
//! serializes venue updates ahead of worker ticks so replays reproduce
//! byte-identical output.

pub mod runtime;
pub mod venue;
pub mod worker;

pub use runtime::ReadinessPipeline;
pub use venue::{VenueMsg, VenueSnapshot};
pub use worker::{EntityWorker, TickContext, WorkerMsg};

use crate::calibration::CalibrationShiftEvent;
use crate::core::snapshot::FeatureSnapshot;
use crate::scoring::{Alert, ReadinessInference};

/// Everything the pipeline emits downstream.
#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Snapshot(FeatureSnapshot),
    Inference(ReadinessInference),
    Alert(Alert),
    CalibrationShift(CalibrationShiftEvent),
}
