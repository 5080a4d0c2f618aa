//! Feature computation core.
//!
//! Rolling windows, per-entity metric state, and versioned snapshot
//! assembly. Everything here is synchronous and owned by a single
//! worker; the async boundaries live in [`crate::pipeline`].

pub mod features;
pub mod snapshot;
pub mod window;

pub use features::{
    ContributionLineage, EntityWindowState, MetricFrame, PitchMetric, QaSummary, WindowSet,
};
pub use snapshot::{
    AssemblyInputs, FeatureContract, FeatureId, FeatureSnapshot, ProducerInfo, SnapshotAssembler,
};
pub use window::{RollingWindow, WindowAggregate, WindowBound, WindowSpec};
