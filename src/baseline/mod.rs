//! Baseline norm storage and refresh.

pub mod store;

pub use store::{
    fixed_baselines, load, save, seed_synthetic, start_refresh, BaselineFile, BaselineNorm,
    BaselineRecord, BaselineTable, SharedBaselines,
};
