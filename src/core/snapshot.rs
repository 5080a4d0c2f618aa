//! Versioned feature snapshot assembly.
//!
//! A snapshot is the pipeline's unit of output: the declared feature set
//! of one contract version, computed from one entity's windows at one
//! tick, stamped with QA metadata, lineage, and a content hash. Multiple
//! contract versions can be active at once so downstream models migrate
//! without a flag-day cutover.
//!
//! Contracts name windows by role (`short`, `medium`, `session`); the
//! configured window set must carry all three or startup fails.

use crate::baseline::BaselineTable;
use crate::core::features::{ContributionLineage, MetricFrame, PitchMetric, QaSummary, WindowSet};
use crate::environment::{adjust, AdjustmentParams, VenueProfile};
use crate::error::{PipelineError, Result};
use crate::ingest::types::EnvObservation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;
use uuid::Uuid;

/// Producer name stamped into every snapshot.
pub const PRODUCER_NAME: &str = "readiness-pipeline";

/// Window roles the contracts draw from.
pub const SHORT_WINDOW: &str = "short";
pub const MEDIUM_WINDOW: &str = "medium";
pub const SESSION_WINDOW: &str = "session";

// ============================================================
// Contracts
// ============================================================

/// Every feature any contract can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureId {
    VeloMeanShort,
    VeloDeltaLong,
    SpinMeanShort,
    SpinDeltaLong,
    ReleaseHeightSdMedium,
    CommandScatterMedium,
    ExtensionMeanShort,
    VeloTrendSession,
    SpinConsistencyMedium,
    VbreakAdjMeanShort,
    HbreakAdjMeanShort,
    SpinAxisSdMedium,
}

impl FeatureId {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureId::VeloMeanShort => "velo_mean_short",
            FeatureId::VeloDeltaLong => "velo_delta_long",
            FeatureId::SpinMeanShort => "spin_mean_short",
            FeatureId::SpinDeltaLong => "spin_delta_long",
            FeatureId::ReleaseHeightSdMedium => "release_height_sd_medium",
            FeatureId::CommandScatterMedium => "command_scatter_medium",
            FeatureId::ExtensionMeanShort => "extension_mean_short",
            FeatureId::VeloTrendSession => "velo_trend_session",
            FeatureId::SpinConsistencyMedium => "spin_consistency_medium",
            FeatureId::VbreakAdjMeanShort => "vbreak_adj_mean_short",
            FeatureId::HbreakAdjMeanShort => "hbreak_adj_mean_short",
            FeatureId::SpinAxisSdMedium => "spin_axis_sd_medium",
        }
    }
}

const READINESS_V1_FEATURES: [FeatureId; 7] = [
    FeatureId::VeloMeanShort,
    FeatureId::VeloDeltaLong,
    FeatureId::SpinMeanShort,
    FeatureId::SpinDeltaLong,
    FeatureId::ReleaseHeightSdMedium,
    FeatureId::CommandScatterMedium,
    FeatureId::ExtensionMeanShort,
];

const READINESS_V2_FEATURES: [FeatureId; 12] = [
    FeatureId::VeloMeanShort,
    FeatureId::VeloDeltaLong,
    FeatureId::SpinMeanShort,
    FeatureId::SpinDeltaLong,
    FeatureId::ReleaseHeightSdMedium,
    FeatureId::CommandScatterMedium,
    FeatureId::ExtensionMeanShort,
    FeatureId::VeloTrendSession,
    FeatureId::SpinConsistencyMedium,
    FeatureId::VbreakAdjMeanShort,
    FeatureId::HbreakAdjMeanShort,
    FeatureId::SpinAxisSdMedium,
];

/// A published feature-set version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureContract {
    ReadinessV1,
    ReadinessV2,
}

impl FeatureContract {
    pub const ALL: [FeatureContract; 2] = [FeatureContract::ReadinessV1, FeatureContract::ReadinessV2];

    pub fn version(&self) -> &'static str {
        match self {
            FeatureContract::ReadinessV1 => "pitcher_readiness.v1",
            FeatureContract::ReadinessV2 => "pitcher_readiness.v2",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.version() == s)
    }

    pub fn features(&self) -> &'static [FeatureId] {
        match self {
            FeatureContract::ReadinessV1 => &READINESS_V1_FEATURES,
            FeatureContract::ReadinessV2 => &READINESS_V2_FEATURES,
        }
    }
}

// ============================================================
// Snapshot schema
// ============================================================

/// Identity of the emitting process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub name: String,
    pub version: String,
    /// Fresh per process start
    pub instance_id: String,
    pub host: String,
}

impl ProducerInfo {
    pub fn detect() -> Self {
        Self {
            name: PRODUCER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: Uuid::new_v4().to_string(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
        }
    }
}

/// One contract's feature vector for one entity at one tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub pitcher_id: String,
    pub venue_id: String,
    pub contract_version: String,
    pub generated_ts: DateTime<Utc>,
    /// Feature name to value, ordered by name
    pub features: BTreeMap<String, f64>,
    pub qa: QaSummary,
    /// Break features were rescaled to venue reference conditions
    pub env_adjusted: bool,
    /// False when a tick was forced before the watermark caught up
    pub watermark_satisfied: bool,
    pub calibration_confidence: f64,
    /// Season label of the norms behind delta features, None when any
    /// needed norm was missing
    pub baseline_season: Option<String>,
    pub lineage: ContributionLineage,
    pub producer: ProducerInfo,
    /// Hex SHA-256 over identity and the ordered feature pairs
    pub content_hash: String,
}

// ============================================================
// Assembly
// ============================================================

/// Everything a tick hands the assembler.
pub struct AssemblyInputs<'a> {
    pub pitcher_id: &'a str,
    pub venue_id: &'a str,
    pub generated_ts: DateTime<Utc>,
    pub frame: &'a MetricFrame,
    pub qa: QaSummary,
    pub lineage: ContributionLineage,
    pub baselines: &'a BaselineTable,
    /// Latest observation, already freshness-filtered by the caller
    pub env: Option<&'a EnvObservation>,
    pub profile: &'a VenueProfile,
    pub calibration_confidence: f64,
    pub watermark_satisfied: bool,
}

/// Builds snapshots for every active contract.
pub struct SnapshotAssembler {
    contracts: Vec<FeatureContract>,
    adjustment: AdjustmentParams,
    producer: ProducerInfo,
    short_idx: usize,
    medium_idx: usize,
    session_idx: usize,
}

impl SnapshotAssembler {
    pub fn new(
        contracts: Vec<FeatureContract>,
        window_set: &WindowSet,
        adjustment: AdjustmentParams,
        producer: ProducerInfo,
    ) -> Result<Self> {
        let resolve = |name: &str| {
            window_set
                .index_of(name)
                .ok_or_else(|| PipelineError::InvalidWindowSpec {
                    name: name.to_string(),
                    reason: "window role required by the feature contracts is not configured"
                        .to_string(),
                })
        };
        Ok(Self {
            contracts,
            adjustment,
            producer,
            short_idx: resolve(SHORT_WINDOW)?,
            medium_idx: resolve(MEDIUM_WINDOW)?,
            session_idx: resolve(SESSION_WINDOW)?,
        })
    }

    pub fn contracts(&self) -> &[FeatureContract] {
        &self.contracts
    }

    pub fn producer(&self) -> &ProducerInfo {
        &self.producer
    }

    /// One snapshot per active contract.
    pub fn assemble(&self, inputs: &AssemblyInputs<'_>) -> Vec<FeatureSnapshot> {
        self.contracts
            .iter()
            .map(|contract| self.assemble_one(*contract, inputs))
            .collect()
    }

    fn assemble_one(
        &self,
        contract: FeatureContract,
        inputs: &AssemblyInputs<'_>,
    ) -> FeatureSnapshot {
        let mut features = BTreeMap::new();
        let mut baseline_season: Option<String> = None;
        let mut baseline_missing = false;
        let mut env_adjusted = false;

        for id in contract.features() {
            match self.feature_value(
                *id,
                inputs,
                &mut baseline_season,
                &mut baseline_missing,
                &mut env_adjusted,
            ) {
                Some(value) => {
                    features.insert(id.as_str().to_string(), value);
                }
                None => continue,
            }
        }

        let content_hash = content_hash(
            inputs.pitcher_id,
            inputs.generated_ts,
            contract.version(),
            &features,
        );

        FeatureSnapshot {
            pitcher_id: inputs.pitcher_id.to_string(),
            venue_id: inputs.venue_id.to_string(),
            contract_version: contract.version().to_string(),
            generated_ts: inputs.generated_ts,
            features,
            qa: inputs.qa,
            env_adjusted,
            watermark_satisfied: inputs.watermark_satisfied,
            calibration_confidence: inputs.calibration_confidence,
            baseline_season: if baseline_missing { None } else { baseline_season },
            lineage: inputs.lineage.clone(),
            producer: self.producer.clone(),
            content_hash,
        }
    }

    fn feature_value(
        &self,
        id: FeatureId,
        inputs: &AssemblyInputs<'_>,
        baseline_season: &mut Option<String>,
        baseline_missing: &mut bool,
        env_adjusted: &mut bool,
    ) -> Option<f64> {
        let mean = |metric: PitchMetric, idx: usize| {
            inputs.frame.aggregate(metric, idx).map(|a| a.mean)
        };
        let sd = |metric: PitchMetric, idx: usize| {
            inputs.frame.aggregate(metric, idx).map(|a| a.std_dev)
        };

        match id {
            FeatureId::VeloMeanShort => mean(PitchMetric::ReleaseSpeed, self.short_idx),
            FeatureId::SpinMeanShort => mean(PitchMetric::SpinRate, self.short_idx),
            FeatureId::ExtensionMeanShort => mean(PitchMetric::Extension, self.short_idx),
            FeatureId::ReleaseHeightSdMedium => sd(PitchMetric::ReleaseHeight, self.medium_idx),
            FeatureId::SpinAxisSdMedium => sd(PitchMetric::SpinAxis, self.medium_idx),
            FeatureId::VeloDeltaLong => {
                let current = mean(PitchMetric::ReleaseSpeed, self.short_idx)?;
                Some(self.delta_against_baseline(
                    current,
                    PitchMetric::ReleaseSpeed,
                    inputs,
                    baseline_season,
                    baseline_missing,
                ))
            }
            FeatureId::SpinDeltaLong => {
                let current = mean(PitchMetric::SpinRate, self.short_idx)?;
                Some(self.delta_against_baseline(
                    current,
                    PitchMetric::SpinRate,
                    inputs,
                    baseline_season,
                    baseline_missing,
                ))
            }
            FeatureId::CommandScatterMedium => {
                let x = inputs.frame.aggregate(PitchMetric::PlateX, self.medium_idx)?;
                let z = inputs.frame.aggregate(PitchMetric::PlateZ, self.medium_idx)?;
                Some((x.variance + z.variance).sqrt())
            }
            FeatureId::VeloTrendSession => {
                let short = mean(PitchMetric::ReleaseSpeed, self.short_idx)?;
                let session = mean(PitchMetric::ReleaseSpeed, self.session_idx)?;
                Some(short - session)
            }
            FeatureId::SpinConsistencyMedium => {
                let agg = inputs.frame.aggregate(PitchMetric::SpinRate, self.medium_idx)?;
                if agg.mean <= f64::EPSILON {
                    return None;
                }
                Some((1.0 - agg.std_dev / agg.mean).clamp(0.0, 1.0))
            }
            FeatureId::VbreakAdjMeanShort => {
                let raw = mean(PitchMetric::VerticalBreak, self.short_idx)?;
                Some(self.adjusted(raw, inputs, env_adjusted))
            }
            FeatureId::HbreakAdjMeanShort => {
                let raw = mean(PitchMetric::HorizontalBreak, self.short_idx)?;
                Some(self.adjusted(raw, inputs, env_adjusted))
            }
        }
    }

    /// Current minus long-term norm. Without a norm the raw aggregate
    /// stands in so the feature is still present, and the snapshot's
    /// `baseline_season` goes to None.
    fn delta_against_baseline(
        &self,
        current: f64,
        metric: PitchMetric,
        inputs: &AssemblyInputs<'_>,
        baseline_season: &mut Option<String>,
        baseline_missing: &mut bool,
    ) -> f64 {
        match inputs.baselines.get(inputs.pitcher_id, metric.as_str()) {
            Some(norm) => {
                if baseline_season.is_none() {
                    *baseline_season = Some(norm.season_label.clone());
                }
                current - norm.long_term_mean
            }
            None => {
                if !*baseline_missing {
                    warn!(
                        pitcher_id = inputs.pitcher_id,
                        metric = metric.as_str(),
                        "no baseline norm, emitting raw aggregate in place of delta"
                    );
                }
                *baseline_missing = true;
                current
            }
        }
    }

    fn adjusted(&self, raw: f64, inputs: &AssemblyInputs<'_>, env_adjusted: &mut bool) -> f64 {
        match inputs.env {
            Some(obs) => {
                *env_adjusted = true;
                adjust(raw, obs, inputs.profile, &self.adjustment)
            }
            None => raw,
        }
    }
}

// ============================================================
// Content hashing
// ============================================================

/// Hash of identity plus the ordered feature pairs. Equal inputs give
/// equal hashes, so re-emission after a replay is a no-op downstream.
pub fn content_hash(
    pitcher_id: &str,
    generated_ts: DateTime<Utc>,
    contract_version: &str,
    features: &BTreeMap<String, f64>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pitcher_id.as_bytes());
    hasher.update(b"|");
    hasher.update(generated_ts.timestamp_millis().to_be_bytes());
    hasher.update(b"|");
    hasher.update(contract_version.as_bytes());
    for (name, value) in features {
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_bits().to_be_bytes());
    }
    hex_digest(hasher.finalize().as_slice())
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
