//! Versioned readiness scoring.
//!
//! A model version pins its feature contract, weights, and reference
//! constants; two deployments running the same model version over the
//! same snapshot produce the same inference. Degraded inputs lower
//! `score_confidence` and attach reason codes, they never suppress the
//! inference.

use crate::calibration::tracker::recalibration_needed;
use crate::core::snapshot::{FeatureContract, FeatureId, FeatureSnapshot};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

/// Term weights. A changed weight means a new model version.
const VELO_WEIGHT: f64 = 0.4;
const SPIN_WEIGHT: f64 = 0.25;
const MECH_WEIGHT: f64 = 0.2;
const CMD_WEIGHT: f64 = 0.15;

/// Deficit scales: the drop that saturates a term.
const VELO_DEFICIT_SCALE_MPH: f64 = 2.5;
const SPIN_DEFICIT_SCALE_RPM: f64 = 150.0;

/// Mechanics and command references for the elevation transform.
const RELEASE_SD_REFERENCE_FT: f64 = 0.08;
const RELEASE_SD_SCALE_FT: f64 = 0.12;
const SCATTER_REFERENCE_FT: f64 = 0.9;
const SCATTER_SCALE_FT: f64 = 0.6;

/// In-session velocity fade folded into the deficit (v2 only).
const TREND_DEFICIT_WEIGHT: f64 = 0.5;

/// Risk blend of overall fatigue and mechanical instability.
const RISK_FATIGUE_WEIGHT: f64 = 0.6;
const RISK_MECH_WEIGHT: f64 = 0.4;

const BAND_AVAILABLE_MIN: f64 = 75.0;
const BAND_MONITOR_MIN: f64 = 55.0;
const BAND_LIMITED_MIN: f64 = 35.0;

const LOW_QA_THRESHOLD: f64 = 0.7;
const HIGH_LATENCY_THRESHOLD: f64 = 0.3;
const CAL_DRIFT_THRESHOLD: f64 = 0.7;

/// Usage guidance derived from the readiness score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusBand {
    Available,
    Monitor,
    Limited,
    Shutdown,
}

impl StatusBand {
    pub fn from_score(readiness: f64) -> Self {
        if readiness >= BAND_AVAILABLE_MIN {
            StatusBand::Available
        } else if readiness >= BAND_MONITOR_MIN {
            StatusBand::Monitor
        } else if readiness >= BAND_LIMITED_MIN {
            StatusBand::Limited
        } else {
            StatusBand::Shutdown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusBand::Available => "AVAILABLE",
            StatusBand::Monitor => "MONITOR",
            StatusBand::Limited => "LIMITED",
            StatusBand::Shutdown => "SHUTDOWN",
        }
    }
}

/// Why an inference should be read with care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    MissingFeatures,
    LowQa,
    HighLatency,
    CalibrationDrift,
    StaleSources,
    NoBaseline,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::MissingFeatures => "MISSING_FEATURES",
            ReasonCode::LowQa => "LOW_QA",
            ReasonCode::HighLatency => "HIGH_LATENCY",
            ReasonCode::CalibrationDrift => "CALIBRATION_DRIFT",
            ReasonCode::StaleSources => "STALE_SOURCES",
            ReasonCode::NoBaseline => "NO_BASELINE",
        }
    }
}

/// One term's contribution to the fatigue index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreDriver {
    pub name: String,
    /// Fatigue points attributed to this term
    pub contribution: f64,
    /// The feature value behind the term
    pub value: f64,
}

/// The scoring output for one snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessInference {
    pub pitcher_id: String,
    pub venue_id: String,
    pub generated_ts: DateTime<Utc>,
    pub model_version: String,
    pub contract_version: String,
    /// Content hash of the source snapshot
    pub snapshot_hash: String,
    pub readiness_score: f64,
    pub fatigue_index: f64,
    pub injury_risk: f64,
    pub band: StatusBand,
    pub reasons: Vec<ReasonCode>,
    /// Largest fatigue contributors, at most three
    pub drivers: Vec<ScoreDriver>,
    pub score_confidence: f64,
    pub needs_recalibration: bool,
    pub data_freshness_ms: i64,
}

/// Published model versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelVersion {
    V1,
    V2,
}

/// A pinned scoring model.
#[derive(Debug, Clone)]
pub struct ScoringModel {
    version: ModelVersion,
}

impl ScoringModel {
    pub fn for_version(version: &str) -> Result<Self> {
        match version {
            "pitcher_readiness_score.v1" => Ok(Self {
                version: ModelVersion::V1,
            }),
            "pitcher_readiness_score.v2" => Ok(Self {
                version: ModelVersion::V2,
            }),
            other => Err(PipelineError::UnknownModel(other.to_string())),
        }
    }

    pub fn version(&self) -> &'static str {
        match self.version {
            ModelVersion::V1 => "pitcher_readiness_score.v1",
            ModelVersion::V2 => "pitcher_readiness_score.v2",
        }
    }

    pub fn required_contract(&self) -> FeatureContract {
        match self.version {
            ModelVersion::V1 => FeatureContract::ReadinessV1,
            ModelVersion::V2 => FeatureContract::ReadinessV2,
        }
    }

    /// Startup check that the feature side publishes what this model
    /// consumes.
    pub fn ensure_contract(&self, active: &[FeatureContract]) -> Result<()> {
        let required = self.required_contract();
        if active.contains(&required) {
            return Ok(());
        }
        Err(PipelineError::ContractMismatch {
            model: self.version().to_string(),
            required: required.version().to_string(),
            active: active.iter().map(|c| c.version().to_string()).collect(),
        })
    }

    /// Score one snapshot. The snapshot must carry this model's
    /// contract; anything else is a wiring bug surfaced as an error.
    pub fn score(&self, snapshot: &FeatureSnapshot, now: DateTime<Utc>) -> Result<ReadinessInference> {
        let required = self.required_contract();
        if snapshot.contract_version != required.version() {
            return Err(PipelineError::ContractMismatch {
                model: self.version().to_string(),
                required: required.version().to_string(),
                active: vec![snapshot.contract_version.clone()],
            });
        }

        let feature = |id: FeatureId| snapshot.features.get(id.as_str()).copied();
        let mut missing = 0usize;
        let mut require = |id: FeatureId| -> Option<f64> {
            let v = feature(id);
            if v.is_none() {
                missing += 1;
            }
            v
        };

        // Term inputs. A missing feature zeroes its term and is reported.
        let velo_delta = require(FeatureId::VeloDeltaLong);
        let spin_delta = require(FeatureId::SpinDeltaLong);
        let release_sd = require(FeatureId::ReleaseHeightSdMedium);
        let scatter = require(FeatureId::CommandScatterMedium);
        let required_terms = 4usize;

        let mut velo_deficit = velo_delta.map_or(0.0, |d| (-d).max(0.0));
        if self.version == ModelVersion::V2 {
            if let Some(trend) = feature(FeatureId::VeloTrendSession) {
                velo_deficit += TREND_DEFICIT_WEIGHT * (-trend).max(0.0);
            }
        }
        let velo_term = saturate(velo_deficit / VELO_DEFICIT_SCALE_MPH);
        let spin_deficit = spin_delta.map_or(0.0, |d| (-d).max(0.0));
        let spin_term = saturate(spin_deficit / SPIN_DEFICIT_SCALE_RPM);
        let mech_term = release_sd
            .map_or(0.0, |sd| elevation(sd, RELEASE_SD_REFERENCE_FT, RELEASE_SD_SCALE_FT));
        let cmd_term =
            scatter.map_or(0.0, |s| elevation(s, SCATTER_REFERENCE_FT, SCATTER_SCALE_FT));

        let fatigue_index = (100.0
            * (VELO_WEIGHT * velo_term
                + SPIN_WEIGHT * spin_term
                + MECH_WEIGHT * mech_term
                + CMD_WEIGHT * cmd_term))
            .clamp(0.0, 100.0);
        let readiness_score = (100.0 - fatigue_index).clamp(0.0, 100.0);
        let injury_risk = saturate(
            RISK_FATIGUE_WEIGHT * fatigue_index / 100.0 + RISK_MECH_WEIGHT * mech_term,
        );

        let drivers = top_drivers(&[
            ("velo_deficit", VELO_WEIGHT * velo_term * 100.0, velo_deficit),
            ("spin_deficit", SPIN_WEIGHT * spin_term * 100.0, spin_deficit),
            (
                "release_height_instability",
                MECH_WEIGHT * mech_term * 100.0,
                release_sd.unwrap_or(0.0),
            ),
            (
                "command_scatter",
                CMD_WEIGHT * cmd_term * 100.0,
                scatter.unwrap_or(0.0),
            ),
        ]);

        // Reasons and confidence, both fed by the same degradations.
        let qa_min = snapshot.qa.feature_qa_min;
        let late_frac = snapshot.qa.late_data_frac;
        let mut reasons = Vec::new();
        if missing > 0 {
            reasons.push(ReasonCode::MissingFeatures);
        }
        if qa_min.map_or(true, |q| q < LOW_QA_THRESHOLD) {
            reasons.push(ReasonCode::LowQa);
        }
        if late_frac > HIGH_LATENCY_THRESHOLD {
            reasons.push(ReasonCode::HighLatency);
        }
        if snapshot.calibration_confidence < CAL_DRIFT_THRESHOLD {
            reasons.push(ReasonCode::CalibrationDrift);
        }
        if !snapshot.watermark_satisfied {
            reasons.push(ReasonCode::StaleSources);
        }
        if snapshot.baseline_season.is_none() {
            reasons.push(ReasonCode::NoBaseline);
        }

        let coverage = (required_terms - missing) as f64 / required_terms as f64;
        let qa_factor = qa_min.map_or(0.5, |q| q.clamp(0.0, 1.0));
        let late_factor = 1.0 - 0.5 * late_frac.clamp(0.0, 1.0);
        let cal_factor = snapshot.calibration_confidence.clamp(0.0, 1.0);
        let baseline_factor = if snapshot.baseline_season.is_some() {
            1.0
        } else {
            0.8
        };
        let freshness_factor = if snapshot.watermark_satisfied { 1.0 } else { 0.9 };
        let score_confidence = saturate(
            coverage * qa_factor * late_factor * cal_factor * baseline_factor * freshness_factor,
        );

        let needs_recalibration = recalibration_needed(
            snapshot.calibration_confidence,
            qa_min.unwrap_or(0.0),
            late_frac,
        );

        let data_freshness_ms = now
            .signed_duration_since(snapshot.lineage.last_event_ts)
            .num_milliseconds()
            .max(0);

        Ok(ReadinessInference {
            pitcher_id: snapshot.pitcher_id.clone(),
            venue_id: snapshot.venue_id.clone(),
            generated_ts: snapshot.generated_ts,
            model_version: self.version().to_string(),
            contract_version: snapshot.contract_version.clone(),
            snapshot_hash: snapshot.content_hash.clone(),
            readiness_score,
            fatigue_index,
            injury_risk,
            band: StatusBand::from_score(readiness_score),
            reasons,
            drivers,
            score_confidence,
            needs_recalibration,
            data_freshness_ms,
        })
    }
}

fn saturate(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// How far a value sits above its reference, as a 0..1 elevation of the
/// normal CDF. At the reference it is 0; one scale above it is ~0.68.
fn elevation(value: f64, reference: f64, scale: f64) -> f64 {
    let z = (value - reference) / scale;
    (2.0 * normal_cdf(z) - 1.0).clamp(0.0, 1.0)
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn top_drivers(terms: &[(&str, f64, f64)]) -> Vec<ScoreDriver> {
    let mut drivers: Vec<ScoreDriver> = terms
        .iter()
        .filter(|(_, contribution, _)| *contribution > 0.0)
        .map(|(name, contribution, value)| ScoreDriver {
            name: name.to_string(),
            contribution: *contribution,
            value: *value,
        })
        .collect();
    drivers.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));
    drivers.truncate(3);
    drivers
}
