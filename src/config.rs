//! Configuration for the readiness pipeline.

use crate::calibration::{CalThresholds, DecayParams};
use crate::core::snapshot::FeatureContract;
use crate::core::window::WindowSpec;
use crate::core::WindowSet;
use crate::environment::{AdjustmentParams, VenueProfile};
use crate::error::{PipelineError, Result};
use crate::ingest::types::SourceKind;
use crate::scoring::health::HealthThresholds;
use crate::scoring::inference::ScoringModel;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Venues the pipeline tracks
    pub venues: Vec<VenueProfile>,

    /// Allowed lateness per source stream
    pub lateness: LatenessConfig,

    /// A partition with no events for this long is stalled
    #[serde(with = "duration_serde")]
    pub stall_timeout: Duration,

    /// Rolling window shapes, referenced by name from the contracts
    pub windows: Vec<WindowSpecConfig>,

    /// Events below this quality are excluded from aggregates
    pub quality_floor: f64,

    /// When snapshots are produced
    pub tick: TickConfig,

    /// Calibration decay curve and action thresholds
    pub calibration: CalibrationConfig,

    /// Environmental adjustment coefficients and freshness
    pub environment: EnvironmentConfig,

    /// Active feature contract versions, emitted side by side
    pub contracts: Vec<String>,

    /// Scoring model version to run
    pub model_version: String,

    /// Health classification cutoffs
    pub health: HealthThresholds,

    /// Suppress repeat alerts of one kind per entity within this window
    #[serde(with = "duration_serde")]
    pub alert_dedup: Duration,

    /// Baseline store location and refresh cadence
    pub baseline: BaselineConfig,

    /// Whether ticks follow the wall clock or the event stream
    pub clock: ClockMode,

    /// Path for exporting snapshots and inferences
    pub export_path: PathBuf,

    /// Path for storing state and the run ledger
    pub data_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("readiness-pipeline");

        Self {
            venues: vec![VenueProfile::default()],
            lateness: LatenessConfig::default(),
            stall_timeout: Duration::from_secs(60),
            windows: vec![
                WindowSpecConfig::count("short", 5),
                WindowSpecConfig::count("medium", 20),
                WindowSpecConfig::time("session", 30),
            ],
            quality_floor: 0.5,
            tick: TickConfig::default(),
            calibration: CalibrationConfig::default(),
            environment: EnvironmentConfig::default(),
            contracts: vec![
                "pitcher_readiness.v1".to_string(),
                "pitcher_readiness.v2".to_string(),
            ],
            model_version: "pitcher_readiness_score.v2".to_string(),
            health: HealthThresholds::default(),
            alert_dedup: Duration::from_secs(300),
            baseline: BaselineConfig {
                path: data_dir.join("baselines.json"),
                refresh: Duration::from_secs(300),
            },
            clock: ClockMode::WallClock,
            export_path: data_dir.join("exports"),
            data_path: data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("readiness-pipeline")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.export_path)?;
        std::fs::create_dir_all(&self.data_path)?;
        Ok(())
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    pub fn venue(&self, venue_id: &str) -> Option<&VenueProfile> {
        self.venues.iter().find(|v| v.venue_id == venue_id)
    }

    /// Compile the window declarations, rejecting malformed ones.
    pub fn window_set(&self) -> Result<WindowSet> {
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.windows.len());
        for w in &self.windows {
            if w.name.is_empty() {
                return Err(PipelineError::InvalidWindowSpec {
                    name: "<unnamed>".to_string(),
                    reason: "window name is empty".to_string(),
                });
            }
            if !seen.insert(w.name.clone()) {
                return Err(PipelineError::InvalidWindowSpec {
                    name: w.name.clone(),
                    reason: "duplicate window name".to_string(),
                });
            }
            let spec = match (w.count, w.seconds) {
                (Some(count), None) if count >= 1 => WindowSpec::count(&w.name, count),
                (None, Some(seconds)) if seconds >= 1 => WindowSpec::time(&w.name, seconds as i64),
                (Some(_), Some(_)) => {
                    return Err(PipelineError::InvalidWindowSpec {
                        name: w.name.clone(),
                        reason: "window declares both a count and a time span".to_string(),
                    })
                }
                _ => {
                    return Err(PipelineError::InvalidWindowSpec {
                        name: w.name.clone(),
                        reason: "window needs a count >= 1 or a span >= 1s".to_string(),
                    })
                }
            };
            specs.push(spec);
        }
        Ok(WindowSet::new(specs))
    }

    /// Parse the active contract list.
    pub fn active_contracts(&self) -> Result<Vec<FeatureContract>> {
        self.contracts
            .iter()
            .map(|s| {
                FeatureContract::parse(s)
                    .ok_or_else(|| PipelineError::Config(format!("unknown feature contract: {s}")))
            })
            .collect()
    }

    /// Build the configured scoring model.
    pub fn scoring_model(&self) -> Result<ScoringModel> {
        ScoringModel::for_version(&self.model_version)
    }

    pub fn lateness_for(&self, source: SourceKind) -> Duration {
        match source {
            SourceKind::Tracking => Duration::from_secs(self.lateness.tracking_secs),
            SourceKind::Environment => Duration::from_secs(self.lateness.environment_secs),
            SourceKind::Calibration => Duration::from_secs(self.lateness.calibration_secs),
        }
    }

    /// Full startup validation: windows compile, contracts parse, and
    /// the model's required contract is active.
    pub fn validate(&self) -> Result<()> {
        if self.venues.is_empty() {
            return Err(PipelineError::Config("no venues configured".to_string()));
        }
        if !(0.0..=1.0).contains(&self.quality_floor) {
            return Err(PipelineError::Config(format!(
                "quality_floor {} outside 0..=1",
                self.quality_floor
            )));
        }
        let window_set = self.window_set()?;
        let contracts = self.active_contracts()?;
        if contracts.is_empty() {
            return Err(PipelineError::Config("no active contracts".to_string()));
        }
        // The contracts must find their window roles.
        crate::core::snapshot::SnapshotAssembler::new(
            contracts.clone(),
            &window_set,
            self.environment.adjustment.clone(),
            crate::core::snapshot::ProducerInfo::detect(),
        )?;
        let model = self.scoring_model()?;
        model.ensure_contract(&contracts)?;
        Ok(())
    }
}

/// Allowed lateness per source, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatenessConfig {
    pub tracking_secs: u64,
    pub environment_secs: u64,
    pub calibration_secs: u64,
}

impl Default for LatenessConfig {
    fn default() -> Self {
        Self {
            tracking_secs: 5,
            environment_secs: 10,
            calibration_secs: 10,
        }
    }
}

/// One rolling window declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSpecConfig {
    pub name: String,
    pub count: Option<usize>,
    pub seconds: Option<u64>,
}

impl WindowSpecConfig {
    pub fn count(name: &str, count: usize) -> Self {
        Self {
            name: name.to_string(),
            count: Some(count),
            seconds: None,
        }
    }

    pub fn time(name: &str, seconds: u64) -> Self {
        Self {
            name: name.to_string(),
            count: None,
            seconds: Some(seconds),
        }
    }
}

/// Snapshot cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickConfig {
    /// Tick after every tracking event
    pub per_event: bool,
    /// Additional fixed cadence, 0 disables it
    pub interval_secs: u64,
    /// Longest a tick waits for the watermark before forcing release
    pub max_wait_ms: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            per_event: true,
            interval_secs: 30,
            max_wait_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub decay: DecayParams,
    pub thresholds: CalThresholds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Observations older than this do not drive adjustment
    pub freshness_secs: u64,
    pub adjustment: AdjustmentParams,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 120,
            adjustment: AdjustmentParams::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    pub path: PathBuf,
    #[serde(with = "duration_serde")]
    pub refresh: Duration,
}

/// What "now" means for ticks and decay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Live operation: the host clock drives ticks
    WallClock,
    /// Replay and simulation: the stream's own frontier drives ticks
    EventDriven,
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.quality_floor, 0.5);
        assert_eq!(config.lateness_for(SourceKind::Tracking), Duration::from_secs(5));
        assert_eq!(
            config.lateness_for(SourceKind::Environment),
            Duration::from_secs(10)
        );
        assert_eq!(config.clock, ClockMode::WallClock);
    }

    #[test]
    fn test_window_declarations_are_checked() {
        let mut config = Config::default();
        config.windows[0].seconds = Some(10);
        assert!(matches!(
            config.window_set(),
            Err(PipelineError::InvalidWindowSpec { .. })
        ));

        let mut config = Config::default();
        config.windows[0].count = None;
        assert!(config.window_set().is_err());

        let mut config = Config::default();
        config.windows[1].name = "short".to_string();
        assert!(config.window_set().is_err());

        let mut config = Config::default();
        config.windows[0].count = Some(0);
        assert!(config.window_set().is_err());
    }

    #[test]
    fn test_contracts_must_cover_model() {
        let mut config = Config::default();
        config.contracts = vec!["pitcher_readiness.v1".to_string()];
        // The v2 model cannot run on a v1-only feed.
        assert!(matches!(
            config.validate(),
            Err(PipelineError::ContractMismatch { .. })
        ));

        config.model_version = "pitcher_readiness_score.v1".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let mut config = Config::default();
        config.contracts.push("pitcher_readiness.v9".to_string());
        assert!(config.active_contracts().is_err());

        let mut config = Config::default();
        config.model_version = "not_a_model".to_string();
        assert!(matches!(
            config.scoring_model(),
            Err(PipelineError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_renamed_window_role_fails_validation() {
        let mut config = Config::default();
        config.windows[2].name = "long".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.windows.len(), 3);
        assert_eq!(parsed.stall_timeout, Duration::from_secs(60));
        assert_eq!(parsed.clock, ClockMode::WallClock);
        assert_eq!(parsed.venues[0].venue_id, "busch_iii");
    }
}
