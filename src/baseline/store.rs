//! Per-pitcher baseline norms.
//!
//! Baselines are produced offline from multi-season history and loaded
//! here as a read-only table keyed by (pitcher, metric). The table is
//! published to workers through a watch channel as an immutable `Arc`
//! snapshot; a refresh failure keeps the previous table in place.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Long-term and current-season norms for one (pitcher, metric) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineNorm {
    pub long_term_mean: f64,
    pub long_term_sd: f64,
    pub season_mean: f64,
    pub season_sd: f64,
    pub season_label: String,
    pub n_samples: u64,
    pub update_ts: DateTime<Utc>,
}

/// One row of the persisted baseline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub pitcher_id: String,
    pub metric: String,
    #[serde(flatten)]
    pub norm: BaselineNorm,
}

/// On-disk baseline format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineFile {
    pub generated_ts: DateTime<Utc>,
    pub season_label: String,
    pub norms: Vec<BaselineRecord>,
}

/// In-memory lookup table. Built once per load, never mutated after.
///
/// Norms are nested per pitcher so `get` can borrow both key levels
/// without allocating on the per-snapshot path.
#[derive(Debug, Default)]
pub struct BaselineTable {
    norms: HashMap<String, HashMap<String, BaselineNorm>>,
    generated_ts: Option<DateTime<Utc>>,
}

impl BaselineTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_file(file: BaselineFile) -> Self {
        let mut norms: HashMap<String, HashMap<String, BaselineNorm>> = HashMap::new();
        for record in file.norms {
            norms
                .entry(record.pitcher_id)
                .or_default()
                .insert(record.metric, record.norm);
        }
        Self {
            norms,
            generated_ts: Some(file.generated_ts),
        }
    }

    pub fn get(&self, pitcher_id: &str, metric: &str) -> Option<&BaselineNorm> {
        self.norms.get(pitcher_id)?.get(metric)
    }

    pub fn len(&self) -> usize {
        self.norms.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    pub fn generated_ts(&self) -> Option<DateTime<Utc>> {
        self.generated_ts
    }
}

/// Load a baseline file from disk.
pub fn load(path: &Path) -> Result<BaselineTable> {
    let contents = std::fs::read_to_string(path)?;
    let file: BaselineFile = serde_json::from_str(&contents)?;
    Ok(BaselineTable::from_file(file))
}

/// Persist a baseline file, creating parent directories as needed.
pub fn save(path: &Path, file: &BaselineFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(file)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Handle for the shared, hot-swappable table.
pub type SharedBaselines = watch::Receiver<Arc<BaselineTable>>;

/// Load the initial table and start the periodic re-read task.
///
/// Returns the receiver workers clone. A missing file at startup is an
/// error; a failed refresh later only logs and keeps the old table.
pub fn start_refresh(
    path: PathBuf,
    every: std::time::Duration,
) -> Result<(SharedBaselines, tokio::task::JoinHandle<()>)> {
    let initial = load(&path).map_err(|e| {
        PipelineError::Config(format!("baseline file {}: {}", path.display(), e))
    })?;
    debug!(
        norms = initial.len(),
        generated = ?initial.generated_ts(),
        path = %path.display(),
        "loaded baselines"
    );
    let (tx, rx) = watch::channel(Arc::new(initial));

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match load(&path) {
                Ok(table) => {
                    debug!(norms = table.len(), generated = ?table.generated_ts(), "refreshed baselines");
                    if tx.send(Arc::new(table)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "baseline refresh failed, keeping previous table");
                }
            }
        }
    });

    Ok((rx, handle))
}

/// A static receiver around one fixed table, for replay and tests.
///
/// The sender is dropped immediately; receivers can still borrow the
/// last published value.
pub fn fixed_baselines(table: BaselineTable) -> SharedBaselines {
    let (_tx, rx) = watch::channel(Arc::new(table));
    rx
}

// ============================================================
// Synthetic seeding
// ============================================================

/// (pitcher_id, display name, four-seam velo, four-seam spin)
const SEED_ROSTER: [(&str, &str, f64, f64); 8] = [
    ("STL_656427", "Ryan Helsley", 99.2, 2450.0),
    ("STL_571945", "Jordan Hicks", 100.3, 2180.0),
    ("STL_642547", "Jordan Montgomery", 93.3, 2140.0),
    ("STL_657053", "Andre Pallante", 95.1, 2380.0),
    ("STL_676710", "Matthew Liberatore", 93.2, 2190.0),
    ("STL_668881", "Genesis Cabrera", 96.8, 2310.0),
    ("STL_621111", "Miles Mikolas", 93.8, 2210.0),
    ("STL_592836", "Steven Matz", 94.0, 2160.0),
];

/// Per-metric plausible long-term standard deviations.
fn seed_sd(metric: &str) -> f64 {
    match metric {
        "release_speed_mph" => 0.9,
        "spin_rate_rpm" => 85.0,
        "spin_axis_deg" => 6.5,
        "extension_ft" => 0.16,
        "release_pos_z_ft" => 0.09,
        "vbreak_in" => 1.3,
        "hbreak_in" => 1.2,
        "plate_x_ft" => 0.55,
        "plate_z_ft" => 0.6,
        _ => 1.0,
    }
}

fn seed_mean(metric: &str, velo: f64, spin: f64) -> f64 {
    match metric {
        "release_speed_mph" => velo,
        "spin_rate_rpm" => spin,
        "spin_axis_deg" => 212.0,
        "extension_ft" => 6.6,
        "release_pos_z_ft" => 6.1,
        "vbreak_in" => 14.8,
        "hbreak_in" => 8.4,
        "plate_x_ft" => 0.0,
        "plate_z_ft" => 2.5,
        _ => 0.0,
    }
}

/// Build a deterministic synthetic baseline file for demos and tests.
pub fn seed_synthetic(seed: u64, season_label: &str) -> BaselineFile {
    let mut rng = StdRng::seed_from_u64(seed);
    let generated_ts = Utc::now();
    let metrics = [
        "release_speed_mph",
        "spin_rate_rpm",
        "spin_axis_deg",
        "extension_ft",
        "release_pos_z_ft",
        "vbreak_in",
        "hbreak_in",
        "plate_x_ft",
        "plate_z_ft",
    ];

    let mut norms = Vec::with_capacity(SEED_ROSTER.len() * metrics.len());
    for (pitcher_id, _name, velo, spin) in SEED_ROSTER {
        for metric in metrics {
            let mean = seed_mean(metric, velo, spin);
            let sd = seed_sd(metric);
            // Season runs a touch off the career line.
            let season_drift = rng.gen_range(-0.4..0.4) * sd;
            norms.push(BaselineRecord {
                pitcher_id: pitcher_id.to_string(),
                metric: metric.to_string(),
                norm: BaselineNorm {
                    long_term_mean: mean,
                    long_term_sd: sd,
                    season_mean: mean + season_drift,
                    season_sd: sd * rng.gen_range(0.85..1.1),
                    season_label: season_label.to_string(),
                    n_samples: rng.gen_range(400..2400),
                    update_ts: generated_ts,
                },
            });
        }
    }

    BaselineFile {
        generated_ts,
        season_label: season_label.to_string(),
        norms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_covers_roster_metrics() {
        let file = seed_synthetic(42, "2026");
        assert_eq!(file.norms.len(), 8 * 9);
        let table = BaselineTable::from_file(file);
        let norm = table.get("STL_656427", "release_speed_mph").unwrap();
        assert!((norm.long_term_mean - 99.2).abs() < 1e-9);
        assert_eq!(norm.season_label, "2026");
        assert!(norm.long_term_sd > 0.0);

        // The staff roster covers relievers and the rotation.
        let hicks = table.get("STL_571945", "release_speed_mph").unwrap();
        assert!((hicks.long_term_mean - 100.3).abs() < 1e-9);
        let mikolas = table.get("STL_621111", "release_speed_mph").unwrap();
        assert!((mikolas.long_term_mean - 93.8).abs() < 1e-9);
        assert!(table.get("STL_592836", "plate_z_ft").is_some());
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = seed_synthetic(7, "2026");
        let b = seed_synthetic(7, "2026");
        for (x, y) in a.norms.iter().zip(b.norms.iter()) {
            assert_eq!(x.pitcher_id, y.pitcher_id);
            assert_eq!(x.metric, y.metric);
            assert_eq!(x.norm.season_mean, y.norm.season_mean);
            assert_eq!(x.norm.n_samples, y.norm.n_samples);
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = std::env::temp_dir().join("readiness-baseline-test");
        let path = dir.join("norms.json");
        let file = seed_synthetic(11, "2026");
        save(&path, &file).unwrap();
        let table = load(&path).unwrap();
        assert_eq!(table.len(), file.norms.len());
        assert!(table.get("STL_571945", "spin_rate_rpm").is_some());
        assert!(table.get("STL_571945", "unknown_metric").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_pitcher_is_none() {
        let table = BaselineTable::empty();
        assert!(table.get("STL_000000", "release_speed_mph").is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_publishes_rewritten_file() {
        let dir = std::env::temp_dir().join(format!("readiness-refresh-{}", uuid::Uuid::new_v4()));
        let path = dir.join("norms.json");
        let mut file = seed_synthetic(3, "2026");
        save(&path, &file).unwrap();

        let (mut rx, handle) =
            start_refresh(path.clone(), std::time::Duration::from_secs(60)).unwrap();
        let initial = rx.borrow().get("STL_656427", "release_speed_mph").unwrap().long_term_mean;
        assert!((initial - 99.2).abs() < 1e-9);

        // An offline re-run lowers the velo norm; the next re-read must
        // publish the new table through the watch channel.
        for record in &mut file.norms {
            if record.pitcher_id == "STL_656427" && record.metric == "release_speed_mph" {
                record.norm.long_term_mean = 97.0;
            }
        }
        save(&path, &file).unwrap();

        rx.changed().await.unwrap();
        let swapped = rx.borrow_and_update().get("STL_656427", "release_speed_mph").unwrap().long_term_mean;
        assert!((swapped - 97.0).abs() < 1e-9);

        handle.abort();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_previous_table() {
        let dir = std::env::temp_dir().join(format!("readiness-refresh-{}", uuid::Uuid::new_v4()));
        let path = dir.join("norms.json");
        let file = seed_synthetic(5, "2026");
        save(&path, &file).unwrap();

        let (rx, handle) =
            start_refresh(path.clone(), std::time::Duration::from_secs(60)).unwrap();
        std::fs::write(&path, "not json").unwrap();

        // Several refresh attempts come and go against the corrupt file.
        tokio::time::sleep(std::time::Duration::from_secs(200)).await;

        assert!(!rx.has_changed().unwrap());
        let table = rx.borrow();
        assert_eq!(table.len(), file.norms.len());
        assert!(table.get("STL_621111", "spin_rate_rpm").is_some());
        drop(table);

        handle.abort();
        std::fs::remove_dir_all(&dir).ok();
    }
}
