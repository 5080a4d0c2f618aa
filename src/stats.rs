//! Pipeline run ledger.
//!
//! Counts what flowed through the pipeline this session without storing
//! any event payloads. Counters are atomics so the runtime, venue tasks,
//! and the output loop can all record against one shared ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current pipeline session.
#[derive(Debug)]
pub struct PipelineStats {
    /// Pitch samples ingested
    pitch_events: AtomicU64,
    /// Environment observations ingested
    env_events: AtomicU64,
    /// Calibration status events ingested
    cal_events: AtomicU64,
    /// Events that arrived behind their partition watermark
    late_events: AtomicU64,
    /// Events excluded from aggregates by the quality floor
    gated_events: AtomicU64,
    /// Feature snapshots emitted across all contracts
    snapshots_emitted: AtomicU64,
    /// Readiness inferences emitted
    inferences_emitted: AtomicU64,
    /// Alerts emitted
    alerts_emitted: AtomicU64,
    /// Calibration action transitions recorded
    calibration_shifts: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            pitch_events: AtomicU64::new(0),
            env_events: AtomicU64::new(0),
            cal_events: AtomicU64::new(0),
            late_events: AtomicU64::new(0),
            gated_events: AtomicU64::new(0),
            snapshots_emitted: AtomicU64::new(0),
            inferences_emitted: AtomicU64::new(0),
            alerts_emitted: AtomicU64::new(0),
            calibration_shifts: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a ledger that persists across runs at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            eprintln!("Note: Could not load previous pipeline stats: {e}");
        }

        stats
    }

    pub fn record_pitch_event(&self) {
        self.pitch_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_env_event(&self) {
        self.env_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cal_event(&self) {
        self.cal_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_event(&self) {
        self.late_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gated_event(&self) {
        self.gated_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshots_emitted(&self, count: u64) {
        self.snapshots_emitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_inference_emitted(&self) {
        self.inferences_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_emitted(&self) {
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_calibration_shift(&self) {
        self.calibration_shifts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current counter values.
    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            pitch_events: self.pitch_events.load(Ordering::Relaxed),
            env_events: self.env_events.load(Ordering::Relaxed),
            cal_events: self.cal_events.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            gated_events: self.gated_events.load(Ordering::Relaxed),
            snapshots_emitted: self.snapshots_emitted.load(Ordering::Relaxed),
            inferences_emitted: self.inferences_emitted.load(Ordering::Relaxed),
            alerts_emitted: self.alerts_emitted.load(Ordering::Relaxed),
            calibration_shifts: self.calibration_shifts.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds() as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Pitch samples ingested: {}\n\
             - Environment observations: {}\n\
             - Calibration status events: {}\n\
             - Late arrivals: {}\n\
             - Quality-gated events: {}\n\
             - Feature snapshots emitted: {}\n\
             - Readiness inferences emitted: {}\n\
             - Alerts emitted: {}\n\
             - Calibration shifts: {}\n\
             - Session duration: {} seconds",
            stats.pitch_events,
            stats.env_events,
            stats.cal_events,
            stats.late_events,
            stats.gated_events,
            stats.snapshots_emitted,
            stats.inferences_emitted,
            stats.alerts_emitted,
            stats.calibration_shifts,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                pitch_events: stats.pitch_events,
                env_events: stats.env_events,
                cal_events: stats.cal_events,
                late_events: stats.late_events,
                gated_events: stats.gated_events,
                snapshots_emitted: stats.snapshots_emitted,
                inferences_emitted: stats.inferences_emitted,
                alerts_emitted: stats.alerts_emitted,
                calibration_shifts: stats.calibration_shifts,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.pitch_events
                    .store(persisted.pitch_events, Ordering::Relaxed);
                self.env_events.store(persisted.env_events, Ordering::Relaxed);
                self.cal_events.store(persisted.cal_events, Ordering::Relaxed);
                self.late_events
                    .store(persisted.late_events, Ordering::Relaxed);
                self.gated_events
                    .store(persisted.gated_events, Ordering::Relaxed);
                self.snapshots_emitted
                    .store(persisted.snapshots_emitted, Ordering::Relaxed);
                self.inferences_emitted
                    .store(persisted.inferences_emitted, Ordering::Relaxed);
                self.alerts_emitted
                    .store(persisted.alerts_emitted, Ordering::Relaxed);
                self.calibration_shifts
                    .store(persisted.calibration_shifts, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub pitch_events: u64,
    pub env_events: u64,
    pub cal_events: u64,
    pub late_events: u64,
    pub gated_events: u64,
    pub snapshots_emitted: u64,
    pub inferences_emitted: u64,
    pub alerts_emitted: u64,
    pub calibration_shifts: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    pitch_events: u64,
    env_events: u64,
    cal_events: u64,
    late_events: u64,
    gated_events: u64,
    snapshots_emitted: u64,
    inferences_emitted: u64,
    alerts_emitted: u64,
    calibration_shifts: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared ledger.
pub type SharedStats = Arc<PipelineStats>;

/// Create a new shared ledger.
pub fn create_shared_stats() -> SharedStats {
    Arc::new(PipelineStats::new())
}

/// Create a new shared ledger with persistence.
pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(PipelineStats::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counting() {
        let stats = PipelineStats::new();

        stats.record_pitch_event();
        stats.record_pitch_event();
        stats.record_late_event();
        stats.record_snapshots_emitted(2);

        let snapshot = stats.stats();
        assert_eq!(snapshot.pitch_events, 2);
        assert_eq!(snapshot.late_events, 1);
        assert_eq!(snapshot.snapshots_emitted, 2);
        assert_eq!(snapshot.env_events, 0);
    }

    #[test]
    fn test_summary_format() {
        let stats = PipelineStats::new();
        let summary = stats.summary();

        assert!(summary.contains("Pitch samples ingested"));
        assert!(summary.contains("Late arrivals"));
        assert!(summary.contains("Readiness inferences emitted"));
    }
}
