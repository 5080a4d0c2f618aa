//! Per-venue tracker task.
//!
//! Each venue gets one task owning its [`CalibrationTracker`] and the
//! most recent environment observation. Entity workers never touch the
//! tracker directly; they read a [`VenueSnapshot`] published through a
//! watch channel on every venue tick.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::calibration::{CalAction, CalThresholds, CalibrationSnapshot, CalibrationTracker, DecayParams};
use crate::ingest::{CalibrationStatus, EnvObservation};
use crate::pipeline::PipelineOutput;
use crate::scoring::Alert;
use crate::stats::SharedStats;

/// Venue state as seen by entity workers at a tick.
#[derive(Debug, Clone)]
pub struct VenueSnapshot {
    pub calibration: CalibrationSnapshot,
    /// Latest environment observation, freshness-unchecked. Workers
    /// decide per tick whether it is recent enough to use.
    pub env: Option<EnvObservation>,
}

/// Messages routed to a venue task.
#[derive(Debug)]
pub enum VenueMsg {
    Env(EnvObservation),
    Status(CalibrationStatus),
    /// Advance decay to `now` and publish a fresh snapshot. An ack, when
    /// requested, is sent after the publish so the sender can order a
    /// worker tick behind it.
    Tick {
        now: DateTime<Utc>,
        ack: Option<oneshot::Sender<()>>,
    },
    Drain(oneshot::Sender<()>),
}

/// Spawns the tracker task for one venue. The returned watch receiver
/// must be kept alive by the caller so publishes never fail before the
/// first worker subscribes.
pub fn spawn_venue(
    venue_id: String,
    decay: DecayParams,
    thresholds: CalThresholds,
    created_at: DateTime<Utc>,
    outputs: mpsc::Sender<PipelineOutput>,
    stats: SharedStats,
) -> (
    mpsc::Sender<VenueMsg>,
    watch::Receiver<VenueSnapshot>,
    JoinHandle<()>,
) {
    let tracker = CalibrationTracker::new(venue_id.clone(), decay, thresholds, created_at);
    let initial = VenueSnapshot {
        calibration: tracker.snapshot(),
        env: None,
    };
    let (snapshot_tx, snapshot_rx) = watch::channel(initial);
    let (tx, rx) = mpsc::channel(256);
    let task = tokio::spawn(run_venue(venue_id, tracker, rx, snapshot_tx, outputs, stats));
    (tx, snapshot_rx, task)
}

async fn run_venue(
    venue_id: String,
    mut tracker: CalibrationTracker,
    mut rx: mpsc::Receiver<VenueMsg>,
    snapshot_tx: watch::Sender<VenueSnapshot>,
    outputs: mpsc::Sender<PipelineOutput>,
    stats: SharedStats,
) {
    let mut latest_env: Option<EnvObservation> = None;
    while let Some(msg) = rx.recv().await {
        match msg {
            VenueMsg::Env(obs) => {
                // Out-of-order arrivals must not roll the view backwards.
                let newer = latest_env
                    .as_ref()
                    .map_or(true, |cur| obs.obs_ts >= cur.obs_ts);
                if newer {
                    tracker.observe_env(&obs);
                    latest_env = Some(obs);
                } else {
                    debug!(venue_id, obs_ts = %obs.obs_ts, "ignoring superseded observation");
                }
            }
            VenueMsg::Status(status) => {
                tracker.observe_status(&status);
            }
            VenueMsg::Tick { now, ack } => {
                let shift = tracker.tick(now);
                let published = VenueSnapshot {
                    calibration: tracker.snapshot(),
                    env: latest_env.clone(),
                };
                let _ = snapshot_tx.send(published);
                if let Some(shift) = shift {
                    let entered_alert = shift.current == CalAction::Alert;
                    let confidence = shift.confidence;
                    stats.record_calibration_shift();
                    if outputs
                        .send(PipelineOutput::CalibrationShift(shift))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    if entered_alert {
                        stats.record_alert_emitted();
                        let alert = Alert::calibration_critical(&venue_id, now, confidence);
                        if outputs.send(PipelineOutput::Alert(alert)).await.is_err() {
                            return;
                        }
                    }
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            VenueMsg::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }
    info!(venue_id, "venue tracker stopped");
}
