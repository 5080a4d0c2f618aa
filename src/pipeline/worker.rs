//! Per-entity feature worker.
//!
//! One worker owns all windowed state for one pitcher. Pitches that
//! arrive on time sit in a hold buffer until the partition watermark
//! passes them, which restores event order before they touch the
//! windows. Late arrivals already missed that ordering, so they apply
//! immediately and the window layer decides how far back they still
//! count. Every tick releases what the watermark covers, assembles a
//! snapshot per active contract, scores the contract the model pins,
//! and runs the health monitor.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::baseline::{BaselineTable, SharedBaselines};
use crate::core::{AssemblyInputs, EntityWindowState, SnapshotAssembler, WindowSet};
use crate::environment::{observation_is_fresh, VenueProfile};
use crate::ingest::PitchSample;
use crate::pipeline::venue::VenueSnapshot;
use crate::pipeline::PipelineOutput;
use crate::scoring::{HealthMonitor, HealthThresholds, ScoringModel};
use crate::stats::SharedStats;

/// Frame of reference for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Event-time instant the emission is stamped with. Derived from the
    /// partition frontier, never the wall clock, so replaying a stream
    /// reproduces identical snapshots and content hashes.
    pub tick_ts: DateTime<Utc>,
    /// "Now" for freshness decisions: wall clock in wall-clock mode, the
    /// global frontier in event-driven mode.
    pub now: DateTime<Utc>,
    /// Wall clock at tick time. Only hold-duration checks use it.
    pub wall_now: DateTime<Utc>,
    /// Partition watermark, once enough has been seen to form one.
    pub watermark: Option<DateTime<Utc>>,
    /// Forced passes release held events regardless of the watermark.
    pub forced: bool,
}

/// One pitch routed to a worker.
#[derive(Debug, Clone)]
pub struct PitchArrival {
    pub sample: PitchSample,
    pub event_ts: DateTime<Utc>,
    pub quality: f64,
    pub is_late: bool,
    /// Router-assigned arrival sequence, tiebreak for equal timestamps.
    pub seq: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum WorkerMsg {
    Pitch(Box<PitchArrival>),
    Tick(TickContext),
    Drain {
        ctx: TickContext,
        ack: oneshot::Sender<()>,
    },
}

/// What one evaluation pass produced.
#[derive(Debug, Default)]
pub struct TickOutput {
    pub outputs: Vec<PipelineOutput>,
    /// Events applied during the pass that failed the quality floor.
    pub gated: u64,
}

/// Pipeline-wide pieces every worker is built from. The runtime holds
/// one of these and clones it per spawned entity.
#[derive(Clone)]
pub struct WorkerParams {
    pub window_set: WindowSet,
    pub quality_floor: f64,
    pub assembler: Arc<SnapshotAssembler>,
    pub model: Arc<ScoringModel>,
    pub health: HealthThresholds,
    pub alert_dedup: Duration,
    pub env_freshness: Duration,
    pub max_hold: Duration,
}

pub struct EntityWorker {
    state: EntityWindowState,
    pending: BTreeMap<(i64, u64), PitchArrival>,
    assembler: Arc<SnapshotAssembler>,
    model: Arc<ScoringModel>,
    monitor: HealthMonitor,
    profile: VenueProfile,
    env_freshness: Duration,
    max_hold: Duration,
    /// State changed since the last emission
    dirty: bool,
    last_emit: Option<DateTime<Utc>>,
    labeled_session: Option<String>,
}

impl EntityWorker {
    pub fn new(
        pitcher_id: impl Into<String>,
        venue_id: impl Into<String>,
        profile: VenueProfile,
        params: &WorkerParams,
    ) -> Self {
        Self {
            state: EntityWindowState::new(
                pitcher_id,
                venue_id,
                params.window_set.clone(),
                params.quality_floor,
            ),
            pending: BTreeMap::new(),
            assembler: Arc::clone(&params.assembler),
            model: Arc::clone(&params.model),
            monitor: HealthMonitor::new(params.health.clone(), params.alert_dedup),
            profile,
            env_freshness: params.env_freshness,
            max_hold: params.max_hold,
            dirty: false,
            last_emit: None,
            labeled_session: None,
        }
    }

    pub fn pitcher_id(&self) -> &str {
        self.state.pitcher_id()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Routes one arrival. On-time events wait in the hold buffer for
    /// the watermark; late events go straight into state. Returns how
    /// many applied events were quality-gated.
    pub fn handle_pitch(&mut self, arrival: PitchArrival) -> u64 {
        if self.labeled_session.as_deref() != Some(arrival.sample.session_id.as_str()) {
            let local_date = arrival
                .event_ts
                .with_timezone(&self.profile.timezone)
                .date_naive();
            info!(
                pitcher_id = self.state.pitcher_id(),
                session_id = %arrival.sample.session_id,
                session_date = %local_date,
                "session started"
            );
            self.labeled_session = Some(arrival.sample.session_id.clone());
        }
        if arrival.is_late {
            let disposition =
                self.state
                    .apply(&arrival.sample, arrival.event_ts, arrival.quality, true);
            self.dirty = true;
            if disposition.missed_windows > 0 {
                debug!(
                    pitcher_id = self.state.pitcher_id(),
                    pitch_id = arrival.sample.pitch_id,
                    missed = disposition.missed_windows,
                    "late pitch arrived past window coverage"
                );
            }
            return u64::from(!disposition.contributing);
        }
        let key = (arrival.event_ts.timestamp_millis(), arrival.seq);
        self.pending.insert(key, arrival);
        0
    }

    /// Runs one evaluation pass: release held events the watermark (or a
    /// forced pass) covers, then assemble and score.
    pub fn handle_tick(
        &mut self,
        ctx: &TickContext,
        venue: &VenueSnapshot,
        baselines: &BaselineTable,
    ) -> TickOutput {
        let mut out = TickOutput::default();
        let mut held_past_watermark = false;

        if let Some(mark) = ctx.watermark {
            let cutoff = mark.timestamp_millis();
            while let Some(entry) = self.pending.first_entry() {
                if entry.key().0 > cutoff {
                    break;
                }
                let arrival = entry.remove();
                out.gated += self.apply_released(&arrival);
            }
        }
        // Whatever remains is newer than the watermark. Forced passes
        // and overlong holds push it out anyway, flagged as incomplete.
        while let Some(entry) = self.pending.first_entry() {
            let overdue =
                ctx.wall_now.signed_duration_since(entry.get().received_at) > self.max_hold;
            if !ctx.forced && !overdue {
                break;
            }
            let arrival = entry.remove();
            out.gated += self.apply_released(&arrival);
            held_past_watermark = true;
        }
        let watermark_satisfied = !held_past_watermark;

        // A pass that applied nothing, landing on an already-published
        // tick, would re-emit an identical snapshot. Skip it.
        if !self.dirty && self.last_emit == Some(ctx.tick_ts) {
            return out;
        }

        let frame = match self.state.frame_at(ctx.tick_ts) {
            Some(frame) => frame,
            None => return out,
        };
        let lineage = match self.state.lineage() {
            Some(lineage) => lineage,
            None => return out,
        };
        let qa = self.state.qa_summary();
        let env = venue
            .env
            .as_ref()
            .filter(|obs| observation_is_fresh(obs, ctx.now, self.env_freshness));
        let inputs = AssemblyInputs {
            pitcher_id: self.state.pitcher_id(),
            venue_id: self.state.venue_id(),
            generated_ts: ctx.tick_ts,
            frame: &frame,
            qa,
            lineage,
            baselines,
            env,
            profile: &self.profile,
            calibration_confidence: venue.calibration.confidence,
            watermark_satisfied,
        };
        let snapshots = self.assembler.assemble(&inputs);

        out.outputs.reserve(snapshots.len() + 2);
        let scored_contract = self.model.required_contract().version();
        for snapshot in snapshots {
            let inference = if snapshot.contract_version == scored_contract {
                match self.model.score(&snapshot, ctx.now) {
                    Ok(inference) => Some(inference),
                    Err(err) => {
                        warn!(
                            pitcher_id = self.state.pitcher_id(),
                            error = %err,
                            "scoring failed"
                        );
                        None
                    }
                }
            } else {
                None
            };
            out.outputs.push(PipelineOutput::Snapshot(snapshot));
            if let Some(inference) = inference {
                out.outputs.push(PipelineOutput::Inference(inference));
            }
        }

        if let Some(alert) = self.monitor.observe(
            self.state.pitcher_id(),
            ctx.tick_ts,
            qa.feature_qa_min,
            qa.late_data_frac,
            venue.calibration.confidence,
        ) {
            out.outputs.push(PipelineOutput::Alert(alert));
        }

        self.dirty = false;
        self.last_emit = Some(ctx.tick_ts);
        out
    }

    fn apply_released(&mut self, arrival: &PitchArrival) -> u64 {
        let disposition =
            self.state
                .apply(&arrival.sample, arrival.event_ts, arrival.quality, false);
        self.dirty = true;
        u64::from(!disposition.contributing)
    }
}

/// Drives a worker from its channel until the router drops the sender.
pub async fn run_entity_worker(
    mut worker: EntityWorker,
    mut rx: mpsc::Receiver<WorkerMsg>,
    outputs: mpsc::Sender<PipelineOutput>,
    baselines: SharedBaselines,
    venue: watch::Receiver<VenueSnapshot>,
    stats: SharedStats,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WorkerMsg::Pitch(arrival) => {
                record_gated(&stats, worker.handle_pitch(*arrival));
            }
            WorkerMsg::Tick(ctx) => {
                let result = evaluate(&mut worker, &ctx, &baselines, &venue);
                if !forward(result, &outputs, &stats).await {
                    return;
                }
            }
            WorkerMsg::Drain { ctx, ack } => {
                let result = evaluate(&mut worker, &ctx, &baselines, &venue);
                let delivered = forward(result, &outputs, &stats).await;
                let _ = ack.send(());
                if !delivered {
                    return;
                }
            }
        }
    }
    debug!(pitcher_id = worker.pitcher_id(), "entity worker stopped");
}

fn evaluate(
    worker: &mut EntityWorker,
    ctx: &TickContext,
    baselines: &SharedBaselines,
    venue: &watch::Receiver<VenueSnapshot>,
) -> TickOutput {
    // Clone out of the watch cells; holding a borrow across the send
    // awaits below would block the publishers.
    let table: Arc<BaselineTable> = baselines.borrow().clone();
    let venue_state = venue.borrow().clone();
    worker.handle_tick(ctx, &venue_state, &table)
}

async fn forward(
    result: TickOutput,
    outputs: &mpsc::Sender<PipelineOutput>,
    stats: &SharedStats,
) -> bool {
    record_gated(stats, result.gated);
    for item in result.outputs {
        match &item {
            PipelineOutput::Snapshot(_) => stats.record_snapshots_emitted(1),
            PipelineOutput::Inference(_) => stats.record_inference_emitted(),
            PipelineOutput::Alert(_) => stats.record_alert_emitted(),
            PipelineOutput::CalibrationShift(_) => stats.record_calibration_shift(),
        }
        if outputs.send(item).await.is_err() {
            return false;
        }
    }
    true
}

fn record_gated(stats: &SharedStats, gated: u64) {
    for _ in 0..gated {
        stats.record_gated_event();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalAction, CalibrationSnapshot};
    use crate::core::snapshot::{FeatureContract, FeatureSnapshot, ProducerInfo};
    use crate::core::window::WindowSpec;
    use crate::environment::AdjustmentParams;
    use crate::ingest::{EnvObservation, PitchType};
    use crate::scoring::{ReadinessInference, ReasonCode};
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 12, 19, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn window_set() -> WindowSet {
        WindowSet::new(vec![
            WindowSpec::count("short", 5),
            WindowSpec::count("medium", 20),
            WindowSpec::time("session", 30),
        ])
    }

    fn params() -> WorkerParams {
        WorkerParams {
            window_set: window_set(),
            quality_floor: 0.5,
            assembler: Arc::new(
                SnapshotAssembler::new(
                    vec![FeatureContract::ReadinessV1, FeatureContract::ReadinessV2],
                    &window_set(),
                    AdjustmentParams::default(),
                    ProducerInfo::detect(),
                )
                .unwrap(),
            ),
            model: Arc::new(ScoringModel::for_version("pitcher_readiness_score.v2").unwrap()),
            health: HealthThresholds::default(),
            alert_dedup: Duration::seconds(300),
            env_freshness: Duration::seconds(120),
            max_hold: Duration::seconds(2),
        }
    }

    fn test_worker() -> EntityWorker {
        EntityWorker::new("STL_656427", "busch_iii", VenueProfile::default(), &params())
    }

    fn pitch(secs: i64, velo: f64) -> PitchSample {
        PitchSample {
            pitch_id: format!("p{secs}"),
            session_id: "app_0612".into(),
            pitcher_id: "STL_656427".into(),
            venue_id: "busch_iii".into(),
            pitch_type: PitchType::FourSeam,
            release_speed_mph: velo,
            spin_rate_rpm: 2400.0,
            spin_axis_deg: 210.0,
            extension_ft: 6.4,
            release_pos_x_ft: -1.8,
            release_pos_y_ft: 54.0,
            release_pos_z_ft: 5.9,
            vbreak_in: 15.5,
            hbreak_in: 7.0,
            plate_x_ft: 0.3,
            plate_z_ft: 2.4,
        }
    }

    fn arrival(secs: i64, velo: f64, quality: f64, is_late: bool, seq: u64) -> PitchArrival {
        PitchArrival {
            sample: pitch(secs, velo),
            event_ts: ts(secs),
            quality,
            is_late,
            seq,
            received_at: ts(secs),
        }
    }

    fn ctx(tick_secs: i64, watermark_secs: Option<i64>, forced: bool) -> TickContext {
        TickContext {
            tick_ts: ts(tick_secs),
            now: ts(tick_secs),
            wall_now: ts(tick_secs),
            watermark: watermark_secs.map(ts),
            forced,
        }
    }

    fn venue_ok() -> VenueSnapshot {
        VenueSnapshot {
            calibration: CalibrationSnapshot {
                venue_id: "busch_iii".into(),
                confidence: 0.95,
                action: CalAction::None,
                active_set: None,
                anchor_ts: ts(0),
            },
            env: None,
        }
    }

    fn snapshots(out: &TickOutput) -> Vec<&FeatureSnapshot> {
        out.outputs
            .iter()
            .filter_map(|o| match o {
                PipelineOutput::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn inferences(out: &TickOutput) -> Vec<&ReadinessInference> {
        out.outputs
            .iter()
            .filter_map(|o| match o {
                PipelineOutput::Inference(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_on_time_pitch_held_until_watermark() {
        let mut worker = test_worker();
        assert_eq!(worker.handle_pitch(arrival(0, 97.0, 0.9, false, 1)), 0);
        assert_eq!(worker.pending_len(), 1);

        // Watermark short of the event: nothing releases, nothing emits.
        let out = worker.handle_tick(&ctx(0, Some(-5), false), &venue_ok(), &BaselineTable::empty());
        assert!(out.outputs.is_empty());
        assert_eq!(worker.pending_len(), 1);

        // Watermark reaches the event: it contributes and emissions flow.
        let out = worker.handle_tick(&ctx(1, Some(0), false), &venue_ok(), &BaselineTable::empty());
        assert_eq!(worker.pending_len(), 0);
        let snaps = snapshots(&out);
        assert_eq!(snaps.len(), 2);
        assert!(snaps.iter().all(|s| s.watermark_satisfied));
        assert_eq!(snaps[0].features.get("velo_mean_short"), Some(&97.0));
    }

    #[test]
    fn test_forced_pass_releases_and_flags_incomplete() {
        let mut worker = test_worker();
        worker.handle_pitch(arrival(0, 97.0, 0.9, false, 1));

        let out = worker.handle_tick(&ctx(1, None, true), &venue_ok(), &BaselineTable::empty());
        assert_eq!(worker.pending_len(), 0);
        let snaps = snapshots(&out);
        assert!(snaps.iter().all(|s| !s.watermark_satisfied));
        let infs = inferences(&out);
        assert_eq!(infs.len(), 1);
        assert!(infs[0].reasons.contains(&ReasonCode::StaleSources));
    }

    #[test]
    fn test_overdue_hold_releases_without_watermark() {
        let mut worker = test_worker();
        worker.handle_pitch(arrival(0, 97.0, 0.9, false, 1));

        // 1s after arrival: still within the hold allowance.
        let out = worker.handle_tick(&ctx(1, None, false), &venue_ok(), &BaselineTable::empty());
        assert!(out.outputs.is_empty());
        assert_eq!(worker.pending_len(), 1);

        // 10s after arrival: past max_hold, released as incomplete.
        let out = worker.handle_tick(&ctx(10, None, false), &venue_ok(), &BaselineTable::empty());
        assert_eq!(worker.pending_len(), 0);
        assert!(snapshots(&out).iter().all(|s| !s.watermark_satisfied));
    }

    #[test]
    fn test_late_pitch_bypasses_hold_buffer() {
        let mut worker = test_worker();
        assert_eq!(worker.handle_pitch(arrival(0, 96.0, 0.9, true, 1)), 0);
        assert_eq!(worker.pending_len(), 0);

        let out = worker.handle_tick(&ctx(5, Some(1), false), &venue_ok(), &BaselineTable::empty());
        let snaps = snapshots(&out);
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].watermark_satisfied);
        assert!((snaps[0].qa.late_data_frac - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_gated_pitch_accounted_but_not_windowed() {
        let mut worker = test_worker();
        worker.handle_pitch(arrival(0, 97.0, 0.95, false, 1));
        let gated = worker.handle_pitch(arrival(1, 55.0, 0.2, true, 2));
        assert_eq!(gated, 1);

        let out = worker.handle_tick(&ctx(10, Some(5), false), &venue_ok(), &BaselineTable::empty());
        let snaps = snapshots(&out);
        assert_eq!(snaps[0].features.get("velo_mean_short"), Some(&97.0));
        assert!((snaps[0].qa.late_data_frac - 0.5).abs() < 1e-9);
        assert_eq!(snaps[0].qa.feature_qa_min, Some(0.95));
    }

    #[test]
    fn test_scores_only_the_pinned_contract() {
        let mut worker = test_worker();
        for i in 0..5 {
            worker.handle_pitch(arrival(i, 97.0 + i as f64 * 0.1, 0.9, false, i as u64 + 1));
        }
        let out = worker.handle_tick(&ctx(10, Some(5), false), &venue_ok(), &BaselineTable::empty());

        let snaps = snapshots(&out);
        assert_eq!(snaps.len(), 2);
        let infs = inferences(&out);
        assert_eq!(infs.len(), 1);
        assert_eq!(infs[0].contract_version, "pitcher_readiness.v2");
        assert_eq!(infs[0].model_version, "pitcher_readiness_score.v2");
        // An inference follows the snapshot it was scored from.
        let v2_pos = out.outputs.iter().position(|o| {
            matches!(o, PipelineOutput::Snapshot(s) if s.contract_version == "pitcher_readiness.v2")
        });
        let inf_pos = out
            .outputs
            .iter()
            .position(|o| matches!(o, PipelineOutput::Inference(_)));
        assert!(v2_pos.unwrap() < inf_pos.unwrap());
    }

    #[test]
    fn test_stale_environment_not_applied() {
        let obs = EnvObservation {
            venue_id: "busch_iii".into(),
            obs_ts: ts(0),
            temperature_f: 90.0,
            humidity_pct: 50.0,
            baro_hpa: 1013.25,
            wind_mph: 4.0,
            wind_dir_deg: 180.0,
            precip: false,
            mound_hardness_idx: 0.6,
            clay_moisture_idx: 0.4,
            rig_vibration_idx: 0.05,
        };
        let mut venue = venue_ok();
        venue.env = Some(obs);

        let mut worker = test_worker();
        worker.handle_pitch(arrival(50, 97.0, 0.9, true, 1));
        // 60s after the observation: fresh, the v2 snapshot adjusts.
        let out = worker.handle_tick(&ctx(60, Some(55), false), &venue, &BaselineTable::empty());
        let fresh: Vec<bool> = snapshots(&out).iter().map(|s| s.env_adjusted).collect();
        assert!(fresh.contains(&true));

        let mut worker = test_worker();
        worker.handle_pitch(arrival(280, 97.0, 0.9, true, 1));
        // 300s after the observation: stale, nothing adjusts.
        let out = worker.handle_tick(&ctx(300, Some(290), false), &venue, &BaselineTable::empty());
        assert!(snapshots(&out).iter().all(|s| !s.env_adjusted));
    }

    #[test]
    fn test_degraded_inputs_raise_alert_once() {
        let mut worker = test_worker();
        let mut degraded = venue_ok();
        degraded.calibration.confidence = 0.55;

        worker.handle_pitch(arrival(0, 97.0, 0.9, true, 1));
        let out = worker.handle_tick(&ctx(5, Some(1), false), &degraded, &BaselineTable::empty());
        let alerts: Vec<_> = out
            .outputs
            .iter()
            .filter(|o| matches!(o, PipelineOutput::Alert(_)))
            .collect();
        assert_eq!(alerts.len(), 1);

        // Same condition next tick: state unchanged, no repeat alert.
        worker.handle_pitch(arrival(6, 97.0, 0.9, true, 2));
        let out = worker.handle_tick(&ctx(10, Some(7), false), &degraded, &BaselineTable::empty());
        assert!(!out.outputs.iter().any(|o| matches!(o, PipelineOutput::Alert(_))));
    }
}
