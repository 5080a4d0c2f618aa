//! Pipeline runtime: ingestion, routing, and lifecycle.
//!
//! The router task is the only owner of the watermark registry. It
//! stamps each event with its partition's lateness tag, fans it out to
//! the right venue task or entity worker (spawned lazily on first
//! sight), and drives ticks: per tracking event, on a fixed interval,
//! or both. Closing the event feed drains every partition in order
//! before the output channel closes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::baseline::{self, BaselineTable, SharedBaselines};
use crate::config::{ClockMode, Config};
use crate::core::snapshot::{ProducerInfo, SnapshotAssembler};
use crate::environment::VenueProfile;
use crate::error::Result;
use crate::ingest::types::{SourceKind, TelemetryEvent, TelemetryPayload};
use crate::ingest::watermark::{PartitionId, WatermarkRegistry};
use crate::pipeline::venue::{self, VenueMsg, VenueSnapshot};
use crate::pipeline::worker::{
    self, EntityWorker, PitchArrival, TickContext, WorkerMsg, WorkerParams,
};
use crate::pipeline::PipelineOutput;
use crate::stats::SharedStats;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const WORKER_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running pipeline.
///
/// Dropping or closing every cloned event sender starts the drain; the
/// output receiver yields `None` once the last partition has flushed.
/// The consumer must keep reading outputs until then, or a full output
/// channel will stall the drain.
pub struct ReadinessPipeline {
    events_tx: mpsc::Sender<TelemetryEvent>,
    router: JoinHandle<()>,
}

impl ReadinessPipeline {
    /// Validates the configuration, starts the baseline refresh task and
    /// the router, and returns the handle plus the output stream.
    pub async fn start(
        config: Config,
        stats: SharedStats,
    ) -> Result<(Self, mpsc::Receiver<PipelineOutput>)> {
        config.validate()?;

        let window_set = config.window_set()?;
        let contracts = config.active_contracts()?;
        let model = Arc::new(config.scoring_model()?);
        let assembler = Arc::new(SnapshotAssembler::new(
            contracts,
            &window_set,
            config.environment.adjustment.clone(),
            ProducerInfo::detect(),
        )?);

        // A missing or unreadable baseline file degrades the output, it
        // does not block startup. Deltas fall back to raw aggregates.
        let (baselines, baseline_task) =
            match baseline::start_refresh(config.baseline.path.clone(), config.baseline.refresh) {
                Ok((shared, task)) => (shared, Some(task)),
                Err(err) => {
                    warn!(error = %err, "running without baselines");
                    (baseline::fixed_baselines(BaselineTable::empty()), None)
                }
            };

        let worker_params = WorkerParams {
            window_set,
            quality_floor: config.quality_floor,
            assembler,
            model,
            health: config.health.clone(),
            alert_dedup: Duration::seconds(config.alert_dedup.as_secs() as i64),
            env_freshness: Duration::seconds(config.environment.freshness_secs as i64),
            max_hold: Duration::milliseconds(config.tick.max_wait_ms as i64),
        };

        let mut lateness = HashMap::new();
        for source in SourceKind::all() {
            lateness.insert(
                source,
                Duration::seconds(config.lateness_for(source).as_secs() as i64),
            );
        }
        let registry = WatermarkRegistry::new(
            lateness,
            Duration::seconds(config.stall_timeout.as_secs() as i64),
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outputs_tx, outputs_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let router = Router {
            config,
            stats,
            worker_params,
            baselines,
            baseline_task,
            registry,
            outputs: outputs_tx,
            workers: HashMap::new(),
            venues: HashMap::new(),
            stalled: HashSet::new(),
            seq: 0,
        };
        let router = tokio::spawn(router.run(events_rx));

        Ok((Self { events_tx, router }, outputs_rx))
    }

    /// Feed handle for event producers.
    pub fn sender(&self) -> mpsc::Sender<TelemetryEvent> {
        self.events_tx.clone()
    }

    /// Closes the feed and waits for every partition to drain.
    pub async fn shutdown(self) {
        drop(self.events_tx);
        if let Err(err) = self.router.await {
            warn!(error = %err, "router task failed during shutdown");
        }
    }
}

struct WorkerHandle {
    tx: mpsc::Sender<WorkerMsg>,
    task: JoinHandle<()>,
}

struct VenueHandle {
    tx: mpsc::Sender<VenueMsg>,
    snapshot_rx: watch::Receiver<VenueSnapshot>,
    task: JoinHandle<()>,
}

struct Router {
    config: Config,
    stats: SharedStats,
    worker_params: WorkerParams,
    baselines: SharedBaselines,
    baseline_task: Option<JoinHandle<()>>,
    registry: WatermarkRegistry,
    outputs: mpsc::Sender<PipelineOutput>,
    /// Entity workers keyed by pitcher
    workers: HashMap<String, WorkerHandle>,
    /// Venue tasks keyed by venue
    venues: HashMap<String, VenueHandle>,
    /// Partitions currently logged as stalled
    stalled: HashSet<PartitionId>,
    /// Arrival sequence, tiebreak for equal event timestamps
    seq: u64,
}

impl Router {
    async fn run(mut self, mut events: mpsc::Receiver<TelemetryEvent>) {
        let mut ticker = if self.config.tick.interval_secs > 0 {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                self.config.tick.interval_secs,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // A tokio interval fires immediately; consume that tick.
            interval.tick().await;
            Some(interval)
        } else {
            None
        };

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.route(event).await,
                    None => break,
                },
                _ = next_interval(&mut ticker) => self.periodic_tick().await,
            }
        }
        self.drain().await;
    }

    async fn route(&mut self, event: TelemetryEvent) {
        if !event.quality.is_finite() || !(0.0..=1.0).contains(&event.quality) {
            warn!(
                quality = event.quality,
                event_ts = %event.event_ts,
                "dropping event with malformed quality"
            );
            return;
        }
        let arrived_at = Utc::now();
        let event_ts = event.event_ts;
        let quality = event.quality;
        let source = event.source();
        let key = event.partition_key().to_string();
        let venue_id = event.venue_id().to_string();
        let is_late = self.registry.observe(source, &key, event_ts, arrived_at);

        match source {
            SourceKind::Tracking => self.stats.record_pitch_event(),
            SourceKind::Environment => self.stats.record_env_event(),
            SourceKind::Calibration => self.stats.record_cal_event(),
        }
        if is_late {
            self.stats.record_late_event();
            debug!(source = ?source, key = %key, event_ts = %event_ts, "event below watermark");
        }
        if event.ingest_ts < event_ts {
            debug!(
                source = ?source,
                key = %key,
                event_ts = %event_ts,
                ingest_ts = %event.ingest_ts,
                "ingest stamp behind event time"
            );
        }

        self.ensure_venue(&venue_id);
        let now = self.now();

        match event.payload {
            TelemetryPayload::Pitch(sample) => {
                // Venue state advances first, so the confidence this
                // pitch is evaluated under is already published.
                self.tick_venue(&venue_id, now).await;
                self.seq += 1;
                let arrival = PitchArrival {
                    sample,
                    event_ts,
                    quality,
                    is_late,
                    seq: self.seq,
                    received_at: arrived_at,
                };
                self.ensure_worker(&key, &venue_id);
                self.send_worker(&key, WorkerMsg::Pitch(Box::new(arrival)))
                    .await;
                if self.config.tick.per_event {
                    let ctx = self.tick_context(SourceKind::Tracking, &key, false);
                    self.send_worker(&key, WorkerMsg::Tick(ctx)).await;
                }
            }
            TelemetryPayload::Environment(obs) => {
                self.send_venue(&venue_id, VenueMsg::Env(obs)).await;
                self.tick_venue(&venue_id, now).await;
            }
            TelemetryPayload::Calibration(status) => {
                self.send_venue(&venue_id, VenueMsg::Status(status)).await;
                self.tick_venue(&venue_id, now).await;
            }
        }
    }

    /// "Now" under the configured clock: wall time live, the stream's
    /// own frontier during replay.
    fn now(&self) -> DateTime<Utc> {
        match self.config.clock {
            ClockMode::WallClock => Utc::now(),
            ClockMode::EventDriven => self.registry.global_frontier().unwrap_or_else(Utc::now),
        }
    }

    fn tick_context(&self, source: SourceKind, key: &str, forced: bool) -> TickContext {
        let wall_now = Utc::now();
        let clock = self.registry.clock(source, key, wall_now);
        let now = match self.config.clock {
            ClockMode::WallClock => wall_now,
            ClockMode::EventDriven => self.registry.global_frontier().unwrap_or(wall_now),
        };
        TickContext {
            tick_ts: clock.frontier.unwrap_or(now),
            now,
            wall_now,
            watermark: clock.watermark,
            forced,
        }
    }

    fn ensure_venue(&mut self, venue_id: &str) {
        if self.venues.contains_key(venue_id) {
            return;
        }
        let (tx, snapshot_rx, task) = venue::spawn_venue(
            venue_id.to_string(),
            self.config.calibration.decay.clone(),
            self.config.calibration.thresholds.clone(),
            self.now(),
            self.outputs.clone(),
            self.stats.clone(),
        );
        info!(venue_id, "venue tracker started");
        self.venues.insert(
            venue_id.to_string(),
            VenueHandle {
                tx,
                snapshot_rx,
                task,
            },
        );
    }

    fn ensure_worker(&mut self, pitcher_id: &str, venue_id: &str) {
        if self.workers.contains_key(pitcher_id) {
            return;
        }
        let venue = match self.venues.get(venue_id) {
            Some(venue) => venue,
            None => {
                warn!(venue_id, "venue task missing, pitch dropped");
                return;
            }
        };
        let profile = match self.config.venue(venue_id) {
            Some(profile) => profile.clone(),
            None => {
                warn!(venue_id, "venue not configured, using reference profile");
                VenueProfile {
                    venue_id: venue_id.to_string(),
                    ..VenueProfile::default()
                }
            }
        };
        let entity = EntityWorker::new(pitcher_id, venue_id, profile, &self.worker_params);
        let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
        let task = tokio::spawn(worker::run_entity_worker(
            entity,
            rx,
            self.outputs.clone(),
            self.baselines.clone(),
            venue.snapshot_rx.clone(),
            self.stats.clone(),
        ));
        info!(pitcher_id, venue_id, "entity worker started");
        self.workers
            .insert(pitcher_id.to_string(), WorkerHandle { tx, task });
    }

    async fn send_worker(&self, pitcher_id: &str, msg: WorkerMsg) {
        if let Some(handle) = self.workers.get(pitcher_id) {
            if handle.tx.send(msg).await.is_err() {
                warn!(pitcher_id, "entity worker channel closed");
            }
        }
    }

    async fn send_venue(&self, venue_id: &str, msg: VenueMsg) {
        if let Some(handle) = self.venues.get(venue_id) {
            if handle.tx.send(msg).await.is_err() {
                warn!(venue_id, "venue channel closed");
            }
        }
    }

    /// Advance a venue to `now`. In event-driven mode the publish is
    /// awaited, so a tick sent afterwards reads the updated snapshot.
    async fn tick_venue(&self, venue_id: &str, now: DateTime<Utc>) {
        let handle = match self.venues.get(venue_id) {
            Some(handle) => handle,
            None => return,
        };
        if self.config.clock == ClockMode::EventDriven {
            let (ack_tx, ack_rx) = oneshot::channel();
            let msg = VenueMsg::Tick {
                now,
                ack: Some(ack_tx),
            };
            if handle.tx.send(msg).await.is_ok() {
                let _ = ack_rx.await;
            }
        } else {
            let _ = handle.tx.send(VenueMsg::Tick { now, ack: None }).await;
        }
    }

    async fn periodic_tick(&mut self) {
        let now = self.now();
        self.log_stall_transitions();

        let venue_ids: Vec<String> = self.venues.keys().cloned().collect();
        for venue_id in venue_ids {
            self.tick_venue(&venue_id, now).await;
        }
        let pitcher_ids: Vec<String> = self.workers.keys().cloned().collect();
        for pitcher_id in pitcher_ids {
            let ctx = self.tick_context(SourceKind::Tracking, &pitcher_id, false);
            self.send_worker(&pitcher_id, WorkerMsg::Tick(ctx)).await;
        }
    }

    fn log_stall_transitions(&mut self) {
        let wall_now = Utc::now();
        let stalled_now: HashSet<PartitionId> = self
            .registry
            .stalled_partitions(wall_now)
            .into_iter()
            .collect();
        for id in stalled_now.difference(&self.stalled) {
            warn!(source = ?id.source, key = %id.key, "partition stalled, holding last watermark");
        }
        for id in self.stalled.difference(&stalled_now) {
            info!(source = ?id.source, key = %id.key, "partition resumed");
        }
        self.stalled = stalled_now;
    }

    async fn drain(mut self) {
        info!("event feed closed, draining partitions");
        let now = self.now();

        // Venues advance first so workers drain against final state.
        let venue_ids: Vec<String> = self.venues.keys().cloned().collect();
        for venue_id in &venue_ids {
            self.tick_venue(venue_id, now).await;
        }

        // Force-release everything still held, in timestamp order.
        let pitcher_ids: Vec<String> = self.workers.keys().cloned().collect();
        let mut acks = Vec::with_capacity(pitcher_ids.len());
        for pitcher_id in &pitcher_ids {
            let ctx = self.tick_context(SourceKind::Tracking, pitcher_id, true);
            if let Some(handle) = self.workers.get(pitcher_id) {
                let (ack_tx, ack_rx) = oneshot::channel();
                let msg = WorkerMsg::Drain { ctx, ack: ack_tx };
                if handle.tx.send(msg).await.is_ok() {
                    acks.push(ack_rx);
                }
            }
        }
        for ack in acks {
            let _ = ack.await;
        }

        let mut acks = Vec::with_capacity(venue_ids.len());
        for venue_id in &venue_ids {
            if let Some(handle) = self.venues.get(venue_id) {
                let (ack_tx, ack_rx) = oneshot::channel();
                if handle.tx.send(VenueMsg::Drain(ack_tx)).await.is_ok() {
                    acks.push(ack_rx);
                }
            }
        }
        for ack in acks {
            let _ = ack.await;
        }

        for (_, handle) in std::mem::take(&mut self.workers) {
            drop(handle.tx);
            if let Err(err) = handle.task.await {
                warn!(error = %err, "entity worker task failed");
            }
        }
        for (_, handle) in std::mem::take(&mut self.venues) {
            drop(handle.tx);
            if let Err(err) = handle.task.await {
                warn!(error = %err, "venue task failed");
            }
        }
        if let Some(task) = self.baseline_task.take() {
            task.abort();
        }
        info!(
            partitions = self.registry.partition_count(),
            "pipeline drained"
        );
    }
}

async fn next_interval(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
