//! Command-line interface for the readiness pipeline.
//!
//! `run` processes a JSONL telemetry stream (file or stdin), `simulate`
//! generates a synthetic appearance and replays it, `seed-baselines`
//! writes a baseline file for the demo roster, and `status`/`config`
//! inspect persisted state. Telemetry is read on a plain blocking
//! thread and bridged into the async runtime over a bounded channel so
//! a slow pipeline backpressures the reader instead of buffering.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use readiness_pipeline::baseline;
use readiness_pipeline::calibration::CalibrationShiftEvent;
use readiness_pipeline::config::ClockMode;
use readiness_pipeline::scoring::Alert;
use readiness_pipeline::stats::create_shared_stats_with_persistence;
use readiness_pipeline::{
    AppearanceSimulator, Config, FeatureSnapshot, PipelineError, PipelineOutput,
    ReadinessInference, ReadinessPipeline, SharedStats, SimConfig, TelemetryEvent, BAND_GUIDE,
    VERSION,
};

/// Events buffered between the reader thread and the runtime.
const FEED_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "readiness-pipeline")]
#[command(author = "Performance Science")]
#[command(version = VERSION)]
#[command(about = "Event-time readiness scoring for pitch tracking telemetry", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline over a JSONL telemetry stream
    Run {
        /// Telemetry file, one event per line; stdin when omitted
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Drive ticks from the stream's own timestamps (replay mode)
        #[arg(long)]
        event_time: bool,
    },

    /// Generate a synthetic appearance and run it through the pipeline
    Simulate {
        /// Pitches in the appearance
        #[arg(long, default_value = "25")]
        pitches: usize,

        /// Pitch count where fatigue starts to show
        #[arg(long, default_value = "15")]
        fatigue_onset: usize,

        /// Fraction of events delivered late
        #[arg(long, default_value = "0.12")]
        late_rate: f64,

        /// Pitch index where the tracking rig starts drifting
        #[arg(long)]
        drift_at: Option<usize>,

        /// Simulator seed
        #[arg(long, default_value = "7")]
        seed: u64,

        /// Delivery pacing: 0 replays flat out, 1 real time, 2 double speed
        #[arg(long, default_value = "0")]
        pace: f64,

        /// Pitcher identity
        #[arg(long, default_value = "STL_656427")]
        pitcher: String,

        /// Venue identity
        #[arg(long, default_value = "busch_iii")]
        venue: String,
    },

    /// Write a synthetic baseline file for the seeded roster
    SeedBaselines {
        /// Output path; the configured baseline path when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Generator seed
        #[arg(long, default_value = "2026")]
        seed: u64,

        /// Season label stamped on the norms
        #[arg(long, default_value = "2026")]
        season: String,
    },

    /// Show cumulative pipeline statistics and the band guide
    Status,

    /// Show configuration
    Config,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "readiness_pipeline=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { input, event_time } => cmd_run(input, event_time),
        Commands::Simulate {
            pitches,
            fatigue_onset,
            late_rate,
            drift_at,
            seed,
            pace,
            pitcher,
            venue,
        } => cmd_simulate(SimulateArgs {
            pitches,
            fatigue_onset,
            late_rate,
            drift_at,
            seed,
            pace,
            pitcher,
            venue,
        }),
        Commands::SeedBaselines {
            output,
            seed,
            season,
        } => cmd_seed_baselines(output, seed, &season),
        Commands::Status => cmd_status(),
        Commands::Config => cmd_config(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn cmd_run(input: Option<PathBuf>, event_time: bool) -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    if event_time {
        config.clock = ClockMode::EventDriven;
    }
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create data directories: {e}");
    }

    println!("Readiness Pipeline v{VERSION}");
    println!();
    match &input {
        Some(path) => println!("Reading telemetry from: {path:?}"),
        None => println!("Reading telemetry from stdin"),
    }
    println!("  Contracts: {}", config.contracts.join(", "));
    println!("  Model: {}", config.model_version);
    println!("  Clock: {}", clock_label(config.clock));
    println!("  Quality floor: {}", config.quality_floor);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let export_path = config.export_path.clone();
    let feed = match input {
        Some(path) => Feed::File(path),
        None => Feed::Stdin,
    };

    let session = run_session(config, stats.clone(), running, feed)?;

    println!();
    println!("Processed {} events", session.fed);
    export_session(&export_path, &session);

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save pipeline stats: {e}");
    }
    println!();
    println!("{}", stats.summary());
    Ok(())
}

struct SimulateArgs {
    pitches: usize,
    fatigue_onset: usize,
    late_rate: f64,
    drift_at: Option<usize>,
    seed: u64,
    pace: f64,
    pitcher: String,
    venue: String,
}

fn cmd_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let mut config = Config::load().unwrap_or_default();
    // Replay is only repeatable when the stream drives the clock.
    config.clock = ClockMode::EventDriven;
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create data directories: {e}");
    }

    let mut simulator = AppearanceSimulator::new(SimConfig {
        pitcher_id: args.pitcher.clone(),
        venue_id: args.venue.clone(),
        pitches: args.pitches,
        fatigue_onset: args.fatigue_onset,
        late_rate: args.late_rate,
        drift_at: args.drift_at,
        seed: args.seed,
        ..SimConfig::default()
    });
    let events = simulator.generate();

    println!("Readiness Pipeline v{VERSION}");
    println!();
    println!("Simulating appearance: {} at {}", args.pitcher, args.venue);
    println!(
        "  Pitches: {} (fatigue onset at {})",
        args.pitches, args.fatigue_onset
    );
    println!("  Late rate: {:.0}%", args.late_rate * 100.0);
    match args.drift_at {
        Some(n) => println!("  Rig drift: after pitch {n}"),
        None => println!("  Rig drift: none"),
    }
    println!("  Seed: {}", args.seed);
    if args.pace > 0.0 {
        println!("  Pace: {}x real time", args.pace);
    } else {
        println!("  Pace: flat out");
    }
    println!("  Events: {}", events.len());
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let export_path = config.export_path.clone();
    let feed = Feed::Events {
        events,
        pace: args.pace,
    };

    let session = run_session(config, stats.clone(), running, feed)?;

    println!();
    println!("Processed {} events", session.fed);
    export_session(&export_path, &session);

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save pipeline stats: {e}");
    }
    println!();
    println!("{}", stats.summary());
    Ok(())
}

fn cmd_seed_baselines(output: Option<PathBuf>, seed: u64, season: &str) -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();
    let path = output.unwrap_or_else(|| config.baseline.path.clone());

    let file = baseline::seed_synthetic(seed, season);
    baseline::save(&path, &file)
        .with_context(|| format!("writing baseline file {}", path.display()))?;

    println!(
        "Wrote {} baseline norms for season {} to {:?}",
        file.norms.len(),
        season,
        path
    );
    Ok(())
}

fn cmd_status() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Readiness Pipeline Status");
    println!("=========================");
    println!();
    println!("Configuration:");
    println!(
        "  Venues: {}",
        config
            .venues
            .iter()
            .map(|v| v.venue_id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  Contracts: {}", config.contracts.join(", "));
    println!("  Model: {}", config.model_version);
    println!("  Clock: {}", clock_label(config.clock));
    println!("  Quality floor: {}", config.quality_floor);
    println!("  Baselines: {:?}", config.baseline.path);
    println!("  Export path: {:?}", config.export_path);
    println!();

    let stats_path = config.stats_path();
    if stats_path.exists() {
        match std::fs::read_to_string(&stats_path) {
            Ok(contents) => match serde_json::from_str::<serde_json::Value>(&contents) {
                Ok(stats) => {
                    println!("Cumulative statistics:");
                    print_stat(&stats, "pitch_events", "Pitch samples");
                    print_stat(&stats, "env_events", "Environment observations");
                    print_stat(&stats, "cal_events", "Calibration checks");
                    print_stat(&stats, "late_events", "Late arrivals");
                    print_stat(&stats, "gated_events", "Quality-gated");
                    print_stat(&stats, "snapshots_emitted", "Snapshots");
                    print_stat(&stats, "inferences_emitted", "Inferences");
                    print_stat(&stats, "alerts_emitted", "Alerts");
                    print_stat(&stats, "calibration_shifts", "Calibration shifts");
                    if let Some(updated) = stats.get("last_updated").and_then(|v| v.as_str()) {
                        println!("  Last updated: {updated}");
                    }
                }
                Err(e) => eprintln!("Warning: Could not parse stats file: {e}"),
            },
            Err(e) => eprintln!("Warning: Could not read stats file: {e}"),
        }
    } else {
        println!("No previous session data found.");
    }

    println!();
    println!("{BAND_GUIDE}");
    Ok(())
}

fn print_stat(stats: &serde_json::Value, key: &str, label: &str) {
    if let Some(value) = stats.get(key).and_then(|v| v.as_u64()) {
        println!("  {label}: {value}");
    }
}

fn cmd_config() -> anyhow::Result<()> {
    let config = Config::load().unwrap_or_default();

    println!("Configuration file: {:?}", Config::config_path());
    println!();
    let json = serde_json::to_string_pretty(&config).context("serializing configuration")?;
    println!("{json}");
    Ok(())
}

/// Where a session's telemetry comes from.
enum Feed {
    File(PathBuf),
    Stdin,
    Events { events: Vec<TelemetryEvent>, pace: f64 },
}

#[derive(Default)]
struct SessionOutput {
    snapshots: Vec<FeatureSnapshot>,
    inferences: Vec<ReadinessInference>,
    alerts: Vec<Alert>,
    shifts: Vec<CalibrationShiftEvent>,
    fed: u64,
}

/// Feed telemetry through the pipeline and collect everything it emits.
///
/// The reader runs on a plain thread; a bounded channel bridges it into
/// the runtime. Inferences, alerts and calibration shifts are echoed as
/// they arrive, snapshots are collected silently for the export.
fn run_session(
    config: Config,
    stats: SharedStats,
    running: Arc<AtomicBool>,
    feed: Feed,
) -> anyhow::Result<SessionOutput> {
    let runtime = tokio::runtime::Runtime::new().context("creating async runtime")?;

    runtime.block_on(async move {
        let (pipeline, mut outputs) = ReadinessPipeline::start(config, stats)
            .await
            .context("starting pipeline")?;

        let printer = tokio::spawn(async move {
            let mut session = SessionOutput::default();
            while let Some(output) = outputs.recv().await {
                match output {
                    PipelineOutput::Snapshot(snapshot) => session.snapshots.push(snapshot),
                    PipelineOutput::Inference(inference) => {
                        print_inference(&inference);
                        session.inferences.push(inference);
                    }
                    PipelineOutput::Alert(alert) => {
                        print_alert(&alert);
                        session.alerts.push(alert);
                    }
                    PipelineOutput::CalibrationShift(shift) => {
                        print_shift(&shift);
                        session.shifts.push(shift);
                    }
                }
            }
            session
        });

        let (feed_tx, feed_rx) =
            crossbeam_channel::bounded::<TelemetryEvent>(FEED_CHANNEL_CAPACITY);
        spawn_feeder(feed, feed_tx, running.clone());

        // The timeout keeps Ctrl+C responsive even when the reader
        // thread is parked on a quiet stdin.
        let events_tx = pipeline.sender();
        let bridge = tokio::task::spawn_blocking(move || {
            let mut fed = 0u64;
            loop {
                match feed_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(event) => {
                        if events_tx.blocking_send(event).is_err() {
                            break;
                        }
                        fed += 1;
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            fed
        });

        let fed = match bridge.await {
            Ok(n) => n,
            Err(e) => {
                eprintln!("Error: feed bridge failed: {e}");
                0
            }
        };

        pipeline.shutdown().await;

        let mut session = match printer.await {
            Ok(session) => session,
            Err(e) => {
                eprintln!("Error: output consumer failed: {e}");
                SessionOutput::default()
            }
        };
        session.fed = fed;
        Ok(session)
    })
}

/// Reader thread. Detached: it ends when its source or the channel
/// does, and after Ctrl+C the bridge stops draining it.
fn spawn_feeder(
    feed: Feed,
    tx: crossbeam_channel::Sender<TelemetryEvent>,
    running: Arc<AtomicBool>,
) {
    std::thread::spawn(move || match feed {
        Feed::File(path) => match std::fs::File::open(&path) {
            Ok(file) => feed_lines(std::io::BufReader::new(file), &tx, &running),
            Err(e) => eprintln!("Error: could not open {}: {e}", path.display()),
        },
        Feed::Stdin => feed_lines(std::io::stdin().lock(), &tx, &running),
        Feed::Events { events, pace } => feed_paced(events, pace, &tx, &running),
    });
}

fn feed_lines<R: std::io::BufRead>(
    reader: R,
    tx: &crossbeam_channel::Sender<TelemetryEvent>,
    running: &AtomicBool,
) {
    for (lineno, line) in reader.lines().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryEvent>(&line) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let err = PipelineError::MalformedEvent(format!("line {}: {e}", lineno + 1));
                eprintln!("Warning: skipping {err}");
            }
        }
    }
}

fn feed_paced(
    events: Vec<TelemetryEvent>,
    pace: f64,
    tx: &crossbeam_channel::Sender<TelemetryEvent>,
    running: &AtomicBool,
) {
    let mut last_ts: Option<DateTime<Utc>> = None;
    for event in events {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if pace > 0.0 {
            if let Some(prev) = last_ts {
                let gap_ms = (event.ingest_ts - prev).num_milliseconds().max(0) as f64 / pace;
                std::thread::sleep(Duration::from_millis(gap_ms as u64));
            }
            last_ts = Some(event.ingest_ts);
        }
        if tx.send(event).is_err() {
            break;
        }
    }
}

fn print_inference(inference: &ReadinessInference) {
    let reasons = if inference.reasons.is_empty() {
        String::new()
    } else {
        format!(
            " | {}",
            inference
                .reasons
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(",")
        )
    };
    println!(
        "[{}] {} readiness {:>5.1} {:<8} fatigue {:>5.1} risk {:.2} confidence {:.2}{}",
        inference.generated_ts.format("%H:%M:%S"),
        inference.pitcher_id,
        inference.readiness_score,
        inference.band.as_str(),
        inference.fatigue_index,
        inference.injury_risk,
        inference.score_confidence,
        reasons
    );
}

fn print_alert(alert: &Alert) {
    println!(
        "[{}] {} {}: {}",
        alert.ts.format("%H:%M:%S"),
        alert.severity.as_str(),
        alert.entity_id,
        alert.message
    );
}

fn print_shift(shift: &CalibrationShiftEvent) {
    println!(
        "[{}] Calibration {} -> {} at {} (confidence {:.2} -> {:.2})",
        shift.shift_ts.format("%H:%M:%S"),
        shift.previous.as_str(),
        shift.current.as_str(),
        shift.venue_id,
        shift.confidence_before,
        shift.confidence
    );
}

/// Append each output kind to its JSONL file under the export
/// directory, so repeated sessions accumulate.
fn export_session(export_path: &Path, session: &SessionOutput) {
    let mut written = 0usize;
    written += append_jsonl(export_path, "snapshots.jsonl", &session.snapshots);
    written += append_jsonl(export_path, "inferences.jsonl", &session.inferences);
    written += append_jsonl(export_path, "alerts.jsonl", &session.alerts);
    written += append_jsonl(export_path, "calibration_shifts.jsonl", &session.shifts);
    if written > 0 {
        println!("Exported {written} records to {export_path:?}");
    }
}

fn append_jsonl<T: serde::Serialize>(dir: &Path, name: &str, records: &[T]) -> usize {
    if records.is_empty() {
        return 0;
    }
    let path = dir.join(name);
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Error: could not open {}: {e}", path.display());
            return 0;
        }
    };
    let mut writer = std::io::BufWriter::new(file);
    let mut written = 0;
    for record in records {
        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(writer, "{line}") {
                    eprintln!("Error: could not write {}: {e}", path.display());
                    return written;
                }
                written += 1;
            }
            Err(e) => eprintln!("Error: could not serialize export record: {e}"),
        }
    }
    if let Err(e) = writer.flush() {
        eprintln!("Error: could not flush {}: {e}", path.display());
    }
    written
}

fn clock_label(mode: ClockMode) -> &'static str {
    match mode {
        ClockMode::WallClock => "wall clock",
        ClockMode::EventDriven => "event driven",
    }
}

fn ctrlc_handler(running: Arc<AtomicBool>) {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");
}
