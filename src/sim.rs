//! Synthetic appearance generator.
//!
//! Produces a full relief appearance as a telemetry stream: pitches on
//! a realistic cadence, weather on a fixed scan interval, calibration
//! checks re-anchoring the rig, with optional fatigue and rig-drift
//! storylines. Events come back in delivery order with `ingest_ts`
//! carrying the transport lag, so replaying them through the pipeline
//! exercises the watermark path the same way a live feed would.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::Normal;

use crate::ingest::types::{
    CalibrationAction, CalibrationStatus, EnvObservation, PitchSample, PitchType, TelemetryEvent,
};

/// How often the weather station reports, in seconds.
const ENV_SCAN_SECS: i64 = 30;
/// How often the calibration service checks the rig, in seconds.
const CAL_CHECK_SECS: i64 = 120;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub pitcher_id: String,
    pub venue_id: String,
    /// Total pitches in the appearance
    pub pitches: usize,
    /// Pitch index where fatigue starts showing
    pub fatigue_onset: usize,
    /// Fraction of pitches delivered behind the watermark
    pub late_rate: f64,
    /// Pitch index where the rig starts drifting, if any
    pub drift_at: Option<usize>,
    pub seed: u64,
    pub start_ts: DateTime<Utc>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pitcher_id: "STL_656427".to_string(),
            venue_id: "busch_iii".to_string(),
            pitches: 25,
            fatigue_onset: 15,
            late_rate: 0.12,
            drift_at: None,
            seed: 7,
            // An evening home appearance, 2026-06-12 19:05 UTC.
            start_ts: DateTime::from_timestamp(1_781_291_100, 0).unwrap_or_default(),
        }
    }
}

struct PitchProfile {
    pitch_type: PitchType,
    velo: f64,
    velo_sd: f64,
    spin: f64,
    spin_sd: f64,
    axis_deg: f64,
    vbreak_in: f64,
    hbreak_in: f64,
    weight: f64,
}

/// A late-inning power arsenal: four-seam heavy with a hard slider.
static ARSENAL: [PitchProfile; 3] = [
    PitchProfile {
        pitch_type: PitchType::FourSeam,
        velo: 99.2,
        velo_sd: 0.7,
        spin: 2450.0,
        spin_sd: 60.0,
        axis_deg: 205.0,
        vbreak_in: 16.5,
        hbreak_in: 8.0,
        weight: 0.60,
    },
    PitchProfile {
        pitch_type: PitchType::Slider,
        velo: 88.8,
        velo_sd: 0.9,
        spin: 2520.0,
        spin_sd: 80.0,
        axis_deg: 80.0,
        vbreak_in: 2.0,
        hbreak_in: -4.5,
        weight: 0.35,
    },
    PitchProfile {
        pitch_type: PitchType::Changeup,
        velo: 91.5,
        velo_sd: 0.8,
        spin: 1850.0,
        spin_sd: 70.0,
        axis_deg: 240.0,
        vbreak_in: 8.0,
        hbreak_in: 14.0,
        weight: 0.05,
    },
];

pub struct AppearanceSimulator {
    config: SimConfig,
    rng: StdRng,
}

impl AppearanceSimulator {
    pub fn new(config: SimConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Generates the full appearance, sorted by delivery time.
    pub fn generate(&mut self) -> Vec<TelemetryEvent> {
        let late_rate = self.config.late_rate.clamp(0.0, 1.0);
        let session_id = format!(
            "app_{}_{}",
            self.config.start_ts.format("%Y%m%d"),
            self.config.pitcher_id
        );

        // (delivery instant, event). Sorted at the end so transport lag
        // turns into genuine out-of-order arrival.
        let mut timeline: Vec<(DateTime<Utc>, TelemetryEvent)> = Vec::new();

        let mut pitch_ts = Vec::with_capacity(self.config.pitches);
        let mut t = self.config.start_ts;
        for i in 0..self.config.pitches {
            t += Duration::seconds(self.rng.gen_range(14..=26));
            pitch_ts.push(t);

            let fatigue = self.fatigue_at(i);
            let profile = self.pick_pitch();
            let sample = self.sample_pitch(profile, i, fatigue, &session_id);

            let quality = if self.rng.gen_bool(0.04) {
                self.rng.gen_range(0.20..0.45)
            } else {
                self.rng.gen_range(0.88..0.99)
            };
            // A delayed pitch has to arrive behind later pitches plus the
            // allowed lateness before the watermark tags it.
            let lag_ms: i64 = if self.rng.gen_bool(late_rate) {
                self.rng.gen_range(25_000..40_000)
            } else {
                self.rng.gen_range(120..700)
            };
            let delivery = t + Duration::milliseconds(lag_ms);
            let event = TelemetryEvent::pitch(sample, t, quality).with_ingest_ts(delivery);
            timeline.push((delivery, event));
        }

        let session_end = pitch_ts.last().copied().unwrap_or(self.config.start_ts);
        let drift_ts = self
            .config
            .drift_at
            .and_then(|idx| pitch_ts.get(idx).copied());

        // Weather scans run from warmup through the last pitch.
        let mut env_t = self.config.start_ts - Duration::seconds(ENV_SCAN_SECS);
        while env_t <= session_end {
            let drifted = drift_ts.map_or(false, |d| env_t >= d);
            let obs = self.sample_environment(env_t, drifted);
            let lag_ms: i64 = if self.rng.gen_bool(late_rate * 0.5) {
                self.rng.gen_range(45_000..70_000)
            } else {
                self.rng.gen_range(200..900)
            };
            let delivery = env_t + Duration::milliseconds(lag_ms);
            let event = TelemetryEvent::environment(obs).with_ingest_ts(delivery);
            timeline.push((delivery, event));
            env_t += Duration::seconds(ENV_SCAN_SECS);
        }

        // Calibration checks stop reporting once the rig drifts; the
        // pipeline has to catch that from decay alone.
        let mut cal_t = self.config.start_ts;
        while cal_t <= session_end {
            if drift_ts.map_or(true, |d| cal_t < d) {
                let status = CalibrationStatus {
                    venue_id: self.config.venue_id.clone(),
                    session_id: Some(session_id.clone()),
                    detected_ts: cal_t,
                    confidence: self.gauss(0.95, 0.01).clamp(0.0, 1.0),
                    calibration_set: Some("cal_2026_06".to_string()),
                    recommended: CalibrationAction::None,
                };
                let lag_ms: i64 = self.rng.gen_range(300..1_200);
                let delivery = cal_t + Duration::milliseconds(lag_ms);
                let event = TelemetryEvent::calibration(status).with_ingest_ts(delivery);
                timeline.push((delivery, event));
            }
            cal_t += Duration::seconds(CAL_CHECK_SECS);
        }

        timeline.sort_by_key(|(delivery, _)| *delivery);
        timeline.into_iter().map(|(_, event)| event).collect()
    }

    /// 0 before onset, then a linear ramp to 1 at the final pitch.
    fn fatigue_at(&self, index: usize) -> f64 {
        if index < self.config.fatigue_onset || self.config.pitches <= self.config.fatigue_onset {
            return 0.0;
        }
        let span = (self.config.pitches - self.config.fatigue_onset) as f64;
        ((index - self.config.fatigue_onset) as f64 + 1.0) / span
    }

    fn pick_pitch(&mut self) -> &'static PitchProfile {
        let total: f64 = ARSENAL.iter().map(|p| p.weight).sum();
        let mut roll = self.rng.gen_range(0.0..total);
        for profile in &ARSENAL {
            if roll < profile.weight {
                return profile;
            }
            roll -= profile.weight;
        }
        &ARSENAL[0]
    }

    fn sample_pitch(
        &mut self,
        profile: &PitchProfile,
        index: usize,
        fatigue: f64,
        session_id: &str,
    ) -> PitchSample {
        PitchSample {
            pitch_id: format!("sim_{}_{:04}", self.config.seed, index),
            session_id: session_id.to_string(),
            pitcher_id: self.config.pitcher_id.clone(),
            venue_id: self.config.venue_id.clone(),
            pitch_type: profile.pitch_type,
            release_speed_mph: self.gauss(profile.velo - 2.5 * fatigue, profile.velo_sd),
            spin_rate_rpm: self.gauss(profile.spin - 150.0 * fatigue, profile.spin_sd),
            spin_axis_deg: self.gauss(profile.axis_deg, 4.0 + 6.0 * fatigue),
            extension_ft: self.gauss(6.6 - 0.15 * fatigue, 0.10),
            release_pos_x_ft: self.gauss(-1.75, 0.06 * (1.0 + 0.8 * fatigue)),
            release_pos_y_ft: self.gauss(54.2, 0.15),
            release_pos_z_ft: self.gauss(5.95, 0.07 * (1.0 + 1.5 * fatigue)),
            vbreak_in: self.gauss(profile.vbreak_in - 1.2 * fatigue, 0.8),
            hbreak_in: self.gauss(profile.hbreak_in, 0.7),
            plate_x_ft: self.gauss(0.10, 0.45 * (1.0 + 0.9 * fatigue)),
            plate_z_ft: self.gauss(2.45, 0.40 * (1.0 + 0.9 * fatigue)),
        }
    }

    fn sample_environment(&mut self, obs_ts: DateTime<Utc>, drifted: bool) -> EnvObservation {
        let minutes = (obs_ts - self.config.start_ts).num_seconds() as f64 / 60.0;
        let vibration = if drifted {
            self.gauss(0.45, 0.05)
        } else {
            self.gauss(0.06, 0.02)
        };
        EnvObservation {
            venue_id: self.config.venue_id.clone(),
            obs_ts,
            // A summer evening cooling off slowly.
            temperature_f: self.gauss(84.0 - 0.05 * minutes, 0.4),
            humidity_pct: self.gauss(55.0 + 0.08 * minutes, 1.0).clamp(0.0, 100.0),
            baro_hpa: self.gauss(1016.0, 0.3),
            wind_mph: self.gauss(7.0, 1.5).max(0.0),
            wind_dir_deg: self.gauss(190.0, 12.0).rem_euclid(360.0),
            precip: false,
            mound_hardness_idx: self.gauss(0.62, 0.02).clamp(0.0, 1.0),
            clay_moisture_idx: self.gauss(0.38, 0.02).clamp(0.0, 1.0),
            rig_vibration_idx: vibration.clamp(0.0, 1.0),
        }
    }

    fn gauss(&mut self, mean: f64, sd: f64) -> f64 {
        match Normal::new(mean, sd.max(1e-9)) {
            Ok(dist) => dist.sample(&mut self.rng),
            Err(_) => mean,
        }
    }
}
