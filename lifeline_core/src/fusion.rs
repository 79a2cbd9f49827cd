//! Location Fusion Engine
//!
//! Merges samples from every producer (sensor stream, network relay, IP
//! estimate, replay) into one smoothed estimate:
//!
//! ```text
//! sample ──► gate (vs. last ACCEPTED) ──► Kalman2D ──► fused sample ──► on_fused
//!               │
//!               └─ rejected: dropped silently, baseline unchanged
//! ```
//!
//! All sources share one baseline and one estimator, so a coarse IP fix
//! arriving between two precise sensor fixes is down-weighted by the filter
//! gain instead of producing a visible jump.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::kalman::Kalman2D;
use crate::sample::{LocationSample, LocationSource};
use crate::validator::{check_coordinates, SampleValidator, ValidatorConfig};

/// How replay-sourced samples are gated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReplayValidation {
    /// Replay samples skip the gate entirely
    Bypass,
    /// Replay samples use their own threshold set
    Thresholds(ValidatorConfig),
}

impl Default for ReplayValidation {
    fn default() -> Self {
        Self::Thresholds(ValidatorConfig::replay())
    }
}

/// Configuration for the FusionEngine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Gate applied to sensor, relay and IP samples
    pub live: ValidatorConfig,

    /// Gate policy for replay samples
    pub replay: ReplayValidation,

    /// Keep the estimate variance at or above the accepted sample's
    /// squared accuracy, so a long run of fixes cannot make the filter
    /// ignore a genuine move after a gap
    pub floor_variance_to_accuracy: bool,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            live: ValidatorConfig::live(),
            replay: ReplayValidation::default(),
            floor_variance_to_accuracy: true,
        }
    }
}

/// Snapshot of the per-session fusion state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionState {
    pub estimate_lat: f64,
    pub estimate_lng: f64,
    pub variance_meters2: f64,
    pub last_sample: Option<LocationSample>,
}

/// Counters for accepted and rejected samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionStats {
    pub accepted: u64,
    pub rejected: u64,
}

/// Anything samples can be pushed into: the fusion engine, or a recorder.
pub trait SampleSink {
    /// Offers a sample; returns whether it was accepted.
    fn ingest(&mut self, sample: LocationSample) -> bool;
}

type FusedCallback = Box<dyn FnMut(&LocationSample) + Send>;

/// Single-session fusion engine.
///
/// The engine holds exactly one estimator and one baseline; its lifetime is
/// the tracking session's lifetime.
pub struct FusionEngine {
    config: FusionConfig,
    live_gate: SampleValidator,
    /// `None` when replay validation is bypassed
    replay_gate: Option<SampleValidator>,
    filter: Kalman2D,
    last_accepted: Option<LocationSample>,
    on_fused: FusedCallback,
    stats: FusionStats,
}

impl FusionEngine {
    /// Creates an engine that invokes `on_fused` for every accepted sample.
    pub fn new(config: FusionConfig, on_fused: impl FnMut(&LocationSample) + Send + 'static) -> Self {
        let replay_gate = match config.replay {
            ReplayValidation::Bypass => None,
            ReplayValidation::Thresholds(thresholds) => Some(SampleValidator::new(thresholds)),
        };

        Self {
            config,
            live_gate: SampleValidator::new(config.live),
            replay_gate,
            filter: Kalman2D::new(),
            last_accepted: None,
            on_fused: Box::new(on_fused),
            stats: FusionStats::default(),
        }
    }

    /// Creates an engine with no callback; use the return value of `ingest`.
    pub fn with_config(config: FusionConfig) -> Self {
        Self::new(config, |_| {})
    }

    /// Ingests one sample. Returns the fused sample when it was accepted.
    ///
    /// Rejection is routine sensor noise, not a failure: the sample is
    /// dropped and the baseline stays on the last accepted sample.
    pub fn ingest(&mut self, sample: LocationSample) -> Option<LocationSample> {
        if let Err(reason) = self.gate(&sample) {
            self.stats.rejected += 1;
            debug!(source = sample.source.name(), ?reason, "sample rejected");
            return None;
        }

        let (lat, lng) = self.filter.update(sample.lat, sample.lng, sample.accuracy_meters);
        if self.config.floor_variance_to_accuracy {
            self.filter.floor_variance(sample.accuracy_meters * sample.accuracy_meters);
        }

        let fused = LocationSample {
            lat,
            lng,
            accuracy_meters: self.filter.variance().sqrt(),
            timestamp_ms: sample.timestamp_ms,
            source: sample.source,
        };

        self.last_accepted = Some(sample);
        self.stats.accepted += 1;
        (self.on_fused)(&fused);
        Some(fused)
    }

    fn gate(&self, sample: &LocationSample) -> Result<(), crate::validator::Rejection> {
        // Bypass waives the thresholds, never the coordinate sanity check
        check_coordinates(sample)?;

        let gate = match sample.source {
            LocationSource::Replay => match &self.replay_gate {
                Some(gate) => gate,
                None => return Ok(()),
            },
            _ => &self.live_gate,
        };
        gate.check(sample, self.last_accepted.as_ref())
    }

    /// Current state, `None` until the first sample is accepted.
    pub fn state(&self) -> Option<FusionState> {
        let (estimate_lat, estimate_lng) = self.filter.estimate()?;
        Some(FusionState {
            estimate_lat,
            estimate_lng,
            variance_meters2: self.filter.variance(),
            last_sample: self.last_accepted,
        })
    }

    pub fn last_accepted(&self) -> Option<&LocationSample> {
        self.last_accepted.as_ref()
    }

    pub fn stats(&self) -> FusionStats {
        self.stats
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Ends the tracking session: estimate and baseline are discarded.
    pub fn reset(&mut self) {
        self.filter.reset();
        self.last_accepted = None;
        self.stats = FusionStats::default();
    }
}

impl SampleSink for FusionEngine {
    fn ingest(&mut self, sample: LocationSample) -> bool {
        FusionEngine::ingest(self, sample).is_some()
    }
}

impl std::fmt::Debug for FusionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionEngine")
            .field("config", &self.config)
            .field("filter", &self.filter)
            .field("last_accepted", &self.last_accepted)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::{Arc, Mutex};

    const DEG_PER_METER: f64 = 1.0 / 111_195.0;

    fn at(north_m: f64, accuracy: f64, t_ms: i64, source: LocationSource) -> LocationSample {
        LocationSample::new(-1.2921 + north_m * DEG_PER_METER, 36.8219, accuracy, t_ms, source)
    }

    fn recording_engine(config: FusionConfig) -> (FusionEngine, Arc<Mutex<Vec<LocationSample>>>) {
        let fused = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fused);
        let engine = FusionEngine::new(config, move |s| sink.lock().unwrap().push(*s));
        (engine, fused)
    }

    #[test]
    fn test_convergence_on_identical_samples() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        let target = at(0.0, 10.0, 0, LocationSource::Sensor);

        // Start from an offset fix so convergence is observable
        engine.ingest(at(40.0, 10.0, 0, LocationSource::Sensor));
        for i in 1..=60 {
            engine.ingest(LocationSample { timestamp_ms: i * 1_000, ..target });
        }

        let state = engine.state().unwrap();
        assert_relative_eq!(state.estimate_lat, target.lat, epsilon = 1e-9);
        assert_relative_eq!(state.estimate_lng, target.lng, epsilon = 1e-9);
    }

    #[test]
    fn test_callback_only_on_acceptance() {
        let (mut engine, fused) = recording_engine(FusionConfig::default());

        engine.ingest(at(0.0, 10.0, 0, LocationSource::Sensor));
        engine.ingest(at(200.0, 10.0, 1_000, LocationSource::Sensor)); // 200 m/s
        engine.ingest(at(200.0, 10.0, 10_000, LocationSource::Sensor)); // 20 m/s

        let fused = fused.lock().unwrap();
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[1].timestamp_ms, 10_000);
        assert_eq!(engine.stats(), FusionStats { accepted: 2, rejected: 1 });
    }

    #[test]
    fn test_rejected_sample_does_not_become_baseline() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        let origin = at(0.0, 10.0, 0, LocationSource::Sensor);
        engine.ingest(origin);

        // A teleport 5 km away is rejected...
        assert!(engine.ingest(at(5_000.0, 10.0, 2_000, LocationSource::Sensor)).is_none());
        // ...and a fix near the origin is still judged against the origin.
        assert!(engine.ingest(at(30.0, 10.0, 3_000, LocationSource::Sensor)).is_some());
        assert_eq!(engine.last_accepted().unwrap().timestamp_ms, 3_000);
    }

    #[test]
    fn test_output_keeps_timestamp_and_source() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        engine.ingest(at(0.0, 10.0, 0, LocationSource::Sensor));

        let fused = engine.ingest(at(10.0, 10.0, 5_000, LocationSource::NetworkRelay)).unwrap();
        assert_eq!(fused.timestamp_ms, 5_000);
        assert_eq!(fused.source, LocationSource::NetworkRelay);
    }

    #[test]
    fn test_ip_fix_between_sensor_fixes_is_down_weighted() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        engine.ingest(at(0.0, 8.0, 0, LocationSource::Sensor));

        // IP estimate 400 m off with 2 km accuracy; plausible by speed
        let fused = engine.ingest(at(400.0, 2_000.0, 60_000, LocationSource::IpEstimate)).unwrap();
        let shift_m = (fused.lat - at(0.0, 8.0, 0, LocationSource::Sensor).lat) / DEG_PER_METER;

        assert!(shift_m.abs() < 1.0, "IP fix moved estimate by {shift_m} m");
    }

    #[test]
    fn test_variance_bounded_below_by_last_accuracy() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        for i in 0..30 {
            engine.ingest(at(0.0, 15.0, i * 1_000, LocationSource::Sensor));
            let state = engine.state().unwrap();
            assert!(state.variance_meters2 >= 15.0 * 15.0 - 1e-9);
        }
    }

    #[test]
    fn test_without_floor_variance_shrinks() {
        let config = FusionConfig {
            floor_variance_to_accuracy: false,
            ..FusionConfig::default()
        };
        let mut engine = FusionEngine::with_config(config);
        for i in 0..10 {
            engine.ingest(at(0.0, 15.0, i * 1_000, LocationSource::Sensor));
        }

        assert!(engine.state().unwrap().variance_meters2 < 225.0 / 5.0);
    }

    #[test]
    fn test_replay_thresholds_wider_than_live() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        engine.ingest(at(0.0, 10.0, 0, LocationSource::Sensor));

        // 3000 m accuracy is at the live ceiling...
        assert!(engine.ingest(at(0.0, 3000.0, 60_000, LocationSource::Sensor)).is_none());
        // ...but within the replay threshold set.
        assert!(engine.ingest(at(0.0, 3000.0, 60_000, LocationSource::Replay)).is_some());
    }

    #[test]
    fn test_replay_bypass_accepts_any_speed() {
        let config = FusionConfig {
            replay: ReplayValidation::Bypass,
            ..FusionConfig::default()
        };
        let mut engine = FusionEngine::with_config(config);
        engine.ingest(at(0.0, 10.0, 0, LocationSource::Replay));

        // 10 km in one second
        assert!(engine.ingest(at(10_000.0, 10.0, 1_000, LocationSource::Replay)).is_some());
        // Live samples remain gated against the replay baseline
        assert!(engine.ingest(at(0.0, 10.0, 2_000, LocationSource::Sensor)).is_none());
    }

    #[test]
    fn test_nan_fix_never_reaches_estimate() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        engine.ingest(LocationSample::new(10.0, 10.0, 10.0, 0, LocationSource::Sensor));

        let broken = LocationSample::new(f64::NAN, 10.0, 10.0, 1_000, LocationSource::Sensor);
        assert!(engine.ingest(broken).is_none());

        let fused = engine
            .ingest(LocationSample::new(10.00001, 10.0, 10.0, 2_000, LocationSource::Sensor))
            .expect("good fix after a NaN one is accepted");
        assert!(fused.lat.is_finite());
        assert!(engine.state().unwrap().estimate_lat.is_finite());
        assert_eq!(engine.stats().rejected, 1);
    }

    #[test]
    fn test_replay_bypass_still_rejects_invalid_coordinates() {
        let config = FusionConfig {
            replay: ReplayValidation::Bypass,
            ..FusionConfig::default()
        };
        let mut engine = FusionEngine::with_config(config);

        let broken = LocationSample::new(10.0, f64::INFINITY, 10.0, 0, LocationSource::Replay);
        assert!(engine.ingest(broken).is_none());
        assert!(engine.state().is_none());
    }

    #[test]
    fn test_reset_ends_session() {
        let mut engine = FusionEngine::with_config(FusionConfig::default());
        engine.ingest(at(0.0, 10.0, 0, LocationSource::Sensor));
        engine.reset();

        assert!(engine.state().is_none());
        assert!(engine.last_accepted().is_none());
        // A far-away first fix of the new session is accepted
        assert!(engine.ingest(at(50_000.0, 10.0, 1, LocationSource::Sensor)).is_some());
    }

    #[test]
    fn test_replay_validation_config_json() {
        let bypass: ReplayValidation = serde_json::from_str(r#"{"mode":"bypass"}"#).unwrap();
        assert_eq!(bypass, ReplayValidation::Bypass);

        let custom: ReplayValidation =
            serde_json::from_str(r#"{"mode":"thresholds","max_accuracy_meters":500.0,"max_speed_mps":80.0}"#)
                .unwrap();
        assert_eq!(
            custom,
            ReplayValidation::Thresholds(ValidatorConfig {
                max_accuracy_meters: 500.0,
                max_speed_mps: 80.0,
            })
        );
    }
}
