//! Ground truth oracle for simulation.
//!
//! The Oracle maintains the "God's eye view" of the tracked subject:
//! - True position (local east/north plane around an origin)
//! - Kinematics (constant velocity with occasional heading changes)
//! - Sample generation per source, with source-specific noise and glitches

use lifeline_core::{LocationSample, LocationSource};
use lifeline_env::GeoFix;
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Meters per degree of latitude (spherical approximation).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Noise model for one sample source.
#[derive(Debug, Clone, Copy)]
pub struct SourceNoise {
    /// Reported accuracy radius (meters)
    pub accuracy_meters: f64,

    /// Standard deviation of the actual position error (meters)
    pub std_dev_meters: f64,
}

impl SourceNoise {
    pub fn sensor() -> Self {
        Self { accuracy_meters: 12.0, std_dev_meters: 5.0 }
    }

    pub fn relay() -> Self {
        Self { accuracy_meters: 30.0, std_dev_meters: 12.0 }
    }

    pub fn ip_estimate() -> Self {
        Self { accuracy_meters: 1_500.0, std_dev_meters: 600.0 }
    }
}

/// The Oracle - moves the subject and produces noisy observations.
pub struct Oracle {
    /// RNG for physics (noise, glitches, heading changes)
    physics_rng: ChaCha8Rng,

    origin_lat: f64,
    origin_lng: f64,

    /// Position east/north of the origin (meters)
    position: Vector2<f64>,

    /// Velocity east/north (m/s)
    velocity: Vector2<f64>,

    /// Current simulation time (seconds)
    current_time: f64,

    /// Probability that a sensor sample is a gross glitch
    glitch_rate: f64,
}

impl Oracle {
    /// Creates a walking subject at the origin.
    ///
    /// The physics seed should be derived separately from the context seed
    /// so that link faults don't change the trajectory.
    pub fn new(physics_seed: u64, origin_lat: f64, origin_lng: f64) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            origin_lat,
            origin_lng,
            position: Vector2::zeros(),
            velocity: Vector2::new(1.2, 0.8),
            current_time: 0.0,
            glitch_rate: 0.0,
        }
    }

    pub fn with_glitch_rate(mut self, rate: f64) -> Self {
        self.glitch_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Advances physics by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.position += self.velocity * dt;
        self.current_time += dt;

        // Occasional gentle turn, speed stays at walking pace
        if self.physics_rng.gen_bool((0.02 * dt).clamp(0.0, 1.0)) {
            let angle: f64 = self.physics_rng.gen_range(-0.8..0.8);
            let (sin, cos) = angle.sin_cos();
            let v = self.velocity;
            self.velocity = Vector2::new(v.x * cos - v.y * sin, v.x * sin + v.y * cos);
        }
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// True position as (lat, lng).
    pub fn truth(&self) -> (f64, f64) {
        self.to_geo(self.position)
    }

    /// Ground truth as a sample, for error measurement.
    pub fn truth_sample(&self, timestamp_ms: i64) -> LocationSample {
        let (lat, lng) = self.truth();
        LocationSample::new(lat, lng, 0.0, timestamp_ms, LocationSource::Sensor)
    }

    /// A noisy observation from `source`.
    pub fn observe(&mut self, source: LocationSource, noise: SourceNoise, timestamp_ms: i64) -> LocationSample {
        let offset = self.gaussian_offset(noise.std_dev_meters);
        let (lat, lng) = self.to_geo(self.position + offset);
        LocationSample::new(lat, lng, noise.accuracy_meters, timestamp_ms, source)
    }

    /// A sensor sample, occasionally replaced by a multi-kilometer glitch.
    ///
    /// Returns the sample and whether it is a glitch.
    pub fn sensor_sample(&mut self, timestamp_ms: i64) -> (LocationSample, bool) {
        if self.glitch_rate > 0.0 && self.physics_rng.gen_bool(self.glitch_rate) {
            let bearing: f64 = self.physics_rng.gen_range(0.0..std::f64::consts::TAU);
            let jump = Vector2::new(bearing.cos(), bearing.sin()) * self.physics_rng.gen_range(2_000.0..5_000.0);
            let (lat, lng) = self.to_geo(self.position + jump);
            let accuracy = SourceNoise::sensor().accuracy_meters;
            return (LocationSample::new(lat, lng, accuracy, timestamp_ms, LocationSource::Sensor), true);
        }
        (self.observe(LocationSource::Sensor, SourceNoise::sensor(), timestamp_ms), false)
    }

    /// Coarse IP fix around the true position.
    pub fn ip_fix(&mut self) -> GeoFix {
        let noise = SourceNoise::ip_estimate();
        let offset = self.gaussian_offset(noise.std_dev_meters);
        let (lat, lng) = self.to_geo(self.position + offset);
        GeoFix { lat, lng, accuracy_meters: noise.accuracy_meters }
    }

    fn gaussian_offset(&mut self, std_dev: f64) -> Vector2<f64> {
        match Normal::new(0.0, std_dev.max(f64::EPSILON)) {
            Ok(normal) => Vector2::new(normal.sample(&mut self.physics_rng), normal.sample(&mut self.physics_rng)),
            Err(_) => Vector2::zeros(),
        }
    }

    fn to_geo(&self, enu: Vector2<f64>) -> (f64, f64) {
        let lat = self.origin_lat + enu.y / METERS_PER_DEGREE;
        let lng = self.origin_lng + enu.x / (METERS_PER_DEGREE * self.origin_lat.to_radians().cos());
        (lat, lng)
    }
}
