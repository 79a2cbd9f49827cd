//! Sample Validator - physical plausibility gate for location samples.
//!
//! A candidate is compared against the last *accepted* sample of the
//! session. Samples with non-finite or out-of-range coordinates are never
//! plausible, baseline or not. Against a baseline two more checks apply:
//! 1. Accuracy ceiling: fixes whose confidence radius reaches the ceiling
//!    carry no useful position information.
//! 2. Speed ceiling: the great-circle distance covered since the baseline,
//!    divided by elapsed time, must be physically plausible.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

use crate::sample::LocationSample;

/// Thresholds for the plausibility gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Candidates with `accuracy_meters >= max_accuracy_meters` are rejected
    pub max_accuracy_meters: f64,

    /// Candidates implying a speed above this (m/s) are rejected
    pub max_speed_mps: f64,
}

impl ValidatorConfig {
    /// Thresholds tuned for live tracking noise.
    pub fn live() -> Self {
        Self {
            max_accuracy_meters: 3000.0,
            max_speed_mps: 50.0,
        }
    }

    /// Wider thresholds for recorded tracks played back through fusion.
    ///
    /// Recorded tracks may come from vehicles or aircraft and from coarse
    /// relays, so both ceilings sit well above the live ones.
    pub fn replay() -> Self {
        Self {
            max_accuracy_meters: 10_000.0,
            max_speed_mps: 350.0,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self::live()
    }
}

/// Reason a candidate failed the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// Latitude or longitude not finite or outside the WGS84 range
    InvalidCoordinates { lat: f64, lng: f64 },
    /// Accuracy radius at or above the ceiling
    Inaccurate { accuracy_meters: f64 },
    /// Timestamp not after the baseline (duplicate or out of order)
    NonIncreasingTime { elapsed_ms: i64 },
    /// Implied speed above the ceiling
    TooFast { speed_mps: f64 },
}

/// Stateless plausibility gate; the caller owns the baseline sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleValidator {
    config: ValidatorConfig,
}

impl SampleValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Returns whether `candidate` is plausible given the last accepted sample.
    pub fn is_plausible(&self, candidate: &LocationSample, last_accepted: Option<&LocationSample>) -> bool {
        self.check(candidate, last_accepted).is_ok()
    }

    /// Same as [`is_plausible`](Self::is_plausible), reporting why a sample failed.
    ///
    /// With no baseline a well-formed candidate is accepted whatever its
    /// accuracy: any fix beats no fix for the first position.
    pub fn check(
        &self,
        candidate: &LocationSample,
        last_accepted: Option<&LocationSample>,
    ) -> Result<(), Rejection> {
        check_coordinates(candidate)?;

        let Some(last) = last_accepted else {
            return Ok(());
        };

        if !(candidate.accuracy_meters < self.config.max_accuracy_meters) {
            return Err(Rejection::Inaccurate {
                accuracy_meters: candidate.accuracy_meters,
            });
        }

        let elapsed_ms = candidate
            .timestamp_ms
            .checked_sub(last.timestamp_ms)
            .unwrap_or(i64::MIN);
        if elapsed_ms <= 0 {
            return Err(Rejection::NonIncreasingTime { elapsed_ms });
        }

        let speed_mps = distance_meters(last, candidate) / (elapsed_ms as f64 / 1000.0);
        if !(speed_mps <= self.config.max_speed_mps) {
            return Err(Rejection::TooFast { speed_mps });
        }

        Ok(())
    }
}

/// Rejects samples whose position cannot be a point on the globe.
pub fn check_coordinates(sample: &LocationSample) -> Result<(), Rejection> {
    let lat_ok = sample.lat.is_finite() && (-90.0..=90.0).contains(&sample.lat);
    let lng_ok = sample.lng.is_finite() && (-180.0..=180.0).contains(&sample.lng);
    if lat_ok && lng_ok {
        Ok(())
    } else {
        Err(Rejection::InvalidCoordinates {
            lat: sample.lat,
            lng: sample.lng,
        })
    }
}

/// Great-circle (haversine) distance between two samples, in meters.
pub fn distance_meters(a: &LocationSample, b: &LocationSample) -> f64 {
    let pa = Point::new(a.lng, a.lat);
    let pb = Point::new(b.lng, b.lat);
    pa.haversine_distance(&pb)
}
