//! The "FUSION" Estimator - Minimal 2D Kalman Filter
//!
//! Two independent scalar filters (latitude, longitude) sharing a single
//! variance. There is no motion model and no cross-axis covariance: this is
//! a smoothing filter for position fixes whose noise is described only by a
//! circular accuracy radius, not a full 2-D covariance filter.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Accuracy radii at or below zero (or non-finite) are clamped to this.
pub const MIN_ACCURACY_METERS: f64 = 1.0;

/// Scalar-variance Kalman filter over `[lat, lng]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Kalman2D {
    /// Current estimate `[lat, lng]`; `None` until the first update
    estimate: Option<Vector2<f64>>,

    /// Estimate variance in m², applied identically to both axes
    variance: f64,
}

impl Kalman2D {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one measurement and returns the new `(lat, lng)` estimate.
    ///
    /// The first call initializes the state to the measurement exactly,
    /// with variance `accuracy²`. Subsequent calls compute the gain
    /// `k = P / (P + R)` with `R = accuracy²`, move the estimate toward the
    /// measurement by `k` and shrink `P` by `(1 - k)`.
    pub fn update(&mut self, lat: f64, lng: f64, accuracy_meters: f64) -> (f64, f64) {
        let accuracy = sanitize_accuracy(accuracy_meters);
        let measurement_noise = accuracy * accuracy;
        let z = Vector2::new(lat, lng);

        let x = match self.estimate {
            None => {
                self.variance = measurement_noise;
                z
            }
            Some(x) => {
                let k = self.gain(measurement_noise);
                self.variance *= 1.0 - k;
                x + (z - x) * k
            }
        };

        self.estimate = Some(x);
        (x[0], x[1])
    }

    /// Kalman gain for a measurement with noise `r` (m²), in `[0, 1]`.
    pub fn gain(&self, r: f64) -> f64 {
        if self.estimate.is_none() {
            return 1.0;
        }
        let denom = self.variance + r;
        if denom <= 0.0 {
            return 1.0;
        }
        self.variance / denom
    }

    /// Raises the variance to at least `floor` (m²).
    pub fn floor_variance(&mut self, floor: f64) {
        if floor.is_finite() && self.variance < floor {
            self.variance = floor;
        }
    }

    /// Current estimate, if initialized.
    pub fn estimate(&self) -> Option<(f64, f64)> {
        self.estimate.map(|x| (x[0], x[1]))
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn is_initialized(&self) -> bool {
        self.estimate.is_some()
    }

    /// Forgets the estimate; the next update re-initializes.
    pub fn reset(&mut self) {
        self.estimate = None;
        self.variance = 0.0;
    }
}

fn sanitize_accuracy(accuracy_meters: f64) -> f64 {
    if accuracy_meters.is_finite() && accuracy_meters > MIN_ACCURACY_METERS {
        accuracy_meters
    } else {
        MIN_ACCURACY_METERS
    }
}
