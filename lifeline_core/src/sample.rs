//! Location samples - the single input type of the fusion engine.

use serde::{Deserialize, Serialize};

/// Producer of a location sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocationSource {
    /// Platform sensor stream (device GPS)
    Sensor,
    /// Position relayed by a remote authority over the network
    NetworkRelay,
    /// One-shot IP-based geolocation
    IpEstimate,
    /// Recorded track played back by the replay engine
    Replay,
}

impl LocationSource {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::NetworkRelay => "network_relay",
            Self::IpEstimate => "ip_estimate",
            Self::Replay => "replay",
        }
    }
}

/// A single position reading.
///
/// Immutable once created; the fusion engine consumes each sample exactly
/// once and emits a new sample for the fused estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    /// Latitude in degrees (WGS84)
    pub lat: f64,

    /// Longitude in degrees (WGS84)
    pub lng: f64,

    /// Radius of the confidence circle in meters
    pub accuracy_meters: f64,

    /// Capture time, Unix milliseconds
    pub timestamp_ms: i64,

    pub source: LocationSource,
}

impl LocationSample {
    pub fn new(
        lat: f64,
        lng: f64,
        accuracy_meters: f64,
        timestamp_ms: i64,
        source: LocationSource,
    ) -> Self {
        Self {
            lat,
            lng,
            accuracy_meters,
            timestamp_ms,
            source,
        }
    }

    /// Returns a copy re-attributed to `source`.
    pub fn with_source(self, source: LocationSource) -> Self {
        Self { source, ..self }
    }
}
