//! JSON exporter for offline inspection of a run.
//!
//! Exports a timeline of connection and fusion state, one frame per
//! simulated second, plus the final metrics.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;

use crate::runner::ScenarioMetrics;

/// A single frame of simulation data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Connection state name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<OutboxFrame>,

    /// Fused estimate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<GeoPoint>,

    /// Ground truth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truth: Option<GeoPoint>,

    /// Events (faults injected, transitions, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Outbox occupancy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutboxFrame {
    pub queued: usize,
    pub awaiting: usize,
    pub delivered: usize,
}

/// A position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self { message: message.into(), level: None }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { message: message.into(), level: Some("warn".to_string()) }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ScenarioMetrics>,

    /// Events raised between frames, attached to the next frame
    #[serde(skip)]
    pending: Vec<SimEvent>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            metrics: None,
            pending: Vec::new(),
        }
    }

    /// Queues an event for the next frame.
    pub fn event(&mut self, event: SimEvent) {
        self.pending.push(event);
    }

    /// Adds a frame, attaching pending events.
    pub fn add_frame(&mut self, mut frame: SimFrame) {
        frame.events.append(&mut self.pending);
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>, metrics: ScenarioMetrics) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.metrics = Some(metrics);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_attach_to_next_frame() {
        let mut export = SimExport::new("half_open", 42);
        export.event(SimEvent::warn("link went half-open"));
        export.add_frame(SimFrame { time_sec: 1.0, ..SimFrame::default() });
        export.add_frame(SimFrame { time_sec: 2.0, ..SimFrame::default() });

        assert_eq!(export.frames[0].events.len(), 1);
        assert!(export.frames[1].events.is_empty());
        assert_eq!(export.duration_sec, 2.0);

        let json = serde_json::to_value(&export).unwrap();
        assert_eq!(json["frames"][0]["events"][0]["level"], "warn");
        assert!(json["frames"][1].get("events").is_none());
        assert!(json.get("pending").is_none());
    }
}
