//! Replay Engine - deterministic playback of a recorded track.
//!
//! Frames are emitted one per interval (`base_interval / speed`) into a
//! [`SampleSink`], re-attributed to [`LocationSource::Replay`]. The first
//! frame is due one interval after `start`. Missed intervals are caught up
//! in order on the next `poll`, so the emitted sequence does not depend on
//! how often the driver polls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::fusion::SampleSink;
use crate::sample::{LocationSample, LocationSource};

/// Configuration for the ReplayEngine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Interval between frames at 1x speed (ms)
    pub base_interval_ms: u64,

    /// Playback speed multiplier
    pub speed: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            speed: 1.0,
        }
    }
}

impl ReplayConfig {
    /// Interval between frames at the given speed. Non-positive or
    /// non-finite multipliers fall back to 1x.
    pub fn interval_at(&self, speed: f64) -> Duration {
        let speed = if speed.is_finite() && speed > 0.0 { speed } else { 1.0 };
        let ms = (self.base_interval_ms as f64 / speed).max(1.0);
        Duration::from_secs_f64(ms / 1000.0)
    }
}

/// Playback position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayProgress {
    pub cursor: usize,
    pub total: usize,
}

impl ReplayProgress {
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.total
    }
}

/// Plays recorded frames into a sink on a fixed interval.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    config: ReplayConfig,
    speed: f64,
    frames: Vec<LocationSample>,
    cursor: usize,
    active: bool,
    next_frame_at: Option<Duration>,
}

impl ReplayEngine {
    pub fn new(config: ReplayConfig) -> Self {
        Self {
            speed: config.speed,
            config,
            frames: Vec::new(),
            cursor: 0,
            active: false,
            next_frame_at: None,
        }
    }

    /// Begins playback at `now`. An empty recording is a no-op.
    ///
    /// Starting while active restarts from the first frame of the new
    /// recording.
    pub fn start(&mut self, frames: Vec<LocationSample>, now: Duration) -> bool {
        if frames.is_empty() {
            debug!("replay start ignored: empty recording");
            return false;
        }

        self.frames = frames;
        self.cursor = 0;
        self.active = true;
        self.next_frame_at = Some(now + self.interval());
        info!(frames = self.frames.len(), speed = self.speed, "replay started");
        true
    }

    /// Emits every frame due at `now`. Returns the number emitted.
    pub fn poll(&mut self, now: Duration, sink: &mut impl SampleSink) -> usize {
        let mut emitted = 0;
        while self.active {
            let Some(due) = self.next_frame_at else {
                break;
            };
            if due > now {
                break;
            }

            let frame = self.frames[self.cursor].with_source(LocationSource::Replay);
            sink.ingest(frame);
            self.cursor += 1;
            emitted += 1;

            if self.cursor >= self.frames.len() {
                self.stop();
            } else {
                self.next_frame_at = Some(due + self.interval());
            }
        }
        emitted
    }

    /// Cancels the timer and deactivates. Idempotent.
    pub fn stop(&mut self) -> bool {
        let was_active = self.active;
        self.active = false;
        self.next_frame_at = None;
        if was_active {
            info!(cursor = self.cursor, total = self.frames.len(), "replay stopped");
        }
        was_active
    }

    /// Rescales the interval of an active session in place; the next frame
    /// becomes due one new interval after `now`.
    pub fn set_speed(&mut self, multiplier: f64, now: Duration) {
        self.speed = multiplier;
        if self.active {
            self.next_frame_at = Some(now + self.interval());
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval_at(self.speed)
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn progress(&self) -> ReplayProgress {
        ReplayProgress {
            cursor: self.cursor,
            total: self.frames.len(),
        }
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.next_frame_at
    }
}

impl Default for ReplayEngine {
    fn default() -> Self {
        Self::new(ReplayConfig::default())
    }
}
