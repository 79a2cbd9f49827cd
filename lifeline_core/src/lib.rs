//! Lifeline Core - real-time telemetry and messaging transport
//!
//! Two halves share one event-driven, single-owner model:
//!
//! 1. **Location**: samples from every producer (sensor, network relay,
//!    IP estimate, replay) pass a plausibility gate and a scalar-variance
//!    Kalman filter, producing one smoothed estimate per session.
//! 2. **Messaging**: a resilient persistent connection with heartbeat,
//!    watchdog, jittered backoff reconnect, an at-least-once outbox and a
//!    debounced typing signal.
//!
//! Everything that touches time, randomness or the network goes through
//! the `lifeline_env` traits, so the same code runs on tokio and inside
//! the deterministic simulator.

pub mod config;
pub mod connection;
pub mod fusion;
pub mod kalman;
pub mod outbox;
pub mod protocol;
pub mod replay;
pub mod sample;
pub mod timers;
pub mod tracking;
pub mod typing;
pub mod validator;

#[cfg(test)]
pub(crate) mod testkit;

// Re-export key types for convenience
pub use config::{ConfigError, LifelineConfig};
pub use connection::{
    BackoffConfig, ConnTimer, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
    RealtimeConnection,
};
pub use fusion::{FusionConfig, FusionEngine, FusionState, FusionStats, ReplayValidation, SampleSink};
pub use kalman::Kalman2D;
pub use outbox::{Outbox, OutboxConfig, OutboxItem, OutboxStats};
pub use protocol::{Envelope, InboundEvent, ProtocolError};
pub use replay::{ReplayConfig, ReplayEngine, ReplayProgress};
pub use sample::{LocationSample, LocationSource};
pub use timers::{Timer, TimerSet};
pub use tracking::TrackingSession;
pub use typing::{TypingAction, TypingCoordinator};
pub use validator::{Rejection, SampleValidator, ValidatorConfig};
