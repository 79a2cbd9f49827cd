//! Lifeline Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled environment where the connection
//! machine and the location engines run deterministically.
//!
//! # Core Principle: The Reactor Pattern
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: Virtual clock advanced in fixed ticks by the runner
//! - **Network**: A shared link state with severs, half-open paths and
//!   refused opens, plus a token issuer that can go dark
//! - **Randomness**: All entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                         │
//! │                                                              │
//! │  ┌────────────────────┐   SimSocket   ┌──────────────────┐   │
//! │  │ RealtimeConnection │◄─────────────►│     SimPeer      │   │
//! │  │  (SimContext clock)│  (faults via  │ acks + dedup     │   │
//! │  └────────────────────┘  controller)  └──────────────────┘   │
//! │                                                              │
//! │  ┌────────────────────┐   samples     ┌──────────────────┐   │
//! │  │  TrackingSession   │◄──────────────│      Oracle      │   │
//! │  │ (fusion + replay)  │               │  (ground truth)  │   │
//! │  └────────────────────┘               └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lifeline_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::HalfOpen);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod oracle;
mod peer;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{GeoPoint, OutboxFrame, SimEvent, SimExport, SimFrame};
pub use network::{LinkStats, SimIpLocator, SimLinkController, SimSocket, SimTokenSource};
pub use oracle::{Oracle, SourceNoise};
pub use peer::SimPeer;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
