//! Lifeline Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the Lifeline
//! engines to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! For Deterministic Simulation Testing (DST), we intercept all I/O:
//! - Time (`now()`, `sleep()`)
//! - Network (`open()`, `send_text()`, `close()`, token acquisition)
//! - Randomness (`random_unit()`, `fill_random()`)
//!
//! By deriving all entropy from a single 64-bit seed, any reconnect storm
//! or replay divergence becomes reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use lifeline_env::{LifelineContext, SocketTransport, TokenSource};
//!
//! async fn drive<Ctx: LifelineContext>(ctx: &Ctx, conn: &mut Connection) {
//!     loop {
//!         conn.poll().await;
//!         ctx.sleep(Duration::from_millis(100)).await;
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::LifelineContext;
pub use network::{IpLocator, SocketTransport, TokenSource};
pub use types::{Connectivity, GeoFix, SessionId};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
