//! Network-facing collaborator abstractions for Lifeline.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::GeoFix;

/// Abstraction for the single persistent socket of a session.
///
/// # Implementations
///
/// - **Production**: wraps a WebSocket client
/// - **Simulation**: records frames, with scriptable failures
///
/// # Frame Flow
///
/// ```text
/// Core                      Socket                       Peer
///   |                          |                          |
///   |-- open(uri) ------------>|-- handshake ------------>|
///   |-- send_text(frame) ----->|------------------------->|
///   |                          |<------------- frame -----|
///   |<-- on_message(frame) ----|  (delivered by driver)   |
/// ```
///
/// Inbound frames are not pulled through this trait: the driver owning the
/// socket reads them and hands them to the connection machine, so every
/// mutation happens inside one handler invocation.
#[async_trait]
pub trait SocketTransport: Send + Sync + 'static {
    /// Opens the connection to `uri`.
    ///
    /// # Returns
    /// * `Ok(())` - The socket is open
    /// * `Err(EnvError::NetworkError)` - Handshake refused or failed
    async fn open(&self, uri: &str) -> Result<(), EnvError>;

    /// Queues a text frame for transmission. Never blocks.
    fn send_text(&self, frame: String) -> Result<(), EnvError>;

    /// Closes the socket. Closing an already closed socket is a no-op.
    fn close(&self);

    /// Returns whether the socket currently believes it is open.
    ///
    /// A half-open socket reports `true` here; the watchdog exists for
    /// exactly that case.
    fn is_open(&self) -> bool;
}

/// Source of short-lived bearer credentials for the socket handshake.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Fetches a fresh access token. Called once per connection attempt.
    async fn fetch_token(&self) -> Result<String, EnvError>;
}

/// One-shot IP-based geolocation lookup.
#[async_trait]
pub trait IpLocator: Send + Sync + 'static {
    /// Performs the lookup. Failures are not retried by the caller.
    async fn locate(&self) -> Result<GeoFix, EnvError>;
}
