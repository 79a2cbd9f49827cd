//! Connection State Machine - one resilient persistent connection.
//!
//! # States
//!
//! ```text
//!                 ┌──────────── watchdog / error / offline ───────────┐
//!                 ▼                                                   │
//!  DISCONNECTED ──► RECONNECTING ──(backoff)──► CONNECTING ──► CONNECTED ◄──► UNSTABLE
//!                                                   │                            │
//!                                                   └── token/open failure ──────┘──► DISCONNECTED
//! ```
//!
//! The machine owns the socket handle, the outbox, the typing coordinator
//! and every timer of the session (heartbeat, watchdog, reconnect, typing
//! idle). All of them are cancelled together in one teardown.
//!
//! Token acquisition and the socket open it gates are the only awaited
//! steps; every other operation runs to completion synchronously.

use std::sync::Arc;
use std::time::Duration;

use lifeline_env::{Connectivity, EnvError, LifelineContext, SessionId, SocketTransport, TokenSource};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::outbox::{Outbox, OutboxConfig, OutboxItem};
use crate::protocol::{self, Envelope, InboundEvent};
use crate::timers::{Timer, TimerSet};
use crate::typing::{TypingAction, TypingCoordinator};

// ============================================================================
// STATE
// ============================================================================

/// Lifecycle state of the logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Unstable,
    Disconnected,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Unstable => "UNSTABLE",
            Self::Disconnected => "DISCONNECTED",
        }
    }

    /// Socket is believed open (frames can be written).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Connected | Self::Unstable)
    }

    /// An attempt is in flight or the socket is open.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Unstable)
    }

    /// The complete transition table.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Unstable)
                | (Unstable, Connected)
                | (Connected, Disconnected)
                | (Unstable, Disconnected)
                | (Connecting, Disconnected)
                | (Disconnected, Reconnecting)
                | (Reconnecting, Connecting)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Exponential backoff with symmetric jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, before jitter (ms)
    pub base_ms: u64,

    /// Growth factor per attempt
    pub factor: f64,

    /// Relative jitter amplitude (0.2 = ±20 %)
    pub jitter: f64,

    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 800,
            factor: 1.6,
            jitter: 0.2,
            min_delay_ms: 800,
            max_delay_ms: 12_000,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `unit` is a uniform sample in `[0, 1)`; 0.5 means no jitter.
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_ms as f64 * self.factor.powi(exponent);
        let spread = 1.0 + self.jitter * (2.0 * unit.clamp(0.0, 1.0) - 1.0);

        let min = self.min_delay_ms as f64;
        let max = (self.max_delay_ms as f64).max(min);
        let ms = (raw * spread).clamp(min, max);
        Duration::from_millis(ms as u64)
    }
}

/// Configuration for a RealtimeConnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Realtime service base address; the page origin is used when unset
    pub base_url: Option<String>,

    /// Origin of the hosting page (fallback for `base_url`)
    pub page_origin: String,

    /// Path segment identifying the session/thread
    pub session_path: String,

    pub heartbeat_interval_ms: u64,

    /// Silence after which the link is UNSTABLE; twice this forces a reconnect
    pub server_timeout_ms: u64,

    /// Watchdog evaluation period
    pub watchdog_tick_ms: u64,

    /// Typing burst idle timeout
    pub typing_idle_ms: u64,

    pub backoff: BackoffConfig,

    pub outbox: OutboxConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            page_origin: "http://localhost".to_string(),
            session_path: "/ws".to_string(),
            heartbeat_interval_ms: 15_000,
            server_timeout_ms: 30_000,
            watchdog_tick_ms: 1_000,
            typing_idle_ms: 800,
            backoff: BackoffConfig::default(),
            outbox: OutboxConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn watchdog_tick(&self) -> Duration {
        Duration::from_millis(self.watchdog_tick_ms.max(1))
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }
}

/// Construction-time errors. Runtime faults never surface as errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid base URL {url:?}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported scheme {0:?} (expected http, https, ws or wss)")]
    UnsupportedScheme(String),

    #[error("URL cannot carry a path: {0}")]
    CannotBeABase(String),
}

// ============================================================================
// URI CONSTRUCTION
// ============================================================================

/// Builds the token-less socket endpoint.
///
/// The configured base address wins over the page origin; `http` becomes
/// `ws` and `https` becomes `wss`; `session_path` is appended to any path
/// the base already carries.
pub fn socket_endpoint(
    base_url: Option<&str>,
    page_origin: &str,
    session_path: &str,
) -> Result<Url, ConnectionError> {
    let raw = base_url.filter(|b| !b.trim().is_empty()).unwrap_or(page_origin).trim();
    let mut url = Url::parse(raw).map_err(|source| ConnectionError::InvalidBaseUrl {
        url: raw.to_string(),
        source,
    })?;

    let upgraded = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => "",
        other => return Err(ConnectionError::UnsupportedScheme(other.to_string())),
    };
    if !upgraded.is_empty() && url.set_scheme(upgraded).is_err() {
        return Err(ConnectionError::UnsupportedScheme(url.scheme().to_string()));
    }

    url.path_segments_mut()
        .map_err(|_| ConnectionError::CannotBeABase(raw.to_string()))?
        .pop_if_empty()
        .extend(session_path.split('/').filter(|s| !s.is_empty()));

    Ok(url)
}

/// Appends the access token as the `token` query parameter.
pub fn socket_uri(endpoint: &Url, token: &str) -> String {
    let mut url = endpoint.clone();
    url.query_pairs_mut().append_pair("token", token);
    url.into()
}

/// Fresh random id drawn from the context's entropy.
pub fn new_client_id<Ctx: LifelineContext + ?Sized>(context: &Ctx) -> String {
    let mut bytes = [0u8; 16];
    context.fill_random(&mut bytes);
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}

// ============================================================================
// EVENTS
// ============================================================================

/// Notifications for the UI layer, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Inbound(InboundEvent),
}

/// Timers owned by the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnTimer {
    Reconnect,
    Watchdog,
    Heartbeat,
    TypingIdle,
}

// ============================================================================
// CONNECTION
// ============================================================================

/// A logical realtime session over one persistent socket.
///
/// Generic over the context, socket and token collaborators, allowing the
/// same machine to run against a real WebSocket or inside the simulator.
pub struct RealtimeConnection<Ctx, Sock, Tok>
where
    Ctx: LifelineContext,
    Sock: SocketTransport,
    Tok: TokenSource,
{
    session_id: SessionId,
    context: Arc<Ctx>,
    socket: Arc<Sock>,
    tokens: Arc<Tok>,
    config: ConnectionConfig,
    endpoint: Url,

    state: ConnectionState,

    /// Consecutive failed attempts since the last successful open
    attempts: u32,

    /// Delay chosen by the latest reconnect scheduling
    last_backoff: Option<Duration>,

    /// Context time of the last inbound frame (any type)
    last_inbound: Duration,

    connectivity: Connectivity,

    /// Set by `disconnect()`; suppresses reconnects until `connect()`
    closed: bool,

    timers: TimerSet<ConnTimer>,
    outbox: Outbox,
    typing: TypingCoordinator,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl<Ctx, Sock, Tok> RealtimeConnection<Ctx, Sock, Tok>
where
    Ctx: LifelineContext,
    Sock: SocketTransport,
    Tok: TokenSource,
{
    /// Creates an idle (DISCONNECTED) connection and its event stream.
    ///
    /// The endpoint is validated here so that no attempt can fail on
    /// configuration later.
    pub fn new(
        context: Arc<Ctx>,
        socket: Arc<Sock>,
        tokens: Arc<Tok>,
        config: ConnectionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), ConnectionError> {
        let endpoint = socket_endpoint(
            config.base_url.as_deref(),
            &config.page_origin,
            &config.session_path,
        )?;

        let mut id_bytes = [0u8; 16];
        context.fill_random(&mut id_bytes);
        let session_id = SessionId(uuid::Builder::from_random_bytes(id_bytes).into_uuid());

        let (events, rx) = mpsc::unbounded_channel();
        let connection = Self {
            session_id,
            outbox: Outbox::new(config.outbox),
            typing: TypingCoordinator::new(config.typing_idle()),
            context,
            socket,
            tokens,
            endpoint,
            config,
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_backoff: None,
            last_inbound: Duration::ZERO,
            connectivity: Connectivity::Online,
            closed: false,
            timers: TimerSet::new(),
            events,
        };
        Ok((connection, rx))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts (or resumes) the session.
    ///
    /// No-op while an attempt is in flight or the socket is open. Token or
    /// open failures are never returned: they move the machine to
    /// DISCONNECTED and schedule a backoff reconnect.
    pub async fn connect(&mut self) {
        self.closed = false;
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Unstable => {
                debug!(session = %self.session_id, state = %self.state, "connect: already live");
                return;
            }
            ConnectionState::Disconnected => {
                self.transition(ConnectionState::Reconnecting);
            }
            ConnectionState::Reconnecting => {}
        }
        self.timers.cancel(ConnTimer::Reconnect);
        self.transition(ConnectionState::Connecting);

        let token = match self.tokens.fetch_token().await {
            Ok(token) => token,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "token acquisition failed");
                self.handle_link_loss("token unavailable");
                return;
            }
        };

        let uri = socket_uri(&self.endpoint, &token);
        if let Err(err) = self.socket.open(&uri).await {
            warn!(
                session = %self.session_id,
                error = %err,
                transient = err.is_transient(),
                "socket open failed"
            );
            self.handle_link_loss("open failed");
            return;
        }

        self.on_open();
    }

    fn on_open(&mut self) {
        let now = self.context.now();
        self.attempts = 0;
        self.last_backoff = None;
        self.last_inbound = now;
        self.transition(ConnectionState::Connected);

        self.send_ephemeral(Envelope::new(
            protocol::CLIENT_HELLO,
            json!({ "session": self.session_id.as_uuid().to_string() }),
        ));
        let flushed = self.flush();

        let heartbeat = self.config.heartbeat_interval();
        let tick = self.config.watchdog_tick();
        self.timers.arm(ConnTimer::Heartbeat, Timer::every(now + heartbeat, heartbeat));
        self.timers.arm(ConnTimer::Watchdog, Timer::every(now + tick, tick));

        info!(session = %self.session_id, flushed, "connected");
    }

    /// Socket reported an error.
    pub fn on_socket_error(&mut self, reason: &str) {
        warn!(session = %self.session_id, reason, "socket error");
        self.handle_link_loss(reason);
    }

    /// Socket reported a close.
    pub fn on_socket_close(&mut self) {
        info!(session = %self.session_id, "socket closed by peer");
        self.handle_link_loss("closed");
    }

    /// Common path for every way the link can die.
    ///
    /// Idempotent: a second report for the same loss is ignored, so an
    /// error followed by a close schedules one reconnect, not two.
    fn handle_link_loss(&mut self, reason: &str) -> bool {
        if !self.state.is_live() {
            return false;
        }

        self.timers.cancel(ConnTimer::Heartbeat);
        self.timers.cancel(ConnTimer::Watchdog);
        self.timers.cancel(ConnTimer::TypingIdle);
        self.typing.reset();
        let requeued = self.outbox.requeue_unacknowledged();

        self.transition(ConnectionState::Disconnected);
        debug!(session = %self.session_id, reason, requeued, "link lost");

        if self.may_reconnect() {
            self.schedule_reconnect();
        }
        true
    }

    fn may_reconnect(&self) -> bool {
        !self.closed && self.connectivity == Connectivity::Online
    }

    /// Arms the reconnect timer with the next backoff delay.
    ///
    /// Only meaningful while DISCONNECTED or RECONNECTING; returns `None`
    /// (and does nothing) otherwise.
    pub fn schedule_reconnect(&mut self) -> Option<Duration> {
        if self.state.is_live() {
            return None;
        }

        self.attempts = self.attempts.saturating_add(1);
        let delay = self.config.backoff.delay(self.attempts, self.context.random_unit());
        self.last_backoff = Some(delay);

        if self.state == ConnectionState::Disconnected {
            self.transition(ConnectionState::Reconnecting);
        }
        let at = self.context.now() + delay;
        self.timers.arm(ConnTimer::Reconnect, Timer::once(at));

        warn!(
            session = %self.session_id,
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        Some(delay)
    }

    /// Host connectivity changed.
    ///
    /// Offline tears the link down at once instead of waiting for the
    /// watchdog; online reconnects immediately when not connected.
    pub async fn set_connectivity(&mut self, connectivity: Connectivity) {
        self.connectivity = connectivity;
        match connectivity {
            Connectivity::Offline => {
                self.timers.cancel(ConnTimer::Reconnect);
                if self.state.is_live() {
                    self.socket.close();
                    self.handle_link_loss("host offline");
                }
            }
            Connectivity::Online => {
                if !self.closed && !self.state.is_live() {
                    self.connect().await;
                }
            }
        }
    }

    /// Ends the session: every timer is cancelled and the socket closed.
    ///
    /// Idempotent. Unacknowledged items stay in the outbox for a later
    /// `connect()`.
    pub fn disconnect(&mut self) {
        self.closed = true;
        let cancelled = self.timers.cancel_all();
        self.typing.reset();

        if self.state.is_live() {
            self.socket.close();
            self.outbox.requeue_unacknowledged();
            self.transition(ConnectionState::Disconnected);
        }
        debug!(session = %self.session_id, cancelled, state = %self.state, "disconnected");
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Runs every timer that is due on the context clock.
    ///
    /// Returns the number of timers fired. Drivers call this whenever
    /// `next_deadline()` passes.
    pub async fn poll(&mut self) -> usize {
        let mut fired = 0;
        loop {
            let now = self.context.now();
            let Some(kind) = self.timers.pop_due(now) else {
                break;
            };
            fired += 1;

            match kind {
                ConnTimer::Reconnect => self.connect().await,
                ConnTimer::Heartbeat => self.heartbeat(now),
                ConnTimer::Watchdog => self.watchdog(now),
                ConnTimer::TypingIdle => {
                    if self.typing.on_idle() {
                        self.send_ephemeral(Envelope::bare(protocol::TYPING_STOP));
                    }
                }
            }
        }
        fired
    }

    fn heartbeat(&mut self, now: Duration) {
        if self.state.is_open() {
            self.send_ephemeral(Envelope::new(protocol::PING, json!({ "t": now.as_millis() as u64 })));
        }
    }

    fn watchdog(&mut self, now: Duration) {
        let silence = now.saturating_sub(self.last_inbound);
        let timeout = self.config.server_timeout();

        if silence > timeout * 2 {
            warn!(
                session = %self.session_id,
                silence_ms = silence.as_millis() as u64,
                "peer unresponsive, forcing reconnect"
            );
            self.socket.close();
            self.handle_link_loss("watchdog");
        } else if silence > timeout && self.state == ConnectionState::Connected {
            self.transition(ConnectionState::Unstable);
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Sends an event with at-least-once delivery. Returns its id.
    ///
    /// While the socket is open the event is transmitted immediately
    /// (behind anything still queued); otherwise it waits in the outbox.
    pub fn send(&mut self, event: Envelope) -> String {
        let id = new_client_id(self.context.as_ref());
        let item = OutboxItem::new(id.clone(), event, self.context.now());

        if let Some(evicted) = self.outbox.enqueue(item) {
            debug!(session = %self.session_id, id = %evicted.id, "outbox overflow");
        }
        if self.state.is_open() {
            self.flush();
        }
        id
    }

    /// Drains the outbox in FIFO order. Returns the number transmitted.
    pub fn flush(&mut self) -> usize {
        if !self.state.is_open() {
            return 0;
        }

        let now = self.context.now();
        let mut sent = 0;
        while let Some(mut item) = self.outbox.take_queued() {
            item.record_attempt(now);
            match self.transmit(&item.event) {
                Ok(()) => {
                    self.outbox.mark_sent(item);
                    sent += 1;
                }
                Err(err) => {
                    warn!(session = %self.session_id, id = %item.id, error = %err, "flush interrupted");
                    self.outbox.restore_front(item);
                    break;
                }
            }
        }
        sent
    }

    /// Fire-and-forget frame: never queued, never acknowledged.
    fn send_ephemeral(&mut self, event: Envelope) -> bool {
        if !self.state.is_open() {
            debug!(session = %self.session_id, kind = %event.kind, "ephemeral event dropped while disconnected");
            return false;
        }
        match self.transmit(&event) {
            Ok(()) => true,
            Err(err) => {
                debug!(session = %self.session_id, kind = %event.kind, error = %err, "ephemeral event dropped");
                false
            }
        }
    }

    fn transmit(&self, event: &Envelope) -> Result<(), EnvError> {
        let frame = event
            .encode()
            .map_err(|err| EnvError::SerializationError(err.to_string()))?;
        self.socket.send_text(frame)
    }

    /// Local input changed in the composer.
    pub fn typing(&mut self) {
        if !self.state.is_open() {
            debug!(session = %self.session_id, "typing dropped while disconnected");
            return;
        }
        if self.typing.on_input() == TypingAction::Start {
            self.send_ephemeral(Envelope::bare(protocol::TYPING_START));
        }
        let at = self.context.now() + self.typing.idle_after();
        self.timers.arm(ConnTimer::TypingIdle, Timer::once(at));
    }

    /// Composer blurred or message sent: stop unconditionally.
    pub fn typing_stop(&mut self) {
        self.timers.cancel(ConnTimer::TypingIdle);
        self.typing.stop();
        self.send_ephemeral(Envelope::bare(protocol::TYPING_STOP));
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Handles one inbound frame, in arrival order.
    ///
    /// Any frame counts as liveness. Acknowledgments settle outbox items;
    /// peer `ERROR` envelopes are logged and surfaced, never acted on.
    pub fn on_message(&mut self, frame: &str) -> Option<InboundEvent> {
        if !self.state.is_open() {
            debug!(session = %self.session_id, "frame after teardown ignored");
            return None;
        }

        self.last_inbound = self.context.now();
        if self.state == ConnectionState::Unstable {
            self.transition(ConnectionState::Connected);
        }

        let event = match InboundEvent::decode(frame) {
            Ok(event) => event,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "undecodable frame dropped");
                return None;
            }
        };

        if let Some(id) = event.acknowledged_id() {
            if self.outbox.acknowledge(id) {
                debug!(session = %self.session_id, id, "delivery acknowledged");
            }
        }
        if let InboundEvent::PeerError(payload) = &event {
            warn!(session = %self.session_id, %payload, "peer reported error");
        }

        let _ = self.events.send(ConnectionEvent::Inbound(event.clone()));
        Some(event)
    }

    // ------------------------------------------------------------------
    // Internals & accessors
    // ------------------------------------------------------------------

    fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!(session = %self.session_id, from = %self.state, to = %next, "invalid transition ignored");
            return false;
        }

        let from = std::mem::replace(&mut self.state, next);
        info!(session = %self.session_id, %from, to = %next, "connection state");
        let _ = self.events.send(ConnectionEvent::StateChanged { from, to: next });
        true
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_backoff(&self) -> Option<Duration> {
        self.last_backoff
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn is_typing(&self) -> bool {
        self.typing.is_typing()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.active_count()
    }

    pub fn is_timer_armed(&self, kind: ConnTimer) -> bool {
        self.timers.is_armed(kind)
    }

    /// Earliest pending timer deadline, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

// ============================================================================
// TESTS
// ============================================================================
