//! Simulated socket, token issuer and IP locator with fault injection.
//!
//! The socket and its controller share one link state. The runner moves
//! frames between the socket and the [`SimPeer`](crate::peer::SimPeer);
//! the controller flips faults on and off mid-run.

use async_trait::async_trait;
use lifeline_env::{EnvError, GeoFix, IpLocator, SocketTransport, TokenSource};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared state of the simulated link.
#[derive(Debug, Default)]
struct LinkState {
    open: bool,

    /// Opens are refused while the link is down
    down: bool,

    /// Writes succeed but nothing reaches the peer and nothing comes back
    half_open: bool,

    /// Frames written by the client, waiting for the runner
    outbound: VecDeque<String>,

    opens: u64,
    refused_opens: u64,
    closes: u64,
    frames_written: u64,
    frames_swallowed: u64,
}

/// Client side of the simulated link.
pub struct SimSocket {
    link: Arc<Mutex<LinkState>>,
}

#[async_trait]
impl SocketTransport for SimSocket {
    async fn open(&self, _uri: &str) -> Result<(), EnvError> {
        let mut link = self.link.lock().unwrap();
        if link.down {
            link.refused_opens += 1;
            return Err(EnvError::network("Connection refused"));
        }
        // A fresh handshake never inherits a stale half-open path
        link.half_open = false;
        link.open = true;
        link.opens += 1;
        Ok(())
    }

    fn send_text(&self, frame: String) -> Result<(), EnvError> {
        let mut link = self.link.lock().unwrap();
        if !link.open {
            return Err(EnvError::network("Socket closed"));
        }
        link.frames_written += 1;
        if link.half_open {
            link.frames_swallowed += 1;
        } else {
            link.outbound.push_back(frame);
        }
        Ok(())
    }

    fn close(&self) {
        let mut link = self.link.lock().unwrap();
        if link.open {
            link.open = false;
            link.closes += 1;
        }
        link.outbound.clear();
    }

    fn is_open(&self) -> bool {
        self.link.lock().unwrap().open
    }
}

/// Link counters for scenario metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub opens: u64,
    pub refused_opens: u64,
    pub closes: u64,
    pub frames_written: u64,
    pub frames_swallowed: u64,
}

/// Network controller for fault injection.
pub struct SimLinkController {
    link: Arc<Mutex<LinkState>>,

    /// RNG for probabilistic faults (separate from the context RNG)
    rng: ChaCha8Rng,
}

impl SimLinkController {
    /// Creates a connected socket/controller pair.
    pub fn new(seed: u64) -> (SimSocket, Self) {
        let link = Arc::new(Mutex::new(LinkState::default()));
        let socket = SimSocket { link: Arc::clone(&link) };
        let controller = Self {
            link,
            rng: ChaCha8Rng::seed_from_u64(seed),
        };
        (socket, controller)
    }

    /// Takes the link down (opens refused) or back up.
    pub fn set_down(&self, down: bool) {
        self.link.lock().unwrap().down = down;
    }

    /// Makes the current socket silently swallow traffic in both directions.
    pub fn set_half_open(&self, half_open: bool) {
        self.link.lock().unwrap().half_open = half_open;
    }

    pub fn is_half_open(&self) -> bool {
        self.link.lock().unwrap().half_open
    }

    /// Drops the current socket from the network side.
    ///
    /// Returns `true` if a socket was open; the runner must then deliver
    /// the close notification to the connection.
    pub fn sever(&self) -> bool {
        let mut link = self.link.lock().unwrap();
        let was_open = std::mem::replace(&mut link.open, false);
        link.outbound.clear();
        was_open
    }

    /// Severs with probability `p`; see [`sever`](Self::sever).
    pub fn maybe_sever(&mut self, p: f64) -> bool {
        self.rng.gen_bool(p.clamp(0.0, 1.0)) && self.sever()
    }

    /// Inbound frames are delivered only over a healthy open socket.
    pub fn can_deliver_inbound(&self) -> bool {
        let link = self.link.lock().unwrap();
        link.open && !link.half_open
    }

    /// Frames the client wrote since the last drain, in order.
    pub fn drain_outbound(&self) -> Vec<String> {
        self.link.lock().unwrap().outbound.drain(..).collect()
    }

    pub fn is_open(&self) -> bool {
        self.link.lock().unwrap().open
    }

    pub fn stats(&self) -> LinkStats {
        let link = self.link.lock().unwrap();
        LinkStats {
            opens: link.opens,
            refused_opens: link.refused_opens,
            closes: link.closes,
            frames_written: link.frames_written,
            frames_swallowed: link.frames_swallowed,
        }
    }
}

/// Token issuer that can be put into an outage.
#[derive(Debug, Default)]
pub struct SimTokenSource {
    state: Mutex<TokenState>,
}

#[derive(Debug, Default)]
struct TokenState {
    outage: bool,
    issued: u64,
    refused: u64,
}

impl SimTokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outage(&self, outage: bool) {
        self.state.lock().unwrap().outage = outage;
    }

    pub fn issued(&self) -> u64 {
        self.state.lock().unwrap().issued
    }

    pub fn refused(&self) -> u64 {
        self.state.lock().unwrap().refused
    }

    pub fn requests(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.issued + state.refused
    }
}

#[async_trait]
impl TokenSource for SimTokenSource {
    async fn fetch_token(&self) -> Result<String, EnvError> {
        let mut state = self.state.lock().unwrap();
        if state.outage {
            state.refused += 1;
            return Err(EnvError::token("Token service unavailable"));
        }
        state.issued += 1;
        Ok(format!("sim-token-{}", state.issued))
    }
}

/// IP locator answering with whatever fix the runner last published.
#[derive(Debug, Default)]
pub struct SimIpLocator {
    fix: Mutex<Option<GeoFix>>,
    lookups: Mutex<u64>,
}

impl SimIpLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the next answer; `None` makes lookups fail.
    pub fn publish(&self, fix: Option<GeoFix>) {
        *self.fix.lock().unwrap() = fix;
    }

    pub fn lookups(&self) -> u64 {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl IpLocator for SimIpLocator {
    async fn locate(&self) -> Result<GeoFix, EnvError> {
        *self.lookups.lock().unwrap() += 1;
        let fix = *self.fix.lock().unwrap();
        fix.ok_or_else(|| EnvError::locate("Locator unreachable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (socket, controller) = SimLinkController::new(1);
        socket.open("ws://sim/ws?token=t").await.unwrap();

        socket.send_text("a".into()).unwrap();
        socket.send_text("b".into()).unwrap();

        assert_eq!(controller.drain_outbound(), ["a", "b"]);
        assert!(controller.drain_outbound().is_empty());
        assert_eq!(controller.stats().frames_written, 2);
    }

    #[tokio::test]
    async fn test_down_link_refuses_open() {
        let (socket, controller) = SimLinkController::new(1);
        controller.set_down(true);

        assert!(socket.open("ws://sim").await.is_err());
        assert!(!socket.is_open());

        controller.set_down(false);
        assert!(socket.open("ws://sim").await.is_ok());
        assert_eq!(controller.stats().refused_opens, 1);
    }

    #[tokio::test]
    async fn test_half_open_swallows_and_reopen_heals() {
        let (socket, controller) = SimLinkController::new(1);
        socket.open("ws://sim").await.unwrap();
        controller.set_half_open(true);

        assert!(socket.send_text("lost".into()).is_ok());
        assert!(controller.drain_outbound().is_empty());
        assert!(!controller.can_deliver_inbound());

        socket.close();
        socket.open("ws://sim").await.unwrap();
        assert!(!controller.is_half_open());
        assert!(controller.can_deliver_inbound());
    }

    #[tokio::test]
    async fn test_sever_fails_writes() {
        let (socket, controller) = SimLinkController::new(1);
        socket.open("ws://sim").await.unwrap();

        assert!(controller.sever());
        assert!(!controller.sever());
        assert!(socket.send_text("x".into()).is_err());
    }

    #[tokio::test]
    async fn test_token_outage() {
        let tokens = SimTokenSource::new();
        tokens.set_outage(true);
        assert!(tokens.fetch_token().await.is_err());

        tokens.set_outage(false);
        assert_eq!(tokens.fetch_token().await.unwrap(), "sim-token-1");
        assert_eq!(tokens.requests(), 2);
    }

    #[tokio::test]
    async fn test_locator() {
        let locator = SimIpLocator::new();
        assert!(locator.locate().await.is_err());

        locator.publish(Some(GeoFix { lat: 1.0, lng: 2.0, accuracy_meters: 1500.0 }));
        assert_eq!(locator.locate().await.unwrap().lng, 2.0);
        assert_eq!(locator.lookups(), 2);
    }
}
