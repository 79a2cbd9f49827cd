//! Simulated realtime server: acknowledges sends, answers pings and
//! suppresses duplicate deliveries by `clientTempId`.

use lifeline_core::protocol::{self, Envelope};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::HashSet;
use tracing::debug;

/// The far end of the simulated link.
pub struct SimPeer {
    /// Probability that an acknowledgment is lost on the way back
    ack_loss: f64,

    rng: ChaCha8Rng,

    /// Ids in first-delivery order
    delivered: Vec<String>,
    seen: HashSet<String>,

    duplicates: u64,
    hellos: u64,
    pings: u64,
    typing_starts: u64,
    typing_stops: u64,
    undecodable: u64,
}

impl SimPeer {
    pub fn new(seed: u64) -> Self {
        Self {
            ack_loss: 0.0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            delivered: Vec::new(),
            seen: HashSet::new(),
            duplicates: 0,
            hellos: 0,
            pings: 0,
            typing_starts: 0,
            typing_stops: 0,
            undecodable: 0,
        }
    }

    pub fn with_ack_loss(mut self, p: f64) -> Self {
        self.ack_loss = p.clamp(0.0, 1.0);
        self
    }

    /// Processes one client frame and returns the replies.
    pub fn handle(&mut self, frame: &str) -> Vec<String> {
        let Ok(envelope) = Envelope::decode(frame) else {
            self.undecodable += 1;
            return Vec::new();
        };

        let replies = match envelope.kind.as_str() {
            protocol::CLIENT_HELLO => {
                self.hellos += 1;
                Vec::new()
            }
            protocol::PING => {
                self.pings += 1;
                vec![Envelope::bare(protocol::PONG)]
            }
            protocol::TYPING_START => {
                self.typing_starts += 1;
                Vec::new()
            }
            protocol::TYPING_STOP => {
                self.typing_stops += 1;
                Vec::new()
            }
            protocol::MESSAGE_SEND => self.on_message_send(&envelope),
            other => {
                debug!(kind = other, "peer ignoring frame");
                Vec::new()
            }
        };
        replies.into_iter().filter_map(|reply| reply.encode().ok()).collect()
    }

    fn on_message_send(&mut self, envelope: &Envelope) -> Vec<Envelope> {
        let Some(id) = envelope.client_temp_id().map(str::to_string) else {
            return vec![Envelope::new(protocol::ERROR, json!({ "message": "missing clientTempId" }))];
        };

        if self.seen.insert(id.clone()) {
            self.delivered.push(id.clone());
        } else {
            self.duplicates += 1;
            debug!(%id, "duplicate suppressed");
        }

        // Duplicates are re-acknowledged so the client can settle them
        if self.rng.gen_bool(self.ack_loss) {
            return Vec::new();
        }
        vec![Envelope::new(protocol::MESSAGE_DELIVERED, json!({ "clientTempId": id }))]
    }

    pub fn delivered(&self) -> &[String] {
        &self.delivered
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn hellos(&self) -> u64 {
        self.hellos
    }

    pub fn pings(&self) -> u64 {
        self.pings
    }

    pub fn typing_counts(&self) -> (u64, u64) {
        (self.typing_starts, self.typing_stops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    fn send(id: &str) -> String {
        let mut envelope = Envelope::message_send(json!({ "text": "hi" }));
        envelope.stamp_id(id);
        envelope.encode().unwrap()
    }

    #[test]
    fn test_acknowledges_and_dedupes() {
        let mut peer = SimPeer::new(1);

        let replies = peer.handle(&send("m1"));
        assert_eq!(replies.len(), 1);
        let ack: Value = serde_json::from_str(&replies[0]).unwrap();
        assert_eq!(ack["type"], "message:delivered");
        assert_eq!(ack["payload"]["clientTempId"], "m1");

        assert_eq!(peer.handle(&send("m1")).len(), 1);
        peer.handle(&send("m2"));

        assert_eq!(peer.delivered(), ["m1", "m2"]);
        assert_eq!(peer.duplicates(), 1);
    }

    #[test]
    fn test_ping_pong() {
        let mut peer = SimPeer::new(1);
        let replies = peer.handle(r#"{"type":"ping","payload":{"t":1}}"#);
        assert_eq!(replies, [r#"{"type":"pong","payload":{}}"#]);
    }

    #[test]
    fn test_total_ack_loss() {
        let mut peer = SimPeer::new(1).with_ack_loss(1.0);
        assert!(peer.handle(&send("m1")).is_empty());
        assert_eq!(peer.delivered(), ["m1"]);
    }

    #[test]
    fn test_send_without_id_is_error() {
        let mut peer = SimPeer::new(1);
        let replies = peer.handle(r#"{"type":"message:send","payload":{"text":"x"}}"#);
        assert!(replies[0].contains("ERROR"));
        assert!(peer.handle("garbage").is_empty());
    }

    proptest! {
        #[test]
        fn prop_each_id_delivered_once(ids in prop::collection::vec(0u8..8, 0..40)) {
            let mut peer = SimPeer::new(7);
            for id in &ids {
                let replies = peer.handle(&send(&format!("m{id}")));
                prop_assert_eq!(replies.len(), 1);
            }

            let unique: HashSet<u8> = ids.iter().copied().collect();
            prop_assert_eq!(peer.delivered().len(), unique.len());
            prop_assert_eq!(peer.delivered().len() as u64 + peer.duplicates(), ids.len() as u64);
        }
    }
}
