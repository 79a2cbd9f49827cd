//! Reliable Outbox - bounded at-least-once delivery queue.
//!
//! ```text
//! send ──► [queued] ──flush──► transmit ──► [awaiting ack] ──ack──► removed
//!             ▲                                   │
//!             └──────────── link lost ────────────┘
//! ```
//!
//! Retry happens exactly at reconnect: there is no per-item timer. Items
//! keep their id across retries so the peer can suppress duplicates.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::protocol::Envelope;

/// Configuration for the Outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Maximum number of unsent items; the oldest unsent item is evicted
    /// beyond this. In-flight items are bounded only once they are
    /// requeued as unsent after a link loss.
    pub capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { capacity: 60 }
    }
}

/// One outbound event with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxItem {
    /// Client-generated idempotency key
    pub id: String,

    /// The event, already stamped with `id`
    pub event: Envelope,

    /// Transmission attempts so far; never decreases
    pub tries: u32,

    /// Context clock time of the send request
    pub created_at: Duration,

    /// Context clock time of the latest transmission attempt
    pub last_try_at: Option<Duration>,
}

impl OutboxItem {
    pub fn new(id: String, mut event: Envelope, created_at: Duration) -> Self {
        event.stamp_id(&id);
        Self {
            id,
            event,
            tries: 0,
            created_at,
            last_try_at: None,
        }
    }

    /// Counts a transmission attempt at `now`.
    pub fn record_attempt(&mut self, now: Duration) {
        self.tries += 1;
        self.last_try_at = Some(now);
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub evicted: u64,
    pub acknowledged: u64,
    pub requeued: u64,
}

/// FIFO of unsent events plus the set awaiting acknowledgment.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    config: OutboxConfig,
    queue: VecDeque<OutboxItem>,
    awaiting: VecDeque<OutboxItem>,
    stats: OutboxStats,
}

impl Outbox {
    pub fn new(config: OutboxConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            awaiting: VecDeque::new(),
            stats: OutboxStats::default(),
        }
    }

    /// Appends an unsent item, evicting the oldest one on overflow.
    pub fn enqueue(&mut self, item: OutboxItem) -> Option<OutboxItem> {
        self.queue.push_back(item);
        self.enforce_capacity()
    }

    /// Takes the oldest unsent item for transmission.
    pub fn take_queued(&mut self) -> Option<OutboxItem> {
        self.queue.pop_front()
    }

    /// Puts back an item whose transmission failed, ahead of the rest.
    pub fn restore_front(&mut self, item: OutboxItem) {
        self.queue.push_front(item);
    }

    /// Records a successful transmission.
    ///
    /// Events that expect acknowledgment move to the awaiting set; the
    /// rest are done.
    pub fn mark_sent(&mut self, item: OutboxItem) {
        if item.event.expects_ack() {
            self.awaiting.push_back(item);
        }
    }

    /// Removes the awaiting item with `id`.
    ///
    /// Returns `false` for unknown ids, including ids of evicted items.
    pub fn acknowledge(&mut self, id: &str) -> bool {
        match self.awaiting.iter().position(|item| item.id == id) {
            Some(pos) => {
                self.awaiting.remove(pos);
                self.stats.acknowledged += 1;
                true
            }
            None => false,
        }
    }

    /// Moves every unacknowledged item back to the head of the queue.
    ///
    /// They were sent before anything still queued, so they go first,
    /// preserving the original order. Returns the number requeued.
    pub fn requeue_unacknowledged(&mut self) -> usize {
        let count = self.awaiting.len();
        while let Some(item) = self.awaiting.pop_back() {
            self.queue.push_front(item);
        }
        self.stats.requeued += count as u64;
        while self.enforce_capacity().is_some() {}
        count
    }

    fn enforce_capacity(&mut self) -> Option<OutboxItem> {
        if self.queue.len() <= self.config.capacity.max(1) {
            return None;
        }
        let evicted = self.queue.pop_front()?;
        self.stats.evicted += 1;
        debug!(id = %evicted.id, tries = evicted.tries, "outbox: full, evicted oldest");
        Some(evicted)
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn awaiting_len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.awaiting.is_empty()
    }

    pub fn is_awaiting(&self, id: &str) -> bool {
        self.awaiting.iter().any(|item| item.id == id)
    }

    /// Unsent items, oldest first.
    pub fn queued(&self) -> impl Iterator<Item = &OutboxItem> {
        self.queue.iter()
    }

    pub fn stats(&self) -> OutboxStats {
        self.stats
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn item(id: &str) -> OutboxItem {
        OutboxItem::new(id.to_string(), Envelope::message_send(json!({"text": id})), Duration::ZERO)
    }

    fn outbox(capacity: usize) -> Outbox {
        Outbox::new(OutboxConfig { capacity })
    }

    #[test]
    fn test_item_is_stamped_with_id() {
        let item = item("m-1");
        assert_eq!(item.event.client_temp_id(), Some("m-1"));
        assert_eq!(item.tries, 0);
    }

    #[test]
    fn test_fifo_order() {
        let mut outbox = outbox(10);
        for id in ["a", "b", "c"] {
            outbox.enqueue(item(id));
        }

        let ids: Vec<_> = std::iter::from_fn(|| outbox.take_queued()).map(|i| i.id).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut outbox = outbox(2);
        assert!(outbox.enqueue(item("a")).is_none());
        assert!(outbox.enqueue(item("b")).is_none());

        let evicted = outbox.enqueue(item("c")).unwrap();
        assert_eq!(evicted.id, "a");
        assert_eq!(outbox.queued().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(outbox.stats().evicted, 1);
    }

    #[test]
    fn test_ack_removes_awaiting() {
        let mut outbox = outbox(10);
        let mut sent = item("a");
        sent.record_attempt(Duration::from_millis(5));
        outbox.mark_sent(sent);

        assert!(outbox.is_awaiting("a"));
        assert!(outbox.acknowledge("a"));
        assert!(!outbox.acknowledge("a"));
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_fire_and_forget_not_tracked() {
        let mut outbox = outbox(10);
        let note = OutboxItem::new("n".into(), Envelope::bare("presence:set"), Duration::ZERO);
        outbox.mark_sent(note);

        assert_eq!(outbox.awaiting_len(), 0);
    }

    #[test]
    fn test_requeue_preserves_order_and_ids() {
        let mut outbox = outbox(10);
        for id in ["a", "b"] {
            let mut sent = item(id);
            sent.record_attempt(Duration::ZERO);
            outbox.mark_sent(sent);
        }
        outbox.enqueue(item("c"));

        assert_eq!(outbox.requeue_unacknowledged(), 2);
        let drained: Vec<_> = std::iter::from_fn(|| outbox.take_queued()).collect();
        assert_eq!(drained.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
        assert_eq!(drained[0].tries, 1);
        assert_eq!(drained[0].event.client_temp_id(), Some("a"));
    }

    #[test]
    fn test_evicted_item_cannot_be_acknowledged() {
        let mut outbox = outbox(1);
        let mut sent = item("a");
        sent.record_attempt(Duration::ZERO);
        outbox.mark_sent(sent);
        outbox.enqueue(item("b"));

        // Requeue pushes "a" ahead of "b"; capacity 1 evicts "a"
        outbox.requeue_unacknowledged();
        assert!(!outbox.acknowledge("a"));
        assert_eq!(outbox.queued().next().unwrap().id, "b");
    }

    #[test]
    fn test_in_flight_items_are_never_evicted() {
        let mut outbox = outbox(2);
        for id in ["a", "b", "c"] {
            let mut sent = item(id);
            sent.record_attempt(Duration::ZERO);
            outbox.mark_sent(sent);
        }

        assert_eq!(outbox.awaiting_len(), 3);
        assert_eq!(outbox.stats().evicted, 0);
        assert!(outbox.acknowledge("a"));

        // Only once unsent again does the capacity apply
        assert_eq!(outbox.requeue_unacknowledged(), 2);
        assert_eq!(outbox.queued().map(|i| i.id.as_str()).collect::<Vec<_>>(), ["b", "c"]);
        assert_eq!(outbox.stats().evicted, 0);
    }

    proptest! {
        #[test]
        fn prop_queue_never_exceeds_capacity(capacity in 1usize..20, sends in 0usize..80) {
            let mut outbox = outbox(capacity);
            for i in 0..sends {
                outbox.enqueue(item(&format!("m-{i}")));
                prop_assert!(outbox.queued_len() <= capacity);
            }

            let expected_evicted = sends.saturating_sub(capacity) as u64;
            prop_assert_eq!(outbox.stats().evicted, expected_evicted);

            // Survivors are the newest `capacity` items, in order
            let first_kept = sends.saturating_sub(capacity);
            let ids: Vec<String> = outbox.queued().map(|i| i.id.clone()).collect();
            let expected: Vec<String> = (first_kept..sends).map(|i| format!("m-{i}")).collect();
            prop_assert_eq!(ids, expected);
        }
    }
}
