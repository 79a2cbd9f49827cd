//! Typing/Presence Coordinator - debounce for ephemeral signals.
//!
//! One `typing:start` per input burst, one `typing:stop` when the burst
//! goes idle. The idle deadline itself lives on the connection's timer set;
//! this type only tracks whether a burst is open.

use std::time::Duration;

/// What the connection must do after an input event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingAction {
    /// First input of a burst: send `typing:start`, arm the idle timer
    Start,
    /// Burst already open: only re-arm the idle timer
    Extend,
}

/// Burst tracker for the local user's typing indicator.
#[derive(Debug, Clone)]
pub struct TypingCoordinator {
    idle_after: Duration,
    burst_open: bool,
}

impl TypingCoordinator {
    pub fn new(idle_after: Duration) -> Self {
        Self {
            idle_after,
            burst_open: false,
        }
    }

    /// Time without input after which the burst ends.
    pub fn idle_after(&self) -> Duration {
        self.idle_after
    }

    pub fn on_input(&mut self) -> TypingAction {
        if self.burst_open {
            TypingAction::Extend
        } else {
            self.burst_open = true;
            TypingAction::Start
        }
    }

    /// Idle timer expired. Returns whether a stop must be sent.
    pub fn on_idle(&mut self) -> bool {
        std::mem::replace(&mut self.burst_open, false)
    }

    /// Explicit stop (blur/send); the stop is sent regardless of state.
    pub fn stop(&mut self) {
        self.burst_open = false;
    }

    /// Forgets the burst without signaling (link lost).
    pub fn reset(&mut self) {
        self.burst_open = false;
    }

    pub fn is_typing(&self) -> bool {
        self.burst_open
    }
}

impl Default for TypingCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_millis(800))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_start_per_burst() {
        let mut typing = TypingCoordinator::default();

        assert_eq!(typing.on_input(), TypingAction::Start);
        assert_eq!(typing.on_input(), TypingAction::Extend);
        assert_eq!(typing.on_input(), TypingAction::Extend);
        assert!(typing.is_typing());
    }

    #[test]
    fn test_idle_ends_burst_once() {
        let mut typing = TypingCoordinator::default();
        typing.on_input();

        assert!(typing.on_idle());
        assert!(!typing.on_idle());
        assert_eq!(typing.on_input(), TypingAction::Start);
    }

    #[test]
    fn test_stop_and_reset_close_burst() {
        let mut typing = TypingCoordinator::default();
        typing.on_input();
        typing.stop();
        assert!(!typing.is_typing());

        typing.on_input();
        typing.reset();
        assert_eq!(typing.on_input(), TypingAction::Start);
    }
}
