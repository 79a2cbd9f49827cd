//! Scheduled-task handles on a caller-supplied clock.
//!
//! Components never own OS timers. Each stores its pending work as
//! [`Timer`] deadlines (one-shot or periodic) on the context's monotonic
//! clock; the driver asks for the next deadline, sleeps until then, and
//! hands control back. Tearing a component down is a single
//! [`TimerSet::cancel_all`], so no timer can fire into a dead session.

use std::collections::BTreeMap;
use std::time::Duration;

/// A single pending deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    deadline: Duration,
    period: Option<Duration>,
}

impl Timer {
    /// Fires once at `deadline`.
    pub fn once(deadline: Duration) -> Self {
        Self {
            deadline,
            period: None,
        }
    }

    /// Fires at `first`, then every `period`.
    pub fn every(first: Duration, period: Duration) -> Self {
        Self {
            deadline: first,
            period: Some(period),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    pub fn is_due(&self, now: Duration) -> bool {
        self.deadline <= now
    }

    /// Moves a periodic timer to its first deadline strictly after `now`.
    ///
    /// Missed periods are coalesced into the firing that triggered the
    /// rearm. Returns `false` for one-shot timers.
    pub fn rearm(&mut self, now: Duration) -> bool {
        let Some(period) = self.period.filter(|p| !p.is_zero()) else {
            return false;
        };
        let period_ns = period.as_nanos();
        let behind = now.saturating_sub(self.deadline);
        // u128 holds any whole number of periods within a Duration's range
        let advance_ns = (behind.as_nanos() / period_ns + 1) * period_ns;
        let advance = Duration::new(
            u64::try_from(advance_ns / 1_000_000_000).unwrap_or(u64::MAX),
            (advance_ns % 1_000_000_000) as u32,
        );
        self.deadline = self.deadline.checked_add(advance).unwrap_or(Duration::MAX);
        true
    }
}

/// Named timers of one component, keyed by `K`.
///
/// Ties between equal deadlines resolve in `K`'s ordering.
#[derive(Debug, Clone)]
pub struct TimerSet<K: Ord + Copy> {
    timers: BTreeMap<K, Timer>,
}

impl<K: Ord + Copy> TimerSet<K> {
    pub fn new() -> Self {
        Self {
            timers: BTreeMap::new(),
        }
    }

    /// Arms `kind`, replacing any pending timer of the same kind.
    pub fn arm(&mut self, kind: K, timer: Timer) {
        self.timers.insert(kind, timer);
    }

    /// Cancels `kind`. Returns whether it was armed.
    pub fn cancel(&mut self, kind: K) -> bool {
        self.timers.remove(&kind).is_some()
    }

    /// Cancels every timer. Returns how many were armed.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.timers.len();
        self.timers.clear();
        count
    }

    pub fn is_armed(&self, kind: K) -> bool {
        self.timers.contains_key(&kind)
    }

    pub fn get(&self, kind: K) -> Option<&Timer> {
        self.timers.get(&kind)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.values().map(Timer::deadline).min()
    }

    /// Pops the earliest due timer, rearming it if periodic.
    pub fn pop_due(&mut self, now: Duration) -> Option<K> {
        let (kind, timer) = self
            .timers
            .iter()
            .filter(|(_, t)| t.is_due(now))
            .min_by_key(|(kind, t)| (t.deadline(), **kind))
            .map(|(k, t)| (*k, *t))?;

        let mut timer = timer;
        if timer.rearm(now) {
            self.timers.insert(kind, timer);
        } else {
            self.timers.remove(&kind);
        }
        Some(kind)
    }
}

impl<K: Ord + Copy> Default for TimerSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum Kind {
        A,
        B,
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut set = TimerSet::new();
        set.arm(Kind::A, Timer::once(ms(100)));

        assert_eq!(set.pop_due(ms(99)), None);
        assert_eq!(set.pop_due(ms(100)), Some(Kind::A));
        assert_eq!(set.pop_due(ms(1_000)), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_periodic_rearms() {
        let mut set = TimerSet::new();
        set.arm(Kind::A, Timer::every(ms(100), ms(100)));

        assert_eq!(set.pop_due(ms(100)), Some(Kind::A));
        assert_eq!(set.next_deadline(), Some(ms(200)));
        assert_eq!(set.pop_due(ms(150)), None);
    }

    #[test]
    fn test_periodic_coalesces_missed_periods() {
        let mut set = TimerSet::new();
        set.arm(Kind::A, Timer::every(ms(100), ms(100)));

        assert_eq!(set.pop_due(ms(450)), Some(Kind::A));
        assert_eq!(set.pop_due(ms(450)), None);
        assert_eq!(set.next_deadline(), Some(ms(500)));
    }

    #[test]
    fn test_long_stall_rearms_past_now() {
        let mut timer = Timer::every(ms(1), ms(1));
        let stalled = Duration::from_secs(60 * 24 * 3600) + Duration::from_micros(500);

        assert!(timer.rearm(stalled));
        assert!(timer.deadline() > stalled);
        assert_eq!(timer.deadline(), Duration::from_secs(60 * 24 * 3600) + ms(1));
    }

    #[test]
    fn test_rearm_saturates_at_end_of_time() {
        let mut timer = Timer::every(Duration::MAX - ms(1), Duration::from_secs(3600));

        assert!(timer.rearm(Duration::MAX - ms(1)));
        assert_eq!(timer.deadline(), Duration::MAX);
    }

    #[test]
    fn test_earliest_deadline_first() {
        let mut set = TimerSet::new();
        set.arm(Kind::B, Timer::once(ms(50)));
        set.arm(Kind::A, Timer::once(ms(80)));

        assert_eq!(set.pop_due(ms(100)), Some(Kind::B));
        assert_eq!(set.pop_due(ms(100)), Some(Kind::A));
    }

    #[test]
    fn test_rearm_replaces() {
        let mut set = TimerSet::new();
        set.arm(Kind::A, Timer::once(ms(50)));
        set.arm(Kind::A, Timer::once(ms(500)));

        assert_eq!(set.active_count(), 1);
        assert_eq!(set.pop_due(ms(100)), None);
    }

    #[test]
    fn test_cancel_all() {
        let mut set = TimerSet::new();
        set.arm(Kind::A, Timer::every(ms(10), ms(10)));
        set.arm(Kind::B, Timer::once(ms(10)));

        assert_eq!(set.cancel_all(), 2);
        assert_eq!(set.cancel_all(), 0);
        assert_eq!(set.pop_due(ms(10_000)), None);
        assert_eq!(set.next_deadline(), None);
    }
}
