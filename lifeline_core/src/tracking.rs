//! Tracking session - the runtime that ties the location engines to a
//! context.
//!
//! One session owns one [`FusionEngine`] and one [`ReplayEngine`]; sensor,
//! relay, IP-estimate and replay samples all funnel into the same
//! `ingest`. The session also gates the IP fallback: when the host goes
//! offline it asks for exactly one coarse IP fix per offline condition,
//! and never retries a failed lookup.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use lifeline_env::{Connectivity, GeoFix, IpLocator, LifelineContext, SessionId};
use tracing::{debug, info, warn};

use crate::fusion::{FusionConfig, FusionEngine, FusionState, FusionStats};
use crate::replay::{ReplayConfig, ReplayEngine, ReplayProgress};
use crate::sample::{LocationSample, LocationSource};

/// Location side of a live session.
pub struct TrackingSession<Ctx: LifelineContext> {
    context: Arc<Ctx>,
    session_id: SessionId,
    fusion: FusionEngine,
    replay: ReplayEngine,
    connectivity: Connectivity,

    /// IP fallback already requested for the current offline condition
    ip_fallback_used: bool,

    torn_down: bool,
}

impl<Ctx: LifelineContext> TrackingSession<Ctx> {
    pub fn new(
        context: Arc<Ctx>,
        fusion: FusionConfig,
        replay: ReplayConfig,
        on_fused: impl FnMut(&LocationSample) + Send + 'static,
    ) -> Self {
        let session_id = SessionId::from_seed(context.seed() ^ context.now().as_nanos() as u64);
        Self {
            context,
            session_id,
            fusion: FusionEngine::new(fusion, on_fused),
            replay: ReplayEngine::new(replay),
            connectivity: Connectivity::Online,
            ip_fallback_used: false,
            torn_down: false,
        }
    }

    /// Feeds a live sample (sensor, relay or IP estimate).
    pub fn ingest(&mut self, sample: LocationSample) -> Option<LocationSample> {
        if self.torn_down {
            debug!(session = %self.session_id, "sample after teardown dropped");
            return None;
        }
        self.fusion.ingest(sample)
    }

    pub fn start_replay(&mut self, frames: Vec<LocationSample>) -> bool {
        if self.torn_down {
            return false;
        }
        self.replay.start(frames, self.context.now())
    }

    pub fn stop_replay(&mut self) -> bool {
        self.replay.stop()
    }

    pub fn set_replay_speed(&mut self, multiplier: f64) {
        self.replay.set_speed(multiplier, self.context.now());
    }

    /// Emits due replay frames into the fusion engine.
    pub fn poll(&mut self) -> usize {
        if self.torn_down {
            return 0;
        }
        let now = self.context.now();
        self.replay.poll(now, &mut self.fusion)
    }

    /// Records a connectivity change.
    ///
    /// Returns `true` exactly once per offline condition: the caller
    /// should then request an IP estimate.
    pub fn set_connectivity(&mut self, connectivity: Connectivity) -> bool {
        let previous = std::mem::replace(&mut self.connectivity, connectivity);
        match connectivity {
            Connectivity::Online => {
                if previous == Connectivity::Offline {
                    debug!(session = %self.session_id, "back online, IP fallback re-armed");
                }
                self.ip_fallback_used = false;
                false
            }
            Connectivity::Offline => {
                if self.ip_fallback_used || self.torn_down {
                    return false;
                }
                self.ip_fallback_used = true;
                true
            }
        }
    }

    /// One-shot IP lookup fed through `ingest`. Failures are logged and
    /// not retried.
    pub async fn request_ip_estimate<L>(&mut self, locator: &L) -> Option<LocationSample>
    where
        L: IpLocator + ?Sized,
    {
        match locator.locate().await {
            Ok(fix) => {
                let sample = self.ip_sample(fix);
                info!(
                    session = %self.session_id,
                    accuracy_m = sample.accuracy_meters,
                    "IP estimate received"
                );
                self.ingest(sample)
            }
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "IP estimate failed");
                None
            }
        }
    }

    /// `set_connectivity` followed by the IP lookup when it is due.
    pub async fn on_connectivity<L>(&mut self, connectivity: Connectivity, locator: &L) -> Option<LocationSample>
    where
        L: IpLocator + ?Sized,
    {
        if self.set_connectivity(connectivity) {
            self.request_ip_estimate(locator).await
        } else {
            None
        }
    }

    fn ip_sample(&self, fix: GeoFix) -> LocationSample {
        let timestamp_ms = self
            .context
            .system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        LocationSample::new(fix.lat, fix.lng, fix.accuracy_meters, timestamp_ms, LocationSource::IpEstimate)
    }

    /// Stops replay and refuses further input. Idempotent.
    pub fn teardown(&mut self) {
        if std::mem::replace(&mut self.torn_down, true) {
            return;
        }
        self.replay.stop();
        info!(session = %self.session_id, stats = ?self.fusion.stats(), "tracking session closed");
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> Option<FusionState> {
        self.fusion.state()
    }

    pub fn stats(&self) -> FusionStats {
        self.fusion.stats()
    }

    pub fn replay_progress(&self) -> ReplayProgress {
        self.replay.progress()
    }

    pub fn is_replaying(&self) -> bool {
        self.replay.is_active()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.replay.next_deadline()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{FixedLocator, ManualContext};
    use std::sync::Mutex;

    fn session() -> (Arc<ManualContext>, TrackingSession<ManualContext>, Arc<Mutex<Vec<LocationSample>>>) {
        let ctx = Arc::new(ManualContext::new(3));
        let fused = Arc::new(Mutex::new(Vec::new()));
        let out = fused.clone();
        let session = TrackingSession::new(ctx.clone(), FusionConfig::default(), ReplayConfig::default(), move |s| {
            out.lock().unwrap().push(*s)
        });
        (ctx, session, fused)
    }

    fn sensor(lat: f64, t: i64) -> LocationSample {
        LocationSample::new(lat, 2.3522, 12.0, t, LocationSource::Sensor)
    }

    #[test]
    fn test_ip_fallback_once_per_offline_condition() {
        let (_, mut session, _) = session();

        assert!(!session.set_connectivity(Connectivity::Online));
        assert!(session.set_connectivity(Connectivity::Offline));
        assert!(!session.set_connectivity(Connectivity::Offline));

        assert!(!session.set_connectivity(Connectivity::Online));
        assert!(session.set_connectivity(Connectivity::Offline));
    }

    #[tokio::test]
    async fn test_ip_estimate_feeds_fusion() {
        let (_, mut session, fused) = session();
        let locator = FixedLocator::new(Some(GeoFix { lat: 48.85, lng: 2.35, accuracy_meters: 1500.0 }));

        let sample = session.on_connectivity(Connectivity::Offline, &locator).await;

        assert!(sample.is_some());
        assert_eq!(fused.lock().unwrap()[0].source, LocationSource::IpEstimate);
        assert_eq!(locator.calls(), 1);

        // Still offline: no second lookup
        session.on_connectivity(Connectivity::Offline, &locator).await;
        assert_eq!(locator.calls(), 1);
    }

    #[tokio::test]
    async fn test_ip_failure_not_retried() {
        let (_, mut session, fused) = session();
        let locator = FixedLocator::new(None);

        assert!(session.on_connectivity(Connectivity::Offline, &locator).await.is_none());
        assert!(session.on_connectivity(Connectivity::Offline, &locator).await.is_none());

        assert_eq!(locator.calls(), 1);
        assert!(fused.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ip_estimate_too_coarse_is_rejected() {
        let (_, mut session, _) = session();
        session.ingest(sensor(48.85, 1_700_000_000_000));
        let locator = FixedLocator::new(Some(GeoFix { lat: 48.85, lng: 2.35, accuracy_meters: 5000.0 }));

        assert!(session.on_connectivity(Connectivity::Offline, &locator).await.is_none());
        assert_eq!(session.stats().rejected, 1);
    }

    #[test]
    fn test_replay_and_live_share_one_estimate() {
        let (ctx, mut session, fused) = session();
        session.ingest(sensor(48.8566, 1_700_000_000_000));

        let frames = (1..=3).map(|i| sensor(48.8566 + i as f64 * 0.00005, 1_700_000_000_000 + i * 1_000)).collect();
        assert!(session.start_replay(frames));

        ctx.advance(Duration::from_secs(3));
        assert_eq!(session.poll(), 3);
        assert!(!session.is_replaying());

        let fused = fused.lock().unwrap();
        assert_eq!(fused.len(), 4);
        assert!(fused[1..].iter().all(|s| s.source == LocationSource::Replay));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (ctx, mut session, fused) = session();
        session.start_replay(vec![sensor(48.85, 1), sensor(48.85, 2)]);

        session.teardown();
        session.teardown();
        assert!(session.is_torn_down());
        assert_eq!(session.next_deadline(), None);

        ctx.advance(Duration::from_secs(10));
        assert_eq!(session.poll(), 0);
        assert!(session.ingest(sensor(48.85, 3)).is_none());
        assert!(fused.lock().unwrap().is_empty());
    }
}
