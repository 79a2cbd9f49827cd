//! Scripted collaborators for unit tests: a manual clock, a socket that
//! records frames, and a token source that can be told to fail.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lifeline_env::{EnvError, GeoFix, IpLocator, LifelineContext, SocketTransport, TokenSource};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Context whose clock only moves when told to.
pub struct ManualContext {
    now: Mutex<Duration>,
    rng: Mutex<ChaCha8Rng>,
    seed: u64,
}

impl ManualContext {
    pub fn new(seed: u64) -> Self {
        Self {
            now: Mutex::new(Duration::ZERO),
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            seed,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

#[async_trait]
impl LifelineContext for ManualContext {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000) + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn random_unit(&self) -> f64 {
        self.rng.lock().unwrap().gen::<f64>()
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buf);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

/// Socket that records every frame written while open.
#[derive(Default)]
pub struct FakeSocket {
    open: AtomicBool,
    fail_opens: AtomicU32,
    fail_sends: AtomicBool,
    closes: AtomicUsize,
    opened: Mutex<Vec<String>>,
    sent: Mutex<Vec<String>>,
}

impl FakeSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn opened_uris(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketTransport for FakeSocket {
    async fn open(&self, uri: &str) -> Result<(), EnvError> {
        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(EnvError::network("connection refused"));
        }
        self.opened.lock().unwrap().push(uri.to_string());
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send_text(&self, frame: String) -> Result<(), EnvError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(EnvError::network("socket not open"));
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(EnvError::network("write failed"));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Issues `token-1`, `token-2`, ... unless told to fail.
#[derive(Default)]
pub struct FakeTokens {
    calls: AtomicU32,
    failures: AtomicU32,
}

impl FakeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for FakeTokens {
    async fn fetch_token(&self) -> Result<String, EnvError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EnvError::token("issuer unavailable"));
        }
        Ok(format!("token-{n}"))
    }
}

/// Locator returning a fixed fix, or failing.
pub struct FixedLocator {
    pub fix: Option<GeoFix>,
    pub calls: AtomicU32,
}

impl FixedLocator {
    pub fn new(fix: Option<GeoFix>) -> Self {
        Self { fix, calls: AtomicU32::new(0) }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IpLocator for FixedLocator {
    async fn locate(&self) -> Result<GeoFix, EnvError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fix.ok_or_else(|| EnvError::locate("no route to locator"))
    }
}
