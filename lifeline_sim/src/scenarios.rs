//! Fault scenarios for DST.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// DST-001: Random severs plus lost acknowledgments
    FlakyLink,

    /// DST-002: Socket stays "open" but carries nothing
    HalfOpen,

    /// DST-003: Host offline while the user keeps sending
    OfflineBurst,

    /// DST-004: Token issuer unavailable at startup
    TokenOutage,

    /// DST-005: Sensor, relay and IP samples with glitches
    MultiSource,

    /// DST-006: Same recording, same speed, same fused output
    ReplayDeterminism,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FlakyLink,
            ScenarioId::HalfOpen,
            ScenarioId::OfflineBurst,
            ScenarioId::TokenOutage,
            ScenarioId::MultiSource,
            ScenarioId::ReplayDeterminism,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FlakyLink => "flaky_link",
            ScenarioId::HalfOpen => "half_open",
            ScenarioId::OfflineBurst => "offline_burst",
            ScenarioId::TokenOutage => "token_outage",
            ScenarioId::MultiSource => "multi_source",
            ScenarioId::ReplayDeterminism => "replay_determinism",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FlakyLink => "Random severs and 20% ack loss; every send delivered once after dedup",
            ScenarioId::HalfOpen => "Silent link; watchdog marks UNSTABLE then forces a reconnect",
            ScenarioId::OfflineBurst => "20s offline with queued sends; no attempts while offline, FIFO replay after",
            ScenarioId::TokenOutage => "45s token outage; bounded backoff, prompt recovery",
            ScenarioId::MultiSource => "Sensor + relay + IP fusion with 5% glitches; glitches rejected, low error",
            ScenarioId::ReplayDeterminism => "Two replays of one recording produce identical fused tracks",
        }
    }

    /// Whether the scenario exercises the connection machine.
    pub fn is_messaging(&self) -> bool {
        matches!(
            self,
            ScenarioId::FlakyLink | ScenarioId::HalfOpen | ScenarioId::OfflineBurst | ScenarioId::TokenOutage
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flaky_link" | "flakylink" | "dst-001" => Ok(ScenarioId::FlakyLink),
            "half_open" | "halfopen" | "dst-002" => Ok(ScenarioId::HalfOpen),
            "offline_burst" | "offlineburst" | "dst-003" => Ok(ScenarioId::OfflineBurst),
            "token_outage" | "tokenoutage" | "dst-004" => Ok(ScenarioId::TokenOutage),
            "multi_source" | "multisource" | "dst-005" => Ok(ScenarioId::MultiSource),
            "replay_determinism" | "replaydeterminism" | "dst-006" => Ok(ScenarioId::ReplayDeterminism),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
