//! Online threat scoring.
//!
//! Seven independent signals are computed per request and the verdict is the strongest of them:
//!
//! | signal        | observation                                          |
//! |---------------|------------------------------------------------------|
//! | flood         | requests per IP over a rolling minute                |
//! | distributed   | platform-wide requests in the current minute         |
//! | bot           | user agent, browser headers, timing regularity       |
//! | scraping      | path diversity, export endpoints, missing referer    |
//! | brute_force   | failed authentications per IP (auth endpoints only)  |
//! | anomaly       | z-score of request shape against running statistics  |
//! | reputation    | external IP reputation feed                          |
//!
//! A store outage degrades only the affected signal to [`ThreatLevel::None`] and marks the
//! assessment `fail_open`.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::adaptive::DynamicConfig;
use crate::classifier::{path_has_prefix, ClassifiedRequest, RequestDescriptor};
use crate::clock::Clock;
use crate::config::ThreatConfig;
use crate::error::StoreError;
use crate::store::AtomicStore;

pub mod reputation;
pub mod signals;
pub mod stats;

pub use reputation::{ReputationLookup, ReputationSource, StaticReputation};
pub use stats::{FeatureStatistics, RequestFeatures, StatisticsSettings};

const FLOOD_WINDOW_MS: u64 = 60_000;
const RECENT_TIMESTAMPS: usize = 10;
const RECENT_PATHS: usize = 20;
const HISTORY_TTL: Duration = Duration::from_secs(3_600);

/// Severity, ordered `None < Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    /// Nothing suspicious.
    #[default]
    None = 0,
    /// Worth noting.
    Low = 1,
    /// Suspicious.
    Medium = 2,
    /// Blocked.
    High = 3,
    /// Blocked with the longest cooldown.
    Critical = 4,
}

impl ThreatLevel {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::None => "none",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }

    /// High and critical verdicts reject the request.
    pub fn is_blocking(&self) -> bool {
        *self >= ThreatLevel::High
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one signal plus the raw score behind it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalScore {
    /// Level assigned by the signal.
    pub level: ThreatLevel,
    /// Raw measurement (ratio, probability, count, z-score or reputation).
    pub score: f64,
}

impl SignalScore {
    /// Build a score.
    pub fn new(level: ThreatLevel, score: f64) -> Self {
        Self { level, score }
    }

    /// Signal that saw nothing.
    pub fn none() -> Self {
        Self::default()
    }
}

/// All seven sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ThreatSignals {
    /// Single-IP flood.
    pub flood: SignalScore,
    /// Platform-wide flood.
    pub distributed: SignalScore,
    /// Automated client.
    pub bot: SignalScore,
    /// Content scraping.
    pub scraping: SignalScore,
    /// Credential guessing.
    pub brute_force: SignalScore,
    /// Unusual request shape.
    pub anomaly: SignalScore,
    /// Known-bad address.
    pub reputation: SignalScore,
}

impl ThreatSignals {
    /// `(name, score)` pairs.
    pub fn named(&self) -> [(&'static str, SignalScore); 7] {
        [
            ("flood", self.flood),
            ("distributed", self.distributed),
            ("bot", self.bot),
            ("scraping", self.scraping),
            ("brute_force", self.brute_force),
            ("anomaly", self.anomaly),
            ("reputation", self.reputation),
        ]
    }

    /// Strongest signal; earlier signals win ties.
    pub fn strongest(&self) -> (&'static str, ThreatLevel) {
        self.named()
            .into_iter()
            .fold(("none", ThreatLevel::None), |best, (name, s)| {
                if s.level > best.1 {
                    (name, s.level)
                } else {
                    best
                }
            })
    }
}

/// Combined verdict for one request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct ThreatAssessment {
    /// Maximum level across signals.
    pub level: ThreatLevel,
    /// Signal that produced `level`.
    pub primary: &'static str,
    /// Every sub-score.
    pub signals: ThreatSignals,
    /// At least one signal could not reach the store.
    pub fail_open: bool,
}

/// Scores requests against shared counters and running statistics.
#[derive(Debug)]
pub struct ThreatScorer {
    store: Arc<dyn AtomicStore>,
    config: DynamicConfig<ThreatConfig>,
    reputation: Option<ReputationLookup>,
    stats: FeatureStatistics,
    clock: Arc<dyn Clock>,
}

impl ThreatScorer {
    /// Scorer without a reputation feed.
    pub fn new(store: Arc<dyn AtomicStore>, config: ThreatConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config: DynamicConfig::new(config),
            reputation: None,
            stats: FeatureStatistics,
            clock,
        }
    }

    /// Consult `source` (cached for `reputation_ttl_secs`).
    pub fn with_reputation(mut self, source: Arc<dyn ReputationSource>) -> Self {
        let ttl = Duration::from_secs(self.config.get().reputation_ttl_secs);
        self.reputation = Some(ReputationLookup::new(source, ttl, self.clock.clone()));
        self
    }

    /// Swap thresholds.
    pub fn set_config(&self, config: ThreatConfig) {
        self.config.set(config);
    }

    /// Score one request. Counters are updated as a side effect.
    pub async fn assess(
        &self,
        req: &RequestDescriptor,
        classified: &ClassifiedRequest,
    ) -> ThreatAssessment {
        let cfg = self.config.get();
        let now = self.clock.now_millis();
        let (flood, distributed, bot, scraping, brute_force, anomaly, reputation) = futures::join!(
            self.flood(req, &cfg, now),
            self.distributed(&cfg, now),
            self.bot(req, classified, now),
            self.scraping(req, classified),
            self.brute_force(req, &cfg, now),
            self.anomaly(req, &cfg, now),
            self.reputation(req),
        );

        let mut fail_open = false;
        let mut settle = |name: &'static str, result: Result<SignalScore, StoreError>| {
            result.unwrap_or_else(|err| {
                error!(target: "tollgate::threat", signal = name, error = %err, "threat store unavailable; signal skipped");
                fail_open = true;
                SignalScore::none()
            })
        };
        let signals = ThreatSignals {
            flood: settle("flood", flood),
            distributed: settle("distributed", distributed),
            bot: settle("bot", bot),
            scraping: settle("scraping", scraping),
            brute_force: settle("brute_force", brute_force),
            anomaly: settle("anomaly", anomaly),
            reputation,
        };
        let (primary, level) = signals.strongest();
        debug!(
            target: "tollgate::threat",
            client = %classified.client,
            level = level.as_str(),
            primary,
            "threat assessed"
        );
        ThreatAssessment { level, primary, signals, fail_open }
    }

    /// Record a failed authentication from `ip`; returns failures in the current window.
    pub async fn record_auth_failure(&self, ip: IpAddr) -> Result<u64, StoreError> {
        let window = self.config.get().brute_force_window_secs * 1000;
        self.store.count_events(&auth_key(ip), self.clock.now_millis(), window, true).await
    }

    async fn flood(
        &self,
        req: &RequestDescriptor,
        cfg: &ThreatConfig,
        now: u64,
    ) -> Result<SignalScore, StoreError> {
        let Some(ip) = req.ip else {
            return Ok(SignalScore::none());
        };
        let count =
            self.store.count_events(&format!("threat:ip:{ip}"), now, FLOOD_WINDOW_MS, true).await?;
        Ok(signals::flood(count, cfg.ddos_threshold))
    }

    async fn distributed(&self, cfg: &ThreatConfig, now: u64) -> Result<SignalScore, StoreError> {
        let key = format!("threat:global:{}", now / FLOOD_WINDOW_MS);
        let count = self.store.incr(&key, Duration::from_millis(2 * FLOOD_WINDOW_MS)).await?;
        Ok(signals::distributed(count, cfg.distributed_threshold))
    }

    async fn bot(
        &self,
        req: &RequestDescriptor,
        classified: &ClassifiedRequest,
        now: u64,
    ) -> Result<SignalScore, StoreError> {
        let key = format!("threat:ts:{}", classified.client);
        let recent =
            self.store.push_recent(&key, now.to_string(), RECENT_TIMESTAMPS, HISTORY_TTL).await?;
        let timestamps: Vec<u64> = recent.iter().filter_map(|s| s.parse().ok()).collect();
        let score = signals::union(&[
            signals::user_agent(req.user_agent.as_deref()),
            signals::missing_headers(req),
            signals::regular_intervals(&timestamps),
            signals::missing_fingerprint(req, classified.category),
        ]);
        Ok(signals::bot(score))
    }

    async fn scraping(
        &self,
        req: &RequestDescriptor,
        classified: &ClassifiedRequest,
    ) -> Result<SignalScore, StoreError> {
        let key = format!("threat:paths:{}", classified.client);
        let path = req.path_only();
        let recent =
            self.store.push_recent(&key, path.to_string(), RECENT_PATHS, HISTORY_TTL).await?;
        let score = signals::union(&[
            signals::path_diversity(&recent),
            signals::export_path(path),
            signals::missing_referer(req),
        ]);
        Ok(signals::scraping(score))
    }

    async fn brute_force(
        &self,
        req: &RequestDescriptor,
        cfg: &ThreatConfig,
        now: u64,
    ) -> Result<SignalScore, StoreError> {
        let Some(ip) = req.ip else {
            return Ok(SignalScore::none());
        };
        let path = req.path_only();
        if !cfg.auth_path_prefixes.iter().any(|p| path_has_prefix(path, p)) {
            return Ok(SignalScore::none());
        }
        let window = cfg.brute_force_window_secs * 1000;
        let failures = self.store.count_events(&auth_key(ip), now, window, false).await?;
        Ok(signals::brute_force(failures))
    }

    async fn anomaly(
        &self,
        req: &RequestDescriptor,
        cfg: &ThreatConfig,
        now: u64,
    ) -> Result<SignalScore, StoreError> {
        let settings = StatisticsSettings {
            min_samples: cfg.min_samples,
            min_stddev: cfg.min_stddev,
            min_relative_stddev: cfg.min_relative_stddev,
            ttl: Duration::from_secs(cfg.statistic_ttl_secs),
        };
        let features = RequestFeatures::extract(req, now);
        let z = self.stats.max_z(self.store.as_ref(), &features, &settings).await?;
        self.stats.update(self.store.as_ref(), &features, &settings).await?;
        Ok(z.map_or_else(SignalScore::none, |(_, z)| signals::anomaly(z)))
    }

    async fn reputation(&self, req: &RequestDescriptor) -> SignalScore {
        let (Some(lookup), Some(ip)) = (&self.reputation, req.ip) else {
            return SignalScore::none();
        };
        match lookup.score(ip).await {
            Some(score) => signals::reputation(score),
            None => SignalScore::none(),
        }
    }
}

fn auth_key(ip: IpAddr) -> String {
    format!("threat:auth:{ip}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClientIdentity, EndpointCategory, Priority, Tier};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::FailingStore;

    fn browser(path: &str) -> RequestDescriptor {
        let mut req = RequestDescriptor::new("GET", path)
            .with_header("accept", "text/html")
            .with_header("accept-language", "en-US")
            .with_header("accept-encoding", "gzip")
            .with_header("referer", "https://app.example/")
            .with_header("x-client-fingerprint", "abc");
        req.ip = Some("198.51.100.4".parse().unwrap());
        req.user_agent = Some("Mozilla/5.0 (Macintosh) Safari/605.1".into());
        req
    }

    fn classified(category: EndpointCategory) -> ClassifiedRequest {
        ClassifiedRequest {
            client: ClientIdentity::from_raw("fp:test"),
            tenant: None,
            tier: Tier::Free,
            category,
            priority: Priority::Low,
            real_time: false,
            batch: false,
        }
    }

    fn scorer(config: ThreatConfig) -> (ThreatScorer, ManualClock) {
        let clock = ManualClock::new(1_704_582_000_000);
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        (ThreatScorer::new(store, config, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn levels_are_ordered() {
        assert!(ThreatLevel::Critical > ThreatLevel::High);
        assert!(ThreatLevel::Low > ThreatLevel::None);
        assert!(ThreatLevel::High.is_blocking());
        assert!(!ThreatLevel::Medium.is_blocking());
    }

    #[tokio::test]
    async fn ordinary_browser_request_is_clean() {
        let (scorer, _) = scorer(ThreatConfig::default());
        let out = scorer.assess(&browser("/dashboard"), &classified(EndpointCategory::Web)).await;
        assert_eq!(out.level, ThreatLevel::None);
        assert!(!out.fail_open);
    }

    #[tokio::test]
    async fn flood_escalates_with_rate() {
        let cfg = ThreatConfig { ddos_threshold: 10, ..ThreatConfig::default() };
        let (scorer, clock) = scorer(cfg);
        let req = browser("/dashboard");
        let mut levels = Vec::new();
        for _ in 0..10 {
            clock.advance(1_000 + levels.len() as u64 * 37);
            levels.push(scorer.assess(&req, &classified(EndpointCategory::Web)).await.signals.flood.level);
        }
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(levels[5], ThreatLevel::Medium);
        assert_eq!(levels[7], ThreatLevel::High);
        assert_eq!(levels[9], ThreatLevel::Critical);
    }

    #[tokio::test]
    async fn brute_force_only_on_auth_paths() {
        let (scorer, _) = scorer(ThreatConfig::default());
        let req = browser("/auth/login");
        let ip = req.ip.unwrap();
        for _ in 0..11 {
            scorer.record_auth_failure(ip).await.unwrap();
        }
        let out = scorer.assess(&req, &classified(EndpointCategory::Web)).await;
        assert_eq!(out.signals.brute_force.level, ThreatLevel::High);
        assert_eq!(out.level, ThreatLevel::High);
        assert_eq!(out.primary, "brute_force");

        let elsewhere = scorer.assess(&browser("/dashboard"), &classified(EndpointCategory::Web)).await;
        assert_eq!(elsewhere.signals.brute_force.level, ThreatLevel::None);
    }

    #[tokio::test]
    async fn reputation_feed_blocks_known_bad_ip() {
        let feed = StaticReputation::new();
        let req = browser("/dashboard");
        feed.insert(req.ip.unwrap(), 92);
        let (scorer, _) = scorer(ThreatConfig::default());
        let scorer = scorer.with_reputation(Arc::new(feed));
        let out = scorer.assess(&req, &classified(EndpointCategory::Web)).await;
        assert_eq!(out.level, ThreatLevel::High);
        assert_eq!(out.primary, "reputation");
    }

    #[tokio::test]
    async fn store_outage_degrades_to_none() {
        let clock = Arc::new(ManualClock::new(0));
        let scorer = ThreatScorer::new(Arc::new(FailingStore), ThreatConfig::default(), clock);
        let out = scorer.assess(&browser("/auth/login"), &classified(EndpointCategory::Web)).await;
        assert_eq!(out.level, ThreatLevel::None);
        assert!(out.fail_open);
    }
}
