//! Typed configuration for every admission component.
//!
//! All structs deserialize with serde (missing fields fall back to [`Default`]) and are checked
//! once by [`TollgateConfig::validate`] before a controller is built or a live update is applied.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::{EndpointCategory, Tier};
use crate::error::ConfigError;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TollgateConfig {
    /// Per-tier multipliers and queue capacities.
    pub tiers: TierTable,
    /// Per-endpoint-category multipliers.
    pub endpoints: EndpointMultipliers,
    /// Load and time-of-day adjustments.
    pub dynamic: DynamicAdjustment,
    /// Organization, endpoint, and global scope settings.
    pub scopes: ScopeConfig,
    /// Threat scorer thresholds.
    pub threat: ThreatConfig,
    /// Deferred queue behavior.
    pub queue: QueueConfig,
    /// Background processor cadence.
    pub processor: ProcessorConfig,
    /// Request classification.
    pub classifier: ClassifierConfig,
    /// Bundled per-endpoint circuit breaker.
    pub breaker: BreakerConfig,
}

impl TollgateConfig {
    /// Reject configurations that would produce zero limits or nonsensical factors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("tiers.base_requests_per_minute", self.tiers.base_requests_per_minute)?;
        positive("tiers.base_burst_size", self.tiers.base_burst_size)?;
        for tier in Tier::ALL {
            let limits = self.tiers.limits(tier);
            positive(&format!("tiers.{}.multiplier", tier.as_str()), limits.multiplier)?;
        }
        for category in EndpointCategory::ALL {
            positive(
                &format!("endpoints.{}", category.as_str()),
                self.endpoints.multiplier(category),
            )?;
        }

        let d = &self.dynamic;
        in_range("dynamic.high_load_threshold", d.high_load_threshold, 0.0, 1.0)?;
        in_range("dynamic.high_load_factor", d.high_load_factor, 0.05, 1.0)?;
        positive("dynamic.business_hours_boost", d.business_hours_boost)?;
        if let Some(hours) = &d.business_hours {
            if hours.start_hour >= hours.end_hour || hours.end_hour > 24 {
                return Err(ConfigError::InvalidBusinessHours {
                    start: hours.start_hour,
                    end: hours.end_hour,
                });
            }
        }

        let s = &self.scopes;
        positive("scopes.organization_multiplier", s.organization_multiplier)?;
        positive("scopes.global_requests_per_minute", s.global_requests_per_minute)?;
        positive("scopes.endpoint_window_secs", s.endpoint_window_secs as f64)?;
        positive("scopes.burst_window_secs", s.burst_window_secs as f64)?;
        positive("scopes.global_window_secs", s.global_window_secs as f64)?;
        if s.burst_window_secs > s.endpoint_window_secs {
            return Err(ConfigError::OutOfRange {
                field: "scopes.burst_window_secs".into(),
                value: s.burst_window_secs as f64,
                min: 1.0,
                max: s.endpoint_window_secs as f64,
            });
        }

        let t = &self.threat;
        positive("threat.ddos_threshold", t.ddos_threshold as f64)?;
        positive("threat.distributed_threshold", t.distributed_threshold as f64)?;
        positive("threat.min_stddev", t.min_stddev)?;
        in_range("threat.min_relative_stddev", t.min_relative_stddev, 0.0, 1.0)?;

        let q = &self.queue;
        in_range("queue.occupancy_limit", q.occupancy_limit, 0.0, 1.0)?;
        positive("queue.max_queue_time_secs", q.max_queue_time_secs as f64)?;
        positive("queue.max_retry_attempts", q.max_retry_attempts as f64)?;
        positive("queue.lease_timeout_secs", q.lease_timeout_secs as f64)?;

        let p = &self.processor;
        positive("processor.interval_ms", p.interval_ms as f64)?;
        positive("processor.batch_size", p.batch_size as f64)?;
        positive("processor.execution_timeout_ms", p.execution_timeout_ms as f64)?;
        positive("processor.sweep_interval_secs", p.sweep_interval_secs as f64)?;
        in_range("processor.utilization_limit", p.utilization_limit, 0.0, 1.0)?;

        self.breaker.validate()
    }
}

/// Thresholds for [`EndpointCircuitBreakers`](crate::circuit_breaker::EndpointCircuitBreakers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Share of failed calls within the window that opens a closed breaker.
    pub failure_rate_threshold: f64,
    /// Calls the window must hold before the failure rate is judged.
    pub minimum_requests: u32,
    /// Length of the rolling window the failure rate is measured over.
    pub window_ms: u64,
    /// Time an open breaker waits before admitting probes.
    pub recovery_timeout_ms: u64,
    /// Probes admitted at once while half-open.
    pub half_open_max_calls: u32,
}

impl BreakerConfig {
    /// Recovery timeout as a duration.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// Reject zero thresholds and timeouts, and rates above one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("breaker.failure_rate_threshold", self.failure_rate_threshold)?;
        in_range("breaker.failure_rate_threshold", self.failure_rate_threshold, 0.0, 1.0)?;
        positive("breaker.minimum_requests", f64::from(self.minimum_requests))?;
        positive("breaker.window_ms", self.window_ms as f64)?;
        positive("breaker.recovery_timeout_ms", self.recovery_timeout_ms as f64)?;
        positive("breaker.half_open_max_calls", f64::from(self.half_open_max_calls))?;
        Ok(())
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_requests: 20,
            window_ms: 60_000,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 3,
        }
    }
}

fn positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field: field.to_string(), value })
    }
}

fn in_range(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field: field.to_string(), value, min, max })
    }
}

/// Limits attached to one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierLimits {
    /// Multiplier applied to the base rate and burst.
    pub multiplier: f64,
    /// Maximum number of deferred entries held for a tenant of this tier.
    pub queue_capacity: usize,
}

/// Base limits and the per-tier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    /// Requests per minute before any multiplier.
    pub base_requests_per_minute: f64,
    /// Burst size (per burst sub-window) before any multiplier.
    pub base_burst_size: f64,
    /// Free tier.
    pub free: TierLimits,
    /// Starter tier.
    pub starter: TierLimits,
    /// Professional tier.
    pub professional: TierLimits,
    /// Enterprise tier.
    pub enterprise: TierLimits,
}

impl TierTable {
    /// Limits for `tier`.
    pub fn limits(&self, tier: Tier) -> &TierLimits {
        match tier {
            Tier::Free => &self.free,
            Tier::Starter => &self.starter,
            Tier::Professional => &self.professional,
            Tier::Enterprise => &self.enterprise,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            base_requests_per_minute: 100.0,
            base_burst_size: 20.0,
            free: TierLimits { multiplier: 1.0, queue_capacity: 5 },
            starter: TierLimits { multiplier: 5.0, queue_capacity: 10 },
            professional: TierLimits { multiplier: 20.0, queue_capacity: 50 },
            enterprise: TierLimits { multiplier: 100.0, queue_capacity: 200 },
        }
    }
}

/// Multipliers per endpoint category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointMultipliers {
    /// `/orchestration`
    pub orchestration: f64,
    /// `/agents`
    pub agents: f64,
    /// `/security`
    pub security: f64,
    /// `/webhooks`
    pub webhooks: f64,
    /// `/api`
    pub api: f64,
    /// Everything else.
    pub web: f64,
}

impl EndpointMultipliers {
    /// Multiplier for `category`.
    pub fn multiplier(&self, category: EndpointCategory) -> f64 {
        match category {
            EndpointCategory::Orchestration => self.orchestration,
            EndpointCategory::Agents => self.agents,
            EndpointCategory::Security => self.security,
            EndpointCategory::Webhooks => self.webhooks,
            EndpointCategory::Api => self.api,
            EndpointCategory::Web => self.web,
        }
    }
}

impl Default for EndpointMultipliers {
    fn default() -> Self {
        Self { orchestration: 0.5, agents: 0.8, security: 0.3, webhooks: 2.0, api: 1.0, web: 1.5 }
    }
}

/// UTC window in which limits are boosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// First hour inside the window.
    pub start_hour: u32,
    /// First hour after the window.
    pub end_hour: u32,
    /// Only apply Monday through Friday.
    pub weekdays_only: bool,
}

/// Load- and time-based adjustments applied on top of tier limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicAdjustment {
    /// System load (0..=1) above which limits are reduced.
    pub high_load_threshold: f64,
    /// Factor applied under high load.
    pub high_load_factor: f64,
    /// Boost window; `None` disables the boost.
    pub business_hours: Option<BusinessHours>,
    /// Factor applied inside the business-hours window.
    pub business_hours_boost: f64,
}

impl Default for DynamicAdjustment {
    fn default() -> Self {
        Self {
            high_load_threshold: 0.8,
            high_load_factor: 0.5,
            business_hours: Some(BusinessHours { start_hour: 9, end_hour: 17, weekdays_only: true }),
            business_hours_boost: 1.2,
        }
    }
}

/// Settings for the organization, endpoint, and global scopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Organization bucket capacity relative to a single client when the tenant has no cap.
    pub organization_multiplier: f64,
    /// Endpoint sliding window length.
    pub endpoint_window_secs: u64,
    /// Burst sub-window length.
    pub burst_window_secs: u64,
    /// Platform-wide fixed-window limit.
    pub global_requests_per_minute: f64,
    /// Global fixed window length.
    pub global_window_secs: u64,
    /// Extra TTL kept on fixed-window counters.
    pub window_buffer_secs: u64,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            organization_multiplier: 10.0,
            endpoint_window_secs: 60,
            burst_window_secs: 10,
            global_requests_per_minute: 10_000.0,
            global_window_secs: 60,
            window_buffer_secs: 10,
        }
    }
}

/// Threat scorer thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    /// Requests per minute from one IP considered a flood.
    pub ddos_threshold: u64,
    /// Platform-wide requests per minute considered a distributed flood.
    pub distributed_threshold: u64,
    /// Samples a feature needs before it participates in anomaly scoring.
    pub min_samples: u64,
    /// Lower bound on the standard deviation used in z-scores.
    pub min_stddev: f64,
    /// Lower bound on the standard deviation as a fraction of the historical mean.
    pub min_relative_stddev: f64,
    /// Feature statistic TTL, refreshed on every write.
    pub statistic_ttl_secs: u64,
    /// Reputation cache TTL.
    pub reputation_ttl_secs: u64,
    /// Window for failed authentication attempts.
    pub brute_force_window_secs: u64,
    /// Path prefixes treated as authentication endpoints.
    pub auth_path_prefixes: Vec<String>,
    /// Cooldown applied after a critical verdict.
    pub cooldown_critical_secs: u64,
    /// Cooldown applied after a high verdict.
    pub cooldown_high_secs: u64,
    /// Cooldown applied otherwise.
    pub cooldown_default_secs: u64,
}

impl ThreatConfig {
    /// Cooldown for a blocking verdict.
    pub fn cooldown_for(&self, level: crate::threat::ThreatLevel) -> Duration {
        use crate::threat::ThreatLevel;
        let secs = match level {
            ThreatLevel::Critical => self.cooldown_critical_secs,
            ThreatLevel::High => self.cooldown_high_secs,
            _ => self.cooldown_default_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            ddos_threshold: 1_000,
            distributed_threshold: 50_000,
            min_samples: 10,
            min_stddev: 1.0,
            min_relative_stddev: 0.5,
            statistic_ttl_secs: 86_400,
            reputation_ttl_secs: 3_600,
            brute_force_window_secs: 300,
            auth_path_prefixes: vec![
                "/auth".into(),
                "/login".into(),
                "/oauth".into(),
                "/api/auth".into(),
                "/api/login".into(),
                "/api/token".into(),
            ],
            cooldown_critical_secs: 3_600,
            cooldown_high_secs: 900,
            cooldown_default_secs: 300,
        }
    }
}

/// Deferred queue behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue rejected requests at all.
    pub enabled: bool,
    /// Entries older than this are never executed.
    pub max_queue_time_secs: u64,
    /// Fraction of tier capacity at which new entries are refused.
    pub occupancy_limit: f64,
    /// Total replay attempts before dead-lettering.
    pub max_retry_attempts: u32,
    /// Cap on the priority penalty added per retry.
    pub max_retry_penalty: u32,
    /// First retry delay.
    pub retry_base_delay_ms: u64,
    /// Retry delay ceiling.
    pub retry_max_delay_ms: u64,
    /// Claimed entries not acknowledged within this window return to the queue.
    pub lease_timeout_secs: u64,
}

impl QueueConfig {
    /// `max_queue_time` as a duration.
    pub fn max_queue_time(&self) -> Duration {
        Duration::from_secs(self.max_queue_time_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_queue_time_secs: 300,
            occupancy_limit: 0.8,
            max_retry_attempts: 3,
            max_retry_penalty: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            lease_timeout_secs: 60,
        }
    }
}

/// Background processor cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Pause between drain iterations.
    pub interval_ms: u64,
    /// Entries claimed per tenant per iteration.
    pub batch_size: usize,
    /// Expiry sweep cadence.
    pub sweep_interval_secs: u64,
    /// Timeout for one replay.
    pub execution_timeout_ms: u64,
    /// Tenants at or above this utilization are skipped.
    pub utilization_limit: f64,
}

impl ProcessorConfig {
    /// Loop interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Replay timeout.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            batch_size: 10,
            sweep_interval_secs: 300,
            execution_timeout_ms: 30_000,
            utilization_limit: 0.8,
        }
    }
}

/// Request classification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Header carrying an explicit tenant id.
    pub tenant_header: String,
    /// Paths always classified as critical.
    pub critical_paths: Vec<String>,
    /// TTL of cached tenant lookups.
    pub tenant_cache_ttl_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            tenant_header: "x-tenant-id".into(),
            critical_paths: vec![
                "/health".into(),
                "/healthz".into(),
                "/ready".into(),
                "/security/alerts".into(),
                "/security/incidents".into(),
            ],
            tenant_cache_ttl_secs: 60,
        }
    }
}
