//! Resolves tier, endpoint, tenant and load adjustments into concrete per-scope limits.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::DynamicConfig;
use crate::classifier::{ClassifiedRequest, ClientIdentity, EndpointCategory, Priority, Tenant};
use crate::clock::{CalendarTime, Clock};
use crate::config::{DynamicAdjustment, TollgateConfig};

/// Source of the current system load, `0.0..=1.0`.
pub trait LoadProbe: Send + Sync + Debug {
    /// Current load.
    fn load(&self) -> f64;
}

/// Load value set by the host (or a test).
#[derive(Debug, Clone, Default)]
pub struct FixedLoad {
    bits: Arc<AtomicU64>,
}

impl FixedLoad {
    /// Probe reporting `load`.
    pub fn new(load: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(load.to_bits())) }
    }

    /// Update the reported load; clones observe it.
    pub fn set(&self, load: f64) {
        self.bits.store(load.to_bits(), Ordering::Relaxed);
    }
}

impl LoadProbe for FixedLoad {
    fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Token-bucket scope limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimit {
    /// Bucket size; also the refill rate per minute.
    pub capacity: f64,
}

/// Sliding-window scope limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    /// Requests per window.
    pub limit: u64,
    /// Requests per burst sub-window.
    pub burst: u64,
    /// Window length.
    pub window: Duration,
    /// Burst sub-window length.
    pub burst_window: Duration,
}

/// Fixed-window scope limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedLimit {
    /// Requests per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
    /// Extra counter lifetime past the window end.
    pub buffer: Duration,
}

/// Fully resolved limits for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLimits {
    /// Effective requests per minute for the caller on this endpoint category.
    pub requests_per_minute: f64,
    /// Effective burst size.
    pub burst_size: f64,
    /// `user:{client}` bucket.
    pub user: BucketLimit,
    /// `organization:{tenant}` bucket; `None` without a tenant.
    pub organization: Option<BucketLimit>,
    /// `endpoint:{category}:{client}` window.
    pub endpoint: WindowLimit,
    /// `global:all` window.
    pub global: FixedLimit,
    /// Deferred entries the tenant may hold.
    pub queue_capacity: usize,
    /// Load was above the threshold.
    pub high_load: bool,
    /// Business-hours boost applied.
    pub business_hours: bool,
}

/// Computes [`ResolvedLimits`] from live configuration.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    config: DynamicConfig<TollgateConfig>,
    load: Arc<dyn LoadProbe>,
    clock: Arc<dyn Clock>,
}

impl TierPolicy {
    /// Policy reading `config` on every call.
    pub fn new(
        config: DynamicConfig<TollgateConfig>,
        load: Arc<dyn LoadProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, load, clock }
    }

    /// Resolve against the current configuration snapshot.
    pub fn resolve(&self, req: &ClassifiedRequest, tenant: Option<&Tenant>) -> ResolvedLimits {
        self.resolve_with(&self.config.get(), req, tenant)
    }

    /// Resolve against an explicit configuration snapshot.
    pub fn resolve_with(
        &self,
        config: &TollgateConfig,
        req: &ClassifiedRequest,
        tenant: Option<&Tenant>,
    ) -> ResolvedLimits {
        let tier = config.tiers.limits(req.tier);
        let endpoint = config.endpoints.multiplier(req.category);
        let account_rpm = config.tiers.base_requests_per_minute * tier.multiplier;
        let cap = tenant.and_then(|t| t.max_requests_per_minute).filter(|c| *c > 0.0);
        let high_load = self.load.load() > config.dynamic.high_load_threshold;
        let business_hours = in_business_hours(&config.dynamic, self.clock.now_millis());

        let adjust = |mut v: f64| {
            if high_load {
                v *= config.dynamic.high_load_factor;
            }
            if business_hours {
                v *= config.dynamic.business_hours_boost;
            }
            v
        };
        // The tenant cap is a hard ceiling, boost included.
        let capped = |v: f64| cap.map_or(v, |c| v.min(c));
        let rate = |base: f64| capped(adjust(capped(base))).max(1.0);

        // User and organization buckets span every category; only the endpoint window scales.
        let user_rpm = rate(account_rpm);
        let rpm = rate(account_rpm * endpoint);
        let burst =
            adjust(config.tiers.base_burst_size * tier.multiplier * endpoint).max(1.0);

        let organization = tenant.map(|_| BucketLimit {
            capacity: cap.unwrap_or(user_rpm * config.scopes.organization_multiplier).max(1.0),
        });

        let mut global = config.scopes.global_requests_per_minute;
        if high_load {
            global *= config.dynamic.high_load_factor;
        }

        ResolvedLimits {
            requests_per_minute: rpm,
            burst_size: burst,
            user: BucketLimit { capacity: user_rpm },
            organization,
            endpoint: WindowLimit {
                limit: whole(rpm),
                burst: whole(burst),
                window: Duration::from_secs(config.scopes.endpoint_window_secs),
                burst_window: Duration::from_secs(config.scopes.burst_window_secs),
            },
            global: FixedLimit {
                limit: whole(global),
                window: Duration::from_secs(config.scopes.global_window_secs),
                buffer: Duration::from_secs(config.scopes.window_buffer_secs),
            },
            queue_capacity: tier.queue_capacity,
            high_load,
            business_hours,
        }
    }

    /// Organization bucket for `tenant` as seen by API traffic at low priority.
    pub fn organization_limit(&self, config: &TollgateConfig, tenant: &Tenant) -> BucketLimit {
        let probe = ClassifiedRequest {
            client: ClientIdentity::from_raw("tollgate:processor"),
            tenant: Some(tenant.clone()),
            tier: tenant.tier,
            category: EndpointCategory::Api,
            priority: Priority::Low,
            real_time: false,
            batch: false,
        };
        self.resolve_with(config, &probe, Some(tenant))
            .organization
            .unwrap_or(BucketLimit { capacity: 1.0 })
    }
}

fn whole(v: f64) -> u64 {
    v.floor().max(1.0) as u64
}

fn in_business_hours(dynamic: &DynamicAdjustment, now_ms: u64) -> bool {
    let Some(hours) = dynamic.business_hours else {
        return false;
    };
    let cal = CalendarTime::from_millis(now_ms);
    (hours.start_hour..hours.end_hour).contains(&cal.hour) && (!hours.weekdays_only || cal.is_weekday())
}
