//! Background replay of deferred requests.
//!
//! One cooperative loop per process. Each iteration visits every tenant with a non-empty
//! queue, skips tenants that are unknown, inactive or already busy (organization bucket
//! utilization at or above `processor.utilization_limit`), claims a batch and replays it through
//! the [`Executor`]. A separate sweeper returns stale leases and purges expired and malformed
//! entries. Both stop when their [`CancellationToken`] fires; a batch that has started always
//! finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::organization_key;
use crate::audit::{self, AuditEvent, AuditSink, QueueOutcomeKind};
use crate::classifier::{RequestClassifier, Tenant};
use crate::clock::Clock;
use crate::config::TollgateConfig;
use crate::error::{ExecutionError, StoreError};
use crate::policy::TierPolicy;
use crate::queue::executor::{Executor, ReplayRequest};
use crate::queue::{ClaimedEntry, DeferredQueue, FailOutcome, MalformedEntry, QueueEntry};
use crate::rate_limit::AlgorithmBank;
use crate::store::FeatureStat;

const WAIT_STAT: &str = "metrics:queue_wait_ms";
const WAIT_STAT_TTL: Duration = Duration::from_secs(86_400);
const THROUGHPUT_TTL: Duration = Duration::from_secs(120);

/// Counts from one or more drain iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorReport {
    /// Tenants whose batch was claimed.
    pub tenants_drained: usize,
    /// Tenants skipped as unknown, inactive or busy.
    pub tenants_skipped: usize,
    /// Entries replayed successfully.
    pub completed: usize,
    /// Entries re-enqueued after a failure.
    pub retried: usize,
    /// Entries that ran out of attempts.
    pub dead_lettered: usize,
    /// Entries dropped for age.
    pub expired: usize,
    /// Entries dropped as undecodable.
    pub malformed: usize,
}

impl ProcessorReport {
    /// Entries that left the claimed batch in any way.
    pub fn processed(&self) -> usize {
        self.completed + self.retried + self.dead_lettered + self.expired + self.malformed
    }

    fn absorb(&mut self, other: ProcessorReport) {
        self.tenants_drained += other.tenants_drained;
        self.tenants_skipped += other.tenants_skipped;
        self.completed += other.completed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.expired += other.expired;
        self.malformed += other.malformed;
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Queues visited.
    pub queues: usize,
    /// Stale leases returned to pending.
    pub recovered: usize,
    /// Expired entries removed.
    pub expired: usize,
    /// Malformed entries removed.
    pub malformed: usize,
}

impl SweepReport {
    /// Entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.malformed
    }
}

/// Drains tenant queues through an [`Executor`].
#[derive(Debug, Clone)]
pub struct QueueProcessor {
    queue: DeferredQueue,
    classifier: Arc<RequestClassifier>,
    policy: TierPolicy,
    bank: AlgorithmBank,
    executor: Arc<dyn Executor>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl QueueProcessor {
    /// Processor over the controller's shared parts; see
    /// [`AdmissionController::processor`](crate::AdmissionController::processor).
    pub(crate) fn new(
        queue: DeferredQueue,
        classifier: Arc<RequestClassifier>,
        policy: TierPolicy,
        bank: AlgorithmBank,
        executor: Arc<dyn Executor>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, classifier, policy, bank, executor, audit, clock }
    }

    /// Spawn the drain loop and the sweeper on the current runtime.
    pub fn spawn(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> (JoinHandle<ProcessorReport>, JoinHandle<SweepReport>) {
        let drain = {
            let this = self.clone();
            let token = token.clone();
            tokio::spawn(async move { this.run(token).await })
        };
        let sweep = tokio::spawn(async move { self.run_sweeper(token).await });
        (drain, sweep)
    }

    /// Drain every `processor.interval_ms` until cancelled.
    pub async fn run(&self, token: CancellationToken) -> ProcessorReport {
        let mut ticker = interval(self.queue.settings().processor.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: "tollgate::queue", "queue processor started");
        let mut total = ProcessorReport::default();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            total.absorb(self.drain(Some(&token)).await);
        }
        info!(
            target: "tollgate::queue",
            completed = total.completed,
            retried = total.retried,
            dead_lettered = total.dead_lettered,
            expired = total.expired,
            "queue processor stopped"
        );
        total
    }

    /// Sweep every `processor.sweep_interval_secs` until cancelled.
    pub async fn run_sweeper(&self, token: CancellationToken) -> SweepReport {
        let mut ticker = interval(self.queue.settings().processor.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut total = SweepReport::default();
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.sweep().await;
            total.queues += report.queues;
            total.recovered += report.recovered;
            total.expired += report.expired;
            total.malformed += report.malformed;
        }
        debug!(target: "tollgate::queue", removed = total.removed(), "queue sweeper stopped");
        total
    }

    /// One drain iteration over all tenants.
    pub async fn run_once(&self) -> ProcessorReport {
        self.drain(None).await
    }

    /// Return stale leases and remove expired and malformed entries from every queue.
    /// A second sweep right after the first removes nothing.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let tenants = match self.queue.tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                error!(target: "tollgate::queue", error = %err, "sweep could not list queues");
                return report;
            }
        };
        for tenant in tenants {
            report.queues += 1;
            match self.queue.sweep_tenant(&tenant).await {
                Ok((recovered, expired, malformed)) => {
                    report.recovered += recovered;
                    report.expired += expired.len();
                    report.malformed += malformed.len();
                    for entry in &expired {
                        warn!(target: "tollgate::queue", tenant = %tenant, id = %entry.id, "deferred request expired");
                        self.record_outcome(entry, QueueOutcomeKind::Expired).await;
                    }
                    for bad in &malformed {
                        self.record_malformed(&tenant, bad).await;
                    }
                }
                Err(err) => {
                    error!(target: "tollgate::queue", tenant = %tenant, error = %err, "sweep failed");
                }
            }
        }
        if report.removed() > 0 || report.recovered > 0 {
            info!(
                target: "tollgate::queue",
                queues = report.queues,
                recovered = report.recovered,
                expired = report.expired,
                malformed = report.malformed,
                "queue sweep finished"
            );
        }
        report
    }

    /// Mean and spread of completed entries' queue wait, in milliseconds.
    pub async fn wait_statistic(&self) -> Result<Option<FeatureStat>, StoreError> {
        self.queue.store().stat_get(WAIT_STAT).await
    }

    async fn drain(&self, token: Option<&CancellationToken>) -> ProcessorReport {
        let cfg = self.queue.settings();
        let mut report = ProcessorReport::default();
        let tenants = match self.queue.tenants().await {
            Ok(tenants) => tenants,
            Err(err) => {
                error!(target: "tollgate::queue", error = %err, "could not list queues");
                return report;
            }
        };

        for tenant_id in tenants {
            if token.is_some_and(CancellationToken::is_cancelled) {
                break;
            }
            let Some(tenant) = self.active_tenant(&tenant_id).await else {
                report.tenants_skipped += 1;
                continue;
            };
            let utilization = self.utilization(&cfg, &tenant).await;
            if utilization >= cfg.processor.utilization_limit {
                debug!(target: "tollgate::queue", tenant = %tenant_id, utilization, "tenant busy; not draining");
                report.tenants_skipped += 1;
                continue;
            }
            let claim = match self.queue.claim(&tenant_id, cfg.processor.batch_size).await {
                Ok(claim) => claim,
                Err(err) => {
                    error!(target: "tollgate::queue", tenant = %tenant_id, error = %err, "claim failed");
                    continue;
                }
            };
            report.tenants_drained += 1;
            for bad in &claim.malformed {
                report.malformed += 1;
                self.record_malformed(&tenant_id, bad).await;
            }
            for claimed in claim.entries {
                self.process(claimed, &cfg, &mut report).await;
            }
        }
        report
    }

    async fn active_tenant(&self, tenant_id: &str) -> Option<Tenant> {
        match self.classifier.tenant(tenant_id).await {
            Ok(Some(tenant)) if tenant.active => Some(tenant),
            Ok(_) => {
                debug!(target: "tollgate::queue", tenant = tenant_id, "tenant unknown or inactive; not draining");
                None
            }
            Err(err) => {
                warn!(target: "tollgate::queue", tenant = tenant_id, error = %err, "tenant lookup failed; not draining");
                None
            }
        }
    }

    async fn utilization(&self, cfg: &TollgateConfig, tenant: &Tenant) -> f64 {
        let capacity = self.policy.organization_limit(cfg, tenant).capacity;
        let now = self.clock.now_millis();
        match self.bank.peek_token_bucket(&organization_key(&tenant.id), capacity, now).await {
            Ok(tokens) => (1.0 - tokens / capacity).clamp(0.0, 1.0),
            Err(err) => {
                error!(target: "tollgate::store", tenant = %tenant.id, error = %err, "utilization unavailable; treating tenant as idle");
                0.0
            }
        }
    }

    async fn process(
        &self,
        claimed: ClaimedEntry,
        cfg: &TollgateConfig,
        report: &mut ProcessorReport,
    ) {
        let now = self.clock.now_millis();
        if claimed.entry.is_expired(now, cfg.queue.max_queue_time()) {
            warn!(
                target: "tollgate::queue",
                tenant = %claimed.entry.tenant_id,
                id = %claimed.entry.id,
                waited_ms = now.saturating_sub(claimed.entry.queued_at_ms),
                "deferred request expired"
            );
            if let Err(err) = self.queue.ack(&claimed).await {
                error!(target: "tollgate::queue", id = %claimed.entry.id, error = %err, "ack failed");
            }
            report.expired += 1;
            self.record_outcome(&claimed.entry, QueueOutcomeKind::Expired).await;
            return;
        }

        let result = match ReplayRequest::from_entry(&claimed.entry) {
            Ok(request) => self.replay(request, cfg.processor.execution_timeout()).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => self.complete(claimed, report).await,
            Err(err) => self.fail(claimed, err, report).await,
        }
    }

    async fn replay(&self, request: ReplayRequest, limit: Duration) -> Result<(), ExecutionError> {
        match timeout(limit, self.executor.execute(request)).await {
            Ok(Ok(response)) if response.is_success() => Ok(()),
            Ok(Ok(response)) => Err(ExecutionError::Status(response.status)),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ExecutionError::Timeout(limit)),
        }
    }

    async fn complete(&self, claimed: ClaimedEntry, report: &mut ProcessorReport) {
        if let Err(err) = self.queue.ack(&claimed).await {
            error!(target: "tollgate::queue", id = %claimed.entry.id, error = %err, "ack failed");
        }
        let now = self.clock.now_millis();
        let wait = now.saturating_sub(claimed.entry.queued_at_ms);
        let store = self.queue.store();
        if let Err(err) = store.stat_add(WAIT_STAT, wait as f64, WAIT_STAT_TTL).await {
            error!(target: "tollgate::store", error = %err, "could not record queue wait");
        }
        let throughput = format!("metrics:queue_completed:{}:{}", claimed.entry.tenant_id, now / 60_000);
        if let Err(err) = store.incr(&throughput, THROUGHPUT_TTL).await {
            error!(target: "tollgate::store", error = %err, "could not record queue throughput");
        }
        debug!(
            target: "tollgate::queue",
            tenant = %claimed.entry.tenant_id,
            id = %claimed.entry.id,
            wait_ms = wait,
            "deferred request completed"
        );
        report.completed += 1;
        self.record_outcome(&claimed.entry, QueueOutcomeKind::Completed).await;
    }

    async fn fail(&self, claimed: ClaimedEntry, err: ExecutionError, report: &mut ProcessorReport) {
        let id = claimed.entry.id.clone();
        match self.queue.fail(claimed, err.to_string()).await {
            Ok(FailOutcome::Retried { entry, delay }) => {
                warn!(
                    target: "tollgate::queue",
                    tenant = %entry.tenant_id,
                    id = %entry.id,
                    retry_count = entry.retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "deferred request failed; retrying"
                );
                report.retried += 1;
                self.record_outcome(&entry, QueueOutcomeKind::Retried).await;
            }
            Ok(FailOutcome::DeadLettered(entry)) => {
                error!(
                    target: "tollgate::queue",
                    tenant = %entry.tenant_id,
                    client = %entry.client_id,
                    id = %entry.id,
                    path = %entry.request.path,
                    retry_count = entry.retry_count,
                    error = %err,
                    "deferred request dead-lettered"
                );
                report.dead_lettered += 1;
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::DeadLetter {
                        at_ms: self.clock.now_millis(),
                        entry_id: entry.id.clone(),
                        client: entry.client_id.clone(),
                        tenant: entry.tenant_id.clone(),
                        method: entry.request.method.clone(),
                        path: entry.request.path.clone(),
                        retry_count: entry.retry_count,
                        error: err.to_string(),
                    },
                )
                .await;
            }
            Err(store_err) => {
                // The lease stays in flight and the sweep returns it.
                error!(target: "tollgate::queue", id = %id, error = %store_err, "could not record replay failure");
            }
        }
    }

    async fn record_outcome(&self, entry: &QueueEntry, outcome: QueueOutcomeKind) {
        let now = self.clock.now_millis();
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::QueueOutcome {
                at_ms: now,
                entry_id: entry.id.clone(),
                client: entry.client_id.clone(),
                tenant: entry.tenant_id.clone(),
                outcome,
                retry_count: entry.retry_count,
                wait_ms: now.saturating_sub(entry.queued_at_ms),
            },
        )
        .await;
    }

    async fn record_malformed(&self, tenant: &str, bad: &MalformedEntry) {
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::QueueOutcome {
                at_ms: self.clock.now_millis(),
                entry_id: bad.id.clone().unwrap_or_default(),
                client: bad.client_id.clone().unwrap_or_default(),
                tenant: tenant.to_string(),
                outcome: QueueOutcomeKind::Dropped,
                retry_count: 0,
                wait_ms: 0,
            },
        )
        .await;
    }
}
