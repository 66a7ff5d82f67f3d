//! Audit trail for security verdicts, rejections and deferred-queue outcomes.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::admission::BlockReason;
use crate::error::AuditError;
use crate::threat::{ThreatLevel, ThreatSignals};

/// What happened to a deferred entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOutcomeKind {
    /// Replayed successfully.
    Completed,
    /// Aged out before it could run.
    Expired,
    /// Failed and re-enqueued with backoff.
    Retried,
    /// Discarded because the stored payload was unreadable.
    Dropped,
}

/// One auditable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request scored high or critical.
    ThreatDetected {
        /// Epoch milliseconds.
        at_ms: u64,
        /// Client identity.
        client: String,
        /// Tenant id.
        tenant: Option<String>,
        /// Peer address.
        ip: Option<IpAddr>,
        /// Request path.
        path: String,
        /// Final level.
        level: ThreatLevel,
        /// Signal that produced the level.
        primary: String,
        /// All sub-scores.
        signals: ThreatSignals,
    },
    /// A request was rejected (not queued).
    AdmissionRejected {
        /// Epoch milliseconds.
        at_ms: u64,
        /// Client identity.
        client: String,
        /// Tenant id.
        tenant: Option<String>,
        /// Request path.
        path: String,
        /// Why.
        reason: BlockReason,
        /// Seconds the caller was told to wait.
        retry_after: u64,
    },
    /// A deferred entry changed state.
    QueueOutcome {
        /// Epoch milliseconds.
        at_ms: u64,
        /// Entry id.
        entry_id: String,
        /// Client identity.
        client: String,
        /// Tenant id.
        tenant: String,
        /// Outcome.
        outcome: QueueOutcomeKind,
        /// Attempts made so far.
        retry_count: u32,
        /// Time spent queued.
        wait_ms: u64,
    },
    /// A deferred entry exhausted its retries.
    DeadLetter {
        /// Epoch milliseconds.
        at_ms: u64,
        /// Entry id.
        entry_id: String,
        /// Client identity.
        client: String,
        /// Tenant id.
        tenant: String,
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Attempts made.
        retry_count: u32,
        /// Last failure.
        error: String,
    },
}

impl AuditEvent {
    /// Snake-case event name.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::ThreatDetected { .. } => "threat_detected",
            AuditEvent::AdmissionRejected { .. } => "admission_rejected",
            AuditEvent::QueueOutcome { .. } => "queue_outcome",
            AuditEvent::DeadLetter { .. } => "dead_letter",
        }
    }

    /// When the event happened.
    pub fn at_ms(&self) -> u64 {
        match self {
            AuditEvent::ThreatDetected { at_ms, .. }
            | AuditEvent::AdmissionRejected { at_ms, .. }
            | AuditEvent::QueueOutcome { at_ms, .. }
            | AuditEvent::DeadLetter { at_ms, .. } => *at_ms,
        }
    }
}

/// Audit sink interface.
#[async_trait]
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    /// Record an audit event.
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Record `event`, logging instead of propagating a sink failure.
pub(crate) async fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let kind = event.kind();
    if let Err(err) = sink.record(event).await {
        warn!(target: "tollgate::audit", kind, error = %err, "audit sink failed");
    }
}

/// Audit sink that logs each event as JSON via tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_string(&event)?;
        info!(target: "tollgate::audit", kind = event.kind(), %payload, "audit");
        Ok(())
    }
}

/// Bounded in-memory audit sink (tests/diagnostics); the oldest events are evicted first.
#[derive(Debug, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<VecDeque<AuditEvent>>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(1_000)
    }
}

impl MemoryAuditSink {
    /// Sink holding up to 1000 events.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink holding up to `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { events: Arc::new(Mutex::new(VecDeque::new())), capacity: capacity.max(1) }
    }

    /// Recorded events, oldest first.
    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.iter().cloned().collect()
    }

    /// Recorded events of one kind.
    pub async fn events_of(&self, kind: &str) -> Vec<AuditEvent> {
        self.events.lock().await.iter().filter(|e| e.kind() == kind).cloned().collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut guard = self.events.lock().await;
        guard.push_back(event);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    fn rejected(at_ms: u64) -> AuditEvent {
        AuditEvent::AdmissionRejected {
            at_ms,
            client: "fp:1".into(),
            tenant: None,
            path: "/api".into(),
            reason: BlockReason::QueueFull,
            retry_after: 3,
        }
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemoryAuditSink::with_capacity(2);
        for at in 1..=3 {
            sink.record(rejected(at)).await.unwrap();
        }
        let at: Vec<u64> = sink.events().await.iter().map(AuditEvent::at_ms).collect();
        assert_eq!(at, vec![2, 3]);
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(rejected(9)).unwrap();
        assert_eq!(json["event"], "admission_rejected");
        assert_eq!(json["reason"], "queue_full");
        let back: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, rejected(9));
    }

    #[derive(Clone, Default)]
    struct SharedWriter(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tracing_sink_logs_payload() {
        let writer = SharedWriter::default();
        let sink_writer = writer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink_writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        TracingAuditSink.record(rejected(1)).await.unwrap();
        let out = String::from_utf8(writer.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("tollgate::audit"));
        assert!(out.contains("admission_rejected"));
    }
}
