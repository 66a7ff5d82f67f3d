//! Replay seam between the queue processor and the downstream service.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tower::{Service, ServiceExt};

use crate::error::ExecutionError;
use crate::queue::QueueEntry;

/// A deferred request ready to be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRequest {
    /// Queue entry id.
    pub entry_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Client identity.
    pub client_id: String,
    /// HTTP method.
    pub method: String,
    /// Path including query.
    pub path: String,
    /// Lowercase headers.
    pub headers: HashMap<String, String>,
    /// Decoded body.
    pub body: Option<Vec<u8>>,
    /// Peer address.
    pub ip: Option<IpAddr>,
    /// Prior failed attempts.
    pub attempt: u32,
}

impl ReplayRequest {
    /// Build from a queue entry. Fails when the stored body is not valid base64.
    pub fn from_entry(entry: &QueueEntry) -> Result<Self, ExecutionError> {
        let body = entry
            .request
            .body_bytes()
            .map_err(|e| ExecutionError::Failed(format!("stored body: {e}")))?;
        Ok(Self {
            entry_id: entry.id.clone(),
            tenant_id: entry.tenant_id.clone(),
            client_id: entry.client_id.clone(),
            method: entry.request.method.clone(),
            path: entry.request.path.clone(),
            headers: entry.request.headers.clone(),
            body,
            ip: entry.request.ip,
            attempt: entry.retry_count,
        })
    }
}

/// Downstream answer to a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayResponse {
    /// HTTP status.
    pub status: u16,
}

impl ReplayResponse {
    /// Response with `status`.
    pub fn new(status: u16) -> Self {
        Self { status }
    }

    /// Anything below 500 except 429.
    pub fn is_success(&self) -> bool {
        self.status < 500 && self.status != 429
    }
}

/// Replays deferred requests.
#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug {
    /// Replay one request.
    async fn execute(&self, request: ReplayRequest) -> Result<ReplayResponse, ExecutionError>;
}

/// [`Executor`] over any tower [`Service`].
///
/// The service is driven to readiness under a lock; the returned future runs outside it, so
/// replays for different entries overlap when the service allows it.
pub struct ServiceExecutor<S> {
    inner: Mutex<S>,
}

impl<S> ServiceExecutor<S> {
    /// Wrap `service`.
    pub fn new(service: S) -> Self {
        Self { inner: Mutex::new(service) }
    }
}

impl<S> fmt::Debug for ServiceExecutor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> Executor for ServiceExecutor<S>
where
    S: Service<ReplayRequest, Response = ReplayResponse> + Send + 'static,
    S::Error: fmt::Display + Send,
    S::Future: Send,
{
    async fn execute(&self, request: ReplayRequest) -> Result<ReplayResponse, ExecutionError> {
        let call = {
            let mut guard = self.inner.lock().await;
            let service = guard.ready().await.map_err(|e| ExecutionError::Failed(e.to_string()))?;
            service.call(request)
        };
        call.await.map_err(|e| ExecutionError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn request(path: &str) -> ReplayRequest {
        ReplayRequest {
            entry_id: "e1".into(),
            tenant_id: "acme".into(),
            client_id: "key:abc".into(),
            method: "GET".into(),
            path: path.into(),
            headers: HashMap::new(),
            body: None,
            ip: None,
            attempt: 0,
        }
    }

    #[test]
    fn success_excludes_server_errors_and_throttling() {
        assert!(ReplayResponse::new(200).is_success());
        assert!(ReplayResponse::new(404).is_success());
        assert!(!ReplayResponse::new(429).is_success());
        assert!(!ReplayResponse::new(503).is_success());
    }

    #[tokio::test]
    async fn service_executor_calls_service() {
        let svc = tower::service_fn(|req: ReplayRequest| async move {
            let status = if req.path == "/api/ok" { 200 } else { 502 };
            Ok::<_, Infallible>(ReplayResponse::new(status))
        });
        let exec = ServiceExecutor::new(svc);
        assert_eq!(exec.execute(request("/api/ok")).await.unwrap().status, 200);
        assert_eq!(exec.execute(request("/api/down")).await.unwrap().status, 502);
    }

    #[tokio::test]
    async fn service_errors_become_failures() {
        let svc = tower::service_fn(|_req: ReplayRequest| async move {
            Err::<ReplayResponse, _>(std::io::Error::other("connection reset"))
        });
        let exec = ServiceExecutor::new(svc);
        let err = exec.execute(request("/api/x")).await.unwrap_err();
        assert_eq!(err, ExecutionError::Failed("connection reset".into()));
    }
}
