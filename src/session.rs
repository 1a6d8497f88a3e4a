//! Hypervisor Session Pool
//!
//! Sessions are cached per endpoint. The pool is opened once at process
//! start and closed at shutdown; commands acquire a session per invocation
//! and drop the cached one when the hypervisor reports it invalid.

use crate::domain::ports::{SessionConnector, SessionRef};
use crate::error::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Endpoint-keyed cache of hypervisor sessions
pub struct SessionPool {
    connector: Arc<dyn SessionConnector>,
    sessions: DashMap<String, SessionRef>,
    open: AtomicBool,
}

impl SessionPool {
    /// Create a closed pool
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            sessions: DashMap::new(),
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        info!("Opening hypervisor session pool");
        self.open.store(true, Ordering::Release);
    }

    /// Drop every cached session and refuse further acquisitions
    pub fn close(&self) {
        info!("Closing hypervisor session pool ({} cached)", self.sessions.len());
        self.open.store(false, Ordering::Release);
        self.sessions.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Cached session for an endpoint, connecting on first use
    pub async fn acquire(&self, endpoint: &str) -> Result<SessionRef> {
        if !self.is_open() {
            return Err(Error::Configuration("session pool is closed".into()));
        }

        if let Some(session) = self.sessions.get(endpoint) {
            return Ok(session.value().clone());
        }

        debug!("Connecting new session to {}", endpoint);
        let session = self.connector.connect(endpoint).await?;
        // Another command may have connected concurrently; keep the first.
        let entry = self
            .sessions
            .entry(endpoint.to_string())
            .or_insert(session);
        Ok(entry.value().clone())
    }

    /// Forget the cached session so the next command reconnects
    pub fn invalidate(&self, endpoint: &str) {
        if self.sessions.remove(endpoint).is_some() {
            warn!("Invalidated cached session for {}", endpoint);
        }
    }

    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }
}

/// Explicit context handed to the orchestrator in place of process globals
#[derive(Clone)]
pub struct OrchestratorContext {
    pub endpoint: String,
    pub pool: Arc<SessionPool>,
}

impl OrchestratorContext {
    pub fn new(endpoint: impl Into<String>, pool: Arc<SessionPool>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pool,
        }
    }

    pub async fn session(&self) -> Result<SessionRef> {
        self.pool.acquire(&self.endpoint).await
    }

    /// Inspect a command failure and drop the session if it is no longer valid
    pub fn observe_failure(&self, err: &Error) {
        if err.is_session_fault() {
            self.pool.invalidate(&self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedCluster;

    #[tokio::test]
    async fn test_acquire_requires_open_pool() {
        let sim = SimulatedCluster::builder().cluster("c1", 1).build();
        let pool = SessionPool::new(Arc::new(sim));

        assert!(matches!(pool.acquire("vc").await, Err(Error::Configuration(_))));

        pool.open();
        let first = pool.acquire("vc").await.unwrap();
        let second = pool.acquire("vc").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.cached_sessions(), 1);

        pool.close();
        assert_eq!(pool.cached_sessions(), 0);
        assert!(pool.acquire("vc").await.is_err());
    }

    #[tokio::test]
    async fn test_session_fault_invalidates_cache() {
        let sim = SimulatedCluster::builder().cluster("c1", 1).build();
        let pool = Arc::new(SessionPool::new(Arc::new(sim.clone())));
        pool.open();
        let ctx = OrchestratorContext::new("vc", pool.clone());

        ctx.session().await.unwrap();
        assert_eq!(pool.cached_sessions(), 1);

        ctx.observe_failure(&Error::not_found("Disk", "x"));
        assert_eq!(pool.cached_sessions(), 1);

        let fault = Error::RemoteSessionFault("NotAuthenticated".into()).in_operation("attach");
        ctx.observe_failure(&fault);
        assert_eq!(pool.cached_sessions(), 0);
        assert_eq!(sim.connection_count(), 1);

        ctx.session().await.unwrap();
        assert_eq!(sim.connection_count(), 2);
    }
}
