//! Session construction and bookkeeping.

use crate::config::ReplicationConfig;
use crate::error::SyncResult;
use crate::http::{HttpClient, RemoteDatabase};
use crate::pull::PullReplication;
use crate::push::PushReplication;
use crate::session::{ActiveSessions, ReplicationDirection, ReplicationSession, Runtimes};
use revsync_store::LocalStore;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tracing::info;

/// Builds replication sessions for one local store.
///
/// All sessions share one session-id counter and register themselves in
/// the factory's active set while running.
pub struct SessionFactory {
    store: Arc<dyn LocalStore>,
    http: Arc<dyn HttpClient>,
    runtimes: Runtimes,
    session_ids: Arc<AtomicU64>,
    active: ActiveSessions,
}

impl SessionFactory {
    /// Creates a factory running sessions on the current tokio runtime.
    pub fn new(store: Arc<dyn LocalStore>, http: Arc<dyn HttpClient>) -> SyncResult<Self> {
        Ok(Self::with_runtimes(store, http, Runtimes::current()?))
    }

    /// Creates a factory with explicit work and I/O runtimes.
    pub fn with_runtimes(
        store: Arc<dyn LocalStore>,
        http: Arc<dyn HttpClient>,
        runtimes: Runtimes,
    ) -> Self {
        Self {
            store,
            http,
            runtimes,
            session_ids: Arc::new(AtomicU64::new(0)),
            active: ActiveSessions::default(),
        }
    }

    /// Builds a push session. Call [`ReplicationSession::start`] to run it.
    pub fn push(&self, config: ReplicationConfig) -> SyncResult<ReplicationSession> {
        self.build(Arc::new(PushReplication::new()), config)
    }

    /// Builds a pull session. Call [`ReplicationSession::start`] to run it.
    pub fn pull(&self, config: ReplicationConfig) -> SyncResult<ReplicationSession> {
        self.build(Arc::new(PullReplication::new()), config)
    }

    fn build(
        &self,
        direction: Arc<dyn ReplicationDirection>,
        config: ReplicationConfig,
    ) -> SyncResult<ReplicationSession> {
        let remote = RemoteDatabase::new(Arc::clone(&self.http), &config)?;
        Ok(ReplicationSession::new(
            direction,
            Arc::clone(&self.store),
            remote,
            config,
            self.runtimes.clone(),
            Arc::clone(&self.session_ids),
            &self.active,
        ))
    }

    /// Returns the running sessions.
    pub fn active_sessions(&self) -> Vec<ReplicationSession> {
        self.active.lock().clone()
    }

    /// Saves every running session's checkpoint and stops it.
    pub fn close(&self) {
        let sessions = self.active_sessions();
        if !sessions.is_empty() {
            info!(count = sessions.len(), "stopping replication sessions");
        }
        for session in sessions {
            session.save_last_sequence();
            session.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::http::{HttpRequest, HttpResponse, StreamingResponse};
    use async_trait::async_trait;
    use revsync_store::MemoryStore;

    struct Offline;

    #[async_trait]
    impl HttpClient for Offline {
        async fn send(&self, _request: HttpRequest) -> SyncResult<HttpResponse> {
            Err(SyncError::network("offline"))
        }

        async fn open_stream(&self, _request: HttpRequest) -> SyncResult<StreamingResponse> {
            Err(SyncError::network("offline"))
        }
    }

    fn factory() -> SessionFactory {
        SessionFactory::new(Arc::new(MemoryStore::new()), Arc::new(Offline)).unwrap()
    }

    #[test]
    fn new_requires_a_runtime() {
        let result = SessionFactory::new(Arc::new(MemoryStore::new()), Arc::new(Offline));
        assert!(matches!(result, Err(SyncError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn session_ids_are_shared() {
        let factory = factory();
        let push = factory
            .push(ReplicationConfig::new("http://h/db").with_continuous(true))
            .unwrap();
        let pull = factory
            .pull(ReplicationConfig::new("http://h/other").with_continuous(true))
            .unwrap();
        push.start();
        pull.start();
        assert_eq!(push.session_id().as_deref(), Some("repl001"));
        assert_eq!(pull.session_id().as_deref(), Some("repl002"));
        assert_eq!(factory.active_sessions().len(), 2);

        factory.close();
        let both = async {
            push.wait_until_stopped().await;
            pull.wait_until_stopped().await;
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), both)
            .await
            .unwrap();
        assert!(factory.active_sessions().is_empty());
        assert!(!push.is_running());
        assert!(!pull.is_running());
    }

    #[tokio::test]
    async fn invalid_remote_is_rejected() {
        let factory = factory();
        assert!(matches!(
            factory.pull(ReplicationConfig::new("::")),
            Err(SyncError::InvalidUrl(_))
        ));
    }
}
