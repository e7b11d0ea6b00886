//! Concurrent map of live sessions

use crate::engine::SandboxHandle;
use crate::error::{SandboxError, SessionError, SessionResult};
use crate::session::{Session, SessionId, SessionState, StreamHandle};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Session table shared by request handlers, stream pumps and the reaper
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created sandbox under `id`
    pub async fn create(
        &self,
        id: SessionId,
        sandbox: SandboxHandle,
        started_at: Instant,
    ) -> SessionResult<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        match sessions.entry(id) {
            Entry::Occupied(entry) => Err(SessionError::DuplicateSession(entry.key().clone())),
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(entry.key().clone(), sandbox, started_at));
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Install the stream handle of a session. The handle can be set only once.
    pub async fn attach_stream(&self, id: &str, stream: StreamHandle) -> SessionResult<()> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;
        session
            .set_stream(stream)
            .map_err(|_| SandboxError::AlreadyAttached(session.sandbox().to_string()))?;
        session.set_state(SessionState::Attached);
        Ok(())
    }

    /// Remove a session. Removing an absent id is a no-op.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(id)
    }

    /// Point-in-time copy of every live session
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
