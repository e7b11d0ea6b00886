//! Session identity, state and the per-session stream handle

use crate::engine::SandboxHandle;
use crate::frame::OutputChunk;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::time::Instant;

/// Unique, caller-visible session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Attached,
    AwaitingInput,
    Running,
    Terminated,
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Errored)
    }
}

/// What the stream pump forwards to whoever is collecting output
#[derive(Debug)]
pub enum StreamEvent {
    Output(OutputChunk),
    End,
    Fault(String),
}

/// Receiving side of an attached sandbox stream.
///
/// The receiver sits behind an async mutex that doubles as the session's turn
/// lock: one input-write-and-read cycle at a time.
#[derive(Debug)]
pub struct StreamHandle {
    events: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    buffered: Arc<AtomicUsize>,
}

impl StreamHandle {
    pub fn new(events: mpsc::UnboundedReceiver<StreamEvent>, buffered: Arc<AtomicUsize>) -> Self {
        Self {
            events: Mutex::new(events),
            buffered,
        }
    }

    /// Wait for the turn lock and hand out the event receiver
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, mpsc::UnboundedReceiver<StreamEvent>> {
        self.events.lock().await
    }

    /// Output bytes delivered by the pump but not yet collected
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    pub(crate) fn consumed(&self, bytes: usize) {
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// One interactive execution bound to one sandbox
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    sandbox: SandboxHandle,
    started_at: Instant,
    last_activity: StdMutex<Instant>,
    state: StdMutex<SessionState>,
    stream: OnceLock<StreamHandle>,
    teardown: OnceCell<SessionState>,
}

impl Session {
    pub fn new(id: SessionId, sandbox: SandboxHandle, started_at: Instant) -> Self {
        Self {
            id,
            sandbox,
            started_at,
            last_activity: StdMutex::new(started_at),
            state: StdMutex::new(SessionState::Created),
            stream: OnceLock::new(),
            teardown: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn sandbox(&self) -> &SandboxHandle {
        &self.sandbox
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record input or output activity
    pub fn touch(&self, now: Instant) {
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn state(&self) -> SessionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next` unless the session already reached a terminal state
    pub fn set_state(&self, next: SessionState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub fn stream(&self) -> Option<&StreamHandle> {
        self.stream.get()
    }

    /// Install the stream handle; fails if one is already set
    pub(crate) fn set_stream(&self, stream: StreamHandle) -> Result<(), StreamHandle> {
        self.stream.set(stream)
    }

    /// Whether teardown has completed
    pub fn is_torn_down(&self) -> bool {
        self.teardown.initialized()
    }

    pub(crate) fn teardown_cell(&self) -> &OnceCell<SessionState> {
        &self.teardown
    }
}
