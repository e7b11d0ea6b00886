//! Session service - runs code in sandboxes and relays interactive turns

use crate::detector::{Detection, PromptDetector};
use crate::engine::{InputSink, OutputStream, SandboxEngine};
use crate::error::{SandboxError, SessionError, SessionResult};
use crate::frame::FrameDecoder;
use crate::lifecycle::LifecycleManager;
use crate::reaper::IdleReaper;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionId, SessionState, StreamEvent, StreamHandle};
use coderun_common::{AppConfig, SessionConfig};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

/// Text collected during one turn
#[derive(Debug, Clone)]
pub struct TurnOutput {
    pub session_id: SessionId,
    pub output: String,
    pub requires_input: bool,
    /// Whether the session can take another turn
    pub live: bool,
}

/// How an output collection race resolved
#[derive(Debug)]
enum TurnEnd {
    Detected,
    TimedOut,
    Ended,
    Faulted(String),
}

struct ServiceInner {
    lifecycle: LifecycleManager,
    registry: SessionRegistry,
    detector: PromptDetector,
    config: SessionConfig,
    max_code_bytes: usize,
}

/// Interactive code execution service
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<ServiceInner>,
}

impl SessionService {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: &AppConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                lifecycle: LifecycleManager::new(engine, config.sandbox.clone()),
                registry: SessionRegistry::new(),
                detector: PromptDetector::from_config(&config.detector),
                config: config.session.clone(),
                max_code_bytes: config.sandbox.max_code_bytes,
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn engine_name(&self) -> &str {
        self.inner.lifecycle.engine_name()
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Idle reaper bound to this service
    pub fn reaper(&self) -> IdleReaper {
        IdleReaper::new(self.clone())
    }

    /// Start a new session for `code` and return its first turn
    pub async fn run(&self, code: &str) -> SessionResult<TurnOutput> {
        self.validate_code(code)?;

        let id = SessionId::new();
        tracing::info!(
            session_id = %id,
            engine = self.engine_name(),
            code_len = code.len(),
            "Starting session"
        );

        let handle = self.inner.lifecycle.create(&id, code).await?;
        let session = match self
            .inner
            .registry
            .create(id, handle.clone(), Instant::now())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                self.inner
                    .lifecycle
                    .teardown(&handle, self.inner.config.stop_grace)
                    .await;
                return Err(e);
            }
        };

        match self.launch(&session).await {
            Ok(turn) => Ok(turn),
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Session failed to launch");
                self.terminate(&session, SessionState::Errored, "launch failed")
                    .await;
                Err(e)
            }
        }
    }

    /// Continue a live session. `None` collects pending output without writing.
    pub async fn resume(&self, id: &str, input: Option<&str>) -> SessionResult<TurnOutput> {
        let session = self
            .inner
            .registry
            .get(id)
            .await
            .filter(|session| session.stream().is_some() && !session.state().is_terminal())
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))?;

        tracing::debug!(
            session_id = %session.id(),
            poll = input.is_none(),
            "Continuing session"
        );

        let window = self.inner.config.continue_output_window;
        match self.take_turn(&session, input, window, true).await {
            Ok(turn) => Ok(turn),
            Err(e @ SessionError::SessionNotFound(_)) => Err(e),
            Err(e) => {
                tracing::warn!(session_id = %session.id(), error = %e, "Session turn failed");
                self.terminate(&session, SessionState::Errored, "turn failed")
                    .await;
                Err(e)
            }
        }
    }

    /// Tear down every live session
    pub async fn shutdown(&self) {
        let sessions = self.inner.registry.snapshot().await;
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Tearing down live sessions");
        futures::future::join_all(sessions.iter().map(|session| {
            self.terminate(session, SessionState::Terminated, "server shutting down")
        }))
        .await;
    }

    fn validate_code(&self, code: &str) -> SessionResult<()> {
        if code.trim().is_empty() {
            return Err(SessionError::InvalidRequest("code must not be empty".to_string()));
        }
        if code.len() > self.inner.max_code_bytes {
            return Err(SessionError::InvalidRequest(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.inner.max_code_bytes
            )));
        }
        Ok(())
    }

    async fn launch(&self, session: &Arc<Session>) -> SessionResult<TurnOutput> {
        let lifecycle = &self.inner.lifecycle;
        lifecycle.start(session.sandbox()).await?;

        let io = lifecycle.attach_duplex(session.sandbox()).await?;
        let output = io.output.ok_or_else(|| {
            SandboxError::operation("attach", session.sandbox().as_str(), "no output stream")
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        self.inner
            .registry
            .attach_stream(
                session.id().as_str(),
                StreamHandle::new(events_rx, Arc::clone(&buffered)),
            )
            .await?;

        tokio::spawn(self.clone().pump(
            Arc::clone(session),
            output,
            io.input,
            events_tx,
            buffered,
        ));
        lifecycle.watch_exit(session.id(), session.sandbox());

        self.take_turn(session, None, self.inner.config.initial_output_window, false)
            .await
    }

    /// One write-and-collect cycle under the session's turn lock
    async fn take_turn(
        &self,
        session: &Arc<Session>,
        input: Option<&str>,
        window: Duration,
        resuming: bool,
    ) -> SessionResult<TurnOutput> {
        let not_found = || SessionError::SessionNotFound(session.id().to_string());
        let stream = session.stream().ok_or_else(not_found)?;
        let mut events = stream.lock().await;
        // An earlier turn may have ended the session while this one waited.
        if resuming && session.state().is_terminal() {
            return Err(not_found());
        }

        if let Some(input) = input {
            self.write_input(session, input).await?;
        }

        let (output, end) = self.collect_output(stream, &mut events, window).await;
        let requires_input = self.inner.detector.requires_input(&output);
        tracing::debug!(
            session_id = %session.id(),
            bytes = output.len(),
            requires_input,
            end = ?end,
            "Turn collected"
        );

        match end {
            TurnEnd::Detected | TurnEnd::TimedOut => session.set_state(if requires_input {
                SessionState::AwaitingInput
            } else {
                SessionState::Running
            }),
            TurnEnd::Ended => {
                self.terminate(session, SessionState::Terminated, "program exited")
                    .await;
            }
            TurnEnd::Faulted(message) => {
                self.terminate(session, SessionState::Errored, "output stream failed")
                    .await;
                return Err(SessionError::StreamFault {
                    session: session.id().clone(),
                    message,
                });
            }
        }

        Ok(TurnOutput {
            session_id: session.id().clone(),
            output,
            requires_input,
            live: !session.state().is_terminal(),
        })
    }

    /// Deliver one line over a fresh write-only attach
    async fn write_input(&self, session: &Session, input: &str) -> SessionResult<()> {
        let not_writable = || SessionError::StreamNotWritable(session.id().clone());
        let mut sink: InputSink = self
            .inner
            .lifecycle
            .open_input(session.sandbox())
            .await?
            .ok_or_else(not_writable)?;

        let mut line = String::with_capacity(input.len() + 1);
        line.push_str(input);
        line.push('\n');
        if let Err(e) = sink.write_all(line.as_bytes()).await {
            tracing::warn!(session_id = %session.id(), error = %e, "Input write failed");
            return Err(not_writable());
        }
        if let Err(e) = sink.flush().await {
            tracing::warn!(session_id = %session.id(), error = %e, "Input flush failed");
            return Err(not_writable());
        }

        session.touch(Instant::now());
        session.set_state(SessionState::Running);
        Ok(())
    }

    /// Race incoming output against `window`
    async fn collect_output(
        &self,
        stream: &StreamHandle,
        events: &mut mpsc::UnboundedReceiver<StreamEvent>,
        window: Duration,
    ) -> (String, TurnEnd) {
        let mut text = String::new();
        let timer = tokio::time::sleep(window);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(StreamEvent::Output(chunk)) => {
                        stream.consumed(chunk.payload.len());
                        let scanned = text.len();
                        text.push_str(&chunk.text());
                        match self.inner.detector.detect_from(&text, scanned) {
                            Some(Detection::AwaitingInput) => return (text, TurnEnd::Detected),
                            Some(Detection::Completed) => {
                                return drain_ready(stream, events, text);
                            }
                            None => {}
                        }
                    }
                    Some(StreamEvent::End) | None => return (text, TurnEnd::Ended),
                    Some(StreamEvent::Fault(message)) => return (text, TurnEnd::Faulted(message)),
                },
                _ = &mut timer => return (text, TurnEnd::TimedOut),
            }
        }
    }

    /// Forward decoded output to the session until the stream ends
    async fn pump(
        self,
        session: Arc<Session>,
        output: OutputStream,
        // Held so the duplex attach stays open for the life of the session.
        _duplex_input: Option<InputSink>,
        events: mpsc::UnboundedSender<StreamEvent>,
        buffered: Arc<AtomicUsize>,
    ) {
        let config = &self.inner.config;
        let mut frames = FramedRead::new(
            StreamReader::new(output),
            FrameDecoder::new(config.max_frame_len),
        );
        let deadline = self
            .inner
            .lifecycle
            .limits()
            .max_duration
            .map(|limit| session.started_at() + limit);

        let (state, reason) = loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, frames.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        tracing::warn!(session_id = %session.id(), "Execution time limit exceeded");
                        let _ = events.send(StreamEvent::Fault(
                            "execution time limit exceeded".to_string(),
                        ));
                        break (SessionState::Errored, "execution time limit exceeded");
                    }
                },
                None => frames.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    session.touch(Instant::now());
                    let len = chunk.payload.len();
                    tracing::debug!(
                        session_id = %session.id(),
                        stream = ?chunk.kind,
                        bytes = len,
                        output = %chunk.text(),
                        "Sandbox output"
                    );
                    if buffered.load(Ordering::Acquire) + len > config.max_buffered_output {
                        tracing::warn!(
                            session_id = %session.id(),
                            bytes = len,
                            "Output buffer full, dropping chunk"
                        );
                        continue;
                    }
                    buffered.fetch_add(len, Ordering::AcqRel);
                    if events.send(StreamEvent::Output(chunk)).is_err() {
                        break (SessionState::Terminated, "session dropped");
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(session_id = %session.id(), error = %e, "Output stream failed");
                    let _ = events.send(StreamEvent::Fault(e.to_string()));
                    break (SessionState::Errored, "output stream failed");
                }
                None => {
                    let _ = events.send(StreamEvent::End);
                    break (SessionState::Terminated, "output stream ended");
                }
            }
        };

        if frames.decoder().is_raw() {
            tracing::debug!(session_id = %session.id(), "Output was not multiplexed");
        }
        self.terminate(&session, state, reason).await;
    }

    /// Tear a session down exactly once: evict, stop, remove
    pub(crate) async fn terminate(
        &self,
        session: &Arc<Session>,
        state: SessionState,
        reason: &str,
    ) -> SessionState {
        self.terminate_with_grace(session, state, reason, self.inner.config.stop_grace)
            .await
    }

    pub(crate) async fn terminate_with_grace(
        &self,
        session: &Arc<Session>,
        state: SessionState,
        reason: &str,
        grace: Duration,
    ) -> SessionState {
        *session
            .teardown_cell()
            .get_or_init(|| async {
                session.set_state(state);
                let final_state = session.state();
                let report = self.inner.lifecycle.teardown(session.sandbox(), grace).await;
                // Stays registered until the sandbox is gone so shutdown and
                // health still see it.
                self.inner.registry.remove(session.id().as_str()).await;
                tracing::info!(
                    session_id = %session.id(),
                    sandbox = %session.sandbox(),
                    state = ?final_state,
                    reason,
                    stopped = report.stopped,
                    removed = report.removed,
                    "Session torn down"
                );
                final_state
            })
            .await
    }
}

/// After a completion marker, take whatever is already queued without waiting
fn drain_ready(
    stream: &StreamHandle,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    mut text: String,
) -> (String, TurnEnd) {
    loop {
        match events.try_recv() {
            Ok(StreamEvent::Output(chunk)) => {
                stream.consumed(chunk.payload.len());
                text.push_str(&chunk.text());
            }
            Ok(StreamEvent::End) | Err(mpsc::error::TryRecvError::Disconnected) => {
                return (text, TurnEnd::Ended)
            }
            Ok(StreamEvent::Fault(message)) => return (text, TurnEnd::Faulted(message)),
            Err(mpsc::error::TryRecvError::Empty) => return (text, TurnEnd::Detected),
        }
    }
}
