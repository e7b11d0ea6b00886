//! Process-based engine - runs the sandbox command as a local child process
//!
//! Intended for development hosts without a container runtime. The image name
//! is ignored and memory/CPU limits are not enforced.

use super::{
    frame_pipe, receiver_stream, stdin_relay, AttachOptions, AttachedIo, ExitStatus,
    SandboxEngine, SandboxHandle, SandboxSpec,
};
use crate::error::{SandboxError, SandboxResult};
use crate::frame::StreamKind;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

type FrameReceiver = mpsc::UnboundedReceiver<std::io::Result<Bytes>>;

struct ProcessSandbox {
    spec: SandboxSpec,
    stdin_tx: Option<mpsc::UnboundedSender<Bytes>>,
    output_rx: Option<FrameReceiver>,
    stop_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    exit_tx: Option<watch::Sender<Option<ExitStatus>>>,
}

/// Process-based engine - one child process per sandbox
#[derive(Default)]
pub struct ProcessEngine {
    sandboxes: Mutex<HashMap<SandboxHandle, ProcessSandbox>>,
}

impl ProcessEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn command(spec: &SandboxSpec) -> SandboxResult<Command> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| SandboxError::operation("create", &spec.name, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Ok(path) = std::env::var("PATH") {
            command.env("PATH", path);
        }
        for entry in &spec.env {
            if let Some((key, value)) = entry.split_once('=') {
                command.env(key, value);
            }
        }
        Ok(command)
    }
}

async fn pump_stdin(
    mut stdin: ChildStdin,
    mut input: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            chunk = input.recv() => {
                let Some(chunk) = chunk else { break };
                if stdin.write_all(&chunk).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn supervise(
    name: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<Duration>,
    close_stdin: CancellationToken,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        grace = stop_rx => {
            // A dropped sender means the sandbox was removed without a stop.
            let grace = grace.unwrap_or(Duration::ZERO);
            close_stdin.cancel();
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::debug!(sandbox = %name, "Grace period elapsed, killing process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };
    close_stdin.cancel();

    let code = match status {
        Ok(status) => status.code().map(i64::from).unwrap_or(-1),
        Err(e) => {
            tracing::warn!(sandbox = %name, error = %e, "Process wait error");
            -1
        }
    };
    let _ = exit_tx.send(Some(ExitStatus { code }));
}

#[async_trait]
impl SandboxEngine for ProcessEngine {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<SandboxHandle> {
        Self::command(&spec)?;
        tracing::debug!(
            sandbox = %spec.name,
            memory_bytes = spec.limits.memory_bytes,
            cpu_fraction = spec.limits.cpu_fraction(),
            "Process engine does not enforce memory or CPU limits"
        );

        let handle = SandboxHandle::new(spec.name.clone());
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut sandboxes = self.sandboxes.lock().await;
        if sandboxes.contains_key(&handle) {
            return Err(SandboxError::operation("create", &spec.name, "name in use"));
        }
        sandboxes.insert(
            handle.clone(),
            ProcessSandbox {
                spec,
                stdin_tx: None,
                output_rx: None,
                stop_tx: None,
                exit_rx,
                exit_tx: Some(exit_tx),
            },
        );
        Ok(handle)
    }

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        let exit_tx = sandbox
            .exit_tx
            .take()
            .ok_or_else(|| SandboxError::operation("start", handle.as_str(), "already started"))?;

        let mut child = Self::command(&sandbox.spec)?
            .spawn()
            .map_err(|e| SandboxError::operation("start", handle.as_str(), e))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            frame_pipe(stdout, StreamKind::Stdout, frames_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            frame_pipe(stderr, StreamKind::Stderr, frames_tx);
        }

        let close_stdin = CancellationToken::new();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(pump_stdin(stdin, stdin_rx, close_stdin.clone()));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(
            handle.to_string(),
            child,
            stop_rx,
            close_stdin,
            exit_tx,
        ));

        sandbox.stdin_tx = Some(stdin_tx);
        sandbox.output_rx = Some(frames_rx);
        sandbox.stop_tx = Some(stop_tx);
        tracing::debug!(sandbox = %handle, "Process started");
        Ok(())
    }

    async fn attach(
        &self,
        handle: &SandboxHandle,
        options: AttachOptions,
    ) -> SandboxResult<AttachedIo> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;

        let output = if options.wants_output() {
            let frames = sandbox
                .output_rx
                .take()
                .ok_or_else(|| SandboxError::AlreadyAttached(handle.to_string()))?;
            Some(receiver_stream(frames))
        } else {
            None
        };
        let input = if options.stdin {
            sandbox.stdin_tx.clone().map(stdin_relay)
        } else {
            None
        };
        Ok(AttachedIo { output, input })
    }

    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> SandboxResult<()> {
        let mut sandboxes = self.sandboxes.lock().await;
        let sandbox = sandboxes
            .get_mut(handle)
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        sandbox.stdin_tx = None;
        // Never started: nothing can publish an exit status.
        if sandbox.exit_tx.is_some() {
            return Ok(());
        }
        if let Some(stop) = sandbox.stop_tx.take() {
            let _ = stop.send(grace);
        }
        let mut exit = sandbox.exit_rx.clone();
        drop(sandboxes);

        tokio::time::timeout(grace + Duration::from_secs(5), exit.wait_for(Option::is_some))
            .await
            .map_err(|_| SandboxError::operation("stop", handle.as_str(), "process did not exit"))?
            .map_err(|_| SandboxError::operation("stop", handle.as_str(), "supervisor gone"))?;
        Ok(())
    }

    async fn remove(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.sandboxes
            .lock()
            .await
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))
    }

    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<ExitStatus> {
        let mut exit = {
            let sandboxes = self.sandboxes.lock().await;
            sandboxes
                .get(handle)
                .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?
                .exit_rx
                .clone()
        };
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SandboxError::operation("wait", handle.as_str(), "removed before exit"))?;
        status.ok_or_else(|| SandboxError::operation("wait", handle.as_str(), "no exit status"))
    }

    fn name(&self) -> &str {
        "process"
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::frame::decode_text;
    use crate::limits::ResourceLimits;
    use futures::StreamExt;

    fn spec(name: &str, script: &str) -> SandboxSpec {
        SandboxSpec {
            name: name.to_string(),
            image: "unused".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            env: vec!["GREETING=hello".to_string()],
            limits: ResourceLimits::default(),
        }
    }

    async fn read_all(io: AttachedIo) -> String {
        let mut output = io.output.unwrap();
        let mut raw = Vec::new();
        while let Some(chunk) = output.next().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        decode_text(&raw)
    }

    #[tokio::test]
    async fn test_runs_command_with_env() {
        let engine = ProcessEngine::new();
        let handle = engine
            .create(spec("proc-env", "echo \"$GREETING\"; echo oops >&2; exit 3"))
            .await
            .unwrap();
        engine.start(&handle).await.unwrap();

        let io = engine.attach(&handle, AttachOptions::duplex()).await.unwrap();
        let text = read_all(io).await;
        assert!(text.contains("hello\n"));
        assert!(text.contains("oops\n"));

        assert_eq!(engine.wait(&handle).await.unwrap().code, 3);
        engine.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_only_attach_delivers_input() {
        let engine = ProcessEngine::new();
        let handle = engine
            .create(spec("proc-read", "read line; echo \"got $line\""))
            .await
            .unwrap();
        engine.start(&handle).await.unwrap();
        let reader = engine.attach(&handle, AttachOptions::duplex()).await.unwrap();

        let writer = engine
            .attach(&handle, AttachOptions::stdin_only())
            .await
            .unwrap();
        assert!(writer.output.is_none());
        let mut input = writer.input.unwrap();
        input.write_all(b"42\n").await.unwrap();
        input.flush().await.unwrap();
        drop(input);

        assert_eq!(read_all(reader).await, "got 42\n");
        assert!(engine.wait(&handle).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_second_output_attach_is_rejected() {
        let engine = ProcessEngine::new();
        let handle = engine.create(spec("proc-twice", "sleep 5")).await.unwrap();
        engine.start(&handle).await.unwrap();

        let _first = engine.attach(&handle, AttachOptions::duplex()).await.unwrap();
        let second = engine.attach(&handle, AttachOptions::duplex()).await;
        assert!(matches!(second, Err(SandboxError::AlreadyAttached(_))));

        engine.stop(&handle, Duration::ZERO).await.unwrap();
        engine.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace() {
        let engine = ProcessEngine::new();
        let handle = engine.create(spec("proc-stop", "sleep 30")).await.unwrap();
        engine.start(&handle).await.unwrap();

        engine
            .stop(&handle, Duration::from_millis(50))
            .await
            .unwrap();
        let status = engine.wait(&handle).await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_remove_unknown_sandbox() {
        let engine = ProcessEngine::new();
        let result = engine.remove(&SandboxHandle::new("missing")).await;
        assert!(matches!(result, Err(SandboxError::NotFound(_))));
    }
}
