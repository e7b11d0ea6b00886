//! Sandbox engine capability and implementations

#[cfg(feature = "docker")]
mod docker;
#[cfg(feature = "process")]
mod process;

use crate::error::{SandboxError, SandboxResult};
use crate::frame::{encode_frame, StreamKind};
use crate::limits::ResourceLimits;
use async_trait::async_trait;
use bytes::Bytes;
use coderun_common::{EngineKind, SandboxConfig};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

#[cfg(feature = "docker")]
pub use docker::DockerEngine;
#[cfg(feature = "process")]
pub use process::ProcessEngine;

/// Opaque reference to one execution unit
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything an engine needs to allocate a sandbox
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Unique sandbox name
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    pub limits: ResourceLimits,
}

impl SandboxSpec {
    /// Value of an environment entry
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(name, _)| *name == key)
                .map(|(_, value)| value)
        })
    }
}

/// Which sides of the sandbox's stdio an attach subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdout: bool,
    pub stderr: bool,
    pub stdin: bool,
}

impl AttachOptions {
    /// Long-lived read channel that can also write
    pub fn duplex() -> Self {
        Self {
            stdout: true,
            stderr: true,
            stdin: true,
        }
    }

    /// Write-only channel used to deliver one line of input
    pub fn stdin_only() -> Self {
        Self {
            stdout: false,
            stderr: false,
            stdin: true,
        }
    }

    pub fn wants_output(&self) -> bool {
        self.stdout || self.stderr
    }
}

/// Multiplexed output bytes in the frame wire format
pub type OutputStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Writable side of an attach
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Result of an attach call
pub struct AttachedIo {
    pub output: Option<OutputStream>,
    pub input: Option<InputSink>,
}

impl std::fmt::Debug for AttachedIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedIo")
            .field("output", &self.output.is_some())
            .field("input", &self.input.is_some())
            .finish()
    }
}

/// Exit status reported by `wait`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Capability interface over the concrete sandbox engine
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Allocate a sandbox without starting it
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<SandboxHandle>;

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    /// Open a channel to the sandbox's stdio
    async fn attach(
        &self,
        handle: &SandboxHandle,
        options: AttachOptions,
    ) -> SandboxResult<AttachedIo>;

    /// Ask the program to stop, killing it after `grace`
    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> SandboxResult<()>;

    async fn remove(&self, handle: &SandboxHandle) -> SandboxResult<()>;

    /// Resolve once the program exits
    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<ExitStatus>;

    /// Get engine name
    fn name(&self) -> &str;
}

/// Build the engine selected in configuration
pub fn engine_from_config(config: &SandboxConfig) -> SandboxResult<Arc<dyn SandboxEngine>> {
    match config.engine {
        #[cfg(feature = "docker")]
        EngineKind::Docker => Ok(Arc::new(DockerEngine::connect_local()?)),
        #[cfg(feature = "process")]
        EngineKind::Process => Ok(Arc::new(ProcessEngine::new())),
        #[allow(unreachable_patterns)]
        other => Err(SandboxError::Unsupported(format!(
            "{:?} engine (compile with the matching feature)",
            other
        ))),
    }
}

/// Writer that forwards everything written to it into `sink`.
///
/// Each write-only attach gets its own relay, so dropping one never closes
/// the sandbox's stdin.
pub(crate) fn stdin_relay(sink: mpsc::UnboundedSender<Bytes>) -> InputSink {
    let (writer, reader) = tokio::io::duplex(8 * 1024);
    tokio::spawn(async move {
        let mut chunks = ReaderStream::new(reader);
        while let Some(Ok(chunk)) = chunks.next().await {
            if sink.send(chunk).is_err() {
                break;
            }
        }
    });
    Box::pin(writer)
}

/// Read `pipe` to the end, sending each read as one frame of `kind`
pub(crate) fn frame_pipe<R>(
    pipe: R,
    kind: StreamKind,
    frames: mpsc::UnboundedSender<std::io::Result<Bytes>>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut chunks = ReaderStream::new(pipe);
        while let Some(item) = chunks.next().await {
            let framed = item.map(|chunk| encode_frame(kind, &chunk));
            let failed = framed.is_err();
            if frames.send(framed).is_err() || failed {
                break;
            }
        }
    })
}

/// Turn a frame receiver into an [`OutputStream`]
pub(crate) fn receiver_stream(
    mut frames: mpsc::UnboundedReceiver<std::io::Result<Bytes>>,
) -> OutputStream {
    futures::stream::poll_fn(move |cx| frames.poll_recv(cx)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode_text;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_env_var_lookup() {
        let spec = SandboxSpec {
            name: "sb".to_string(),
            image: "img".to_string(),
            command: vec!["run".to_string()],
            env: vec!["A=1".to_string(), "SRC=print('a=b')".to_string()],
            limits: ResourceLimits::default(),
        };
        assert_eq!(spec.env_var("SRC"), Some("print('a=b')"));
        assert_eq!(spec.env_var("B"), None);
    }

    #[tokio::test]
    async fn test_stdin_relay_forwards_until_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = stdin_relay(tx);
        sink.write_all(b"3\n").await.unwrap();
        sink.flush().await.unwrap();
        drop(sink);

        let mut received = Vec::new();
        while let Some(chunk) = rx.recv().await {
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"3\n");
    }

    #[tokio::test]
    async fn test_frame_pipe_frames_each_read() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipe: &'static [u8] = b"hello";
        frame_pipe(pipe, StreamKind::Stderr, tx).await.unwrap();

        let mut stream = receiver_stream(rx);
        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(raw[0], 2);
        assert_eq!(decode_text(&raw), "hello");
    }
}
