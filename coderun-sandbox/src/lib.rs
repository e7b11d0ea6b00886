//! Coderun sandbox - interactive code execution sessions
//!
//! Runs submitted code in a sandbox, relays stdin one line at a time and
//! collects output until the program prompts, finishes or goes quiet.
//! Engines: Docker containers (feature `docker`) and local processes
//! (feature `process`).

mod detector;
mod engine;
mod error;
mod frame;
mod lifecycle;
mod limits;
mod reaper;
mod registry;
mod service;
mod session;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use detector::{Detection, PromptDetector};
#[cfg(feature = "docker")]
pub use engine::DockerEngine;
#[cfg(feature = "process")]
pub use engine::ProcessEngine;
pub use engine::{
    engine_from_config, AttachOptions, AttachedIo, ExitStatus, InputSink, OutputStream,
    SandboxEngine, SandboxHandle, SandboxSpec,
};
pub use error::{SandboxError, SandboxResult, SessionError, SessionResult};
pub use frame::{
    decode, decode_text, demux, encode_frame, Demuxed, FrameDecoder, OutputChunk, StreamKind,
    HEADER_LEN,
};
pub use lifecycle::{LifecycleManager, TeardownReport};
pub use limits::ResourceLimits;
pub use reaper::{is_idle, IdleReaper};
pub use registry::SessionRegistry;
pub use service::{SessionService, TurnOutput};
pub use session::{Session, SessionId, SessionState, StreamEvent, StreamHandle};
