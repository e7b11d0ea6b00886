//! Sandbox lifecycle - create, start, attach and best-effort teardown

use crate::engine::{
    AttachOptions, AttachedIo, InputSink, SandboxEngine, SandboxHandle, SandboxSpec,
};
use crate::error::{SandboxError, SandboxResult};
use crate::limits::ResourceLimits;
use crate::session::SessionId;
use coderun_common::{SandboxConfig, SOURCE_ENV_VAR};
use std::sync::Arc;
use std::time::Duration;

/// What a teardown managed to do
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub stopped: bool,
    pub removed: bool,
}

/// Drives one engine with a fixed sandbox template
#[derive(Clone)]
pub struct LifecycleManager {
    engine: Arc<dyn SandboxEngine>,
    config: Arc<SandboxConfig>,
    limits: ResourceLimits,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn SandboxEngine>, config: SandboxConfig) -> Self {
        let limits = ResourceLimits::from_config(&config.limits);
        Self {
            engine,
            config: Arc::new(config),
            limits,
        }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Sandbox template for one session. The code travels in the environment.
    pub fn spec_for(&self, id: &SessionId, code: &str) -> SandboxSpec {
        let mut env = self.config.env.clone();
        env.push(format!("{SOURCE_ENV_VAR}={code}"));
        SandboxSpec {
            name: format!("{}{}", self.config.name_prefix, id),
            image: self.config.image.clone(),
            command: self.config.command.clone(),
            env,
            limits: self.limits.clone(),
        }
    }

    pub async fn create(&self, id: &SessionId, code: &str) -> SandboxResult<SandboxHandle> {
        let spec = self.spec_for(id, code);
        tracing::debug!(session_id = %id, sandbox = %spec.name, "Creating sandbox");
        self.engine.create(spec).await
    }

    pub async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.engine.start(handle).await
    }

    /// Long-lived read channel
    pub async fn attach_duplex(&self, handle: &SandboxHandle) -> SandboxResult<AttachedIo> {
        self.engine.attach(handle, AttachOptions::duplex()).await
    }

    /// Fresh write-only channel for one line of input
    pub async fn open_input(&self, handle: &SandboxHandle) -> SandboxResult<Option<InputSink>> {
        let io = self.engine.attach(handle, AttachOptions::stdin_only()).await?;
        Ok(io.input)
    }

    /// Stop then remove, logging instead of failing
    pub async fn teardown(&self, handle: &SandboxHandle, grace: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();

        match self.engine.stop(handle, grace).await {
            Ok(()) => report.stopped = true,
            Err(SandboxError::NotFound(_)) => {}
            Err(e) => tracing::warn!(sandbox = %handle, error = %e, "Failed to stop sandbox"),
        }
        match self.engine.remove(handle).await {
            Ok(()) => report.removed = true,
            Err(SandboxError::NotFound(_)) => {
                tracing::debug!(sandbox = %handle, "Sandbox already removed");
            }
            Err(e) => tracing::warn!(sandbox = %handle, error = %e, "Failed to remove sandbox"),
        }
        report
    }

    /// Log the exit status once the program finishes
    pub fn watch_exit(&self, session_id: &SessionId, handle: &SandboxHandle) {
        let engine = Arc::clone(&self.engine);
        let session_id = session_id.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match engine.wait(&handle).await {
                Ok(status) => tracing::debug!(
                    session_id = %session_id,
                    sandbox = %handle,
                    exit_code = status.code,
                    "Sandbox program exited"
                ),
                Err(e) => tracing::debug!(
                    session_id = %session_id,
                    sandbox = %handle,
                    error = %e,
                    "Stopped waiting for sandbox exit"
                ),
            }
        });
    }
}
