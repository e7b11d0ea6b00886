//! Docker engine - one container per sandbox, driven over the Docker API

use super::{
    AttachOptions, AttachedIo, ExitStatus, OutputStream, SandboxEngine, SandboxHandle, SandboxSpec,
};
use crate::error::{SandboxError, SandboxResult};
use crate::frame::{encode_frame, StreamKind};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    WaitContainerOptions,
};
use bollard::Docker;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;

const MANAGED_LABEL: &str = "coderun.managed";

/// Docker engine backed by the local daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the platform's default socket or `DOCKER_HOST`
    pub fn connect_local() -> SandboxResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::operation("connect", "docker", e))?;
        Ok(Self::with_client(docker))
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Pull `image` if the daemon does not have it yet
    async fn ensure_image(&self, image: &str, sandbox: &str) -> SandboxResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (from_image, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        tracing::info!(image, "Pulling sandbox image");
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| SandboxError::operation("pull_image", sandbox, e))?;
        Ok(())
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Re-frame one attach item into the multiplexed wire format
fn reframe(item: Result<LogOutput, BollardError>) -> std::io::Result<Bytes> {
    match item {
        Ok(LogOutput::StdOut { message }) => Ok(encode_frame(StreamKind::Stdout, &message)),
        Ok(LogOutput::StdErr { message }) => Ok(encode_frame(StreamKind::Stderr, &message)),
        Ok(LogOutput::Console { message }) => Ok(encode_frame(StreamKind::Raw, &message)),
        Ok(LogOutput::StdIn { .. }) => Ok(Bytes::new()),
        Err(e) => Err(std::io::Error::other(e)),
    }
}

#[async_trait]
impl SandboxEngine for DockerEngine {
    async fn create(&self, spec: SandboxSpec) -> SandboxResult<SandboxHandle> {
        self.ensure_image(&spec.image, &spec.name).await?;

        let limits = &spec.limits;
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            tty: Some(false),
            open_stdin: Some(true),
            stdin_once: Some(false),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                memory: Some(limits.memory_bytes),
                memory_swap: Some(limits.memory_swap_bytes),
                cpu_period: Some(limits.cpu_period_us),
                cpu_quota: Some(limits.cpu_quota_us),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| SandboxError::operation("create_container", &spec.name, e))?;
        for warning in &created.warnings {
            tracing::warn!(sandbox = %spec.name, %warning, "Docker create warning");
        }
        Ok(SandboxHandle::new(spec.name))
    }

    async fn start(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.docker
            .start_container(handle.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| SandboxError::operation("start_container", handle.as_str(), e))
    }

    async fn attach(
        &self,
        handle: &SandboxHandle,
        options: AttachOptions,
    ) -> SandboxResult<AttachedIo> {
        // `logs` replays output produced between start and attach.
        let query = AttachContainerOptionsBuilder::new()
            .stream(true)
            .logs(options.wants_output())
            .stdin(options.stdin)
            .stdout(options.stdout)
            .stderr(options.stderr)
            .build();
        let attached = self
            .docker
            .attach_container(handle.as_str(), Some(query))
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound(handle.to_string()),
                _ => SandboxError::operation("attach_container", handle.as_str(), e),
            })?;

        let output: Option<OutputStream> = options
            .wants_output()
            .then(|| attached.output.map(reframe).boxed());
        let input = options.stdin.then_some(attached.input);
        Ok(AttachedIo { output, input })
    }

    async fn stop(&self, handle: &SandboxHandle, grace: Duration) -> SandboxResult<()> {
        let seconds = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(
                handle.as_str(),
                Some(StopContainerOptionsBuilder::new().t(seconds).build()),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Err(SandboxError::NotFound(handle.to_string())),
            Err(e) => Err(SandboxError::operation("stop_container", handle.as_str(), e)),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> SandboxResult<()> {
        self.docker
            .remove_container(
                handle.as_str(),
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
            .map_err(|e| match status_code(&e) {
                Some(404) => SandboxError::NotFound(handle.to_string()),
                _ => SandboxError::operation("remove_container", handle.as_str(), e),
            })
    }

    async fn wait(&self, handle: &SandboxHandle) -> SandboxResult<ExitStatus> {
        let mut waits = self
            .docker
            .wait_container(handle.as_str(), None::<WaitContainerOptions>);
        match waits.next().await {
            Some(Ok(response)) => Ok(ExitStatus {
                code: response.status_code,
            }),
            // Non-zero exits arrive as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => {
                Ok(ExitStatus { code })
            }
            Some(Err(e)) if status_code(&e) == Some(404) => {
                Err(SandboxError::NotFound(handle.to_string()))
            }
            Some(Err(e)) => Err(SandboxError::operation("wait_container", handle.as_str(), e)),
            None => Err(SandboxError::operation(
                "wait_container",
                handle.as_str(),
                "wait stream ended without a status",
            )),
        }
    }

    fn name(&self) -> &str {
        "docker"
    }
}
