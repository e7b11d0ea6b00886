//! Idle session reaper

use crate::service::SessionService;
use crate::session::SessionState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Whether a session idle for `idle_for` should be reaped
pub fn is_idle(idle_for: Duration, threshold: Duration) -> bool {
    idle_for > threshold
}

/// Periodically evicts sessions with no recent input or output
pub struct IdleReaper {
    service: SessionService,
    idle_timeout: Duration,
    interval: Duration,
    stop_grace: Duration,
}

impl IdleReaper {
    pub fn new(service: SessionService) -> Self {
        let config = service.session_config();
        let (idle_timeout, interval, stop_grace) = (
            config.idle_timeout,
            config.reap_interval,
            config.reap_stop_grace,
        );
        Self {
            service,
            idle_timeout,
            interval,
            stop_grace,
        }
    }

    /// Reap every session idle at `now`; returns how many were evicted
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for session in self.service.registry().snapshot().await {
            let idle_for = session.idle_for(now);
            if !is_idle(idle_for, self.idle_timeout) {
                continue;
            }
            tracing::info!(
                session_id = %session.id(),
                idle_secs = idle_for.as_secs(),
                "Reaping idle session"
            );
            self.service
                .terminate_with_grace(
                    &session,
                    SessionState::Terminated,
                    "idle timeout",
                    self.stop_grace,
                )
                .await;
            reaped += 1;
        }
        reaped
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep every interval until `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = self.sweep().await;
                        if reaped > 0 {
                            tracing::debug!(reaped, "Idle sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Idle reaper stopped");
        })
    }
}
