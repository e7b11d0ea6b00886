//! Resource limits configuration for sandboxed execution

use coderun_common::LimitsConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits for one sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in bytes
    pub memory_bytes: i64,

    /// Memory plus swap ceiling; equal to `memory_bytes` so the sandbox never swaps
    pub memory_swap_bytes: i64,

    /// CFS period in microseconds
    pub cpu_period_us: i64,

    /// CPU time allowed per period in microseconds
    pub cpu_quota_us: i64,

    /// Wall-clock limit for the whole session (None = no limit)
    pub max_duration: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_config(&LimitsConfig::default())
    }
}

impl ResourceLimits {
    pub fn from_config(config: &LimitsConfig) -> Self {
        let memory = i64::try_from(config.memory_bytes).unwrap_or(i64::MAX);
        let period = i64::try_from(config.cpu_period_us).unwrap_or(i64::MAX);
        Self {
            memory_bytes: memory,
            memory_swap_bytes: memory,
            cpu_period_us: period,
            cpu_quota_us: period.saturating_mul(i64::from(config.cpu_percent)) / 100,
            max_duration: (!config.execution_timeout.is_zero()).then_some(config.execution_timeout),
        }
    }

    /// Fraction of one CPU the sandbox may use
    pub fn cpu_fraction(&self) -> f64 {
        if self.cpu_period_us == 0 {
            return 0.0;
        }
        self.cpu_quota_us as f64 / self.cpu_period_us as f64
    }
}
