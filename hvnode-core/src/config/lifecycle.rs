//! Machine creation and state-wait configuration

use super::defaults::*;
use super::{parse_bool_from_env, parse_duration_secs_from_env};
use crate::error::{HvnodeError, HvnodeResult};
use crate::patterns::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Timeout handed to the backend when waiting for a state change
    #[serde(with = "humantime_serde")]
    pub state_wait_timeout: Duration,

    /// Extra local allowance on top of the backend wait before giving up
    #[serde(with = "humantime_serde")]
    pub state_wait_grace: Duration,

    /// Number of IP address polls after boot
    pub ip_attempts: u32,

    /// Number of in-guest rename attempts
    pub rename_attempts: u32,

    /// Base of the linear backoff between attempts
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Static memory assigned to new machines
    pub memory_bytes: u64,

    /// Virtual processors assigned to new machines
    pub processor_count: u32,

    /// Checkpoint type applied to new machines
    pub checkpoint_type: String,

    /// Wait for the backend to confirm the final stop of a newly created machine
    pub await_stop_confirmation: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            state_wait_timeout: duration_secs(DEFAULT_STATE_WAIT_TIMEOUT_SECS),
            state_wait_grace: duration_secs(DEFAULT_STATE_WAIT_GRACE_SECS),
            ip_attempts: DEFAULT_IP_ATTEMPTS,
            rename_attempts: DEFAULT_RENAME_ATTEMPTS,
            retry_backoff: duration_secs(DEFAULT_RETRY_BACKOFF_SECS),
            memory_bytes: DEFAULT_MEMORY_BYTES,
            processor_count: DEFAULT_PROCESSOR_COUNT,
            checkpoint_type: DEFAULT_CHECKPOINT_TYPE.to_string(),
            await_stop_confirmation: DEFAULT_AWAIT_STOP_CONFIRMATION,
        }
    }
}

impl LifecycleConfig {
    pub fn from_env() -> HvnodeResult<Self> {
        let mut config = Self::default();

        config.state_wait_timeout =
            parse_duration_secs_from_env("HVNODE_STATE_WAIT_TIMEOUT_SECS", config.state_wait_timeout);
        config.retry_backoff =
            parse_duration_secs_from_env("HVNODE_RETRY_BACKOFF_SECS", config.retry_backoff);

        if let Ok(attempts) = std::env::var("HVNODE_IP_ATTEMPTS") {
            config.ip_attempts = attempts.parse().map_err(|_| {
                HvnodeError::ConfigError("Invalid HVNODE_IP_ATTEMPTS".to_string())
            })?;
        }
        if let Ok(attempts) = std::env::var("HVNODE_RENAME_ATTEMPTS") {
            config.rename_attempts = attempts.parse().map_err(|_| {
                HvnodeError::ConfigError("Invalid HVNODE_RENAME_ATTEMPTS".to_string())
            })?;
        }
        if let Some(await_stop) = parse_bool_from_env("HVNODE_AWAIT_STOP_CONFIRMATION")? {
            config.await_stop_confirmation = await_stop;
        }

        Ok(config)
    }

    pub fn validate(&self) -> HvnodeResult<()> {
        if self.ip_attempts == 0 {
            return Err(HvnodeError::ConfigError(
                "lifecycle.ip_attempts must be at least 1".to_string(),
            ));
        }
        if self.rename_attempts == 0 {
            return Err(HvnodeError::ConfigError(
                "lifecycle.rename_attempts must be at least 1".to_string(),
            ));
        }
        if self.processor_count == 0 {
            return Err(HvnodeError::ConfigError(
                "lifecycle.processor_count must be non-zero".to_string(),
            ));
        }
        if self.memory_bytes < 512 * 1024 * 1024 {
            return Err(HvnodeError::ConfigError(
                "lifecycle.memory_bytes must be at least 512MiB".to_string(),
            ));
        }
        if self.state_wait_timeout.is_zero() {
            return Err(HvnodeError::ConfigError(
                "lifecycle.state_wait_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry schedule for IP polling: pause before each poll. Always at
    /// least one poll, even for a config that skipped validation.
    pub fn ip_retry(&self) -> RetryConfig {
        RetryConfig::linear(self.ip_attempts.max(1), self.retry_backoff)
            .with_delay_first(true)
            .with_operation_name("ip acquisition")
    }

    /// Retry schedule for the in-guest rename: pause between attempts.
    /// Always at least one attempt.
    pub fn rename_retry(&self) -> RetryConfig {
        RetryConfig::linear(self.rename_attempts.max(1), self.retry_backoff)
            .with_operation_name("rename")
    }
}
