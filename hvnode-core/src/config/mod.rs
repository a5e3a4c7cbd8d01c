//! Configuration for the hvnode driver
//!
//! This module provides a structured configuration system with sensible defaults,
//! TOML file loading, environment variable overrides, and validation.

use crate::error::{HvnodeError, HvnodeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod backend;
pub mod defaults;
pub mod images;
pub mod lifecycle;
pub mod paths;

pub use backend::{BackendConfig, RemoteConfig};
pub use defaults::*;
pub use images::ImagesConfig;
pub use lifecycle::LifecycleConfig;
pub use paths::PathsConfig;

/// Root configuration structure for hvnode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HvnodeConfig {
    /// Directory layout
    pub paths: PathsConfig,

    /// Image catalog
    pub images: ImagesConfig,

    /// Machine lifecycle behaviour
    pub lifecycle: LifecycleConfig,

    /// Management backend
    pub backend: BackendConfig,

    /// In-guest command execution
    pub remote: RemoteConfig,

    /// Short name of the current user; resolved from the environment when unset
    pub user: Option<String>,
}

impl HvnodeConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> HvnodeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            HvnodeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> HvnodeResult<Self> {
        let config = Self {
            paths: PathsConfig::from_env()?,
            images: ImagesConfig::from_env()?,
            lifecycle: LifecycleConfig::from_env()?,
            backend: BackendConfig::from_env()?,
            remote: RemoteConfig::from_env()?,
            user: std::env::var("HVNODE_USER").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> HvnodeResult<()> {
        self.paths.validate()?;
        self.images.validate()?;
        self.lifecycle.validate()?;
        self.remote.validate()?;

        if let Some(user) = &self.user {
            validate_name_component("user", user)?;
        }

        Ok(())
    }

    /// Short name of the user owning the machines.
    ///
    /// Backend VM names are host-wide, so the user name keeps nodes created by
    /// different users apart.
    pub fn current_user(&self) -> HvnodeResult<String> {
        if let Some(user) = &self.user {
            return Ok(user.clone());
        }
        ["USERNAME", "USER"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
            .ok_or_else(|| {
                HvnodeError::ConfigError(
                    "Cannot determine the current user; set HVNODE_USER".to_string(),
                )
            })
    }

    /// Create a test configuration rooted in `root`
    pub fn test(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths = PathsConfig::under(&root.join("cache"), root.join("config"));
        config.user = Some("tester".to_string());
        config.lifecycle.retry_backoff = Duration::from_millis(1);
        config.lifecycle.state_wait_timeout = Duration::from_secs(1);
        config.lifecycle.state_wait_grace = Duration::from_millis(100);
        config
    }
}

/// Builder for HvnodeConfig
pub struct HvnodeConfigBuilder {
    config: HvnodeConfig,
}

impl HvnodeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HvnodeConfig::default(),
        }
    }

    pub fn paths(mut self, paths: PathsConfig) -> Self {
        self.config.paths = paths;
        self
    }

    pub fn images(mut self, images: ImagesConfig) -> Self {
        self.config.images = images;
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.config.lifecycle = lifecycle;
        self
    }

    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.config.backend = backend;
        self
    }

    pub fn remote(mut self, remote: RemoteConfig) -> Self {
        self.config.remote = remote;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = Some(user.into());
        self
    }

    pub fn build(self) -> HvnodeResult<HvnodeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for HvnodeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Machine, cluster and user names become `-`-separated fields of the
/// backend name, so they must be non-empty and free of the separator for
/// the qualified name to stay reversible.
pub fn validate_name_component(field: &str, value: &str) -> HvnodeResult<()> {
    if value.is_empty() {
        return Err(HvnodeError::InvalidInput {
            field: field.to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if value.contains('-') {
        return Err(HvnodeError::InvalidInput {
            field: field.to_string(),
            message: format!("'{}' must not contain '-'", value),
        });
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(HvnodeError::InvalidInput {
            field: field.to_string(),
            message: format!("'{}' may only contain letters, digits and '_'", value),
        });
    }
    Ok(())
}

/// Machine names become guest hostnames and the trailing field of the
/// backend name, so unlike cluster and user names they may contain `-`.
pub fn validate_machine_name(value: &str) -> HvnodeResult<()> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && !value.starts_with('-')
        && !value.ends_with('-')
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(HvnodeError::InvalidInput {
            field: "machine".to_string(),
            message: format!("'{}' is not a valid host name", value),
        })
    }
}

/// Helper functions for environment parsing
pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub(crate) fn parse_bool_from_env(key: &str) -> HvnodeResult<Option<bool>> {
    match std::env::var(key) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(HvnodeError::ConfigError(format!("Invalid {}", key))),
        },
        Err(_) => Ok(None),
    }
}
