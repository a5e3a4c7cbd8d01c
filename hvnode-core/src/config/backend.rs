//! Management backend and in-guest remote execution configuration

use super::defaults::*;
use crate::error::{HvnodeError, HvnodeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Interface-script backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Explicit PowerShell executable; searched on PATH when unset
    pub powershell_path: Option<PathBuf>,

    /// Interface script; defaults to `<image_cache_dir>/hypervmanage-0.1.ps1`
    pub script_path: Option<PathBuf>,
}

impl BackendConfig {
    pub fn from_env() -> HvnodeResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HVNODE_POWERSHELL") {
            config.powershell_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("HVNODE_SCRIPT_PATH") {
            config.script_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }
}

/// Guest access used for predefined in-guest commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Administrative account inside node images
    pub admin_user: String,

    /// Password for the administrative account, used through `sshpass`
    pub admin_password: Option<String>,

    /// Private key for the administrative account
    pub identity_file: Option<PathBuf>,

    /// SSH port inside the guest
    pub ssh_port: u16,

    /// SSH connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Script that sets the guest hostname; defaults to the image's install script
    pub rename_script: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            admin_user: DEFAULT_ADMIN_USER.to_string(),
            admin_password: None,
            identity_file: None,
            ssh_port: DEFAULT_SSH_PORT,
            connect_timeout: duration_secs(DEFAULT_SSH_CONNECT_TIMEOUT_SECS),
            rename_script: None,
        }
    }
}

impl RemoteConfig {
    pub fn from_env() -> HvnodeResult<Self> {
        let mut config = Self::default();

        if let Ok(user) = std::env::var("HVNODE_ADMIN_USER") {
            config.admin_user = user;
        }
        if let Ok(password) = std::env::var("HVNODE_ADMIN_PASSWORD") {
            config.admin_password = Some(password);
        }
        if let Ok(path) = std::env::var("HVNODE_IDENTITY_FILE") {
            config.identity_file = Some(PathBuf::from(path));
        }
        if let Ok(port) = std::env::var("HVNODE_SSH_PORT") {
            config.ssh_port = port
                .parse()
                .map_err(|_| HvnodeError::ConfigError("Invalid HVNODE_SSH_PORT".to_string()))?;
        }

        Ok(config)
    }

    pub fn rename_script(&self) -> String {
        self.rename_script
            .clone()
            .unwrap_or_else(|| default_rename_script(&self.admin_user))
    }

    pub fn validate(&self) -> HvnodeResult<()> {
        if self.admin_user.is_empty() {
            return Err(HvnodeError::ConfigError(
                "remote.admin_user must not be empty".to_string(),
            ));
        }
        if self.ssh_port == 0 {
            return Err(HvnodeError::ConfigError(
                "remote.ssh_port must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
