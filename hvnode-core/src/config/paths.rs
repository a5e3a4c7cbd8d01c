//! Directory layout for cached images, machine disks and VM working files

use super::defaults::*;
use crate::error::{HvnodeError, HvnodeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where verified image payloads and the interface script live
    pub image_cache_dir: PathBuf,

    /// Where the image index is persisted
    pub config_dir: PathBuf,

    /// Where per-machine disk copies are staged
    pub disk_dir: PathBuf,

    /// Parent of each VM's working directory
    pub machine_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cache_root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DEFAULT_APP_DIR);
        let config_dir = dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(DEFAULT_APP_DIR);
        Self::under(&cache_root, config_dir)
    }
}

impl PathsConfig {
    /// Lay out all cache directories below `cache_root`.
    pub fn under(cache_root: &Path, config_dir: PathBuf) -> Self {
        Self {
            image_cache_dir: cache_root.join(DEFAULT_IMAGE_CACHE_SUBDIR),
            config_dir,
            disk_dir: cache_root.join(DEFAULT_DISK_SUBDIR),
            machine_dir: cache_root.join(DEFAULT_MACHINE_SUBDIR),
        }
    }

    pub fn from_env() -> HvnodeResult<Self> {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("HVNODE_CACHE_DIR") {
            let config_dir = config.config_dir.clone();
            config = Self::under(Path::new(&root), config_dir);
        }
        if let Ok(dir) = std::env::var("HVNODE_CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Create every configured directory.
    pub fn ensure_exist(&self) -> HvnodeResult<()> {
        for dir in [
            &self.image_cache_dir,
            &self.config_dir,
            &self.disk_dir,
            &self.machine_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> HvnodeResult<()> {
        for (name, dir) in [
            ("paths.image_cache_dir", &self.image_cache_dir),
            ("paths.config_dir", &self.config_dir),
            ("paths.disk_dir", &self.disk_dir),
            ("paths.machine_dir", &self.machine_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(HvnodeError::ConfigError(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}
