//! Image catalog configuration

use super::defaults::*;
use crate::error::{HvnodeError, HvnodeResult};
use serde::{Deserialize, Serialize};

/// Image catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    /// Manifest listing the available images
    pub source_url: String,

    /// File name of the persisted image index inside the config directory
    pub index_file: String,

    /// Prefix of cached payload file names
    pub file_prefix: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            source_url: default_images_source_url(),
            index_file: DEFAULT_IMAGES_INDEX_FILE.to_string(),
            file_prefix: DEFAULT_IMAGE_FILE_PREFIX.to_string(),
        }
    }
}

impl ImagesConfig {
    pub fn from_env() -> HvnodeResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("HVNODE_IMAGES_URL") {
            config.source_url = url;
        }

        Ok(config)
    }

    pub fn validate(&self) -> HvnodeResult<()> {
        if self.source_url.is_empty() {
            return Err(HvnodeError::ConfigError(
                "images.source_url must not be empty".to_string(),
            ));
        }
        if self.index_file.is_empty() || self.index_file.contains(['/', '\\']) {
            return Err(HvnodeError::ConfigError(format!(
                "images.index_file must be a plain file name, got '{}'",
                self.index_file
            )));
        }
        Ok(())
    }
}
