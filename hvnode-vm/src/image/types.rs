//! Image metadata and the catalog merge rule

use hvnode_core::ImageStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Image index keyed by Kubernetes version.
///
/// This is both the manifest wire format and the persisted cache index.
pub type ImageIndex = BTreeMap<String, Image>;

/// A bootable node image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "ImageK8sVersion")]
    k8s_version: String,
    #[serde(rename = "ImageChecksum")]
    checksum: String,
    #[serde(rename = "ImageSourceURL")]
    source_url: String,
    #[serde(rename = "ImageStatus", default)]
    status: ImageStatus,
    #[serde(rename = "ImageDeprecated", default)]
    deprecated: bool,
}

impl Image {
    pub fn new(
        k8s_version: impl Into<String>,
        checksum: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            k8s_version: k8s_version.into(),
            checksum: checksum.into(),
            source_url: source_url.into(),
            status: ImageStatus::NotDownloaded,
            deprecated: false,
        }
    }

    pub fn with_deprecated(mut self, deprecated: bool) -> Self {
        self.deprecated = deprecated;
        self
    }

    /// Version of Kubernetes present in the image.
    pub fn k8s_version(&self) -> &str {
        &self.k8s_version
    }

    /// Expected SHA-256 of the payload, lowercase hex.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// `Downloaded` means the payload is in the local cache and machines can
    /// be created from it.
    pub fn status(&self) -> ImageStatus {
        self.status
    }

    /// New machines should not be created from a deprecated image.
    pub fn deprecated(&self) -> bool {
        self.deprecated
    }

    pub(crate) fn set_status(&mut self, status: ImageStatus) {
        self.status = status;
    }

    /// Whether `other` describes the same payload as `self`.
    fn same_payload(&self, other: &Image) -> bool {
        self.checksum == other.checksum && self.source_url == other.source_url
    }
}

/// Normalize a freshly parsed manifest.
///
/// Every entry starts out `NotDownloaded` whatever the manifest claims, and
/// the map key is the authoritative version.
pub fn normalize_manifest(manifest: ImageIndex) -> ImageIndex {
    manifest
        .into_iter()
        .map(|(version, mut image)| {
            image.k8s_version = version.clone();
            image.status = ImageStatus::NotDownloaded;
            (version, image)
        })
        .collect()
}

/// Merge a refreshed catalog over the current index.
///
/// An entry keeps `Downloaded` only if it was downloaded before and its
/// checksum and source are unchanged; the local payload is still valid in
/// that case. Versions absent from `incoming` are dropped.
pub fn merge_catalog(current: &ImageIndex, incoming: ImageIndex) -> ImageIndex {
    incoming
        .into_iter()
        .map(|(version, mut image)| {
            if let Some(old) = current.get(&version) {
                if old.status == ImageStatus::Downloaded && old.same_payload(&image) {
                    image.status = ImageStatus::Downloaded;
                }
            }
            (version, image)
        })
        .collect()
}
