//! Local cache of verified image payloads
//!
//! The cache owns one directory of payload files named
//! `<prefix><version>.vhdx` and an index recording which versions are known
//! and which are present. A payload only lands in the cache directory after
//! its SHA-256 matched the catalog checksum; scratch files are scoped
//! temporaries removed on every exit path.

use super::archive::{extract_single, PayloadKind};
use super::fetch::{HttpFetcher, ImageFetcher, Progress};
use super::store::{ImageIndexStore, JsonFileStore};
use super::types::{merge_catalog, normalize_manifest, Image, ImageIndex};
use crate::fsutil::{blocking, copy_atomically, sha256_file};
use hvnode_core::config::{HvnodeConfig, DEFAULT_IMAGE_FILE_EXTENSION};
use hvnode_core::{HvnodeError, HvnodeResult, ImageStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub struct ImageCache {
    cache_dir: PathBuf,
    file_prefix: String,
    images: ImageIndex,
    store: Box<dyn ImageIndexStore>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl ImageCache {
    /// Open the cache in `cache_dir`, loading the persisted index.
    pub async fn open(
        cache_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        store: Box<dyn ImageIndexStore>,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> HvnodeResult<Self> {
        let cache_dir = cache_dir.into();
        tokio::fs::create_dir_all(&cache_dir).await?;
        let images = store.load().await?.unwrap_or_default();
        debug!(
            "Opened image cache at {} with {} known images",
            cache_dir.display(),
            images.len()
        );

        Ok(Self {
            cache_dir,
            file_prefix: file_prefix.into(),
            images,
            store,
            fetcher,
        })
    }

    /// Open the cache described by `config`, persisting the index as JSON in
    /// the configuration directory and fetching over HTTP.
    pub async fn from_config(config: &HvnodeConfig) -> HvnodeResult<Self> {
        let store = JsonFileStore::new(config.paths.config_dir.join(&config.images.index_file));
        Self::open(
            config.paths.image_cache_dir.clone(),
            config.images.file_prefix.clone(),
            Box::new(store),
            Arc::new(HttpFetcher::new()),
        )
        .await
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// All known images, ordered by version.
    pub fn list_images(&self) -> Vec<&Image> {
        self.images.values().collect()
    }

    pub fn get_image(&self, version: &str) -> Option<&Image> {
        self.images.get(version)
    }

    /// Where the payload for `version` lives once downloaded.
    pub fn image_path(&self, version: &str) -> PathBuf {
        self.cache_dir.join(format!(
            "{}{}.{}",
            self.file_prefix, version, DEFAULT_IMAGE_FILE_EXTENSION
        ))
    }

    /// Payload path of a `Downloaded` image, for staging machine disks.
    pub fn cached_path(&self, version: &str) -> HvnodeResult<PathBuf> {
        let image = self.lookup(version)?;
        let path = self.image_path(version);
        if image.status() != ImageStatus::Downloaded {
            return Err(HvnodeError::Staging {
                version: version.to_string(),
                path,
                reason: "image has not been downloaded".to_string(),
            });
        }
        if !path.is_file() {
            return Err(HvnodeError::Staging {
                version: version.to_string(),
                path,
                reason: "cached payload is missing".to_string(),
            });
        }
        Ok(path)
    }

    /// Download, verify and install the payload for `version`.
    pub async fn fetch_image(&mut self, version: &str) -> HvnodeResult<()> {
        self.fetch(version, None).await
    }

    /// `fetch_image`, reporting `(bytes_so_far, total_bytes)` as the
    /// download proceeds.
    pub async fn fetch_image_with_progress(
        &mut self,
        version: &str,
        progress: Progress<'_>,
    ) -> HvnodeResult<()> {
        self.fetch(version, Some(progress)).await
    }

    async fn fetch(&mut self, version: &str, progress: Option<Progress<'_>>) -> HvnodeResult<()> {
        let source_url = self.lookup(version)?.source_url().to_string();
        info!("Fetching image {} from {}", version, source_url);

        let download = self.scratch_file()?;
        let size = self
            .fetcher
            .fetch(&source_url, download.path(), progress)
            .await?;
        debug!("Downloaded {} bytes for image {}", size, version);

        let download_path = download.path().to_path_buf();
        let kind = blocking(move || PayloadKind::sniff(&download_path)).await?;
        self.install(version, download, kind).await?;

        info!("Image {} is ready", version);
        Ok(())
    }

    /// Verify and install a payload the user obtained out of band.
    ///
    /// The file must be a `.vhdx` disk or a `.zip`, `.tar.gz`, `.tgz` or `.tar.zst`
    /// archive holding exactly one disk.
    pub async fn import_local_file(&mut self, version: &str, path: &Path) -> HvnodeResult<()> {
        self.lookup(version)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = PayloadKind::from_file_name(&name).ok_or_else(|| {
            HvnodeError::format(
                path,
                "expected a .vhdx disk or a .zip, .tar.gz, .tgz or .tar.zst archive",
            )
        })?;
        if !path.is_file() {
            return Err(HvnodeError::not_found(path.display().to_string()));
        }

        info!("Importing image {} from {}", version, path.display());
        let local = LocalPayload::Borrowed(path.to_path_buf());
        self.install(version, local, kind).await?;
        info!("Image {} is ready", version);
        Ok(())
    }

    /// Delete the cached payload for `version` and mark it `NotDownloaded`.
    ///
    /// A payload that is already gone counts as deleted. If the file cannot
    /// be removed the status is left as it was.
    pub async fn purge_local(&mut self, version: &str) -> HvnodeResult<()> {
        if self.lookup(version)?.status() == ImageStatus::NotDownloaded {
            debug!("Image {} is not cached, nothing to purge", version);
            return Ok(());
        }

        let path = self.image_path(version);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed cached image {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cached image {} already absent", path.display())
            }
            Err(e) => return Err(e.into()),
        }

        self.set_status(version, ImageStatus::NotDownloaded).await
    }

    /// Replace the catalog with the manifest at `source_url`.
    ///
    /// Images whose checksum and source are unchanged keep their download
    /// status; the index is left untouched if the manifest cannot be read.
    pub async fn refresh_catalog(&mut self, source_url: &str) -> HvnodeResult<()> {
        info!("Refreshing image catalog from {}", source_url);
        let download = self.scratch_file()?;
        self.fetcher.fetch(source_url, download.path(), None).await?;
        let raw = tokio::fs::read(download.path()).await?;
        drop(download);
        let manifest: ImageIndex = serde_json::from_slice(&raw)?;
        let merged = merge_catalog(&self.images, normalize_manifest(manifest));

        for (version, image) in &self.images {
            if image.status() == ImageStatus::Downloaded
                && merged.get(version).map(Image::status) != Some(ImageStatus::Downloaded)
            {
                warn!(
                    "Cached payload for image {} is stale after catalog refresh",
                    version
                );
            }
        }

        self.store.save(&merged).await?;
        info!("Image catalog now lists {} images", merged.len());
        self.images = merged;
        Ok(())
    }

    /// Re-hash the cached payload of a `Downloaded` image against its checksum.
    pub async fn verify_cached(&self, version: &str) -> HvnodeResult<bool> {
        let path = self.cached_path(version)?;
        let expected = self.lookup(version)?.checksum().to_ascii_lowercase();
        let actual = blocking(move || sha256_file(&path)).await?;
        if actual != expected {
            warn!(
                "Cached image {} does not match its checksum: expected {}, got {}",
                version, expected, actual
            );
        }
        Ok(actual == expected)
    }

    fn lookup(&self, version: &str) -> HvnodeResult<&Image> {
        self.images
            .get(version)
            .ok_or_else(|| HvnodeError::not_found(format!("image {}", version)))
    }

    fn scratch_file(&self) -> HvnodeResult<NamedTempFile> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!(".{}download-", self.file_prefix))
            .tempfile_in(&self.cache_dir)?;
        Ok(scratch)
    }

    /// Unpack if needed, verify against the catalog checksum and move the
    /// payload into place. On any failure the previous cached copy, if any,
    /// is left untouched.
    async fn install(
        &mut self,
        version: &str,
        payload: impl Into<LocalPayload>,
        kind: PayloadKind,
    ) -> HvnodeResult<()> {
        let payload = payload.into();
        let expected = self.lookup(version)?.checksum().to_ascii_lowercase();
        let target = self.image_path(version);
        let scratch_dir = self.cache_dir.clone();
        let version_owned = version.to_string();

        blocking(move || {
            let extracted;
            let disk = if kind.is_archive() {
                extracted = extract_single(kind, payload.path(), &scratch_dir)?;
                extracted.path()
            } else {
                payload.path()
            };

            let actual = sha256_file(disk)?;
            if actual != expected {
                return Err(HvnodeError::Integrity {
                    version: version_owned,
                    expected,
                    actual,
                });
            }

            copy_atomically(disk, &target)?;
            Ok(())
        })
        .await?;

        self.set_status(version, ImageStatus::Downloaded).await
    }

    async fn set_status(&mut self, version: &str, status: ImageStatus) -> HvnodeResult<()> {
        let mut updated = self.images.clone();
        if let Some(image) = updated.get_mut(version) {
            image.set_status(status);
        }
        self.store.save(&updated).await?;
        self.images = updated;
        debug!("Image {} is now {}", version, status);
        Ok(())
    }
}

/// Payload file the cache reads from: either a scratch download it owns or
/// a caller's file it must not touch.
enum LocalPayload {
    Scratch(NamedTempFile),
    Borrowed(PathBuf),
}

impl LocalPayload {
    fn path(&self) -> &Path {
        match self {
            LocalPayload::Scratch(file) => file.path(),
            LocalPayload::Borrowed(path) => path,
        }
    }
}

impl From<NamedTempFile> for LocalPayload {
    fn from(file: NamedTempFile) -> Self {
        LocalPayload::Scratch(file)
    }
}
