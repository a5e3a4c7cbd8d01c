//! Driver facade over the image cache and the machine lifecycle

use crate::image::{Image, ImageCache, Progress};
use crate::lifecycle::{CreatedMachine, LifecycleController};
use crate::machine::{Machine, MachineContext};
use crate::script_backend::ScriptBackend;
use crate::ssh::SshExec;
use hvnode_core::backend::ops;
use hvnode_core::config::HvnodeConfig;
use hvnode_core::{HvnodeError, HvnodeResult, ManagementBackend, RemoteExec};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DRIVER_NAME: &str = "hyperv";
pub const DRIVER_DESCRIPTION: &str = "Kutti driver for Hyper-V";

/// Health of the management backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverStatus {
    Ready,
    Error(String),
}

impl std::fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverStatus::Ready => f.write_str("Ready"),
            DriverStatus::Error(message) => write!(f, "Error: {}", message),
        }
    }
}

pub struct Driver {
    config: HvnodeConfig,
    images: Mutex<ImageCache>,
    lifecycle: LifecycleController,
}

impl Driver {
    /// Driver using the PowerShell interface script and `ssh`.
    pub async fn from_config(config: HvnodeConfig) -> HvnodeResult<Self> {
        config.validate()?;
        config.paths.ensure_exist()?;

        let backend: Arc<dyn ManagementBackend> = Arc::new(ScriptBackend::from_config(&config));
        let remote: Arc<dyn RemoteExec> = Arc::new(SshExec::new(config.remote.clone()));
        let ctx = MachineContext::from_config(backend, remote, &config)?;
        let images = ImageCache::from_config(&config).await?;

        Ok(Self::new(config, ctx, images))
    }

    pub fn new(config: HvnodeConfig, ctx: MachineContext, images: ImageCache) -> Self {
        let lifecycle = LifecycleController::new(Arc::new(ctx), &config.paths);
        Self {
            config,
            images: Mutex::new(images),
            lifecycle,
        }
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    pub fn description(&self) -> &'static str {
        DRIVER_DESCRIPTION
    }

    pub fn config(&self) -> &HvnodeConfig {
        &self.config
    }

    /// Check that the management backend can be reached and is usable.
    pub async fn validate(&self) -> HvnodeResult<()> {
        self.lifecycle
            .context()
            .call(ops::CHECK_DRIVER, &[])
            .await
            .map(|_| ())
            .map_err(|e| match e {
                HvnodeError::BackendUnavailable { .. } => e,
                other => HvnodeError::backend_unavailable(other.to_string()),
            })
    }

    pub async fn status(&self) -> DriverStatus {
        match self.validate().await {
            Ok(()) => DriverStatus::Ready,
            Err(e) => {
                warn!("Driver is not ready: {}", e);
                DriverStatus::Error(e.to_string())
            }
        }
    }

    pub async fn list_images(&self) -> Vec<Image> {
        self.images
            .lock()
            .await
            .list_images()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn get_image(&self, version: &str) -> HvnodeResult<Image> {
        self.images
            .lock()
            .await
            .get_image(version)
            .cloned()
            .ok_or_else(|| HvnodeError::not_found(format!("image {}", version)))
    }

    pub async fn fetch_image(&self, version: &str) -> HvnodeResult<()> {
        self.images.lock().await.fetch_image(version).await
    }

    pub async fn fetch_image_with_progress(
        &self,
        version: &str,
        progress: Progress<'_>,
    ) -> HvnodeResult<()> {
        self.images
            .lock()
            .await
            .fetch_image_with_progress(version, progress)
            .await
    }

    pub async fn import_local_file(&self, version: &str, path: &Path) -> HvnodeResult<()> {
        self.images.lock().await.import_local_file(version, path).await
    }

    pub async fn purge_local(&self, version: &str) -> HvnodeResult<()> {
        self.images.lock().await.purge_local(version).await
    }

    /// Refresh the catalog from `source_url`, or from the configured
    /// manifest when none is given.
    pub async fn refresh_catalog(&self, source_url: Option<&str>) -> HvnodeResult<()> {
        let url = source_url.unwrap_or(&self.config.images.source_url);
        self.images.lock().await.refresh_catalog(url).await
    }

    pub async fn verify_cached(&self, version: &str) -> HvnodeResult<bool> {
        self.images.lock().await.verify_cached(version).await
    }

    pub async fn list_machines(&self) -> HvnodeResult<Vec<Machine>> {
        self.lifecycle.list_machines().await
    }

    pub async fn get_machine(&self, name: &str, cluster: &str) -> HvnodeResult<Machine> {
        self.lifecycle.get_machine(name, cluster).await
    }

    /// Create a machine from a downloaded image.
    pub async fn create_machine(
        &self,
        name: &str,
        cluster: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> HvnodeResult<CreatedMachine> {
        let created = self
            .lifecycle
            .create_machine(&self.images, name, cluster, version, cancel)
            .await?;
        info!(
            "Created {} with {} caveat(s)",
            created.machine.qualified_name(),
            created.caveats.len()
        );
        Ok(created)
    }

    pub async fn delete_machine(&self, name: &str, cluster: &str) -> HvnodeResult<()> {
        self.lifecycle.delete_machine(name, cluster).await
    }
}
