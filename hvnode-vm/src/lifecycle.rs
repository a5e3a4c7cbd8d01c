//! Machine creation and deletion

use crate::fsutil::{blocking, copy_atomically};
use crate::image::ImageCache;
use crate::machine::{Machine, MachineContext};
use hvnode_core::backend::ops;
use hvnode_core::config::{
    validate_machine_name, validate_name_component, PathsConfig, DEFAULT_IMAGE_FILE_EXTENSION,
};
use hvnode_core::patterns::BoundedRetry;
use hvnode_core::{HvnodeError, HvnodeResult, MachineStatus, PredefinedCommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A newly created machine and the non-fatal problems met on the way.
///
/// Caveats are `IpAcquisitionTimeout` or `RenameTimeout` errors, plus any
/// failure of the final stop. The machine exists and can be used or
/// deleted either way.
#[derive(Debug)]
pub struct CreatedMachine {
    pub machine: Machine,
    pub caveats: Vec<HvnodeError>,
}

impl CreatedMachine {
    pub fn has_caveats(&self) -> bool {
        !self.caveats.is_empty()
    }
}

pub struct LifecycleController {
    ctx: Arc<MachineContext>,
    disk_dir: PathBuf,
    machine_dir: PathBuf,
}

impl LifecycleController {
    pub fn new(ctx: Arc<MachineContext>, paths: &PathsConfig) -> Self {
        Self {
            ctx,
            disk_dir: paths.disk_dir.clone(),
            machine_dir: paths.machine_dir.clone(),
        }
    }

    pub fn context(&self) -> &Arc<MachineContext> {
        &self.ctx
    }

    /// Staged disk of a machine.
    pub fn disk_path(&self, qualified: &str) -> PathBuf {
        self.disk_dir
            .join(format!("{}.{}", qualified, DEFAULT_IMAGE_FILE_EXTENSION))
    }

    /// Working directory the backend keeps a machine's files in.
    pub fn machine_path(&self, qualified: &str) -> PathBuf {
        self.machine_dir.join(qualified)
    }

    pub async fn list_machines(&self) -> HvnodeResult<Vec<Machine>> {
        let result = self.ctx.call(ops::LIST_MACHINES, &[]).await?;
        let machines = result
            .machine_list(ops::LIST_MACHINES)?
            .iter()
            .map(|data| Machine::from_data(Arc::clone(&self.ctx), data))
            .collect::<Vec<_>>();
        debug!("Backend reports {} machines", machines.len());
        Ok(machines)
    }

    pub async fn get_machine(&self, name: &str, cluster: &str) -> HvnodeResult<Machine> {
        let mut machine = Machine::new(Arc::clone(&self.ctx), cluster, name);
        machine.reconcile().await?;
        Ok(machine)
    }

    /// Create, boot, rename and stop a new machine from a cached image.
    ///
    /// The image cache is locked only while the disk is staged.
    pub async fn create_machine(
        &self,
        images: &Mutex<ImageCache>,
        name: &str,
        cluster: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> HvnodeResult<CreatedMachine> {
        validate_machine_name(name)?;
        validate_name_component("cluster", cluster)?;
        if cancel.is_cancelled() {
            return Err(HvnodeError::cancelled("create machine"));
        }

        let qualified = self.ctx.qualified_name(cluster, name).to_string();
        let mut machine = Machine::new(Arc::clone(&self.ctx), cluster, name);
        machine.set_intent(MachineStatus::Creating);

        info!("Staging image {} for {}", version, qualified);
        let disk = self.stage(images, version, &qualified).await?;

        if cancel.is_cancelled() {
            self.remove_files(&qualified).await;
            return Err(HvnodeError::cancelled("create machine"));
        }

        info!("Creating machine {}", qualified);
        self.instantiate(name, &qualified, &disk).await?;

        info!("Starting machine {}", qualified);
        if let Err(e) = machine.start().await {
            self.discard(&qualified).await;
            return Err(HvnodeError::provisioning(name, e.to_string()));
        }
        machine
            .wait_for_state_change(self.ctx.lifecycle().state_wait_timeout, cancel)
            .await?;

        let mut caveats = Vec::new();

        if let Err(caveat) = self.acquire_ip(&mut machine, cancel).await? {
            warn!("{}; the node may need to be recreated", caveat);
            caveats.push(caveat);
        }

        if let Err(caveat) = self.rename(&mut machine, cancel).await? {
            warn!("{}; leaving the machine running", caveat);
            caveats.push(caveat);
            return Ok(CreatedMachine { machine, caveats });
        }
        info!("Machine {} renamed", qualified);

        info!("Stopping machine {}", qualified);
        if let Err(e) = self.settle(&mut machine, cancel).await {
            if matches!(e, HvnodeError::Cancelled { .. }) {
                return Err(e);
            }
            warn!("Could not stop machine {}: {}", qualified, e);
            caveats.push(e);
        }
        machine.set_intent(MachineStatus::Stopped);

        info!("Machine {} created", qualified);
        Ok(CreatedMachine { machine, caveats })
    }

    /// Delete a machine and its files.
    ///
    /// A backend failure aborts before any file is touched. Otherwise the
    /// disk and the working directory are both removed even if one of them
    /// fails, and the failures are reported together.
    pub async fn delete_machine(&self, name: &str, cluster: &str) -> HvnodeResult<()> {
        let qualified = self.ctx.qualified_name(cluster, name).to_string();
        info!("Deleting machine {}", qualified);
        self.ctx
            .call(ops::DELETE_MACHINE, &[qualified.clone()])
            .await?;

        let mut failures = Vec::new();

        let disk = self.disk_path(&qualified);
        match tokio::fs::remove_file(&disk).await {
            Ok(()) => debug!("Removed {}", disk.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("disk {}: {}", disk.display(), e)),
        }

        let dir = self.machine_path(&qualified);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => failures.push(format!("directory {}: {}", dir.display(), e)),
        }

        if failures.is_empty() {
            info!("Machine {} deleted", qualified);
            Ok(())
        } else {
            Err(HvnodeError::CleanupFailed {
                resource: qualified,
                failures,
            })
        }
    }

    async fn stage(
        &self,
        images: &Mutex<ImageCache>,
        version: &str,
        qualified: &str,
    ) -> HvnodeResult<PathBuf> {
        let images = images.lock().await;
        if images.get_image(version).is_some_and(|image| image.deprecated()) {
            warn!("Image {} is deprecated", version);
        }
        let source = images.cached_path(version)?;
        let disk = self.disk_path(qualified);
        if disk.exists() {
            return Err(HvnodeError::Staging {
                version: version.to_string(),
                path: disk,
                reason: "a disk for this machine already exists".to_string(),
            });
        }

        let target = disk.clone();
        blocking(move || copy_atomically(&source, &target))
            .await
            .map_err(|e| HvnodeError::Staging {
                version: version.to_string(),
                path: disk.clone(),
                reason: e.to_string(),
            })?;
        debug!("Staged disk {}", disk.display());
        Ok(disk)
    }

    async fn instantiate(&self, name: &str, qualified: &str, disk: &Path) -> HvnodeResult<()> {
        let lifecycle = self.ctx.lifecycle();

        let created = self
            .ctx
            .call(
                ops::NEW_MACHINE,
                &[
                    qualified.to_string(),
                    self.machine_dir.display().to_string(),
                    disk.display().to_string(),
                ],
            )
            .await;
        if let Err(e) = created {
            self.remove_files(qualified).await;
            return Err(HvnodeError::provisioning(name, e.to_string()));
        }

        let configured = self
            .ctx
            .call(
                ops::CONFIGURE_MACHINE,
                &[
                    qualified.to_string(),
                    lifecycle.memory_bytes.to_string(),
                    lifecycle.processor_count.to_string(),
                    lifecycle.checkpoint_type.clone(),
                ],
            )
            .await;
        if let Err(e) = configured {
            self.discard(qualified).await;
            return Err(HvnodeError::provisioning(name, e.to_string()));
        }

        Ok(())
    }

    /// Best-effort removal of a registered but unusable machine.
    async fn discard(&self, qualified: &str) {
        if let Err(e) = self
            .ctx
            .call(ops::DELETE_MACHINE, &[qualified.to_string()])
            .await
        {
            warn!(
                "Could not remove half-created machine {}: {}; delete it by hand",
                qualified, e
            );
        }
        self.remove_files(qualified).await;
    }

    /// Poll for the DHCP-assigned address. The outer error is fatal
    /// (cancellation); the inner one is a caveat.
    async fn acquire_ip(
        &self,
        machine: &mut Machine,
        cancel: &CancellationToken,
    ) -> HvnodeResult<Result<(), HvnodeError>> {
        if !machine.known_ip_address().is_empty() {
            info!("Obtained IP address {}", machine.known_ip_address());
            return Ok(Ok(()));
        }

        let config = self.ctx.lifecycle().ip_retry();
        let mut retry = BoundedRetry::new(&config, self.ctx.clock(), cancel);
        while retry.next_attempt().await? {
            info!(
                "Fetching IP address (attempt {}/{})",
                retry.attempt(),
                retry.max_attempts()
            );
            if let Err(e) = machine.reconcile().await {
                debug!("Reconcile of {} failed: {}", machine.name(), e);
            }
            if !machine.known_ip_address().is_empty() {
                info!("Obtained IP address {}", machine.known_ip_address());
                return Ok(Ok(()));
            }
        }

        Ok(Err(HvnodeError::IpAcquisitionTimeout {
            machine: machine.name().to_string(),
            attempts: retry.attempt(),
        }))
    }

    /// Set the guest hostname to the machine name. The outer error is fatal
    /// (cancellation); the inner one is a caveat.
    async fn rename(
        &self,
        machine: &mut Machine,
        cancel: &CancellationToken,
    ) -> HvnodeResult<Result<(), HvnodeError>> {
        let config = self.ctx.lifecycle().rename_retry();
        let mut retry = BoundedRetry::new(&config, self.ctx.clock(), cancel);
        let params = [machine.name().to_string()];

        let first = retry.next_attempt().await?;
        debug_assert!(first, "rename needs at least one attempt");

        let last_error = loop {
            info!(
                "Renaming host (attempt {}/{})",
                retry.attempt(),
                retry.max_attempts()
            );
            match machine
                .execute_command(PredefinedCommand::RenameMachine, &params)
                .await
            {
                Ok(()) => return Ok(Ok(())),
                Err(e) => {
                    warn!("Rename of {} failed: {}", machine.name(), e);
                    if !e.is_retryable() || !retry.next_attempt().await? {
                        break e;
                    }
                }
            }
        };

        Ok(Err(HvnodeError::RenameTimeout {
            machine: machine.name().to_string(),
            attempts: retry.attempt(),
            last_error: Box::new(last_error),
        }))
    }

    async fn settle(&self, machine: &mut Machine, cancel: &CancellationToken) -> HvnodeResult<()> {
        machine.stop().await?;
        if self.ctx.lifecycle().await_stop_confirmation {
            let confirmed = machine
                .wait_for_state_change(self.ctx.lifecycle().state_wait_timeout, cancel)
                .await?;
            if !confirmed {
                debug!("Stop of {} not confirmed yet", machine.name());
            }
        }
        Ok(())
    }

    /// Best-effort removal of a machine's disk and working directory.
    async fn remove_files(&self, qualified: &str) {
        let disk = self.disk_path(qualified);
        if let Err(e) = tokio::fs::remove_file(&disk).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", disk.display(), e);
            }
        }
        let dir = self.machine_path(qualified);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove {}: {}", dir.display(), e);
            }
        }
    }
}
