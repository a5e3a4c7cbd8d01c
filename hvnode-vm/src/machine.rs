//! Machine handles and their state machine
//!
//! A [`Machine`] is a local view of one backend VM. Commands that the backend
//! accepts set a pending *intended* status (`Starting`, `Stopping`); the
//! *observed* status only changes when the machine is reconciled against the
//! backend, so a caller can tell "asked to start" from "seen running".

use crate::commands::CommandRegistry;
use hvnode_core::backend::ops;
use hvnode_core::config::{HvnodeConfig, LifecycleConfig};
use hvnode_core::patterns::{Clock, TokioClock};
use hvnode_core::{
    BackendResult, HvnodeError, HvnodeResult, MachineData, MachineStatus, ManagementBackend,
    PredefinedCommand, QualifiedName, RemoteExec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// State shared by every machine of a driver.
pub struct MachineContext {
    backend: Arc<dyn ManagementBackend>,
    remote: Arc<dyn RemoteExec>,
    commands: CommandRegistry,
    clock: Arc<dyn Clock>,
    user: String,
    lifecycle: LifecycleConfig,
    ssh_port: u16,
}

impl MachineContext {
    pub fn from_config(
        backend: Arc<dyn ManagementBackend>,
        remote: Arc<dyn RemoteExec>,
        config: &HvnodeConfig,
    ) -> HvnodeResult<Self> {
        Ok(Self {
            backend,
            remote,
            commands: CommandRegistry::with_builtins(&config.remote),
            clock: Arc::new(TokioClock),
            user: config.current_user()?,
            lifecycle: config.lifecycle.clone(),
            ssh_port: config.remote.ssh_port,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_commands(mut self, commands: CommandRegistry) -> Self {
        self.commands = commands;
        self
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn qualified_name(&self, cluster: &str, machine: &str) -> QualifiedName {
        QualifiedName::new(self.user.as_str(), cluster, machine)
    }

    /// Call the backend, turning a reported failure into an error.
    pub async fn call(&self, operation: &str, args: &[String]) -> HvnodeResult<BackendResult> {
        debug!("Backend {} {:?}", operation, args);
        self.backend
            .call(operation, args)
            .await?
            .into_success(operation)
    }
}

#[derive(Clone)]
pub struct Machine {
    ctx: Arc<MachineContext>,
    name: String,
    cluster_name: String,
    observed: MachineStatus,
    intended: Option<MachineStatus>,
    ip_address: String,
    error_message: String,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("cluster_name", &self.cluster_name)
            .field("observed", &self.observed)
            .field("intended", &self.intended)
            .field("ip_address", &self.ip_address)
            .field("error_message", &self.error_message)
            .finish()
    }
}

impl Machine {
    pub(crate) fn new(ctx: Arc<MachineContext>, cluster_name: &str, name: &str) -> Self {
        Self {
            ctx,
            name: name.to_string(),
            cluster_name: cluster_name.to_string(),
            observed: MachineStatus::Unknown,
            intended: None,
            ip_address: String::new(),
            error_message: String::new(),
        }
    }

    pub(crate) fn from_data(ctx: Arc<MachineContext>, data: &MachineData) -> Self {
        let mut machine = Self::new(ctx, "", "");
        machine.apply(data);
        machine
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Backend name of this machine for the current user.
    pub fn qualified_name(&self) -> String {
        self.ctx
            .qualified_name(&self.cluster_name, &self.name)
            .to_string()
    }

    /// The pending intent if there is one, otherwise the last observed status.
    pub fn status(&self) -> MachineStatus {
        self.intended.unwrap_or(self.observed)
    }

    pub fn observed_status(&self) -> MachineStatus {
        self.observed
    }

    pub fn intended_status(&self) -> Option<MachineStatus> {
        self.intended
    }

    /// Message of the last failed operation; meaningful when the status is `Error`.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Last known IP address, empty if none has been seen.
    pub fn known_ip_address(&self) -> &str {
        &self.ip_address
    }

    /// `<ip>:<ssh port>` once an IP address is known, empty otherwise.
    pub fn ssh_address(&self) -> String {
        if self.ip_address.is_empty() {
            String::new()
        } else {
            format!("{}:{}", self.ip_address, self.ctx.ssh_port)
        }
    }

    /// The machine's IP address, asking the backend once if none is known yet.
    pub async fn ip_address(&mut self) -> HvnodeResult<String> {
        if self.ip_address.is_empty() {
            self.reconcile().await?;
        }
        Ok(self.ip_address.clone())
    }

    pub(crate) fn set_intent(&mut self, status: MachineStatus) {
        self.intended = Some(status);
    }

    /// Overwrite local state with a backend report.
    ///
    /// An empty IP in the report keeps the previously known address. Name
    /// and cluster are taken from the report only when it names one of the
    /// current user's machines, or when this record has no name yet.
    pub(crate) fn apply(&mut self, data: &MachineData) {
        match QualifiedName::parse_for_user(&data.name, &self.ctx.user) {
            Some(parsed) => {
                self.name = parsed.machine;
                self.cluster_name = parsed.cluster;
            }
            None if self.name.is_empty() => {
                let parsed = QualifiedName::parse(&data.name);
                self.name = parsed.machine;
                self.cluster_name = parsed.cluster;
            }
            None => debug!(
                "Backend reported {} for {}; keeping the local name",
                data.name,
                self.qualified_name()
            ),
        }
        self.observed = data.status();
        self.intended = None;
        if !data.ip_address.is_empty() {
            self.ip_address = data.ip_address.clone();
        }
    }

    fn fail(&mut self, error: HvnodeError) -> HvnodeError {
        warn!("Machine {} failed: {}", self.name, error);
        self.observed = MachineStatus::Error;
        self.intended = None;
        self.error_message = error.to_string();
        error
    }

    async fn command(&mut self, operation: &str) -> HvnodeResult<BackendResult> {
        let qualified = self.qualified_name();
        match self.ctx.call(operation, &[qualified]).await {
            Ok(result) => Ok(result),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Refresh local state from the backend.
    pub async fn reconcile(&mut self) -> HvnodeResult<()> {
        let result = self.command(ops::GET_MACHINE).await?;
        let data = result
            .machine(ops::GET_MACHINE)
            .map_err(|e| self.fail(e))?;
        self.apply(&data);
        Ok(())
    }

    /// Ask the backend to start the machine. The status becomes `Starting`;
    /// see [`Machine::wait_for_state_change`].
    pub async fn start(&mut self) -> HvnodeResult<()> {
        self.command(ops::START_MACHINE).await?;
        info!("Starting machine {}", self.name);
        self.set_intent(MachineStatus::Starting);
        Ok(())
    }

    /// Ask the backend for an orderly shutdown. The status becomes `Stopping`.
    pub async fn stop(&mut self) -> HvnodeResult<()> {
        self.command(ops::STOP_MACHINE).await?;
        info!("Stopping machine {}", self.name);
        self.set_intent(MachineStatus::Stopping);
        Ok(())
    }

    /// Turn the machine off immediately.
    pub async fn force_stop(&mut self) -> HvnodeResult<()> {
        self.command(ops::FORCE_STOP_MACHINE).await?;
        info!("Forced machine {} off", self.name);
        self.observed = MachineStatus::Stopped;
        self.intended = None;
        Ok(())
    }

    /// Let the backend wait up to `timeout` for the pending transition.
    ///
    /// Returns `Ok(true)` and reconciles when the backend reports the new
    /// state. A backend failure or a wait exceeding `timeout` plus the
    /// configured grace leaves the state untouched and returns `Ok(false)`.
    pub async fn wait_for_state_change(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HvnodeResult<bool> {
        let args = [
            self.qualified_name(),
            self.status().to_string(),
            timeout.as_secs().max(1).to_string(),
        ];
        let limit = timeout + self.ctx.lifecycle.state_wait_grace;

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(HvnodeError::cancelled(ops::WAIT_MACHINE)),
            outcome = tokio::time::timeout(limit, self.ctx.call(ops::WAIT_MACHINE, &args)) => outcome,
        };

        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                debug!("Wait for machine {} ended without a change: {}", self.name, e);
                return Ok(false);
            }
            Err(_) => {
                warn!("Wait for machine {} exceeded {:?}", self.name, limit);
                return Ok(false);
            }
        };

        match result.machine(ops::WAIT_MACHINE) {
            Ok(data) => {
                self.apply(&data);
                debug!("Machine {} is now {}", self.name, self.observed);
                Ok(true)
            }
            Err(e) => {
                debug!("Wait for machine {} returned no state: {}", self.name, e);
                Ok(false)
            }
        }
    }

    pub fn implements_command(&self, command: PredefinedCommand) -> bool {
        self.ctx.commands.implements(command)
    }

    /// Run a predefined command inside the guest.
    pub async fn execute_command(
        &mut self,
        command: PredefinedCommand,
        params: &[String],
    ) -> HvnodeResult<()> {
        if !self.implements_command(command) {
            return Err(HvnodeError::CommandNotImplemented {
                command: command.to_string(),
            });
        }

        self.ip_address().await?;
        let address = self.ssh_address();
        if address.is_empty() {
            return Err(HvnodeError::CommandFailed {
                command: command.to_string(),
                machine: self.name.clone(),
                details: "machine has no IP address".to_string(),
            });
        }

        let ctx = Arc::clone(&self.ctx);
        ctx.commands
            .execute(command, ctx.remote.as_ref(), &address, params)
            .await
    }
}
