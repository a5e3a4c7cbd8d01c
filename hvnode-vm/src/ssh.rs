//! In-guest command execution over the system `ssh` client

use crate::process::{CommandExecutor, SystemCommandExecutor};
use async_trait::async_trait;
use hvnode_core::config::RemoteConfig;
use hvnode_core::{HvnodeError, HvnodeResult, RemoteExec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Runs commands as the image's administrative account.
///
/// Password authentication goes through `sshpass`; an identity file is
/// passed to `ssh -i`.
pub struct SshExec {
    config: RemoteConfig,
    executor: Arc<dyn CommandExecutor>,
}

impl SshExec {
    pub fn new(config: RemoteConfig) -> Self {
        Self::with_executor(config, Arc::new(SystemCommandExecutor))
    }

    pub fn with_executor(config: RemoteConfig, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, executor }
    }

    /// Program and arguments for running `command_line` at `address`.
    fn command(&self, address: &str, command_line: &str) -> (PathBuf, Vec<String>) {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => (host, port.to_string()),
            _ => (address, self.config.ssh_port.to_string()),
        };

        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            port,
        ];
        if let Some(identity) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=no".to_string());
        }
        args.push(format!("{}@{}", self.config.admin_user, host));
        args.push(command_line.to_string());

        if let Some(password) = &self.config.admin_password {
            let mut wrapped = vec!["-p".to_string(), password.clone(), "ssh".to_string()];
            wrapped.extend(args);
            (PathBuf::from("sshpass"), wrapped)
        } else {
            (PathBuf::from("ssh"), args)
        }
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn run(&self, address: &str, command_line: &str) -> HvnodeResult<String> {
        let (program, args) = self.command(address, command_line);
        debug!("Running '{}' on {}", command_line, address);

        let output = self
            .executor
            .execute(&program, &args, None)
            .await
            .map_err(|e| HvnodeError::CommandFailed {
                command: command_line.to_string(),
                machine: address.to_string(),
                details: format!("cannot run {}: {}", program.display(), e),
            })?;

        if !output.success() {
            return Err(HvnodeError::CommandFailed {
                command: command_line.to_string(),
                machine: address.to_string(),
                details: format!("exit code {:?}: {}", output.code, output.stderr_lossy()),
            });
        }

        Ok(output.stdout_lossy())
    }
}
