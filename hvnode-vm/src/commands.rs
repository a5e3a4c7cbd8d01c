//! Predefined in-guest commands

use async_trait::async_trait;
use hvnode_core::config::{validate_machine_name, RemoteConfig};
use hvnode_core::{HvnodeError, HvnodeResult, PredefinedCommand, RemoteExec};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A command that can run inside a guest.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Number of parameters the command takes.
    fn arity(&self) -> usize;

    async fn run(
        &self,
        remote: &dyn RemoteExec,
        address: &str,
        params: &[String],
    ) -> HvnodeResult<()>;
}

/// Sets the guest hostname with the install script shipped in node images.
pub struct RenameHandler {
    script: String,
}

impl RenameHandler {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    fn command_line(&self, new_name: &str) -> String {
        format!("/usr/bin/sudo {} {}", self.script, new_name)
    }
}

#[async_trait]
impl CommandHandler for RenameHandler {
    fn arity(&self) -> usize {
        1
    }

    async fn run(
        &self,
        remote: &dyn RemoteExec,
        address: &str,
        params: &[String],
    ) -> HvnodeResult<()> {
        let new_name = &params[0];
        validate_machine_name(new_name)?;
        remote.run(address, &self.command_line(new_name)).await?;
        Ok(())
    }
}

/// Table of the commands a machine implements.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<PredefinedCommand, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in command.
    pub fn with_builtins(remote: &RemoteConfig) -> Self {
        let mut handlers: HashMap<PredefinedCommand, Arc<dyn CommandHandler>> = HashMap::new();
        handlers.insert(
            PredefinedCommand::RenameMachine,
            Arc::new(RenameHandler::new(remote.rename_script())),
        );
        Self { handlers }
    }

    /// Add a handler; each command may be registered once.
    pub fn register(
        &mut self,
        command: PredefinedCommand,
        handler: Arc<dyn CommandHandler>,
    ) -> HvnodeResult<()> {
        if self.handlers.contains_key(&command) {
            return Err(HvnodeError::InvalidInput {
                field: "command".to_string(),
                message: format!("{} is already registered", command),
            });
        }
        self.handlers.insert(command, handler);
        Ok(())
    }

    pub fn implements(&self, command: PredefinedCommand) -> bool {
        self.handlers.contains_key(&command)
    }

    /// Run `command` on the guest at `address`.
    pub async fn execute(
        &self,
        command: PredefinedCommand,
        remote: &dyn RemoteExec,
        address: &str,
        params: &[String],
    ) -> HvnodeResult<()> {
        let handler = self
            .handlers
            .get(&command)
            .ok_or_else(|| HvnodeError::CommandNotImplemented {
                command: command.to_string(),
            })?;

        if params.len() != handler.arity() {
            return Err(HvnodeError::InvalidInput {
                field: "params".to_string(),
                message: format!(
                    "{} takes {} parameter(s), got {}",
                    command,
                    handler.arity(),
                    params.len()
                ),
            });
        }

        info!("Running {} on {}", command, address);
        handler.run(remote, address, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockRemote {
        runs: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RemoteExec for MockRemote {
        async fn run(&self, address: &str, command_line: &str) -> HvnodeResult<String> {
            self.runs
                .lock()
                .unwrap()
                .push((address.to_string(), command_line.to_string()));
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_rename_command_line() {
        let registry = CommandRegistry::with_builtins(&RemoteConfig::default());
        let remote = MockRemote::default();

        registry
            .execute(
                PredefinedCommand::RenameMachine,
                &remote,
                "10.0.0.5:22",
                &["worker1".to_string()],
            )
            .await
            .unwrap();

        let runs = remote.runs.lock().unwrap();
        assert_eq!(
            runs[0],
            (
                "10.0.0.5:22".to_string(),
                "/usr/bin/sudo /home/kuttiadmin/kutti-installscripts/set-hostname.sh worker1"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_wrong_arity_rejected_before_running() {
        let registry = CommandRegistry::with_builtins(&RemoteConfig::default());
        let remote = MockRemote::default();

        let result = registry
            .execute(PredefinedCommand::RenameMachine, &remote, "10.0.0.5:22", &[])
            .await;
        assert!(matches!(result, Err(HvnodeError::InvalidInput { .. })));
        assert!(remote.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_command() {
        let registry = CommandRegistry::new();
        assert!(!registry.implements(PredefinedCommand::RenameMachine));
        let result = registry
            .execute(
                PredefinedCommand::RenameMachine,
                &MockRemote::default(),
                "10.0.0.5:22",
                &["x".to_string()],
            )
            .await;
        assert!(matches!(
            result,
            Err(HvnodeError::CommandNotImplemented { .. })
        ));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = CommandRegistry::with_builtins(&RemoteConfig::default());
        let result = registry.register(
            PredefinedCommand::RenameMachine,
            Arc::new(RenameHandler::new("/bin/other")),
        );
        assert!(result.is_err());
    }
}
