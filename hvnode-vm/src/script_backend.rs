//! Management backend driven through a PowerShell interface script
//!
//! Each operation runs
//! `powershell -NoProfile -NonInteractive -File <script> <operation> <args..>`
//! and the script prints a single JSON object
//! `{"Success": bool, "ErrorMessage": string, "Payload": {...}}` on stdout.

use crate::process::{find_on_path, CommandExecutor, SystemCommandExecutor};
use async_trait::async_trait;
use hvnode_core::config::{HvnodeConfig, DEFAULT_POWERSHELL_CANDIDATES, DEFAULT_SCRIPT_NAME};
use hvnode_core::{BackendResult, HvnodeError, HvnodeResult, ManagementBackend};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ScriptBackend {
    powershell: Option<PathBuf>,
    script_path: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl ScriptBackend {
    /// Create a backend running `script_path`.
    ///
    /// With no explicit `powershell`, the interpreter is searched on `PATH`
    /// at call time.
    pub fn new(powershell: Option<PathBuf>, script_path: impl Into<PathBuf>) -> Self {
        Self::with_executor(powershell, script_path, Arc::new(SystemCommandExecutor))
    }

    /// Create a backend with a custom command executor (for testing)
    pub fn with_executor(
        powershell: Option<PathBuf>,
        script_path: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            powershell,
            script_path: script_path.into(),
            executor,
        }
    }

    pub fn from_config(config: &HvnodeConfig) -> Self {
        let script_path = config
            .backend
            .script_path
            .clone()
            .unwrap_or_else(|| config.paths.image_cache_dir.join(DEFAULT_SCRIPT_NAME));
        Self::new(config.backend.powershell_path.clone(), script_path)
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    fn locate_powershell(&self) -> HvnodeResult<PathBuf> {
        if let Some(path) = &self.powershell {
            return Ok(path.clone());
        }
        DEFAULT_POWERSHELL_CANDIDATES
            .iter()
            .find_map(|candidate| find_on_path(candidate))
            .ok_or_else(|| {
                HvnodeError::backend_unavailable(format!(
                    "none of {} found on PATH",
                    DEFAULT_POWERSHELL_CANDIDATES.join(", ")
                ))
            })
    }

    fn parse_output(operation: &str, stdout: &str, stderr: &str) -> HvnodeResult<BackendResult> {
        let trimmed = stdout.trim();
        serde_json::from_str(trimmed).map_err(|e| {
            let mut details = format!("unreadable result ({})", e);
            if !stderr.is_empty() {
                details.push_str(": ");
                details.push_str(stderr);
            }
            HvnodeError::interface(operation, details)
        })
    }
}

#[async_trait]
impl ManagementBackend for ScriptBackend {
    async fn call(&self, operation: &str, args: &[String]) -> HvnodeResult<BackendResult> {
        let powershell = self.locate_powershell()?;
        if !self.script_path.is_file() {
            return Err(HvnodeError::backend_unavailable(format!(
                "interface script {} not found",
                self.script_path.display()
            )));
        }

        let mut command_args = vec![
            "-NoProfile".to_string(),
            "-NonInteractive".to_string(),
            "-File".to_string(),
            self.script_path.display().to_string(),
            operation.to_string(),
        ];
        command_args.extend(args.iter().cloned());

        debug!("Backend call {} {:?}", operation, args);
        let output = self
            .executor
            .execute(&powershell, &command_args, None)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    HvnodeError::backend_unavailable(format!(
                        "cannot run {}: {}",
                        powershell.display(),
                        e
                    ))
                }
                _ => HvnodeError::IoError(e),
            })?;

        let stderr = output.stderr_lossy();
        if !output.success() {
            warn!(
                "Backend call {} exited with {:?}: {}",
                operation, output.code, stderr
            );
        }

        let result = Self::parse_output(operation, &output.stdout_lossy(), &stderr)?;
        debug!("Backend call {} succeeded: {}", operation, result.success);
        Ok(result)
    }
}
