use async_trait::async_trait;

use crate::error::HvnodeResult;
use crate::types::BackendResult;

/// Operation names understood by the management interface.
pub mod ops {
    pub const CHECK_DRIVER: &str = "checkdriver";
    pub const LIST_MACHINES: &str = "listmachines";
    pub const GET_MACHINE: &str = "getmachine";
    pub const NEW_MACHINE: &str = "newmachine";
    pub const CONFIGURE_MACHINE: &str = "configuremachine";
    pub const DELETE_MACHINE: &str = "deletemachine";
    pub const START_MACHINE: &str = "startmachine";
    pub const STOP_MACHINE: &str = "stopmachine";
    pub const FORCE_STOP_MACHINE: &str = "forcestopmachine";
    pub const WAIT_MACHINE: &str = "waitmachine";
}

/// Abstract interface to the hypervisor management process.
///
/// Every VM-level operation the driver performs goes through this trait as a
/// named operation with ordered string arguments. The call is treated as a
/// reliable but slow RPC:
///
/// - An `Err` means the call itself could not be made or its output could
///   not be understood (process not found, malformed response).
/// - An `Ok` with `success == false` means the backend ran the operation and
///   reported a failure in `error_message`.
///
/// Implementations must be `Send + Sync`; the driver shares one instance
/// across all machines.
#[async_trait]
pub trait ManagementBackend: Send + Sync {
    async fn call(&self, operation: &str, args: &[String]) -> HvnodeResult<BackendResult>;
}

/// Runs a shell command line inside a guest.
///
/// Used only for predefined in-guest commands; the implementation decides
/// how to authenticate (the driver uses a fixed administrative account).
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command_line` on the guest reachable at `address` (`host:port`)
    /// and return its captured output.
    async fn run(&self, address: &str, command_line: &str) -> HvnodeResult<String>;
}
