//! Hyper-V node machines and node images
//!
//! The [`Driver`] facade combines the [`ImageCache`] with the
//! [`LifecycleController`]; both reach the hypervisor only through the
//! `ManagementBackend` and `RemoteExec` traits from `hvnode-core`.

pub mod commands;
pub mod driver;
mod fsutil;
pub mod image;
pub mod lifecycle;
pub mod machine;
pub mod process;
pub mod script_backend;
pub mod ssh;

pub use commands::{CommandHandler, CommandRegistry, RenameHandler};
pub use driver::{Driver, DriverStatus};
pub use image::{Image, ImageCache, ImageFetcher, ImageIndexStore};
pub use lifecycle::{CreatedMachine, LifecycleController};
pub use machine::{Machine, MachineContext};
pub use process::{CommandExecutor, CommandOutput, SystemCommandExecutor};
pub use script_backend::ScriptBackend;
pub use ssh::SshExec;
