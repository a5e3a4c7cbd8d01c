pub mod backend;
pub mod config;
pub mod error;
pub mod patterns;
pub mod types;

pub use backend::{ManagementBackend, RemoteExec};
pub use error::{HvnodeError, HvnodeResult};
pub use types::{
    BackendResult, ImageStatus, MachineData, MachineStatus, PredefinedCommand, QualifiedName,
};
