use crate::error::{HvnodeError, HvnodeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle status of a machine as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineStatus {
    Unknown,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl MachineStatus {
    /// Map a backend-reported VM state onto a machine status.
    pub fn from_backend_state(state: &str) -> Self {
        match state {
            "Off" => MachineStatus::Stopped,
            "Running" => MachineStatus::Running,
            _ => MachineStatus::Unknown,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineStatus::Unknown => "Unknown",
            MachineStatus::Creating => "Creating",
            MachineStatus::Starting => "Starting",
            MachineStatus::Running => "Running",
            MachineStatus::Stopping => "Stopping",
            MachineStatus::Stopped => "Stopped",
            MachineStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Whether an image payload is present in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ImageStatus {
    #[default]
    NotDownloaded,
    Downloaded,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::NotDownloaded => f.write_str("NotDownloaded"),
            ImageStatus::Downloaded => f.write_str("Downloaded"),
        }
    }
}

/// In-guest commands the driver knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PredefinedCommand {
    RenameMachine,
}

impl fmt::Display for PredefinedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredefinedCommand::RenameMachine => f.write_str("RenameMachine"),
        }
    }
}

/// Result of one call across the management backend boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BackendResult {
    pub success: bool,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl BackendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Turn a `success == false` result into a `BackendOperation` error.
    pub fn into_success(self, operation: &str) -> HvnodeResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(HvnodeError::backend_operation(operation, self.error_message))
        }
    }

    /// Extract the `Machine` payload entry.
    pub fn machine(&self, operation: &str) -> HvnodeResult<MachineData> {
        let value = self
            .payload
            .get("Machine")
            .ok_or_else(|| HvnodeError::interface(operation, "payload has no Machine entry"))?;
        MachineData::from_value(operation, value)
    }

    /// Extract the `VMList` payload entry.
    ///
    /// A single object is accepted as a one-element list, and `null` as an
    /// empty one, since the interface script serializes collections that way.
    pub fn machine_list(&self, operation: &str) -> HvnodeResult<Vec<MachineData>> {
        match self.payload.get("VMList") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| MachineData::from_value(operation, item))
                .collect(),
            Some(Value::Null) => Ok(Vec::new()),
            Some(item @ Value::Object(_)) => Ok(vec![MachineData::from_value(operation, item)?]),
            Some(_) => Err(HvnodeError::interface(operation, "VMList is not a list")),
            None => Err(HvnodeError::interface(operation, "payload has no VMList entry")),
        }
    }
}

/// Machine description as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineData {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
    #[serde(rename = "State", default)]
    pub state: String,
}

impl MachineData {
    fn from_value(operation: &str, value: &Value) -> HvnodeResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| HvnodeError::interface(operation, "machine entry is not an object"))?;

        let field = |key: &str, required: bool| -> HvnodeResult<String> {
            match object.get(key) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(Value::Null) | None if !required => Ok(String::new()),
                Some(Value::Null) | None => Err(HvnodeError::interface(
                    operation,
                    format!("machine entry has no {}", key),
                )),
                Some(other) => Err(HvnodeError::interface(
                    operation,
                    format!("machine field {} has unexpected value {}", key, other),
                )),
            }
        };

        Ok(Self {
            name: field("Name", true)?,
            ip_address: field("IPAddress", false)?,
            state: field("State", true)?,
        })
    }

    pub fn status(&self) -> MachineStatus {
        MachineStatus::from_backend_state(&self.state)
    }
}

/// Backend-facing machine identifier: `<user>-<cluster>-<machine>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub user: String,
    pub cluster: String,
    pub machine: String,
}

impl QualifiedName {
    pub fn new(
        user: impl Into<String>,
        cluster: impl Into<String>,
        machine: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            cluster: cluster.into(),
            machine: machine.into(),
        }
    }

    /// Split a raw backend name on its first two separators.
    ///
    /// Names with fewer than three fields are treated as bare machine names.
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(3, '-');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(cluster), Some(machine)) => Self::new(user, cluster, machine),
            _ => Self::new("", "", raw),
        }
    }

    /// Split a raw backend name known to belong to `user`.
    ///
    /// User names may contain `-`, cluster names may not, so the user prefix
    /// is stripped first and the rest is split on its first separator.
    /// Returns `None` when `raw` is not one of `user`'s machines.
    pub fn parse_for_user(raw: &str, user: &str) -> Option<Self> {
        let rest = raw.strip_prefix(user)?.strip_prefix('-')?;
        let (cluster, machine) = rest.split_once('-')?;
        if cluster.is_empty() || machine.is_empty() {
            return None;
        }
        Some(Self::new(user, cluster, machine))
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.user, self.cluster, self.machine)
    }
}
