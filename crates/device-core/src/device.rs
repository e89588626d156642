//! Device, room and group representations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Device category (what kind of thing it is)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Light,
    Speaker,
    Sensor,
    Media,
    Relay,
    Thermostat,
    Camera,
    Other,
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::Other
    }
}

/// Reachability classification maintained by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Unreachable,
}

impl Default for Health {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Expected type of a command parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
}

impl ParamKind {
    /// Check whether a JSON value is acceptable for this parameter type
    #[must_use]
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

/// Schema for one parameter of a device command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
}

/// A command a device declares it accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    /// Command name (e.g. "turn_on", "set_volume")
    pub command: String,
    /// Parameter schemas for the command
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

/// A device known to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Device category
    #[serde(default)]
    pub kind: DeviceKind,
    /// Room this device belongs to
    #[serde(default)]
    pub room: Option<String>,
    /// Static group memberships
    #[serde(default)]
    pub groups: Vec<String>,
    /// Transport name used to look up the protocol adapter
    pub transport: String,
    /// Commands the device accepts
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Last-known state (attribute -> value)
    #[serde(default)]
    pub state: HashMap<String, Value>,
    /// When the device last answered a probe or command
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Reachability status
    #[serde(default)]
    pub health: Health,
    /// Monotonic sequence bumped on every committed state write
    #[serde(default)]
    pub revision: u64,
    /// Consecutive probe failures since the last success
    #[serde(skip)]
    pub probe_failures: u32,
}

impl Device {
    /// Create a device with empty state
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, transport: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: DeviceKind::default(),
            room: None,
            groups: Vec::new(),
            transport: transport.into(),
            capabilities: Vec::new(),
            state: HashMap::new(),
            last_seen: None,
            health: Health::default(),
            revision: 0,
            probe_failures: 0,
        }
    }

    /// Find the declared capability for a command, if any
    #[must_use]
    pub fn capability(&self, command: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.command == command)
    }

    /// Read a state attribute
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.state.get(name)
    }

    /// Name for logs and replies; falls back to the id
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A room: ordered set of devices plus an automation opt-out flag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    /// Device ids in display order
    #[serde(default)]
    pub devices: Vec<String>,
    /// Rules targeting this room's devices are allowed to run
    #[serde(default = "default_true")]
    pub automation_enabled: bool,
}

/// A device group, possibly spanning rooms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    /// When set, membership is recomputed from the registry by kind
    #[serde(default)]
    pub kind_filter: Option<DeviceKind>,
    /// Static member device ids (declaration order preserved)
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_true() -> bool {
    true
}
