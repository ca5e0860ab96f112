use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Outlet,
    Light,
    Blind,
    Other,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outlet => "Outlet",
            Self::Light => "Light",
            Self::Blind => "Blind",
            Self::Other => "Other",
        }
    }

    /// Whether the device exposes an on/off state the controller can flip.
    pub fn is_switchable(self) -> bool {
        matches!(self, Self::Outlet | Self::Light)
    }
}

impl Default for DeviceType {
    fn default() -> Self {
        Self::Outlet
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device as listed by the gateway, reduced to what the UI shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    #[serde(deserialize_with = "crate::config::deserialize_device_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Waiting,
    Ok,
    NoDevices,
    Error,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatePayload {
    pub state: bool,
}

/// Octopod-style answer keyed by the numeric device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OctopodState {
    pub ip: String,
    #[serde(rename = "currentState")]
    pub current_state: &'static str,
}

impl OctopodState {
    pub fn new(id: &str, on: bool) -> Self {
        Self {
            ip: id.to_string(),
            current_state: if on { "on" } else { "off" },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SidebarInfo {
    #[serde(rename = "shutdownAt")]
    pub shutdown_at: BTreeMap<String, Option<i64>>,
    pub cooldown_wait: BTreeMap<String, Option<bool>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NavbarInfo {
    pub state: BTreeMap<String, DeviceStatePayload>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sidebar,
    Navbar,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sidebar => "sidebar",
            Self::Navbar => "navbar",
        }
    }
}

/// Push notification for UI listeners, the `{type, payload}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: serde_json::Value,
}

impl PluginMessage {
    pub fn new(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.as_str(),
            payload,
        }
    }
}
