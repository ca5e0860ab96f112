//! Seam to the gateway transport.
//!
//! The CoAP/DTLS session with the hub is owned by whatever implements
//! [`GatewayConnector`]; the rest of the controller only sees commands,
//! responses and raw devices.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::InMemoryGateway;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway at {0} is unreachable")]
    Unreachable(String),
    #[error("gateway rejected identity {0}")]
    Unauthorized(String),
    #[error("device {0} not found on gateway")]
    NotFound(String),
    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
    #[error("failed to call the gateway API: {0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub identity: String,
    pub psk: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListDeviceIds,
    GetDevice(String),
    SetState { device_id: String, on: bool },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListDeviceIds => "list_device_ids",
            Self::GetDevice(_) => "get_device",
            Self::SetState { .. } => "set_state",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    DeviceIds(Vec<String>),
    Device(RawDevice),
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model_number: String,
    #[serde(default)]
    pub firmware_version: String,
}

/// Control block of a device; each entry is one channel of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "channels", rename_all = "lowercase")]
pub enum Control {
    Socket(Vec<bool>),
    Light(Vec<bool>),
    Blind(Vec<u8>),
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub info: DeviceInfo,
    pub control: Control,
}

impl RawDevice {
    pub fn has_socket_control(&self) -> bool {
        matches!(self.control, Control::Socket(_))
    }
}

#[async_trait]
pub trait ApiFactory: Send + Sync {
    async fn request(&self, command: Command) -> Result<Response, GatewayError>;

    async fn shutdown(&self) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ApiFactory>, GatewayError>;

    async fn generate_psk(
        &self,
        host: &str,
        identity: &str,
        security_code: &str,
    ) -> Result<String, GatewayError>;
}
