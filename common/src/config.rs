use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::types::{ConnectionStatus, DeviceSummary, DeviceType};

pub const SETTINGS_VERSION: u64 = 5;

const LEGACY_KEYS: [&str; 7] = [
    "selected_outlet",
    "stop_timer",
    "postponeDelay",
    "connection_timer",
    "on_done",
    "on_failed",
    "icon",
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("plugin settings must be a JSON object")]
    NotAnObject,
    #[error("invalid plugin settings: {0}")]
    Invalid(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway_ip: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub psk: String,
}

impl GatewayConfig {
    pub fn is_complete(&self) -> bool {
        !self.gateway_ip.is_empty() && !self.identity.is_empty() && !self.psk.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
    /// OctoPrint MQTT base topic; MQTT stays disabled while unset.
    #[serde(default)]
    pub base_topic: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            user: String::new(),
            pass: String::new(),
            base_topic: Some("octoPrint/".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub octoprint_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub timeout_ms: u64,
    pub cooldown_poll_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            cooldown_poll_ms: 5_000,
        }
    }
}

impl BridgeConfig {
    pub fn sanitize(&mut self) {
        self.timeout_ms = self.timeout_ms.clamp(100, 30_000);
        self.cooldown_poll_ms = self.cooldown_poll_ms.clamp(500, 60_000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOffMode {
    Time,
    Cooldown,
}

impl Default for TurnOffMode {
    fn default() -> Self {
        Self::Time
    }
}

/// Per-device behavior as configured in the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    #[serde(deserialize_with = "deserialize_device_id")]
    pub id: String,
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
    /// Seconds before the printer connection is opened after power on.
    ///
    /// `-1` connects right away; anything lower disables the connect.
    #[serde(default = "default_connection_timer")]
    pub connection_timer: i64,
    #[serde(default = "default_delay")]
    pub stop_timer: u64,
    #[serde(default = "default_delay")]
    pub postpone_delay: u64,
    #[serde(default)]
    pub turn_off_mode: TurnOffMode,
    /// Bed threshold in Celsius, -1 ignores the bed.
    #[serde(default = "default_cooldown_bed")]
    pub cooldown_bed: i32,
    #[serde(default = "default_cooldown_hotend")]
    pub cooldown_hotend: i32,
    #[serde(default)]
    pub on_done: bool,
    #[serde(default)]
    pub on_failed: bool,
    #[serde(default = "default_icon")]
    pub icon: String,
    #[serde(default)]
    pub nav_name: bool,
    #[serde(default = "default_true")]
    pub nav_icon: bool,
}

impl DeviceSettings {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: DeviceType::Outlet,
            connection_timer: default_connection_timer(),
            stop_timer: default_delay(),
            postpone_delay: default_delay(),
            turn_off_mode: TurnOffMode::Time,
            cooldown_bed: default_cooldown_bed(),
            cooldown_hotend: default_cooldown_hotend(),
            on_done: false,
            on_failed: false,
            icon: default_icon(),
            nav_name: false,
            nav_icon: true,
        }
    }

    /// Defaults used when the setup wizard picks the printer outlet.
    pub fn wizard_outlet(id: impl Into<String>) -> Self {
        Self {
            turn_off_mode: TurnOffMode::Cooldown,
            on_done: true,
            ..Self::new(id, "Printer")
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub selected_devices: Vec<DeviceSettings>,
    /// Last device list fetched from the gateway.
    #[serde(default)]
    pub devices: Vec<DeviceSummary>,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub error_message: String,
    #[serde(default = "default_settings_version")]
    pub settings_version: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            selected_devices: Vec::new(),
            devices: Vec::new(),
            status: ConnectionStatus::Waiting,
            error_message: String::new(),
            settings_version: SETTINGS_VERSION,
        }
    }
}

impl PluginSettings {
    pub fn selected_device(&self, id: &str) -> Option<&DeviceSettings> {
        self.selected_devices.iter().find(|device| device.id == id)
    }

    pub fn known_device_type(&self, id: &str) -> Option<DeviceType> {
        self.devices
            .iter()
            .find(|device| device.id == id)
            .map(|device| device.device_type)
    }

    /// Replaces the device with the same id or appends it.
    pub fn upsert_device(&mut self, device: DeviceSettings) {
        match self
            .selected_devices
            .iter_mut()
            .find(|existing| existing.id == device.id)
        {
            Some(existing) => *existing = device,
            None => self.selected_devices.push(device),
        }
    }

    pub fn remove_device(&mut self, id: &str) -> bool {
        let before = self.selected_devices.len();
        self.selected_devices.retain(|device| device.id != id);
        before != self.selected_devices.len()
    }

    /// Brings stored settings of any older version to the current layout.
    ///
    /// Returns the parsed settings and whether anything had to change.
    pub fn migrate(raw: Value) -> Result<(Self, bool), MigrationError> {
        let Value::Object(mut object) = raw else {
            return Err(MigrationError::NotAnObject);
        };
        let mut changed = false;

        let version = object.get("settings_version").and_then(Value::as_u64);
        if version.map_or(true, |version| version < 2) {
            if let Some(outlet) = object.get("selected_outlet").filter(|value| !value.is_null()) {
                let device = json!({
                    "name": "Printer",
                    "id": outlet.clone(),
                    "type": "Outlet",
                    "connection_timer": legacy_or(&object, "connection_timer", json!(5)),
                    "stop_timer": legacy_or(&object, "stop_timer", json!(30)),
                    "postpone_delay": legacy_or(&object, "postponeDelay", json!(30)),
                    "on_done": legacy_or(&object, "on_done", json!(false)),
                    "on_failed": legacy_or(&object, "on_failed", json!(false)),
                    "icon": legacy_or(&object, "icon", json!("plug")),
                    "nav_name": false,
                    "nav_icon": true,
                });
                object.insert("selected_devices".to_string(), Value::Array(vec![device]));
                changed = true;
            }
            for key in LEGACY_KEYS {
                object.remove(key);
            }
        }

        if let Some(Value::Array(devices)) = object.get_mut("selected_devices") {
            for device in devices.iter_mut().filter_map(Value::as_object_mut) {
                changed |= fill_missing(device, "nav_icon", json!(true));
                changed |= fill_missing(device, "nav_name", json!(false));
                changed |= fill_missing(device, "turn_off_mode", json!("time"));
                changed |= fill_missing(device, "cooldown_bed", json!(-1));
                changed |= fill_missing(device, "cooldown_hotend", json!(50));
            }
        }

        if version != Some(SETTINGS_VERSION) {
            object.insert("settings_version".to_string(), json!(SETTINGS_VERSION));
            changed = true;
        }

        let settings = serde_json::from_value(Value::Object(object))?;
        Ok((settings, changed))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub plugin: PluginSettings,
}

/// Gateway ids are numeric on the wire but kept as strings everywhere else.
pub fn deserialize_device_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(i64),
        Text(String),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Number(value) => value.to_string(),
        RawId::Text(value) => value,
    })
}

fn legacy_or(object: &Map<String, Value>, key: &str, default: Value) -> Value {
    match object.get(key) {
        None | Some(Value::Null) | Some(Value::Bool(false)) => default,
        Some(Value::Number(number)) if number.as_f64() == Some(0.0) => default,
        Some(Value::String(text)) if text.is_empty() => default,
        Some(value) => value.clone(),
    }
}

fn fill_missing(device: &mut Map<String, Value>, key: &str, default: Value) -> bool {
    if device.contains_key(key) {
        return false;
    }
    device.insert(key.to_string(), default);
    true
}

fn default_device_name() -> String {
    "Printer".to_string()
}

fn default_connection_timer() -> i64 {
    5
}

fn default_delay() -> u64 {
    30
}

fn default_cooldown_bed() -> i32 {
    -1
}

fn default_cooldown_hotend() -> i32 {
    50
}

fn default_icon() -> String {
    "plug".to_string()
}

fn default_true() -> bool {
    true
}

fn default_settings_version() -> u64 {
    SETTINGS_VERSION
}
