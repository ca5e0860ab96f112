pub mod config;
pub mod events;
pub mod shutdown;
pub mod topics;
pub mod types;

pub use config::{
    BridgeConfig, DeviceSettings, GatewayConfig, MigrationError, MqttConfig, PluginSettings,
    PrinterConfig, RuntimeConfig, TurnOffMode, SETTINGS_VERSION,
};
pub use events::PrintEvent;
pub use shutdown::{CooldownThresholds, StopPlan, TemperatureReading, Temperatures};
pub use topics::TopicRoute;
pub use types::{
    ConnectionStatus, DeviceStatePayload, DeviceSummary, DeviceType, MessageKind, NavbarInfo,
    OctopodState, PluginMessage, SidebarInfo,
};
