//! The power controller: device switching, print reactions and shutdown planning.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use tradfri_common::{
    config::deserialize_device_id,
    topics::{self, TopicRoute},
    BridgeConfig, ConnectionStatus, DeviceSettings, DeviceStatePayload, DeviceSummary,
    MessageKind, MqttConfig, NavbarInfo, OctopodState, PluginMessage, PrintEvent, PrinterConfig,
    RuntimeConfig, SidebarInfo, StopPlan, TemperatureReading, Temperatures,
};

use crate::{
    client::{ClientError, TradfriClient},
    device::{DeviceError, TradfriDevice},
    gateway::{Credentials, GatewayConnector},
    printer::{BusyReason, PrinterLink, PrinterMonitor, PrinterStatus},
    scheduler::{ShutdownHandler, ShutdownScheduler},
    store::{AppStore, StoreError},
};

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("gateway connection is not configured")]
    NotConfigured,
    #[error("missing device")]
    MissingDevice,
    #[error("device {0} is not configured")]
    UnknownDevice(String),
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gateway task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOffOutcome {
    SwitchedOff,
    Refused(BusyReason),
}

/// Outbound traffic for UI listeners and the MQTT bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Message(PluginMessage),
    DeviceState { id: String, state: DeviceStatePayload },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ApiCommand {
    TurnOn(ApiTarget),
    TurnOff(ApiTarget),
    CheckStatus(ApiTarget),
}

/// Either full device settings or an Octopod-style numeric id.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiTarget {
    #[serde(default)]
    pub dev: Option<DeviceSettings>,
    #[serde(default)]
    pub ip: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ApiReply {
    Done,
    State(DeviceStatePayload),
    Octopod(OctopodState),
}

#[derive(Debug, Deserialize)]
struct DeviceRef {
    #[serde(deserialize_with = "deserialize_device_id")]
    id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    #[serde(rename = "gatewayIp", default)]
    pub gateway_ip: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub psk: Option<String>,
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub printer: Option<PrinterConfig>,
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

#[derive(Debug, Serialize)]
pub struct SettingsView {
    #[serde(rename = "gatewayIp")]
    gateway_ip: String,
    identity: String,
    #[serde(rename = "pskSet")]
    psk_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
    #[serde(rename = "baseTopic")]
    base_topic: Option<String>,
    #[serde(rename = "octoprintUrl")]
    octoprint_url: Option<String>,
    #[serde(rename = "apiKeySet")]
    api_key_set: bool,
    bridge: BridgeConfig,
}

impl From<&RuntimeConfig> for SettingsView {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            gateway_ip: config.gateway.gateway_ip.clone(),
            identity: config.gateway.identity.clone(),
            psk_set: !config.gateway.psk.is_empty(),
            mqtt_host: config.mqtt.host.clone(),
            mqtt_port: config.mqtt.port,
            mqtt_user: config.mqtt.user.clone(),
            mqtt_pass_set: !config.mqtt.pass.is_empty(),
            base_topic: config.mqtt.base_topic.clone(),
            octoprint_url: config.printer.octoprint_url.clone(),
            api_key_set: !config.printer.api_key.is_empty(),
            bridge: config.bridge.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SettingsUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub settings: SettingsView,
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub status: ConnectionStatus,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    #[serde(rename = "wizardRequired")]
    pub wizard_required: bool,
    pub devices: Vec<DeviceSummary>,
    pub printer: PrinterStatus,
}

pub struct PowerController {
    config: RwLock<RuntimeConfig>,
    store: AppStore,
    connector: Arc<dyn GatewayConnector>,
    client: Mutex<Option<TradfriClient>>,
    scheduler: ShutdownScheduler,
    printer: PrinterMonitor,
    link: Arc<dyn PrinterLink>,
    notifications: broadcast::Sender<Notification>,
}

impl PowerController {
    pub fn new(
        config: RuntimeConfig,
        store: AppStore,
        connector: Arc<dyn GatewayConnector>,
        link: Arc<dyn PrinterLink>,
    ) -> Arc<Self> {
        let scheduler =
            ShutdownScheduler::new(Duration::from_millis(config.bridge.cooldown_poll_ms));
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Arc::new(Self {
            config: RwLock::new(config),
            store,
            connector,
            client: Mutex::new(None),
            scheduler,
            printer: PrinterMonitor::new(),
            link,
            notifications,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn printer(&self) -> &PrinterMonitor {
        &self.printer
    }

    pub fn scheduler(&self) -> &ShutdownScheduler {
        &self.scheduler
    }

    pub(crate) fn connector(&self) -> Arc<dyn GatewayConnector> {
        self.connector.clone()
    }

    pub async fn config(&self) -> RuntimeConfig {
        self.config.read().await.clone()
    }

    pub async fn selected_devices(&self) -> Vec<DeviceSettings> {
        self.config.read().await.plugin.selected_devices.clone()
    }

    pub async fn device(&self, device_id: &str) -> Option<DeviceSettings> {
        self.config
            .read()
            .await
            .plugin
            .selected_device(device_id)
            .cloned()
    }

    /// Current client, created on first use from the stored credentials.
    pub async fn client(&self) -> Result<TradfriClient, ControllerError> {
        if let Some(client) = self.current_client() {
            return Ok(client);
        }

        let (gateway, bridge) = {
            let config = self.config.read().await;
            (config.gateway.clone(), config.bridge.clone())
        };
        if !gateway.is_complete() {
            return Err(ControllerError::NotConfigured);
        }

        let mut slot = self.lock_client();
        if let Some(client) = slot.as_ref().filter(|client| !client.is_shut_down()) {
            return Ok(client.clone());
        }
        let client = TradfriClient::new(
            Credentials {
                host: gateway.gateway_ip,
                identity: gateway.identity,
                psk: gateway.psk,
            },
            self.connector.clone(),
            Duration::from_millis(bridge.timeout_ms),
        );
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Shuts the current client down; the next call builds a fresh one.
    pub(crate) async fn reset_client(&self) {
        let previous = self.lock_client().take();
        if let Some(client) = previous {
            if let Err(err) = tokio::task::spawn_blocking(move || client.shutdown()).await {
                warn!("client shutdown task failed: {err}");
            }
        }
    }

    pub async fn load_devices(&self) -> Result<Vec<DeviceSummary>, ControllerError> {
        let result = self
            .with_client(|client| {
                Ok(client
                    .list_devices()?
                    .iter()
                    .map(TradfriDevice::summary)
                    .collect::<Vec<_>>())
            })
            .await;

        let devices = result.as_ref().ok().cloned();
        let message = match &result {
            Err(ControllerError::NotConfigured) | Ok(_) => None,
            Err(err) => Some(err.to_string()),
        };
        self.update_config(move |config| match (devices, message) {
            (Some(devices), _) => {
                config.plugin.status = if devices.is_empty() {
                    ConnectionStatus::NoDevices
                } else {
                    ConnectionStatus::Ok
                };
                config.plugin.devices = devices;
                config.plugin.error_message.clear();
            }
            (None, Some(message)) => {
                config.plugin.status = ConnectionStatus::Error;
                config.plugin.error_message = message;
            }
            (None, None) => config.plugin.status = ConnectionStatus::Waiting,
        })
        .await?;

        if let Ok(devices) = &result {
            info!("loaded {} devices from gateway", devices.len());
        }
        result
    }

    pub async fn turn_on(&self, device: &DeviceSettings) -> Result<(), ControllerError> {
        info!("turning on {} ({})", device.name, device.id);
        self.switch(&device.id, true).await?;

        if device.connection_timer >= -1 {
            let link = self.link.clone();
            let delay = Duration::from_secs(device.connection_timer.max(0).unsigned_abs());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(err) = link.connect().await {
                    warn!("printer connect failed: {err}");
                }
            });
        }

        self.notify_sidebar().await;
        self.notify_navbar().await;
        Ok(())
    }

    pub async fn turn_off(&self, device: &DeviceSettings) -> Result<TurnOffOutcome, ControllerError> {
        self.scheduler.cancel(&device.id);
        self.notify_sidebar().await;

        if let Some(reason) = self.printer.busy_reason().await {
            warn!("not turning off {}: {reason}", device.name);
            return Ok(TurnOffOutcome::Refused(reason));
        }

        info!("turning off {} ({})", device.name, device.id);
        if let Err(err) = self.link.disconnect().await {
            warn!("printer disconnect failed: {err}");
        }
        self.switch(&device.id, false).await?;
        self.notify_navbar().await;
        Ok(TurnOffOutcome::SwitchedOff)
    }

    pub async fn plan_stop(self: &Arc<Self>, device: &DeviceSettings, force_postpone: bool) -> StopPlan {
        let handler: Arc<dyn ShutdownHandler> = self.clone();
        let plan = self.scheduler.plan_stop(handler, device, force_postpone);
        debug!("planned stop of {}: {plan:?}", device.name);
        self.notify_sidebar().await;
        plan
    }

    pub async fn cancel_shutdown(&self, device_id: &str) -> SidebarInfo {
        if self.scheduler.cancel(device_id) {
            info!("cancelled shutdown of {device_id}");
        }
        self.notify_sidebar().await;
        self.sidebar_info().await
    }

    pub async fn shutdown_now(&self, device: &DeviceSettings) -> Result<TurnOffOutcome, ControllerError> {
        self.turn_off(device).await
    }

    pub async fn on_event(self: &Arc<Self>, event: &PrintEvent) {
        debug!("print event {event}");
        self.printer.apply_event(event).await;

        for device in self.selected_devices().await {
            let stop = match event {
                PrintEvent::PrintDone => device.on_done,
                PrintEvent::PrintFailed => device.on_failed,
                _ => false,
            };
            if stop {
                self.plan_stop(&device, false).await;
            } else if *event == PrintEvent::PrintStarted && self.scheduler.cancel(&device.id) {
                info!("print started, cancelled shutdown of {}", device.name);
                self.notify_sidebar().await;
            }
        }
    }

    /// Handles a message on one of the subscribed topics; others are ignored.
    pub async fn on_mqtt_message(self: &Arc<Self>, topic: &str, payload: &str) -> Result<(), ControllerError> {
        let Some(base) = self.config.read().await.mqtt.base_topic.clone() else {
            return Ok(());
        };
        let Some(route) = topics::route(&base, topic) else {
            return Ok(());
        };
        debug!("mqtt {topic}: {payload}");

        match route {
            TopicRoute::TurnOn => {
                let device = self.referenced_device(payload).await?;
                self.turn_on(&device).await?;
            }
            TopicRoute::TurnOff => {
                let device = self.referenced_device(payload).await?;
                self.turn_off(&device).await?;
            }
            TopicRoute::State => {
                self.state_data().await;
            }
            TopicRoute::Event(name) => self.on_event(&PrintEvent::parse(name)).await,
            TopicRoute::Temperature(tool) => {
                let reading: TemperatureReading = serde_json::from_str(payload)?;
                self.printer.update_temperature(tool, reading).await;
            }
        }
        Ok(())
    }

    /// Reads every selected device and publishes each state.
    pub async fn state_data(&self) -> BTreeMap<String, DeviceStatePayload> {
        let mut states = BTreeMap::new();
        for device in self.selected_devices().await {
            match self.state_by_id(&device.id).await {
                Ok(state) => {
                    self.publish(Notification::DeviceState {
                        id: device.id.clone(),
                        state,
                    });
                    states.insert(device.id, state);
                }
                Err(err) => warn!("could not read state of {}: {err}", device.name),
            }
        }
        states
    }

    pub async fn state_by_id(&self, device_id: &str) -> Result<DeviceStatePayload, ControllerError> {
        let id = device_id.to_string();
        self.with_client(move |client| {
            let device = client.get_by_id(&id)?;
            Ok(DeviceStatePayload {
                state: device.state()?,
            })
        })
        .await
    }

    pub async fn navbar_info(&self) -> NavbarInfo {
        NavbarInfo {
            state: self.state_data().await,
        }
    }

    pub async fn sidebar_info(&self) -> SidebarInfo {
        self.scheduler.sidebar_info(&self.selected_devices().await)
    }

    pub async fn status(&self) -> StatusView {
        let config = self.config.read().await;
        StatusView {
            status: config.plugin.status,
            error_message: config.plugin.error_message.clone(),
            wizard_required: crate::wizard::is_wizard_required(&config),
            devices: config.plugin.devices.clone(),
            printer: self.printer.snapshot().await,
        }
    }

    /// Stores the device, taking its type from the gateway's device list when known.
    pub async fn save_device(&self, mut device: DeviceSettings) -> Result<Vec<DeviceSettings>, ControllerError> {
        info!("saving device {} ({})", device.name, device.id);
        self.update_config(move |config| {
            if let Some(device_type) = config.plugin.known_device_type(&device.id) {
                device.device_type = device_type;
            }
            config.plugin.upsert_device(device);
            config.plugin.selected_devices.clone()
        })
        .await
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<Vec<DeviceSettings>, ControllerError> {
        self.scheduler.cancel(device_id);
        let id = device_id.to_string();
        let devices = self
            .update_config(move |config| {
                if config.plugin.remove_device(&id) {
                    info!("removed device {id}");
                }
                config.plugin.selected_devices.clone()
            })
            .await?;
        self.notify_sidebar().await;
        Ok(devices)
    }

    pub async fn api_command(&self, command: ApiCommand) -> Result<ApiReply, ControllerError> {
        let (target, switch_to) = match command {
            ApiCommand::TurnOn(target) => (target, Some(true)),
            ApiCommand::TurnOff(target) => (target, Some(false)),
            ApiCommand::CheckStatus(target) => (target, None),
        };

        if let Some(device) = target.dev {
            return match switch_to {
                Some(true) => self.turn_on(&device).await.map(|_| ApiReply::Done),
                Some(false) => self.turn_off(&device).await.map(|_| ApiReply::Done),
                None => self.state_by_id(&device.id).await.map(ApiReply::State),
            };
        }

        let Some(id) = target.ip.as_ref().and_then(octopod_id) else {
            warn!("api command without device");
            return Err(ControllerError::MissingDevice);
        };
        let Some(device) = self.device(&id).await else {
            debug!("ignoring api command for unconfigured device {id}");
            return Ok(ApiReply::Done);
        };
        match switch_to {
            Some(true) => self.turn_on(&device).await?,
            Some(false) => {
                self.turn_off(&device).await?;
            }
            None => {}
        }
        let state = self.state_by_id(&id).await?;
        Ok(ApiReply::Octopod(OctopodState::new(&id, state.state)))
    }

    pub async fn settings_view(&self) -> SettingsView {
        SettingsView::from(&*self.config.read().await)
    }

    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<SettingsUpdateResponse, ControllerError> {
        let (client_stale, restart_required) = self
            .update_config(move |config| {
                let previous = config.clone();
                if let Some(gateway_ip) = update.gateway_ip {
                    config.gateway.gateway_ip = gateway_ip;
                }
                if let Some(identity) = update.identity {
                    config.gateway.identity = identity;
                }
                if let Some(psk) = update.psk {
                    config.gateway.psk = psk;
                }
                if let Some(mqtt) = update.mqtt {
                    config.mqtt = mqtt;
                }
                if let Some(printer) = update.printer {
                    config.printer = printer;
                }
                if let Some(bridge) = update.bridge {
                    config.bridge = bridge;
                    config.bridge.sanitize();
                }

                let client_stale = previous.gateway != config.gateway
                    || previous.bridge.timeout_ms != config.bridge.timeout_ms;
                let restart_required = previous.mqtt != config.mqtt
                    || previous.printer != config.printer
                    || previous.bridge.cooldown_poll_ms != config.bridge.cooldown_poll_ms;
                (client_stale, restart_required)
            })
            .await?;

        if client_stale {
            self.reset_client().await;
        }
        if let Err(err) = self.load_devices().await {
            warn!("reloading devices after settings update failed: {err}");
        }

        Ok(SettingsUpdateResponse {
            restart_required,
            settings: self.settings_view().await,
        })
    }

    pub async fn shutdown(&self) {
        info!("shutting down power controller");
        self.scheduler.cancel_all();
        self.reset_client().await;
    }

    /// Applies a change to the config and writes the result to the store.
    pub(crate) async fn update_config<R>(
        &self,
        change: impl FnOnce(&mut RuntimeConfig) -> R,
    ) -> Result<R, ControllerError> {
        let (result, snapshot) = {
            let mut config = self.config.write().await;
            let result = change(&mut config);
            (result, config.clone())
        };
        self.store.save_runtime_config(&snapshot).await?;
        Ok(result)
    }

    async fn referenced_device(&self, payload: &str) -> Result<DeviceSettings, ControllerError> {
        let reference: DeviceRef = serde_json::from_str(payload)?;
        self.device(&reference.id)
            .await
            .ok_or(ControllerError::UnknownDevice(reference.id))
    }

    async fn switch(&self, device_id: &str, on: bool) -> Result<(), ControllerError> {
        let id = device_id.to_string();
        self.with_client(move |client| {
            let mut device = client.get_by_id(&id)?;
            let mut control = device.control();
            if on {
                control.switch_on()?;
            } else {
                control.switch_off()?;
            }
            Ok(())
        })
        .await
    }

    /// Runs blocking gateway work off the async executor.
    async fn with_client<T, F>(&self, work: F) -> Result<T, ControllerError>
    where
        F: FnOnce(TradfriClient) -> Result<T, ControllerError> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client().await?;
        tokio::task::spawn_blocking(move || work(client)).await?
    }

    async fn notify_sidebar(&self) {
        let info = self.sidebar_info().await;
        self.send_message(MessageKind::Sidebar, &info);
    }

    async fn notify_navbar(&self) {
        let info = self.navbar_info().await;
        self.send_message(MessageKind::Navbar, &info);
    }

    fn send_message(&self, kind: MessageKind, payload: &impl Serialize) {
        match serde_json::to_value(payload) {
            Ok(payload) => self.publish(Notification::Message(PluginMessage::new(kind, payload))),
            Err(err) => warn!("failed to encode {} message: {err}", kind.as_str()),
        }
    }

    fn publish(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            debug!("no notification listeners");
        }
    }

    fn current_client(&self) -> Option<TradfriClient> {
        self.lock_client()
            .as_ref()
            .filter(|client| !client.is_shut_down())
            .cloned()
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<TradfriClient>> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ShutdownHandler for PowerController {
    async fn shutdown_device(&self, device: &DeviceSettings) {
        match self.turn_off(device).await {
            Ok(TurnOffOutcome::SwitchedOff) => info!("scheduled turn off of {} done", device.name),
            Ok(TurnOffOutcome::Refused(_)) => {}
            Err(err) => warn!("scheduled turn off of {} failed: {err}", device.name),
        }
    }

    async fn temperatures(&self) -> Temperatures {
        self.printer.current_temperatures().await
    }

    async fn schedule_changed(&self) {
        self.notify_sidebar().await;
    }
}

fn octopod_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(number) => number.as_i64().map(|id| id.to_string()),
        Value::String(text) => text.trim().parse::<i64>().ok().map(|id| id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tradfri_common::{shutdown, DeviceType, GatewayConfig, TurnOffMode};

    use super::*;
    use crate::{
        gateway::{Control, InMemoryGateway},
        printer::LinkError,
        store::temp_store,
    };

    const HOST: &str = "192.168.1.20";

    #[derive(Default)]
    struct RecordingLink {
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl PrinterLink for RecordingLink {
        async fn connect(&self) -> Result<(), LinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), LinkError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn printer_outlet() -> DeviceSettings {
        DeviceSettings {
            on_done: true,
            stop_timer: 30,
            ..DeviceSettings::new("65537", "Printer")
        }
    }

    fn config() -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.gateway = GatewayConfig {
            gateway_ip: HOST.to_string(),
            identity: "controller".to_string(),
            psk: "secret".to_string(),
        };
        config.plugin.devices = vec![
            DeviceSummary {
                id: "65537".to_string(),
                name: "Printer".to_string(),
                device_type: DeviceType::Outlet,
            },
            DeviceSummary {
                id: "65538".to_string(),
                name: "Desk lamp".to_string(),
                device_type: DeviceType::Light,
            },
        ];
        config.plugin.selected_devices = vec![
            printer_outlet(),
            DeviceSettings {
                device_type: DeviceType::Light,
                connection_timer: -1,
                ..DeviceSettings::new("65538", "Lamp")
            },
        ];
        config
    }

    fn fixture_with(config: RuntimeConfig) -> (Arc<PowerController>, InMemoryGateway, Arc<RecordingLink>) {
        let gateway = InMemoryGateway::new(HOST, "CODE")
            .with_devices(InMemoryGateway::default_devices());
        gateway.register_identity("controller", "secret");
        let link = Arc::new(RecordingLink::default());
        let controller =
            PowerController::new(config, temp_store(), Arc::new(gateway.clone()), link.clone());
        (controller, gateway, link)
    }

    fn fixture() -> (Arc<PowerController>, InMemoryGateway, Arc<RecordingLink>) {
        fixture_with(config())
    }

    fn is_on(gateway: &InMemoryGateway, id: &str) -> bool {
        match gateway.device(id).map(|device| device.control) {
            Some(Control::Socket(channels)) | Some(Control::Light(channels)) => channels[0],
            _ => false,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test(start_paused = true)]
    async fn turn_on_connects_printer_after_delay() {
        let (controller, gateway, link) = fixture();

        controller.turn_on(&printer_outlet()).await.unwrap();
        assert!(is_on(&gateway, "65537"));
        assert_eq!(link.connects.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_timer_minus_one_connects_at_once() {
        let (controller, _gateway, link) = fixture();
        let immediate = DeviceSettings {
            connection_timer: -1,
            ..printer_outlet()
        };

        controller.turn_on(&immediate).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_timer_below_minus_one_skips_connect() {
        let (controller, gateway, link) = fixture();
        let disabled = DeviceSettings {
            connection_timer: -2,
            ..printer_outlet()
        };

        controller.turn_on(&disabled).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(is_on(&gateway, "65537"));
        assert_eq!(link.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn turn_off_is_refused_while_printing() {
        let (controller, gateway, link) = fixture();
        gateway.set_device_state("65537", true);
        controller.printer().apply_event(&PrintEvent::PrintStarted).await;

        let outcome = controller.turn_off(&printer_outlet()).await.unwrap();

        assert_eq!(outcome, TurnOffOutcome::Refused(BusyReason::Printing));
        assert!(is_on(&gateway, "65537"));
        assert_eq!(link.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn turn_off_disconnects_and_switches_off() {
        let (controller, gateway, link) = fixture();
        gateway.set_device_state("65537", true);

        let outcome = controller.turn_off(&printer_outlet()).await.unwrap();

        assert_eq!(outcome, TurnOffOutcome::SwitchedOff);
        assert!(!is_on(&gateway, "65537"));
        assert_eq!(link.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn print_done_schedules_turn_off() {
        let (controller, gateway, _link) = fixture();
        gateway.set_device_state("65537", true);
        gateway.set_device_state("65538", true);

        controller.on_event(&PrintEvent::PrintStarted).await;
        controller.on_event(&PrintEvent::PrintDone).await;
        assert!(controller.scheduler().has_timer("65537"));
        assert!(!controller.scheduler().has_timer("65538"));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(eventually(|| !is_on(&gateway, "65537")).await);
        assert!(is_on(&gateway, "65538"));
    }

    #[tokio::test(start_paused = true)]
    async fn print_start_cancels_pending_shutdown() {
        let (controller, gateway, _link) = fixture();
        gateway.set_device_state("65537", true);

        controller.on_event(&PrintEvent::PrintDone).await;
        assert!(controller.sidebar_info().await.shutdown_at["65537"].is_some());

        controller.on_event(&PrintEvent::PrintStarted).await;
        assert!(!controller.scheduler().has_timer("65537"));
        assert_eq!(controller.sidebar_info().await.shutdown_at["65537"], None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(is_on(&gateway, "65537"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_shutdown_follows_temperature_topics() {
        let mut config = config();
        config.plugin.selected_devices[0].turn_off_mode = TurnOffMode::Cooldown;
        config.plugin.selected_devices[0].cooldown_bed = 40;
        let (controller, gateway, _link) = fixture_with(config);
        gateway.set_device_state("65537", true);

        controller
            .on_mqtt_message("octoPrint/temperature/bed", r#"{"actual": 60.0, "target": 0.0}"#)
            .await
            .unwrap();
        controller
            .on_mqtt_message("octoPrint/temperature/tool0", r#"{"actual": 42.0, "target": 0.0}"#)
            .await
            .unwrap();
        controller.on_mqtt_message("octoPrint/event/PrintDone", "{}").await.unwrap();
        assert!(controller.scheduler().has_cooldown("65537"));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(is_on(&gateway, "65537"));

        controller
            .on_mqtt_message("octoPrint/temperature/bed", r#"{"actual": 35.0}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(eventually(|| !is_on(&gateway, "65537")).await);
        assert_eq!(
            controller.printer().current_temperatures().await[shutdown::BED].actual,
            35.0
        );
    }

    #[tokio::test]
    async fn mqtt_commands_switch_configured_devices() {
        let (controller, gateway, _link) = fixture();

        controller
            .on_mqtt_message("octoPrint/plugin/ikea_tradfri/turnOn", r#"{"id": 65538}"#)
            .await
            .unwrap();
        assert!(is_on(&gateway, "65538"));

        controller
            .on_mqtt_message("octoPrint/plugin/ikea_tradfri/turnOff", r#"{"id": "65538"}"#)
            .await
            .unwrap();
        assert!(!is_on(&gateway, "65538"));

        let unknown = controller
            .on_mqtt_message("octoPrint/plugin/ikea_tradfri/turnOn", r#"{"id": 1}"#)
            .await;
        assert!(matches!(unknown, Err(ControllerError::UnknownDevice(id)) if id == "1"));

        controller
            .on_mqtt_message("elsewhere/plugin/ikea_tradfri/turnOn", r#"{"id": 65537}"#)
            .await
            .unwrap();
        assert!(!is_on(&gateway, "65537"));
    }

    #[tokio::test]
    async fn state_data_publishes_each_device() {
        let (controller, gateway, _link) = fixture();
        gateway.set_device_state("65538", true);
        let mut notifications = controller.subscribe();

        let states = controller.state_data().await;

        assert_eq!(states["65537"], DeviceStatePayload { state: false });
        assert_eq!(states["65538"], DeviceStatePayload { state: true });
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::DeviceState {
                id: "65537".to_string(),
                state: DeviceStatePayload { state: false },
            }
        );
    }

    #[tokio::test]
    async fn saved_device_takes_gateway_type() {
        let (controller, _gateway, _link) = fixture();

        let devices = controller
            .save_device(DeviceSettings {
                device_type: DeviceType::Outlet,
                name: "Lamp renamed".to_string(),
                ..DeviceSettings::new("65538", "Lamp")
            })
            .await
            .unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].name, "Lamp renamed");
        assert_eq!(devices[1].device_type, DeviceType::Light);

        let devices = controller.delete_device("65537").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(controller.device("65537").await.is_none());
    }

    #[tokio::test]
    async fn octopod_commands_answer_with_current_state() {
        let (controller, gateway, _link) = fixture();

        let command: ApiCommand =
            serde_json::from_value(json!({ "command": "turnOn", "ip": "65538" })).unwrap();
        let reply = controller.api_command(command).await.unwrap();
        assert_eq!(reply, ApiReply::Octopod(OctopodState::new("65538", true)));
        assert!(is_on(&gateway, "65538"));

        let status = controller
            .api_command(ApiCommand::CheckStatus(ApiTarget {
                dev: None,
                ip: Some(json!(65537)),
            }))
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(status).unwrap(),
            json!({ "ip": "65537", "currentState": "off" })
        );

        let missing = controller.api_command(ApiCommand::TurnOff(ApiTarget::default())).await;
        assert!(matches!(missing, Err(ControllerError::MissingDevice)));

        let unconfigured = controller
            .api_command(ApiCommand::TurnOn(ApiTarget {
                dev: None,
                ip: Some(json!(65539)),
            }))
            .await
            .unwrap();
        assert_eq!(unconfigured, ApiReply::Done);
        assert!(gateway.set_state_commands().iter().all(|(id, _)| id != "65539"));
    }

    #[tokio::test]
    async fn load_devices_records_status() {
        let (controller, _gateway, _link) = fixture();

        let devices = controller.load_devices().await.unwrap();
        assert_eq!(devices.len(), 4);
        assert_eq!(controller.status().await.status, ConnectionStatus::Ok);

        controller
            .update_settings(SettingsUpdate {
                psk: Some("wrong".to_string()),
                ..SettingsUpdate::default()
            })
            .await
            .unwrap();
        let status = controller.status().await;
        assert_eq!(status.status, ConnectionStatus::Error);
        assert!(!status.error_message.is_empty());
    }

    #[tokio::test]
    async fn gateway_outage_is_recorded_as_error() {
        let (controller, gateway, _link) = fixture();
        controller.load_devices().await.unwrap();

        gateway.set_online(false);
        let result = controller.load_devices().await;

        assert!(matches!(result, Err(ControllerError::Client(_))));
        let status = controller.status().await;
        assert_eq!(status.status, ConnectionStatus::Error);
        assert!(status.error_message.contains("unreachable"), "{}", status.error_message);
        assert_eq!(status.devices.len(), 4);

        gateway.set_online(true);
        controller.load_devices().await.unwrap();
        assert_eq!(controller.status().await.status, ConnectionStatus::Ok);
    }

    #[tokio::test]
    async fn missing_credentials_are_reported() {
        let (controller, _gateway, _link) = fixture_with(RuntimeConfig::default());

        assert!(matches!(
            controller.state_by_id("65537").await,
            Err(ControllerError::NotConfigured)
        ));
        assert!(controller.status().await.wizard_required);
    }

    #[tokio::test]
    async fn shutdown_closes_the_gateway_session() {
        let (controller, gateway, _link) = fixture();
        controller.state_by_id("65537").await.unwrap();

        controller.shutdown().await;

        assert_eq!(gateway.shutdown_count(), 1);
    }
}
