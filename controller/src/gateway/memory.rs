use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use super::{
    ApiFactory, Command, Control, Credentials, DeviceInfo, GatewayConnector, GatewayError,
    RawDevice, Response,
};

/// Gateway living in process memory.
///
/// Stands in for the CoAP transport: it keeps device state, issues PSKs for
/// the right security code and remembers the most recent commands.
const COMMAND_LOG_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct InMemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

struct GatewayState {
    host: Option<String>,
    security_code: String,
    identities: HashMap<String, String>,
    devices: BTreeMap<String, RawDevice>,
    commands: VecDeque<Command>,
    latency: Duration,
    online: bool,
    shutdowns: usize,
}

impl GatewayState {
    fn reachable(&self, host: &str) -> bool {
        self.online && self.host.as_deref().map_or(true, |own| own == host)
    }
}

impl InMemoryGateway {
    pub fn new(host: impl Into<String>, security_code: impl Into<String>) -> Self {
        Self::build(Some(host.into()), security_code.into())
    }

    /// Answers on whatever host address the caller dials.
    pub fn any_host(security_code: impl Into<String>) -> Self {
        Self::build(None, security_code.into())
    }

    fn build(host: Option<String>, security_code: String) -> Self {
        Self {
            state: Arc::new(Mutex::new(GatewayState {
                host,
                security_code,
                identities: HashMap::new(),
                devices: BTreeMap::new(),
                commands: VecDeque::with_capacity(COMMAND_LOG_CAPACITY),
                latency: Duration::ZERO,
                online: true,
                shutdowns: 0,
            })),
        }
    }

    pub fn with_devices(self, devices: impl IntoIterator<Item = RawDevice>) -> Self {
        {
            let mut state = self.lock();
            for device in devices {
                state.devices.insert(device.id.clone(), device);
            }
        }
        self
    }

    pub fn default_devices() -> Vec<RawDevice> {
        vec![
            seed_device("65537", "Printer", "TRADFRI control outlet", Control::Socket(vec![false])),
            seed_device("65538", "Desk lamp", "TRADFRI bulb E27 WS opal 980lm", Control::Light(vec![true])),
            seed_device("65539", "Workshop blind", "FYRTUR block-out roller blind", Control::Blind(vec![100])),
            seed_device("65540", "Remote", "TRADFRI remote control", Control::None),
        ]
    }

    pub fn load_seed(path: &Path) -> anyhow::Result<Vec<RawDevice>> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read device seed {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("invalid device seed {}", path.display()))
    }

    pub fn register_identity(&self, identity: impl Into<String>, psk: impl Into<String>) {
        self.lock().identities.insert(identity.into(), psk.into());
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_online(&self, online: bool) {
        self.lock().online = online;
    }

    /// Flips a device behind the controller's back, like a physical button press.
    pub fn set_device_state(&self, id: &str, on: bool) -> bool {
        let mut state = self.lock();
        state
            .devices
            .get_mut(id)
            .is_some_and(|device| apply_state(&mut device.control, on))
    }

    pub fn device(&self, id: &str) -> Option<RawDevice> {
        self.lock().devices.get(id).cloned()
    }

    /// Most recent commands, oldest first.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.iter().cloned().collect()
    }

    pub fn set_state_commands(&self) -> Vec<(String, bool)> {
        self.lock()
            .commands
            .iter()
            .filter_map(|command| match command {
                Command::SetState { device_id, on } => Some((device_id.clone(), *on)),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.lock().shutdowns
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl GatewayConnector for InMemoryGateway {
    async fn connect(&self, credentials: &Credentials) -> Result<Arc<dyn ApiFactory>, GatewayError> {
        self.simulate_latency().await;
        let state = self.lock();
        if !state.reachable(&credentials.host) {
            return Err(GatewayError::Unreachable(credentials.host.clone()));
        }
        if state.identities.get(&credentials.identity) != Some(&credentials.psk) {
            return Err(GatewayError::Unauthorized(credentials.identity.clone()));
        }
        debug!("in-memory gateway session opened for {}", credentials.identity);
        Ok(Arc::new(InMemorySession {
            gateway: self.clone(),
        }))
    }

    async fn generate_psk(
        &self,
        host: &str,
        identity: &str,
        security_code: &str,
    ) -> Result<String, GatewayError> {
        self.simulate_latency().await;
        let mut state = self.lock();
        if !state.reachable(host) {
            return Err(GatewayError::Unreachable(host.to_string()));
        }
        if state.security_code != security_code {
            return Err(GatewayError::Unauthorized(identity.to_string()));
        }
        let psk = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        state.identities.insert(identity.to_string(), psk.clone());
        Ok(psk)
    }
}

struct InMemorySession {
    gateway: InMemoryGateway,
}

#[async_trait]
impl ApiFactory for InMemorySession {
    async fn request(&self, command: Command) -> Result<Response, GatewayError> {
        self.gateway.simulate_latency().await;
        let mut state = self.gateway.lock();
        if !state.online {
            return Err(GatewayError::Unreachable(
                state.host.clone().unwrap_or_else(|| "gateway".to_string()),
            ));
        }
        if state.commands.len() == COMMAND_LOG_CAPACITY {
            state.commands.pop_front();
        }
        state.commands.push_back(command.clone());

        match command {
            Command::ListDeviceIds => Ok(Response::DeviceIds(state.devices.keys().cloned().collect())),
            Command::GetDevice(id) => state
                .devices
                .get(&id)
                .cloned()
                .map(Response::Device)
                .ok_or(GatewayError::NotFound(id)),
            Command::SetState { device_id, on } => {
                let device = state
                    .devices
                    .get_mut(&device_id)
                    .ok_or_else(|| GatewayError::NotFound(device_id.clone()))?;
                if apply_state(&mut device.control, on) {
                    Ok(Response::Done)
                } else {
                    Err(GatewayError::Api(format!(
                        "device {device_id} has no switchable control"
                    )))
                }
            }
        }
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        self.gateway.lock().shutdowns += 1;
        Ok(())
    }
}

fn apply_state(control: &mut Control, on: bool) -> bool {
    match control {
        Control::Socket(channels) | Control::Light(channels) => {
            channels.iter_mut().for_each(|channel| *channel = on);
            true
        }
        Control::Blind(_) | Control::None => false,
    }
}

fn seed_device(id: &str, name: &str, model: &str, control: Control) -> RawDevice {
    RawDevice {
        id: id.to_string(),
        name: name.to_string(),
        info: DeviceInfo {
            manufacturer: "IKEA of Sweden".to_string(),
            model_number: model.to_string(),
            firmware_version: "2.3.086".to_string(),
        },
        control,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "192.168.1.10";

    fn credentials() -> Credentials {
        Credentials {
            host: HOST.to_string(),
            identity: "controller".to_string(),
            psk: "secret".to_string(),
        }
    }

    fn gateway() -> InMemoryGateway {
        let gateway = InMemoryGateway::new(HOST, "CODE").with_devices(InMemoryGateway::default_devices());
        gateway.register_identity("controller", "secret");
        gateway
    }

    #[tokio::test]
    async fn command_log_keeps_only_recent_commands() {
        let gateway = gateway();
        let session = gateway.connect(&credentials()).await.unwrap();

        for _ in 0..COMMAND_LOG_CAPACITY + 40 {
            session.request(Command::ListDeviceIds).await.unwrap();
        }
        session
            .request(Command::SetState {
                device_id: "65537".to_string(),
                on: true,
            })
            .await
            .unwrap();

        let commands = gateway.commands();
        assert_eq!(commands.len(), COMMAND_LOG_CAPACITY);
        assert_eq!(gateway.set_state_commands(), vec![("65537".to_string(), true)]);
    }

    #[tokio::test]
    async fn offline_gateway_refuses_sessions_and_requests() {
        let gateway = gateway();
        let session = gateway.connect(&credentials()).await.unwrap();

        gateway.set_online(false);
        assert_eq!(
            session.request(Command::ListDeviceIds).await,
            Err(GatewayError::Unreachable(HOST.to_string()))
        );
        assert!(matches!(
            gateway.connect(&credentials()).await,
            Err(GatewayError::Unreachable(host)) if host == HOST
        ));
        assert!(gateway.commands().is_empty());

        gateway.set_online(true);
        assert!(session.request(Command::ListDeviceIds).await.is_ok());
    }

    #[tokio::test]
    async fn any_host_answers_every_address() {
        let gateway = InMemoryGateway::any_host("CODE");

        let psk = gateway.generate_psk("10.0.0.7", "wizard", "CODE").await.unwrap();
        let session = gateway
            .connect(&Credentials {
                host: "10.0.0.7".to_string(),
                identity: "wizard".to_string(),
                psk,
            })
            .await;
        assert!(session.is_ok());
    }
}
