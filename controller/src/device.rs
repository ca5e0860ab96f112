use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use thiserror::Error;
use tradfri_common::{DeviceSummary, DeviceType};

use crate::{
    client::{ClientError, TradfriClient},
    gateway::{Command, Control, RawDevice},
};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("state for device type {0} is not available")]
    Unsupported(DeviceType),
    #[error("device {0} reports no channels")]
    NoChannels(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Cached view of one gateway device.
pub struct TradfriDevice {
    raw: RawDevice,
    client: TradfriClient,
}

impl TradfriDevice {
    pub(crate) fn new(raw: RawDevice, client: TradfriClient) -> Self {
        Self { raw, client }
    }

    pub fn id(&self) -> &str {
        &self.raw.id
    }

    pub fn name(&self) -> &str {
        &self.raw.name
    }

    pub fn device_type(&self) -> DeviceType {
        match self.raw.control {
            Control::Light(_) => DeviceType::Light,
            Control::Socket(_) => DeviceType::Outlet,
            Control::Blind(_) => DeviceType::Blind,
            Control::None => DeviceType::Other,
        }
    }

    /// On/off state of the first channel, as last fetched.
    pub fn state(&self) -> Result<bool, DeviceError> {
        match &self.raw.control {
            Control::Socket(channels) | Control::Light(channels) => channels
                .first()
                .copied()
                .ok_or_else(|| DeviceError::NoChannels(self.raw.id.clone())),
            _ => Err(DeviceError::Unsupported(self.device_type())),
        }
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.raw.id.clone(),
            name: self.raw.name.clone(),
            device_type: self.device_type(),
        }
    }

    pub fn refresh(&mut self) -> Result<&mut Self, ClientError> {
        self.raw = self.client.fetch_device(&self.raw.id)?;
        Ok(self)
    }

    pub fn control(&mut self) -> DeviceControl<'_> {
        DeviceControl { device: self }
    }
}

impl fmt::Debug for TradfriDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TradfriDevice - {} - {} ({})>",
            self.raw.id, self.raw.name, self.raw.info.model_number
        )
    }
}

/// A device known to have socket control.
#[derive(Debug)]
pub struct TradfriSocket(TradfriDevice);

impl TryFrom<TradfriDevice> for TradfriSocket {
    type Error = TradfriDevice;

    fn try_from(device: TradfriDevice) -> Result<Self, Self::Error> {
        if device.raw.has_socket_control() {
            Ok(Self(device))
        } else {
            Err(device)
        }
    }
}

impl Deref for TradfriSocket {
    type Target = TradfriDevice;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for TradfriSocket {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// On/off operations; each one refetches the device afterwards.
pub struct DeviceControl<'a> {
    device: &'a mut TradfriDevice,
}

impl DeviceControl<'_> {
    pub fn state(&self) -> Result<bool, DeviceError> {
        self.device.state()
    }

    pub fn switch_on(&mut self) -> Result<(), DeviceError> {
        self.set_state(true)
    }

    pub fn switch_off(&mut self) -> Result<(), DeviceError> {
        self.set_state(false)
    }

    /// Returns the state that was requested.
    pub fn toggle_state(&mut self) -> Result<bool, DeviceError> {
        let target = !self.state()?;
        self.set_state(target)?;
        Ok(target)
    }

    fn set_state(&mut self, on: bool) -> Result<(), DeviceError> {
        let device_type = self.device.device_type();
        if !device_type.is_switchable() {
            return Err(DeviceError::Unsupported(device_type));
        }

        self.device.client.run_command(Command::SetState {
            device_id: self.device.raw.id.clone(),
            on,
        })?;
        self.device.refresh()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::gateway::{Credentials, InMemoryGateway};

    fn setup() -> (InMemoryGateway, TradfriClient) {
        let gateway = InMemoryGateway::new("10.0.0.2", "code")
            .with_devices(InMemoryGateway::default_devices());
        gateway.register_identity("id", "psk");
        let client = TradfriClient::new(
            Credentials {
                host: "10.0.0.2".to_string(),
                identity: "id".to_string(),
                psk: "psk".to_string(),
            },
            Arc::new(gateway.clone()),
            Duration::from_secs(1),
        );
        (gateway, client)
    }

    #[test]
    fn toggle_sends_one_opposite_command_and_refreshes() {
        let (gateway, client) = setup();
        let mut outlet = client.get_by_id("65537").unwrap();
        assert!(!outlet.state().unwrap());

        let requested = outlet.control().toggle_state().unwrap();

        assert!(requested);
        assert_eq!(gateway.set_state_commands(), vec![("65537".to_string(), true)]);
        assert!(outlet.state().unwrap());
        assert_eq!(
            gateway.commands().last(),
            Some(&Command::GetDevice("65537".to_string()))
        );
    }

    #[test]
    fn switching_updates_cached_state() {
        let (gateway, client) = setup();
        let mut lamp = client.get_by_id("65538").unwrap();
        assert_eq!(lamp.device_type(), DeviceType::Light);

        lamp.control().switch_off().unwrap();
        assert!(!lamp.state().unwrap());
        assert_eq!(gateway.device("65538").unwrap().control, Control::Light(vec![false]));

        lamp.control().switch_on().unwrap();
        assert!(lamp.control().state().unwrap());
    }

    #[test]
    fn blinds_have_no_switchable_state() {
        let (gateway, client) = setup();
        let mut blind = client.get_by_id("65539").unwrap();

        assert!(matches!(
            blind.state(),
            Err(DeviceError::Unsupported(DeviceType::Blind))
        ));
        assert!(matches!(
            blind.control().switch_on(),
            Err(DeviceError::Unsupported(DeviceType::Blind))
        ));
        assert!(gateway.set_state_commands().is_empty());
    }

    #[test]
    fn refresh_picks_up_external_changes() {
        let (gateway, client) = setup();
        let mut outlet = client.get_by_id("65537").unwrap();

        gateway.set_device_state("65537", true);
        assert!(!outlet.state().unwrap());

        outlet.refresh().unwrap();
        assert!(outlet.state().unwrap());
        assert_eq!(
            outlet.summary(),
            DeviceSummary {
                id: "65537".to_string(),
                name: "Printer".to_string(),
                device_type: DeviceType::Outlet,
            }
        );
    }

    #[test]
    fn only_outlets_become_sockets() {
        let (_gateway, client) = setup();
        let lamp = client.get_by_id("65538").unwrap();
        assert!(TradfriSocket::try_from(lamp).is_err());

        let outlet = client.get_by_id("65537").unwrap();
        let socket = TradfriSocket::try_from(outlet).unwrap();
        assert_eq!(socket.name(), "Printer");
    }
}
