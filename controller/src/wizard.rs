//! First-run setup: PSK exchange with the gateway and choice of the printer outlet.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use tradfri_common::{DeviceSettings, DeviceSummary, RuntimeConfig};

use crate::{
    client::{self, ClientError},
    plugin::{ControllerError, PowerController},
};

#[derive(Debug, Error)]
pub enum WizardError {
    #[error("failed to generate psk: {0}")]
    Psk(#[source] ClientError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

pub fn is_wizard_required(config: &RuntimeConfig) -> bool {
    !config.gateway.is_complete()
}

fn new_identity() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tradfri-controller-{}", &suffix[..6])
}

impl PowerController {
    /// Pairs with the gateway and returns what it reports.
    ///
    /// A successful pairing whose device listing fails still counts; the list is just empty.
    pub async fn try_connect(
        &self,
        gateway: &str,
        security_code: &str,
    ) -> Result<Vec<DeviceSummary>, WizardError> {
        let identity = new_identity();
        info!("pairing with gateway {gateway} as {identity}");

        let timeout = Duration::from_millis(self.config().await.bridge.timeout_ms);
        let psk = {
            let connector = self.connector();
            let (gateway, identity, code) =
                (gateway.to_string(), identity.clone(), security_code.to_string());
            tokio::task::spawn_blocking(move || {
                client::generate_psk(connector, &gateway, &identity, &code, timeout)
            })
            .await
            .map_err(ControllerError::from)?
            .map_err(WizardError::Psk)?
        };

        let host = gateway.to_string();
        self.update_config(move |config| {
            config.gateway.gateway_ip = host;
            config.gateway.identity = identity;
            config.gateway.psk = psk;
        })
        .await?;
        self.reset_client().await;

        match self.load_devices().await {
            Ok(devices) => Ok(devices),
            Err(err) => {
                warn!("paired with {gateway} but listing devices failed: {err}");
                Ok(Vec::new())
            }
        }
    }

    /// Makes the given outlet the only managed device, with setup defaults.
    pub async fn set_outlet(&self, device_id: &str) -> Result<Vec<DeviceSettings>, ControllerError> {
        info!("wizard selected outlet {device_id}");
        let outlet = DeviceSettings::wizard_outlet(device_id);
        self.update_config(move |config| {
            config.plugin.selected_devices = vec![outlet];
            config.plugin.selected_devices.clone()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tradfri_common::TurnOffMode;

    use super::*;
    use crate::{
        gateway::{GatewayError, InMemoryGateway},
        printer::LogOnlyLink,
        store::temp_store,
    };

    const HOST: &str = "192.168.1.30";

    fn controller(gateway: &InMemoryGateway) -> Arc<PowerController> {
        PowerController::new(
            RuntimeConfig::default(),
            temp_store(),
            Arc::new(gateway.clone()),
            Arc::new(LogOnlyLink),
        )
    }

    #[tokio::test]
    async fn pairing_saves_credentials_and_lists_devices() {
        let gateway = InMemoryGateway::new(HOST, "SECURITY")
            .with_devices(InMemoryGateway::default_devices());
        let controller = controller(&gateway);
        assert!(is_wizard_required(&controller.config().await));

        let devices = controller.try_connect(HOST, "SECURITY").await.unwrap();

        assert_eq!(devices.len(), 4);
        let config = controller.config().await;
        assert!(!is_wizard_required(&config));
        assert_eq!(config.gateway.gateway_ip, HOST);
        assert!(config.gateway.identity.starts_with("tradfri-controller-"));
        assert_eq!(config.gateway.identity.len(), "tradfri-controller-".len() + 6);
        assert_eq!(config.plugin.devices, devices);
    }

    #[tokio::test]
    async fn wrong_security_code_keeps_wizard_open() {
        let gateway = InMemoryGateway::new(HOST, "SECURITY");
        let controller = controller(&gateway);

        let result = controller.try_connect(HOST, "nope").await;

        assert!(matches!(
            result,
            Err(WizardError::Psk(ClientError::Gateway(GatewayError::Unauthorized(_))))
        ));
        assert!(is_wizard_required(&controller.config().await));
    }

    #[tokio::test]
    async fn chosen_outlet_replaces_selection() {
        let gateway = InMemoryGateway::new(HOST, "SECURITY");
        let controller = controller(&gateway);
        controller
            .save_device(DeviceSettings::new("65540", "Old"))
            .await
            .unwrap();

        let devices = controller.set_outlet("65537").await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Printer");
        assert_eq!(devices[0].turn_off_mode, TurnOffMode::Cooldown);
        assert_eq!(devices[0].cooldown_hotend, 50);
        assert!(devices[0].on_done);
    }
}
