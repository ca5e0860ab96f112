use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

use tradfri_common::{MigrationError, PluginSettings, RuntimeConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// JSON settings file under the data directory.
#[derive(Clone)]
pub struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.into().join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_env() -> Self {
        let data_dir = std::env::var("TRADFRI_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.tradfri"));
        Self::new(data_dir)
    }

    pub fn runtime_path(&self) -> &PathBuf {
        &self.runtime_path
    }

    /// Loads the config, bringing plugin settings up to the current version.
    ///
    /// Returns whether a migration changed anything; the caller decides when to write it back.
    pub async fn load_runtime_config(&self) -> Result<(RuntimeConfig, bool), StoreError> {
        let _guard = self.lock.lock().await;
        let raw = match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok((RuntimeConfig::default(), false))
            }
            Err(err) => return Err(err.into()),
        };

        let mut value: Value = serde_json::from_slice(&raw)?;
        let plugin = value
            .as_object_mut()
            .and_then(|object| object.remove("plugin"))
            .unwrap_or_else(|| Value::Object(Default::default()));

        let mut config: RuntimeConfig = serde_json::from_value(value)?;
        let (plugin, migrated) = PluginSettings::migrate(plugin)?;
        config.plugin = plugin;
        config.bridge.sanitize();
        Ok((config, migrated))
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn temp_store() -> AppStore {
    let dir = std::env::temp_dir().join(format!("tradfri-store-{}", uuid::Uuid::new_v4().simple()));
    AppStore::new(dir)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tradfri_common::{DeviceSettings, TurnOffMode, SETTINGS_VERSION};

    use super::*;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let store = temp_store();
        let (config, migrated) = store.load_runtime_config().await.unwrap();
        assert!(!migrated);
        assert!(config.plugin.selected_devices.is_empty());
        assert_eq!(config.bridge.timeout_ms, 1_000);
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let store = temp_store();
        let mut config = RuntimeConfig::default();
        config.gateway.gateway_ip = "192.168.1.20".to_string();
        config.plugin.upsert_device(DeviceSettings {
            turn_off_mode: TurnOffMode::Cooldown,
            ..DeviceSettings::new("65537", "Printer")
        });

        store.save_runtime_config(&config).await.unwrap();
        let (loaded, migrated) = store.load_runtime_config().await.unwrap();

        assert!(!migrated);
        assert_eq!(loaded.gateway, config.gateway);
        assert_eq!(loaded.plugin.selected_devices, config.plugin.selected_devices);
    }

    #[tokio::test]
    async fn legacy_plugin_settings_are_migrated_on_load() {
        let store = temp_store();
        let legacy = json!({
            "gateway": { "gateway_ip": "10.0.0.2", "identity": "id", "psk": "psk" },
            "plugin": { "selected_outlet": 65537, "stop_timer": 90, "on_done": true },
            "bridge": { "timeout_ms": 5, "cooldown_poll_ms": 5000 }
        });
        tokio::fs::create_dir_all(store.runtime_path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(store.runtime_path(), legacy.to_string())
            .await
            .unwrap();

        let (config, migrated) = store.load_runtime_config().await.unwrap();

        assert!(migrated);
        assert_eq!(config.plugin.settings_version, SETTINGS_VERSION);
        let printer = config.plugin.selected_device("65537").unwrap();
        assert_eq!(printer.stop_timer, 90);
        assert!(printer.on_done);
        assert_eq!(config.bridge.timeout_ms, 100);
    }
}
