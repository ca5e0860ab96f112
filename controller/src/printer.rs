//! Printer state as reported by OctoPrint, and the connection link back to it.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use tradfri_common::{PrintEvent, PrinterConfig, TemperatureReading, Temperatures};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PrinterStatus {
    pub operational: bool,
    pub printing: bool,
    pub paused: bool,
    pub cancelling: bool,
    pub temperatures: Temperatures,
}

/// Why the printer must keep its power.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    Printing,
    Paused,
    Cancelling,
}

impl fmt::Display for BusyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Printing => "printer is printing",
            Self::Paused => "printer is paused",
            Self::Cancelling => "printer is cancelling",
        })
    }
}

#[derive(Clone, Default)]
pub struct PrinterMonitor {
    status: Arc<RwLock<PrinterStatus>>,
}

impl PrinterMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply_event(&self, event: &PrintEvent) {
        let mut status = self.status.write().await;
        match event {
            PrintEvent::Connected => status.operational = true,
            PrintEvent::Disconnected => *status = PrinterStatus::default(),
            PrintEvent::PrintStarted | PrintEvent::PrintResumed => {
                status.operational = true;
                status.printing = true;
                status.paused = false;
                status.cancelling = false;
            }
            PrintEvent::PrintPaused => {
                status.printing = false;
                status.paused = true;
            }
            PrintEvent::PrintCancelling => status.cancelling = true,
            PrintEvent::PrintCancelled | PrintEvent::PrintDone | PrintEvent::PrintFailed => {
                status.printing = false;
                status.paused = false;
                status.cancelling = false;
            }
            PrintEvent::Other(_) => {}
        }
    }

    pub async fn update_temperature(&self, tool: &str, reading: TemperatureReading) {
        self.status
            .write()
            .await
            .temperatures
            .insert(tool.to_string(), reading);
    }

    pub async fn snapshot(&self) -> PrinterStatus {
        self.status.read().await.clone()
    }

    pub async fn current_temperatures(&self) -> Temperatures {
        self.status.read().await.temperatures.clone()
    }

    pub async fn busy_reason(&self) -> Option<BusyReason> {
        let status = self.status.read().await;
        if status.printing {
            Some(BusyReason::Printing)
        } else if status.paused {
            Some(BusyReason::Paused)
        } else if status.cancelling {
            Some(BusyReason::Cancelling)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("octoprint request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("octoprint answered {0}")]
    Status(reqwest::StatusCode),
}

/// Opens and closes the printer's serial connection.
#[async_trait]
pub trait PrinterLink: Send + Sync {
    async fn connect(&self) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}

pub struct OctoPrintLink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OctoPrintLink {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn connection_command(&self, command: &str) -> Result<(), LinkError> {
        let url = format!("{}/api/connection", self.base_url);
        debug!("octoprint connection command {command} via {url}");
        let response = self
            .client
            .post(&url)
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LinkError::Status(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl PrinterLink for OctoPrintLink {
    async fn connect(&self) -> Result<(), LinkError> {
        self.connection_command("connect").await
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.connection_command("disconnect").await
    }
}

/// Used when no OctoPrint URL is configured.
pub struct LogOnlyLink;

#[async_trait]
impl PrinterLink for LogOnlyLink {
    async fn connect(&self) -> Result<(), LinkError> {
        info!("printer connect requested (no octoprint url configured)");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        info!("printer disconnect requested (no octoprint url configured)");
        Ok(())
    }
}

pub fn link_from_config(config: &PrinterConfig) -> Arc<dyn PrinterLink> {
    match config.octoprint_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => Arc::new(OctoPrintLink::new(url, &config.api_key)),
        None => Arc::new(LogOnlyLink),
    }
}
