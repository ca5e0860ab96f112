//! Synchronous gateway client.
//!
//! Every call is submitted to a [`ThreadedWorker`] and awaited with the
//! bridge timeout. Failures are logged here and returned to the caller,
//! which is free to ignore them.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    device::{TradfriDevice, TradfriSocket},
    gateway::{ApiFactory, Command, Credentials, GatewayConnector, GatewayError, RawDevice, Response},
    worker::{ThreadedWorker, WorkerError},
};

const PSK_ATTEMPTS: u32 = 3;
const PSK_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("client for gateway {0} has been shut down")]
    ShutDown(String),
}

/// Cloneable handle to one gateway session.
#[derive(Clone)]
pub struct TradfriClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    session: Arc<Session>,
    timeout: Duration,
    worker: Mutex<Option<ThreadedWorker>>,
    shut_down: AtomicBool,
}

struct Session {
    credentials: Credentials,
    connector: Arc<dyn GatewayConnector>,
    factory: tokio::sync::Mutex<Option<Arc<dyn ApiFactory>>>,
}

impl Session {
    async fn factory(&self) -> Result<Arc<dyn ApiFactory>, GatewayError> {
        let mut factory = self.factory.lock().await;
        if let Some(existing) = factory.as_ref() {
            return Ok(existing.clone());
        }
        debug!("api factory not yet available, connecting to {}", self.credentials.host);
        let created = self.connector.connect(&self.credentials).await?;
        *factory = Some(created.clone());
        Ok(created)
    }

    async fn call(&self, command: Command) -> Result<Response, GatewayError> {
        self.factory().await?.request(command).await
    }

    async fn device(&self, id: String) -> Result<RawDevice, GatewayError> {
        match self.call(Command::GetDevice(id)).await? {
            Response::Device(device) => Ok(device),
            _ => Err(GatewayError::UnexpectedResponse("get_device")),
        }
    }

    async fn devices(&self) -> Result<Vec<RawDevice>, GatewayError> {
        let Response::DeviceIds(ids) = self.call(Command::ListDeviceIds).await? else {
            return Err(GatewayError::UnexpectedResponse("list_device_ids"));
        };
        let mut devices = Vec::with_capacity(ids.len());
        for id in ids {
            devices.push(self.device(id).await?);
        }
        Ok(devices)
    }

    async fn shutdown(&self) -> Result<(), GatewayError> {
        let factory = self.factory.lock().await.take();
        match factory {
            Some(factory) => factory.shutdown().await,
            None => Ok(()),
        }
    }
}

impl TradfriClient {
    pub fn new(
        credentials: Credentials,
        connector: Arc<dyn GatewayConnector>,
        timeout: Duration,
    ) -> Self {
        info!(
            "init tradfri client for gateway {} with identity {}",
            credentials.host, credentials.identity
        );
        Self {
            inner: Arc::new(ClientInner {
                session: Arc::new(Session {
                    credentials,
                    connector,
                    factory: tokio::sync::Mutex::new(None),
                }),
                timeout,
                worker: Mutex::new(None),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.session.credentials
    }

    pub fn list_devices(&self) -> Result<Vec<TradfriDevice>, ClientError> {
        let raw = self.execute("list_devices", |session| async move { session.devices().await })?;
        Ok(raw
            .into_iter()
            .map(|device| TradfriDevice::new(device, self.clone()))
            .collect())
    }

    pub fn get_sockets(&self) -> Result<Vec<TradfriSocket>, ClientError> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter_map(|device| TradfriSocket::try_from(device).ok())
            .collect())
    }

    pub fn get_by_id(&self, device_id: &str) -> Result<TradfriDevice, ClientError> {
        let raw = self.fetch_device(device_id)?;
        Ok(TradfriDevice::new(raw, self.clone()))
    }

    pub fn run_command(&self, command: Command) -> Result<Response, ClientError> {
        self.execute(command.name(), |session| async move { session.call(command).await })
    }

    pub(crate) fn fetch_device(&self, device_id: &str) -> Result<RawDevice, ClientError> {
        debug!("getting device with id {device_id}");
        let id = device_id.to_string();
        self.execute("get_by_id", |session| async move { session.device(id).await })
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Closes the gateway session and stops the worker thread.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down tradfri client for {}", self.credentials().host);

        let worker = self.lock_worker().take();
        let Some(mut worker) = worker else {
            return;
        };

        let session = self.inner.session.clone();
        let closed = worker
            .submit(async move { session.shutdown().await })
            .and_then(|pending| pending.wait(self.inner.timeout));
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to shut down gateway session: {err}"),
            Err(err) => warn!("failed to shut down gateway session: {err}"),
        }
        worker.close();
    }

    fn execute<F, Fut, T>(&self, operation: &'static str, call: F) -> Result<T, ClientError>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
        T: Send + 'static,
    {
        debug!("executing {operation} on gateway {}", self.credentials().host);
        let result = self.run_on_worker(call(self.inner.session.clone()));
        if let Err(err) = &result {
            error!(
                "failed to execute {operation} on gateway {}: {err}",
                self.credentials().host
            );
        }
        result
    }

    fn run_on_worker<Fut, T>(&self, future: Fut) -> Result<T, ClientError>
    where
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(ClientError::ShutDown(self.credentials().host.clone()));
        }

        let pending = {
            let mut worker = self.lock_worker();
            if !worker.as_ref().is_some_and(ThreadedWorker::is_running) {
                debug!("no worker running yet, spawning one");
                *worker = Some(ThreadedWorker::spawn()?);
            }
            match worker.as_ref() {
                Some(worker) => worker.submit(future)?,
                None => return Err(ClientError::ShutDown(self.credentials().host.clone())),
            }
        };

        Ok(pending.wait(self.inner.timeout)??)
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<ThreadedWorker>> {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs the PSK handshake on a short-lived worker.
///
/// Timeouts are retried with one more second of patience per attempt.
pub fn generate_psk(
    connector: Arc<dyn GatewayConnector>,
    host: &str,
    identity: &str,
    security_code: &str,
    timeout: Duration,
) -> Result<String, ClientError> {
    let worker = ThreadedWorker::spawn()?;
    let mut last_error = None;

    for attempt in 0..PSK_ATTEMPTS {
        let connector = connector.clone();
        let (host, identity, code) = (host.to_string(), identity.to_string(), security_code.to_string());
        let patience = timeout + PSK_BACKOFF * attempt;

        let result = worker
            .submit(async move { connector.generate_psk(&host, &identity, &code).await })?
            .wait(patience);
        match result {
            Ok(Ok(psk)) => return Ok(psk),
            Ok(Err(err)) => {
                warn!("gateway refused psk generation: {err}");
                return Err(err.into());
            }
            Err(WorkerError::Timeout(elapsed)) => {
                debug!("psk generation attempt {} timed out after {elapsed:?}", attempt + 1);
                last_error = Some(WorkerError::Timeout(elapsed));
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(last_error
        .unwrap_or(WorkerError::Timeout(timeout))
        .into())
}
