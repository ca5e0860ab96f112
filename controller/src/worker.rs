//! Dedicated gateway I/O thread.
//!
//! Gateway calls are async but most callers are plain threads (HTTP
//! blocking pool, timers). The worker owns one OS thread driving a
//! current-thread tokio runtime forever; callers hand it futures and block
//! on the result with a timeout.

use std::{
    future::Future,
    sync::mpsc,
    thread::JoinHandle,
    time::Duration,
};

use thiserror::Error;
use tokio::{runtime::Handle, sync::oneshot, task::AbortHandle};
use tracing::{debug, warn};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("worker {0} is closed")]
    Closed(String),
    #[error("timed out after {0:?} waiting for the worker")]
    Timeout(Duration),
    #[error("worker task was cancelled before completing")]
    Cancelled,
}

pub struct ThreadedWorker {
    name: String,
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedWorker {
    pub fn spawn() -> Result<Self, WorkerError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("tradfri-worker-{}", &suffix[..4]);

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread_name = name.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };

                debug!("starting loop on worker thread {thread_name}");
                let _ = ready_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                debug!("loop on worker thread {thread_name} stopped");
            })
            .map_err(|err| WorkerError::Startup(err.to_string()))?;

        let handle = match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(handle)) => handle,
            Ok(Err(message)) => return Err(WorkerError::Startup(message)),
            Err(_) => {
                return Err(WorkerError::Startup(format!(
                    "{name} did not report ready within {STARTUP_TIMEOUT:?}"
                )))
            }
        };

        debug!("worker initialized with thread name {name}");
        Ok(Self {
            name,
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runtime handle for spawning directly onto the worker loop.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
            && self
                .thread
                .as_ref()
                .is_some_and(|thread| !thread.is_finished())
    }

    pub fn submit<F, T>(&self, future: F) -> Result<Pending<T>, WorkerError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_running() {
            return Err(WorkerError::Closed(self.name.clone()));
        }

        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let task = self.handle.spawn(async move {
            let _ = result_tx.send(future.await);
        });

        Ok(Pending {
            result: result_rx,
            abort: task.abort_handle(),
        })
    }

    pub fn close(&mut self) {
        let Some(stop) = self.stop.take() else {
            return;
        };

        let pending = self.handle.metrics().num_alive_tasks();
        debug!("closing worker {} with {pending} pending tasks", self.name);
        let _ = stop.send(());

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                warn!("worker {} closed from its own thread; not joining", self.name);
                return;
            }
            if thread.join().is_err() {
                warn!("worker thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for ThreadedWorker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of a future submitted to the worker.
pub struct Pending<T> {
    result: mpsc::Receiver<T>,
    abort: AbortHandle,
}

impl<T> Pending<T> {
    /// Blocks the calling thread for at most `timeout`.
    pub fn wait(self, timeout: Duration) -> Result<T, WorkerError> {
        match self.result.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.abort.abort();
                Err(WorkerError::Timeout(timeout))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WorkerError::Cancelled),
        }
    }
}
