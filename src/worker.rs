use crate::backend::PlaybackBackend;
use crate::credentials::CredentialManager;
use crate::error::{BridgeError, Result};
use crate::registry::DeviceRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Refresh the access token when it expires within this margin
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// One cycle of a periodic job
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> Result<()>;
}

/// Runs a [`PeriodicTask`] in the background until stopped
///
/// The first cycle runs immediately. After a success the worker waits the
/// regular interval; after a retryable failure it backs off exponentially
/// (1s, 2s, 4s ... 60s) instead.
pub struct Worker {
    name: &'static str,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Worker {
    pub fn start(task: Arc<dyn PeriodicTask>, interval: Duration) -> Self {
        let name = task.name();
        let (stop_tx, mut stop_rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(0);
            loop {
                let delay = tokio::select! {
                    _ = stop_rx.recv() => break,
                    result = task.run_once() => match result {
                        Ok(()) => {
                            backoff = Duration::from_secs(0);
                            interval
                        }
                        Err(e) if e.is_retryable() => {
                            if backoff == Duration::from_secs(0) {
                                backoff = Duration::from_secs(1);
                            } else {
                                backoff = (backoff * 2).min(MAX_BACKOFF);
                            }
                            tracing::warn!(task = name, error = %e, retry_in = ?backoff, "periodic task failed");
                            backoff
                        }
                        Err(e) => {
                            tracing::warn!(task = name, error = %e, "periodic task failed");
                            interval
                        }
                    },
                };

                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = sleep(delay) => {}
                }
            }
            tracing::info!(task = name, "worker stopped");
        });

        tracing::info!(task = name, interval = ?interval, "worker started");
        Self {
            name,
            stop_tx: Some(stop_tx),
            task_handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Pull the backend device list into the registry
pub struct DeviceRefreshTask {
    backend: Arc<dyn PlaybackBackend>,
    registry: Arc<DeviceRegistry>,
    auto_register: bool,
}

impl DeviceRefreshTask {
    pub fn new(
        backend: Arc<dyn PlaybackBackend>,
        registry: Arc<DeviceRegistry>,
        auto_register: bool,
    ) -> Self {
        Self {
            backend,
            registry,
            auto_register,
        }
    }
}

#[async_trait]
impl PeriodicTask for DeviceRefreshTask {
    fn name(&self) -> &'static str {
        "device refresh"
    }

    async fn run_once(&self) -> Result<()> {
        let records = self.backend.list_devices().await?;
        let bound = self.registry.apply_discovery(&records, self.auto_register);
        tracing::debug!(
            count = records.len(),
            backend = self.backend.name(),
            bound,
            "device refresh done"
        );
        Ok(())
    }
}

/// Keep the access token ahead of its expiry
pub struct TokenRefreshTask {
    credentials: Arc<CredentialManager>,
    margin: Duration,
}

impl TokenRefreshTask {
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self {
            credentials,
            margin: TOKEN_REFRESH_MARGIN,
        }
    }
}

#[async_trait]
impl PeriodicTask for TokenRefreshTask {
    fn name(&self) -> &'static str {
        "token refresh"
    }

    async fn run_once(&self) -> Result<()> {
        if !self.credentials.is_authenticated().await {
            tracing::debug!("not authenticated, nothing to refresh");
            return Ok(());
        }
        if self.credentials.refresh_if_expiring(self.margin).await {
            Ok(())
        } else {
            Err(BridgeError::BackendUnavailable(
                "token refresh failed".to_string(),
            ))
        }
    }
}
