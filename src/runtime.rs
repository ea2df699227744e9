use crate::advertiser::{advertise_ip, ServiceAdvertiser};
use crate::config::BackendKind;
use crate::context::BridgeContext;
use crate::error::Result;
use crate::events::RegistryEvent;
use crate::registry::DeviceRegistry;
use crate::server::RtspServer;
use crate::worker::{DeviceRefreshTask, TokenRefreshTask, Worker};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Everything `serve` runs: control server, advertiser and workers
pub struct Runtime {
    ctx: Arc<BridgeContext>,
    server: RtspServer,
    advertiser: Option<Arc<ServiceAdvertiser>>,
    workers: Vec<Worker>,
    sync_stop: Option<broadcast::Sender<()>>,
    sync_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Runtime {
    /// Start serving, advertising over mDNS when the daemon can start
    pub async fn start(ctx: Arc<BridgeContext>) -> Result<Self> {
        let ip = advertise_ip(ctx.config.advertise_ip, ctx.config.bind_host);
        let advertiser = match ServiceAdvertiser::new(ip, ctx.config.airplay_port) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, receivers will not be discoverable");
                None
            }
        };
        Self::start_with(ctx, advertiser).await
    }

    /// Start serving with an explicit (or no) advertiser
    pub async fn start_with(
        ctx: Arc<BridgeContext>,
        advertiser: Option<ServiceAdvertiser>,
    ) -> Result<Self> {
        let bind = SocketAddr::new(ctx.config.bind_host, ctx.config.airplay_port);
        let server = RtspServer::bind(bind, ctx.clone()).await?;
        let advertiser = advertiser.map(Arc::new);

        let (sync_stop, sync_handle) = match &advertiser {
            Some(advertiser) => {
                let (tx, handle) = spawn_advertiser_sync(advertiser.clone(), ctx.registry.clone());
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let mut workers = vec![Worker::start(
            Arc::new(DeviceRefreshTask::new(
                ctx.backend.clone(),
                ctx.registry.clone(),
                ctx.config.auto_register,
            )),
            ctx.config.device_refresh_interval(),
        )];
        if ctx.config.backend == BackendKind::Alexa {
            workers.push(Worker::start(
                Arc::new(TokenRefreshTask::new(ctx.credentials.clone())),
                ctx.config.token_check_interval(),
            ));
        }

        tracing::info!(
            devices = ctx.registry.len(),
            addr = %server.local_addr(),
            "bridge running"
        );
        Ok(Self {
            ctx,
            server,
            advertiser,
            workers,
            sync_stop,
            sync_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn context(&self) -> &Arc<BridgeContext> {
        &self.ctx
    }

    /// Stop everything; no step is skipped because an earlier one failed
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down");

        if let Some(tx) = self.sync_stop.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.sync_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }

        if let Some(advertiser) = self.advertiser.take() {
            // mdns-sd shutdown blocks on a std channel
            if let Err(e) = tokio::task::spawn_blocking(move || advertiser.shutdown()).await {
                tracing::warn!(error = %e, "mDNS shutdown failed");
            }
        }

        for worker in &mut self.workers {
            worker.stop().await;
        }

        self.server.stop().await;
        tracing::info!("shutdown complete");
    }
}

/// Keep advertisements in step with registry changes
fn spawn_advertiser_sync(
    advertiser: Arc<ServiceAdvertiser>,
    registry: Arc<DeviceRegistry>,
) -> (broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = broadcast::channel(1);
    // subscribe before the initial publish so no change slips between them
    let mut events = registry.subscribe();
    advertiser.publish_all(&registry.list());

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                event = events.recv() => match event {
                    Ok(RegistryEvent::Added(device)) => {
                        if let Err(e) = advertiser.publish(&device) {
                            tracing::warn!(device_id = %device.id, error = %e, "failed to advertise");
                        }
                    }
                    Ok(RegistryEvent::Removed(id)) => {
                        advertiser.retract(&id);
                    }
                    // the registry outlives this task, so this is a lag
                    Err(e) => {
                        tracing::warn!(error = %e, "advertiser fell behind registry, resyncing");
                        resync(&advertiser, &registry);
                    }
                },
            }
        }
    });
    (stop_tx, handle)
}

fn resync(advertiser: &ServiceAdvertiser, registry: &DeviceRegistry) {
    let devices = registry.list();
    for id in advertiser.published() {
        if !devices.iter().any(|d| d.id == id) {
            advertiser.retract(&id);
        }
    }
    advertiser.publish_all(&devices);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::RecordingBackend;
    use crate::config::Config;
    use crate::context::test_support;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_and_shuts_down_without_mdns() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bind_host: "127.0.0.1".parse().unwrap(),
            airplay_port: 0,
            backend: BackendKind::HomeAssistant,
            ..Config::default()
        };
        let ctx = test_support::context(&dir, Arc::new(RecordingBackend::default()), config);

        let runtime = Runtime::start_with(ctx, None).await.unwrap();
        let addr = runtime.local_addr();
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("RTSP/1.0 200 OK"));

        runtime.shutdown().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
