use crate::context::BridgeContext;
use crate::error::Result;
use crate::session::handle_connection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// TCP listener for control connections
///
/// Every accepted connection gets its own task. Stopping the server stops
/// accepting; sessions already running finish on their own.
pub struct RtspServer {
    local_addr: SocketAddr,
    stop_tx: Option<broadcast::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RtspServer {
    /// Bind `addr` and start accepting
    pub async fn bind(addr: SocketAddr, ctx: Arc<BridgeContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "control server listening");

        let (stop_tx, mut stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => {
                        tracing::info!("control server stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "control connection accepted");
                            let _ = stream.set_nodelay(true);
                            tokio::spawn(handle_connection(stream, peer.to_string(), ctx.clone()));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    },
                }
            }
        });

        Ok(Self {
            local_addr,
            stop_tx: Some(stop_tx),
            task_handle: Some(handle),
        })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_millis(500), handle).await;
        }
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::RecordingBackend;
    use crate::config::Config;
    use crate::context::test_support;
    use crate::types::{DeviceKind, Verb};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_sessions_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(RecordingBackend::default());
        let ctx = test_support::context(&dir, backend.clone(), Config::default());
        ctx.registry.register("Kitchen", "amzn-1", DeviceKind::Device).unwrap();

        let mut server = RtspServer::bind("127.0.0.1:0".parse().unwrap(), ctx).await.unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();
        stream
            .write_all(
                b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n\
                  SETUP rtsp://127.0.0.1/kitchen RTSP/1.0\r\nCSeq: 2\r\n\r\n\
                  PLAY rtsp://127.0.0.1/kitchen RTSP/1.0\r\nCSeq: 3\r\n\r\n\
                  TEARDOWN rtsp://127.0.0.1/kitchen RTSP/1.0\r\nCSeq: 4\r\n\r\n",
            )
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();

        assert_eq!(out.matches("RTSP/1.0 200 OK").count(), 4);
        assert!(out.contains("Public: OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN"));
        assert_eq!(
            backend.calls(),
            vec![("amzn-1".to_string(), Verb::Play), ("amzn-1".to_string(), Verb::Stop)]
        );

        server.stop().await;
        assert!(TcpStream::connect(server.local_addr()).await.is_err());
    }
}
