use crate::error::{BridgeError, Result};
use crate::types::{DeviceId, VirtualDevice};
use tokio::sync::broadcast;

/// Change notification published by the device registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A virtual device was registered
    Added(VirtualDevice),

    /// A virtual device was removed
    Removed(DeviceId),
}

/// Receiver for registry change notifications
pub struct RegistryReceiver {
    rx: broadcast::Receiver<RegistryEvent>,
}

impl RegistryReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<RegistryEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next registry event
    ///
    /// A lagged receiver yields `ChannelError`; the caller should resync
    /// from a full registry listing.
    pub async fn recv(&mut self) -> Result<RegistryEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => {
                BridgeError::ChannelError("registry closed".to_string())
            }
            broadcast::error::RecvError::Lagged(n) => {
                BridgeError::ChannelError(format!("Lagged by {} messages", n))
            }
        })
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<RegistryEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => {
                Err(BridgeError::ChannelError("registry closed".to_string()))
            }
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Err(BridgeError::ChannelError(format!("Lagged by {} messages", n)))
            }
        }
    }
}
