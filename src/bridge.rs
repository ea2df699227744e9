use crate::backend::PlaybackBackend;
use crate::error::{BridgeError, Result};
use crate::registry::DeviceRegistry;
use crate::types::Verb;
use std::sync::Arc;
use std::time::Duration;

/// Result of relaying one verb
#[derive(Debug)]
pub enum CommandOutcome {
    /// Backend accepted the command
    Acknowledged,
    /// Backend call was not possible or failed
    Failed(BridgeError),
}

impl CommandOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, CommandOutcome::Acknowledged)
    }
}

/// Translates control verbs on a virtual device into backend calls
///
/// Backend failures never escape as errors; they come back as
/// [`CommandOutcome::Failed`] so the protocol layer can always answer.
pub struct CommandBridge {
    registry: Arc<DeviceRegistry>,
    backend: Arc<dyn PlaybackBackend>,
    call_timeout: Duration,
    auto_register: bool,
}

impl CommandBridge {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        backend: Arc<dyn PlaybackBackend>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backend,
            call_timeout,
            auto_register: false,
        }
    }

    /// Allow the one-shot discovery refresh to create devices
    pub fn with_auto_register(mut self, auto_register: bool) -> Self {
        self.auto_register = auto_register;
        self
    }

    pub fn backend(&self) -> &Arc<dyn PlaybackBackend> {
        &self.backend
    }

    /// Relay `verb` to the backend entity bound to `device_id`
    pub async fn dispatch(&self, device_id: &str, verb: Verb) -> CommandOutcome {
        match self.try_dispatch(device_id, verb).await {
            Ok(()) => {
                tracing::info!(verb = verb.as_str(), device_id = %device_id, "command acknowledged");
                CommandOutcome::Acknowledged
            }
            Err(e) => {
                tracing::warn!(verb = verb.as_str(), device_id = %device_id, error = %e, "command failed");
                CommandOutcome::Failed(e)
            }
        }
    }

    async fn try_dispatch(&self, device_id: &str, verb: Verb) -> Result<()> {
        let entity = self.resolve_entity(device_id).await?;

        match tokio::time::timeout(self.call_timeout, self.backend.execute(&entity, &verb)).await {
            Ok(result) => result?,
            Err(_) => return Err(BridgeError::Timeout),
        }

        if let Some(state) = verb.resulting_state() {
            self.registry.set_playback_state(device_id, state);
        }
        if let Verb::SetVolume(volume) = verb {
            self.registry.set_volume(device_id, i64::from(volume));
        }
        Ok(())
    }

    /// Backend entity for a device, with one discovery refresh when unbound
    async fn resolve_entity(&self, device_id: &str) -> Result<String> {
        let device = self
            .registry
            .get(device_id)
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))?;
        if device.is_bound() {
            return Ok(device.backend_entity_id);
        }

        tracing::info!(device_id = %device_id, "device unbound, refreshing discovery");
        let records = tokio::time::timeout(self.call_timeout, self.backend.list_devices())
            .await
            .map_err(|_| BridgeError::Timeout)??;
        self.registry.apply_discovery(&records, self.auto_register);

        self.registry
            .get(device_id)
            .filter(|d| d.is_bound())
            .map(|d| d.backend_entity_id)
            .ok_or_else(|| BridgeError::UnknownDevice(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::RecordingBackend;
    use crate::storage::Storage;
    use crate::types::{BackendDeviceRecord, DeviceKind, PlaybackState};

    fn setup(backend: RecordingBackend) -> (tempfile::TempDir, Arc<DeviceRegistry>, Arc<RecordingBackend>, CommandBridge) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DeviceRegistry::new(Arc::new(Storage::new(dir.path(), dir.path()))));
        let backend = Arc::new(backend);
        let bridge = CommandBridge::new(registry.clone(), backend.clone(), Duration::from_millis(200));
        (dir, registry, backend, bridge)
    }

    #[tokio::test]
    async fn bound_device_relays_and_updates_state() {
        let (_dir, registry, backend, bridge) = setup(RecordingBackend::default());
        registry.register("Kitchen", "amzn-1", DeviceKind::Device).unwrap();

        assert!(bridge.dispatch("kitchen", Verb::Play).await.is_ack());
        assert!(bridge.dispatch("kitchen", Verb::SetVolume(70)).await.is_ack());

        assert_eq!(
            backend.calls(),
            vec![("amzn-1".to_string(), Verb::Play), ("amzn-1".to_string(), Verb::SetVolume(70))]
        );
        let device = registry.get("kitchen").unwrap();
        assert_eq!(device.playback_state, PlaybackState::Playing);
        assert_eq!(device.volume, 70);
    }

    #[tokio::test]
    async fn unbound_device_triggers_one_discovery_refresh() {
        let backend = RecordingBackend::default();
        backend.devices.lock().push(BackendDeviceRecord {
            id: "amzn-9".into(),
            name: "Office".into(),
            device_type: "ECHO".into(),
            source_endpoint: "/v1/devices".into(),
            state: None,
        });
        let (_dir, registry, backend, bridge) = setup(backend);
        registry.add("Office").unwrap();

        assert!(bridge.dispatch("office", Verb::Pause).await.is_ack());
        assert_eq!(backend.calls(), vec![("amzn-9".to_string(), Verb::Pause)]);
        assert_eq!(registry.get("office").unwrap().backend_entity_id, "amzn-9");
    }

    #[tokio::test]
    async fn unresolvable_device_fails_without_backend_call() {
        let (_dir, registry, backend, bridge) = setup(RecordingBackend::default());
        registry.add("Attic").unwrap();

        assert!(matches!(
            bridge.dispatch("attic", Verb::Play).await,
            CommandOutcome::Failed(BridgeError::UnknownDevice(_))
        ));
        assert!(matches!(
            bridge.dispatch("ghost", Verb::Play).await,
            CommandOutcome::Failed(BridgeError::UnknownDevice(_))
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn backend_failure_leaves_state_untouched() {
        let backend = RecordingBackend::default();
        *backend.fail_with.lock() = Some(|| BridgeError::Unauthenticated);
        let (_dir, registry, _backend, bridge) = setup(backend);
        registry.register("Kitchen", "amzn-1", DeviceKind::Device).unwrap();

        assert!(matches!(
            bridge.dispatch("kitchen", Verb::Play).await,
            CommandOutcome::Failed(BridgeError::Unauthenticated)
        ));
        assert_eq!(registry.get("kitchen").unwrap().playback_state, PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let (_dir, registry, _backend, bridge) = setup(RecordingBackend {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        });
        registry.register("Kitchen", "amzn-1", DeviceKind::Device).unwrap();

        assert!(matches!(
            bridge.dispatch("kitchen", Verb::Stop).await,
            CommandOutcome::Failed(BridgeError::Timeout)
        ));
    }
}
