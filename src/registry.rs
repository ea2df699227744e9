use crate::error::{BridgeError, Result};
use crate::events::{RegistryEvent, RegistryReceiver};
use crate::storage::Storage;
use crate::types::{
    BackendDeviceRecord, DeviceId, DeviceKind, PlaybackState, RemoteState, VirtualDevice,
    VolumePercent,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Canonical mapping of virtual receivers to backend entities and live state
///
/// Every mutation persists the full snapshot before returning. Each call is
/// an independent atomic unit; there is no transaction across calls.
pub struct DeviceRegistry {
    devices: Mutex<BTreeMap<DeviceId, VirtualDevice>>,
    storage: Arc<Storage>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create an empty registry backed by `storage`
    pub fn new(storage: Arc<Storage>) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            devices: Mutex::new(BTreeMap::new()),
            storage,
            events,
        }
    }

    /// Restore the registry from the persisted snapshot
    ///
    /// An unreadable snapshot is logged and the registry starts empty. A
    /// corrupt one is first moved aside so it survives the next save.
    pub fn load(storage: Arc<Storage>) -> Self {
        let registry = Self::new(storage);
        let snapshot = match registry.storage.load_devices() {
            Ok(snapshot) => snapshot,
            Err(BridgeError::Json(e)) => {
                match registry.storage.quarantine_devices() {
                    Ok(aside) => tracing::warn!(
                        error = %e,
                        moved_to = %aside.display(),
                        "corrupt device snapshot, starting empty"
                    ),
                    Err(move_err) => tracing::warn!(
                        error = %e,
                        move_error = %move_err,
                        "corrupt device snapshot, starting empty"
                    ),
                }
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read device snapshot, starting empty");
                Vec::new()
            }
        };
        {
            let mut devices = registry.devices.lock();
            for mut device in snapshot {
                device.volume = device.volume.min(100);
                if devices.contains_key(&device.id) {
                    tracing::warn!(device_id = %device.id, "duplicate device in snapshot, keeping first");
                    continue;
                }
                devices.insert(device.id.clone(), device);
            }
            tracing::info!(count = devices.len(), "restored virtual devices");
        }
        registry
    }

    /// Subscribe to add/remove notifications
    pub fn subscribe(&self) -> RegistryReceiver {
        RegistryReceiver::new(self.events.subscribe())
    }

    /// Register a device by name; returns the existing one if the id is taken
    pub fn add(&self, name: &str) -> Result<VirtualDevice> {
        self.register(name, "", DeviceKind::Device)
    }

    /// Register a device with a known backend entity
    ///
    /// Idempotent by derived id. An existing unbound device is bound to
    /// `backend_entity_id` when one is given.
    pub fn register(
        &self,
        name: &str,
        backend_entity_id: &str,
        kind: DeviceKind,
    ) -> Result<VirtualDevice> {
        let id = derive_id(name).ok_or_else(|| BridgeError::InvalidDeviceName(name.to_string()))?;

        let mut devices = self.devices.lock();
        if let Some(existing) = devices.get_mut(&id) {
            if !existing.is_bound() && !backend_entity_id.is_empty() {
                existing.backend_entity_id = backend_entity_id.to_string();
                let device = existing.clone();
                self.persist(&devices);
                return Ok(device);
            }
            return Ok(existing.clone());
        }

        let mut device = VirtualDevice::new(id.clone(), name.trim());
        device.backend_entity_id = backend_entity_id.to_string();
        device.kind = kind;
        devices.insert(id, device.clone());
        self.persist(&devices);
        drop(devices);

        tracing::info!(device_id = %device.id, display_name = %device.display_name, "registered virtual device");
        let _ = self.events.send(RegistryEvent::Added(device.clone()));
        Ok(device)
    }

    /// Remove a single device
    pub fn remove(&self, id: &str) -> bool {
        let mut devices = self.devices.lock();
        if devices.remove(id).is_none() {
            return false;
        }
        self.persist(&devices);
        drop(devices);

        tracing::info!(device_id = %id, "removed virtual device");
        let _ = self.events.send(RegistryEvent::Removed(id.to_string()));
        true
    }

    /// Remove every device and return how many were removed
    pub fn remove_all(&self) -> usize {
        let mut devices = self.devices.lock();
        let removed: Vec<DeviceId> = std::mem::take(&mut *devices).into_keys().collect();
        self.persist(&devices);
        drop(devices);

        for id in &removed {
            let _ = self.events.send(RegistryEvent::Removed(id.clone()));
        }
        tracing::info!(count = removed.len(), "removed all virtual devices");
        removed.len()
    }

    pub fn get(&self, id: &str) -> Option<VirtualDevice> {
        self.devices.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<VirtualDevice> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn set_playback_state(&self, id: &str, state: PlaybackState) -> bool {
        self.mutate(id, |d| d.playback_state = state)
    }

    /// Out-of-range volumes are clamped to 0..=100
    pub fn set_volume(&self, id: &str, volume: i64) -> bool {
        let volume = clamp_volume(volume);
        self.mutate(id, |d| d.volume = volume)
    }

    pub fn set_metadata(&self, id: &str, track: Option<String>, artist: Option<String>) -> bool {
        self.mutate(id, |d| {
            d.current_track = track;
            d.current_artist = artist;
        })
    }

    pub fn bind_entity(&self, id: &str, backend_entity_id: &str) -> bool {
        self.mutate(id, |d| d.backend_entity_id = backend_entity_id.to_string())
    }

    /// Resolve a control-session target URI to a registered device
    ///
    /// Path segments are tried last-first as id, derived id, or display name.
    /// When nothing matches and exactly one device exists, that one is used.
    pub fn resolve_target(&self, target: &str) -> Option<DeviceId> {
        let devices = self.devices.lock();
        let path = target
            .split_once("://")
            .map(|(_, rest)| rest.split_once('/').map(|(_, p)| p).unwrap_or(""))
            .unwrap_or(target);
        let path = path.split(['?', '#']).next().unwrap_or("");

        for segment in path.split('/').rev().filter(|s| !s.is_empty() && *s != "*") {
            let segment = urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| segment.to_string());
            if devices.contains_key(&segment) {
                return Some(segment);
            }
            if let Some(id) = derive_id(&segment).filter(|id| devices.contains_key(id)) {
                return Some(id);
            }
            if let Some(device) = devices
                .values()
                .find(|d| d.display_name.eq_ignore_ascii_case(&segment))
            {
                return Some(device.id.clone());
            }
        }

        if devices.len() == 1 {
            return devices.keys().next().cloned();
        }
        None
    }

    /// Bind and refresh devices from a backend device listing
    ///
    /// Returns how many devices were newly bound or created.
    pub fn apply_discovery(&self, records: &[BackendDeviceRecord], auto_register: bool) -> usize {
        let mut devices = self.devices.lock();
        let mut changed = false;
        let mut bound = 0;
        let mut added = Vec::new();

        for record in records {
            let derived = derive_id(&record.name);

            if let Some(device) = devices
                .values_mut()
                .find(|d| d.backend_entity_id == record.id)
            {
                changed |= apply_remote_state(device, record.state.as_ref());
                continue;
            }

            if let Some(device) = devices.values_mut().find(|d| {
                !d.is_bound()
                    && (d.display_name.eq_ignore_ascii_case(record.name.trim())
                        || derived.as_deref() == Some(d.id.as_str()))
            }) {
                tracing::info!(device_id = %device.id, entity = %record.id, "bound virtual device to backend entity");
                device.backend_entity_id = record.id.clone();
                apply_remote_state(device, record.state.as_ref());
                changed = true;
                bound += 1;
                continue;
            }

            if !auto_register {
                continue;
            }
            let Some(id) = derived.or_else(|| derive_id(&record.id)) else {
                continue;
            };
            if devices.contains_key(&id) {
                tracing::debug!(device_id = %id, entity = %record.id, "id already bound elsewhere, skipping");
                continue;
            }
            let mut device = VirtualDevice::new(id.clone(), record.name.trim());
            device.backend_entity_id = record.id.clone();
            device.kind = record.kind();
            apply_remote_state(&mut device, record.state.as_ref());
            devices.insert(id, device.clone());
            added.push(device);
            changed = true;
            bound += 1;
        }

        if changed {
            self.persist(&devices);
        }
        drop(devices);

        for device in added {
            tracing::info!(device_id = %device.id, "auto-registered virtual device");
            let _ = self.events.send(RegistryEvent::Added(device));
        }
        bound
    }

    fn mutate(&self, id: &str, f: impl FnOnce(&mut VirtualDevice)) -> bool {
        let mut devices = self.devices.lock();
        let Some(device) = devices.get_mut(id) else {
            tracing::debug!(device_id = %id, "unknown device, mutation skipped");
            return false;
        };
        f(device);
        self.persist(&devices);
        true
    }

    /// Called with the lock held so snapshots are written in mutation order.
    /// The write is synchronous; see [`Storage`] for the blocking caveat.
    fn persist(&self, devices: &BTreeMap<DeviceId, VirtualDevice>) {
        let snapshot: Vec<VirtualDevice> = devices.values().cloned().collect();
        if let Err(e) = self.storage.save_devices(&snapshot) {
            tracing::error!(error = %e, "failed to persist device registry");
        }
    }
}

fn apply_remote_state(device: &mut VirtualDevice, state: Option<&RemoteState>) -> bool {
    let Some(state) = state else {
        return false;
    };
    let before = device.clone();
    device.playback_state = state.playback_state;
    if let Some(volume) = state.volume {
        device.volume = volume.min(100);
    }
    device.current_track = state.track.clone();
    device.current_artist = state.artist.clone();
    *device != before
}

/// Clamp an arbitrary integer into the 0..=100 volume range
pub fn clamp_volume(volume: i64) -> VolumePercent {
    volume.clamp(0, 100) as VolumePercent
}

/// Stable id for a display name: lowercase alphanumerics joined by `-`
pub fn derive_id(name: &str) -> Option<DeviceId> {
    let mut id = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            id.extend(c.to_lowercase());
        } else if !id.is_empty() && !id.ends_with('-') {
            id.push('-');
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, DeviceRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path(), dir.path()));
        (dir, DeviceRegistry::new(storage))
    }

    fn record(id: &str, name: &str) -> BackendDeviceRecord {
        BackendDeviceRecord {
            id: id.into(),
            name: name.into(),
            device_type: "ECHO".into(),
            source_endpoint: "/v1/devices".into(),
            state: None,
        }
    }

    #[test]
    fn derive_id_normalizes_names() {
        assert_eq!(derive_id("Kitchen Echo").as_deref(), Some("kitchen-echo"));
        assert_eq!(derive_id("  Living  Room!! ").as_deref(), Some("living-room"));
        assert_eq!(derive_id("--"), None);
        assert_eq!(derive_id(""), None);
    }

    #[test]
    fn set_volume_always_clamps() {
        let (_dir, registry) = registry();
        let device = registry.add("Kitchen").unwrap();
        for (input, expected) in [(-5, 0), (0, 0), (42, 42), (100, 100), (250, 100), (i64::MIN, 0), (i64::MAX, 100)] {
            assert!(registry.set_volume(&device.id, input));
            assert_eq!(registry.get(&device.id).unwrap().volume, expected);
        }
    }

    #[test]
    fn add_is_idempotent() {
        let (_dir, registry) = registry();
        let first = registry.add("Kitchen Echo").unwrap();
        let second = registry.add("kitchen echo").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn add_rejects_blank_names() {
        let (_dir, registry) = registry();
        assert!(matches!(
            registry.add("   "),
            Err(BridgeError::InvalidDeviceName(_))
        ));
    }

    #[test]
    fn remove_all_reports_exact_count() {
        let (_dir, registry) = registry();
        registry.add("One").unwrap();
        registry.add("Two").unwrap();
        registry.add("Three").unwrap();

        assert_eq!(registry.remove_all(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.remove_all(), 0);
    }

    #[test]
    fn setters_report_unknown_ids() {
        let (_dir, registry) = registry();
        assert!(!registry.set_volume("ghost", 10));
        assert!(!registry.set_playback_state("ghost", PlaybackState::Playing));
        assert!(!registry.set_metadata("ghost", None, None));
        assert!(!registry.remove("ghost"));
    }

    #[test]
    fn mutations_are_persisted_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path(), dir.path()));
        let registry = DeviceRegistry::new(storage.clone());
        let device = registry.add("Office").unwrap();
        registry.set_metadata(&device.id, Some("Song".into()), Some("Band".into()));

        let restored = DeviceRegistry::load(storage);
        let office = restored.get("office").unwrap();
        assert_eq!(office.current_track.as_deref(), Some("Song"));
        assert_eq!(office.current_artist.as_deref(), Some("Band"));
    }

    #[test]
    fn corrupt_snapshot_starts_empty_and_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path(), dir.path()));
        std::fs::write(storage.devices_path(), "{truncated").unwrap();

        let registry = DeviceRegistry::load(storage.clone());
        assert!(registry.is_empty());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("devices.json.corrupt")).unwrap(),
            "{truncated"
        );

        registry.add("Den").unwrap();
        assert_eq!(DeviceRegistry::load(storage).len(), 1);
        assert!(dir.path().join("devices.json.corrupt").exists());
    }

    #[test]
    fn resolve_target_matches_path_segments() {
        let (_dir, registry) = registry();
        registry.add("Kitchen").unwrap();
        registry.add("Living Room").unwrap();

        assert_eq!(registry.resolve_target("rtsp://10.0.0.2/kitchen").as_deref(), Some("kitchen"));
        assert_eq!(
            registry.resolve_target("rtsp://10.0.0.2:5001/Living%20Room/stream?x=1").as_deref(),
            Some("living-room")
        );
        assert_eq!(registry.resolve_target("rtsp://10.0.0.2/12345"), None);
    }

    #[test]
    fn resolve_target_falls_back_to_single_device() {
        let (_dir, registry) = registry();
        assert_eq!(registry.resolve_target("*"), None);
        registry.add("Kitchen").unwrap();
        assert_eq!(registry.resolve_target("rtsp://10.0.0.2/98765").as_deref(), Some("kitchen"));
    }

    #[test]
    fn discovery_binds_by_name_and_applies_state() {
        let (_dir, registry) = registry();
        registry.add("Kitchen").unwrap();

        let mut kitchen = record("amzn-1", "kitchen");
        kitchen.state = Some(RemoteState {
            playback_state: PlaybackState::Playing,
            volume: Some(30),
            track: Some("Song".into()),
            artist: None,
        });
        let bound = registry.apply_discovery(&[kitchen, record("amzn-2", "Bedroom")], false);

        assert_eq!(bound, 1);
        assert_eq!(registry.len(), 1);
        let device = registry.get("kitchen").unwrap();
        assert_eq!(device.backend_entity_id, "amzn-1");
        assert_eq!(device.playback_state, PlaybackState::Playing);
        assert_eq!(device.volume, 30);
    }

    #[test]
    fn discovery_auto_registers_unmatched_records() {
        let (_dir, registry) = registry();
        let mut events = registry.subscribe();
        let mut group = record("G1", "Everywhere");
        group.device_type = "WHA".into();

        assert_eq!(registry.apply_discovery(&[group.clone()], true), 1);
        assert_eq!(registry.apply_discovery(&[group], true), 0);

        let device = registry.get("everywhere").unwrap();
        assert_eq!(device.kind, DeviceKind::Group);
        assert!(matches!(events.try_recv().unwrap(), Some(RegistryEvent::Added(d)) if d.id == "everywhere"));
        assert!(events.try_recv().unwrap().is_none());
    }
}
