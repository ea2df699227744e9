//! Durable snapshots of the device list and the backend tokens.
//!
//! Both files are plain JSON written atomically (temp file + rename).

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};

use crate::credentials::Credential;
use crate::error::Result;
use crate::types::VirtualDevice;

const DEVICES_FILE: &str = "devices.json";
const TOKENS_FILE: &str = "tokens.json";

/// File-backed storage for registry and credential snapshots
pub struct Storage {
    devices_path: PathBuf,
    tokens_path: PathBuf,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Devices go under `data_dir`, tokens under `config_dir`
    pub fn new(config_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            devices_path: data_dir.as_ref().join(DEVICES_FILE),
            tokens_path: config_dir.as_ref().join(TOKENS_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn devices_path(&self) -> &Path {
        &self.devices_path
    }

    pub fn tokens_path(&self) -> &Path {
        &self.tokens_path
    }

    /// Load the device list, empty when nothing was saved yet
    pub fn load_devices(&self) -> Result<Vec<VirtualDevice>> {
        Ok(read_json(&self.devices_path)?.unwrap_or_default())
    }

    pub fn save_devices(&self, devices: &[VirtualDevice]) -> Result<()> {
        self.write_json(&self.devices_path, &devices)?;
        tracing::debug!(count = devices.len(), path = %self.devices_path.display(), "saved devices");
        Ok(())
    }

    pub fn load_tokens(&self) -> Result<Option<Credential>> {
        read_json(&self.tokens_path)
    }

    pub fn save_tokens(&self, tokens: &Credential) -> Result<()> {
        self.write_json(&self.tokens_path, tokens)?;
        tracing::info!("saved OAuth tokens to disk");
        Ok(())
    }

    /// Move an unreadable device snapshot aside so the next save keeps it
    pub fn quarantine_devices(&self) -> Result<PathBuf> {
        let aside = self.devices_path.with_extension("json.corrupt");
        let _guard = self.write_lock.lock();
        std::fs::rename(&self.devices_path, &aside)?;
        Ok(aside)
    }

    /// Writes are serialized; last writer wins
    ///
    /// Blocking file I/O on the calling thread. Fine at the current mutation
    /// rate; move behind `spawn_blocking` if writes become frequent.
    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let _guard = self.write_lock.lock();
        write_json_atomic(path, value)
    }
}

/// Write `value` as pretty JSON via a temp file and rename
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(data) => Ok(Some(serde_json::from_str(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), dir.path());
        assert!(storage.load_devices().unwrap().is_empty());
        assert!(storage.load_tokens().unwrap().is_none());
    }

    #[test]
    fn snapshots_survive_a_new_storage_instance() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("config");
        let data_dir = dir.path().join("data");

        let storage = Storage::new(&config_dir, &data_dir);
        storage
            .save_devices(&[VirtualDevice::new("kitchen", "Kitchen")])
            .unwrap();
        storage
            .save_tokens(&Credential {
                access_token: "a".into(),
                refresh_token: "r".into(),
                expiry_ts: 42,
            })
            .unwrap();

        let reopened = Storage::new(&config_dir, &data_dir);
        let devices = reopened.load_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].display_name, "Kitchen");
        assert_eq!(reopened.load_tokens().unwrap().unwrap().expiry_ts, 42);
        assert!(!reopened.devices_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), dir.path());
        std::fs::write(storage.devices_path(), "not json").unwrap();
        assert!(storage.load_devices().is_err());
    }

    #[test]
    fn quarantine_moves_snapshot_aside() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), dir.path());
        std::fs::write(storage.devices_path(), "{truncated").unwrap();

        let aside = storage.quarantine_devices().unwrap();
        assert_eq!(aside, dir.path().join("devices.json.corrupt"));
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{truncated");
        assert!(!storage.devices_path().exists());
        assert!(storage.load_devices().unwrap().is_empty());
    }
}
