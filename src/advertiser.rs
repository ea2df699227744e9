//! mDNS advertisement of virtual receivers.
//!
//! One `_airplay._tcp` record per virtual device, all pointing at the shared
//! control port.

use crate::error::Result;
use crate::types::{DeviceId, VirtualDevice};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

pub const SERVICE_TYPE: &str = "_airplay._tcp.local.";

/// Handle on the mDNS daemon and the records it currently announces
pub struct ServiceAdvertiser {
    daemon: ServiceDaemon,
    host: String,
    ip: IpAddr,
    port: u16,
    /// device id -> registered full name
    published: Mutex<HashMap<DeviceId, String>>,
}

impl ServiceAdvertiser {
    /// Start the mDNS daemon; records will point at `ip:port`
    pub fn new(ip: IpAddr, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let host_base = gethostname::gethostname().to_string_lossy().to_string();
        let host = if host_base.ends_with(".local.") {
            host_base
        } else {
            format!("{host_base}.local.")
        };
        tracing::info!(host = %host, ip = %ip, port, "mdns: daemon started");
        Ok(Self {
            daemon,
            host,
            ip,
            port,
            published: Mutex::new(HashMap::new()),
        })
    }

    /// Announce one device, replacing an earlier record for the same id
    pub fn publish(&self, device: &VirtualDevice) -> Result<()> {
        self.retract(&device.id);

        let instance = instance_name(device);
        let info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &self.host,
            self.ip,
            self.port,
            txt_properties(device),
        )?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info)?;
        tracing::info!(device_id = %device.id, instance = %instance, "mdns: advertised receiver");
        self.published.lock().insert(device.id.clone(), fullname);
        Ok(())
    }

    /// Announce every device; a failure is logged and skipped
    pub fn publish_all(&self, devices: &[VirtualDevice]) -> usize {
        let mut ok = 0;
        for device in devices {
            match self.publish(device) {
                Ok(()) => ok += 1,
                Err(e) => {
                    tracing::warn!(device_id = %device.id, error = %e, "mdns: publish failed")
                }
            }
        }
        tracing::info!(advertised = ok, total = devices.len(), "mdns: advertising receivers");
        ok
    }

    /// Withdraw one device's record
    pub fn retract(&self, id: &str) -> bool {
        let Some(fullname) = self.published.lock().remove(id) else {
            return false;
        };
        match self.daemon.unregister(&fullname) {
            Ok(_) => {
                tracing::info!(device_id = %id, "mdns: retracted receiver");
                true
            }
            Err(e) => {
                tracing::warn!(device_id = %id, error = %e, "mdns: unregister failed");
                false
            }
        }
    }

    /// Withdraw every record, each attempt independent of the others
    pub fn retract_all(&self) -> usize {
        let ids: Vec<DeviceId> = self.published.lock().keys().cloned().collect();
        ids.iter().filter(|id| self.retract(id)).count()
    }

    /// Ids currently announced
    pub fn published(&self) -> Vec<DeviceId> {
        let mut ids: Vec<DeviceId> = self.published.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Retract everything and stop the daemon
    pub fn shutdown(&self) {
        let retracted = self.retract_all();
        tracing::info!(count = retracted, "mdns: retracted receivers");
        if let Ok(rx) = self.daemon.shutdown() {
            let _ = rx.recv_timeout(Duration::from_secs(1));
        }
    }
}

/// `<sanitized name>_<last 4 chars of id>`
pub fn instance_name(device: &VirtualDevice) -> String {
    let name: String = device
        .display_name
        .trim()
        .chars()
        .filter_map(|c| match c {
            ' ' => Some('_'),
            c if c.is_alphanumeric() || c == '_' || c == '-' => Some(c),
            _ => None,
        })
        .collect();
    let chars: Vec<char> = device.id.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("{}_{}", name, suffix)
}

/// Fixed receiver capability record plus the device id
pub fn txt_properties(device: &VirtualDevice) -> HashMap<String, String> {
    [
        ("deviceid", device.id.as_str()),
        ("model", "AppleTV3,1"),
        ("features", "0x5A7FFFF7"),
        ("flags", "0x4"),
        ("password", "false"),
        ("srcvers", "220.68"),
        ("vv", "2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Address to put in the records: configured, else bound, else route-derived
pub fn advertise_ip(configured: Option<IpAddr>, bind: IpAddr) -> IpAddr {
    configured
        .or_else(|| (!bind.is_unspecified()).then_some(bind))
        .or_else(local_ip)
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Best-effort local IP of the default route
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    if socket.connect("8.8.8.8:80").is_err() && socket.connect("1.1.1.1:80").is_err() {
        return None;
    }
    socket.local_addr().ok().map(|addr| addr.ip())
}
