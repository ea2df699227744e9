//! Configuration loading.
//!
//! Layers, each overriding the previous: defaults, environment, `config.json`
//! in the config directory, then the add-on options file.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::storage::write_json_atomic;

pub const AMAZON_AUTH_URL: &str = "https://www.amazon.com/ap/oa";
pub const AMAZON_TOKEN_URL: &str = "https://api.amazon.com/auth/o2/token";
pub const AMAZON_API_BASE: &str = "https://api.amazonalexa.com";

const CONFIG_FILE: &str = "config.json";

/// Which backend receives playback commands
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Alexa,
    HomeAssistant,
}

impl std::str::FromStr for BackendKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "alexa" | "amazon" => Ok(BackendKind::Alexa),
            "home_assistant" | "ha" => Ok(BackendKind::HomeAssistant),
            other => Err(BridgeError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub addon_options_path: PathBuf,

    pub backend: BackendKind,

    pub amazon_client_id: String,
    pub amazon_client_secret: String,
    pub amazon_redirect_uri: String,
    pub amazon_auth_url: String,
    pub amazon_token_url: String,
    pub amazon_api_base: String,

    pub ha_url: String,
    pub ha_token: String,
    /// Only expose media players that look like Echo devices
    pub echo_only: bool,

    pub bind_host: IpAddr,
    pub airplay_port: u16,
    pub advertise_ip: Option<IpAddr>,

    pub http_timeout_secs: u64,
    pub ack_timeout_ms: u64,
    pub read_timeout_secs: u64,
    pub device_refresh_secs: u64,
    pub token_check_secs: u64,
    /// Create virtual devices for unmatched backend records
    pub auto_register: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/data/config"),
            data_dir: PathBuf::from("/data"),
            addon_options_path: PathBuf::from("/data/options.json"),
            backend: BackendKind::Alexa,
            amazon_client_id: String::new(),
            amazon_client_secret: String::new(),
            amazon_redirect_uri: String::new(),
            amazon_auth_url: AMAZON_AUTH_URL.to_string(),
            amazon_token_url: AMAZON_TOKEN_URL.to_string(),
            amazon_api_base: AMAZON_API_BASE.to_string(),
            ha_url: "http://supervisor/core/api".to_string(),
            ha_token: String::new(),
            echo_only: true,
            bind_host: IpAddr::from([0, 0, 0, 0]),
            airplay_port: 5001,
            advertise_ip: None,
            http_timeout_secs: 10,
            ack_timeout_ms: 2000,
            read_timeout_secs: 120,
            device_refresh_secs: 30,
            token_check_secs: 60,
            auto_register: false,
        }
    }
}

/// Partial config as found in `config.json` or the add-on options
#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    backend: Option<BackendKind>,
    amazon_client_id: Option<String>,
    amazon_client_secret: Option<String>,
    amazon_redirect_uri: Option<String>,
    amazon_auth_url: Option<String>,
    amazon_token_url: Option<String>,
    amazon_api_base: Option<String>,
    ha_url: Option<String>,
    ha_token: Option<String>,
    echo_only: Option<bool>,
    bind_host: Option<IpAddr>,
    airplay_port: Option<u16>,
    advertise_ip: Option<IpAddr>,
    http_timeout_secs: Option<u64>,
    ack_timeout_ms: Option<u64>,
    read_timeout_secs: Option<u64>,
    device_refresh_secs: Option<u64>,
    token_check_secs: Option<u64>,
    auto_register: Option<bool>,
}

/// Subset written back by [`Config::save`]
#[derive(Serialize)]
struct PersistedConfig<'a> {
    backend: BackendKind,
    amazon_client_id: &'a str,
    amazon_client_secret: &'a str,
    amazon_redirect_uri: &'a str,
    airplay_port: u16,
    ha_url: &'a str,
    auto_register: bool,
}

impl Config {
    /// Resolve the full layered configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Resolve configuration with an explicit environment lookup.
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::from_env_with(env)?;
        let file = config.config_dir.join(CONFIG_FILE);
        config.apply_file(&file, false)?;
        let options = config.addon_options_path.clone();
        config.apply_file(&options, true)?;
        Ok(config)
    }

    /// Defaults overridden by environment variables
    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();
        let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("CONFIG_DIR") {
            config.config_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = var("ADDON_OPTIONS") {
            config.addon_options_path = PathBuf::from(path);
        }
        if let Some(v) = var("AMAZON_CLIENT_ID") {
            config.amazon_client_id = v;
        }
        if let Some(v) = var("AMAZON_CLIENT_SECRET") {
            config.amazon_client_secret = v;
        }
        if let Some(v) = var("AMAZON_REDIRECT_URI") {
            config.amazon_redirect_uri = v;
        }
        if let Some(v) = var("AIRPLAY_PORT") {
            config.airplay_port = v
                .parse()
                .map_err(|_| BridgeError::Config(format!("AIRPLAY_PORT is not a port: {v:?}")))?;
        }
        if let Some(v) = var("HA_URL") {
            config.ha_url = v;
        }
        if let Some(v) = var("HA_TOKEN").or_else(|| var("SUPERVISOR_TOKEN")) {
            config.ha_token = v;
        }
        if let Some(v) = var("BRIDGE_BACKEND") {
            config.backend = v.parse()?;
        }
        Ok(config)
    }

    /// Merge a JSON file into this config. A missing file is not an error.
    fn apply_file(&mut self, path: &Path, skip_empty: bool) -> Result<()> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let overrides: ConfigOverrides = serde_json::from_str(&data)
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        self.merge(overrides, skip_empty);
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(())
    }

    fn merge(&mut self, o: ConfigOverrides, skip_empty: bool) {
        let text = |target: &mut String, value: Option<String>| {
            if let Some(v) = value {
                if !(skip_empty && v.trim().is_empty()) {
                    *target = v;
                }
            }
        };
        text(&mut self.amazon_client_id, o.amazon_client_id);
        text(&mut self.amazon_client_secret, o.amazon_client_secret);
        text(&mut self.amazon_redirect_uri, o.amazon_redirect_uri);
        text(&mut self.amazon_auth_url, o.amazon_auth_url);
        text(&mut self.amazon_token_url, o.amazon_token_url);
        text(&mut self.amazon_api_base, o.amazon_api_base);
        text(&mut self.ha_url, o.ha_url);
        text(&mut self.ha_token, o.ha_token);

        if let Some(v) = o.backend {
            self.backend = v;
        }
        if let Some(v) = o.echo_only {
            self.echo_only = v;
        }
        if let Some(v) = o.bind_host {
            self.bind_host = v;
        }
        if let Some(v) = o.airplay_port {
            self.airplay_port = v;
        }
        if o.advertise_ip.is_some() {
            self.advertise_ip = o.advertise_ip;
        }
        if let Some(v) = o.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        if let Some(v) = o.ack_timeout_ms {
            self.ack_timeout_ms = v;
        }
        if let Some(v) = o.read_timeout_secs {
            self.read_timeout_secs = v;
        }
        if let Some(v) = o.device_refresh_secs {
            self.device_refresh_secs = v;
        }
        if let Some(v) = o.token_check_secs {
            self.token_check_secs = v;
        }
        if let Some(v) = o.auto_register {
            self.auto_register = v;
        }
    }

    /// Write the persisted subset to `config.json`.
    pub fn save(&self) -> Result<()> {
        let path = self.config_dir.join(CONFIG_FILE);
        let persisted = PersistedConfig {
            backend: self.backend,
            amazon_client_id: &self.amazon_client_id,
            amazon_client_secret: &self.amazon_client_secret,
            amazon_redirect_uri: &self.amazon_redirect_uri,
            airplay_port: self.airplay_port,
            ha_url: &self.ha_url,
            auto_register: self.auto_register,
        };
        write_json_atomic(&path, &persisted)?;
        tracing::info!(path = %path.display(), "saved configuration");
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn device_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.device_refresh_secs.max(1))
    }

    pub fn token_check_interval(&self) -> Duration {
        Duration::from_secs(self.token_check_secs.max(1))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "***" };
        f.debug_struct("Config")
            .field("config_dir", &self.config_dir)
            .field("data_dir", &self.data_dir)
            .field("backend", &self.backend)
            .field("amazon_client_id", &self.amazon_client_id)
            .field("amazon_client_secret", &redact(&self.amazon_client_secret))
            .field("amazon_redirect_uri", &self.amazon_redirect_uri)
            .field("amazon_api_base", &self.amazon_api_base)
            .field("ha_url", &self.ha_url)
            .field("ha_token", &redact(&self.ha_token))
            .field("bind_host", &self.bind_host)
            .field("airplay_port", &self.airplay_port)
            .field("advertise_ip", &self.advertise_ip)
            .field("auto_register", &self.auto_register)
            .finish_non_exhaustive()
    }
}
